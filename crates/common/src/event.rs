//! Hotplug events delivered by the notification bridge

use crate::ClassId;
use std::fmt;

/// Kind of hotplug notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Device interface appeared
    Arrival,
    /// Device interface went away
    Removal,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Arrival => f.write_str("arrival"),
            EventKind::Removal => f.write_str("removal"),
        }
    }
}

/// A single arrival/removal notification
///
/// `path` is the raw device path as reported by the OS facility; it is
/// normalized by the receiver, not by the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub kind: EventKind,
    pub class_id: ClassId,
    pub path: String,
}

impl DeviceEvent {
    pub fn arrival(class_id: ClassId, path: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Arrival,
            class_id,
            path: path.into(),
        }
    }

    pub fn removal(class_id: ClassId, path: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Removal,
            class_id,
            path: path.into(),
        }
    }
}
