//! Device class definitions
//!
//! Maps interface class identifiers to the driver kind that serves them and
//! the driver-specific configuration passed through to the factory.

use common::ClassId;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

/// Driver-specific configuration, passed to the factory untouched
pub type TypeConfig = toml::Table;

/// Closed set of receiver driver kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// PX4 family tuners (PX-W3U4, PX-Q3U4, PX-W3PE4, PX-Q3PE4)
    Px4,
    /// PX-MLT family multi-tuners (PX-MLT5PE, PX-MLT8PE)
    PxMlt,
}

impl DeviceKind {
    /// Parse a configuration tag, case-insensitively
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "px4" => Some(DeviceKind::Px4),
            "pxmlt" | "px-mlt" => Some(DeviceKind::PxMlt),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            DeviceKind::Px4 => "px4",
            DeviceKind::PxMlt => "pxmlt",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// One recognized interface class
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDefinition {
    pub class_id: ClassId,
    pub kind: DeviceKind,
    pub config: TypeConfig,
}

impl ClassDefinition {
    pub fn new(class_id: ClassId, kind: DeviceKind) -> Self {
        Self {
            class_id,
            kind,
            config: TypeConfig::new(),
        }
    }

    pub fn with_config(mut self, config: TypeConfig) -> Self {
        self.config = config;
        self
    }
}

/// Immutable class table, built once at startup
#[derive(Debug, Clone, Default)]
pub struct ClassTable {
    classes: HashMap<ClassId, ClassDefinition>,
}

impl ClassTable {
    /// Build the table
    ///
    /// A class identifier listed more than once keeps its last definition.
    pub fn from_definitions(definitions: impl IntoIterator<Item = ClassDefinition>) -> Self {
        let mut classes = HashMap::new();

        for definition in definitions {
            let class_id = definition.class_id;
            let kind = definition.kind;
            if let Some(previous) = classes.insert(class_id, definition) {
                warn!(
                    "Duplicate class {}: {} definition replaced by {}",
                    class_id, previous.kind, kind
                );
            }
        }

        debug!("Loaded {} device class definitions", classes.len());
        Self { classes }
    }

    pub fn get(&self, class_id: &ClassId) -> Option<&ClassDefinition> {
        self.classes.get(class_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassDefinition> {
        self.classes.values()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}
