//! Normalized device path keys

use std::borrow::Borrow;
use std::fmt;

/// Case-folded device path
///
/// The same device interface may be reported with different letter casing
/// by the notification and enumeration facilities. Every registry
/// operation goes through this key so those reports compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePathKey(String);

impl DevicePathKey {
    pub fn new(raw: &str) -> Self {
        Self(raw.to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DevicePathKey {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for DevicePathKey {
    fn from(raw: String) -> Self {
        Self::new(&raw)
    }
}

impl AsRef<str> for DevicePathKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for DevicePathKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DevicePathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
