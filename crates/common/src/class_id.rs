//! Device interface class identifiers
//!
//! A [`ClassId`] is the 128-bit value the notification and enumeration
//! facilities key on. It is written in the usual GUID text form,
//! `{XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX}`, braces optional on input.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Low 96 bits shared by every identifier synthesized from a USB vendor/product pair.
const USB_ID_NAMESPACE: u128 = 0x0000_0000_7573_6264_8000_0000_0000_0000;
const USB_ID_NAMESPACE_MASK: u128 = (1u128 << 96) - 1;

/// Interface class identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassId(Uuid);

impl ClassId {
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub const fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Identifier for a USB vendor/product pair
    ///
    /// libusb has no notion of interface classes, so the USB backend keys
    /// devices on a stable identifier derived from their vendor and product
    /// IDs. The high 32 bits hold `VID << 16 | PID`.
    pub const fn from_usb_ids(vendor_id: u16, product_id: u16) -> Self {
        let high = ((vendor_id as u128) << 16) | product_id as u128;
        Self::from_u128((high << 96) | USB_ID_NAMESPACE)
    }

    /// Vendor/product pair, if this identifier was derived from one
    pub fn usb_ids(&self) -> Option<(u16, u16)> {
        let value = self.as_u128();
        if value & USB_ID_NAMESPACE_MASK != USB_ID_NAMESPACE {
            return None;
        }
        let high = (value >> 96) as u32;
        Some(((high >> 16) as u16, high as u16))
    }
}

impl From<Uuid> for ClassId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.0.braced())
    }
}

impl FromStr for ClassId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| crate::Error::InvalidClassId(format!("{}: {}", s, e)))
    }
}
