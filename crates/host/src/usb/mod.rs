//! USB subsystem
//!
//! Tracks receiver devices as they are plugged in and removed:
//! - `bridge`: dedicated thread turning OS hotplug notifications into callbacks
//! - `source`: libusb-backed notification and enumeration facilities
//! - `classes`: interface class → driver kind table
//! - `registry`: path-keyed owner of active device objects
//! - `manager`: coordinator wiring the bridge, initial scan, and registry
//! - `device`: driver contract and the built-in receiver drivers

pub mod bridge;
pub mod classes;
pub mod device;
pub mod manager;
pub mod registry;
pub mod source;

pub use bridge::{EventSource, HotplugHandler, NotificationBridge};
pub use classes::{ClassDefinition, ClassTable, DeviceKind, TypeConfig};
pub use device::{Device, DeviceFactory, DeviceSpec, ReceiverFactory};
pub use manager::{DeviceEnumerator, DeviceManager};
pub use source::{UsbEnumerator, UsbEventSource};
