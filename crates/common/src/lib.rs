//! Common types for receiver-host
//!
//! Identifiers, hotplug event types, error handling, and logging setup
//! shared by the host crate and its tests.

pub mod class_id;
pub mod device_path;
pub mod error;
pub mod event;
pub mod logging;

pub use class_id::ClassId;
pub use device_path::DevicePathKey;
pub use error::{Error, Result};
pub use event::{DeviceEvent, EventKind};
pub use logging::setup_logging;
