//! receiver-host library
//!
//! Tracks removable USB receivers as they come and go and keeps one driver
//! object per device alive for as long as the host runs. The binary in
//! `main.rs` wires these modules to libusb and TCP listeners; tests drive
//! them through `test_utils`, built with the `test-utils` feature.

pub mod config;
pub mod instance;
pub mod server;
pub mod service;
pub mod supervisor;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod usb;

pub use config::HostConfig;
pub use supervisor::{HostParts, HostSupervisor, SupervisorSettings, SupervisorState};
