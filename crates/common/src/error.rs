//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("USB error: {0}")]
    Usb(String),

    #[error("Notification sink installation failed: {0}")]
    SinkInstall(String),

    #[error("Notification bridge error: {0}")]
    Bridge(String),

    #[error("Device enumeration failed: {0}")]
    Enumeration(String),

    #[error("Device initialization failed: {0}")]
    DeviceInit(String),

    #[error("Instance lock error: {0}")]
    InstanceLock(String),

    #[error("Startup signal error: {0}")]
    StartupSignal(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Invalid class identifier: {0}")]
    InvalidClassId(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
