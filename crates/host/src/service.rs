//! Systemd service integration
//!
//! Speaks the sd-notify datagram protocol so a `Type=notify` unit knows when
//! the host has finished starting and when it begins shutting down. Every
//! call is a no-op when `NOTIFY_SOCKET` is not set.

use anyhow::{Context, Result};
use std::env;
use std::os::unix::net::UnixDatagram;
use tracing::{debug, info};

fn send(socket_path: &str, message: &str) -> Result<()> {
    let socket = UnixDatagram::unbound().context("Failed to create Unix socket")?;
    socket
        .send_to(message.as_bytes(), socket_path)
        .with_context(|| format!("Failed to send {} notification to systemd", message))?;
    Ok(())
}

fn notify(message: &str) -> Result<bool> {
    let Ok(socket_path) = env::var("NOTIFY_SOCKET") else {
        debug!("NOTIFY_SOCKET not set, skipping systemd notification");
        return Ok(false);
    };
    send(&socket_path, message)?;
    Ok(true)
}

/// Notify systemd that startup has completed
pub fn notify_ready() -> Result<()> {
    if notify("READY=1")? {
        info!("Notified systemd: host ready");
    }
    Ok(())
}

/// Notify systemd that the shutdown sequence has begun
pub fn notify_stopping() -> Result<()> {
    if notify("STOPPING=1")? {
        info!("Notified systemd: host stopping");
    }
    Ok(())
}

/// Status line shown by `systemctl status`
pub fn notify_status(status: &str) -> Result<()> {
    if notify(&format!("STATUS={}", status))? {
        debug!("Notified systemd: status = {}", status);
    }
    Ok(())
}

pub fn is_systemd() -> bool {
    env::var("NOTIFY_SOCKET").is_ok()
}
