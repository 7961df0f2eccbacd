//! receiver-host
//!
//! Background host for PX4 / PX-MLT USB receivers. Keeps a driver object
//! alive for every plugged-in receiver, serves clients over the control and
//! streaming listeners, and exits once no client has been connected for a
//! while.

use anyhow::{Context, Result, bail};
use clap::Parser;
use common::setup_logging;
use host::config::{self, HostConfig};
use host::instance::StartupSignal;
use host::server::ListenerServer;
use host::service;
use host::usb::{ClassTable, DeviceEnumerator, ReceiverFactory, UsbEnumerator, UsbEventSource};
use host::{HostParts, HostSupervisor};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "receiver-host")]
#[command(author, version, about = "USB receiver host - hotplug tracking and device serving")]
#[command(long_about = "
Tracks PX4 / PX-MLT USB receivers as they are plugged in and removed, and
keeps one driver per device available to clients of the control and
streaming servers. Only one host runs per machine; a second start exits
immediately with success.

EXAMPLES:
    # Run with default config
    receiver-host

    # Run with custom config
    receiver-host --config /path/to/host.toml

    # List present receivers without starting the host
    receiver-host --list-devices

    # Wait up to 10 seconds for a running host to finish starting
    receiver-host --wait-ready 10

CONFIGURATION:
    The host looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/receiver-host/host.toml
    3. /etc/receiver-host/host.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List present receivers per class and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Wait for a running host to signal startup, then exit
    #[arg(long, value_name = "SECS")]
    wait_ready: Option<u64>,

    /// Keep running while no clients are connected
    #[arg(long)]
    no_idle_shutdown: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = HostConfig::default();
        let path = HostConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        HostConfig::load(Some(config::expand_path(path))).context("Failed to load configuration")?
    } else {
        HostConfig::load_or_default()
    };

    if args.no_idle_shutdown {
        config.idle.enabled = false;
    }

    let log_level = args.log_level.as_deref().unwrap_or(&config.host.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("receiver-host v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    if let Some(secs) = args.wait_ready {
        return wait_ready_mode(&config, Duration::from_secs(secs)).await;
    }

    if args.list_devices {
        return list_devices_mode(&config);
    }

    run_host(config).await
}

/// Block until a running host has set its startup signal
async fn wait_ready_mode(config: &HostConfig, timeout: Duration) -> Result<()> {
    let runtime_dir = config.runtime_dir();
    info!(
        "Waiting up to {}s for {} to start",
        timeout.as_secs(),
        config.host.instance_name
    );

    if StartupSignal::wait(&runtime_dir, &config.host.instance_name, timeout).await {
        println!("{} is ready", config.host.instance_name);
        Ok(())
    } else {
        bail!(
            "{} did not signal startup within {}s",
            config.host.instance_name,
            timeout.as_secs()
        )
    }
}

/// List present receivers and exit
fn list_devices_mode(config: &HostConfig) -> Result<()> {
    let enumerator = UsbEnumerator::new().context("Failed to initialize libusb")?;
    let definitions = config.class_definitions();

    let mut total = 0;
    for definition in &definitions {
        let paths = match enumerator.present_devices(definition.class_id) {
            Ok(paths) => paths,
            Err(e) => {
                warn!("Skipping class {}: {}", definition.class_id, e);
                continue;
            }
        };
        if paths.is_empty() {
            continue;
        }

        println!("{} ({}):", definition.class_id, definition.kind);
        for path in &paths {
            println!("    {}", path);
        }
        total += paths.len();
    }

    if total == 0 {
        println!("No receivers found.");
    } else {
        println!("\nFound {} receiver(s) across {} classes.", total, definitions.len());
    }
    Ok(())
}

async fn run_host(config: HostConfig) -> Result<()> {
    if service::is_systemd() {
        info!("Running under systemd");
    }

    let classes = ClassTable::from_definitions(config.class_definitions());
    if classes.is_empty() {
        warn!("No device classes configured, no receivers will be tracked");
    }

    let runtime = Handle::current();
    let parts = HostParts {
        classes,
        factory: Arc::new(ReceiverFactory::new().context("Failed to initialize libusb")?),
        source: Box::new(UsbEventSource::new()),
        enumerator: Box::new(UsbEnumerator::new().context("Failed to initialize libusb")?),
        control: Box::new(ListenerServer::new(
            "control",
            config.servers.control.bind_addr.clone(),
            runtime.clone(),
        )),
        streaming: Box::new(ListenerServer::new(
            "streaming",
            config.servers.streaming.bind_addr.clone(),
            runtime,
        )),
    };

    let supervisor = HostSupervisor::new(config.supervisor_settings(), parts)
        .run(shutdown_signal())
        .await
        .context("Host failed")?;

    info!("Exiting ({})", supervisor.state());
    Ok(())
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
        Err(e) => error!("Error waiting for Ctrl+C: {}", e),
    }
}
