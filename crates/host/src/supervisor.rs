//! Host supervisor
//!
//! Owns everything with host lifetime: the instance lock, the startup
//! signal, the device manager and the two connection servers. Startup
//! builds them in that order and shutdown releases them in reverse.
//!
//! ```text
//! NotStarted -> Starting -> Running <-> IdleCounting -> ShuttingDown -> Stopped
//!                  |                                                    ^
//!                  +------------ lock held elsewhere -------------------+
//! ```

use crate::instance::{InstanceLock, LockOutcome, StartupSignal};
use crate::server::ConnectionServer;
use crate::service;
use crate::usb::{ClassTable, DeviceEnumerator, DeviceFactory, DeviceManager, EventSource};
use common::{Error, Result};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NotStarted,
    Starting,
    Running,
    /// Running, with at least one consecutive idle sample recorded
    IdleCounting,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::NotStarted => "not started",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::IdleCounting => "idle counting",
            SupervisorState::ShuttingDown => "shutting down",
            SupervisorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Consecutive-idle debounce
#[derive(Debug, Clone)]
pub struct IdleMonitor {
    threshold: u32,
    consecutive_idle: u32,
}

impl IdleMonitor {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_idle: 0,
        }
    }

    /// Record one connection-count sample
    ///
    /// Returns `true` once `threshold` consecutive samples were zero.
    pub fn record(&mut self, active_connections: usize) -> bool {
        if active_connections == 0 {
            self.consecutive_idle = self.consecutive_idle.saturating_add(1);
        } else {
            self.consecutive_idle = 0;
        }
        self.consecutive_idle >= self.threshold
    }

    pub fn consecutive_idle(&self) -> u32 {
        self.consecutive_idle
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Directory holding the instance lock and startup signal
    pub runtime_dir: PathBuf,
    pub instance_name: String,
    pub poll_interval: Duration,
    pub idle_threshold: u32,
    /// When false the host runs until an external shutdown request
    pub idle_shutdown: bool,
}

impl SupervisorSettings {
    pub fn new(runtime_dir: impl Into<PathBuf>, instance_name: impl Into<String>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
            instance_name: instance_name.into(),
            poll_interval: Duration::from_secs(5),
            idle_threshold: 3,
            idle_shutdown: true,
        }
    }
}

/// Collaborators handed to the supervisor, consumed by [`HostSupervisor::start`]
pub struct HostParts {
    pub classes: ClassTable,
    pub factory: Arc<dyn DeviceFactory>,
    pub source: Box<dyn EventSource>,
    pub enumerator: Box<dyn DeviceEnumerator + Send>,
    pub control: Box<dyn ConnectionServer>,
    pub streaming: Box<dyn ConnectionServer>,
}

pub struct HostSupervisor {
    settings: SupervisorSettings,
    state: SupervisorState,
    parts: Option<HostParts>,
    idle: IdleMonitor,
    // Released in reverse: servers, manager, signal, lock.
    lock: Option<InstanceLock>,
    signal: Option<StartupSignal>,
    manager: Option<DeviceManager>,
    servers: Vec<Box<dyn ConnectionServer>>,
}

impl HostSupervisor {
    pub fn new(settings: SupervisorSettings, parts: HostParts) -> Self {
        let idle = IdleMonitor::new(settings.idle_threshold);
        Self {
            settings,
            state: SupervisorState::NotStarted,
            parts: Some(parts),
            idle,
            lock: None,
            signal: None,
            manager: None,
            servers: Vec::new(),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn device_manager(&self) -> Option<&DeviceManager> {
        self.manager.as_ref()
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Become the running instance and bring every component up
    ///
    /// If another instance holds the lock, ends in [`SupervisorState::Stopped`]
    /// and returns `Ok` without building anything. Any failure after the lock
    /// is taken tears down what was built and returns the error.
    pub fn start(&mut self) -> Result<()> {
        if self.state != SupervisorState::NotStarted {
            return Err(Error::Other(format!(
                "Supervisor cannot start while {}",
                self.state
            )));
        }
        let Some(parts) = self.parts.take() else {
            return Err(Error::Other("Supervisor parts already consumed".to_string()));
        };
        self.state = SupervisorState::Starting;

        let acquired =
            InstanceLock::acquire(&self.settings.runtime_dir, &self.settings.instance_name);
        let lock = match acquired {
            Ok(LockOutcome::Acquired(lock)) => lock,
            Ok(LockOutcome::AlreadyHeld) => {
                info!(
                    "Another {} instance is already running, exiting",
                    self.settings.instance_name
                );
                self.state = SupervisorState::Stopped;
                return Ok(());
            }
            Err(e) => {
                self.state = SupervisorState::Stopped;
                return Err(e);
            }
        };
        self.lock = Some(lock);

        if let Err(e) = self.bring_up(parts) {
            error!("Host startup failed: {}", e);
            self.teardown();
            return Err(e);
        }

        self.state = SupervisorState::Running;
        info!("Host started");
        Ok(())
    }

    fn bring_up(&mut self, parts: HostParts) -> Result<()> {
        let HostParts {
            classes,
            factory,
            source,
            enumerator,
            control,
            streaming,
        } = parts;

        self.signal = Some(StartupSignal::create(
            &self.settings.runtime_dir,
            &self.settings.instance_name,
        )?);

        let manager = DeviceManager::new(classes, factory, source, enumerator.as_ref())?;
        let device_count = manager.device_count();
        self.manager = Some(manager);

        for mut server in [control, streaming] {
            server.start().map_err(|e| {
                Error::Server(format!("Failed to start {} server: {:#}", server.name(), e))
            })?;
            self.servers.push(server);
        }

        if let Some(signal) = self.signal.as_mut() {
            signal.set()?;
        }

        if let Err(e) = service::notify_ready() {
            warn!("Failed to notify systemd: {:#}", e);
        }
        if let Err(e) = service::notify_status(&format!("{} devices", device_count)) {
            debug!("Failed to send status to systemd: {:#}", e);
        }
        Ok(())
    }

    /// Sum of active connections across all started servers
    pub fn active_connections(&self) -> usize {
        self.servers.iter().map(|s| s.active_connections()).sum()
    }

    /// Take one idle sample
    ///
    /// Returns `true` when the idle threshold has been reached and the host
    /// should shut down. Does nothing unless running.
    pub fn sample(&mut self) -> bool {
        if !matches!(
            self.state,
            SupervisorState::Running | SupervisorState::IdleCounting
        ) {
            return false;
        }

        let active = self.active_connections();
        let idle = self.idle.record(active);
        debug!(
            "Idle sample: {} active connections, {} consecutive idle",
            active,
            self.idle.consecutive_idle()
        );

        self.state = if idle {
            SupervisorState::ShuttingDown
        } else if self.idle.consecutive_idle() > 0 {
            SupervisorState::IdleCounting
        } else {
            SupervisorState::Running
        };
        idle
    }

    /// Sample every poll interval until the host has been idle long enough
    ///
    /// Never completes when idle shutdown is disabled.
    pub async fn run_until_idle(&mut self) {
        if !matches!(
            self.state,
            SupervisorState::Running | SupervisorState::IdleCounting
        ) {
            return;
        }
        if !self.settings.idle_shutdown {
            debug!("Idle shutdown disabled");
            std::future::pending::<()>().await;
        }

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if self.sample() {
                info!(
                    "No connections for {} consecutive samples",
                    self.idle.consecutive_idle()
                );
                return;
            }
        }
    }

    /// Start, run until idle or until `shutdown` completes, then stop
    ///
    /// Startup and teardown do USB I/O and join the bridge thread, so both
    /// run on the blocking pool. Returns the stopped supervisor.
    pub async fn run<F>(self, shutdown: F) -> Result<Self>
    where
        F: Future<Output = ()>,
    {
        let (mut supervisor, started) = self.on_blocking_pool(Self::start).await?;
        started?;
        if supervisor.state == SupervisorState::Stopped {
            return Ok(supervisor);
        }

        tokio::select! {
            _ = supervisor.run_until_idle() => info!("Host idle, shutting down"),
            _ = shutdown => info!("Shutdown requested"),
        }

        let (supervisor, ()) = supervisor.on_blocking_pool(Self::shutdown).await?;
        Ok(supervisor)
    }

    async fn on_blocking_pool<T, Op>(mut self, op: Op) -> Result<(Self, T)>
    where
        T: Send + 'static,
        Op: FnOnce(&mut Self) -> T + Send + 'static,
    {
        tokio::task::spawn_blocking(move || {
            let output = op(&mut self);
            (self, output)
        })
        .await
        .map_err(|e| Error::Other(format!("Supervisor task failed: {}", e)))
    }

    /// Release everything in reverse construction order. Idempotent.
    pub fn shutdown(&mut self) {
        if matches!(
            self.state,
            SupervisorState::NotStarted | SupervisorState::Stopped
        ) {
            return;
        }
        self.state = SupervisorState::ShuttingDown;
        self.teardown();
        info!("Host stopped");
    }

    fn teardown(&mut self) {
        if let Err(e) = service::notify_stopping() {
            debug!("Failed to notify systemd: {:#}", e);
        }

        for server in self.servers.iter_mut().rev() {
            server.stop();
        }
        self.servers.clear();

        if let Some(mut manager) = self.manager.take() {
            manager.shutdown();
        }

        self.signal = None;
        self.lock = None;
        self.state = SupervisorState::Stopped;
    }
}

impl Drop for HostSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
