//! Test utilities for receiver-host
//!
//! Scripted stand-ins for the OS and network collaborators, so the bridge,
//! the device manager and the supervisor can be driven deterministically.
//! Every mock hands back a probe that observes it from the test side.
//!
//! # Example
//!
//! ```
//! use common::{ClassId, DeviceEvent};
//! use host::test_utils::{RecordingHandler, ScriptedSource, DEFAULT_TEST_TIMEOUT};
//! use host::usb::NotificationBridge;
//! use std::sync::Arc;
//!
//! let (source, probe) = ScriptedSource::new();
//! let handler = Arc::new(RecordingHandler::default());
//! let bridge = NotificationBridge::create(Box::new(source), handler.clone()).unwrap();
//!
//! probe.inject(DeviceEvent::arrival(ClassId::from_usb_ids(0x0511, 0x083f), "dev-1"));
//! assert!(handler.wait_for(1, DEFAULT_TEST_TIMEOUT));
//! bridge.close();
//! ```

use crate::server::ConnectionServer;
use crate::usb::{
    Device, DeviceEnumerator, DeviceFactory, DeviceKind, DeviceSpec, EventSource, HotplugHandler,
};
use common::{ClassId, DeviceEvent, DevicePathKey, Error, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

const WAIT_STEP: Duration = Duration::from_millis(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(WAIT_STEP);
    }
}

/// Async variant of [`wait_until`] that yields to the runtime between polls
pub async fn wait_until_async(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
}

// ============================================================================
// Event source
// ============================================================================

#[derive(Default)]
struct SourceState {
    install_attempted: AtomicBool,
    installed: AtomicBool,
    alive: AtomicBool,
}

/// Event source fed by its [`SourceProbe`]
pub struct ScriptedSource {
    events: mpsc::Receiver<DeviceEvent>,
    state: Arc<SourceState>,
    install_error: Option<String>,
}

/// Test-side handle of a [`ScriptedSource`]
#[derive(Clone)]
pub struct SourceProbe {
    events: mpsc::Sender<DeviceEvent>,
    state: Arc<SourceState>,
}

impl ScriptedSource {
    pub fn new() -> (Self, SourceProbe) {
        let (tx, rx) = mpsc::channel();
        let state = Arc::new(SourceState::default());
        state.alive.store(true, Ordering::SeqCst);

        let source = Self {
            events: rx,
            state: state.clone(),
            install_error: None,
        };
        (source, SourceProbe { events: tx, state })
    }

    /// Make `install` fail with `reason`
    pub fn fail_install(mut self, reason: &str) -> Self {
        self.install_error = Some(reason.to_string());
        self
    }
}

impl EventSource for ScriptedSource {
    fn install(&mut self) -> Result<()> {
        self.state.install_attempted.store(true, Ordering::SeqCst);
        if let Some(reason) = &self.install_error {
            return Err(Error::SinkInstall(reason.clone()));
        }
        self.state.installed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<Vec<DeviceEvent>> {
        let first = match self.events.recv_timeout(timeout) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => return Ok(Vec::new()),
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(timeout);
                return Ok(Vec::new());
            }
        };

        let mut events = vec![first];
        events.extend(self.events.try_iter());
        Ok(events)
    }
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        self.state.alive.store(false, Ordering::SeqCst);
    }
}

impl SourceProbe {
    /// Queue an event for the next poll. Ignored once the source is gone.
    pub fn inject(&self, event: DeviceEvent) {
        let _ = self.events.send(event);
    }

    pub fn install_attempted(&self) -> bool {
        self.state.install_attempted.load(Ordering::SeqCst)
    }

    pub fn is_installed(&self) -> bool {
        self.state.installed.load(Ordering::SeqCst)
    }

    /// Whether the source has not been dropped yet
    pub fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::SeqCst)
    }
}

/// Handler that records every event it receives
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<DeviceEvent>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<DeviceEvent> {
        lock(&self.events).clone()
    }

    /// Wait until at least `count` events were recorded
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, || lock(&self.events).len() >= count)
    }
}

impl HotplugHandler for RecordingHandler {
    fn on_event(&self, event: &DeviceEvent) {
        lock(&self.events).push(event.clone());
    }
}

// ============================================================================
// Devices
// ============================================================================

#[derive(Default)]
struct DeviceState {
    availability: Mutex<Option<bool>>,
    dropped: AtomicBool,
}

/// Standalone device object for registry tests
pub struct MockDevice {
    state: Arc<DeviceState>,
}

/// Test-side handle of a [`MockDevice`]
#[derive(Clone)]
pub struct DeviceProbe {
    state: Arc<DeviceState>,
}

impl MockDevice {
    pub fn new() -> (Self, DeviceProbe) {
        let state = Arc::new(DeviceState::default());
        let device = Self { state: state.clone() };
        (device, DeviceProbe { state })
    }
}

impl Device for MockDevice {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_availability(&mut self, available: bool) {
        *lock(&self.state.availability) = Some(available);
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.state.dropped.store(true, Ordering::SeqCst);
    }
}

impl DeviceProbe {
    /// Last value passed to `set_availability`, if any
    pub fn availability(&self) -> Option<bool> {
        *lock(&self.state.availability)
    }

    pub fn is_dropped(&self) -> bool {
        self.state.dropped.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FactoryState {
    constructed: Mutex<Vec<(DeviceKind, u64, DevicePathKey)>>,
    /// Initialized, still-available devices per path
    active: Mutex<HashMap<DevicePathKey, usize>>,
    live: AtomicUsize,
    unavailable: AtomicUsize,
    violations: AtomicUsize,
    /// Paths whose next `init` panics
    panic_once: Mutex<HashSet<DevicePathKey>>,
}

impl FactoryState {
    fn activate(&self, path: &DevicePathKey) {
        let mut active = lock(&self.active);
        let count = active.entry(path.clone()).or_insert(0);
        if *count > 0 {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        *count += 1;
    }

    fn deactivate(&self, path: &DevicePathKey) {
        let mut active = lock(&self.active);
        if let Some(count) = active.get_mut(path) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                active.remove(path);
            }
        }
    }
}

/// Device factory with liveness accounting
///
/// Counts a device as active between a successful `init` and its
/// `set_availability(false)` or drop, and records a violation whenever two
/// devices are active for the same path at once.
pub struct MockFactory {
    state: Arc<FactoryState>,
    failing_paths: HashSet<DevicePathKey>,
    init_delay: Option<Duration>,
}

impl Default for MockFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFactory {
    pub fn new() -> Self {
        Self {
            state: Arc::new(FactoryState::default()),
            failing_paths: HashSet::new(),
            init_delay: None,
        }
    }

    /// Devices constructed for `path` fail `init`
    pub fn failing_init(mut self, path: &str) -> Self {
        self.failing_paths.insert(DevicePathKey::new(path));
        self
    }

    /// The first device constructed for `path` panics in `init`
    pub fn panicking_init_once(self, path: &str) -> Self {
        lock(&self.state.panic_once).insert(DevicePathKey::new(path));
        self
    }

    /// Sleep in every `init`, widening the window for concurrent removals
    pub fn with_init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = Some(delay);
        self
    }

    pub fn constructed_count(&self) -> usize {
        lock(&self.state.constructed).len()
    }

    pub fn constructed_kinds(&self) -> Vec<DeviceKind> {
        lock(&self.state.constructed)
            .iter()
            .map(|(kind, _, _)| *kind)
            .collect()
    }

    pub fn constructed_indexes(&self) -> Vec<u64> {
        lock(&self.state.constructed)
            .iter()
            .map(|(_, index, _)| *index)
            .collect()
    }

    pub fn constructed_paths(&self) -> Vec<DevicePathKey> {
        lock(&self.state.constructed)
            .iter()
            .map(|(_, _, path)| path.clone())
            .collect()
    }

    /// Devices constructed and not yet dropped
    pub fn live_devices(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    /// Number of `set_availability(false)` calls
    pub fn unavailable_count(&self) -> usize {
        self.state.unavailable.load(Ordering::SeqCst)
    }

    /// Times a second device became active for an already-active path
    pub fn violations(&self) -> usize {
        self.state.violations.load(Ordering::SeqCst)
    }

    /// Paths with an active device, sorted
    pub fn active_paths(&self) -> Vec<DevicePathKey> {
        let mut paths: Vec<DevicePathKey> = lock(&self.state.active).keys().cloned().collect();
        paths.sort();
        paths
    }
}

impl DeviceFactory for MockFactory {
    fn construct(&self, spec: DeviceSpec<'_>) -> Box<dyn Device> {
        lock(&self.state.constructed).push((spec.kind, spec.index, spec.path.clone()));
        self.state.live.fetch_add(1, Ordering::SeqCst);

        Box::new(FactoryDevice {
            state: self.state.clone(),
            path: spec.path.clone(),
            fail_init: self.failing_paths.contains(spec.path),
            panic_in_init: lock(&self.state.panic_once).remove(spec.path),
            init_delay: self.init_delay,
            active: false,
        })
    }
}

struct FactoryDevice {
    state: Arc<FactoryState>,
    path: DevicePathKey,
    fail_init: bool,
    panic_in_init: bool,
    init_delay: Option<Duration>,
    active: bool,
}

impl FactoryDevice {
    fn deactivate(&mut self) {
        if self.active {
            self.active = false;
            self.state.deactivate(&self.path);
        }
    }
}

impl Device for FactoryDevice {
    fn init(&mut self) -> Result<()> {
        if let Some(delay) = self.init_delay {
            std::thread::sleep(delay);
        }
        if self.panic_in_init {
            panic!("scripted init panic for {}", self.path);
        }
        if self.fail_init {
            return Err(Error::DeviceInit(format!("scripted failure for {}", self.path)));
        }
        self.active = true;
        self.state.activate(&self.path);
        Ok(())
    }

    fn set_availability(&mut self, available: bool) {
        if !available {
            self.state.unavailable.fetch_add(1, Ordering::SeqCst);
            self.deactivate();
        }
    }
}

impl Drop for FactoryDevice {
    fn drop(&mut self) {
        self.deactivate();
        self.state.live.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Enumeration
// ============================================================================

/// Enumerator returning a fixed device list per class
#[derive(Default)]
pub struct StaticEnumerator {
    devices: HashMap<ClassId, Vec<String>>,
    failing_classes: HashSet<ClassId>,
    subsystem_error: bool,
}

impl StaticEnumerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(mut self, class_id: ClassId, paths: &[&str]) -> Self {
        self.devices
            .entry(class_id)
            .or_default()
            .extend(paths.iter().map(|p| p.to_string()));
        self
    }

    /// Listing `class_id` fails with a per-class error
    pub fn with_class_error(mut self, class_id: ClassId) -> Self {
        self.failing_classes.insert(class_id);
        self
    }

    /// Every listing fails as if the USB subsystem were unavailable
    pub fn with_subsystem_error(mut self) -> Self {
        self.subsystem_error = true;
        self
    }
}

impl DeviceEnumerator for StaticEnumerator {
    fn present_devices(&self, class_id: ClassId) -> Result<Vec<String>> {
        if self.subsystem_error {
            return Err(Error::Usb("USB subsystem unavailable".to_string()));
        }
        if self.failing_classes.contains(&class_id) {
            return Err(Error::Enumeration(format!("class {} not listable", class_id)));
        }
        Ok(self.devices.get(&class_id).cloned().unwrap_or_default())
    }
}

// ============================================================================
// Servers
// ============================================================================

#[derive(Default)]
struct ServerState {
    counts: Mutex<VecDeque<usize>>,
    last_count: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
    running: AtomicBool,
}

/// Connection server reporting a scripted sequence of connection counts
///
/// Each `active_connections` call consumes one scripted value; once the
/// script runs out the last value repeats (0 if the script was empty).
pub struct ScriptedServer {
    name: String,
    state: Arc<ServerState>,
    fail_start: bool,
}

/// Test-side handle of a [`ScriptedServer`]
#[derive(Clone)]
pub struct ServerProbe {
    state: Arc<ServerState>,
}

impl ScriptedServer {
    pub fn new(name: &str) -> (Self, ServerProbe) {
        let state = Arc::new(ServerState::default());
        let server = Self {
            name: name.to_string(),
            state: state.clone(),
            fail_start: false,
        };
        (server, ServerProbe { state })
    }

    pub fn with_counts(self, counts: &[usize]) -> Self {
        lock(&self.state.counts).extend(counts.iter().copied());
        self
    }

    /// Make `start` fail as if the bind address were taken
    pub fn fail_start(mut self) -> Self {
        self.fail_start = true;
        self
    }
}

impl ConnectionServer for ScriptedServer {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> anyhow::Result<()> {
        if self.fail_start {
            anyhow::bail!("address already in use");
        }
        self.state.starts.fetch_add(1, Ordering::SeqCst);
        self.state.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        if self.state.running.swap(false, Ordering::SeqCst) {
            self.state.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn active_connections(&self) -> usize {
        match lock(&self.state.counts).pop_front() {
            Some(count) => {
                self.state.last_count.store(count, Ordering::SeqCst);
                count
            }
            None => self.state.last_count.load(Ordering::SeqCst),
        }
    }
}

impl ServerProbe {
    pub fn push_counts(&self, counts: &[usize]) {
        lock(&self.state.counts).extend(counts.iter().copied());
    }

    pub fn start_count(&self) -> usize {
        self.state.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.state.stops.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }
}
