//! Hotplug coordinator
//!
//! Wires the notification bridge to the device registry. Construction
//! starts the bridge first and then scans already-present devices, so a
//! device plugged in during the scan is seen by at least one of the two.
//! Both paths funnel into [`DeviceManager::add`] / [`DeviceManager::remove`],
//! which the registry lock serializes.

use crate::usb::bridge::{EventSource, HotplugHandler, NotificationBridge};
use crate::usb::classes::{ClassDefinition, ClassTable};
use crate::usb::device::{DeviceFactory, DeviceSpec};
use crate::usb::registry::{Completion, DeviceRegistry, Reservation};
use common::{ClassId, DeviceEvent, DevicePathKey, Error, EventKind, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// OS device enumeration facility
pub trait DeviceEnumerator {
    /// Raw paths of the devices of `class_id` currently present
    ///
    /// [`Error::Enumeration`] means this class could not be listed and is
    /// skipped; any other error aborts the scan.
    fn present_devices(&self, class_id: ClassId) -> Result<Vec<String>>;
}

/// State shared between the manager and the bridge thread
struct Shared {
    classes: ClassTable,
    registry: DeviceRegistry,
    factory: Arc<dyn DeviceFactory>,
    next_index: AtomicU64,
}

impl Shared {
    fn handle_event(&self, event: &DeviceEvent) {
        let Some(definition) = self.classes.get(&event.class_id) else {
            debug!(
                "Ignoring {} for unrecognized class {}",
                event.kind, event.class_id
            );
            return;
        };

        let path = DevicePathKey::new(&event.path);
        match event.kind {
            EventKind::Arrival => self.add(&path, definition),
            EventKind::Removal => self.remove(&path),
        }
    }

    fn add(&self, path: &DevicePathKey, definition: &ClassDefinition) {
        if self.registry.reserve(path) == Reservation::Occupied {
            debug!("{} already registered", path);
            return;
        }
        let pending = PendingSlot {
            registry: &self.registry,
            path,
        };

        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let mut device = self.factory.construct(DeviceSpec {
            kind: definition.kind,
            path,
            config: &definition.config,
            index,
        });

        if let Err(e) = device.init() {
            warn!(
                "Failed to initialize {} device #{} at {}: {}",
                definition.kind, index, path, e
            );
            return;
        }

        pending.complete();
        match self.registry.complete(path, device) {
            Completion::Inserted => {
                info!("Registered {} device #{} at {}", definition.kind, index, path);
            }
            Completion::Cancelled => {
                info!("{} removed during initialization of #{}", path, index);
            }
        }
    }

    fn remove(&self, path: &DevicePathKey) {
        if self.registry.remove(path) {
            info!("Unregistered device at {}", path);
        } else {
            debug!("Removal for unregistered {}", path);
        }
    }
}

/// Reservation taken by [`Shared::add`]
///
/// Released if `add` returns or unwinds before the device is handed to the
/// registry, so a failed or panicking constructor never leaves the key
/// blocked for later arrivals.
struct PendingSlot<'a> {
    registry: &'a DeviceRegistry,
    path: &'a DevicePathKey,
}

impl PendingSlot<'_> {
    fn complete(self) {
        std::mem::forget(self);
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.registry.abandon(self.path);
    }
}

impl HotplugHandler for Shared {
    fn on_event(&self, event: &DeviceEvent) {
        self.handle_event(event);
    }
}

/// Hotplug coordinator
///
/// Owns the notification bridge and the device registry. Dropping the
/// manager joins the bridge thread and releases every registered device.
pub struct DeviceManager {
    shared: Arc<Shared>,
    bridge: Option<NotificationBridge>,
}

impl DeviceManager {
    /// Start the bridge and register every device already present
    pub fn new(
        classes: ClassTable,
        factory: Arc<dyn DeviceFactory>,
        source: Box<dyn EventSource>,
        enumerator: &dyn DeviceEnumerator,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            classes,
            registry: DeviceRegistry::new(),
            factory,
            next_index: AtomicU64::new(0),
        });

        let handler: Arc<dyn HotplugHandler> = shared.clone();
        let bridge = NotificationBridge::create(source, handler)?;

        let mut manager = Self {
            shared,
            bridge: Some(bridge),
        };

        // Tear down the bridge and any registered devices on scan failure.
        if let Err(e) = manager.scan_existing(enumerator) {
            manager.shutdown();
            return Err(e);
        }

        info!(
            "Device manager initialized with {} devices across {} classes",
            manager.device_count(),
            manager.shared.classes.len()
        );
        Ok(manager)
    }

    /// Synthesize an arrival for every present device of every class
    ///
    /// Returns the number of arrivals synthesized.
    pub fn scan_existing(&self, enumerator: &dyn DeviceEnumerator) -> Result<usize> {
        let mut arrivals = 0;

        for definition in self.shared.classes.iter() {
            let paths = match enumerator.present_devices(definition.class_id) {
                Ok(paths) => paths,
                Err(Error::Enumeration(reason)) => {
                    warn!("Skipping class {}: {}", definition.class_id, reason);
                    continue;
                }
                Err(e) => return Err(e),
            };

            debug!(
                "Class {} ({}): {} present",
                definition.class_id,
                definition.kind,
                paths.len()
            );

            for path in paths {
                self.shared
                    .handle_event(&DeviceEvent::arrival(definition.class_id, path));
                arrivals += 1;
            }
        }

        Ok(arrivals)
    }

    /// Process one event as if it came from the bridge
    pub fn handle_event(&self, event: &DeviceEvent) {
        self.shared.handle_event(event);
    }

    /// Register a device for `path` unless one already exists
    pub fn add(&self, path: &DevicePathKey, definition: &ClassDefinition) {
        self.shared.add(path, definition);
    }

    /// Unregister the device at `path`, if any
    pub fn remove(&self, path: &DevicePathKey) {
        self.shared.remove(path);
    }

    /// Whether an active device is registered at `path` (case-insensitive)
    pub fn exists(&self, path: &str) -> bool {
        self.shared.registry.exists(&path.to_lowercase())
    }

    pub fn device_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn active_paths(&self) -> Vec<DevicePathKey> {
        self.shared.registry.active_paths()
    }

    pub fn classes(&self) -> &ClassTable {
        &self.shared.classes
    }

    /// Close the bridge, then release every registered device
    pub fn shutdown(&mut self) {
        if let Some(bridge) = self.bridge.take() {
            bridge.close();
            let released = self.shared.registry.drain();
            info!("Device manager stopped, released {} devices", released);
        }
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockFactory, ScriptedSource, StaticEnumerator};
    use crate::usb::classes::DeviceKind;
    use std::time::Duration;

    const PX4: ClassId = ClassId::from_usb_ids(0x0511, 0x083f);
    const MLT: ClassId = ClassId::from_usb_ids(0x0511, 0x024e);

    fn classes() -> ClassTable {
        ClassTable::from_definitions(vec![
            ClassDefinition::new(PX4, DeviceKind::Px4),
            ClassDefinition::new(MLT, DeviceKind::PxMlt),
        ])
    }

    fn manager_with(enumerator: StaticEnumerator, factory: Arc<MockFactory>) -> DeviceManager {
        let (source, _probe) = ScriptedSource::new();
        DeviceManager::new(classes(), factory, Box::new(source), &enumerator).unwrap()
    }

    #[test]
    fn test_scan_registers_present_devices() {
        let enumerator = StaticEnumerator::new()
            .with_devices(PX4, &[r"\\?\USB#VID_0511&PID_083F#001-1"])
            .with_devices(MLT, &[r"\\?\USB#VID_0511&PID_024E#001-2"]);
        let factory = Arc::new(MockFactory::new());
        let manager = manager_with(enumerator, factory.clone());

        assert_eq!(manager.classes().len(), 2);
        assert_eq!(manager.device_count(), 2);
        assert!(manager.exists(r"\\?\usb#vid_0511&pid_083f#001-1"));
        assert!(manager.exists(r"\\?\USB#VID_0511&PID_024E#001-2"));

        let kinds = factory.constructed_kinds();
        assert!(kinds.contains(&DeviceKind::Px4));
        assert!(kinds.contains(&DeviceKind::PxMlt));
    }

    #[test]
    fn test_scan_skips_failing_class() {
        let enumerator = StaticEnumerator::new()
            .with_devices(PX4, &["px4-a"])
            .with_class_error(MLT);
        let manager = manager_with(enumerator, Arc::new(MockFactory::new()));

        assert_eq!(manager.device_count(), 1);
        assert!(manager.exists("px4-a"));
    }

    #[test]
    fn test_scan_catastrophic_failure_propagates() {
        let enumerator = StaticEnumerator::new().with_subsystem_error();
        let (source, probe) = ScriptedSource::new();
        let result = DeviceManager::new(
            classes(),
            Arc::new(MockFactory::new()),
            Box::new(source),
            &enumerator,
        );

        assert!(matches!(result, Err(Error::Usb(_))));
        assert!(!probe.is_alive());
    }

    #[test]
    fn test_bridge_events_reach_registry() {
        let (source, probe) = ScriptedSource::new();
        let factory = Arc::new(MockFactory::new());
        let manager = DeviceManager::new(
            classes(),
            factory,
            Box::new(source),
            &StaticEnumerator::new(),
        )
        .unwrap();

        probe.inject(DeviceEvent::arrival(PX4, "HOT-1"));
        assert!(crate::test_utils::wait_until(Duration::from_secs(5), || {
            manager.exists("hot-1")
        }));

        probe.inject(DeviceEvent::removal(PX4, "hot-1"));
        assert!(crate::test_utils::wait_until(Duration::from_secs(5), || {
            !manager.exists("hot-1")
        }));
    }

    #[test]
    fn test_init_panic_frees_path_for_replug() {
        let (source, probe) = ScriptedSource::new();
        let factory = Arc::new(MockFactory::new().panicking_init_once("dev"));
        let manager = DeviceManager::new(
            classes(),
            factory.clone(),
            Box::new(source),
            &StaticEnumerator::new(),
        )
        .unwrap();

        probe.inject(DeviceEvent::arrival(PX4, "dev"));
        probe.inject(DeviceEvent::removal(PX4, "dev"));
        probe.inject(DeviceEvent::arrival(PX4, "DEV"));

        assert!(crate::test_utils::wait_until(Duration::from_secs(5), || {
            manager.exists("dev")
        }));
        assert_eq!(
            factory.constructed_paths(),
            vec![DevicePathKey::new("dev"), DevicePathKey::new("dev")]
        );
        assert_eq!(factory.live_devices(), 1);
        assert!(probe.is_alive());
    }

    #[test]
    fn test_init_panic_outside_bridge_releases_reservation() {
        let factory = Arc::new(MockFactory::new().panicking_init_once("dev"));
        let manager = manager_with(StaticEnumerator::new(), factory.clone());

        let arrival = DeviceEvent::arrival(MLT, "dev");
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            manager.handle_event(&arrival)
        }));
        assert!(result.is_err());
        assert!(!manager.exists("dev"));

        manager.handle_event(&arrival);
        assert!(manager.exists("dev"));
        assert_eq!(factory.constructed_count(), 2);
    }

    #[test]
    fn test_instance_indexes_never_reused() {
        let factory = Arc::new(MockFactory::new());
        let manager = manager_with(StaticEnumerator::new(), factory.clone());

        manager.handle_event(&DeviceEvent::arrival(PX4, "a"));
        manager.handle_event(&DeviceEvent::removal(PX4, "a"));
        manager.handle_event(&DeviceEvent::arrival(PX4, "a"));
        manager.handle_event(&DeviceEvent::arrival(PX4, "b"));

        assert_eq!(factory.constructed_indexes(), vec![0, 1, 2]);
    }

    #[test]
    fn test_shutdown_releases_devices() {
        let factory = Arc::new(MockFactory::new());
        let enumerator = StaticEnumerator::new().with_devices(PX4, &["a", "b"]);
        let (source, probe) = ScriptedSource::new();
        let mut manager =
            DeviceManager::new(classes(), factory.clone(), Box::new(source), &enumerator).unwrap();

        manager.shutdown();

        assert_eq!(manager.device_count(), 0);
        assert!(!probe.is_alive());
        assert_eq!(factory.live_devices(), 0);
        assert_eq!(factory.unavailable_count(), 2);
    }
}
