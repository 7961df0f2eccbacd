//! Integration tests for the hotplug coordinator
//!
//! Drives [`DeviceManager`] through scripted event sources and the mock
//! device factory:
//! - Registry invariants under concurrent arrivals and removals
//! - Unknown classes, duplicates and absent removals
//! - Path case folding
//! - Failed device initialization
//! - Bridge construction failure

use common::{ClassId, DeviceEvent, Error};
use host::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockFactory, ScriptedSource, StaticEnumerator, wait_until,
};
use host::usb::{ClassDefinition, ClassTable, DeviceKind, DeviceManager};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const PX4: ClassId = ClassId::from_usb_ids(0x0511, 0x083f);
const MLT: ClassId = ClassId::from_usb_ids(0x0511, 0x024e);
const UNKNOWN: ClassId = ClassId::from_usb_ids(0x1234, 0x5678);

fn classes() -> ClassTable {
    ClassTable::from_definitions(vec![
        ClassDefinition::new(PX4, DeviceKind::Px4),
        ClassDefinition::new(MLT, DeviceKind::PxMlt),
    ])
}

fn manager(factory: Arc<MockFactory>) -> DeviceManager {
    let (source, _probe) = ScriptedSource::new();
    DeviceManager::new(classes(), factory, Box::new(source), &StaticEnumerator::new()).unwrap()
}

// ============================================================================
// Registry invariants
// ============================================================================

mod registry_invariants {
    use super::*;

    #[test]
    fn test_unknown_class_is_ignored() {
        let factory = Arc::new(MockFactory::new());
        let manager = manager(factory.clone());
        manager.handle_event(&DeviceEvent::arrival(PX4, "known"));

        manager.handle_event(&DeviceEvent::arrival(UNKNOWN, "stranger"));
        manager.handle_event(&DeviceEvent::removal(UNKNOWN, "known"));

        assert_eq!(manager.device_count(), 1);
        assert!(manager.exists("known"));
        assert!(!manager.exists("stranger"));
        assert_eq!(factory.constructed_count(), 1);
    }

    #[test]
    fn test_duplicate_arrival_is_noop() {
        let factory = Arc::new(MockFactory::new());
        let manager = manager(factory.clone());

        manager.handle_event(&DeviceEvent::arrival(PX4, "dev"));
        manager.handle_event(&DeviceEvent::arrival(PX4, "dev"));
        manager.handle_event(&DeviceEvent::arrival(PX4, "DEV"));

        assert_eq!(manager.device_count(), 1);
        assert_eq!(factory.constructed_count(), 1);
        assert_eq!(factory.live_devices(), 1);
    }

    #[test]
    fn test_removal_of_absent_path_is_noop() {
        let factory = Arc::new(MockFactory::new());
        let manager = manager(factory.clone());
        manager.handle_event(&DeviceEvent::arrival(PX4, "present"));

        manager.handle_event(&DeviceEvent::removal(PX4, "absent"));

        assert_eq!(manager.device_count(), 1);
        assert_eq!(factory.unavailable_count(), 0);
    }

    #[test]
    fn test_removal_matches_case_folded_path() {
        let factory = Arc::new(MockFactory::new());
        let manager = manager(factory.clone());

        manager.handle_event(&DeviceEvent::arrival(PX4, "\\\\?\\USB#VID_1234"));
        assert!(manager.exists("\\\\?\\usb#vid_1234"));

        manager.handle_event(&DeviceEvent::removal(PX4, "\\\\?\\usb#vid_1234"));

        assert_eq!(manager.device_count(), 0);
        assert_eq!(factory.unavailable_count(), 1);
        assert_eq!(factory.live_devices(), 0);
    }

    #[test]
    fn test_failed_init_never_observable() {
        let factory = Arc::new(MockFactory::new().failing_init("broken"));
        let manager = manager(factory.clone());

        manager.handle_event(&DeviceEvent::arrival(MLT, "BROKEN"));

        assert!(!manager.exists("broken"));
        assert_eq!(manager.device_count(), 0);
        assert_eq!(factory.constructed_count(), 1);
        assert_eq!(factory.live_devices(), 0);

        // A later arrival retries construction
        manager.handle_event(&DeviceEvent::arrival(MLT, "broken"));
        assert_eq!(factory.constructed_count(), 2);
    }

    #[test]
    fn test_removal_during_init_cancels_device() {
        let factory = Arc::new(MockFactory::new().with_init_delay(Duration::from_millis(200)));
        let manager = manager(factory.clone());

        std::thread::scope(|scope| {
            scope.spawn(|| manager.handle_event(&DeviceEvent::arrival(PX4, "slow")));
            assert!(wait_until(DEFAULT_TEST_TIMEOUT, || factory.constructed_count() == 1));
            manager.handle_event(&DeviceEvent::removal(PX4, "slow"));
        });

        assert!(!manager.exists("slow"));
        assert_eq!(factory.live_devices(), 0);
        assert_eq!(factory.unavailable_count(), 1);
        assert_eq!(factory.violations(), 0);
    }
}

// ============================================================================
// Scan and bridge
// ============================================================================

mod lifecycle {
    use super::*;

    #[test]
    fn test_scan_and_live_events_race_safely() {
        let factory = Arc::new(MockFactory::new());
        let enumerator = StaticEnumerator::new().with_devices(PX4, &["dev-a", "dev-b"]);
        let (source, probe) = ScriptedSource::new();

        // Queued before construction, so the bridge replays them while or
        // after the scan runs.
        probe.inject(DeviceEvent::arrival(PX4, "DEV-A"));
        probe.inject(DeviceEvent::arrival(PX4, "dev-c"));

        let manager =
            DeviceManager::new(classes(), factory.clone(), Box::new(source), &enumerator).unwrap();

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || manager.device_count() == 3));
        assert_eq!(factory.violations(), 0);
        assert_eq!(factory.constructed_count(), 3);
    }

    #[test]
    fn test_bridge_failure_leaves_no_thread() {
        let (source, probe) = ScriptedSource::new();
        let source = source.fail_install("sink unavailable");

        let result = DeviceManager::new(
            classes(),
            Arc::new(MockFactory::new()),
            Box::new(source),
            &StaticEnumerator::new(),
        );

        assert!(matches!(result, Err(Error::SinkInstall(_))));
        assert!(probe.install_attempted());
        assert!(!probe.is_alive());
    }

    #[test]
    fn test_drop_releases_everything() {
        let factory = Arc::new(MockFactory::new());
        let (source, probe) = ScriptedSource::new();
        let enumerator = StaticEnumerator::new()
            .with_devices(PX4, &["a"])
            .with_devices(MLT, &["b", "c"]);

        let manager =
            DeviceManager::new(classes(), factory.clone(), Box::new(source), &enumerator).unwrap();
        assert_eq!(manager.device_count(), 3);

        drop(manager);

        assert!(!probe.is_alive());
        assert_eq!(factory.live_devices(), 0);
        assert_eq!(factory.unavailable_count(), 3);
    }
}

// ============================================================================
// Property-based tests
// ============================================================================

#[derive(Debug, Clone)]
struct Op {
    arrival: bool,
    slot: usize,
    upper: bool,
}

fn path_for(slot: usize, upper: bool) -> String {
    let path = format!(r"\\?\usb#vid_0511&pid_083f#001-{}", slot);
    if upper { path.to_uppercase() } else { path }
}

/// Strategy for one producer's event sequence over a handful of paths
fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    proptest::collection::vec(
        (any::<bool>(), 0usize..4, any::<bool>()).prop_map(|(arrival, slot, upper)| Op {
            arrival,
            slot,
            upper,
        }),
        1..40,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: no path ever has two live device records, whatever the
    /// interleaving of concurrent arrivals and removals
    #[test]
    fn prop_at_most_one_record_per_path(
        producers in proptest::collection::vec(ops_strategy(), 2..4),
    ) {
        let factory = Arc::new(MockFactory::new().with_init_delay(Duration::from_micros(200)));
        let mut manager = manager(factory.clone());

        std::thread::scope(|scope| {
            for ops in &producers {
                let manager = &manager;
                scope.spawn(move || {
                    for op in ops {
                        let path = path_for(op.slot, op.upper);
                        let event = if op.arrival {
                            DeviceEvent::arrival(PX4, path)
                        } else {
                            DeviceEvent::removal(PX4, path)
                        };
                        manager.handle_event(&event);
                    }
                });
            }
        });

        prop_assert_eq!(factory.violations(), 0);
        prop_assert_eq!(manager.active_paths(), factory.active_paths());
        prop_assert_eq!(factory.live_devices(), manager.device_count());

        manager.shutdown();
        prop_assert_eq!(factory.live_devices(), 0);
    }
}
