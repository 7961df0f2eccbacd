//! Device registry
//!
//! Owns every active device object, keyed by normalized device path. A key
//! moves through two states: *initializing* while its device's `init` runs
//! outside the lock, and *active* once the device has been inserted. A key
//! can hold at most one of either at any time.

use crate::usb::device::Device;
use common::DevicePathKey;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

enum Slot {
    /// Reserved while `init` runs. `cancelled` is set by a removal that
    /// arrives before initialization finishes.
    Initializing { cancelled: bool },
    Active(Box<dyn Device>),
}

/// Outcome of [`DeviceRegistry::reserve`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// Key was free and is now reserved for the caller
    Reserved,
    /// Key is already initializing or active
    Occupied,
}

/// Outcome of [`DeviceRegistry::complete`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Device inserted as active
    Inserted,
    /// A removal arrived during initialization; the device was made
    /// unavailable and dropped
    Cancelled,
}

/// Mutex-guarded path → device map
#[derive(Default)]
pub struct DeviceRegistry {
    slots: Mutex<HashMap<DevicePathKey, Slot>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the map, recovering from a poisoned lock
    ///
    /// Every critical section leaves the map consistent, so a panic in a
    /// device callback does not invalidate it.
    fn slots(&self) -> MutexGuard<'_, HashMap<DevicePathKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve `path` for a device about to be initialized
    pub fn reserve(&self, path: &DevicePathKey) -> Reservation {
        let mut slots = self.slots();
        if slots.contains_key(path) {
            return Reservation::Occupied;
        }
        slots.insert(path.clone(), Slot::Initializing { cancelled: false });
        Reservation::Reserved
    }

    /// Release a reservation whose device failed to initialize
    pub fn abandon(&self, path: &DevicePathKey) {
        let mut slots = self.slots();
        if matches!(slots.get(path), Some(Slot::Initializing { .. })) {
            slots.remove(path);
        }
    }

    /// Turn a reservation into an active record
    ///
    /// A cancelled device is torn down before the lock is released, so the
    /// key cannot be reserved again while it is still open.
    pub fn complete(&self, path: &DevicePathKey, mut device: Box<dyn Device>) -> Completion {
        let mut slots = self.slots();
        match slots.get(path) {
            Some(Slot::Initializing { cancelled: false }) => {
                slots.insert(path.clone(), Slot::Active(device));
                return Completion::Inserted;
            }
            Some(Slot::Initializing { cancelled: true }) => {
                slots.remove(path);
            }
            // The reservation was cleared by teardown.
            Some(Slot::Active(_)) | None => {}
        }
        device.set_availability(false);
        drop(device);
        Completion::Cancelled
    }

    /// Remove `path`
    ///
    /// An active device gets `set_availability(false)` under the lock and is
    /// dropped; an initializing one is marked cancelled. Returns `true` if an
    /// active device was removed.
    pub fn remove(&self, path: &DevicePathKey) -> bool {
        let mut slots = self.slots();
        match slots.get_mut(path) {
            Some(Slot::Initializing { cancelled }) => {
                *cancelled = true;
                false
            }
            Some(Slot::Active(_)) => {
                if let Some(Slot::Active(mut device)) = slots.remove(path) {
                    device.set_availability(false);
                }
                true
            }
            None => false,
        }
    }

    /// Whether `path` holds an active device
    pub fn exists(&self, path: &str) -> bool {
        matches!(self.slots().get(path), Some(Slot::Active(_)))
    }

    /// Number of active devices
    pub fn len(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| matches!(slot, Slot::Active(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Paths of active devices, sorted
    pub fn active_paths(&self) -> Vec<DevicePathKey> {
        let mut paths: Vec<DevicePathKey> = self
            .slots()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Active(_)))
            .map(|(path, _)| path.clone())
            .collect();
        paths.sort();
        paths
    }

    /// Tear down every record
    ///
    /// Active devices are made unavailable and dropped; pending reservations
    /// are dropped so their initializations complete as cancelled. Returns
    /// the number of active devices released.
    pub fn drain(&self) -> usize {
        let mut slots = self.slots();
        let mut released = 0;
        for (_, slot) in slots.drain() {
            if let Slot::Active(mut device) = slot {
                device.set_availability(false);
                released += 1;
            }
        }
        released
    }
}
