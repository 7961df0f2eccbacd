//! Receiver device drivers
//!
//! The registry only ever talks to devices through [`Device`]: `init` once
//! after construction, `set_availability(false)` before the record is
//! dropped. [`ReceiverFactory`] maps each [`DeviceKind`] to its driver.

use crate::usb::classes::{DeviceKind, TypeConfig};
use crate::usb::source::find_device;
use common::{DevicePathKey, Error, Result};
use rusb::{Context, DeviceHandle};
use tracing::{debug, info, warn};

/// Device object contract
pub trait Device: Send {
    /// Bring the device up. A device whose `init` fails is discarded.
    fn init(&mut self) -> Result<()>;

    /// Start or stop serving. Called with `false` right before removal.
    fn set_availability(&mut self, available: bool);
}

/// Construction parameters for one device instance
#[derive(Debug, Clone, Copy)]
pub struct DeviceSpec<'a> {
    pub kind: DeviceKind,
    pub path: &'a DevicePathKey,
    pub config: &'a TypeConfig,
    /// Per-coordinator instance index, never reused
    pub index: u64,
}

/// Maps a driver kind to a device object
pub trait DeviceFactory: Send + Sync + 'static {
    fn construct(&self, spec: DeviceSpec<'_>) -> Box<dyn Device>;
}

/// Tuner counts supported by PX-MLT boards
const PXMLT_TUNER_RANGE: std::ops::RangeInclusive<i64> = 1..=8;

/// Driver settings parsed from the class's type configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverSettings {
    /// Interface to claim
    pub interface: u8,
    /// Number of tuners exposed (PX-MLT only)
    pub tuners: Option<u8>,
}

impl ReceiverSettings {
    pub fn parse(kind: DeviceKind, config: &TypeConfig) -> Result<Self> {
        let interface = match config.get("interface") {
            None => 0,
            Some(value) => value
                .as_integer()
                .and_then(|i| u8::try_from(i).ok())
                .ok_or_else(|| Error::DeviceInit(format!("invalid interface: {}", value)))?,
        };

        let tuners = match (kind, config.get("tuners")) {
            (DeviceKind::Px4, None) => None,
            (DeviceKind::Px4, Some(_)) => {
                return Err(Error::DeviceInit(
                    "'tuners' is only valid for pxmlt devices".to_string(),
                ));
            }
            (DeviceKind::PxMlt, None) => Some(5),
            (DeviceKind::PxMlt, Some(value)) => {
                let count = value
                    .as_integer()
                    .filter(|n| PXMLT_TUNER_RANGE.contains(n))
                    .ok_or_else(|| Error::DeviceInit(format!("invalid tuner count: {}", value)))?;
                Some(count as u8)
            }
        };

        Ok(Self { interface, tuners })
    }
}

/// USB receiver driver
///
/// Opens the device behind its path and claims the configured interface.
/// Stream handling is done by the servers, not here.
pub struct UsbReceiver {
    context: Context,
    kind: DeviceKind,
    path: DevicePathKey,
    config: TypeConfig,
    index: u64,
    handle: Option<DeviceHandle<Context>>,
    claimed_interface: Option<u8>,
    settings: Option<ReceiverSettings>,
}

impl UsbReceiver {
    pub fn new(context: Context, spec: DeviceSpec<'_>) -> Self {
        Self {
            context,
            kind: spec.kind,
            path: spec.path.clone(),
            config: spec.config.clone(),
            index: spec.index,
            handle: None,
            claimed_interface: None,
            settings: None,
        }
    }

    fn open(&mut self, settings: &ReceiverSettings) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        let device = find_device(&self.context, &self.path)?
            .ok_or_else(|| Error::DeviceInit(format!("{} is no longer present", self.path)))?;

        let handle = device.open().map_err(|e| {
            Error::DeviceInit(format!("Failed to open {}: {}", self.path, e))
        })?;

        let interface = settings.interface;
        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!(
                    "Detaching kernel driver from interface {} on #{}",
                    interface, self.index
                );
                if let Err(e) = handle.detach_kernel_driver(interface) {
                    warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    );
                }
            }
            Ok(false) => {}
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            ),
        }

        handle.claim_interface(interface).map_err(|e| {
            Error::DeviceInit(format!("Failed to claim interface {}: {}", interface, e))
        })?;

        debug!("Claimed interface {} on #{}", interface, self.index);
        self.claimed_interface = Some(interface);
        self.handle = Some(handle);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Some(interface) = self.claimed_interface.take() {
                if let Err(e) = handle.release_interface(interface) {
                    debug!("Failed to release interface {}: {}", interface, e);
                }
                if let Err(e) = handle.attach_kernel_driver(interface) {
                    debug!(
                        "Could not reattach kernel driver to interface {}: {}",
                        interface, e
                    );
                }
            }
            debug!("Closed #{} ({})", self.index, self.path);
        }
    }
}

impl Device for UsbReceiver {
    fn init(&mut self) -> Result<()> {
        let settings = ReceiverSettings::parse(self.kind, &self.config)?;
        self.open(&settings)?;

        match settings.tuners {
            Some(tuners) => info!(
                "{} receiver #{} ready at {} ({} tuners)",
                self.kind, self.index, self.path, tuners
            ),
            None => info!(
                "{} receiver #{} ready at {}",
                self.kind, self.index, self.path
            ),
        }

        self.settings = Some(settings);
        Ok(())
    }

    fn set_availability(&mut self, available: bool) {
        if available {
            let Some(settings) = self.settings.clone() else {
                warn!("#{} made available before init", self.index);
                return;
            };
            if let Err(e) = self.open(&settings) {
                warn!("#{} could not be reopened: {}", self.index, e);
            }
        } else {
            info!("{} receiver #{} unavailable", self.kind, self.index);
            self.close();
        }
    }
}

impl Drop for UsbReceiver {
    fn drop(&mut self) {
        self.close();
    }
}

/// Factory for the built-in USB receiver drivers
pub struct ReceiverFactory {
    context: Context,
}

impl ReceiverFactory {
    pub fn new() -> Result<Self> {
        let context = Context::new().map_err(|e| Error::Usb(e.to_string()))?;
        Ok(Self { context })
    }
}

impl DeviceFactory for ReceiverFactory {
    fn construct(&self, spec: DeviceSpec<'_>) -> Box<dyn Device> {
        debug!("Constructing {} driver #{} for {}", spec.kind, spec.index, spec.path);
        match spec.kind {
            DeviceKind::Px4 | DeviceKind::PxMlt => {
                Box::new(UsbReceiver::new(self.context.clone(), spec))
            }
        }
    }
}
