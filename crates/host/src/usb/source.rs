//! libusb notification and enumeration backend
//!
//! [`UsbEventSource`] registers a libusb hotplug callback on the bridge
//! thread and pumps `handle_events` from [`EventSource::poll`].
//! [`UsbEnumerator`] lists present devices for the initial scan.
//!
//! Device paths follow the Windows interface path shape,
//! `\\?\USB#VID_vvvv&PID_pppp#bus-ports`, so they stay stable across
//! re-enumeration as long as the device stays on the same port.

use crate::usb::bridge::EventSource;
use crate::usb::manager::DeviceEnumerator;
use async_channel::{Receiver, Sender, unbounded};
use common::{ClassId, DeviceEvent, DevicePathKey, Error, EventKind, Result};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::time::Duration;
use tracing::{debug, warn};

/// Build the device path for a libusb device
pub fn usb_device_path<T: UsbContext>(device: &Device<T>) -> Result<String> {
    let descriptor = device
        .device_descriptor()
        .map_err(|e| Error::Usb(format!("Failed to read device descriptor: {}", e)))?;

    let location = match device.port_numbers() {
        Ok(ports) if !ports.is_empty() => ports
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join("."),
        _ => format!("addr{:03}", device.address()),
    };

    Ok(format!(
        r"\\?\USB#VID_{:04X}&PID_{:04X}#{:03}-{}",
        descriptor.vendor_id(),
        descriptor.product_id(),
        device.bus_number(),
        location
    ))
}

/// Class identifier for a libusb device
fn usb_class_id<T: UsbContext>(device: &Device<T>) -> Result<ClassId> {
    let descriptor = device
        .device_descriptor()
        .map_err(|e| Error::Usb(format!("Failed to read device descriptor: {}", e)))?;
    Ok(ClassId::from_usb_ids(
        descriptor.vendor_id(),
        descriptor.product_id(),
    ))
}

/// Find the present device whose path folds to `path`
pub fn find_device(context: &Context, path: &DevicePathKey) -> Result<Option<Device<Context>>> {
    let devices = context
        .devices()
        .map_err(|e| Error::Usb(format!("Failed to list devices: {}", e)))?;

    Ok(devices.iter().find(|device| {
        usb_device_path(device)
            .map(|p| DevicePathKey::new(&p) == *path)
            .unwrap_or(false)
    }))
}

/// libusb hotplug event source
pub struct UsbEventSource {
    // Declared before `context` so the callback is deregistered first.
    registration: Option<Registration<Context>>,
    context: Option<Context>,
    events_tx: Sender<DeviceEvent>,
    events_rx: Receiver<DeviceEvent>,
}

impl UsbEventSource {
    pub fn new() -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            registration: None,
            context: None,
            events_tx,
            events_rx,
        }
    }
}

impl Default for UsbEventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSource for UsbEventSource {
    fn install(&mut self) -> Result<()> {
        if !rusb::has_hotplug() {
            return Err(Error::SinkInstall(
                "libusb was built without hotplug support".to_string(),
            ));
        }

        let context = Context::new()
            .map_err(|e| Error::SinkInstall(format!("Failed to create USB context: {}", e)))?;

        let callback = HotplugForwarder {
            events_tx: self.events_tx.clone(),
        };
        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(&context, Box::new(callback))
            .map_err(|e| {
                Error::SinkInstall(format!("Failed to register hotplug callback: {}", e))
            })?;

        debug!("libusb hotplug callback registered");
        self.registration = Some(registration);
        self.context = Some(context);
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<Vec<DeviceEvent>> {
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| Error::Bridge("Event source polled before install".to_string()))?;

        match context.handle_events(Some(timeout)) {
            Ok(()) | Err(rusb::Error::Interrupted) => {}
            Err(e) => return Err(Error::Usb(format!("Failed to handle USB events: {}", e))),
        }

        let mut events = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            events.push(event);
        }
        Ok(events)
    }
}

/// Translates libusb callbacks into [`DeviceEvent`]s
///
/// Runs inside `handle_events` on the bridge thread, so the events are
/// picked up by the same `poll` call that fired them.
struct HotplugForwarder {
    events_tx: Sender<DeviceEvent>,
}

impl HotplugForwarder {
    fn forward<T: UsbContext>(&self, kind: EventKind, device: &Device<T>) {
        let event = match (usb_class_id(device), usb_device_path(device)) {
            (Ok(class_id), Ok(path)) => DeviceEvent {
                kind,
                class_id,
                path,
            },
            (Err(e), _) | (_, Err(e)) => {
                warn!(
                    "Dropping hotplug {} for bus {} addr {}: {}",
                    kind,
                    device.bus_number(),
                    device.address(),
                    e
                );
                return;
            }
        };

        if self.events_tx.try_send(event).is_err() {
            debug!("Hotplug event queue closed, dropping {}", kind);
        }
    }
}

impl<T: UsbContext> Hotplug<T> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<T>) {
        self.forward(EventKind::Arrival, &device);
    }

    fn device_left(&mut self, device: Device<T>) {
        self.forward(EventKind::Removal, &device);
    }
}

/// libusb device enumerator
pub struct UsbEnumerator {
    context: Context,
}

impl UsbEnumerator {
    pub fn new() -> Result<Self> {
        let context = Context::new().map_err(|e| Error::Usb(e.to_string()))?;
        Ok(Self { context })
    }
}

impl DeviceEnumerator for UsbEnumerator {
    fn present_devices(&self, class_id: ClassId) -> Result<Vec<String>> {
        let Some((vendor_id, product_id)) = class_id.usb_ids() else {
            return Err(Error::Enumeration(format!(
                "class {} has no USB vendor/product mapping",
                class_id
            )));
        };

        let devices = self
            .context
            .devices()
            .map_err(|e| Error::Usb(format!("Failed to list devices: {}", e)))?;

        let mut paths = Vec::new();
        for device in devices.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            if descriptor.vendor_id() != vendor_id || descriptor.product_id() != product_id {
                continue;
            }
            match usb_device_path(&device) {
                Ok(path) => paths.push(path),
                Err(e) => warn!("Skipping device during enumeration: {}", e),
            }
        }

        Ok(paths)
    }
}
