//! Hotplug notification bridge
//!
//! Dedicated thread that owns the OS event sink and forwards every
//! arrival/removal notification to a single handler.
//!
//! The constructor blocks until the thread has either installed its sink or
//! failed to, so a [`NotificationBridge`] value always has a live, listening
//! thread behind it. Dropping the bridge stops and joins that thread.

use async_channel::{Receiver, Sender, TryRecvError, bounded};
use common::{DeviceEvent, Error, Result};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Upper bound on how long the thread waits for OS events before checking
/// for a close request.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// OS-level device notification facility
pub trait EventSource: Send + 'static {
    /// Install the event sink. Called exactly once, on the bridge thread.
    fn install(&mut self) -> Result<()>;

    /// Wait up to `timeout` for notifications and return them in the order
    /// the OS reported them.
    fn poll(&mut self, timeout: Duration) -> Result<Vec<DeviceEvent>>;
}

/// Receiver of bridge events
///
/// Called synchronously on the bridge thread, one event at a time. A slow
/// handler delays every event queued behind it.
pub trait HotplugHandler: Send + Sync + 'static {
    fn on_event(&self, event: &DeviceEvent);
}

enum BridgeCommand {
    Close,
}

/// Background event bridge
pub struct NotificationBridge {
    close_tx: Sender<BridgeCommand>,
    thread: Option<JoinHandle<()>>,
}

impl NotificationBridge {
    /// Spawn the bridge thread and wait for its sink to be installed
    ///
    /// Returns [`Error::SinkInstall`] if the source could not be installed and
    /// [`Error::Bridge`] if the thread could not be started or died before
    /// reporting. In both cases the thread has been joined before returning.
    pub fn create(source: Box<dyn EventSource>, handler: Arc<dyn HotplugHandler>) -> Result<Self> {
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let (close_tx, close_rx) = bounded(1);

        let thread = std::thread::Builder::new()
            .name("hotplug-bridge".to_string())
            .spawn(move || run_bridge(source, handler, ready_tx, close_rx))
            .map_err(|e| Error::Bridge(format!("Failed to spawn bridge thread: {}", e)))?;

        match ready_rx.recv_blocking() {
            Ok(Ok(())) => {
                info!("Hotplug notification bridge ready");
                Ok(Self {
                    close_tx,
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                join_bridge(thread);
                Err(e)
            }
            Err(_) => {
                join_bridge(thread);
                Err(Error::Bridge(
                    "Bridge thread exited before reporting readiness".to_string(),
                ))
            }
        }
    }

    /// Stop the bridge thread and wait for it to exit
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            // Fails only if the thread already exited.
            let _ = self.close_tx.send_blocking(BridgeCommand::Close);
            join_bridge(thread);
            debug!("Hotplug notification bridge closed");
        }
    }
}

impl Drop for NotificationBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_bridge(
    mut source: Box<dyn EventSource>,
    handler: Arc<dyn HotplugHandler>,
    ready_tx: Sender<Result<()>>,
    close_rx: Receiver<BridgeCommand>,
) {
    if let Err(e) = source.install() {
        error!("Failed to install hotplug event sink: {}", e);
        let e = match e {
            Error::SinkInstall(_) => e,
            other => Error::SinkInstall(other.to_string()),
        };
        let _ = ready_tx.send_blocking(Err(e));
        return;
    }

    if ready_tx.send_blocking(Ok(())).is_err() {
        return;
    }
    drop(ready_tx);

    info!("Hotplug bridge thread started");

    loop {
        match close_rx.try_recv() {
            Ok(BridgeCommand::Close) | Err(TryRecvError::Closed) => break,
            Err(TryRecvError::Empty) => {}
        }

        match source.poll(POLL_TIMEOUT) {
            Ok(events) => {
                for event in &events {
                    dispatch(handler.as_ref(), event);
                }
            }
            Err(e) => {
                warn!("Error waiting for hotplug events: {}", e);
                std::thread::sleep(POLL_TIMEOUT);
            }
        }
    }

    info!("Hotplug bridge thread stopped");
}

/// Deliver one event, containing any panic raised by the handler
fn dispatch(handler: &dyn HotplugHandler, event: &DeviceEvent) {
    debug!(
        "Hotplug {} for class {} at {}",
        event.kind, event.class_id, event.path
    );

    let result = catch_unwind(AssertUnwindSafe(|| handler.on_event(event)));
    if let Err(panic) = result {
        error!(
            "Panic in hotplug handler ({} {}): {}",
            event.kind,
            event.path,
            panic_message(panic.as_ref())
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

fn join_bridge(thread: JoinHandle<()>) {
    if thread.join().is_err() {
        error!("Hotplug bridge thread panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{RecordingHandler, ScriptedSource};
    use common::ClassId;
    use std::time::Instant;

    fn class() -> ClassId {
        ClassId::from_usb_ids(0x0511, 0x083f)
    }

    struct PanickingHandler {
        inner: RecordingHandler,
    }

    impl HotplugHandler for PanickingHandler {
        fn on_event(&self, event: &DeviceEvent) {
            if event.path.contains("boom") {
                panic!("handler failure");
            }
            self.inner.on_event(event);
        }
    }

    #[test]
    fn test_events_delivered_in_order() {
        let (source, probe) = ScriptedSource::new();
        let handler = Arc::new(RecordingHandler::default());
        let bridge = NotificationBridge::create(Box::new(source), handler.clone()).unwrap();

        probe.inject(DeviceEvent::arrival(class(), "a"));
        probe.inject(DeviceEvent::arrival(class(), "b"));
        probe.inject(DeviceEvent::removal(class(), "a"));

        assert!(handler.wait_for(3, Duration::from_secs(5)));
        let paths: Vec<String> = handler.events().into_iter().map(|e| e.path).collect();
        assert_eq!(paths, vec!["a", "b", "a"]);

        bridge.close();
    }

    #[test]
    fn test_install_failure_joins_thread() {
        let (source, probe) = ScriptedSource::new();
        let source = source.fail_install("no sink");
        let handler = Arc::new(RecordingHandler::default());

        let result = NotificationBridge::create(Box::new(source), handler);

        assert!(matches!(result, Err(Error::SinkInstall(_))));
        assert!(probe.install_attempted());
        assert!(!probe.is_alive());
    }

    #[test]
    fn test_bridge_ready_before_return() {
        let (source, probe) = ScriptedSource::new();
        let handler = Arc::new(RecordingHandler::default());
        let bridge = NotificationBridge::create(Box::new(source), handler).unwrap();

        assert!(probe.is_installed());
        assert!(probe.is_alive());

        drop(bridge);
        assert!(!probe.is_alive());
    }

    #[test]
    fn test_handler_panic_does_not_stop_bridge() {
        let (source, probe) = ScriptedSource::new();
        let handler = Arc::new(PanickingHandler {
            inner: RecordingHandler::default(),
        });
        let bridge = NotificationBridge::create(Box::new(source), handler.clone()).unwrap();

        probe.inject(DeviceEvent::arrival(class(), "boom"));
        probe.inject(DeviceEvent::arrival(class(), "after"));

        assert!(handler.inner.wait_for(1, Duration::from_secs(5)));
        assert_eq!(handler.inner.events()[0].path, "after");
        assert!(probe.is_alive());

        bridge.close();
    }

    #[test]
    fn test_no_handler_calls_after_close() {
        let (source, probe) = ScriptedSource::new();
        let handler = Arc::new(RecordingHandler::default());
        let bridge = NotificationBridge::create(Box::new(source), handler.clone()).unwrap();

        probe.inject(DeviceEvent::arrival(class(), "before"));
        assert!(handler.wait_for(1, Duration::from_secs(5)));

        let started = Instant::now();
        bridge.close();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!probe.is_alive());

        probe.inject(DeviceEvent::arrival(class(), "after"));
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(handler.events().len(), 1);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(payload.as_ref()), "owned message");

        let payload: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
