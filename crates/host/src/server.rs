//! Control and streaming listeners
//!
//! The supervisor only needs three things from a server: start it, stop it,
//! and ask how many clients are connected. [`ListenerServer`] accepts TCP
//! clients on a tokio runtime and tracks them; the payload protocol is
//! handled by whatever sits behind the connection.

use anyhow::{Context, Result};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Server contract consumed by the supervisor
pub trait ConnectionServer: Send {
    fn name(&self) -> &str;

    fn start(&mut self) -> Result<()>;

    /// Stop accepting and close existing connections. Idempotent.
    fn stop(&mut self);

    fn active_connections(&self) -> usize;
}

/// Decrements the live connection count when a connection task ends
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Source of incoming connections for the accept loop
trait Acceptor: Send + Sync + 'static {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Acceptor for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

/// TCP listener that counts connected clients
pub struct ListenerServer {
    name: String,
    bind_addr: String,
    runtime: Handle,
    connections: Arc<AtomicUsize>,
    shutdown_tx: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl ListenerServer {
    pub fn new(name: impl Into<String>, bind_addr: impl Into<String>, runtime: Handle) -> Self {
        Self {
            name: name.into(),
            bind_addr: bind_addr.into(),
            runtime,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx: None,
            accept_task: None,
            local_addr: None,
        }
    }

    /// Bound address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    async fn accept_loop<A: Acceptor>(
        name: String,
        listener: A,
        connections: Arc<AtomicUsize>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("{} server: client connected from {}", name, peer);
                        let guard = ConnectionGuard::new(connections.clone());
                        tokio::spawn(Self::serve(stream, guard, shutdown_rx.clone()));
                    }
                    Err(e) => {
                        warn!("{} server: accept failed: {}", name, e);
                        // Back off so a persistent error such as EMFILE does not spin.
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }
        debug!("{} server: accept loop stopped", name);
    }

    /// Hold the connection open until the peer or the server closes it
    async fn serve(
        mut stream: TcpStream,
        _guard: ConnectionGuard,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                read = stream.read(&mut buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                },
            }
        }
    }
}

impl ConnectionServer for ListenerServer {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<()> {
        if self.accept_task.is_some() {
            return Ok(());
        }

        let std_listener = std::net::TcpListener::bind(&self.bind_addr).with_context(|| {
            format!("Failed to bind {} server to {}", self.name, self.bind_addr)
        })?;
        std_listener
            .set_nonblocking(true)
            .context("Failed to make listener non-blocking")?;
        let local_addr = std_listener.local_addr()?;

        let listener = {
            let _enter = self.runtime.enter();
            TcpListener::from_std(std_listener).context("Failed to register listener")?
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = self.runtime.spawn(Self::accept_loop(
            self.name.clone(),
            listener,
            self.connections.clone(),
            shutdown_rx,
        ));

        info!("{} server listening on {}", self.name, local_addr);
        self.shutdown_tx = Some(shutdown_tx);
        self.accept_task = Some(task);
        self.local_addr = Some(local_addr);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Some(task) = self.accept_task.take() {
            task.abort();
            info!("{} server stopped", self.name);
        }
    }

    fn active_connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for ListenerServer {
    fn drop(&mut self) {
        self.stop();
    }
}
