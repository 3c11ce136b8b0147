//! Dialer - resolves a port to a local connection
//!
//! [`LocalDialer`] first looks for an in-process listener registered for the
//! port and hands it one end of an in-memory pipe. Otherwise it dials the
//! loopback address.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::conn::BoxConn;

/// Default TCP dial timeout (10 seconds)
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// In-memory pipe buffer for in-process connections (64KB)
const IN_PROCESS_BUFFER_SIZE: usize = 64 * 1024;

/// Pending connections queued per in-process listener
const ACCEPT_BACKLOG: usize = 16;

/// Opens local connections on behalf of the manager.
///
/// A refused dial must surface as `io::ErrorKind::ConnectionRefused`.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial_port(&self, port: u16) -> io::Result<BoxConn>;
}

/// Ports served by listeners living in this process
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    listeners: Arc<Mutex<HashMap<u16, mpsc::Sender<DuplexStream>>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `port`. Fails with `AddrInUse` while another listener holds it.
    pub fn listen(&self, port: u16) -> io::Result<InProcessListener> {
        let mut listeners = self.listeners.lock();
        if listeners.get(&port).is_some_and(|tx| !tx.is_closed()) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("in-process port {port} already registered"),
            ));
        }

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        listeners.insert(port, tx);
        Ok(InProcessListener {
            port,
            rx,
            registry: self.clone(),
        })
    }

    /// `None` if no listener owns `port`
    async fn connect(&self, port: u16) -> Option<io::Result<DuplexStream>> {
        let tx = self.listeners.lock().get(&port).cloned()?;

        let (client, server) = tokio::io::duplex(IN_PROCESS_BUFFER_SIZE);
        if tx.send(server).await.is_err() {
            return Some(Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("in-process listener on port {port} is gone"),
            )));
        }
        Some(Ok(client))
    }

    fn unregister(&self, port: u16) {
        let mut listeners = self.listeners.lock();
        if listeners.get(&port).is_some_and(|tx| tx.is_closed()) {
            listeners.remove(&port);
        }
    }
}

/// Accept side of an in-process port. Unregisters itself on drop.
pub struct InProcessListener {
    port: u16,
    rx: mpsc::Receiver<DuplexStream>,
    registry: ListenerRegistry,
}

impl InProcessListener {
    /// Next incoming connection
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.rx.recv().await
    }
}

impl Drop for InProcessListener {
    fn drop(&mut self) {
        self.rx.close();
        self.registry.unregister(self.port);
    }
}

/// In-process listeners first, then `127.0.0.1:<port>`
pub struct LocalDialer {
    registry: ListenerRegistry,
    timeout: Duration,
}

impl LocalDialer {
    pub fn new(registry: ListenerRegistry) -> Self {
        Self {
            registry,
            timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }
}

impl Default for LocalDialer {
    fn default() -> Self {
        Self::new(ListenerRegistry::new())
    }
}

#[async_trait]
impl Dialer for LocalDialer {
    async fn dial_port(&self, port: u16) -> io::Result<BoxConn> {
        if let Some(result) = self.registry.connect(port).await {
            debug!(port, "Dialed in-process listener");
            return result.map(|conn| Box::new(conn) as BoxConn);
        }

        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(("127.0.0.1", port)))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("dial 127.0.0.1:{port} timed out"),
                )
            })??;
        stream.set_nodelay(true)?;
        debug!(port, "Dialed loopback");
        Ok(Box::new(stream))
    }
}
