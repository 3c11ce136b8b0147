//! Manager - capacity-bounded registry of immortal streams
//!
//! Streams are keyed by id. When the registry is full, the disconnected
//! stream with the oldest activity (creation or last disconnect, whichever
//! is later) is evicted to make room. Connected streams are never evicted.
//!
//! The registry lock only guards map mutation and victim selection. Dialing,
//! starting and closing streams happen outside it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use immortal_proto::{StreamDescriptor, StreamId};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backed_pipe::PipeConfig;
use crate::conn::BoxConn;
use crate::dialer::Dialer;
use crate::error::{Error, Result};
use crate::names::generate_name;
use crate::stream::Stream;

/// Default maximum number of live streams
pub const MAX_STREAMS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    pub max_streams: usize,
    pub pipe: PipeConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_streams: MAX_STREAMS,
            pipe: PipeConfig::default(),
        }
    }
}

/// Outcome of one pass over the registry during creation
enum Slot {
    Reserved(Arc<Stream>),
    Evict(Arc<Stream>),
    Full,
    Closed,
}

struct Registry {
    streams: HashMap<StreamId, Arc<Stream>>,
    closed: bool,
}

impl Registry {
    fn reserve(&mut self, tcp_port: u16, config: &ManagerConfig) -> Slot {
        if self.closed {
            return Slot::Closed;
        }

        if self.streams.len() < config.max_streams {
            let name = {
                let taken: HashSet<&str> = self.streams.values().map(|s| s.name()).collect();
                generate_name(&mut rand::thread_rng(), &taken)
            };
            let stream = Arc::new(Stream::new(Uuid::new_v4(), name, tcp_port, config.pipe));
            self.streams.insert(stream.id(), stream.clone());
            return Slot::Reserved(stream);
        }

        match self.oldest_disconnected() {
            Some(id) => match self.streams.remove(&id) {
                Some(victim) => Slot::Evict(victim),
                None => Slot::Full,
            },
            None => Slot::Full,
        }
    }

    /// Disconnected stream with the smallest activity timestamp. Ties go to
    /// the smaller id so the choice does not depend on map order.
    fn oldest_disconnected(&self) -> Option<StreamId> {
        self.streams
            .values()
            // Unstarted streams belong to a creation still in flight
            .filter(|s| s.is_started() && !s.is_connected())
            .min_by_key(|s| (s.last_activity_at(), s.id()))
            .map(|s| s.id())
    }
}

pub struct Manager {
    registry: Mutex<Registry>,
    dialer: Arc<dyn Dialer>,
    config: ManagerConfig,
}

impl Manager {
    pub fn new(dialer: Arc<dyn Dialer>, config: ManagerConfig) -> Self {
        Self {
            registry: Mutex::new(Registry {
                streams: HashMap::new(),
                closed: false,
            }),
            dialer,
            config,
        }
    }

    /// Dial `tcp_port`, register a new stream for it and start it.
    ///
    /// Evicts at most one disconnected stream per pass when full; fails with
    /// [`Error::TooManyStreams`] when every registered stream is connected.
    pub async fn create_stream(&self, tcp_port: u16) -> Result<StreamDescriptor> {
        if self.registry.lock().closed {
            return Err(Error::Closed);
        }

        let local = self.dialer.dial_port(tcp_port).await.map_err(|e| {
            let err = Error::from_dial(tcp_port, e);
            warn!(port = tcp_port, "Failed to dial local service: {}", err);
            err
        })?;

        let stream = loop {
            let slot = self.registry.lock().reserve(tcp_port, &self.config);
            match slot {
                Slot::Reserved(stream) => break stream,
                Slot::Evict(victim) => {
                    info!(
                        stream_id = %victim.id(),
                        name = %victim.name(),
                        "Evicting disconnected stream to make room"
                    );
                    if let Err(e) = victim.close("evicted").await {
                        warn!(stream_id = %victim.id(), "Failed to close evicted stream: {}", e);
                    }
                }
                Slot::Full => {
                    warn!(port = tcp_port, max = self.config.max_streams, "Too many streams");
                    close_conn(local).await;
                    return Err(Error::TooManyStreams);
                }
                Slot::Closed => {
                    close_conn(local).await;
                    return Err(Error::Closed);
                }
            }
        };

        if let Err(e) = stream.start(local) {
            self.registry.lock().streams.remove(&stream.id());
            return Err(e);
        }

        info!(
            stream_id = %stream.id(),
            name = %stream.name(),
            port = tcp_port,
            "Created immortal stream"
        );
        Ok(stream.descriptor())
    }

    pub fn get_stream(&self, id: StreamId) -> Option<Arc<Stream>> {
        self.registry.lock().streams.get(&id).cloned()
    }

    /// Snapshot of every registered stream
    pub fn list_streams(&self) -> Vec<StreamDescriptor> {
        let streams: Vec<Arc<Stream>> = self.registry.lock().streams.values().cloned().collect();
        streams.iter().map(|s| s.descriptor()).collect()
    }

    pub fn len(&self) -> usize {
        self.registry.lock().streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn delete_stream(&self, id: StreamId) -> Result<()> {
        let stream = self
            .registry
            .lock()
            .streams
            .remove(&id)
            .ok_or(Error::NotFound)?;

        stream.close("deleted").await?;
        info!(stream_id = %id, "Deleted immortal stream");
        Ok(())
    }

    /// Route a reattaching client to its stream
    pub async fn handle_connection(&self, id: StreamId, conn: BoxConn, read_seq: u64) -> Result<()> {
        let stream = self.get_stream(id).ok_or(Error::NotFound)?;
        stream.handle_reconnect(conn, read_seq).await
    }

    /// Refuse further creation and close every stream concurrently.
    ///
    /// Returns the first close error after all streams are closed.
    pub async fn close(&self) -> Result<()> {
        let streams: Vec<Arc<Stream>> = {
            let mut registry = self.registry.lock();
            registry.closed = true;
            registry.streams.drain().map(|(_, s)| s).collect()
        };
        if streams.is_empty() {
            return Ok(());
        }

        debug!(count = streams.len(), "Closing all streams");
        let results = join_all(streams.iter().map(|s| s.close("agent shutting down"))).await;
        results.into_iter().collect()
    }
}

async fn close_conn(mut conn: BoxConn) {
    let _ = conn.shutdown().await;
}
