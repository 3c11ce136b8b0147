//! Stream - one immortal session
//!
//! Wires a local connection to a [`BackedPipe`] with two copy tasks and a
//! disconnect handler:
//! - pipe -> local: bytes from whichever client is attached
//! - local -> pipe: bytes from the local service, buffered for replay
//! - disconnect handler: stamps `last_disconnection_at`
//!
//! The local connection lives as long as the stream; clients come and go
//! through [`Stream::handle_reconnect`]. When the local service ends its
//! output the stream stays attachable until everything buffered has been
//! drained, after which each attachment sees end-of-stream.

use std::io;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use immortal_proto::{StreamDescriptor, StreamId};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::backed_pipe::{BackedPipe, PipeConfig};
use crate::conn::{is_benign, BoxConn};
use crate::error::{Error, Result};

/// Copy buffer for each direction (32KB)
const COPY_BUFFER_SIZE: usize = 32 * 1024;

struct StreamState {
    started: bool,
    closed: bool,
    last_connection_at: DateTime<Utc>,
    last_disconnection_at: Option<DateTime<Utc>>,
}

pub struct Stream {
    id: StreamId,
    name: String,
    tcp_port: u16,
    created_at: DateTime<Utc>,
    pipe: Arc<BackedPipe>,
    state: Arc<Mutex<StreamState>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    disconnect_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Stream {
    pub fn new(id: StreamId, name: String, tcp_port: u16, config: PipeConfig) -> Self {
        let cancel = CancellationToken::new();
        // Capacity one: concurrent failure reports collapse into one event
        let (disconnect_tx, disconnect_rx) = mpsc::channel(1);
        let pipe = BackedPipe::new(config, cancel.child_token(), Some(disconnect_tx));
        let now = Utc::now();

        Self {
            id,
            name,
            tcp_port,
            created_at: now,
            pipe: Arc::new(pipe),
            state: Arc::new(Mutex::new(StreamState {
                started: false,
                closed: false,
                last_connection_at: now,
                last_disconnection_at: None,
            })),
            cancel,
            tasks: TaskTracker::new(),
            disconnect_rx: Mutex::new(Some(disconnect_rx)),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Take ownership of the local connection and start copying.
    ///
    /// Returns immediately; local I/O failures later surface as a
    /// disconnect, never as an error here.
    pub fn start(&self, local: BoxConn) -> Result<()> {
        let disconnect_rx = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::Closed);
            }
            if state.started {
                return Err(Error::AlreadyStarted);
            }
            state.started = true;
            state.last_connection_at = Utc::now();
            self.disconnect_rx.lock().take()
        };

        let (local_read, local_write) = tokio::io::split(local);

        self.tasks.spawn(pipe_to_local(
            self.id,
            self.pipe.clone(),
            local_write,
            self.cancel.clone(),
        ));
        self.tasks.spawn(local_to_pipe(
            self.id,
            self.pipe.clone(),
            local_read,
            self.cancel.clone(),
        ));
        if let Some(rx) = disconnect_rx {
            self.tasks.spawn(handle_disconnects(
                self.id,
                self.state.clone(),
                rx,
                self.cancel.clone(),
            ));
        }

        debug!(stream_id = %self.id, port = self.tcp_port, "Stream started");
        Ok(())
    }

    /// Attach a new client connection, replaying everything after
    /// `read_seq`. Errors from the pipe are returned as-is.
    pub async fn handle_reconnect(&self, conn: BoxConn, read_seq: u64) -> Result<()> {
        if self.state.lock().closed {
            return Err(Error::Closed);
        }

        self.pipe.accept_reconnection(read_seq, conn).await?;
        self.state.lock().last_connection_at = Utc::now();

        info!(stream_id = %self.id, seq = read_seq, "Client attached");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.pipe.connected()
    }

    /// Writer-side sequence number, sent to reattaching clients
    pub fn writer_sequence_num(&self) -> u64 {
        self.pipe.reader_sequence_num()
    }

    pub fn last_connection_at(&self) -> DateTime<Utc> {
        self.state.lock().last_connection_at
    }

    /// `None` until the first disconnect
    pub fn last_disconnection_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_disconnection_at
    }

    /// Eviction ordering key: the later of creation and last disconnect
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        match self.last_disconnection_at() {
            Some(at) => at.max(self.created_at),
            None => self.created_at,
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Drop the attached client as if its connection had failed
    pub async fn force_disconnect(&self) {
        self.pipe.force_disconnect().await;
    }

    pub fn descriptor(&self) -> StreamDescriptor {
        let connected = self.is_connected();
        let state = self.state.lock();
        StreamDescriptor {
            id: self.id,
            name: self.name.clone(),
            tcp_port: self.tcp_port,
            created_at: self.created_at,
            last_connection_at: state.last_connection_at,
            last_disconnection_at: if connected {
                None
            } else {
                state.last_disconnection_at
            },
        }
    }

    /// Tear down the pipe, the local connection and the background tasks.
    /// Idempotent; returns once every task has exited.
    pub async fn close(&self, reason: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }

        info!(stream_id = %self.id, name = %self.name, reason, "Closing stream");

        // Closing must happen without the state lock: pipe close detaches
        // the client, which reports back into this stream
        self.cancel.cancel();
        self.pipe.close().await;

        self.tasks.close();
        self.tasks.wait().await;
        debug!(stream_id = %self.id, "Stream tasks exited");
        Ok(())
    }
}

/// Task 1: Pipe -> Local (client bytes to the local service)
async fn pipe_to_local(
    id: StreamId,
    pipe: Arc<BackedPipe>,
    mut local: WriteHalf<BoxConn>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            r = pipe.read(&mut buf) => match r {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    report_io_error(id, "pipe read", &e);
                    break;
                }
            },
            _ = cancel.cancelled() => break,
        };

        let written = tokio::select! {
            r = local.write_all(&buf[..n]) => r,
            _ = cancel.cancelled() => break,
        };
        // The output direction is left alone: the local side may still be
        // writing, and local->pipe finishes the pipe when it stops
        if let Err(e) = written {
            report_io_error(id, "local write", &e);
            break;
        }
    }

    let _ = local.shutdown().await;
    debug!(stream_id = %id, "Pipe->Local task exiting");
}

/// Task 2: Local -> Pipe (local service output, buffered for replay)
async fn local_to_pipe(
    id: StreamId,
    pipe: Arc<BackedPipe>,
    mut local: ReadHalf<BoxConn>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    let local_gone = loop {
        let r = tokio::select! {
            r = local.read(&mut buf) => r,
            _ = cancel.cancelled() => break false,
        };
        match r {
            Ok(0) => {
                debug!(stream_id = %id, "Local EOF");
                break true;
            }
            Ok(n) => {
                if let Err(e) = pipe.write_all(&buf[..n]).await {
                    debug!(stream_id = %id, "Pipe write ended: {}", e);
                    break false;
                }
            }
            Err(e) => {
                report_io_error(id, "local read", &e);
                break true;
            }
        }
    };

    if local_gone {
        // Nothing more will ever come from the local side. The pipe stays
        // attachable so a client can still drain the buffered tail.
        pipe.finish().await;
    }
    debug!(stream_id = %id, "Local->Pipe task exiting");
}

/// Task 3: consume coalesced disconnect signals
async fn handle_disconnects(
    id: StreamId,
    state: Arc<Mutex<StreamState>>,
    mut rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            event = rx.recv() => {
                if event.is_none() {
                    break;
                }
                state.lock().last_disconnection_at = Some(Utc::now());
                info!(stream_id = %id, "Client disconnected");
            }
            _ = cancel.cancelled() => break,
        }
    }
}

fn report_io_error(id: StreamId, what: &str, err: &io::Error) {
    if is_benign(err) {
        debug!(stream_id = %id, "{} ended: {}", what, err);
    } else {
        warn!(stream_id = %id, "{} error: {}", what, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::time::timeout;
    use uuid::Uuid;

    const WAIT: Duration = Duration::from_secs(5);

    fn new_stream() -> Stream {
        Stream::new(Uuid::new_v4(), "test-stream".to_string(), 22, PipeConfig::default())
    }

    /// Local service that echoes everything back
    fn echo_service() -> DuplexStream {
        let (local, service) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(service);
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });
        local
    }

    async fn attach(stream: &Stream, read_seq: u64) -> DuplexStream {
        let (agent_end, client_end) = tokio::io::duplex(4096);
        stream
            .handle_reconnect(Box::new(agent_end), read_seq)
            .await
            .unwrap();
        client_end
    }

    async fn roundtrip(client: &mut DuplexStream, data: &[u8]) -> Vec<u8> {
        client.write_all(data).await.unwrap();
        let mut buf = vec![0u8; data.len()];
        timeout(WAIT, client.read_exact(&mut buf))
            .await
            .expect("echo timed out")
            .unwrap();
        buf
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        timeout(WAIT, async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition never became true");
    }

    #[tokio::test]
    async fn test_start_is_not_connected() {
        let stream = new_stream();
        stream.start(Box::new(echo_service())).unwrap();
        assert!(!stream.is_connected());
        assert!(stream.last_disconnection_at().is_none());

        let err = stream.start(Box::new(echo_service())).unwrap_err();
        assert!(matches!(err, Error::AlreadyStarted));
        stream.close("test").await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_resumes_session() {
        let stream = new_stream();
        stream.start(Box::new(echo_service())).unwrap();

        let mut client = attach(&stream, 0).await;
        assert!(stream.is_connected());
        assert_eq!(roundtrip(&mut client, b"hello world").await, b"hello world");

        stream.force_disconnect().await;
        drop(client);
        wait_for(|| stream.last_disconnection_at().is_some()).await;
        assert!(!stream.is_connected());
        assert!(stream.descriptor().last_disconnection_at.is_some());

        // Client has read all 11 bytes: nothing to replay
        let mut client = attach(&stream, 11).await;
        assert_eq!(
            roundtrip(&mut client, b"after reconnect").await,
            b"after reconnect"
        );
        assert_eq!(stream.writer_sequence_num(), 26);
        stream.close("test").await.unwrap();
    }

    #[tokio::test]
    async fn test_replay_of_local_output_before_attach() {
        let (local, mut service) = tokio::io::duplex(4096);
        let stream = new_stream();
        stream.start(Box::new(local)).unwrap();

        service.write_all(b"SSH-2.0-banner\r\n").await.unwrap();
        wait_for(|| stream.writer_sequence_num() == 16).await;

        let mut client = attach(&stream, 0).await;
        let mut buf = [0u8; 16];
        timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"SSH-2.0-banner\r\n");
        stream.close("test").await.unwrap();
    }

    #[tokio::test]
    async fn test_detects_client_drop() {
        let stream = new_stream();
        stream.start(Box::new(echo_service())).unwrap();

        let client = attach(&stream, 0).await;
        drop(client);

        wait_for(|| !stream.is_connected()).await;
        wait_for(|| stream.last_disconnection_at().is_some()).await;
        assert!(stream.last_activity_at() >= stream.created_at());
        stream.close("test").await.unwrap();
    }

    #[tokio::test]
    async fn test_local_eof_ends_client_stream() {
        let (local, service) = tokio::io::duplex(4096);
        let stream = new_stream();
        stream.start(Box::new(local)).unwrap();
        let mut client = attach(&stream, 0).await;

        drop(service);

        let mut buf = [0u8; 8];
        let n = timeout(WAIT, client.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);
        assert!(!stream.is_closed());

        drop(client);
        wait_for(|| !stream.is_connected()).await;
        stream.close("test").await.unwrap();
    }

    #[tokio::test]
    async fn test_local_exit_while_detached_keeps_tail() {
        let (local, mut service) = tokio::io::duplex(4096);
        let stream = new_stream();
        stream.start(Box::new(local)).unwrap();

        service.write_all(b"bye").await.unwrap();
        drop(service);
        wait_for(|| stream.writer_sequence_num() == 3).await;

        let mut client = attach(&stream, 0).await;
        let mut received = Vec::new();
        timeout(WAIT, client.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"bye");

        // Reattaching past the tail still works and ends immediately
        drop(client);
        wait_for(|| !stream.is_connected()).await;
        let mut client = attach(&stream, 3).await;
        let mut rest = Vec::new();
        timeout(WAIT, client.read_to_end(&mut rest)).await.unwrap().unwrap();
        assert!(rest.is_empty());
        stream.close("test").await.unwrap();
    }

    #[tokio::test]
    async fn test_second_client_is_rejected() {
        let stream = new_stream();
        stream.start(Box::new(echo_service())).unwrap();
        let mut client = attach(&stream, 0).await;

        let (other, _other_client) = tokio::io::duplex(64);
        let err = stream
            .handle_reconnect(Box::new(other), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyConnected));
        assert_eq!(roundtrip(&mut client, b"ok").await, b"ok");
        stream.close("test").await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let stream = new_stream();
        stream.start(Box::new(echo_service())).unwrap();
        let _client = attach(&stream, 0).await;

        timeout(WAIT, stream.close("test")).await.unwrap().unwrap();
        assert!(!stream.is_connected());
        stream.close("again").await.unwrap();

        let (conn, _peer) = tokio::io::duplex(64);
        let err = stream.handle_reconnect(Box::new(conn), 0).await.unwrap_err();
        assert!(matches!(err, Error::Closed));
        assert!(matches!(
            stream.start(Box::new(echo_service())).unwrap_err(),
            Error::Closed
        ));
    }
}
