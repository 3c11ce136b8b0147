//! BackedPipe - sequenced relay between a stable local side and a
//! replaceable remote side
//!
//! The local side (the Stream's copy tasks) calls [`BackedPipe::read`] and
//! [`BackedPipe::write`] for the whole life of the pipe. The remote side is
//! whatever connection was last attached with
//! [`BackedPipe::accept_reconnection`], and may come and go.
//!
//! Every byte written local->remote gets a sequence number and is kept in a
//! bounded [`ReplayBuffer`]. A reattaching remote declares how many bytes it
//! has already consumed and receives everything after that offset before any
//! live data.
//!
//! Replay is best effort at the edge of the window: if the declared offset
//! is older than the oldest byte still buffered, the replay starts at the
//! oldest buffered byte and the gap is lost. Bytes that were never delivered
//! to any remote side are never dropped; `write` suspends instead.
//!
//! Only the local->remote direction is buffered. Bytes the client sends
//! while detached, or that are in flight when a remote side fails, are not
//! recovered; the client is expected to resend.

mod replay_buffer;

pub use replay_buffer::{ReplayBuffer, DEFAULT_REPLAY_BUFFER_SIZE};

use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::conn::{is_benign, BoxConn};
use crate::error::{Error, Result};

/// Upper bound for shutting down a detached remote transport
const REMOTE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeConfig {
    /// Bytes of local->remote history kept for replay
    pub replay_buffer_size: usize,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            replay_buffer_size: DEFAULT_REPLAY_BUFFER_SIZE,
        }
    }
}

type RemoteReader = Arc<AsyncMutex<ReadHalf<BoxConn>>>;
type RemoteWriter = Arc<AsyncMutex<WriteHalf<BoxConn>>>;

/// The currently attached remote side
struct Remote {
    generation: u64,
    reader: RemoteReader,
    writer: RemoteWriter,
    /// Cancelled as soon as this attachment is detached
    detached: CancellationToken,
}

struct PipeState {
    replay: ReplayBuffer,
    /// Highest sequence number handed to some remote side
    delivered_seq: u64,
    /// Read offset declared by the latest attachment
    acknowledged_seq: u64,
    remote: Option<Remote>,
    generation: u64,
    /// The local side will write nothing more
    finished: bool,
    closed: bool,
}

pub struct BackedPipe {
    state: Mutex<PipeState>,
    /// Woken on attach, detach and close
    changed: Notify,
    /// Serializes local writes so buffer order matches wire order
    write_lock: AsyncMutex<()>,
    cancel: CancellationToken,
    disconnect_tx: Option<mpsc::Sender<()>>,
}

impl BackedPipe {
    /// Create a detached pipe.
    ///
    /// `cancel` wakes every task blocked in pipe I/O when cancelled.
    /// `disconnect_tx` receives a coalesced signal whenever a remote side
    /// is detached; the send never blocks.
    pub fn new(
        config: PipeConfig,
        cancel: CancellationToken,
        disconnect_tx: Option<mpsc::Sender<()>>,
    ) -> Self {
        Self {
            state: Mutex::new(PipeState {
                replay: ReplayBuffer::new(config.replay_buffer_size),
                delivered_seq: 0,
                acknowledged_seq: 0,
                remote: None,
                generation: 0,
                finished: false,
                closed: false,
            }),
            changed: Notify::new(),
            write_lock: AsyncMutex::new(()),
            cancel,
            disconnect_tx,
        }
    }

    /// True while a remote side is attached and has not been seen to fail
    pub fn connected(&self) -> bool {
        let state = self.state.lock();
        !state.closed && state.remote.is_some()
    }

    /// Writer-side sequence number: total bytes written local->remote.
    ///
    /// This is where replay ends, so a client without prior state can align
    /// its counters with it.
    pub fn reader_sequence_num(&self) -> u64 {
        self.state.lock().replay.end_seq()
    }

    /// Read offset declared by the most recent attachment
    pub fn acknowledged_sequence_num(&self) -> u64 {
        self.state.lock().acknowledged_seq
    }

    /// Attach `conn` as the new remote side and replay everything after
    /// `read_seq`.
    ///
    /// Fails with [`Error::AlreadyConnected`] while another remote side is
    /// alive, [`Error::Closed`] after [`BackedPipe::close`], and
    /// [`Error::SequenceAhead`] if `read_seq` is beyond the writer sequence.
    /// Returns once the replay has been written; live writes follow it.
    pub async fn accept_reconnection(&self, read_seq: u64, conn: BoxConn) -> Result<()> {
        let (reader, writer) = tokio::io::split(conn);
        let writer: RemoteWriter = Arc::new(AsyncMutex::new(writer));
        // Held until the replay is out so live writes queue behind it
        let mut replay_guard = writer.clone().lock_owned().await;

        let (generation, start, replay, detached) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::Closed);
            }
            if state.remote.is_some() {
                return Err(Error::AlreadyConnected);
            }
            let written = state.replay.end_seq();
            if read_seq > written {
                return Err(Error::SequenceAhead {
                    read: read_seq,
                    written,
                });
            }

            state.generation += 1;
            let generation = state.generation;
            let (start, replay) = state.replay.since(read_seq);
            let detached = self.cancel.child_token();
            state.remote = Some(Remote {
                generation,
                reader: Arc::new(AsyncMutex::new(reader)),
                writer: writer.clone(),
                detached: detached.clone(),
            });
            state.acknowledged_seq = read_seq;
            (generation, start, replay, detached)
        };
        self.changed.notify_waiters();

        if start > read_seq {
            warn!(
                requested = read_seq,
                oldest = start,
                "Replay window exceeded, resuming from oldest buffered byte"
            );
        }

        let end = start + replay.len() as u64;
        if !replay.is_empty() {
            let result = tokio::select! {
                r = async {
                    replay_guard.write_all(&replay).await?;
                    replay_guard.flush().await
                } => r,
                _ = detached.cancelled() => Err(io::Error::from(io::ErrorKind::NotConnected)),
            };

            if let Err(e) = result {
                drop(replay_guard);
                self.detach(generation).await;
                if self.cancel.is_cancelled() {
                    return Err(Error::Closed);
                }
                return Err(Error::Io(e));
            }
        }

        // The local side may have finished while the replay was in flight;
        // whoever sees both the flag and the full delivery ends the stream
        if self.mark_delivered(end) {
            debug!(generation, "Local side finished, ending remote stream");
            let _ = replay_guard.shutdown().await;
        }
        drop(replay_guard);

        debug!(generation, start, end, "Remote side attached");
        Ok(())
    }

    /// Local read path: bytes arriving from the attached remote side.
    ///
    /// Suspends while no remote side is attached. A failing remote side is
    /// detached and the read keeps waiting for the next one. Returns `Ok(0)`
    /// once the pipe is closed.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let attached = {
                let state = self.state.lock();
                if state.closed {
                    return Ok(0);
                }
                state
                    .remote
                    .as_ref()
                    .map(|r| (r.generation, r.reader.clone(), r.detached.clone()))
            };

            let Some((generation, reader, detached)) = attached else {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = self.cancel.cancelled() => return Ok(0),
                }
                continue;
            };

            let result = {
                let mut reader = tokio::select! {
                    guard = reader.lock() => guard,
                    _ = detached.cancelled() => continue,
                };
                tokio::select! {
                    r = reader.read(buf) => Some(r),
                    _ = detached.cancelled() => None,
                }
            };

            match result {
                Some(Ok(0)) => {
                    debug!(generation, "Remote side closed");
                    self.detach(generation).await;
                }
                Some(Ok(n)) => return Ok(n),
                Some(Err(e)) => {
                    if is_benign(&e) {
                        debug!(generation, "Remote read ended: {}", e);
                    } else {
                        warn!(generation, "Remote read error: {}", e);
                    }
                    self.detach(generation).await;
                }
                // Detached by someone else
                None => {}
            }
        }
    }

    /// Local write path: buffer `data` for replay and forward it to the
    /// attached remote side.
    ///
    /// Never buffers over bytes that no remote side has received, so it
    /// suspends while those fill the buffer, attached (replay in flight) or
    /// not. While attached, it then waits for the remote side to accept the
    /// bytes. A remote failure detaches the remote side but is not an error
    /// here: the bytes stay buffered for the next attachment. Fails only
    /// once the pipe is closed or finished. May write fewer bytes than given.
    pub async fn write(&self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let _serial = tokio::select! {
            guard = self.write_lock.lock() => guard,
            _ = self.cancel.cancelled() => return Err(pipe_closed()),
        };

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let forward = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                if state.closed || state.finished {
                    return Err(pipe_closed());
                }
                // Never push over bytes no remote side has received yet,
                // including a replay that is still in flight
                let pending = (state.replay.end_seq() - state.delivered_seq) as usize;
                let room = state.replay.capacity().saturating_sub(pending);
                match &state.remote {
                    _ if room == 0 => None,
                    Some(remote) => {
                        let chunk = &data[..data.len().min(room)];
                        state.replay.push(chunk);
                        Some((
                            remote.generation,
                            remote.writer.clone(),
                            remote.detached.clone(),
                            chunk,
                            state.replay.end_seq(),
                        ))
                    }
                    None => {
                        let n = data.len().min(room);
                        state.replay.push(&data[..n]);
                        return Ok(n);
                    }
                }
            };

            let Some((generation, writer, detached, chunk, end)) = forward else {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = self.cancel.cancelled() => return Err(pipe_closed()),
                }
                continue;
            };

            let result = {
                let mut writer = tokio::select! {
                    guard = writer.lock() => guard,
                    _ = detached.cancelled() => return Ok(chunk.len()),
                };
                tokio::select! {
                    r = async {
                        writer.write_all(chunk).await?;
                        writer.flush().await
                    } => r,
                    _ = detached.cancelled() => return Ok(chunk.len()),
                }
            };

            match result {
                Ok(()) => {
                    if self.mark_delivered(end) {
                        shutdown_remote(&writer).await;
                    }
                }
                Err(e) => {
                    if is_benign(&e) {
                        debug!(generation, "Remote write ended: {}", e);
                    } else {
                        warn!(generation, "Remote write error: {}", e);
                    }
                    self.detach(generation).await;
                }
            }
            return Ok(chunk.len());
        }
    }

    /// Write all of `data`, waiting for buffer room as needed
    pub async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let n = self.write(data).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Detach the current remote side as if it had failed
    pub async fn force_disconnect(&self) {
        let generation = self.state.lock().remote.as_ref().map(|r| r.generation);
        if let Some(generation) = generation {
            self.detach(generation).await;
        }
    }

    /// The local side hit end-of-stream: no more writes will come.
    ///
    /// The pipe stays attachable so a client that was away still gets the
    /// buffered tail. Each remote side is shut down once everything has
    /// been delivered to it, which the client reads as end-of-stream.
    pub async fn finish(&self) {
        let writer = {
            let mut state = self.state.lock();
            if state.closed || state.finished {
                return;
            }
            state.finished = true;
            match &state.remote {
                Some(remote) if state.delivered_seq == state.replay.end_seq() => {
                    Some(remote.writer.clone())
                }
                _ => None,
            }
        };
        self.changed.notify_waiters();

        if let Some(writer) = writer {
            shutdown_remote(&writer).await;
        }
        debug!("Local side finished");
    }

    /// Close the pipe. Idempotent.
    ///
    /// Detaches and shuts down any remote side and wakes blocked readers
    /// (with end-of-stream) and writers (with an error).
    pub async fn close(&self) {
        let remote = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.remote.take()
        };
        self.cancel.cancel();
        self.changed.notify_waiters();

        if let Some(remote) = remote {
            remote.detached.cancel();
            shutdown_remote(&remote.writer).await;
        }
        debug!("Backed pipe closed");
    }

    /// Record delivery up to `end` and wake writers waiting for room.
    /// Returns true if the local side is finished and nothing is left to
    /// deliver.
    fn mark_delivered(&self, end: u64) -> bool {
        let done = {
            let mut state = self.state.lock();
            state.delivered_seq = state.delivered_seq.max(end);
            state.finished && state.delivered_seq == state.replay.end_seq()
        };
        self.changed.notify_waiters();
        done
    }

    /// Detach the remote side if it is still `generation`. Stale reports
    /// from an already replaced attachment are ignored.
    async fn detach(&self, generation: u64) -> bool {
        let remote = {
            let mut state = self.state.lock();
            match &state.remote {
                Some(r) if r.generation == generation => state.remote.take(),
                _ => None,
            }
        };
        let Some(remote) = remote else {
            return false;
        };

        remote.detached.cancel();
        self.changed.notify_waiters();
        if let Some(tx) = &self.disconnect_tx {
            // Capacity one: a pending signal already says the same thing
            let _ = tx.try_send(());
        }
        debug!(generation, "Remote side detached");

        shutdown_remote(&remote.writer).await;
        true
    }
}

async fn shutdown_remote(writer: &RemoteWriter) {
    let shutdown = async {
        let mut writer = writer.lock().await;
        let _ = writer.shutdown().await;
    };
    if tokio::time::timeout(REMOTE_SHUTDOWN_TIMEOUT, shutdown).await.is_err() {
        debug!("Timed out shutting down remote side");
    }
}

fn pipe_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "backed pipe closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn new_pipe(capacity: usize) -> (Arc<BackedPipe>, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        let config = PipeConfig {
            replay_buffer_size: capacity,
        };
        let pipe = BackedPipe::new(config, CancellationToken::new(), Some(tx));
        (Arc::new(pipe), rx)
    }

    async fn attach(pipe: &BackedPipe, read_seq: u64) -> DuplexStream {
        let (agent_end, client_end) = tokio::io::duplex(4096);
        pipe.accept_reconnection(read_seq, Box::new(agent_end))
            .await
            .unwrap();
        client_end
    }

    async fn read_exact(client: &mut DuplexStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        timeout(WAIT, client.read_exact(&mut buf))
            .await
            .expect("read timed out")
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn test_new_pipe_is_detached() {
        let (pipe, _rx) = new_pipe(64);
        assert!(!pipe.connected());
        assert_eq!(pipe.reader_sequence_num(), 0);
    }

    #[tokio::test]
    async fn test_replay_of_bytes_written_while_detached() {
        let (pipe, _rx) = new_pipe(64);

        pipe.write_all(b"hello world").await.unwrap();
        assert_eq!(pipe.reader_sequence_num(), 11);

        let mut client = attach(&pipe, 0).await;
        assert!(pipe.connected());

        pipe.write_all(b"!").await.unwrap();
        assert_eq!(read_exact(&mut client, 12).await, b"hello world!");
    }

    #[tokio::test]
    async fn test_partial_replay_resumes_at_declared_offset() {
        let (pipe, _rx) = new_pipe(64);
        let mut client = attach(&pipe, 0).await;

        pipe.write_all(b"hello world").await.unwrap();
        assert_eq!(read_exact(&mut client, 5).await, b"hello");

        pipe.force_disconnect().await;
        assert!(!pipe.connected());
        drop(client);

        let mut client = attach(&pipe, 5).await;
        assert_eq!(pipe.acknowledged_sequence_num(), 5);
        pipe.write_all(b"#").await.unwrap();
        assert_eq!(read_exact(&mut client, 7).await, b" world#");
    }

    #[tokio::test]
    async fn test_replay_is_best_effort_past_window() {
        let (pipe, _rx) = new_pipe(4);
        let mut client = attach(&pipe, 0).await;

        pipe.write_all(b"abcdefgh").await.unwrap();
        assert_eq!(read_exact(&mut client, 8).await, b"abcdefgh");
        pipe.force_disconnect().await;

        let mut client = attach(&pipe, 0).await;
        pipe.write_all(b"i").await.unwrap();
        assert_eq!(read_exact(&mut client, 5).await, b"efghi");
    }

    #[tokio::test]
    async fn test_second_attachment_is_rejected() {
        let (pipe, _rx) = new_pipe(64);
        let mut client = attach(&pipe, 0).await;

        let (other, _other_client) = tokio::io::duplex(64);
        let err = pipe
            .accept_reconnection(0, Box::new(other))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyConnected));

        // The first attachment is untouched
        assert!(pipe.connected());
        pipe.write_all(b"still here").await.unwrap();
        assert_eq!(read_exact(&mut client, 10).await, b"still here");
    }

    #[tokio::test]
    async fn test_sequence_ahead_is_rejected() {
        let (pipe, _rx) = new_pipe(64);
        pipe.write_all(b"abc").await.unwrap();

        let (conn, _client) = tokio::io::duplex(64);
        let err = pipe
            .accept_reconnection(4, Box::new(conn))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SequenceAhead { read: 4, written: 3 }));
        assert!(!pipe.connected());
    }

    #[tokio::test]
    async fn test_remote_to_local_read() {
        let (pipe, _rx) = new_pipe(64);
        let mut client = attach(&pipe, 0).await;

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = timeout(WAIT, pipe.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test]
    async fn test_read_blocks_until_close() {
        let (pipe, _rx) = new_pipe(64);

        let reader = pipe.clone();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            reader.read(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        pipe.close().await;
        let n = timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_remote_eof_detaches_and_signals() {
        let (pipe, mut rx) = new_pipe(64);
        let client = attach(&pipe, 0).await;

        let reader = pipe.clone();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            reader.read(&mut buf).await
        });

        drop(client);
        timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert!(!pipe.connected());
        // The reader keeps waiting for the next attachment
        assert!(!handle.is_finished());

        pipe.close().await;
        assert_eq!(timeout(WAIT, handle).await.unwrap().unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_suspends_when_buffer_full() {
        let (pipe, _rx) = new_pipe(4);

        assert_eq!(pipe.write(b"abcdef").await.unwrap(), 4);

        let writer = pipe.clone();
        let handle = tokio::spawn(async move { writer.write_all(b"ef").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        let mut client = attach(&pipe, 0).await;
        timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
        assert_eq!(read_exact(&mut client, 6).await, b"abcdef");
    }

    #[tokio::test]
    async fn test_live_write_waits_for_inflight_replay() {
        let (pipe, _rx) = new_pipe(8);
        pipe.write_all(b"abcdefgh").await.unwrap();

        // A tiny transport keeps the replay stuck mid-way
        let (agent_end, slow_client) = tokio::io::duplex(2);
        let attacher = pipe.clone();
        let replay = tokio::spawn(async move {
            attacher.accept_reconnection(0, Box::new(agent_end)).await
        });
        timeout(WAIT, async {
            while !pipe.connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let writer = pipe.clone();
        let live = tokio::spawn(async move { writer.write_all(b"XYZ").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!live.is_finished());

        drop(slow_client);
        assert!(timeout(WAIT, replay).await.unwrap().unwrap().is_err());
        assert!(!pipe.connected());

        let mut client = attach(&pipe, 0).await;
        timeout(WAIT, live).await.unwrap().unwrap().unwrap();
        assert_eq!(read_exact(&mut client, 11).await, b"abcdefghXYZ");
    }

    #[tokio::test]
    async fn test_finished_pipe_replays_tail_then_ends() {
        let (pipe, _rx) = new_pipe(64);
        pipe.write_all(b"bye").await.unwrap();
        pipe.finish().await;
        assert!(pipe.write(b"late").await.is_err());
        assert!(!pipe.state.lock().closed);

        let mut client = attach(&pipe, 0).await;
        let mut received = Vec::new();
        timeout(WAIT, client.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"bye");
    }

    #[tokio::test]
    async fn test_finish_ends_attached_remote() {
        let (pipe, _rx) = new_pipe(64);
        let mut client = attach(&pipe, 0).await;

        pipe.write_all(b"last words").await.unwrap();
        pipe.finish().await;
        pipe.finish().await;

        let mut received = Vec::new();
        timeout(WAIT, client.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"last words");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_terminal() {
        let (pipe, _rx) = new_pipe(64);
        let _client = attach(&pipe, 0).await;

        pipe.close().await;
        pipe.close().await;
        assert!(!pipe.connected());
        assert!(pipe.state.lock().closed);

        assert!(pipe.write(b"late").await.is_err());
        let mut buf = [0u8; 4];
        assert_eq!(pipe.read(&mut buf).await.unwrap(), 0);

        let (conn, _other) = tokio::io::duplex(64);
        let err = pipe
            .accept_reconnection(0, Box::new(conn))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed));
    }
}
