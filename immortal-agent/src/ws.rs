//! WebSocket <-> byte stream bridge for the agent side
//!
//! An upgraded axum WebSocket becomes an ordinary [`Conn`](crate::conn::Conn)
//! backed by a `tokio::io::DuplexStream` pair:
//! - **socket task:** owns the WebSocket, writes inbound frame payloads into
//!   the bridge and sends queued outbound messages
//! - **pump task:** reads from the bridge and queues one binary message per
//!   read
//!
//! The socket is closed once the agent side hits EOF and every
//! [`WsControl`] has been dropped, or as soon as a close frame is queued.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tracing::debug;

/// Bridge buffer between the socket and the agent side
const BRIDGE_BUFFER_SIZE: usize = 64 * 1024;

/// Outbound frame queue depth
const OUTBOUND_QUEUE: usize = 64;

/// Give up on a peer that stops draining frames
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Agent-side view of an upgraded WebSocket
pub struct WsConn {
    inner: DuplexStream,
}

/// Lets the handler refuse an attachment with a specific close code
#[derive(Clone)]
pub struct WsControl {
    tx: mpsc::Sender<WsMessage>,
}

impl WsControl {
    /// Queue a close frame. Bytes already queued are sent first.
    pub async fn close(&self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: reason.to_owned().into(),
        };
        let _ = self.tx.send(WsMessage::Close(Some(frame))).await;
    }
}

/// Bridge an upgraded socket into a byte stream.
pub fn bridge_ws(socket: WebSocket) -> (WsConn, WsControl) {
    let (tx, rx) = mpsc::channel::<WsMessage>(OUTBOUND_QUEUE);
    let (agent_side, bridge_side) = tokio::io::duplex(BRIDGE_BUFFER_SIZE);
    let (bridge_read, bridge_write) = tokio::io::split(bridge_side);

    tokio::spawn(run_socket(socket, rx, bridge_write));
    tokio::spawn(pump_outbound(bridge_read, tx.clone()));

    (WsConn { inner: agent_side }, WsControl { tx })
}

async fn run_socket(
    mut socket: WebSocket,
    mut rx: mpsc::Receiver<WsMessage>,
    mut bridge_write: tokio::io::WriteHalf<DuplexStream>,
) {
    let mut close_sent = false;
    loop {
        tokio::select! {
            frame = socket.recv() => {
                let payload = match frame {
                    Some(Ok(WsMessage::Binary(data))) => data,
                    Some(Ok(WsMessage::Text(text))) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("WebSocket receive failed: {}", e);
                        break;
                    }
                };
                if bridge_write.write_all(&payload).await.is_err() {
                    break;
                }
            }
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                let is_close = matches!(msg, WsMessage::Close(_));
                match tokio::time::timeout(SEND_TIMEOUT, socket.send(msg)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => {
                        debug!("WebSocket send failed or timed out, closing bridge");
                        break;
                    }
                }
                if is_close {
                    close_sent = true;
                    break;
                }
            }
        }
    }

    let _ = bridge_write.shutdown().await;
    if !close_sent {
        let _ = socket.send(WsMessage::Close(None)).await;
    }
}

async fn pump_outbound(
    mut bridge_read: tokio::io::ReadHalf<DuplexStream>,
    tx: mpsc::Sender<WsMessage>,
) {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match bridge_read.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let frame = WsMessage::Binary(Bytes::copy_from_slice(&buf[..n]));
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        }
    }
}

impl AsyncRead for WsConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for WsConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
