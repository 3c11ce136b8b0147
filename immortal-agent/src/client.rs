//! Client for the agent's HTTP/WebSocket surface
//!
//! - [`Client`] wraps the JSON control plane and opens attachments
//! - [`Attachment`] is one live WebSocket carried as a byte stream
//! - [`ResumableSession`] counts consumed bytes so every reattachment
//!   replays exactly the unread tail

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{SinkExt, StreamExt};
use immortal_proto::{
    CreateStreamRequest, ErrorResponse, StreamDescriptor, StreamId, READ_SEQUENCE_HEADER,
    SUBPROTOCOL, WRITE_SEQUENCE_HEADER,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::connect_async;
use tracing::debug;
use url::Url;

use crate::conn::BoxConn;

/// Buffer between the WebSocket tasks and the caller
const BRIDGE_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid agent URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// The agent answered with a non-success status
    #[error("agent returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid header value: {0}")]
    InvalidHeader(String),
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Close frame received from the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteClose {
    pub code: u16,
    pub reason: String,
}

/// One live attachment to a stream
pub struct Attachment {
    /// Agent's writer-side sequence at handshake time, if it knew the stream
    pub write_sequence: Option<u64>,
    /// Raw stream bytes in both directions
    pub conn: BoxConn,
    closed: oneshot::Receiver<Option<RemoteClose>>,
}

impl Attachment {
    /// Split into the byte stream and a future resolving to the agent's
    /// close frame once the socket ends.
    pub fn into_parts(self) -> (BoxConn, CloseNotice) {
        (self.conn, CloseNotice(self.closed))
    }
}

/// Resolves when the attachment's socket has ended
pub struct CloseNotice(oneshot::Receiver<Option<RemoteClose>>);

impl CloseNotice {
    pub async fn wait(self) -> Option<RemoteClose> {
        self.0.await.ok().flatten()
    }
}

#[derive(Clone)]
pub struct Client {
    base: Url,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str) -> ClientResult<Self> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            base,
            http: reqwest::Client::new(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn stream_url(&self, id: StreamId) -> ClientResult<Url> {
        Ok(self.base.join(&id.to_string())?)
    }

    pub async fn create_stream(&self, tcp_port: u16) -> ClientResult<StreamDescriptor> {
        let resp = self
            .http
            .post(self.base.clone())
            .json(&CreateStreamRequest { tcp_port })
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    pub async fn list_streams(&self) -> ClientResult<Vec<StreamDescriptor>> {
        let resp = self.http.get(self.base.clone()).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    pub async fn get_stream(&self, id: StreamId) -> ClientResult<StreamDescriptor> {
        let resp = self.http.get(self.stream_url(id)?).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    pub async fn delete_stream(&self, id: StreamId) -> ClientResult<()> {
        let resp = self.http.delete(self.stream_url(id)?).send().await?;
        check(resp).await?;
        Ok(())
    }

    /// Open a WebSocket to `id`, declaring `read_seq` bytes already consumed.
    pub async fn attach(&self, id: StreamId, read_seq: u64) -> ClientResult<Attachment> {
        let mut url = self.stream_url(id)?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::InvalidHeader(format!("cannot use scheme {}", scheme)))?;

        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(SUBPROTOCOL),
        );
        headers.insert(READ_SEQUENCE_HEADER, HeaderValue::from(read_seq));

        let (ws, response) = match connect_async(request).await {
            Ok(pair) => pair,
            Err(tungstenite::Error::Http(resp)) => {
                let status = resp.status().as_u16();
                let message = resp
                    .body()
                    .as_deref()
                    .map(error_message)
                    .unwrap_or_default();
                return Err(ClientError::Status { status, message });
            }
            Err(e) => return Err(e.into()),
        };

        let write_sequence = response
            .headers()
            .get(WRITE_SEQUENCE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        debug!(stream_id = %id, read_seq, ?write_sequence, "Attached to stream");

        let (conn, closed) = bridge_client_ws(ws);
        Ok(Attachment {
            write_sequence,
            conn,
            closed,
        })
    }
}

async fn check(resp: reqwest::Response) -> ClientResult<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.bytes().await.unwrap_or_default();
    Err(ClientError::Status {
        status,
        message: error_message(&body),
    })
}

fn error_message(body: &[u8]) -> String {
    match serde_json::from_slice::<ErrorResponse>(body) {
        Ok(err) => err.message,
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    }
}

type ClientWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Shuttle binary frames between `ws` and a duplex pair.
fn bridge_client_ws(ws: ClientWs) -> (BoxConn, oneshot::Receiver<Option<RemoteClose>>) {
    let (caller_side, bridge_side) = tokio::io::duplex(BRIDGE_BUFFER_SIZE);
    let (mut bridge_read, mut bridge_write) = tokio::io::split(bridge_side);
    let (mut sink, mut source) = ws.split();
    let (close_tx, close_rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut remote_close = None;
        while let Some(msg) = source.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    if bridge_write.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Text(text)) => {
                    if bridge_write.write_all(text.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(frame)) => {
                    remote_close = frame.map(|f| RemoteClose {
                        code: u16::from(f.code),
                        reason: f.reason.into_owned(),
                    });
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("WebSocket read error: {}", e);
                    break;
                }
            }
        }
        let _ = bridge_write.shutdown().await;
        let _ = close_tx.send(remote_close);
    });

    tokio::spawn(async move {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match bridge_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if sink.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                        return;
                    }
                }
            }
        }
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    });

    (Box::new(caller_side), close_rx)
}

/// A stream the caller keeps reading across reattachments
pub struct ResumableSession {
    client: Client,
    id: StreamId,
    bytes_read: Arc<AtomicU64>,
}

impl ResumableSession {
    pub fn new(client: Client, id: StreamId) -> Self {
        Self {
            client,
            id,
            bytes_read: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Bytes handed to the caller so far, across every attachment
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Acquire)
    }

    /// Reattach, asking the agent to replay everything after
    /// [`bytes_read`](Self::bytes_read).
    pub async fn connect(&self) -> ClientResult<SessionConn> {
        let attachment = self.client.attach(self.id, self.bytes_read()).await?;
        Ok(SessionConn {
            inner: attachment.conn,
            bytes_read: self.bytes_read.clone(),
            write_sequence: attachment.write_sequence,
        })
    }
}

/// Attachment that counts consumed bytes into its session
pub struct SessionConn {
    inner: BoxConn,
    bytes_read: Arc<AtomicU64>,
    write_sequence: Option<u64>,
}

impl SessionConn {
    pub fn write_sequence(&self) -> Option<u64> {
        self.write_sequence
    }
}

impl AsyncRead for SessionConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let n = (buf.filled().len() - before) as u64;
            self.bytes_read.fetch_add(n, Ordering::AcqRel);
        }
        poll
    }
}

impl AsyncWrite for SessionConn {
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
