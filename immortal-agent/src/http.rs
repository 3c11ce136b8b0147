//! HTTP control plane and reattachment endpoint
//!
//! - `POST /`         create a stream, `201` with its descriptor
//! - `GET /`          list every stream
//! - `GET /{id}`      one descriptor, or a WebSocket reattachment when the
//!                    request upgrades with the `immortal-stream` subprotocol
//! - `DELETE /{id}`   close and forget a stream, `204`
//!
//! Error bodies never carry internal strings for the not-found, capacity
//! and closed kinds.

use std::future::Future;
use std::io;
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use immortal_proto::{
    parse_sequence_header, parse_stream_id, CreateStreamRequest, ErrorResponse, StreamId,
    READ_SEQUENCE_HEADER, SUBPROTOCOL, WRITE_SEQUENCE_HEADER,
};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::manager::Manager;
use crate::ws::bridge_ws;

/// Build the router around a shared manager.
pub fn router(manager: Arc<Manager>) -> Router {
    Router::new()
        .route("/", get(list_streams).post(create_stream))
        .route("/{id}", get(get_stream).delete(delete_stream))
        .with_state(manager)
}

/// Serve the router until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, manager: Arc<Manager>, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Immortal streams agent listening on http://{}", addr);
    }
    axum::serve(listener, router(manager))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Maps agent errors onto control-plane responses
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = match &self.0 {
            Error::NotFound => ErrorResponse {
                message: "Immortal stream not found".to_string(),
                detail: None,
            },
            Error::TooManyStreams => ErrorResponse {
                message: "Too many immortal streams".to_string(),
                detail: None,
            },
            Error::Closed => ErrorResponse {
                message: "Agent is shutting down".to_string(),
                detail: None,
            },
            Error::ConnectionRefused { port, .. } => ErrorResponse {
                message: format!("The connection was refused on port {}", port),
                detail: Some(self.0.to_string()),
            },
            other => {
                error!("Request failed: {}", other);
                ErrorResponse {
                    message: "Internal error".to_string(),
                    detail: Some(other.to_string()),
                }
            }
        };
        (status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    let body = ErrorResponse {
        message: message.into(),
        detail: None,
    };
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

fn parse_id(raw: &str) -> Result<StreamId, Response> {
    parse_stream_id(raw).map_err(|e| bad_request(e.to_string()))
}

/// Whether the client offered our subprotocol in `Sec-WebSocket-Protocol`
fn offers_subprotocol(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|p| p.trim() == SUBPROTOCOL)
}

async fn create_stream(
    State(manager): State<Arc<Manager>>,
    Json(req): Json<CreateStreamRequest>,
) -> Result<Response, ApiError> {
    let descriptor = manager.create_stream(req.tcp_port).await?;
    Ok((StatusCode::CREATED, Json(descriptor)).into_response())
}

async fn list_streams(State(manager): State<Arc<Manager>>) -> Response {
    Json(manager.list_streams()).into_response()
}

async fn get_stream(
    State(manager): State<Arc<Manager>>,
    Path(raw_id): Path<String>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let id = match parse_id(&raw_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match upgrade {
        Ok(ws) if offers_subprotocol(&headers) => reattach(manager, id, &headers, ws),
        Ok(_) => bad_request(format!("missing {} subprotocol", SUBPROTOCOL)),
        Err(_) => match manager.get_stream(id) {
            Some(stream) => Json(stream.descriptor()).into_response(),
            None => ApiError(Error::NotFound).into_response(),
        },
    }
}

async fn delete_stream(
    State(manager): State<Arc<Manager>>,
    Path(raw_id): Path<String>,
) -> Result<Response, ApiError> {
    let id = match parse_id(&raw_id) {
        Ok(id) => id,
        Err(resp) => return Ok(resp),
    };
    manager.delete_stream(id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

fn reattach(manager: Arc<Manager>, id: StreamId, headers: &HeaderMap, ws: WebSocketUpgrade) -> Response {
    let raw_seq = match headers.get(READ_SEQUENCE_HEADER).map(|v| v.to_str()) {
        None => None,
        Some(Ok(v)) => Some(v),
        Some(Err(_)) => return bad_request("read sequence header is not valid text"),
    };
    let read_seq = match parse_sequence_header(raw_seq) {
        Ok(seq) => seq,
        Err(e) => return bad_request(e.to_string()),
    };

    let write_seq = manager.get_stream(id).map(|s| s.writer_sequence_num());

    let mut response = ws
        .protocols([SUBPROTOCOL])
        .on_upgrade(move |socket| async move {
            let (conn, control) = bridge_ws(socket);
            match manager.handle_connection(id, Box::new(conn), read_seq).await {
                Ok(()) => info!(stream_id = %id, seq = read_seq, "Client reattached"),
                Err(e) => {
                    match &e {
                        Error::NotFound | Error::AlreadyConnected => {
                            debug!(stream_id = %id, "Reattachment refused: {}", e)
                        }
                        _ => warn!(stream_id = %id, "Reattachment failed: {}", e),
                    }
                    control.close(e.close_code(), close_reason(&e)).await;
                }
            }
        });

    if let Some(seq) = write_seq {
        response
            .headers_mut()
            .insert(WRITE_SEQUENCE_HEADER, HeaderValue::from(seq));
    }
    response
}

/// Close reason sent with a refused reattachment
fn close_reason(err: &Error) -> &'static str {
    match err {
        Error::NotFound => "unknown immortal stream",
        Error::AlreadyConnected => "immortal stream already connected",
        Error::SequenceAhead { .. } => "read sequence ahead of stream",
        Error::Closed => "immortal stream closed",
        _ => "internal error",
    }
}
