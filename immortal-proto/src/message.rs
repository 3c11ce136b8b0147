//! Immortal Streams Wire Types
//!
//! Control plane (JSON over HTTP):
//! - CREATE: `POST /` with [`CreateStreamRequest`], answers a [`StreamDescriptor`]
//! - LIST:   `GET /`, answers `[StreamDescriptor]`
//! - GET:    `GET /{id}`, answers a [`StreamDescriptor`]
//! - DELETE: `DELETE /{id}`
//!
//! Data plane: `GET /{id}` upgraded to a WebSocket with the
//! [`SUBPROTOCOL`] token. The client declares how many local->client bytes
//! it has already consumed in [`READ_SEQUENCE_HEADER`]; the agent answers
//! with its writer-side sequence in [`WRITE_SEQUENCE_HEADER`]. After the
//! upgrade every binary message carries raw stream bytes, nothing else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ProtoError;

/// Session identifier, stable for the lifetime of a stream
pub type StreamId = Uuid;

/// WebSocket subprotocol token that marks a reattachment request
pub const SUBPROTOCOL: &str = "immortal-stream";

/// Request header carrying the client's last-known read offset
pub const READ_SEQUENCE_HEADER: &str = "x-immortal-stream-read-sequence";

/// Response header carrying the agent's writer-side sequence number
pub const WRITE_SEQUENCE_HEADER: &str = "x-immortal-stream-write-sequence";

/// WebSocket close codes sent when a reattachment is refused
pub mod close_code {
    /// The stream id is not registered
    pub const UNKNOWN_STREAM: u16 = 1003;
    /// The stream already has a live remote side
    pub const ALREADY_CONNECTED: u16 = 1008;
    /// The declared read offset is ahead of anything the agent wrote
    pub const BAD_SEQUENCE: u16 = 1002;
    /// The agent failed while attaching
    pub const INTERNAL: u16 = 1011;
}

/// Body of `POST /`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateStreamRequest {
    pub tcp_port: u16,
}

/// Public view of one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub id: StreamId,
    pub name: String,
    pub tcp_port: u16,
    pub created_at: DateTime<Utc>,
    pub last_connection_at: DateTime<Utc>,
    /// Present only while the stream is disconnected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_disconnection_at: Option<DateTime<Utc>>,
}

/// Error body returned by the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Parse the read-sequence header. Absent or empty means "replay everything".
pub fn parse_sequence_header(value: Option<&str>) -> Result<u64, ProtoError> {
    match value.map(str::trim) {
        None | Some("") => Ok(0),
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|_| ProtoError::InvalidSequence(raw.to_string())),
    }
}

/// Parse a stream id from a path segment
pub fn parse_stream_id(raw: &str) -> Result<StreamId, ProtoError> {
    Uuid::parse_str(raw).map_err(|_| ProtoError::InvalidStreamId(raw.to_string()))
}
