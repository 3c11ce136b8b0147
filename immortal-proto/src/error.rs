//! Protocol error types

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("Invalid sequence number header value: {0:?}")]
    InvalidSequence(String),

    #[error("Invalid stream id: {0:?}")]
    InvalidStreamId(String),
}
