//! Agent error kinds
//!
//! Every caller-facing operation returns one of these so the transport
//! adapter can pick a wire status without string matching.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Creation refused and no disconnected stream could be evicted
    #[error("too many immortal streams")]
    TooManyStreams,

    #[error("immortal stream not found")]
    NotFound,

    /// The local dial target is not listening
    #[error("connection to local port {port} refused: {source}")]
    ConnectionRefused {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// A remote side is already attached and alive
    #[error("stream is already connected")]
    AlreadyConnected,

    #[error("closed")]
    Closed,

    #[error("stream already started")]
    AlreadyStarted,

    /// The client claims to have read bytes that were never written
    #[error("read sequence {read} is ahead of write sequence {written}")]
    SequenceAhead { read: u64, written: u64 },

    #[error("dial local port {port}: {source}")]
    Dial {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// HTTP status for control-plane responses.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::ConnectionRefused { .. } | Error::NotFound => 404,
            Error::TooManyStreams => 503,
            _ => 500,
        }
    }

    /// WebSocket close code for a refused reattachment.
    pub fn close_code(&self) -> u16 {
        use immortal_proto::close_code;
        match self {
            Error::NotFound => close_code::UNKNOWN_STREAM,
            Error::AlreadyConnected => close_code::ALREADY_CONNECTED,
            Error::SequenceAhead { .. } => close_code::BAD_SEQUENCE,
            _ => close_code::INTERNAL,
        }
    }

    /// Classify a dial failure once, at the manager boundary.
    pub(crate) fn from_dial(port: u16, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::ConnectionRefused {
            Error::ConnectionRefused { port, source }
        } else {
            Error::Dial { port, source }
        }
    }
}
