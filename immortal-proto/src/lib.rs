//! Immortal Streams Protocol Definitions
//!
//! This crate defines the wire contract between the immortal stream agent
//! and its clients: JSON session descriptors, the reattachment headers and
//! the WebSocket close codes used to refuse a reattachment.

mod message;
mod error;

pub use message::*;
pub use error::*;
