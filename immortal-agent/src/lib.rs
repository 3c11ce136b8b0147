//! Immortal Streams Agent
//!
//! Keeps a local TCP connection alive while the remote client that reads
//! and writes it disconnects and reattaches. See [`manager::Manager`] for
//! the registry and [`http::router`] for the wire surface.

pub mod backed_pipe;
pub mod cli;
pub mod client;
pub mod conn;
pub mod dialer;
pub mod error;
pub mod http;
pub mod manager;
pub mod names;
pub mod stream;
pub mod ws;

pub use backed_pipe::{BackedPipe, PipeConfig};
pub use conn::{BoxConn, Conn};
pub use dialer::{Dialer, ListenerRegistry, LocalDialer};
pub use error::{Error, Result};
pub use manager::{Manager, ManagerConfig, MAX_STREAMS};
pub use stream::Stream;
