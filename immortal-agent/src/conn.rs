//! Byte-stream abstraction shared by local and remote sides.

use tokio::io::{AsyncRead, AsyncWrite};

/// Anything that behaves like a bidirectional byte stream.
///
/// TCP sockets, in-memory duplex pipes and bridged WebSockets all qualify.
/// Closing is `shutdown()` followed by drop.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Conn for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Heap-allocated connection used at every trait-object seam
pub type BoxConn = Box<dyn Conn>;

/// Errors that mean "the other end went away" rather than a fault.
pub fn is_benign(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::UnexpectedEof
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
    )
}
