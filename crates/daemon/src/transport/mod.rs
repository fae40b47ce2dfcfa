//! Client transports.
//!
//! All transports speak the same JSON protocol:
//! - `stdio`: one client on standard input/output, newline-delimited
//! - `unix`: a Unix domain socket listener, newline-delimited
//! - `websocket`: a TCP listener upgrading to WebSocket, one message per text frame
//!
//! Each connection registers one [`ChannelSink`] with the output hub for its
//! lifetime and routes requests through the shared [`MessageRouter`](crate::router::MessageRouter).

use std::fmt;
use std::io;

use thiserror::Error;

pub mod connection;
pub mod stdio;
pub mod unix;
pub mod websocket;

pub use connection::{ChannelSink, SinkStats};
pub use unix::UnixServer;
pub use websocket::WsServer;

/// Errors that end a connection or prevent a listener from starting.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error on the underlying stream or socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A reply or event could not be serialized.
    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// The WebSocket upgrade or framing was invalid.
    #[error("protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),
}

/// Which transport a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Unix,
    WebSocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Unix => "unix",
            TransportKind::WebSocket => "websocket",
        })
    }
}
