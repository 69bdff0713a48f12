//! Error kinds surfaced by the P2P stack.

use std::{io, sync::Arc};

use thiserror::Error;

use crate::node::NodeId;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the stack can report, by kind.
///
/// The enum is `Clone` (I/O errors are shared behind an `Arc`) because a
/// connection-fatal error must reach both the send and receive sides of a
/// peer connection.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Socket-level read/write/close failure.
    #[error("i/o error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// Malformed framing, unknown channel, capacity or nonce violation.
    /// Always fatal to the connection it occurred on.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Key agreement, AEAD, or signature verification failure.
    #[error("cryptographic error: {0}")]
    Crypto(&'static str),

    /// NodeInfo validation or compatibility failure during handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Connection-slot accounting rejected the peer; not fatal to the
    /// process.
    #[error("capacity exceeded: {0}")]
    Capacity(&'static str),

    /// The `done` signal fired; callers unwind cleanly.
    #[error("operation canceled")]
    Canceled,

    /// A bounded wait elapsed.
    #[error("timed out: {0}")]
    Timeout(&'static str),

    /// Rejecting a self-connection or an already-connected peer.
    #[error("duplicate peer {0}")]
    Duplicate(NodeId),

    /// The stream, queue, or transport was closed under the caller.
    #[error("connection closed")]
    Closed,
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::Handshake(msg.into())
    }

    /// Whether this error is the cooperative-cancellation kind.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }

    /// Whether this error reflects a clean shutdown rather than a fault.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed | Error::Canceled)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::Protocol(format!("message decoding failed: {}", e))
    }
}

impl From<prost::EncodeError> for Error {
    fn from(e: prost::EncodeError) -> Self {
        Error::Protocol(format!("message encoding failed: {}", e))
    }
}
