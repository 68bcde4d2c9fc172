//! The outbound request/response contract consumed by a node.

use core::fmt;
use std::io;

use bytes::Bytes;

use crate::message::{Method, NodeAddr};

/// A failed outbound call. Failures are never fatal to the protocol; callers
/// treat them as the absence of a positive response.
#[derive(Debug)]
pub enum TransportError {
    /// No response arrived before the transport's deadline.
    Timeout,
    /// The connection could not be established or broke mid-call.
    Io(io::Error),
    /// The peer's bytes did not decode as a response.
    Codec(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "call timed out"),
            TransportError::Io(err) => write!(f, "transport i/o failed: {}", err),
            TransportError::Codec(err) => write!(f, "undecodable response: {}", err),
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::Timeout,
            _ => TransportError::Io(err),
        }
    }
}

/// One-shot request/response delivery to a peer, bounded by the transport's
/// configured deadline. Implementations own connection setup, framing and the
/// deadline; the node only sees bytes.
pub trait Transport: Send + Sync {
    fn call(
        &self,
        method: Method,
        addr: &NodeAddr,
        request: &[u8],
    ) -> Result<Bytes, TransportError>;
}
