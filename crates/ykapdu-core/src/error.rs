//! Errors surfaced by the session engine.

use thiserror::Error;

use crate::apdu::StatusWord;
use crate::state::ConnectionState;
use crate::transport::TransportError;

/// Every `execute` resolves to a response or exactly one of these.
#[derive(Error, Debug)]
pub enum ApduError {
    /// I/O failure on the transport. Not retried; the connection closes.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Connection not ready (state: {state})")]
    ConnectionNotReady { state: ConnectionState },

    #[error("Command cancelled")]
    Cancelled,

    #[error("Malformed response: {len} bytes")]
    MalformedResponse { len: usize },

    #[error("Malformed command: {len} bytes")]
    MalformedCommand { len: usize },

    #[error("Unsupported payload size: {len} bytes")]
    UnsupportedPayloadSize { len: usize },

    #[error("Session closed")]
    SessionClosed,

    /// Application-level status word, passed through verbatim.
    #[error("Card returned status {0}")]
    Status(StatusWord),

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// A blocking wait was attempted on a thread marked non-blocking.
    #[error("Blocking call on a non-blocking thread")]
    BlockingNotAllowed,
}

impl ApduError {
    /// Whether this error also invalidated the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ApduError::Transport(_))
    }
}

pub type Result<T, E = ApduError> = std::result::Result<T, E>;
