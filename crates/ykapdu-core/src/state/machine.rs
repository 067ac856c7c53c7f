//! Connection lifecycle states and their legal transitions.
//!
//! ```text
//!  Closed ──► Opening ──► Open ──► Closing ──► Closed
//!    ▲           │
//!    └───────────┘  (handshake failed)
//!
//!  any ──► Closed   (physical detach)
//! ```

use std::fmt;

/// State of a key connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No commands can be sent. Initial and terminal state.
    #[default]
    Closed,
    /// Handshake in progress.
    Opening,
    /// Ready; commands may be submitted.
    Open,
    /// Teardown in progress.
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Closed => write!(f, "CLOSED"),
            ConnectionState::Opening => write!(f, "OPENING"),
            ConnectionState::Open => write!(f, "OPEN"),
            ConnectionState::Closing => write!(f, "CLOSING"),
        }
    }
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// Opening or Closing.
    pub fn is_transitional(&self) -> bool {
        matches!(self, ConnectionState::Opening | ConnectionState::Closing)
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(&self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (*self, to),
            (Closed, Opening) | (Opening, Open) | (Open, Closing) | (Closing, Closed)
        ) || (to == Closed && *self != Closed)
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Closed => 0,
            ConnectionState::Opening => 1,
            ConnectionState::Open => 2,
            ConnectionState::Closing => 3,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Opening,
            2 => ConnectionState::Open,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// A recorded state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}
