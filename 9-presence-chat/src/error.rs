use std::io;

use thiserror::Error;

use crate::session::SessionState;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("username cannot be empty")]
pub struct InvalidUsername;

/// Failures reported by a transport adapter.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to reach broker at {address}")]
    Unreachable {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("broker rejected request: {0}")]
    Rejected(String),

    #[error("connection closed")]
    Closed,

    #[error("transport i/o failed")]
    Io(#[from] io::Error),
}

/// Errors surfaced to the caller of a [`crate::session::ChatSession`].
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect")]
    Connection(#[source] TransportError),

    #[error("failed to send message")]
    Send(#[source] TransportError),

    #[error("cannot {operation} while session is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("message text cannot be empty")]
    EmptyMessage,
}

/// Inbound message that could not be classified. Logged and dropped by the
/// session, never returned to the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MalformedMessage {
    #[error("message has no sender")]
    MissingSender,

    #[error("message sender is blank")]
    BlankSender,

    #[error("unknown presence kind '{0}'")]
    UnknownPresenceKind(String),
}
