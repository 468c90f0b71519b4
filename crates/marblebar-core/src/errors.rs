//! Client error taxonomy.
//!
//! - [`ClientError::Transport`]: a send was attempted with no active link
//! - [`ClientError::Protocol`]: inbound text could not be decoded or routed
//! - [`ClientError::Timeout`]: no qualifying reply within the reply window
//! - [`ClientError::ConnectionClosed`]: the link went away while a request was pending
//!
//! Transport and protocol errors are local: they are logged and the session
//! carries on. Timeouts reach only the caller whose request expired.
//! `ConnectionClosed` reaches every caller still pending at teardown.

use std::time::Duration;

use thiserror::Error;

use crate::ids::RequestId;

/// Reason text handed to callers whose request expired.
pub const RESPONSE_TIMEOUT: &str = "Response timeout";

/// Reason text handed to callers whose connection was torn down.
pub const CONNECTION_CLOSED: &str = "Connection closed";

/// Errors surfaced by the client core.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ClientError {
    /// No usable transport.
    #[error("transport error: {reason}")]
    Transport {
        /// What was missing or failed.
        reason: String,
    },

    /// Malformed or unroutable inbound frame.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No reply arrived within the configured window.
    #[error("Response timeout")]
    Timeout {
        /// The request that expired.
        id: RequestId,
        /// The window that elapsed.
        after: Duration,
    },

    /// The connection was torn down before a reply arrived.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl ClientError {
    /// Shorthand for a transport error.
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Protocol(_) => "protocol",
            Self::Timeout { .. } => "timeout",
            Self::ConnectionClosed => "connection_closed",
        }
    }

    /// Whether the error ended the request it was reported to.
    pub fn is_terminal_for_request(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ConnectionClosed)
    }
}

/// Inbound frames that cannot be decoded or routed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The text is not a JSON object.
    #[error("malformed frame: {reason}")]
    Malformed {
        /// Parser diagnostic.
        reason: String,
    },

    /// The frame has neither an id nor the action kind.
    #[error("unroutable frame of kind {}", .kind.as_deref().unwrap_or("<none>"))]
    Unroutable {
        /// The frame's `type`, if any.
        kind: Option<String>,
    },

    /// The peer reported an error that is not tied to any request.
    #[error("peer error: {message}")]
    Remote {
        /// The peer's message.
        message: String,
    },
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
