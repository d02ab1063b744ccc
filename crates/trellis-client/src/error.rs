//! Client-surfaced errors and the internal replay sentinel.

use trellis_codec::{ErrorCode, Value, WireError};
use uuid::Uuid;

/// An error surfaced to an awaiter.
///
/// `Protocol` covers both server-sent framework errors and locally-raised
/// ones (`INVALID_PATH`, `CONNECTION_LOST`, `CLIENT_CLOSED`, …); the
/// server-assigned identifier, when present, correlates with the server's
/// `operation_error` event.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("{0}")]
    Protocol(WireError),
    #[error("custom error value")]
    Custom(Value),
    #[error("codec: {0}")]
    Codec(String),
}

impl ClientError {
    pub(crate) fn local(code: ErrorCode, message: impl Into<String>) -> ClientError {
        ClientError::Protocol(WireError::new(code, message))
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Protocol(e) => Some(e.code),
            _ => None,
        }
    }

    /// The server's error identifier, for correlating with server logs.
    pub fn error_id(&self) -> Option<Uuid> {
        match self {
            ClientError::Protocol(e) => e.error_id,
            _ => None,
        }
    }
}

impl From<WireError> for ClientError {
    fn from(e: WireError) -> Self {
        ClientError::Protocol(e)
    }
}

/// Outcome of one wire-level attempt.  `Reconnecting` is an internal
/// sentinel: the session died mid-operation and the terminal stays pending
/// for replay on the next epoch; it never surfaces to callers.
#[derive(Debug, Clone)]
pub(crate) enum IssueFailure {
    Reconnecting,
    Failed(ClientError),
}

impl From<ClientError> for IssueFailure {
    fn from(e: ClientError) -> Self {
        IssueFailure::Failed(e)
    }
}
