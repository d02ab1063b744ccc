//! Error taxonomy shared by both sides of the wire.
//!
//! `ErrorCode` is a frozen, closed set.  `WireError` is the framework error
//! value that round-trips through the codec; user-registered custom errors
//! travel as `Value::Custom` instead and never become a `WireError`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frozen framework error codes.
///
/// | Code                 | Origin                                        |
/// |----------------------|-----------------------------------------------|
/// | VALIDATION_ERROR     | argument schema rejection                     |
/// | EDGE_NOT_FOUND       | edge name unknown on the target class         |
/// | METHOD_NOT_FOUND     | terminal name unknown / hidden / misused      |
/// | EDGE_ERROR           | wrapped failure inside an edge handler        |
/// | GET_ERROR            | wrapped failure inside a method/getter        |
/// | DATA_ERROR           | wrapped failure while snapshotting            |
/// | INVALID_TOKEN        | token outside the session's allocation        |
/// | INVALID_PATH         | unclassifiable or over-deep path              |
/// | TOKEN_LIMIT_EXCEEDED | session token budget exhausted                |
/// | OPERATION_TIMEOUT    | per-operation timer fired                     |
/// | CONNECTION_CLOSED    | server-side close interrupted the operation   |
/// | CONNECTION_LOST      | client-side reconnect retries exhausted       |
/// | CLIENT_CLOSED        | client explicitly closed                      |
/// | INTERNAL_ERROR       | anything that escaped classification          |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    EdgeNotFound,
    MethodNotFound,
    EdgeError,
    GetError,
    DataError,
    InvalidToken,
    InvalidPath,
    TokenLimitExceeded,
    OperationTimeout,
    ConnectionClosed,
    ConnectionLost,
    ClientClosed,
    InternalError,
}

impl ErrorCode {
    /// The wire string for this code (SCREAMING_SNAKE_CASE).
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::EdgeNotFound => "EDGE_NOT_FOUND",
            ErrorCode::MethodNotFound => "METHOD_NOT_FOUND",
            ErrorCode::EdgeError => "EDGE_ERROR",
            ErrorCode::GetError => "GET_ERROR",
            ErrorCode::DataError => "DATA_ERROR",
            ErrorCode::InvalidToken => "INVALID_TOKEN",
            ErrorCode::InvalidPath => "INVALID_PATH",
            ErrorCode::TokenLimitExceeded => "TOKEN_LIMIT_EXCEEDED",
            ErrorCode::OperationTimeout => "OPERATION_TIMEOUT",
            ErrorCode::ConnectionClosed => "CONNECTION_CLOSED",
            ErrorCode::ConnectionLost => "CONNECTION_LOST",
            ErrorCode::ClientClosed => "CLIENT_CLOSED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Parse a wire string back into a code.
    pub fn parse(s: &str) -> Option<ErrorCode> {
        Some(match s {
            "VALIDATION_ERROR" => ErrorCode::ValidationError,
            "EDGE_NOT_FOUND" => ErrorCode::EdgeNotFound,
            "METHOD_NOT_FOUND" => ErrorCode::MethodNotFound,
            "EDGE_ERROR" => ErrorCode::EdgeError,
            "GET_ERROR" => ErrorCode::GetError,
            "DATA_ERROR" => ErrorCode::DataError,
            "INVALID_TOKEN" => ErrorCode::InvalidToken,
            "INVALID_PATH" => ErrorCode::InvalidPath,
            "TOKEN_LIMIT_EXCEEDED" => ErrorCode::TokenLimitExceeded,
            "OPERATION_TIMEOUT" => ErrorCode::OperationTimeout,
            "CONNECTION_CLOSED" => ErrorCode::ConnectionClosed,
            "CONNECTION_LOST" => ErrorCode::ConnectionLost,
            "CLIENT_CLOSED" => ErrorCode::ClientClosed,
            "INTERNAL_ERROR" => ErrorCode::InternalError,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A framework error as it travels over the wire and through caches.
///
/// `error_id` is assigned by the server when the error is first written into
/// a response, correlating the client-surfaced error with the server's
/// `operation_error` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
    pub error_id: Option<Uuid>,
}

impl WireError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        WireError {
            code,
            message: message.into(),
            error_id: None,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.error_id = Some(id);
        self
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for WireError {}

/// Failures inside the codec itself (never sent over the wire).
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown type tag '{0}'")]
    UnknownTag(String),
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("big integer out of range: {0}")]
    BigIntRange(String),
}
