//! Operation-level error plumbing: classification, wrapping, and redaction.

use crate::graph::HandlerError;
use trellis_codec::{Codec, ErrorCode, Value, WireError};

/// Message substituted for redacted opaque failures.  The code survives;
/// the original message is only visible in the `operation_error` event.
pub const REDACTED_MESSAGE: &str = "Internal server error";

/// A failed operation, classified for response building.
///
/// `Wire` is a genuine framework error and is never redacted.  `Wrapped` is
/// an opaque handler failure given an operation-matched code; it is the only
/// variant redaction applies to.  `Custom` is a user-registered error value
/// that round-trips via the codec untouched.
#[derive(Debug, Clone)]
pub enum OpError {
    Wire(WireError),
    Wrapped(WireError),
    Custom(Value),
}

impl OpError {
    pub fn wire(code: ErrorCode, message: impl Into<String>) -> OpError {
        OpError::Wire(WireError::new(code, message))
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            OpError::Wire(e) | OpError::Wrapped(e) => Some(e.code),
            OpError::Custom(_) => None,
        }
    }
}

impl From<WireError> for OpError {
    fn from(e: WireError) -> Self {
        OpError::Wire(e)
    }
}

/// Classify a handler failure under the code matching the operation that
/// ran it (`EDGE_ERROR` / `GET_ERROR` / `DATA_ERROR`).
///
/// A custom value the codec does not claim cannot round-trip, so it
/// degrades to a wrapped failure.
pub fn wrap_handler_error(codec: &Codec, op_code: ErrorCode, err: HandlerError) -> OpError {
    match err {
        HandlerError::Framework(e) => OpError::Wire(e),
        HandlerError::Custom(v) => {
            if codec.handles(&v) {
                OpError::Custom(v)
            } else {
                OpError::Wrapped(WireError::new(op_code, "unregistered custom error value"))
            }
        }
        HandlerError::Other(message) => OpError::Wrapped(WireError::new(op_code, message)),
    }
}
