//! Server-side observability events, published on a broadcast channel.

use trellis_codec::ErrorCode;
use uuid::Uuid;

/// Events emitted by the server while serving connections.  Lagging
/// subscribers lose events; the channel is observability, not control flow.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    ConnectionOpened {
        conn_id: Uuid,
    },
    ConnectionClosed {
        conn_id: Uuid,
        reason: String,
    },
    /// An operation failed.  Carries the original (non-redacted) message and
    /// the identifier echoed to the client for correlation.
    OperationError {
        conn_id: Uuid,
        error_id: Uuid,
        code: Option<ErrorCode>,
        message: String,
    },
}
