//! Client lifecycle events, published on a broadcast channel.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The transport closed while the client was live.
    Disconnect,
    /// A fresh session completed its hello after a disconnect.
    Reconnect,
    /// Reconnect retries are exhausted; operations fail with
    /// `CONNECTION_LOST` until a manual `reconnect()`.
    ReconnectFailed,
}
