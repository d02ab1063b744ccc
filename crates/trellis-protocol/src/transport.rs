//! The abstract duplex string-message channel the session cores run over.
//!
//! The core is transport-agnostic: a WebSocket adapter is one instance, the
//! in-memory pair used by the test suites is another.  A transport is a pair
//! of unbounded channels; closing either side surfaces as `None` on the
//! peer's `recv` and `TransportClosed` on `send`.

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

/// The peer is gone; nothing further can be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("transport closed")]
pub struct TransportClosed;

/// One end of a duplex string-message channel.
#[derive(Debug)]
pub struct Transport {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<String>,
}

/// A clonable send-only handle onto a transport.
#[derive(Debug, Clone)]
pub struct TransportSender {
    outbound: mpsc::UnboundedSender<String>,
}

impl Transport {
    /// A linked pair of transports: what one sends, the other receives.
    pub fn pair() -> (Transport, Transport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Transport {
                outbound: a_tx,
                inbound: b_rx,
            },
            Transport {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }

    pub fn send(&self, text: String) -> Result<(), TransportClosed> {
        self.outbound.send(text).map_err(|_| TransportClosed)
    }

    /// The next inbound message; `None` once the peer has closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    /// Close both directions.  The peer observes `None` on its next `recv`.
    pub fn close(&mut self) {
        self.inbound.close();
        // Dropping the sender closes the outbound direction; replace it with
        // one whose receiver is already gone.
        let (dead_tx, _) = mpsc::unbounded_channel();
        self.outbound = dead_tx;
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Split into a clonable sender handle and the receiving half.
    pub fn split(self) -> (TransportSender, mpsc::UnboundedReceiver<String>) {
        (
            TransportSender {
                outbound: self.outbound,
            },
            self.inbound,
        )
    }
}

impl TransportSender {
    pub fn send(&self, text: String) -> Result<(), TransportClosed> {
        self.outbound.send(text).map_err(|_| TransportClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Factory for transports; the client's lazy-connect and reconnect paths
/// call this once per epoch.
pub trait Connect: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'static, Result<Transport, TransportClosed>>;
}

/// Closures returning transport futures are connectors.
impl<F, Fut> Connect for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Transport, TransportClosed>> + Send + 'static,
{
    fn connect(&self) -> BoxFuture<'static, Result<Transport, TransportClosed>> {
        Box::pin(self())
    }
}
