//! Connector adapters: every `connect()` spawns a fresh server-side session
//! over an in-memory transport pair.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use trellis_protocol::{Connect, Transport, TransportClosed};
use trellis_server::{ConnContext, Server};

/// A connector serving every epoch from the given server with an empty
/// connection context.
pub fn server_connector(server: Server) -> impl Connect {
    server_connector_with_ctx(server, ConnContext::default())
}

/// Same, with an explicit per-connection context (visibility tests).
pub fn server_connector_with_ctx(server: Server, ctx: ConnContext) -> impl Connect {
    move || {
        let server = server.clone();
        let ctx = ctx.clone();
        async move {
            let (client_end, server_end) = Transport::pair();
            tokio::spawn(async move {
                server.serve_connection(server_end, ctx).await;
            });
            Ok::<_, TransportClosed>(client_end)
        }
    }
}

/// A connector that relays through a counting pump, incrementing `counter`
/// for every client→server message.  Used to assert "zero additional wire
/// messages" properties.
pub fn counting_connector(server: Server, counter: Arc<AtomicUsize>) -> impl Connect {
    move || {
        let server = server.clone();
        let counter = counter.clone();
        async move {
            let (client_end, mut relay_client_side) = Transport::pair();
            let (mut relay_server_side, server_end) = Transport::pair();
            tokio::spawn(async move {
                server.serve_connection(server_end, ConnContext::default()).await;
            });
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        from_client = relay_client_side.recv() => match from_client {
                            Some(text) => {
                                counter.fetch_add(1, Ordering::SeqCst);
                                if relay_server_side.send(text).is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                        from_server = relay_server_side.recv() => match from_server {
                            Some(text) => {
                                if relay_client_side.send(text).is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
                relay_client_side.close();
                relay_server_side.close();
            });
            Ok::<_, TransportClosed>(client_end)
        }
    }
}
