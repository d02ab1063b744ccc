//! Reconnect with in-flight work against a real server: the transport dies
//! mid-operation, the controller reconnects with delay 0, the pending
//! terminal replays by path on the fresh session, and the caller's await
//! resolves as if nothing happened.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use trellis::client::{Backoff, Client, ClientConfig, ClientEvent, ReconnectPolicy};
use trellis::server::ServerConfig;
use trellis::{Connect, Transport, Value};
use trellis_test_utils::{blog_server, init_tracing};

/// A connector whose first link runs through a severable relay; later links
/// connect directly.
fn severable_connector(
    server: trellis::server::Server,
    kill: CancellationToken,
) -> impl Connect {
    let calls = Arc::new(AtomicUsize::new(0));
    move || {
        let server = server.clone();
        let kill = kill.clone();
        let nth = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            let (client_end, server_end) = Transport::pair();
            if nth == 0 {
                let (relay_client, mut relay_a) = Transport::pair();
                tokio::spawn(async move {
                    server
                        .serve_connection(server_end, trellis::server::ConnContext::default())
                        .await;
                });
                // Pump both directions until killed.
                let mut relay_b = client_end;
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = kill.cancelled() => break,
                            m = relay_a.recv() => match m {
                                Some(text) => {
                                    if relay_b.send(text).is_err() { break }
                                }
                                None => break,
                            },
                            m = relay_b.recv() => match m {
                                Some(text) => {
                                    if relay_a.send(text).is_err() { break }
                                }
                                None => break,
                            },
                        }
                    }
                    relay_a.close();
                    relay_b.close();
                });
                Ok::<_, trellis::TransportClosed>(relay_client)
            } else {
                tokio::spawn(async move {
                    server
                        .serve_connection(server_end, trellis::server::ConnContext::default())
                        .await;
                });
                Ok(client_end)
            }
        }
    }
}

fn fast_reconnect() -> ClientConfig {
    ClientConfig {
        reconnect: ReconnectPolicy::Enabled(Backoff {
            max_retries: 4,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            multiplier: 2.0,
        }),
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn in_flight_method_call_replays_and_resolves() {
    init_tracing();
    let (server, _store) = blog_server(ServerConfig::default()).unwrap();
    let kill = CancellationToken::new();
    let client = Client::builder(severable_connector(server, kill.clone()))
        .config(fast_reconnect())
        .build();
    let mut events = client.subscribe();

    // `slow` sleeps server-side, guaranteeing the kill lands mid-operation.
    let pending = tokio::spawn({
        let stub = client.root().seg("posts").invoke("slow", vec![]);
        async move { stub.await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    kill.cancel();

    let got = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("replay completes in time")
        .unwrap()
        .expect("replayed operation resolves");
    assert_eq!(got.into_value(), Some(Value::Int(1)));

    assert_eq!(events.recv().await.unwrap(), ClientEvent::Disconnect);
    assert_eq!(events.recv().await.unwrap(), ClientEvent::Reconnect);
}

#[tokio::test]
async fn idle_disconnect_defers_reopening_to_the_next_operation() {
    init_tracing();
    let (server, _store) = blog_server(ServerConfig::default()).unwrap();
    let kill = CancellationToken::new();
    let client = Client::builder(severable_connector(server, kill.clone()))
        .config(fast_reconnect())
        .build();
    let mut events = client.subscribe();

    // Finish one operation so nothing is in flight, then lose the link.
    let count = client
        .root()
        .seg("posts")
        .invoke("count", vec![])
        .await
        .expect("first epoch works")
        .into_value()
        .expect("value");
    assert_eq!(count, Value::Int(2));

    kill.cancel();
    assert_eq!(events.recv().await.unwrap(), ClientEvent::Disconnect);

    // No eager reconnect: the next operation opens a fresh epoch lazily and
    // replays its whole chain there.
    let count = client
        .root()
        .seg("posts")
        .invoke("count", vec![])
        .await
        .expect("second epoch works")
        .into_value()
        .expect("value");
    assert_eq!(count, Value::Int(2));
}

#[tokio::test]
async fn caches_do_not_leak_across_epochs() {
    init_tracing();
    let (server, store) = blog_server(ServerConfig::default()).unwrap();
    let kill = CancellationToken::new();
    let client = Client::builder(severable_connector(server, kill.clone()))
        .config(fast_reconnect())
        .build();

    let post = client.root().seg("posts").invoke("get", vec![Value::str("1")]);
    let before = post.clone().await.unwrap().into_node().unwrap();
    assert_eq!(before.get("title"), Some(&Value::str("Original")));

    // Mutate behind the client's back, then sever the link.
    store.set_title("1", "Changed offline");
    kill.cancel();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The new epoch re-fetches instead of serving the stale epoch's cache.
    let after = post.await.unwrap().into_node().unwrap();
    assert_eq!(after.get("title"), Some(&Value::str("Changed offline")));
}
