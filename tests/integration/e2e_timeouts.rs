//! Timers: idle connections close cleanly; operations that exceed their
//! budget answer `OPERATION_TIMEOUT` while the handler finishes in the
//! background without taking the connection down.

use std::time::Duration;
use trellis::client::{Client, ClientConfig, ReconnectPolicy};
use trellis::server::{ServerConfig, ServerEvent};
use trellis::{ErrorCode, Value};
use trellis_test_utils::{blog_server, init_tracing, server_connector};

#[tokio::test]
async fn idle_timeout_closes_quiet_connections() {
    init_tracing();
    let (server, _store) = blog_server(ServerConfig {
        idle_timeout: Some(Duration::from_millis(80)),
        ..ServerConfig::default()
    })
    .unwrap();
    let mut events = server.subscribe();
    let client = Client::builder(server_connector(server))
        .config(ClientConfig {
            reconnect: ReconnectPolicy::Disabled,
            ..ClientConfig::default()
        })
        .build();

    client.ready().await.expect("connected");
    // No traffic: the idle timer fires and the connection closes.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut saw_idle_close = false;
    while let Ok(event) = events.try_recv() {
        if let ServerEvent::ConnectionClosed { reason, .. } = event {
            assert_eq!(reason, "idle timeout");
            saw_idle_close = true;
        }
    }
    assert!(saw_idle_close, "idle connection must be closed");

    let err = client.root().seg("posts").await.expect_err("link is gone");
    assert_eq!(err.code(), Some(ErrorCode::ConnectionLost));
}

#[tokio::test]
async fn in_flight_operations_hold_off_the_idle_timer() {
    init_tracing();
    let (server, _store) = blog_server(ServerConfig {
        idle_timeout: Some(Duration::from_millis(80)),
        ..ServerConfig::default()
    })
    .unwrap();
    let client = Client::builder(server_connector(server)).build();

    // `slow` runs 200 ms — longer than the idle window.  The timer fires
    // only at pending == 0, so the operation still completes.
    let got = client
        .root()
        .seg("posts")
        .invoke("slow", vec![])
        .await
        .expect("operation outlives the idle window")
        .into_value()
        .expect("value");
    assert_eq!(got, Value::Int(1));
}

#[tokio::test]
async fn operation_timeout_answers_without_closing_the_connection() {
    init_tracing();
    let (server, _store) = blog_server(ServerConfig {
        max_operation_timeout: Some(Duration::from_millis(50)),
        ..ServerConfig::default()
    })
    .unwrap();
    let client = Client::builder(server_connector(server)).build();

    // 200 ms of work against a 50 ms budget.
    let err = client
        .root()
        .seg("posts")
        .invoke("slow", vec![])
        .await
        .expect_err("budget exceeded");
    assert_eq!(err.code(), Some(ErrorCode::OperationTimeout));
    assert!(err.error_id().is_some());

    // The handler finished in the background; the connection is intact and
    // fast operations still fit their budget.
    let count = client
        .root()
        .seg("posts")
        .invoke("count", vec![])
        .await
        .expect("connection survives")
        .into_value()
        .expect("value");
    assert_eq!(count, Value::Int(2));
}
