//! Resource bounds: the token budget closes over-consuming sessions, and
//! concurrency slots bound parallel user-code execution.

use std::time::Duration;
use trellis::client::{Client, ClientConfig, ReconnectPolicy};
use trellis::server::{ServerConfig, ServerEvent};
use trellis::{ErrorCode, Value};
use trellis_test_utils::{blog_server, init_tracing, server_connector};

#[tokio::test]
async fn token_limit_closes_the_connection() {
    init_tracing();
    let (server, _store) = blog_server(ServerConfig {
        max_tokens: 2,
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

    // First edge fits the budget.
    let posts = client
        .root()
        .seg("posts")
        .await
        .expect("first edge within budget")
        .into_node()
        .expect("proxy");
    assert_eq!(posts.get("kind"), Some(&Value::str("posts")));

    // Second edge crosses it; the server answers TOKEN_LIMIT_EXCEEDED and
    // closes, which this reconnect-disabled client surfaces as lost.
    let err = client.root().seg("users").await.expect_err("over budget");
    assert_eq!(err.code(), Some(ErrorCode::ConnectionLost));

    let mut saw_limit_error = false;
    let mut saw_close = false;
    while let Ok(event) = events.try_recv() {
        match event {
            ServerEvent::OperationError { code, .. }
                if code == Some(ErrorCode::TokenLimitExceeded) =>
            {
                saw_limit_error = true;
            }
            ServerEvent::ConnectionClosed { reason, .. } => {
                assert_eq!(reason, "token limit exceeded");
                saw_close = true;
            }
            _ => {}
        }
    }
    assert!(saw_limit_error, "limit trip must be emitted");
    assert!(saw_close, "connection must close after the trip");
}

#[tokio::test(start_paused = true)]
async fn pending_op_slots_serialize_excess_work() {
    init_tracing();
    let (server, _store) = blog_server(ServerConfig {
        max_pending_ops: 2,
        ..ServerConfig::default()
    })
    .unwrap();
    let client = Client::builder(server_connector(server)).build();

    // Four 200 ms method calls through two slots: two batches.
    let started = tokio::time::Instant::now();
    let calls: Vec<_> = (0..4)
        .map(|_| {
            let stub = client.root().seg("posts").invoke("slow", vec![]);
            tokio::spawn(async move { stub.await })
        })
        .collect();
    for call in calls {
        let got = call.await.unwrap().expect("slow call resolves");
        assert_eq!(got.into_value(), Some(Value::Int(1)));
    }
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(400),
        "two batches of two: at least 400ms, got {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_millis(800),
        "slots must still allow two at a time, got {elapsed:?}"
    );
}

#[tokio::test]
async fn queued_message_budget_closes_flooding_connections() {
    init_tracing();
    let (server, _store) = blog_server(ServerConfig {
        max_queued_ops: 3,
        max_pending_ops: 1,
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

    // Flood with unanswered slow calls; the budget closes the connection.
    let calls: Vec<_> = (0..6)
        .map(|_| {
            let stub = client.root().seg("posts").invoke("slow", vec![]);
            tokio::spawn(async move { stub.await })
        })
        .collect();
    let mut failures = 0;
    for call in calls {
        if call.await.unwrap().is_err() {
            failures += 1;
        }
    }
    assert!(failures > 0, "flooding must fail once the budget is crossed");

    let mut saw_close = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ServerEvent::ConnectionClosed { .. }) {
            saw_close = true;
        }
    }
    assert!(saw_close);
}
