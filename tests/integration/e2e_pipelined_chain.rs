//! End-to-end pipelining: a dependent chain issues all of its messages
//! before any response is required, and resolves to a data proxy.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use trellis::Value;
use trellis::client::{Client, Fetched};
use trellis::server::ServerConfig;
use trellis_test_utils::{blog_server, counting_connector, init_tracing};

#[tokio::test]
async fn dependent_chain_uses_three_messages_and_yields_a_proxy() {
    init_tracing();
    let (server, _store) = blog_server(ServerConfig::default()).unwrap();
    let sent = Arc::new(AtomicUsize::new(0));
    let client = Client::builder(counting_connector(server, sent.clone())).build();

    let fetched = client
        .root()
        .seg("posts")
        .invoke("get", vec![Value::str("1")])
        .await
        .expect("chain resolves");

    // One edge for `posts`, one edge for `get("1")`, one data fetch —
    // pipelined, nothing more.
    assert_eq!(sent.load(Ordering::SeqCst), 3);

    match fetched {
        Fetched::Node(proxy) => {
            assert_eq!(proxy.get("title"), Some(&Value::str("Original")));
            assert_eq!(proxy.get("id"), Some(&Value::str("1")));
        }
        other => panic!("expected a data proxy, got {other:?}"),
    }
}

#[tokio::test]
async fn shared_prefixes_are_deduplicated_across_awaits() {
    init_tracing();
    let (server, _store) = blog_server(ServerConfig::default()).unwrap();
    let sent = Arc::new(AtomicUsize::new(0));
    let client = Client::builder(counting_connector(server, sent.clone())).build();

    let first = client.root().seg("posts").invoke("get", vec![Value::str("1")]);
    let second = client.root().seg("posts").invoke("get", vec![Value::str("2")]);
    let (a, b) = tokio::join!(first, second);
    a.expect("post 1 resolves");
    b.expect("post 2 resolves");

    // `posts` is sent once; each post contributes one edge and one data op.
    assert_eq!(sent.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn terminal_property_read_resolves_through_the_chain() {
    init_tracing();
    let (server, _store) = blog_server(ServerConfig::default()).unwrap();
    let sent = Arc::new(AtomicUsize::new(0));
    let client = Client::builder(counting_connector(server, sent.clone())).build();

    let title = client
        .root()
        .seg("posts")
        .invoke("get", vec![Value::str("1")])
        .seg("title")
        .await
        .expect("title resolves")
        .into_value()
        .expect("terminal value");
    assert_eq!(title, Value::str("Original"));
    // Two edges plus one get.
    assert_eq!(sent.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn navigation_past_a_terminal_is_invalid() {
    init_tracing();
    let (server, _store) = blog_server(ServerConfig::default()).unwrap();
    let sent = Arc::new(AtomicUsize::new(0));
    let client = Client::builder(counting_connector(server, sent.clone())).build();

    let err = client
        .root()
        .seg("posts")
        .seg("count")
        .seg("beyond")
        .await
        .expect_err("cannot navigate past a terminal");
    assert_eq!(err.code(), Some(trellis::ErrorCode::InvalidPath));
}
