//! Hydration then live: the pre-populated cache answers the initial burst of
//! reads without any transport; the first miss falls through and opens the
//! connection lazily.

use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use trellis::client::{Client, Fetched};
use trellis::server::ServerConfig;
use trellis::{
    Connect, HydrationEntry, HydrationPayload, HydrationRef, Schema, SchemaClass, SchemaEdge,
    Value,
};
use trellis_test_utils::{blog_server, init_tracing, server_connector};

/// A connector that counts how often the transport is actually opened.
fn counting_connects(
    inner: impl Connect,
    opens: Arc<AtomicUsize>,
) -> impl Connect {
    let inner = Arc::new(inner);
    move || {
        let inner = inner.clone();
        let opens = opens.clone();
        async move {
            opens.fetch_add(1, Ordering::SeqCst);
            inner.connect().await
        }
    }
}

fn payload() -> HydrationPayload {
    HydrationPayload {
        schema: Schema {
            classes: vec![
                SchemaClass {
                    edges: vec![SchemaEdge {
                        name: "posts".to_owned(),
                        target: 1,
                    }],
                },
                SchemaClass {
                    edges: vec![SchemaEdge {
                        name: "get".to_owned(),
                        target: 2,
                    }],
                },
                SchemaClass { edges: vec![] },
            ],
        },
        refs: vec![
            HydrationRef {
                parent: 0,
                edge: "posts".to_owned(),
                args: vec![],
            },
            HydrationRef {
                parent: 1,
                edge: "get".to_owned(),
                args: vec![json!("1")],
            },
        ],
        data: vec![
            HydrationEntry::Snapshot {
                token: 2,
                value: json!({"id": "1", "title": "Hello"}),
            },
            HydrationEntry::Call {
                token: 1,
                method: "count".to_owned(),
                args: vec![],
                result: json!(42),
            },
        ],
    }
}

#[tokio::test]
async fn hits_short_circuit_the_transport_and_misses_open_it() {
    init_tracing();
    let (server, _store) = blog_server(ServerConfig::default()).unwrap();
    let opens = Arc::new(AtomicUsize::new(0));
    let client = Client::builder(counting_connects(server_connector(server), opens.clone()))
        .build();
    client.hydrate(&payload().to_flattened()).unwrap();

    // Node snapshot hit: no transport.
    let proxy = client
        .root()
        .seg("posts")
        .invoke("get", vec![Value::str("1")])
        .await
        .expect("hydration hit")
        .into_node()
        .expect("proxy");
    assert_eq!(proxy.get("title"), Some(&Value::str("Hello")));
    assert_eq!(opens.load(Ordering::SeqCst), 0, "no transport for a hit");

    // Recorded method call hit: still no transport.
    let count = client
        .root()
        .seg("posts")
        .invoke("count", vec![])
        .await
        .expect("call hit")
        .into_value()
        .expect("value");
    assert_eq!(count, Value::Int(42));
    assert_eq!(opens.load(Ordering::SeqCst), 0);

    // Miss: falls through to the live session, opening the transport.
    let live = client
        .root()
        .seg("posts")
        .invoke("get", vec![Value::str("2")])
        .await
        .expect("live resolution")
        .into_node()
        .expect("proxy");
    assert_eq!(live.get("title"), Some(&Value::str("Second")));
    assert_eq!(opens.load(Ordering::SeqCst), 1, "miss opens the transport once");
}

#[tokio::test]
async fn bare_field_reads_hit_the_snapshot_but_args_do_not() {
    init_tracing();
    let (server, _store) = blog_server(ServerConfig::default()).unwrap();
    let opens = Arc::new(AtomicUsize::new(0));
    let client = Client::builder(counting_connects(server_connector(server), opens.clone()))
        .build();
    client.hydrate(&payload().to_flattened()).unwrap();

    let title = client
        .root()
        .seg("posts")
        .invoke("get", vec![Value::str("1")])
        .seg("title")
        .await
        .expect("field hit")
        .into_value()
        .expect("value");
    assert_eq!(title, Value::str("Hello"));
    assert_eq!(opens.load(Ordering::SeqCst), 0);

    // A method call with args never falls through to the data snapshot: it
    // misses and goes live (where the server rejects the stray args).
    let result = client
        .root()
        .seg("posts")
        .invoke("get", vec![Value::str("1")])
        .invoke("title", vec![Value::str("x")])
        .await;
    assert_eq!(opens.load(Ordering::SeqCst), 1, "exclusion forces the wire");
    assert!(result.is_err(), "the live server has no title(args) method");
}

#[tokio::test]
async fn explicit_end_hydration_is_idempotent_and_disables_hits() {
    init_tracing();
    let (server, _store) = blog_server(ServerConfig::default()).unwrap();
    let opens = Arc::new(AtomicUsize::new(0));
    let client = Client::builder(counting_connects(server_connector(server), opens.clone()))
        .build();
    client.hydrate(&payload().to_flattened()).unwrap();

    client.end_hydration();
    client.end_hydration();

    // What would have been a hit now goes to the live session.
    let proxy = client
        .root()
        .seg("posts")
        .invoke("get", vec![Value::str("1")])
        .await
        .expect("live resolution")
        .into_node()
        .expect("proxy");
    // Live data, not the stale hydration snapshot.
    assert_eq!(proxy.get("title"), Some(&Value::str("Original")));
    assert_eq!(opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn hydrated_reads_match_scenario_wire_silence() {
    init_tracing();
    // The full scenario in order: two hits, then one miss.
    let (server, _store) = blog_server(ServerConfig::default()).unwrap();
    let opens = Arc::new(AtomicUsize::new(0));
    let client = Client::builder(counting_connects(server_connector(server), opens.clone()))
        .build();
    client.hydrate(&payload().to_flattened()).unwrap();

    let a = client
        .root()
        .seg("posts")
        .invoke("get", vec![Value::str("1")])
        .await
        .unwrap();
    assert!(matches!(a, Fetched::Node(_)));
    let b = client.root().seg("posts").invoke("count", vec![]).await.unwrap();
    assert!(matches!(b, Fetched::Value(Value::Int(42))));
    assert_eq!(opens.load(Ordering::SeqCst), 0);

    let c = client
        .root()
        .seg("posts")
        .invoke("get", vec![Value::str("2")])
        .await
        .unwrap();
    assert!(matches!(c, Fetched::Node(_)));
    assert_eq!(opens.load(Ordering::SeqCst), 1);
}
