//! Wire-level client tests against a scripted server: pipelining, coalescing,
//! and reconnect replay, asserted message by message.

use serde_json::{Value as Json, json};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use trellis_client::{Backoff, Client, ClientConfig, ClientEvent, Fetched, ReconnectPolicy};
use trellis_codec::Value;
use trellis_protocol::{
    Schema, SchemaClass, SchemaEdge, ServerMessage, Transport, TransportClosed, WIRE_VERSION,
};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// 0: Root { posts -> 1 }, 1: Posts { get -> 2 }, 2: Post
fn schema() -> Schema {
    Schema {
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
    }
}

fn send_hello(server: &Transport) {
    let hello = ServerMessage::Hello {
        version: WIRE_VERSION,
        schema: schema(),
    };
    server.send(hello.to_wire().unwrap()).unwrap();
}

async fn recv_json(server: &mut Transport) -> Json {
    let text = tokio::time::timeout(Duration::from_secs(2), server.recv())
        .await
        .expect("client message in time")
        .expect("transport open");
    serde_json::from_str(&text).expect("valid JSON")
}

/// Connector handing out pre-created transports, one per epoch.
fn queue_connector(
    transports: Vec<Transport>,
) -> impl Fn() -> futures_util::future::Ready<Result<Transport, TransportClosed>> + Send + Sync {
    let queue = Arc::new(Mutex::new(VecDeque::from(transports)));
    move || {
        let next = queue.lock().unwrap().pop_front();
        futures_util::future::ready(next.ok_or(TransportClosed))
    }
}

fn fast_reconnect() -> ClientConfig {
    ClientConfig {
        reconnect: ReconnectPolicy::Enabled(Backoff {
            max_retries: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
        }),
        ..ClientConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Pipelining
// ---------------------------------------------------------------------------

/// The dependent chain `posts.get("1")` puts three messages on the wire
/// before any response exists, and child tokens are higher than parents.
#[tokio::test]
async fn dependent_chain_is_pipelined_before_any_response() {
    let (client_end, mut server) = Transport::pair();
    let client = Client::builder(queue_connector(vec![client_end])).build();

    let resolve = tokio::spawn({
        let stub = client
            .root()
            .seg("posts")
            .invoke("get", vec![Value::str("1")]);
        async move { stub.await }
    });

    send_hello(&server);

    let m1 = recv_json(&mut server).await;
    assert_eq!(m1, json!({"op": "edge", "tok": 0, "edge": "posts"}));
    let m2 = recv_json(&mut server).await;
    assert_eq!(m2, json!({"op": "edge", "tok": 1, "edge": "get", "args": ["1"]}));
    let m3 = recv_json(&mut server).await;
    assert_eq!(m3, json!({"op": "data", "tok": 2}));

    // Only now answer anything.
    server
        .send(ServerMessage::Edge { tok: 1, re: 1, error: None }.to_wire().unwrap())
        .unwrap();
    server
        .send(ServerMessage::Edge { tok: 2, re: 2, error: None }.to_wire().unwrap())
        .unwrap();
    server
        .send(
            ServerMessage::Data {
                tok: 2,
                re: 3,
                data: Some(json!({"id": "1", "title": "Hello"})),
                error: None,
            }
            .to_wire()
            .unwrap(),
        )
        .unwrap();

    let fetched = resolve.await.unwrap().expect("resolution succeeds");
    match fetched {
        Fetched::Node(proxy) => {
            assert_eq!(proxy.get("title"), Some(&Value::str("Hello")));
        }
        other => panic!("expected a data proxy, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Coalescing
// ---------------------------------------------------------------------------

/// Two concurrent awaits of the same property produce one wire message and
/// identical resolved values.
#[tokio::test]
async fn concurrent_property_reads_coalesce_into_one_message() {
    let (client_end, mut server) = Transport::pair();
    let client = Client::builder(queue_connector(vec![client_end])).build();

    let a = tokio::spawn({
        let stub = client.root().seg("posts").seg("count");
        async move { stub.await }
    });
    let b = tokio::spawn({
        let stub = client.root().seg("posts").seg("count");
        async move { stub.await }
    });

    send_hello(&server);

    let m1 = recv_json(&mut server).await;
    assert_eq!(m1["op"], "edge");
    let m2 = recv_json(&mut server).await;
    assert_eq!(m2, json!({"op": "get", "tok": 1, "name": "count"}));

    server
        .send(ServerMessage::Edge { tok: 1, re: 1, error: None }.to_wire().unwrap())
        .unwrap();
    server
        .send(
            ServerMessage::Get {
                tok: 1,
                re: 2,
                data: Some(json!(42)),
                error: None,
            }
            .to_wire()
            .unwrap(),
        )
        .unwrap();

    let got_a = a.await.unwrap().unwrap().into_value().unwrap();
    let got_b = b.await.unwrap().unwrap().into_value().unwrap();
    assert_eq!(got_a, Value::Int(42));
    assert_eq!(got_b, Value::Int(42));

    // No further client messages: the edge and the get were shared.
    server.close();
}

/// Method calls are never cached: two invocations, two wire messages.
#[tokio::test]
async fn method_calls_are_not_coalesced() {
    let (client_end, mut server) = Transport::pair();
    let client = Client::builder(queue_connector(vec![client_end])).build();

    let a = tokio::spawn({
        let stub = client.root().seg("posts").invoke("count", vec![]);
        async move { stub.await }
    });
    let b = tokio::spawn({
        let stub = client.root().seg("posts").invoke("count", vec![]);
        async move { stub.await }
    });

    send_hello(&server);

    // `re` is implicit: the 1-based arrival position of each message.
    let mut edge_count = 0;
    let mut get_seqs = Vec::new();
    for seq in 1..=3u64 {
        let m = recv_json(&mut server).await;
        match m["op"].as_str().unwrap() {
            "edge" => edge_count += 1,
            "get" => {
                assert_eq!(m["args"], json!([]));
                get_seqs.push(seq);
            }
            other => panic!("unexpected op {other}"),
        }
    }
    assert_eq!(edge_count, 1, "the shared edge is sent once");
    assert_eq!(get_seqs.len(), 2, "each call goes to the wire");

    server
        .send(ServerMessage::Edge { tok: 1, re: 1, error: None }.to_wire().unwrap())
        .unwrap();
    for re in get_seqs {
        server
            .send(
                ServerMessage::Get {
                    tok: 1,
                    re,
                    data: Some(json!(42)),
                    error: None,
                }
                .to_wire()
                .unwrap(),
            )
            .unwrap();
    }

    assert_eq!(a.await.unwrap().unwrap().into_value(), Some(Value::Int(42)));
    assert_eq!(b.await.unwrap().unwrap().into_value(), Some(Value::Int(42)));
}

// ---------------------------------------------------------------------------
// Reconnect
// ---------------------------------------------------------------------------

/// Transport loss with a pending terminal: the client emits `Disconnect`,
/// reconnects eagerly, replays the edge chain on the fresh session, and the
/// original await resolves.
#[tokio::test]
async fn in_flight_terminal_replays_on_reconnect() {
    let (first_client_end, mut first_server) = Transport::pair();
    let (second_client_end, mut second_server) = Transport::pair();
    let client = Client::builder(queue_connector(vec![first_client_end, second_client_end]))
        .config(fast_reconnect())
        .build();
    let mut events = client.subscribe();

    let resolve = tokio::spawn({
        let stub = client.root().seg("posts").invoke("count", vec![]);
        async move { stub.await }
    });

    send_hello(&first_server);
    let m1 = recv_json(&mut first_server).await;
    assert_eq!(m1["op"], "edge");
    let m2 = recv_json(&mut first_server).await;
    assert_eq!(m2["op"], "get");

    // Server dies before answering.
    first_server.close();

    // Fresh epoch: the full chain replays from scratch.
    send_hello(&second_server);
    let r1 = recv_json(&mut second_server).await;
    assert_eq!(r1, json!({"op": "edge", "tok": 0, "edge": "posts"}));
    let r2 = recv_json(&mut second_server).await;
    assert_eq!(r2, json!({"op": "get", "tok": 1, "name": "count", "args": []}));

    second_server
        .send(ServerMessage::Edge { tok: 1, re: 1, error: None }.to_wire().unwrap())
        .unwrap();
    second_server
        .send(
            ServerMessage::Get {
                tok: 1,
                re: 2,
                data: Some(json!(7)),
                error: None,
            }
            .to_wire()
            .unwrap(),
        )
        .unwrap();

    let got = resolve.await.unwrap().expect("replayed resolution succeeds");
    assert_eq!(got.into_value(), Some(Value::Int(7)));

    let first = events.recv().await.unwrap();
    assert_eq!(first, ClientEvent::Disconnect);
    let second = events.recv().await.unwrap();
    assert_eq!(second, ClientEvent::Reconnect);
}

/// With reconnect disabled, transport loss is terminal: pending work fails
/// with `CONNECTION_LOST`, and so do later calls.
#[tokio::test]
async fn disabled_reconnect_surfaces_connection_lost() {
    let (client_end, mut server) = Transport::pair();
    let client = Client::builder(queue_connector(vec![client_end]))
        .config(ClientConfig {
            reconnect: ReconnectPolicy::Disabled,
            ..ClientConfig::default()
        })
        .build();

    let resolve = tokio::spawn({
        let stub = client.root().seg("posts").invoke("count", vec![]);
        async move { stub.await }
    });

    send_hello(&server);
    let _edge = recv_json(&mut server).await;
    let _get = recv_json(&mut server).await;
    server.close();

    let err = resolve.await.unwrap().expect_err("must fail");
    assert_eq!(err.code(), Some(trellis_codec::ErrorCode::ConnectionLost));

    let err = client.root().seg("posts").seg("count").await.expect_err("still down");
    assert_eq!(err.code(), Some(trellis_codec::ErrorCode::ConnectionLost));
}

/// A connector that never succeeds exhausts the schedule: `ReconnectFailed`
/// is emitted and the pending terminal fails with `CONNECTION_LOST`.
#[tokio::test]
async fn exhausted_retries_fail_pending_terminals() {
    let client = Client::builder(queue_connector(vec![]))
        .config(fast_reconnect())
        .build();
    let mut events = client.subscribe();

    let err = client
        .root()
        .seg("posts")
        .seg("count")
        .await
        .expect_err("no server exists");
    assert_eq!(err.code(), Some(trellis_codec::ErrorCode::ConnectionLost));
    assert_eq!(events.recv().await.unwrap(), ClientEvent::ReconnectFailed);
}

/// `close()` is idempotent and fails in-flight work with `CLIENT_CLOSED`.
#[tokio::test]
async fn close_is_idempotent_and_fails_in_flight() {
    let (client_end, mut server) = Transport::pair();
    let client = Client::builder(queue_connector(vec![client_end])).build();

    let resolve = tokio::spawn({
        let stub = client.root().seg("posts").invoke("count", vec![]);
        async move { stub.await }
    });

    send_hello(&server);
    let _edge = recv_json(&mut server).await;
    let _get = recv_json(&mut server).await;

    client.close();
    client.close();

    let err = resolve.await.unwrap().expect_err("closed mid-flight");
    assert_eq!(err.code(), Some(trellis_codec::ErrorCode::ClientClosed));

    let err = client.root().seg("posts").await.expect_err("closed");
    assert_eq!(err.code(), Some(trellis_codec::ErrorCode::ClientClosed));
}
