//! Read-after-write via references: a mutation returns a reference to the
//! node's canonical path, which refreshes the client's caches so subsequent
//! awaits see the new data with zero additional wire messages.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use trellis::Value;
use trellis::client::{Client, Fetched};
use trellis::server::ServerConfig;
use trellis_test_utils::{blog_server, counting_connector, init_tracing};

#[tokio::test]
async fn mutation_reference_refreshes_the_data_cache() {
    init_tracing();
    let (server, _store) = blog_server(ServerConfig::default()).unwrap();
    let sent = Arc::new(AtomicUsize::new(0));
    let client = Client::builder(counting_connector(server, sent.clone())).build();

    let post = client.root().seg("posts").invoke("get", vec![Value::str("1")]);

    let before = post
        .clone()
        .await
        .expect("initial fetch")
        .into_node()
        .expect("proxy");
    assert_eq!(before.get("title"), Some(&Value::str("Original")));
    let after_initial = sent.load(Ordering::SeqCst);

    // The mutation's return value is the reference itself.
    let returned = post
        .clone()
        .invoke("setTitle", vec![Value::str("New")])
        .await
        .expect("mutation resolves")
        .into_value()
        .expect("terminal value");
    match &returned {
        Value::Reference { data, .. } => {
            assert_eq!(data.get("title"), Some(&Value::str("New")));
        }
        other => panic!("expected a reference, got {other:?}"),
    }
    let after_mutation = sent.load(Ordering::SeqCst);
    assert_eq!(after_mutation, after_initial + 1, "one get for the call");

    // Re-awaiting the post reads the refreshed snapshot from cache.
    let after = post
        .clone()
        .await
        .expect("cached fetch")
        .into_node()
        .expect("proxy");
    assert_eq!(after.get("title"), Some(&Value::str("New")));
    assert_eq!(
        sent.load(Ordering::SeqCst),
        after_mutation,
        "zero additional wire messages after the reference"
    );

    // Field reads on the refreshed token come from the same snapshot.
    let title = post
        .seg("title")
        .await
        .expect("field read")
        .into_value()
        .expect("value");
    assert_eq!(title, Value::str("New"));
    assert_eq!(sent.load(Ordering::SeqCst), after_mutation);
}

#[tokio::test]
async fn reference_eviction_gives_descendants_fresh_tokens() {
    init_tracing();
    let (server, _store) = blog_server(ServerConfig::default()).unwrap();
    let sent = Arc::new(AtomicUsize::new(0));
    let client = Client::builder(counting_connector(server, sent.clone())).build();

    let post = client.root().seg("posts").invoke("get", vec![Value::str("1")]);

    // Navigate a descendant so its edge is cached.
    let author = post
        .clone()
        .seg("author")
        .await
        .expect("author fetch")
        .into_node()
        .expect("proxy");
    assert_eq!(author.get("name"), Some(&Value::str("ada")));
    let before = sent.load(Ordering::SeqCst);

    // Mutate the post; its reference evicts descendant edges.
    post.clone()
        .invoke("setTitle", vec![Value::str("Edited")])
        .await
        .expect("mutation");

    // The author edge must be re-sent on next navigation (fresh token).
    let author_again = post
        .seg("author")
        .await
        .expect("author refetch")
        .into_node()
        .expect("proxy");
    assert_eq!(author_again.get("name"), Some(&Value::str("ada")));
    let after = sent.load(Ordering::SeqCst);
    // setTitle get + replayed author edge + author data.
    assert_eq!(after, before + 3);
}

#[tokio::test]
async fn returned_error_like_values_resolve_not_reject() {
    init_tracing();
    // Thrown values go to `error`; RETURNED values go to `data` — even when
    // they look like errors.  `count` returns a plain value and must arrive
    // as a resolution.
    let (server, _store) = blog_server(ServerConfig::default()).unwrap();
    let sent = Arc::new(AtomicUsize::new(0));
    let client = Client::builder(counting_connector(server, sent)).build();

    let got = client
        .root()
        .seg("posts")
        .invoke("count", vec![])
        .await
        .expect("resolves");
    assert!(matches!(got, Fetched::Value(Value::Int(2))));
}
