//! Failure poisoning: a failed edge poisons its token, every dependent
//! operation fails with the same cause, and the cached rejection is stable
//! across retries.

use trellis::ErrorCode;
use trellis::Value;
use trellis::client::Client;
use trellis::server::{ServerConfig, ServerEvent};
use trellis_test_utils::{blog_server, init_tracing, server_connector};

fn unredacted() -> ServerConfig {
    ServerConfig {
        redact_errors: false,
        ..ServerConfig::default()
    }
}

#[tokio::test]
async fn failed_edge_poisons_dependent_operations_with_the_same_cause() {
    init_tracing();
    let (server, _store) = blog_server(unredacted()).unwrap();
    let client = Client::builder(server_connector(server)).build();

    let missing = client.root().seg("posts").invoke("get", vec![Value::str("999")]);

    // The data fetch pipelined behind the failing edge carries the cause.
    let err = missing.clone().await.expect_err("data fetch fails");
    assert_eq!(err.code(), Some(ErrorCode::EdgeError));
    assert!(err.to_string().contains("Post 999 not found"), "got: {err}");
    assert!(err.error_id().is_some(), "identifier must be attached");

    // A terminal read through the same poisoned token: same cause.
    let err2 = missing.clone().seg("title").await.expect_err("get fails");
    assert_eq!(err2.code(), Some(ErrorCode::EdgeError));
    assert!(err2.to_string().contains("Post 999 not found"));

    // A child edge under the poisoned token: still the same cause.
    let err3 = missing.seg("author").await.expect_err("descendant fails");
    assert_eq!(err3.code(), Some(ErrorCode::EdgeError));
    assert!(err3.to_string().contains("Post 999 not found"));
}

#[tokio::test]
async fn poisoned_entries_are_cached_not_retried() {
    init_tracing();
    let (server, store) = blog_server(unredacted()).unwrap();
    let client = Client::builder(server_connector(server)).build();

    let missing = client.root().seg("posts").invoke("get", vec![Value::str("404")]);
    let err = missing.clone().await.expect_err("first attempt fails");
    assert!(err.to_string().contains("Post 404 not found"));

    // Even after the post appears, the poisoned entry keeps rejecting within
    // this session: no retry happens.
    store.insert(trellis_test_utils::blog::PostRecord {
        id: "404".to_owned(),
        title: "Late".to_owned(),
        author: "ada".to_owned(),
    });
    let err = missing.seg("title").await.expect_err("still poisoned");
    assert!(err.to_string().contains("Post 404 not found"));
}

#[tokio::test]
async fn redaction_keeps_the_code_and_hides_the_message() {
    init_tracing();
    let (server, _store) = blog_server(ServerConfig::default()).unwrap();
    let mut events = server.subscribe();
    let client = Client::builder(server_connector(server)).build();

    let err = client
        .root()
        .seg("posts")
        .invoke("get", vec![Value::str("999")])
        .await
        .expect_err("fails");
    assert_eq!(err.code(), Some(ErrorCode::EdgeError));
    assert!(
        !err.to_string().contains("999"),
        "wrapped message must be redacted, got: {err}"
    );
    let client_id = err.error_id().expect("identifier survives redaction");

    // The emitted event carries the original message and the same id.
    let mut matched = false;
    while let Ok(event) = events.try_recv() {
        if let ServerEvent::OperationError {
            error_id, message, ..
        } = event
        {
            if error_id == client_id {
                assert!(message.contains("Post 999 not found"));
                matched = true;
            }
        }
    }
    assert!(matched, "operation_error event must correlate by id");
}
