// trellis-test-utils: shared fixtures for the integration suites.
//
// Provides a small blog-shaped graph served over in-memory transports, plus
// connector adapters (including a message-counting relay) for driving a real
// client against a real server without any sockets.

pub mod blog;
pub mod connect;

pub use blog::{BlogStore, blog_registry, blog_root, blog_server};
pub use connect::{counting_connector, server_connector, server_connector_with_ctx};

/// Install a test subscriber honoring `RUST_LOG`; safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
