// trellis-client: the client half of the session core.
//
// A `Client` hands out synchronous `Stub`s that build paths; awaiting a stub
// classifies the path against the session schema, pipelines edge messages,
// coalesces identical work, and materializes data or child stubs.  The
// transport is opened lazily, survives loss via the reconnect controller,
// and can be preceded entirely by a hydration cache.

pub mod classify;
pub mod config;
pub mod error;
pub mod events;
pub mod hydration;
pub mod reconnect;
pub mod session;
pub mod stub;

pub use config::{ClientConfig, ConfigError, ReconnectPolicy};
pub use error::ClientError;
pub use events::ClientEvent;
pub use reconnect::Backoff;
pub use session::{Client, ClientBuilder};
pub use stub::{DataProxy, Fetched, Field, Stub};
