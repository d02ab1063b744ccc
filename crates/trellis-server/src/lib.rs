// trellis-server: the server half of the session core.
//
// A `Server` owns a class registry (the resolved graph surface), a codec,
// config, and a middleware chain.  `serve_connection` runs one transport to
// completion: hello, per-message dispatch through the token manager and node
// cache, resource-bound enforcement, and cleanup.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod graph;
pub mod middleware;
pub mod schema;
pub mod session;
pub mod tokens;

pub use config::{ConfigError, ServerConfig};
pub use dispatch::{Server, ServerBuilder};
pub use error::OpError;
pub use events::ServerEvent;
pub use graph::{
    ClassDef, ClassRegistry, ConnContext, GraphNode, HandlerError, NodeRef, PathRecorder,
    validators,
};
pub use middleware::{Middleware, MiddlewareHandle, Next, OpInfo, OpKind, OpResult};
pub use session::OpContext;
