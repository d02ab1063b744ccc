//! Per-connection session core and the per-operation context handed to user
//! handler code.

use crate::error::OpError;
use crate::graph::{ClassRegistry, ConnContext, HandlerError};
use crate::tokens::TokenManager;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use trellis_codec::{Codec, Path, Value};

/// State owned exclusively by one connection: context, token space, caches.
/// Dies with the transport.
pub struct ConnCore {
    pub ctx: ConnContext,
    pub registry: Arc<ClassRegistry>,
    pub codec: Arc<Codec>,
    pub tokens: TokenManager,
    /// Class name → schema index for this connection; absent classes are
    /// hidden from this context.
    pub class_index: HashMap<String, u16>,
    /// Cancelled when the connection closes; parent of every op token.
    pub abort: CancellationToken,
}

impl ConnCore {
    /// Run a class's canonical-path recipe against a recorder.
    fn canonical_path(&self, class: &str, args: &[Value]) -> Result<Path, HandlerError> {
        let def = self
            .registry
            .get(class)
            .ok_or_else(|| HandlerError::msg(format!("unknown class '{class}'")))?;
        let recipe = def
            .canonical_path
            .as_ref()
            .ok_or_else(|| HandlerError::msg(format!("class '{class}' has no canonical path")))?;
        let mut rec = crate::graph::PathRecorder::new();
        recipe(&mut rec, args);
        let path = rec.into_path();
        if path.len() > trellis_codec::MAX_PATH_DEPTH {
            return Err(HandlerError::msg(format!(
                "canonical path for '{class}' exceeds max depth"
            )));
        }
        Ok(path)
    }
}

/// The ambient per-operation context threaded through handler invocations.
///
/// Cheap to clone; carries the connection's session state and an abort
/// signal composed from the connection signal and (for dispatched
/// operations) the operation-timeout signal.
#[derive(Clone)]
pub struct OpContext {
    core: Arc<ConnCore>,
    abort: CancellationToken,
}

impl OpContext {
    pub(crate) fn new(core: Arc<ConnCore>, abort: CancellationToken) -> OpContext {
        OpContext { core, abort }
    }

    /// Context scoped to the connection rather than one operation; used for
    /// cached edge resolution, which outlives any single message.
    pub(crate) fn connection_scoped(core: Arc<ConnCore>) -> OpContext {
        let abort = core.abort.clone();
        OpContext { core, abort }
    }

    pub fn context(&self) -> &ConnContext {
        &self.core.ctx
    }

    /// The operation's abort signal.  Cancelled on connection close and on
    /// operation timeout; long-running handlers should consult it at
    /// suspension points.
    pub fn abort(&self) -> &CancellationToken {
        &self.abort
    }

    pub(crate) fn core(&self) -> &Arc<ConnCore> {
        &self.core
    }

    /// `ref(Class, …args)`: recompute a node and return a reference carrying
    /// its canonical path and a fresh data snapshot.
    ///
    /// This is the sole cache-invalidation entry point: the leaf entry is
    /// force-reset, settled descendants are invalidated, then the fresh leaf
    /// is awaited and snapshotted.
    pub async fn reference(&self, class: &str, args: &[Value]) -> Result<Value, HandlerError> {
        let path = self.core.canonical_path(class, args)?;
        let weak = Arc::downgrade(&self.core);
        let leaf_key = self
            .core
            .tokens
            .ensure_chain(&weak, &path)
            .map_err(HandlerError::Framework)?;
        self.core.tokens.invalidate_for_ref(&leaf_key);
        let fut = self
            .core
            .tokens
            .entry_future(&leaf_key)
            .map_err(HandlerError::Framework)?;
        let node = fut.await.map_err(op_error_to_handler)?;
        let data = node.snapshot()?;
        Ok(Value::Reference {
            path,
            data: Box::new(data),
        })
    }

    /// Build a path argument (a data-less pointer into the graph) for a
    /// class visible from this connection.
    pub fn path_arg(&self, class: &str, args: &[Value]) -> Result<Value, HandlerError> {
        if !self.core.class_index.contains_key(class) {
            return Err(HandlerError::msg(format!(
                "class '{class}' is not reachable in this connection's schema"
            )));
        }
        let path = self.core.canonical_path(class, args)?;
        Ok(Value::PathArg(path))
    }
}

fn op_error_to_handler(e: OpError) -> HandlerError {
    match e {
        OpError::Wire(w) | OpError::Wrapped(w) => HandlerError::Framework(w),
        OpError::Custom(v) => HandlerError::Custom(v),
    }
}
