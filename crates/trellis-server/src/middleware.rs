//! Middleware: an ordered chain of handlers wrapped around every operation.
//!
//! First registered is outermost.  The chain is snapshotted at operation
//! start; removals mid-operation do not affect in-flight chains.

use crate::error::OpError;
use crate::session::OpContext;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use trellis_codec::Value;

pub type OpResult = Result<Value, OpError>;

/// Continuation to the next link (innermost: the operation itself).
pub type Next = Box<dyn FnOnce() -> BoxFuture<'static, OpResult> + Send>;

/// Operation metadata visible to middleware.
#[derive(Debug, Clone)]
pub struct OpInfo {
    pub kind: OpKind,
    pub tok: u64,
    /// Edge or terminal name; `None` for data fetches.
    pub name: Option<String>,
    /// The 1-based wire sequence number of the message.
    pub message_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Edge,
    Get,
    Data,
}

pub trait Middleware: Send + Sync {
    fn handle(
        &self,
        ctx: OpContext,
        info: Arc<OpInfo>,
        next: Next,
    ) -> BoxFuture<'static, OpResult>;
}

/// Opaque handle for removing a registered middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiddlewareHandle(pub(crate) u64);

/// Compose a snapshot right-to-left into a single entry closure.
pub(crate) fn compose(
    snapshot: Vec<Arc<dyn Middleware>>,
    ctx: OpContext,
    info: Arc<OpInfo>,
    innermost: Next,
) -> Next {
    let mut next = innermost;
    for mw in snapshot.into_iter().rev() {
        let ctx = ctx.clone();
        let info = info.clone();
        next = Box::new(move || mw.handle(ctx, info, next));
    }
    next
}
