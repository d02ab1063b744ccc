//! Token manager and node cache: lazy, ordered handle allocation with
//! coalesced resolution and failure caching.
//!
//! Tokens are dense and append-only; `tokens[0]` is always the root.
//! `claim` is synchronous so a child edge message arriving in the same batch
//! as its parent can reference the parent token before the parent edge has
//! resolved — the core of pipelining.
//!
//! Cache entries hold a resolve thunk and a lazily-materialized shared
//! future.  Two messages resolving to the same canonical key share the same
//! future, therefore the same node instance.  A rejected future is cached
//! like a successful one: the token is poisoned and every use returns the
//! same cause.

use crate::error::{OpError, wrap_handler_error};
use crate::graph::{NodeRef, visible};
use crate::session::{ConnCore, OpContext};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use trellis_codec::{
    ErrorCode, MAX_PATH_DEPTH, Path, Segment, WireError, key_is_descendant, segment_key,
};

pub type NodeResult = Result<NodeRef, OpError>;
pub type NodeFuture = Shared<BoxFuture<'static, NodeResult>>;
pub type ResolveFn = Arc<dyn Fn() -> BoxFuture<'static, NodeResult> + Send + Sync>;

struct LazyEntry {
    resolve: ResolveFn,
    /// Materialized on first demand; `None` after invalidation.
    cell: Option<NodeFuture>,
}

impl LazyEntry {
    fn settled(&self) -> bool {
        self.cell.as_ref().is_some_and(|f| f.peek().is_some())
    }
}

struct TokenRecord {
    key: String,
    depth: usize,
}

struct TokensInner {
    tokens: Vec<TokenRecord>,
    cache: HashMap<String, LazyEntry>,
}

pub struct TokenManager {
    inner: Mutex<TokensInner>,
    max_tokens: usize,
}

impl TokenManager {
    pub fn new(root: NodeRef, max_tokens: usize) -> TokenManager {
        let root_key = Path::root().key();
        let mut cache = HashMap::new();
        cache.insert(
            root_key.clone(),
            LazyEntry {
                resolve: Arc::new(move || {
                    let root = root.clone();
                    async move { Ok(root) }.boxed()
                }),
                cell: None,
            },
        );
        TokenManager {
            inner: Mutex::new(TokensInner {
                tokens: vec![TokenRecord {
                    key: root_key,
                    depth: 0,
                }],
                cache,
            }),
            max_tokens,
        }
    }

    /// Number of tokens allocated so far, root included.
    pub fn token_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).tokens.len()
    }

    /// Whether the last `claim` pushed the session over its token budget.
    pub fn over_limit(&self) -> bool {
        self.token_count() > self.max_tokens
    }

    pub fn key_of(&self, tok: u64) -> Option<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.tokens.get(tok as usize).map(|r| r.key.clone())
    }

    /// Synchronously allocate the next token for an edge off `parent_tok`.
    ///
    /// Installs a lazy cache entry for the child key if absent.  The caller
    /// must check `over_limit` afterwards and close the connection when the
    /// budget is crossed.
    pub fn claim(
        &self,
        core: &Weak<ConnCore>,
        parent_tok: u64,
        seg: Segment,
    ) -> Result<(u64, String), WireError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let parent = inner
            .tokens
            .get(parent_tok as usize)
            .ok_or_else(|| WireError::new(ErrorCode::InvalidToken, format!("unknown token {parent_tok}")))?;
        let depth = parent.depth + 1;
        if depth > MAX_PATH_DEPTH {
            return Err(WireError::new(ErrorCode::InvalidPath, "path exceeds max depth"));
        }
        let parent_key = parent.key.clone();
        let key = format!("{parent_key}{}", segment_key(&seg));

        let tok = inner.tokens.len() as u64;
        inner.tokens.push(TokenRecord {
            key: key.clone(),
            depth,
        });
        inner
            .cache
            .entry(key.clone())
            .or_insert_with(|| LazyEntry {
                resolve: edge_resolve(core.clone(), parent_key, seg),
                cell: None,
            });
        Ok((tok, key))
    }

    /// The shared resolution future for a cache entry, materializing it on
    /// first demand.
    pub fn entry_future(&self, key: &str) -> Result<NodeFuture, WireError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner.cache.get_mut(key).ok_or_else(|| {
            WireError::new(ErrorCode::InternalError, format!("no cache entry for {key}"))
        })?;
        Ok(match &entry.cell {
            Some(fut) => fut.clone(),
            None => {
                let fut = (entry.resolve)().shared();
                entry.cell = Some(fut.clone());
                fut
            }
        })
    }

    /// Resolve a token to its node future.
    pub fn resolve_token(&self, tok: u64) -> Result<NodeFuture, WireError> {
        let key = self
            .key_of(tok)
            .ok_or_else(|| WireError::new(ErrorCode::InvalidToken, format!("unknown token {tok}")))?;
        self.entry_future(&key)
    }

    /// Ensure cache entries exist along every prefix of `path`, creating
    /// lazy entries where missing.  No tokens are allocated — only edge
    /// messages allocate tokens.  Returns the leaf key.
    pub fn ensure_chain(&self, core: &Weak<ConnCore>, path: &Path) -> Result<String, WireError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut key = Path::root().key();
        for seg in &path.segments {
            let parent_key = key.clone();
            key.push_str(&segment_key(seg));
            if !inner.cache.contains_key(&key) {
                inner.cache.insert(
                    key.clone(),
                    LazyEntry {
                        resolve: edge_resolve(core.clone(), parent_key, seg.clone()),
                        cell: None,
                    },
                );
            }
        }
        Ok(key)
    }

    /// Invalidation for `ref`: force-reset the leaf (even mid-flight), then
    /// invalidate settled descendants only.  In-flight descendants are
    /// deliberately left alone.
    pub fn invalidate_for_ref(&self, leaf_key: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(leaf) = inner.cache.get_mut(leaf_key) {
            leaf.cell = None;
        }
        for (key, entry) in &mut inner.cache {
            if key != leaf_key && key_is_descendant(key, leaf_key) && entry.settled() {
                entry.cell = None;
            }
        }
    }

    /// Drop everything on connection close.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.cache.clear();
        inner.tokens.clear();
    }
}

/// The resolve thunk installed for an edge entry: await the parent entry,
/// check the edge's declaration and visibility, invoke the user edge
/// implementation.  Failures are classified under `EDGE_ERROR`; a poisoned
/// parent propagates its own cause unchanged.
fn edge_resolve(core: Weak<ConnCore>, parent_key: String, seg: Segment) -> ResolveFn {
    Arc::new(move || {
        let core = core.clone();
        let parent_key = parent_key.clone();
        let seg = seg.clone();
        async move {
            let core = core.upgrade().ok_or_else(|| {
                OpError::wire(ErrorCode::ConnectionClosed, "connection closed")
            })?;
            let parent_fut = core
                .tokens
                .entry_future(&parent_key)
                .map_err(OpError::Wire)?;
            let parent = parent_fut.await?;

            let class = core.registry.get(parent.class_name()).ok_or_else(|| {
                OpError::wire(
                    ErrorCode::InternalError,
                    format!("unregistered class '{}'", parent.class_name()),
                )
            })?;
            let edge = class.find_edge(&seg.name).ok_or_else(|| {
                OpError::wire(
                    ErrorCode::EdgeNotFound,
                    format!("no edge '{}' on {}", seg.name, class.name),
                )
            })?;
            if !visible(edge.visibility.as_ref(), &core.ctx) {
                return Err(OpError::wire(
                    ErrorCode::EdgeNotFound,
                    format!("no edge '{}' on {}", seg.name, class.name),
                ));
            }

            let ctx = OpContext::connection_scoped(core.clone());
            let args = seg.args.clone().unwrap_or_default();
            parent
                .edge(&seg.name, args, ctx)
                .await
                .map_err(|e| wrap_handler_error(&core.codec, ErrorCode::EdgeError, e))
        }
        .boxed()
    })
}

