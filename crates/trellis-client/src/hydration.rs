//! Hydration cache: a one-shot, pre-populated cache that answers lookups
//! before any transport exists.
//!
//! Activated with a decoded SSR payload; consulted by `resolve` before the
//! wire pipeline.  A hit short-circuits the transport entirely.  After every
//! hit the cache schedules its own drop with two-step timing: a queued
//! microtask arms the inactivity timer, so bursts of synchronous hits don't
//! race the drop.  Any new hit cancels the pending timer.

use crate::classify::classify;
use crate::error::ClientError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use trellis_codec::{Codec, ErrorCode, Path, Segment, Value, args_key, segment_key};
use trellis_protocol::{HydrationEntry, HydrationPayload, Schema};

/// A cache answer: a terminal value or a node data snapshot.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum HydrationHit {
    Value(Value),
    Node(Value),
}

struct HydrationState {
    schema: Schema,
    path_to_token: HashMap<String, u64>,
    data: HashMap<u64, Value>,
    /// Keyed by `(token, method, fmt(args))`.
    calls: HashMap<(u64, String, String), Value>,
}

struct HydrationInner {
    state: Option<HydrationState>,
    /// Bumped on every hit and explicit drop; a pending timer only fires if
    /// its generation is still current.
    generation: u64,
}

#[derive(Clone)]
pub(crate) struct HydrationCache {
    inner: Arc<Mutex<HydrationInner>>,
    timeout: Duration,
}

impl HydrationCache {
    /// Build from a revived payload.  `refs[i]` defines token `i + 1`;
    /// token 0 is the root.
    pub(crate) fn activate(
        codec: &Codec,
        payload: &HydrationPayload,
        timeout: Duration,
    ) -> Result<HydrationCache, ClientError> {
        let mut keys: Vec<String> = vec![Path::root().key()];
        let mut path_to_token: HashMap<String, u64> = HashMap::new();
        path_to_token.insert(Path::root().key(), 0);

        for (i, r) in payload.refs.iter().enumerate() {
            let parent_key = keys.get(r.parent as usize).ok_or_else(|| {
                ClientError::local(
                    ErrorCode::InvalidPath,
                    format!("hydration ref {i} names unknown parent token {}", r.parent),
                )
            })?;
            let args = codec
                .revive_args(&r.args)
                .map_err(|e| ClientError::Codec(e.to_string()))?;
            let seg = if args.is_empty() {
                Segment::prop(&r.edge)
            } else {
                Segment::call(&r.edge, args)
            };
            let key = format!("{parent_key}{}", segment_key(&seg));
            path_to_token.insert(key.clone(), (i + 1) as u64);
            keys.push(key);
        }

        let mut data = HashMap::new();
        let mut calls = HashMap::new();
        for entry in &payload.data {
            match entry {
                HydrationEntry::Snapshot { token, value } => {
                    let value = codec
                        .revive(value.clone())
                        .map_err(|e| ClientError::Codec(e.to_string()))?;
                    data.insert(*token, value);
                }
                HydrationEntry::Call {
                    token,
                    method,
                    args,
                    result,
                } => {
                    let args = codec
                        .revive_args(args)
                        .map_err(|e| ClientError::Codec(e.to_string()))?;
                    let result = codec
                        .revive(result.clone())
                        .map_err(|e| ClientError::Codec(e.to_string()))?;
                    calls.insert((*token, method.clone(), args_key(&args)), result);
                }
            }
        }

        Ok(HydrationCache {
            inner: Arc::new(Mutex::new(HydrationInner {
                state: Some(HydrationState {
                    schema: payload.schema.clone(),
                    path_to_token,
                    data,
                    calls,
                }),
                generation: 0,
            })),
            timeout,
        })
    }

    /// The lookup protocol.  Misses fall through to the live session; a
    /// classification failure is a real error even before any transport.
    pub(crate) fn lookup(&self, path: &Path) -> Result<Option<HydrationHit>, ClientError> {
        let hit = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let Some(state) = &inner.state else {
                return Ok(None);
            };
            let classified = classify(path, &state.schema)?;
            let edge_key = slice_key(classified.edge_path);
            let Some(&tok) = state.path_to_token.get(&edge_key) else {
                return Ok(None);
            };
            match classified.terminal {
                Some(seg) => {
                    let args = seg.args.as_deref().unwrap_or(&[]);
                    let call_key = (tok, seg.name.clone(), args_key(args));
                    if let Some(v) = state.calls.get(&call_key) {
                        Some(HydrationHit::Value(v.clone()))
                    } else if args.is_empty() {
                        // Bare reads may fall back to the snapshot; a call
                        // with any args requires an exact call-cache hit.
                        state
                            .data
                            .get(&tok)
                            .and_then(|snap| snap.get(&seg.name))
                            .map(|v| HydrationHit::Value(v.clone()))
                    } else {
                        None
                    }
                }
                None => state.data.get(&tok).map(|snap| HydrationHit::Node(snap.clone())),
            }
        };
        if hit.is_some() {
            self.schedule_drop();
        }
        Ok(hit)
    }

    /// Two-step drop: queue a task that only then arms the inactivity
    /// timer, so the timer starts after the in-flight chain has drained.
    fn schedule_drop(&self) {
        let generation = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.generation += 1;
            inner.generation
        };
        let inner = self.inner.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            tokio::time::sleep(timeout).await;
            let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
            if guard.generation == generation && guard.state.is_some() {
                debug!("hydration cache dropped after inactivity");
                guard.state = None;
            }
        });
    }

    /// Explicit drop; idempotent, cancels any pending timer.
    pub(crate) fn drop_cache(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.state = None;
        inner.generation += 1;
    }

    pub(crate) fn is_active(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .state
            .is_some()
    }
}

fn slice_key(segments: &[Segment]) -> String {
    let mut key = Path::root().key();
    for seg in segments {
        key.push_str(&segment_key(seg));
    }
    key
}
