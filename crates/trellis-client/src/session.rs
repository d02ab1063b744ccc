//! The live client session: lazy connect, edge-send dedup with pipelined
//! token allocation, coalescing caches, reference-driven invalidation, and
//! the reconnect controller.
//!
//! # Epochs
//! All connection-scoped state (edge dedup map, token maps, data caches,
//! wire-pending table, counters) lives in a `Session` and dies with its
//! transport.  A disconnect wipes the session; pending user awaits are NOT
//! wiped — each one replays by path on the next epoch.

use crate::classify::classify;
use crate::config::ClientConfig;
use crate::error::{ClientError, IssueFailure};
use crate::events::ClientEvent;
use crate::hydration::{HydrationCache, HydrationHit};
use crate::stub::{DataProxy, Fetched, Stub};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trellis_codec::{Codec, ErrorCode, Path, Segment, Value, key_is_descendant, segment_key};
use trellis_protocol::{
    ClientMessage, Connect, HydrationPayload, Schema, ServerMessage, TransportSender, WIRE_VERSION,
};

type EdgeFuture = Shared<BoxFuture<'static, Result<u64, IssueFailure>>>;
type ValueFuture = Shared<BoxFuture<'static, Result<Value, IssueFailure>>>;

const EVENT_CAPACITY: usize = 32;

// ---------------------------------------------------------------------------
// Client + builder
// ---------------------------------------------------------------------------

pub struct ClientBuilder {
    connector: Arc<dyn Connect>,
    codec: Codec,
    config: ClientConfig,
}

impl ClientBuilder {
    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Client {
        let (phase_tx, _) = watch::channel(0u64);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Client {
            inner: Arc::new(ClientInner {
                codec: Arc::new(self.codec),
                connector: self.connector,
                config: self.config,
                state: Mutex::new(Phase::Idle),
                phase_tx,
                events,
                pending_terminals: AtomicUsize::new(0),
                hydration: Mutex::new(None),
                next_epoch: AtomicU64::new(1),
            }),
        }
    }
}

/// The client half of the session core.  Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

pub(crate) struct ClientInner {
    codec: Arc<Codec>,
    connector: Arc<dyn Connect>,
    config: ClientConfig,
    state: Mutex<Phase>,
    /// Version counter bumped on every phase transition; waiters subscribe.
    phase_tx: watch::Sender<u64>,
    events: broadcast::Sender<ClientEvent>,
    /// In-flight user awaits (live-session ones; hydration hits don't count).
    pending_terminals: AtomicUsize,
    hydration: Mutex<Option<HydrationCache>>,
    next_epoch: AtomicU64,
}

enum Phase {
    /// No transport; the next operation opens one lazily.
    Idle,
    Connecting,
    Ready(Arc<Session>),
    /// Retries exhausted; operations fail `CONNECTION_LOST` until a manual
    /// `reconnect()`.
    Exhausted,
    Closed,
}

impl Client {
    pub fn builder(connector: impl Connect) -> ClientBuilder {
        ClientBuilder {
            connector: Arc::new(connector),
            codec: Codec::default(),
            config: ClientConfig::default(),
        }
    }

    /// The root stub (token 0).
    pub fn root(&self) -> Stub {
        Stub::new(self.clone(), Path::root())
    }

    /// A stub at an arbitrary path; how server-returned path arguments are
    /// turned back into awaitable handles.
    pub fn stub_at(&self, path: Path) -> Stub {
        Stub::new(self.clone(), path)
    }

    /// A stub for a decoded `Value::PathArg`.
    pub fn stub_for(&self, value: &Value) -> Option<Stub> {
        match value {
            Value::PathArg(path) => Some(self.stub_at(path.clone())),
            _ => None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Resolves once the server hello has been received, opening the
    /// transport if necessary.
    pub async fn ready(&self) -> Result<(), ClientError> {
        ensure_session(&self.inner).await.map(drop)
    }

    /// Activate the hydration cache from a decoded payload (pre-parsed
    /// flattened form).  Consulted before any transport is touched.
    pub fn hydrate(&self, payload: &Json) -> Result<(), ClientError> {
        let payload = HydrationPayload::from_flattened(payload)
            .map_err(|e| ClientError::local(ErrorCode::ValidationError, e.to_string()))?;
        let cache = HydrationCache::activate(
            &self.inner.codec,
            &payload,
            self.inner.config.hydration_timeout,
        )?;
        *self
            .inner
            .hydration
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(cache);
        Ok(())
    }

    /// Drop the hydration cache; idempotent.
    pub fn end_hydration(&self) {
        if let Some(cache) = self
            .inner
            .hydration
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            cache.drop_cache();
        }
    }

    /// Close the client; idempotent.  In-flight operations fail with
    /// `CLIENT_CLOSED`.
    pub fn close(&self) {
        let prev = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(*state, Phase::Closed) {
                return;
            }
            std::mem::replace(&mut *state, Phase::Closed)
        };
        self.inner.phase_tx.send_modify(|v| *v += 1);
        if let Phase::Ready(session) = prev {
            session.shutdown(IssueFailure::Failed(ClientError::local(
                ErrorCode::ClientClosed,
                "client closed",
            )));
        }
        info!("client closed");
    }

    /// Manually restart after exhausted retries.  No-op while connected,
    /// closed, or with reconnect disabled.
    pub fn reconnect(&self) {
        if !self.inner.config.reconnect.enabled() {
            return;
        }
        {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                Phase::Exhausted => *state = Phase::Connecting,
                _ => return,
            }
        }
        self.inner.phase_tx.send_modify(|v| *v += 1);
        tokio::spawn(connect_loop(self.inner.clone(), true));
    }

    /// Resolve a path: hydration prelude first, then the live session, with
    /// transparent replay across reconnects.
    pub(crate) async fn resolve(&self, path: Path) -> Result<Fetched, ClientError> {
        let cache = self
            .inner
            .hydration
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(cache) = cache {
            if let Some(hit) = cache.lookup(&path)? {
                debug!(key = %path.key(), "hydration hit");
                return Ok(match hit {
                    HydrationHit::Value(v) => Fetched::Value(v),
                    HydrationHit::Node(snap) => {
                        Fetched::Node(DataProxy::new(self.clone(), path, snap))
                    }
                });
            }
        }

        let _guard = TerminalGuard::new(self.inner.clone());
        loop {
            let session = ensure_session(&self.inner).await?;
            match issue_on(self, &session, &path).await {
                Ok(got) => return Ok(got),
                Err(IssueFailure::Reconnecting) => {
                    // Swallow the sentinel; the terminal stays pending and
                    // replays on the next epoch.
                    wait_past_stale(&self.inner, &session).await;
                }
                Err(IssueFailure::Failed(e)) => return Err(e),
            }
        }
    }
}

/// RAII counter of in-flight user awaits; its value at disconnect decides
/// eager vs deferred reconnection.
struct TerminalGuard {
    inner: Arc<ClientInner>,
}

impl TerminalGuard {
    fn new(inner: Arc<ClientInner>) -> TerminalGuard {
        inner.pending_terminals.fetch_add(1, Ordering::SeqCst);
        TerminalGuard { inner }
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        self.inner.pending_terminals.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

pub(crate) struct Session {
    epoch: u64,
    schema: Schema,
    tx: TransportSender,
    /// Cancelled on explicit client close; stops the reader.
    closed_token: CancellationToken,
    st: Mutex<SessionMaps>,
}

struct SessionMaps {
    /// Sent-edge dedup: canonical key → shared token future.
    resolved_edges: HashMap<String, EdgeFuture>,
    /// Synchronous reverse lookup for incoming-reference invalidation.
    path_to_token: HashMap<String, u64>,
    live_data: HashMap<u64, Value>,
    get_cache: HashMap<(u64, String), ValueFuture>,
    data_load: HashMap<u64, ValueFuture>,
    pending: HashMap<u64, oneshot::Sender<Result<Value, IssueFailure>>>,
    next_token: u64,
    next_msg: u64,
    closed: bool,
}

impl Session {
    fn new(epoch: u64, schema: Schema, tx: TransportSender) -> Arc<Session> {
        let mut resolved_edges = HashMap::new();
        // The empty path maps to token 0 without any wire traffic.
        let root: EdgeFuture = async { Ok(0u64) }.boxed().shared();
        resolved_edges.insert(Path::root().key(), root);
        Arc::new(Session {
            epoch,
            schema,
            tx,
            closed_token: CancellationToken::new(),
            st: Mutex::new(SessionMaps {
                resolved_edges,
                path_to_token: HashMap::new(),
                live_data: HashMap::new(),
                get_cache: HashMap::new(),
                data_load: HashMap::new(),
                pending: HashMap::new(),
                next_token: 1,
                next_msg: 1,
                closed: false,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionMaps> {
        self.st.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark dead, reject wire-pending entries, wipe connection-scoped state.
    fn shutdown(&self, failure: IssueFailure) {
        self.closed_token.cancel();
        let mut st = self.lock();
        st.closed = true;
        for (_, tx) in st.pending.drain() {
            let _ = tx.send(Err(failure.clone()));
        }
        st.resolved_edges.clear();
        st.path_to_token.clear();
        st.live_data.clear();
        st.get_cache.clear();
        st.data_load.clear();
    }
}

// ---------------------------------------------------------------------------
// Connection establishment
// ---------------------------------------------------------------------------

async fn ensure_session(inner: &Arc<ClientInner>) -> Result<Arc<Session>, ClientError> {
    loop {
        let mut version = inner.phase_tx.subscribe();
        {
            let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
            match &*state {
                Phase::Ready(s) => return Ok(s.clone()),
                Phase::Closed => {
                    return Err(ClientError::local(ErrorCode::ClientClosed, "client closed"));
                }
                Phase::Exhausted => {
                    return Err(ClientError::local(
                        ErrorCode::ConnectionLost,
                        "reconnect retries exhausted",
                    ));
                }
                Phase::Connecting => {}
                Phase::Idle => {
                    *state = Phase::Connecting;
                    tokio::spawn(connect_loop(inner.clone(), false));
                }
            }
        }
        if version.changed().await.is_err() {
            return Err(ClientError::local(ErrorCode::ClientClosed, "client dropped"));
        }
    }
}

/// Block until the given (dead) session is no longer the current phase, so
/// replay doesn't spin against a corpse.
async fn wait_past_stale(inner: &Arc<ClientInner>, stale: &Arc<Session>) {
    let mut version = inner.phase_tx.subscribe();
    loop {
        {
            let state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
            match &*state {
                Phase::Ready(s) if Arc::ptr_eq(s, stale) => {}
                _ => return,
            }
        }
        if version.changed().await.is_err() {
            return;
        }
    }
}

fn set_phase(inner: &Arc<ClientInner>, phase: Phase) {
    *inner.state.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    inner.phase_tx.send_modify(|v| *v += 1);
}

/// Connect (or reconnect) with the backoff schedule.  First attempt has
/// delay 0; exhaustion parks the client in `Exhausted`.
async fn connect_loop(inner: Arc<ClientInner>, is_reconnect: bool) {
    let mut attempt: u32 = 0;
    loop {
        if matches!(
            *inner.state.lock().unwrap_or_else(|e| e.into_inner()),
            Phase::Closed
        ) {
            return;
        }
        let delay = match inner.config.reconnect.backoff() {
            Some(b) => b.delay(attempt),
            // Reconnect disabled: the initial connect still gets one shot.
            None if attempt == 0 => Some(std::time::Duration::ZERO),
            None => None,
        };
        let Some(delay) = delay else {
            warn!(attempt, "reconnect retries exhausted");
            set_phase(&inner, Phase::Exhausted);
            let _ = inner.events.send(ClientEvent::ReconnectFailed);
            return;
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;

        let transport = match inner.connector.connect().await {
            Ok(t) => t,
            Err(e) => {
                debug!(attempt, error = %e, "connect attempt failed");
                continue;
            }
        };
        match handshake(&inner, transport).await {
            Ok(session) => {
                {
                    let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
                    if matches!(*state, Phase::Closed) {
                        drop(state);
                        session.shutdown(IssueFailure::Failed(ClientError::local(
                            ErrorCode::ClientClosed,
                            "client closed",
                        )));
                        return;
                    }
                    *state = Phase::Ready(session.clone());
                }
                inner.phase_tx.send_modify(|v| *v += 1);
                info!(epoch = session.epoch, "session ready");
                if is_reconnect {
                    let _ = inner.events.send(ClientEvent::Reconnect);
                }
                return;
            }
            Err(e) => {
                debug!(attempt, error = %e, "handshake failed");
                continue;
            }
        }
    }
}

/// Wait for the hello, build the epoch's session, start the reader.
async fn handshake(
    inner: &Arc<ClientInner>,
    transport: trellis_protocol::Transport,
) -> Result<Arc<Session>, ClientError> {
    let (tx, mut rx) = transport.split();
    let first = rx.recv().await.ok_or_else(|| {
        ClientError::local(ErrorCode::ConnectionLost, "closed before hello")
    })?;
    let schema = match ServerMessage::from_wire(&first) {
        Ok(ServerMessage::Hello { version, schema }) if version == WIRE_VERSION => schema,
        Ok(ServerMessage::Hello { version, .. }) => {
            return Err(ClientError::local(
                ErrorCode::InternalError,
                format!("unsupported wire version {version}"),
            ));
        }
        Ok(_) => {
            return Err(ClientError::local(
                ErrorCode::InternalError,
                "expected hello as first message",
            ));
        }
        Err(e) => return Err(ClientError::Codec(e.to_string())),
    };
    let epoch = inner.next_epoch.fetch_add(1, Ordering::SeqCst);
    let session = Session::new(epoch, schema, tx);
    tokio::spawn(reader_task(inner.clone(), session.clone(), rx));
    Ok(session)
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

async fn reader_task(
    inner: Arc<ClientInner>,
    session: Arc<Session>,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    loop {
        tokio::select! {
            _ = session.closed_token.cancelled() => return,
            msg = rx.recv() => match msg {
                None => break,
                Some(text) => match ServerMessage::from_wire(&text) {
                    Ok(msg) => handle_server_message(&inner, &session, msg),
                    Err(e) => warn!(error = %e, "undecodable server message"),
                }
            }
        }
    }
    on_transport_closed(&inner, &session);
}

fn handle_server_message(inner: &Arc<ClientInner>, session: &Arc<Session>, msg: ServerMessage) {
    match msg {
        ServerMessage::Hello { .. } => warn!("unexpected mid-session hello"),
        ServerMessage::Edge { re, .. } => {
            // Bookkeeping only: edge errors surface on dependent terminal
            // operations via their poisoned tokens.
            session.lock().pending.remove(&re);
        }
        ServerMessage::Get { re, data, error, .. } => {
            let outcome = decode_reply(inner, session, data, error);
            deliver(session, re, outcome);
        }
        ServerMessage::Data {
            tok,
            re,
            data,
            error,
        } => {
            let outcome = decode_reply(inner, session, data, error);
            if let Ok(v) = &outcome {
                // Snapshot lands in the live cache as part of reply
                // processing, atomically before any awaiter observes it.
                session.lock().live_data.insert(tok, v.clone());
            }
            deliver(session, re, outcome);
        }
    }
}

fn decode_reply(
    inner: &Arc<ClientInner>,
    session: &Arc<Session>,
    data: Option<Json>,
    error: Option<Json>,
) -> Result<Value, IssueFailure> {
    if let Some(flat) = error {
        return Err(IssueFailure::Failed(match inner.codec.revive(flat) {
            Ok(Value::Error(we)) => ClientError::Protocol(we),
            Ok(v @ Value::Custom { .. }) => ClientError::Custom(v),
            Ok(_) => ClientError::local(ErrorCode::InternalError, "malformed error payload"),
            Err(e) => ClientError::Codec(e.to_string()),
        }));
    }
    let Some(flat) = data else {
        return Err(IssueFailure::Failed(ClientError::local(
            ErrorCode::InternalError,
            "response carried neither data nor error",
        )));
    };
    match inner.codec.revive(flat) {
        Ok(v) => {
            // Invalidation from incoming references happens here, during
            // reply decode, before the value is delivered to any awaiter.
            apply_incoming_references(session, &v);
            Ok(v)
        }
        Err(e) => Err(IssueFailure::Failed(ClientError::Codec(e.to_string()))),
    }
}

fn deliver(session: &Arc<Session>, re: u64, outcome: Result<Value, IssueFailure>) {
    let sender = session.lock().pending.remove(&re);
    match sender {
        Some(tx) => {
            let _ = tx.send(outcome);
        }
        None => debug!(re, "reply without a pending entry"),
    }
}

/// Walk a revived value bottom-up and apply every reference as a
/// cache-invalidation + priming signal.
fn apply_incoming_references(session: &Arc<Session>, value: &Value) {
    match value {
        Value::Reference { path, data } => {
            apply_incoming_references(session, data);
            apply_reference(session, path, data);
        }
        Value::List(items) | Value::Set(items) => {
            for v in items {
                apply_incoming_references(session, v);
            }
        }
        Value::Object(pairs) => {
            for (_, v) in pairs {
                apply_incoming_references(session, v);
            }
        }
        Value::Map(pairs) => {
            for (k, v) in pairs {
                apply_incoming_references(session, k);
                apply_incoming_references(session, v);
            }
        }
        Value::Custom { payload, .. } => apply_incoming_references(session, payload),
        _ => {}
    }
}

fn apply_reference(session: &Arc<Session>, path: &Path, data: &Value) {
    let key = trellis_codec::path_key(path);
    let mut st = session.lock();
    let Some(&tok) = st.path_to_token.get(&key) else {
        // Path never navigated in this session; nothing to prime.
        return;
    };
    debug!(key = %key, tok, "reference arrived; refreshing caches");
    st.live_data.insert(tok, data.clone());
    st.get_cache.retain(|(t, _), _| *t != tok);
    st.data_load.remove(&tok);

    // Descendant edges are evicted outright: subsequent navigation creates
    // fresh tokens against the mutated subtree.
    let descendants: Vec<String> = st
        .resolved_edges
        .keys()
        .filter(|k| key_is_descendant(k, &key))
        .cloned()
        .collect();
    for edge_key in descendants {
        st.resolved_edges.remove(&edge_key);
        if let Some(t) = st.path_to_token.remove(&edge_key) {
            st.live_data.remove(&t);
            st.get_cache.retain(|(tt, _), _| *tt != t);
            st.data_load.remove(&t);
        }
    }
}

// ---------------------------------------------------------------------------
// Disconnect handling (reconnect controller)
// ---------------------------------------------------------------------------

fn on_transport_closed(inner: &Arc<ClientInner>, session: &Arc<Session>) {
    // Reject wire-pending with the internal sentinel; awaiting terminals
    // replay instead of failing.
    session.shutdown(IssueFailure::Reconnecting);

    let is_current = {
        let state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
        matches!(&*state, Phase::Ready(s) if Arc::ptr_eq(s, session))
    };
    if !is_current {
        return;
    }

    info!(epoch = session.epoch, "transport lost");
    let _ = inner.events.send(ClientEvent::Disconnect);

    if !inner.config.reconnect.enabled() {
        set_phase(inner, Phase::Exhausted);
        return;
    }
    if inner.pending_terminals.load(Ordering::SeqCst) > 0 {
        // In-flight user awaits exist: reconnect eagerly.
        set_phase(inner, Phase::Connecting);
        tokio::spawn(connect_loop(inner.clone(), true));
    } else {
        // Nothing in flight: the next operation opens a fresh epoch.
        set_phase(inner, Phase::Idle);
    }
}

// ---------------------------------------------------------------------------
// Operation issue
// ---------------------------------------------------------------------------

enum CacheOutcome {
    Ready(Value),
    Wait(ValueFuture),
}

async fn issue_on(
    client: &Client,
    session: &Arc<Session>,
    path: &Path,
) -> Result<Fetched, IssueFailure> {
    let inner = &client.inner;
    let classified = classify(path, &session.schema).map_err(IssueFailure::Failed)?;
    let edge_fut = edge_future_for(inner, session, classified.edge_path);
    let tok = edge_fut.await?;

    match classified.terminal {
        None => {
            // Full-node data fetch.
            let outcome = {
                let mut st = session.lock();
                if let Some(snap) = st.live_data.get(&tok) {
                    CacheOutcome::Ready(snap.clone())
                } else if let Some(f) = st.data_load.get(&tok) {
                    CacheOutcome::Wait(f.clone())
                } else {
                    let rx = send_wire(session, &mut st, &ClientMessage::Data { tok })?;
                    let f = pending_future(rx);
                    st.data_load.insert(tok, f.clone());
                    CacheOutcome::Wait(f)
                }
            };
            let snapshot = match outcome {
                CacheOutcome::Ready(v) => v,
                CacheOutcome::Wait(f) => f.await?,
            };
            Ok(Fetched::Node(DataProxy::new(
                client.clone(),
                path.clone(),
                snapshot,
            )))
        }
        Some(seg) if seg.args.is_some() => {
            // Method call: always sent, never cached.
            let args = seg.args.clone().unwrap_or_default();
            let flat = inner
                .codec
                .flatten_args(&args)
                .map_err(|e| IssueFailure::Failed(ClientError::Codec(e.to_string())))?;
            let rx = {
                let mut st = session.lock();
                send_wire(
                    session,
                    &mut st,
                    &ClientMessage::Get {
                        tok,
                        name: seg.name.clone(),
                        args: Some(flat),
                    },
                )?
            };
            let value = pending_future(rx).await?;
            Ok(Fetched::Value(value))
        }
        Some(seg) => {
            // Property/getter read, coalesced per (token, name).
            let outcome = {
                let mut st = session.lock();
                if let Some(v) = st.live_data.get(&tok).and_then(|snap| snap.get(&seg.name)) {
                    CacheOutcome::Ready(v.clone())
                } else if let Some(f) = st.get_cache.get(&(tok, seg.name.clone())) {
                    CacheOutcome::Wait(f.clone())
                } else {
                    let rx = send_wire(
                        session,
                        &mut st,
                        &ClientMessage::Get {
                            tok,
                            name: seg.name.clone(),
                            args: None,
                        },
                    )?;
                    let f = pending_future(rx);
                    st.get_cache.insert((tok, seg.name.clone()), f.clone());
                    CacheOutcome::Wait(f)
                }
            };
            let value = match outcome {
                CacheOutcome::Ready(v) => v,
                CacheOutcome::Wait(f) => f.await?,
            };
            Ok(Fetched::Value(value))
        }
    }
}

/// The shared token future for an edge path, creating dedup entries for
/// every missing prefix.
fn edge_future_for(
    inner: &Arc<ClientInner>,
    session: &Arc<Session>,
    edge_path: &[Segment],
) -> EdgeFuture {
    let mut key = Path::root().key();
    let mut fut = {
        let st = session.lock();
        st.resolved_edges
            .get(&key)
            .cloned()
            .unwrap_or_else(|| async { Err(IssueFailure::Reconnecting) }.boxed().shared())
    };
    for seg in edge_path {
        key.push_str(&segment_key(seg));
        fut = {
            let mut st = session.lock();
            if let Some(existing) = st.resolved_edges.get(&key) {
                existing.clone()
            } else {
                let created = make_edge_future(
                    inner.codec.clone(),
                    Arc::downgrade(session),
                    key.clone(),
                    fut,
                    seg.clone(),
                );
                st.resolved_edges.insert(key.clone(), created.clone());
                created
            }
        };
    }
    fut
}

/// One edge send.  The child token is allocated only inside the parent's
/// continuation, which is what guarantees parents carry lower tokens than
/// children — the server allocates in arrival order.
fn make_edge_future(
    codec: Arc<Codec>,
    session: Weak<Session>,
    key: String,
    parent: EdgeFuture,
    seg: Segment,
) -> EdgeFuture {
    async move {
        let parent_tok = parent.await?;
        let session = session.upgrade().ok_or(IssueFailure::Reconnecting)?;
        let mut st = session.lock();
        if st.closed {
            return Err(IssueFailure::Reconnecting);
        }
        // Serialize before allocating: an encode failure must not burn a
        // token, or every later allocation disagrees with the server's.
        let args = seg
            .args
            .as_ref()
            .map(|a| codec.flatten_args(a))
            .transpose()
            .map_err(|e| IssueFailure::Failed(ClientError::Codec(e.to_string())))?;
        let msg = ClientMessage::Edge {
            tok: parent_tok,
            edge: seg.name.clone(),
            args,
        };
        let text = serde_json::to_string(&msg)
            .map_err(|e| IssueFailure::Failed(ClientError::Codec(e.to_string())))?;
        let tok = st.next_token;
        st.next_token += 1;
        st.path_to_token.insert(key, tok);
        st.next_msg += 1;
        if session.tx.send(text).is_err() {
            st.closed = true;
            return Err(IssueFailure::Reconnecting);
        }
        // Resolution is send-completion, not the server's reply: dependent
        // work pipelines behind it.
        Ok(tok)
    }
    .boxed()
    .shared()
}

/// Allocate the next message id, register a pending entry, and send.  Must
/// run under the session lock so wire order matches id order.
fn send_wire(
    session: &Arc<Session>,
    st: &mut SessionMaps,
    msg: &ClientMessage,
) -> Result<oneshot::Receiver<Result<Value, IssueFailure>>, IssueFailure> {
    if st.closed {
        return Err(IssueFailure::Reconnecting);
    }
    // Serialize before allocating the id: a failed encode must not skip a
    // slot in the implicit sequence the server correlates against.
    let text = serde_json::to_string(msg)
        .map_err(|e| IssueFailure::Failed(ClientError::Codec(e.to_string())))?;
    let msg_id = st.next_msg;
    st.next_msg += 1;
    let (tx, rx) = oneshot::channel();
    st.pending.insert(msg_id, tx);
    if session.tx.send(text).is_err() {
        st.pending.remove(&msg_id);
        st.closed = true;
        return Err(IssueFailure::Reconnecting);
    }
    Ok(rx)
}

fn pending_future(rx: oneshot::Receiver<Result<Value, IssueFailure>>) -> ValueFuture {
    async move { rx.await.unwrap_or(Err(IssueFailure::Reconnecting)) }
        .boxed()
        .shared()
}
