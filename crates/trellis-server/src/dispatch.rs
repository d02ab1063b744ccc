//! Request dispatcher: runs one connection end-to-end.
//!
//! # Message flow
//! 1. Parse via codec + structural validator; malformed input closes the
//!    connection with an emitted error event.
//! 2. Count the message against `max_queued_ops`; crossing the bound closes.
//! 3. Edge messages synchronously claim their token in arrival order, so
//!    pipelined children observe their parent's token before it resolves.
//! 4. Each operation runs through the middleware chain (snapshotted at op
//!    start) into the token manager / node cache, bounded by the concurrency
//!    slots, the per-operation timer, and the idle timer.
//! 5. Responses echo the 1-based arrival sequence number in `re`; errors are
//!    classified, assigned an identifier, optionally redacted, and emitted
//!    as `operation_error` events.

use crate::config::{ConfigError, ServerConfig};
use crate::error::{OpError, REDACTED_MESSAGE, wrap_handler_error};
use crate::events::ServerEvent;
use crate::graph::{ClassRegistry, ConnContext, NodeRef, is_dangerous, visible};
use crate::middleware::{Middleware, MiddlewareHandle, Next, OpInfo, OpKind, OpResult, compose};
use crate::schema::build_schema;
use crate::session::{ConnCore, OpContext};
use crate::tokens::TokenManager;
use futures_util::FutureExt;
use serde_json::Value as Json;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{Semaphore, broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trellis_codec::{Codec, CodecError, ErrorCode, Segment, Value};
use trellis_protocol::{
    ClientMessage, ServerMessage, Transport, TransportSender, WIRE_VERSION, parse_client_message,
};
use uuid::Uuid;

/// Capacity of the server event channel; lagging subscribers lose events.
const EVENT_CAPACITY: usize = 256;

pub type RootFactory = Arc<dyn Fn(&ConnContext) -> NodeRef + Send + Sync>;

// ---------------------------------------------------------------------------
// Server + builder
// ---------------------------------------------------------------------------

pub struct ServerBuilder {
    registry: Option<ClassRegistry>,
    codec: Codec,
    config: ServerConfig,
    root_factory: Option<RootFactory>,
}

impl ServerBuilder {
    pub fn registry(mut self, registry: ClassRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Factory producing the per-connection root node.
    pub fn root(mut self, factory: impl Fn(&ConnContext) -> NodeRef + Send + Sync + 'static) -> Self {
        self.root_factory = Some(Arc::new(factory));
        self
    }

    pub fn build(self) -> Result<Server, ConfigError> {
        let registry = self
            .registry
            .ok_or_else(|| ConfigError::Invalid("a class registry is required".into()))?;
        let root_factory = self
            .root_factory
            .ok_or_else(|| ConfigError::Invalid("a root node factory is required".into()))?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Server {
            shared: Arc::new(ServerShared {
                registry: Arc::new(registry),
                codec: Arc::new(self.codec),
                config: self.config,
                root_factory,
                middleware: RwLock::new(Vec::new()),
                next_middleware_id: AtomicU64::new(1),
                events,
            }),
        })
    }
}

struct ServerShared {
    registry: Arc<ClassRegistry>,
    codec: Arc<Codec>,
    config: ServerConfig,
    root_factory: RootFactory,
    middleware: RwLock<Vec<(u64, Arc<dyn Middleware>)>>,
    next_middleware_id: AtomicU64,
    events: broadcast::Sender<ServerEvent>,
}

/// The server half of the session core.  Cheap to clone.
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            registry: None,
            codec: Codec::default(),
            config: ServerConfig::default(),
            root_factory: None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    /// Register a middleware; first registered is outermost.  Takes effect
    /// for subsequent operations only.
    pub fn add_middleware(&self, middleware: Arc<dyn Middleware>) -> MiddlewareHandle {
        let id = self.shared.next_middleware_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .middleware
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, middleware));
        MiddlewareHandle(id)
    }

    /// Deregister a middleware.  In-flight chains keep their snapshot.
    pub fn remove_middleware(&self, handle: MiddlewareHandle) {
        self.shared
            .middleware
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(id, _)| *id != handle.0);
    }

    fn middleware_snapshot(&self) -> Vec<Arc<dyn Middleware>> {
        self.shared
            .middleware
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Serve one transport to completion.
    pub async fn serve_connection(&self, transport: Transport, ctx: ConnContext) {
        let shared = self.shared.clone();
        let conn_id = Uuid::new_v4();
        let (schema, class_index) = build_schema(&shared.registry, &ctx);
        let root = (shared.root_factory)(&ctx);
        let abort = CancellationToken::new();
        let core = Arc::new(ConnCore {
            ctx,
            registry: shared.registry.clone(),
            codec: shared.codec.clone(),
            tokens: TokenManager::new(root, shared.config.max_tokens),
            class_index,
            abort: abort.clone(),
        });

        let (tx, mut rx) = transport.split();
        let hello = ServerMessage::Hello {
            version: WIRE_VERSION,
            schema,
        };
        let Ok(hello_text) = hello.to_wire() else {
            return;
        };
        if tx.send(hello_text).is_err() {
            debug!(conn_id = %conn_id, "transport closed before hello");
            return;
        }

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (activity, activity_rx) = watch::channel(Instant::now());
        let conn = Arc::new(ConnState {
            id: conn_id,
            core: core.clone(),
            server: self.clone(),
            write_tx,
            pending_ops: AtomicUsize::new(0),
            slots: Arc::new(Semaphore::new(shared.config.max_pending_ops)),
            activity,
            close_reason: Mutex::new(None),
        });

        let _ = shared.events.send(ServerEvent::ConnectionOpened { conn_id });
        info!(conn_id = %conn_id, "connection opened");

        let writer = tokio::spawn(writer_task(conn.clone(), tx, write_rx));
        let idle = shared
            .config
            .idle_timeout
            .map(|d| tokio::spawn(idle_task(conn.clone(), d, activity_rx)));

        let mut msg_seq: u64 = 0;
        loop {
            tokio::select! {
                _ = abort.cancelled() => break,
                incoming = rx.recv() => match incoming {
                    None => {
                        conn.set_close_reason("transport closed by peer");
                        break;
                    }
                    Some(text) => {
                        msg_seq += 1;
                        if !handle_incoming(&conn, msg_seq, &text) {
                            break;
                        }
                    }
                }
            }
        }

        abort.cancel();
        conn.slots.close();
        core.tokens.clear();
        if let Some(idle) = idle {
            idle.abort();
        }
        let _ = writer.await;
        let reason = conn
            .close_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| "closed".to_owned());
        info!(conn_id = %conn_id, reason = %reason, "connection closed");
        let _ = shared.events.send(ServerEvent::ConnectionClosed { conn_id, reason });
    }
}

// ---------------------------------------------------------------------------
// Per-connection state
// ---------------------------------------------------------------------------

struct ConnState {
    id: Uuid,
    core: Arc<ConnCore>,
    server: Server,
    write_tx: mpsc::UnboundedSender<String>,
    pending_ops: AtomicUsize,
    slots: Arc<Semaphore>,
    activity: watch::Sender<Instant>,
    close_reason: Mutex<Option<String>>,
}

impl ConnState {
    fn touch(&self) {
        let _ = self.activity.send(Instant::now());
    }

    fn write(&self, msg: &ServerMessage) {
        match msg.to_wire() {
            Ok(text) => {
                let _ = self.write_tx.send(text);
            }
            Err(e) => warn!(conn_id = %self.id, error = %e, "failed to encode response"),
        }
    }

    fn set_close_reason(&self, reason: &str) {
        let mut guard = self.close_reason.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(reason.to_owned());
        }
    }

    fn close(&self, reason: &str) {
        self.set_close_reason(reason);
        self.core.abort.cancel();
    }

    fn config(&self) -> &ServerConfig {
        &self.server.shared.config
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.server.shared.events.send(event);
    }
}

/// Funnel for all outbound messages.  Exits on connection abort, draining
/// anything already queued (a limit-trip reply precedes its close).
async fn writer_task(
    conn: Arc<ConnState>,
    tx: TransportSender,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Some(text) => {
                    if tx.send(text).is_err() {
                        conn.close("transport closed");
                        break;
                    }
                    conn.touch();
                }
                None => break,
            },
            _ = conn.core.abort.cancelled() => {
                while let Ok(text) = rx.try_recv() {
                    let _ = tx.send(text);
                }
                break;
            }
        }
    }
}

/// Idle watchdog: fires only when no operations are pending.
async fn idle_task(
    conn: Arc<ConnState>,
    idle: std::time::Duration,
    mut activity: watch::Receiver<Instant>,
) {
    loop {
        let last = *activity.borrow_and_update();
        tokio::select! {
            _ = conn.core.abort.cancelled() => break,
            changed = activity.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep_until(last + idle) => {
                if conn.pending_ops.load(Ordering::SeqCst) == 0 {
                    info!(conn_id = %conn.id, "idle timeout");
                    conn.close("idle timeout");
                    break;
                }
                // Operations in flight; wait for the next activity bump.
                tokio::select! {
                    _ = conn.core.abort.cancelled() => break,
                    changed = activity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound message handling
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum ClientOp {
    Edge { seg: Segment },
    Get {
        tok: u64,
        name: String,
        args: Option<Vec<Value>>,
    },
    Data { tok: u64 },
}

/// Returns `false` when the connection must close.
fn handle_incoming(conn: &Arc<ConnState>, seq: u64, text: &str) -> bool {
    let json: Json = match serde_json::from_str(text) {
        Ok(j) => j,
        Err(e) => {
            protocol_failure(conn, &format!("invalid JSON: {e}"));
            return false;
        }
    };
    let msg = match parse_client_message(&json) {
        Ok(m) => m,
        Err(e) => {
            protocol_failure(conn, &e.to_string());
            return false;
        }
    };

    let pending = conn.pending_ops.fetch_add(1, Ordering::SeqCst) + 1;
    if pending > conn.config().max_queued_ops {
        conn.pending_ops.fetch_sub(1, Ordering::SeqCst);
        protocol_failure(conn, "max queued operations exceeded");
        return false;
    }
    conn.touch();

    let core = &conn.core;
    let (request_tok, op) = match decode_op(&core.codec, msg) {
        Ok(pair) => pair,
        Err(e) => {
            // Codec mismatch between peers; deserialization failure is fatal.
            conn.pending_ops.fetch_sub(1, Ordering::SeqCst);
            protocol_failure(conn, &format!("argument decode: {e}"));
            return false;
        }
    };

    // Edge claims are synchronous and in arrival order: a pipelined child in
    // the same batch must observe its parent's token.
    let claimed = match &op {
        ClientOp::Edge { seg } => {
            let weak = Arc::downgrade(core);
            match core.tokens.claim(&weak, request_tok, seg.clone()) {
                Ok((claim_tok, key)) => {
                    if core.tokens.over_limit() {
                        conn.pending_ops.fetch_sub(1, Ordering::SeqCst);
                        write_response(
                            conn,
                            OpKind::Edge,
                            claim_tok,
                            seq,
                            Err(OpError::wire(
                                ErrorCode::TokenLimitExceeded,
                                "session token limit exceeded",
                            )),
                        );
                        conn.set_close_reason("token limit exceeded");
                        return false;
                    }
                    Some((claim_tok, key))
                }
                Err(e) => {
                    // Token-space integrity is gone; answer and close.
                    conn.pending_ops.fetch_sub(1, Ordering::SeqCst);
                    write_response(conn, OpKind::Edge, 0, seq, Err(OpError::Wire(e)));
                    conn.set_close_reason("invalid token in edge message");
                    return false;
                }
            }
        }
        _ => None,
    };

    tokio::spawn(run_operation(conn.clone(), seq, request_tok, op, claimed));
    true
}

fn protocol_failure(conn: &Arc<ConnState>, message: &str) {
    warn!(conn_id = %conn.id, message = %message, "protocol violation");
    conn.emit(ServerEvent::OperationError {
        conn_id: conn.id,
        error_id: Uuid::new_v4(),
        code: Some(ErrorCode::ValidationError),
        message: message.to_owned(),
    });
    conn.set_close_reason("protocol violation");
}

fn decode_op(codec: &Codec, msg: ClientMessage) -> Result<(u64, ClientOp), CodecError> {
    Ok(match msg {
        ClientMessage::Edge { tok, edge, args } => {
            let args = args.map(|a| codec.revive_args(&a)).transpose()?;
            (
                tok,
                ClientOp::Edge {
                    seg: Segment { name: edge, args },
                },
            )
        }
        ClientMessage::Get { tok, name, args } => {
            let args = args.map(|a| codec.revive_args(&a)).transpose()?;
            (tok, ClientOp::Get { tok, name, args })
        }
        ClientMessage::Data { tok } => (tok, ClientOp::Data { tok }),
    })
}

// ---------------------------------------------------------------------------
// Operation execution
// ---------------------------------------------------------------------------

async fn run_operation(
    conn: Arc<ConnState>,
    seq: u64,
    request_tok: u64,
    op: ClientOp,
    claimed: Option<(u64, String)>,
) {
    let core = conn.core.clone();
    let op_abort = core.abort.child_token();
    let (kind, name) = match &op {
        ClientOp::Edge { seg } => (OpKind::Edge, Some(seg.name.clone())),
        ClientOp::Get { name, .. } => (OpKind::Get, Some(name.clone())),
        ClientOp::Data { .. } => (OpKind::Data, None),
    };
    let reply_tok = match (&claimed, kind) {
        (Some((claim_tok, _)), OpKind::Edge) => *claim_tok,
        _ => request_tok,
    };
    let info = Arc::new(OpInfo {
        kind,
        tok: request_tok,
        name,
        message_id: seq,
    });
    let opctx = OpContext::new(core, op_abort.clone());
    let snapshot = conn.server.middleware_snapshot();

    let innermost: Next = {
        let conn = conn.clone();
        let opctx = opctx.clone();
        Box::new(move || execute_op(conn, op, claimed, opctx).boxed())
    };
    let chain = compose(snapshot, opctx, info, innermost);

    let responded = Arc::new(AtomicBool::new(false));

    // The handler owns response-write-if-first and the pending decrement; it
    // runs to completion even when the timeout wins the race.
    let handler = {
        let conn = conn.clone();
        let responded = responded.clone();
        tokio::spawn(async move {
            let result = chain().await;
            if !responded.swap(true, Ordering::SeqCst) {
                write_response(&conn, kind, reply_tok, seq, result);
            }
            conn.pending_ops.fetch_sub(1, Ordering::SeqCst);
            conn.touch();
        })
    };

    if let Some(budget) = conn.config().max_operation_timeout {
        tokio::select! {
            _ = tokio::time::sleep(budget) => {
                if !responded.swap(true, Ordering::SeqCst) {
                    debug!(conn_id = %conn.id, re = seq, "operation timeout");
                    op_abort.cancel();
                    write_response(
                        &conn,
                        kind,
                        reply_tok,
                        seq,
                        Err(OpError::wire(ErrorCode::OperationTimeout, "operation timed out")),
                    );
                    // pending_ops is NOT decremented here; the handler keeps
                    // running in the background and cleans up itself.
                }
            }
            _ = handler => {}
        }
    }
}

async fn execute_op(
    conn: Arc<ConnState>,
    op: ClientOp,
    claimed: Option<(u64, String)>,
    opctx: OpContext,
) -> OpResult {
    let core = opctx.core().clone();
    match op {
        ClientOp::Edge { .. } => {
            let (_, key) = claimed.ok_or_else(|| {
                OpError::wire(ErrorCode::InternalError, "edge operation without a claim")
            })?;
            let _slot = acquire_slot(&conn).await?;
            let fut = core.tokens.entry_future(&key).map_err(OpError::Wire)?;
            fut.await?;
            Ok(Value::Undefined)
        }
        ClientOp::Get { tok, name, args } => {
            let node = core.tokens.resolve_token(tok).map_err(OpError::Wire)?.await?;
            let _slot = acquire_slot(&conn).await?;
            resolve_terminal(&core, &node, &name, args, opctx).await
        }
        ClientOp::Data { tok } => {
            let node = core.tokens.resolve_token(tok).map_err(OpError::Wire)?.await?;
            let _slot = acquire_slot(&conn).await?;
            node.snapshot()
                .map_err(|e| wrap_handler_error(&core.codec, ErrorCode::DataError, e))
        }
    }
}

/// Resolve a terminal on a node: method invocation or property read.
async fn resolve_terminal(
    core: &Arc<ConnCore>,
    node: &NodeRef,
    name: &str,
    args: Option<Vec<Value>>,
    opctx: OpContext,
) -> OpResult {
    if is_dangerous(name) {
        return Err(OpError::wire(
            ErrorCode::MethodNotFound,
            format!("no such method '{name}'"),
        ));
    }
    let class = core.registry.get(node.class_name()).ok_or_else(|| {
        OpError::wire(
            ErrorCode::InternalError,
            format!("unregistered class '{}'", node.class_name()),
        )
    })?;

    if class.find_edge(name).is_some() {
        // Edge operations must use the edge message.
        return Err(OpError::wire(
            ErrorCode::MethodNotFound,
            format!("'{name}' is an edge, not a method"),
        ));
    }

    if let Some(method) = class.find_method(name) {
        if !visible(method.visibility.as_ref(), &core.ctx) {
            return Err(OpError::wire(
                ErrorCode::MethodNotFound,
                format!("no such method '{name}'"),
            ));
        }
        let args = args.unwrap_or_default();
        // Extra args are never allowed; missing args may be treated as
        // optional by the schemas themselves.
        if args.len() > method.arg_schemas.len() {
            return Err(OpError::wire(
                ErrorCode::ValidationError,
                format!(
                    "'{name}' takes at most {} arguments, got {}",
                    method.arg_schemas.len(),
                    args.len()
                ),
            ));
        }
        for (i, (arg, schema)) in args.iter().zip(&method.arg_schemas).enumerate() {
            schema(arg.clone()).await.map_err(|reason| {
                OpError::wire(
                    ErrorCode::ValidationError,
                    format!("argument {i} of '{name}': {reason}"),
                )
            })?;
        }
        return node
            .call(name, args, opctx)
            .await
            .map_err(|e| wrap_handler_error(&core.codec, ErrorCode::GetError, e));
    }

    if args.is_some_and(|a| !a.is_empty()) {
        return Err(OpError::wire(
            ErrorCode::ValidationError,
            format!("property '{name}' takes no arguments"),
        ));
    }
    node.get(name).ok_or_else(|| {
        OpError::wire(ErrorCode::MethodNotFound, format!("no such method '{name}'"))
    })
}

async fn acquire_slot(
    conn: &Arc<ConnState>,
) -> Result<tokio::sync::OwnedSemaphorePermit, OpError> {
    conn.slots
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| OpError::wire(ErrorCode::ConnectionClosed, "connection closed"))
}

// ---------------------------------------------------------------------------
// Response building
// ---------------------------------------------------------------------------

fn write_response(conn: &Arc<ConnState>, kind: OpKind, tok: u64, re: u64, result: OpResult) {
    let msg = match result {
        Ok(value) => match kind {
            OpKind::Edge => ServerMessage::Edge {
                tok,
                re,
                error: None,
            },
            OpKind::Get | OpKind::Data => match conn.core.codec.flatten(&value) {
                Ok(data) => {
                    if kind == OpKind::Get {
                        ServerMessage::Get {
                            tok,
                            re,
                            data: Some(data),
                            error: None,
                        }
                    } else {
                        ServerMessage::Data {
                            tok,
                            re,
                            data: Some(data),
                            error: None,
                        }
                    }
                }
                Err(e) => error_response(
                    conn,
                    kind,
                    tok,
                    re,
                    OpError::wire(ErrorCode::InternalError, format!("response encode: {e}")),
                ),
            },
        },
        Err(e) => error_response(conn, kind, tok, re, e),
    };
    conn.write(&msg);
}

/// Classify, identify, optionally redact, emit, and shape an error reply.
fn error_response(
    conn: &Arc<ConnState>,
    kind: OpKind,
    tok: u64,
    re: u64,
    err: OpError,
) -> ServerMessage {
    let error_id = Uuid::new_v4();
    let (flat, event_code, event_message) = match err {
        OpError::Wire(mut we) => {
            we.error_id = Some(error_id);
            let code = we.code;
            let message = we.message.clone();
            (flatten_error(conn, Value::Error(we)), Some(code), message)
        }
        OpError::Wrapped(mut we) => {
            we.error_id = Some(error_id);
            let code = we.code;
            let original = we.message.clone();
            if conn.config().redact_errors {
                we.message = REDACTED_MESSAGE.to_owned();
            }
            (flatten_error(conn, Value::Error(we)), Some(code), original)
        }
        OpError::Custom(v) => {
            let message = trellis_codec::format_value(&v);
            (flatten_error(conn, v), None, message)
        }
    };
    conn.emit(ServerEvent::OperationError {
        conn_id: conn.id,
        error_id,
        code: event_code,
        message: event_message,
    });
    match kind {
        OpKind::Edge => ServerMessage::Edge {
            tok,
            re,
            error: Some(flat),
        },
        OpKind::Get => ServerMessage::Get {
            tok,
            re,
            data: None,
            error: Some(flat),
        },
        OpKind::Data => ServerMessage::Data {
            tok,
            re,
            data: None,
            error: Some(flat),
        },
    }
}

fn flatten_error(conn: &Arc<ConnState>, value: Value) -> Json {
    conn.core.codec.flatten(&value).unwrap_or_else(|e| {
        warn!(conn_id = %conn.id, error = %e, "failed to encode error value");
        serde_json::json!({
            "$": "error",
            "code": ErrorCode::InternalError.as_str(),
            "message": "error value could not be encoded",
        })
    })
}
