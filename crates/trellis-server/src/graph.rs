//! The graph surface the server exposes: node handles, class metadata, and
//! visibility.
//!
//! The decorator/metadata frontend that user code declares graphs with is a
//! collaborator; this core consumes its output — a [`ClassRegistry`] of
//! [`ClassDef`]s plus [`GraphNode`] handles reachable from a root node.

use crate::session::OpContext;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use trellis_codec::{Value, WireError};

/// Property names that are never resolvable, whatever the class declares.
pub const DANGEROUS_NAMES: &[&str] = &["constructor", "__proto__", "prototype"];

pub fn is_dangerous(name: &str) -> bool {
    DANGEROUS_NAMES.contains(&name)
}

/// A resolved node in the graph.  Lifetime is per-connection: nodes are
/// created on demand by edge handlers and discarded at session end.
pub type NodeRef = Arc<dyn GraphNode>;

/// Failure inside user handler code.
///
/// `Framework` errors pass through untouched; `Custom` values round-trip via
/// the codec and are never redacted; everything else is opaque — wrapped
/// with an operation-matched code and subject to redaction.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Framework(WireError),
    #[error("custom error value")]
    Custom(Value),
    #[error("{0}")]
    Other(String),
}

impl HandlerError {
    pub fn msg(message: impl Into<String>) -> HandlerError {
        HandlerError::Other(message.into())
    }
}

impl From<WireError> for HandlerError {
    fn from(e: WireError) -> Self {
        HandlerError::Framework(e)
    }
}

/// A user-defined object reachable from the root.
///
/// Implementations return `'static` futures, so `async move` bodies clone
/// what they need.  `get` answers bare property/getter reads; `snapshot`
/// produces the data view sent for `data` operations and references —
/// functions, edges, and hidden fields are the implementor's to exclude.
pub trait GraphNode: Send + Sync + 'static {
    fn class_name(&self) -> &str;

    fn edge(
        &self,
        name: &str,
        args: Vec<Value>,
        ctx: OpContext,
    ) -> BoxFuture<'static, Result<NodeRef, HandlerError>>;

    fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        ctx: OpContext,
    ) -> BoxFuture<'static, Result<Value, HandlerError>>;

    fn get(&self, name: &str) -> Option<Value>;

    fn snapshot(&self) -> Result<Value, HandlerError>;
}

// ---------------------------------------------------------------------------
// Class metadata
// ---------------------------------------------------------------------------

/// Visibility predicate over the connection context.  Hidden entries are
/// omitted from the schema entirely.
pub type Visibility = Arc<dyn Fn(&ConnContext) -> bool + Send + Sync>;

/// Async-capable argument validator; `Err` carries the rejection message.
pub type ArgValidator =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Recipe computing a class instance's canonical path from its identifying
/// arguments, recorded against a [`PathRecorder`].
pub type CanonicalPathFn = Arc<dyn Fn(&mut PathRecorder, &[Value]) + Send + Sync>;

#[derive(Clone)]
pub struct EdgeDef {
    pub name: String,
    pub target: String,
    pub visibility: Option<Visibility>,
}

#[derive(Clone)]
pub struct MethodDef {
    pub name: String,
    pub arg_schemas: Vec<ArgValidator>,
    pub visibility: Option<Visibility>,
}

/// Metadata for one node class: its edges, methods, and canonical path.
#[derive(Clone)]
pub struct ClassDef {
    pub name: String,
    pub edges: Vec<EdgeDef>,
    pub methods: Vec<MethodDef>,
    pub canonical_path: Option<CanonicalPathFn>,
}

impl ClassDef {
    pub fn new(name: impl Into<String>) -> ClassDef {
        ClassDef {
            name: name.into(),
            edges: Vec::new(),
            methods: Vec::new(),
            canonical_path: None,
        }
    }

    pub fn edge(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.edges.push(EdgeDef {
            name: name.into(),
            target: target.into(),
            visibility: None,
        });
        self
    }

    pub fn edge_when(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        visibility: Visibility,
    ) -> Self {
        self.edges.push(EdgeDef {
            name: name.into(),
            target: target.into(),
            visibility: Some(visibility),
        });
        self
    }

    pub fn method(mut self, name: impl Into<String>, arg_schemas: Vec<ArgValidator>) -> Self {
        self.methods.push(MethodDef {
            name: name.into(),
            arg_schemas,
            visibility: None,
        });
        self
    }

    pub fn method_when(
        mut self,
        name: impl Into<String>,
        arg_schemas: Vec<ArgValidator>,
        visibility: Visibility,
    ) -> Self {
        self.methods.push(MethodDef {
            name: name.into(),
            arg_schemas,
            visibility: Some(visibility),
        });
        self
    }

    pub fn canonical(
        mut self,
        recipe: impl Fn(&mut PathRecorder, &[Value]) + Send + Sync + 'static,
    ) -> Self {
        self.canonical_path = Some(Arc::new(recipe));
        self
    }

    pub fn find_edge(&self, name: &str) -> Option<&EdgeDef> {
        self.edges.iter().find(|e| e.name == name)
    }

    pub fn find_method(&self, name: &str) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// All class metadata for one graph, keyed by class name.
#[derive(Clone)]
pub struct ClassRegistry {
    root: String,
    classes: HashMap<String, Arc<ClassDef>>,
}

impl ClassRegistry {
    pub fn new(root_class: impl Into<String>) -> ClassRegistry {
        ClassRegistry {
            root: root_class.into(),
            classes: HashMap::new(),
        }
    }

    pub fn class(mut self, def: ClassDef) -> Self {
        self.classes.insert(def.name.clone(), Arc::new(def));
        self
    }

    pub fn root_class(&self) -> &str {
        &self.root
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ClassDef>> {
        self.classes.get(name)
    }
}

// ---------------------------------------------------------------------------
// Connection context
// ---------------------------------------------------------------------------

/// Per-connection ambient data (auth claims, locale, …) that visibility
/// predicates and handlers consult.
#[derive(Clone, Debug, Default)]
pub struct ConnContext {
    data: Arc<Value>,
}

impl ConnContext {
    pub fn new(data: Value) -> ConnContext {
        ConnContext {
            data: Arc::new(data),
        }
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

/// Whether an edge/method is visible for this connection.
pub fn visible(visibility: Option<&Visibility>, ctx: &ConnContext) -> bool {
    visibility.is_none_or(|v| v(ctx))
}

// ---------------------------------------------------------------------------
// Path recorder
// ---------------------------------------------------------------------------

/// Builder-style recorder that canonical-path recipes append segments to.
#[derive(Default)]
pub struct PathRecorder {
    path: trellis_codec::Path,
}

impl PathRecorder {
    pub fn new() -> PathRecorder {
        PathRecorder::default()
    }

    pub fn seg(&mut self, name: impl Into<String>) -> &mut Self {
        self.path = self.path.child(trellis_codec::Segment::prop(name));
        self
    }

    pub fn call(&mut self, name: impl Into<String>, args: Vec<Value>) -> &mut Self {
        self.path = self.path.child(trellis_codec::Segment::call(name, args));
        self
    }

    pub fn into_path(self) -> trellis_codec::Path {
        self.path
    }
}

// ---------------------------------------------------------------------------
// Validator helpers
// ---------------------------------------------------------------------------

/// Common argument validators for method schemas.
pub mod validators {
    use super::ArgValidator;
    use futures_util::FutureExt;
    use std::sync::Arc;
    use trellis_codec::Value;

    /// Accepts anything.
    pub fn any() -> ArgValidator {
        Arc::new(|_| async { Ok(()) }.boxed())
    }

    /// Accepts only strings.
    pub fn string() -> ArgValidator {
        Arc::new(|v: Value| {
            async move {
                match v {
                    Value::String(_) => Ok(()),
                    other => Err(format!("expected a string, got {other:?}")),
                }
            }
            .boxed()
        })
    }

    /// Accepts only integers.
    pub fn int() -> ArgValidator {
        Arc::new(|v: Value| {
            async move {
                match v {
                    Value::Int(_) => Ok(()),
                    other => Err(format!("expected an integer, got {other:?}")),
                }
            }
            .boxed()
        })
    }

    /// Wrap a synchronous predicate.
    pub fn check(
        f: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> ArgValidator {
        let f = Arc::new(f);
        Arc::new(move |v: Value| {
            let f = f.clone();
            async move { f(&v) }.boxed()
        })
    }
}
