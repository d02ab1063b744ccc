//! Stubs and data proxies: the synchronous navigation surface.
//!
//! A stub is a local object carrying a path.  `seg` and `invoke` extend the
//! path without touching the network; awaiting a stub (`IntoFuture`) is the
//! sole entry point into the session.  A call-form segment at the terminal
//! position is a method invocation; a bare segment is a property read.

use crate::error::ClientError;
use crate::session::Client;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use trellis_codec::{Path, Segment, Value};

/// A synchronous path-building stub.  Cloning is cheap.
#[derive(Clone)]
pub struct Stub {
    client: Client,
    path: Path,
}

impl Stub {
    pub(crate) fn new(client: Client, path: Path) -> Stub {
        Stub { client, path }
    }

    /// Property-style navigation: extend the path with a bare segment.
    pub fn seg(&self, name: &str) -> Stub {
        Stub {
            client: self.client.clone(),
            path: self.path.child(Segment::prop(name)),
        }
    }

    /// Call-form navigation: a parameterized edge or a method call.
    pub fn invoke(&self, name: &str, args: Vec<Value>) -> Stub {
        Stub {
            client: self.client.clone(),
            path: self.path.child(Segment::call(name, args)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for Stub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Stub({})", self.path.key())
    }
}

/// Awaiting a stub resolves it through the session.
impl IntoFuture for Stub {
    type Output = Result<Fetched, ClientError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        let Stub { client, path } = self;
        async move { client.resolve(path).await }.boxed()
    }
}

/// What awaiting a stub produced: a terminal value, or a data proxy over a
/// node snapshot.
#[derive(Debug)]
pub enum Fetched {
    Value(Value),
    Node(DataProxy),
}

impl Fetched {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Fetched::Value(v) => Some(v),
            Fetched::Node(_) => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Fetched::Value(v) => Some(v),
            Fetched::Node(_) => None,
        }
    }

    pub fn into_node(self) -> Option<DataProxy> {
        match self {
            Fetched::Node(p) => Some(p),
            Fetched::Value(_) => None,
        }
    }
}

/// A resolved data snapshot plus its path: reads come from the snapshot,
/// anything else continues navigation from the path.
#[derive(Debug, Clone)]
pub struct DataProxy {
    client: Client,
    path: Path,
    data: Value,
}

/// Result of a proxy field access.
#[derive(Debug)]
pub enum Field<'a> {
    /// The snapshot held the value.
    Value(&'a Value),
    /// Not in the snapshot; a child stub for continued navigation.
    Stub(Stub),
}

impl DataProxy {
    pub(crate) fn new(client: Client, path: Path, data: Value) -> DataProxy {
        DataProxy { client, path, data }
    }

    /// The raw snapshot.
    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot field, if present.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    /// Child stub from `path + [name]`, regardless of the snapshot.
    pub fn stub(&self, name: &str) -> Stub {
        Stub::new(self.client.clone(), self.path.child(Segment::prop(name)))
    }

    /// Snapshot value if present, else a child stub.
    pub fn field(&self, name: &str) -> Field<'_> {
        match self.data.get(name) {
            Some(v) => Field::Value(v),
            None => Field::Stub(self.stub(name)),
        }
    }
}
