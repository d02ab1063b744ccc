//! The dynamic value domain.
//!
//! Everything user handlers return, every method argument, and every cached
//! snapshot is a `Value`.  Objects and maps preserve insertion order; that
//! order is visible in canonical keys (see `fmt`).

use crate::error::WireError;
use crate::path::Path;
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A wire-transportable value.
///
/// The tree is acyclic by ownership.  `Undefined` is distinct from `Null`:
/// it marks holes in sparse lists and "no such property" results.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Undefined,
    Bool(bool),
    Int(i64),
    Float(f64),
    BigInt(i128),
    String(String),
    Bytes(Bytes),
    Date(DateTime<Utc>),
    List(Vec<Value>),
    /// Plain object; insertion-ordered string keys.
    Object(Vec<(String, Value)>),
    /// Map with arbitrary keys; insertion-ordered.
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
    /// A user-registered custom type, identified by its codec tag.
    Custom { tag: String, payload: Box<Value> },
    /// A framework error travelling as a value.
    Error(WireError),
    /// Path + data snapshot; a cache-invalidation and priming signal.
    Reference { path: Path, data: Box<Value> },
    /// Path only; a pointer into the graph.
    PathArg(Path),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Value {
        Value::String(s.into())
    }

    pub fn object(pairs: Vec<(&str, Value)>) -> Value {
        Value::Object(pairs.into_iter().map(|(k, v)| (k.to_owned(), v)).collect())
    }

    /// Object field lookup; `None` for non-objects or missing keys.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(pairs) => pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Whether an object snapshot contains the given key.
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Value {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Value {
        Value::Float(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::String(s)
    }
}
