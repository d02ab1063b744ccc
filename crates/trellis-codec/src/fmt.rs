//! Canonical path and value formatting.
//!
//! The strings produced here are the universal currency for coalescing:
//! node cache keys on the server, edge/get/data cache keys on the client,
//! and hydration lookup keys.  Equal keys imply identical operations.
//!
//! Every supported value kind formats to a syntactically distinct shape, so
//! two different values can never collide.  Object key order is insertion
//! order, not sorted; two objects differing only in key order format
//! differently and will not coalesce.

use crate::path::{Path, Segment};
use crate::value::Value;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

/// Sentinel marking the session root; every canonical key starts with it.
pub const ROOT_KEY: &str = "$";

/// Canonical key for a full path.
pub fn path_key(path: &Path) -> String {
    let mut out = String::from(ROOT_KEY);
    for seg in &path.segments {
        out.push_str(&segment_key(seg));
    }
    out
}

/// Canonical key fragment for one segment (appended to the parent key).
pub fn segment_key(seg: &Segment) -> String {
    let mut out = name_key(&seg.name);
    if let Some(args) = &seg.args {
        out.push('(');
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&format_value(arg));
        }
        out.push(')');
    }
    out
}

/// Canonical key fragment for an argument list, the same shape a call
/// segment appends: `(arg₁,arg₂,…)`.
pub fn args_key(args: &[Value]) -> String {
    let mut out = String::from("(");
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&format_value(arg));
    }
    out.push(')');
    out
}

/// Whether `key` denotes a strict descendant of `ancestor`, respecting
/// segment boundaries (`$.posts` is not an ancestor of `$.posts2`).
pub fn key_is_descendant(key: &str, ancestor: &str) -> bool {
    key.len() > ancestor.len()
        && key.starts_with(ancestor)
        && matches!(key.as_bytes()[ancestor.len()], b'.' | b'[')
}

/// `.name` for identifier-shaped names, bracket-quoted otherwise.
fn name_key(name: &str) -> String {
    if is_identifier(name) {
        format!(".{name}")
    } else {
        format!("[{}]", quote(name))
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn quote(s: &str) -> String {
    // serde_json string quoting is stable and unambiguous.
    serde_json::to_string(s).unwrap_or_else(|_| format!("{s:?}"))
}

/// Unambiguous textual shape for a value.
///
/// Numbers are bare, floats always carry a `.`/keyword shape, strings are
/// quoted, and every rich type carries its own tag, so no two kinds share a
/// syntax.
pub fn format_value(v: &Value) -> String {
    match v {
        Value::Null => "null".to_owned(),
        Value::Undefined => "undefined".to_owned(),
        Value::Bool(b) => b.to_string(),
        Value::Int(n) => n.to_string(),
        // {:?} keeps the decimal point (1.0, -0.0) and the NaN/inf keywords,
        // so floats never collide with ints.
        Value::Float(f) => format!("{f:?}"),
        Value::BigInt(n) => format!("{n}n"),
        Value::String(s) => quote(s),
        Value::Bytes(b) => format!("Bytes({})", BASE64.encode(b)),
        Value::Date(d) => format!("Date({})", d.timestamp_millis()),
        Value::List(items) => {
            let inner: Vec<String> = items.iter().map(format_value).collect();
            format!("[{}]", inner.join(","))
        }
        Value::Object(pairs) => {
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", quote(k), format_value(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Map(pairs) => {
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}=>{}", format_value(k), format_value(v)))
                .collect();
            format!("Map{{{}}}", inner.join(","))
        }
        Value::Set(items) => {
            let inner: Vec<String> = items.iter().map(format_value).collect();
            format!("Set{{{}}}", inner.join(","))
        }
        Value::Custom { tag, payload } => {
            format!("Custom({},{})", quote(tag), format_value(payload))
        }
        Value::Error(e) => format!("Err({},{})", e.code, quote(&e.message)),
        // Identity of a reference is its path; the snapshot is not part of it.
        Value::Reference { path, .. } => format!("Ref({})", path_key(path)),
        Value::PathArg(path) => format!("Path({})", path_key(path)),
    }
}
