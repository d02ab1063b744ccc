//! Wire codec: `Value` ⇄ flattened JSON ⇄ string.
//!
//! The flattened form keeps JSON scalars bare and wraps every rich type in a
//! `{"$": "<tag>", ...}` envelope.  A plain object is enveloped only when it
//! would otherwise be mistaken for one (a literal `$` key).
//!
//! `revive` accepts an already-parsed flattened value, which is how
//! hydration payloads arrive.  Built-in tags shadow user tags on collision;
//! decoding an unregistered custom tag fails, which is how mismatched
//! client/server codecs surface.

use crate::error::{CodecError, ErrorCode, WireError};
use crate::path::{Path, Segment};
use crate::value::Value;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::TimeZone;
use serde_json::{Value as Json, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

const BUILTIN_TAGS: &[&str] = &[
    "undefined", "float", "bigint", "bytes", "date", "map", "set", "obj", "custom", "error",
    "ref", "patharg",
];

/// A user-registered custom type.
///
/// `reduce` runs on encode (payload → flattened-ready payload) and `revive`
/// on decode.  The defaults pass the payload through unchanged, which is
/// enough for types whose payload is already a plain `Value`.
pub trait CustomType: Send + Sync {
    fn tag(&self) -> &str;

    fn reduce(&self, payload: &Value) -> Result<Value, CodecError> {
        Ok(payload.clone())
    }

    fn revive(&self, payload: Value) -> Result<Value, CodecError> {
        Ok(payload)
    }
}

/// Builder for a [`Codec`]; register custom types, then `build()`.
#[derive(Default)]
pub struct CodecBuilder {
    customs: HashMap<String, Arc<dyn CustomType>>,
}

impl CodecBuilder {
    pub fn register(mut self, custom: Arc<dyn CustomType>) -> Self {
        let tag = custom.tag().to_owned();
        if BUILTIN_TAGS.contains(&tag.as_str()) {
            // Built-ins shadow user reducers on name collision.
            warn!(tag = %tag, "custom type tag shadows a built-in; ignored");
            return self;
        }
        self.customs.insert(tag, custom);
        self
    }

    pub fn build(self) -> Codec {
        Codec {
            customs: self.customs,
        }
    }
}

/// The value codec.  Client and server must register identical custom types.
pub struct Codec {
    customs: HashMap<String, Arc<dyn CustomType>>,
}

impl Default for Codec {
    fn default() -> Self {
        CodecBuilder::default().build()
    }
}

impl Codec {
    pub fn builder() -> CodecBuilder {
        CodecBuilder::default()
    }

    /// Whether a user-supplied reducer claims this value.
    ///
    /// Drives redaction: claimed thrown values are known custom errors and
    /// are never redacted.
    pub fn handles(&self, value: &Value) -> bool {
        match value {
            Value::Custom { tag, .. } => self.customs.contains_key(tag),
            _ => false,
        }
    }

    pub fn encode(&self, value: &Value) -> Result<String, CodecError> {
        Ok(serde_json::to_string(&self.flatten(value)?)?)
    }

    pub fn decode(&self, text: &str) -> Result<Value, CodecError> {
        self.revive(serde_json::from_str(text)?)
    }

    /// Value → flattened JSON form.
    pub fn flatten(&self, value: &Value) -> Result<Json, CodecError> {
        Ok(match value {
            Value::Null => Json::Null,
            Value::Undefined => json!({"$": "undefined"}),
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(n) => json!(n),
            Value::Float(f) => {
                if f.is_nan() {
                    json!({"$": "float", "v": "NaN"})
                } else if f.is_infinite() {
                    json!({"$": "float", "v": if *f > 0.0 { "inf" } else { "-inf" }})
                } else {
                    json!(f)
                }
            }
            Value::BigInt(n) => json!({"$": "bigint", "v": n.to_string()}),
            Value::String(s) => Json::String(s.clone()),
            Value::Bytes(b) => json!({"$": "bytes", "v": BASE64.encode(b)}),
            Value::Date(d) => json!({"$": "date", "v": d.timestamp_millis()}),
            Value::List(items) => Json::Array(
                items
                    .iter()
                    .map(|v| self.flatten(v))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(pairs) => {
                if pairs.iter().any(|(k, _)| k == "$") {
                    let entries = self.flatten_pairs(pairs)?;
                    json!({"$": "obj", "e": entries})
                } else {
                    let mut map = serde_json::Map::new();
                    for (k, v) in pairs {
                        map.insert(k.clone(), self.flatten(v)?);
                    }
                    Json::Object(map)
                }
            }
            Value::Map(pairs) => {
                let entries: Vec<Json> = pairs
                    .iter()
                    .map(|(k, v)| Ok(Json::Array(vec![self.flatten(k)?, self.flatten(v)?])))
                    .collect::<Result<_, CodecError>>()?;
                json!({"$": "map", "e": entries})
            }
            Value::Set(items) => {
                let entries: Vec<Json> = items
                    .iter()
                    .map(|v| self.flatten(v))
                    .collect::<Result<_, _>>()?;
                json!({"$": "set", "e": entries})
            }
            Value::Custom { tag, payload } => {
                let custom = self
                    .customs
                    .get(tag)
                    .ok_or_else(|| CodecError::UnknownTag(tag.clone()))?;
                let reduced = custom.reduce(payload)?;
                json!({"$": "custom", "tag": tag, "v": self.flatten(&reduced)?})
            }
            Value::Error(e) => {
                let mut map = serde_json::Map::new();
                map.insert("$".to_owned(), json!("error"));
                map.insert("code".to_owned(), json!(e.code.as_str()));
                map.insert("message".to_owned(), json!(e.message));
                if let Some(id) = e.error_id {
                    map.insert("id".to_owned(), json!(id.to_string()));
                }
                Json::Object(map)
            }
            Value::Reference { path, data } => {
                json!({"$": "ref", "path": self.flatten_path(path)?, "data": self.flatten(data)?})
            }
            Value::PathArg(path) => json!({"$": "patharg", "path": self.flatten_path(path)?}),
        })
    }

    fn flatten_pairs(&self, pairs: &[(String, Value)]) -> Result<Vec<Json>, CodecError> {
        pairs
            .iter()
            .map(|(k, v)| Ok(Json::Array(vec![json!(k), self.flatten(v)?])))
            .collect()
    }

    /// Flattened JSON form → value, without going through the string form.
    pub fn revive(&self, json: Json) -> Result<Value, CodecError> {
        Ok(match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    return Err(CodecError::Malformed(format!("unrepresentable number {n}")));
                }
            }
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::List(
                items
                    .into_iter()
                    .map(|v| self.revive(v))
                    .collect::<Result<_, _>>()?,
            ),
            Json::Object(map) => {
                let Some(tag) = map.get("$").and_then(Json::as_str).map(str::to_owned) else {
                    let mut pairs = Vec::with_capacity(map.len());
                    for (k, v) in map {
                        pairs.push((k, self.revive(v)?));
                    }
                    return Ok(Value::Object(pairs));
                };
                self.revive_envelope(&tag, map)?
            }
        })
    }

    fn revive_envelope(
        &self,
        tag: &str,
        map: serde_json::Map<String, Json>,
    ) -> Result<Value, CodecError> {
        let field = |name: &str| -> Result<&Json, CodecError> {
            map.get(name)
                .ok_or_else(|| CodecError::Malformed(format!("'{tag}' envelope missing '{name}'")))
        };
        Ok(match tag {
            "undefined" => Value::Undefined,
            "float" => match field("v")?.as_str() {
                Some("NaN") => Value::Float(f64::NAN),
                Some("inf") => Value::Float(f64::INFINITY),
                Some("-inf") => Value::Float(f64::NEG_INFINITY),
                other => {
                    return Err(CodecError::Malformed(format!(
                        "bad float keyword {other:?}"
                    )));
                }
            },
            "bigint" => {
                let s = field("v")?
                    .as_str()
                    .ok_or_else(|| CodecError::Malformed("bigint value must be a string".into()))?;
                Value::BigInt(
                    s.parse::<i128>()
                        .map_err(|_| CodecError::BigIntRange(s.to_owned()))?,
                )
            }
            "bytes" => {
                let s = field("v")?
                    .as_str()
                    .ok_or_else(|| CodecError::Malformed("bytes value must be a string".into()))?;
                Value::Bytes(bytes::Bytes::from(
                    BASE64
                        .decode(s)
                        .map_err(|e| CodecError::Malformed(format!("base64: {e}")))?,
                ))
            }
            "date" => {
                let ms = field("v")?
                    .as_i64()
                    .ok_or_else(|| CodecError::Malformed("date value must be millis".into()))?;
                match chrono::Utc.timestamp_millis_opt(ms) {
                    chrono::LocalResult::Single(d) => Value::Date(d),
                    _ => return Err(CodecError::Malformed(format!("date out of range: {ms}"))),
                }
            }
            "map" => {
                let entries = field("e")?
                    .as_array()
                    .ok_or_else(|| CodecError::Malformed("map entries must be an array".into()))?;
                let mut pairs = Vec::with_capacity(entries.len());
                for entry in entries {
                    let pair = entry.as_array().filter(|p| p.len() == 2).ok_or_else(|| {
                        CodecError::Malformed("map entry must be a [k, v] pair".into())
                    })?;
                    pairs.push((self.revive(pair[0].clone())?, self.revive(pair[1].clone())?));
                }
                Value::Map(pairs)
            }
            "set" => {
                let entries = field("e")?
                    .as_array()
                    .ok_or_else(|| CodecError::Malformed("set entries must be an array".into()))?;
                Value::Set(
                    entries
                        .iter()
                        .map(|v| self.revive(v.clone()))
                        .collect::<Result<_, _>>()?,
                )
            }
            "obj" => {
                let entries = field("e")?
                    .as_array()
                    .ok_or_else(|| CodecError::Malformed("obj entries must be an array".into()))?;
                let mut pairs = Vec::with_capacity(entries.len());
                for entry in entries {
                    let pair = entry.as_array().filter(|p| p.len() == 2).ok_or_else(|| {
                        CodecError::Malformed("obj entry must be a [k, v] pair".into())
                    })?;
                    let key = pair[0]
                        .as_str()
                        .ok_or_else(|| CodecError::Malformed("obj key must be a string".into()))?;
                    pairs.push((key.to_owned(), self.revive(pair[1].clone())?));
                }
                Value::Object(pairs)
            }
            "custom" => {
                let custom_tag = field("tag")?
                    .as_str()
                    .ok_or_else(|| CodecError::Malformed("custom tag must be a string".into()))?;
                let custom = self
                    .customs
                    .get(custom_tag)
                    .ok_or_else(|| CodecError::UnknownTag(custom_tag.to_owned()))?;
                let payload = custom.revive(self.revive(field("v")?.clone())?)?;
                Value::Custom {
                    tag: custom_tag.to_owned(),
                    payload: Box::new(payload),
                }
            }
            "error" => {
                let code_str = field("code")?
                    .as_str()
                    .ok_or_else(|| CodecError::Malformed("error code must be a string".into()))?;
                let code = ErrorCode::parse(code_str)
                    .ok_or_else(|| CodecError::Malformed(format!("unknown error code {code_str}")))?;
                let message = field("message")?
                    .as_str()
                    .ok_or_else(|| CodecError::Malformed("error message must be a string".into()))?
                    .to_owned();
                let error_id = match map.get("id").and_then(Json::as_str) {
                    Some(s) => Some(
                        Uuid::parse_str(s)
                            .map_err(|e| CodecError::Malformed(format!("error id: {e}")))?,
                    ),
                    None => None,
                };
                Value::Error(WireError {
                    code,
                    message,
                    error_id,
                })
            }
            "ref" => Value::Reference {
                path: self.revive_path(field("path")?)?,
                data: Box::new(self.revive(field("data")?.clone())?),
            },
            "patharg" => Value::PathArg(self.revive_path(field("path")?)?),
            other => return Err(CodecError::UnknownTag(other.to_owned())),
        })
    }

    /// Flattened form of a path: an array of `{"n": name, "a": [args]?}`.
    pub fn flatten_path(&self, path: &Path) -> Result<Json, CodecError> {
        let segs: Vec<Json> = path
            .segments
            .iter()
            .map(|seg| {
                let mut map = serde_json::Map::new();
                map.insert("n".to_owned(), json!(seg.name));
                if let Some(args) = &seg.args {
                    let flat: Vec<Json> = args
                        .iter()
                        .map(|a| self.flatten(a))
                        .collect::<Result<_, _>>()?;
                    map.insert("a".to_owned(), Json::Array(flat));
                }
                Ok(Json::Object(map))
            })
            .collect::<Result<_, CodecError>>()?;
        Ok(Json::Array(segs))
    }

    pub fn revive_path(&self, json: &Json) -> Result<Path, CodecError> {
        let segs = json
            .as_array()
            .ok_or_else(|| CodecError::Malformed("path must be an array".into()))?;
        let mut segments = Vec::with_capacity(segs.len());
        for seg in segs {
            let map = seg
                .as_object()
                .ok_or_else(|| CodecError::Malformed("path segment must be an object".into()))?;
            let name = map
                .get("n")
                .and_then(Json::as_str)
                .ok_or_else(|| CodecError::Malformed("segment missing 'n'".into()))?
                .to_owned();
            let args = match map.get("a") {
                Some(Json::Array(items)) => Some(
                    items
                        .iter()
                        .map(|v| self.revive(v.clone()))
                        .collect::<Result<Vec<_>, _>>()?,
                ),
                Some(_) => {
                    return Err(CodecError::Malformed("segment args must be an array".into()));
                }
                None => None,
            };
            segments.push(Segment { name, args });
        }
        Ok(Path::from_segments(segments))
    }

    /// Flatten a list of argument values.
    pub fn flatten_args(&self, args: &[Value]) -> Result<Vec<Json>, CodecError> {
        args.iter().map(|a| self.flatten(a)).collect()
    }

    /// Revive a list of argument values.
    pub fn revive_args(&self, args: &[Json]) -> Result<Vec<Value>, CodecError> {
        args.iter().map(|a| self.revive(a.clone())).collect()
    }
}
