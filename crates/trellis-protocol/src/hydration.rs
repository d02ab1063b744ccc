//! Hydration payload: a serialized cache prelude recorded during SSR.
//!
//! Wire layout (codec-encoded):
//!
//! ```json
//! { "schema": …,
//!   "refs":   [ [parentToken, edgeName, …args], … ],
//!   "data":   [ [token, value]
//!              |[token, methodName, args, result] ] }
//! ```
//!
//! `refs[i]` defines token `i + 1` as a child of `parentToken`; token 0 is
//! the root and has no ref entry.  The heterogeneous arrays don't map onto
//! derived serde shapes, so conversion is explicit.

use crate::Schema;
use serde_json::{Value as Json, json};

/// One token-defining edge record.
#[derive(Debug, Clone, PartialEq)]
pub struct HydrationRef {
    pub parent: u64,
    pub edge: String,
    pub args: Vec<Json>,
}

/// One recorded data entry.
#[derive(Debug, Clone, PartialEq)]
pub enum HydrationEntry {
    /// A node data snapshot.
    Snapshot { token: u64, value: Json },
    /// A recorded method-call result — a single replay of what the server
    /// actually executed during SSR.
    Call {
        token: u64,
        method: String,
        args: Vec<Json>,
        result: Json,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HydrationPayload {
    pub schema: Schema,
    pub refs: Vec<HydrationRef>,
    pub data: Vec<HydrationEntry>,
}

#[derive(Debug, thiserror::Error)]
#[error("malformed hydration payload: {0}")]
pub struct MalformedPayload(pub String);

impl HydrationPayload {
    pub fn to_flattened(&self) -> Json {
        let refs: Vec<Json> = self
            .refs
            .iter()
            .map(|r| {
                let mut row = vec![json!(r.parent), json!(r.edge)];
                row.extend(r.args.iter().cloned());
                Json::Array(row)
            })
            .collect();
        let data: Vec<Json> = self
            .data
            .iter()
            .map(|entry| match entry {
                HydrationEntry::Snapshot { token, value } => {
                    Json::Array(vec![json!(token), value.clone()])
                }
                HydrationEntry::Call {
                    token,
                    method,
                    args,
                    result,
                } => Json::Array(vec![
                    json!(token),
                    json!(method),
                    Json::Array(args.clone()),
                    result.clone(),
                ]),
            })
            .collect();
        json!({
            "schema": serde_json::to_value(&self.schema).unwrap_or(Json::Null),
            "refs": refs,
            "data": data,
        })
    }

    pub fn from_flattened(json: &Json) -> Result<HydrationPayload, MalformedPayload> {
        let map = json
            .as_object()
            .ok_or_else(|| MalformedPayload("payload must be an object".into()))?;
        let schema: Schema = serde_json::from_value(
            map.get("schema")
                .cloned()
                .ok_or_else(|| MalformedPayload("missing 'schema'".into()))?,
        )
        .map_err(|e| MalformedPayload(format!("schema: {e}")))?;

        let refs_raw = map
            .get("refs")
            .and_then(Json::as_array)
            .ok_or_else(|| MalformedPayload("'refs' must be an array".into()))?;
        let mut refs = Vec::with_capacity(refs_raw.len());
        for row in refs_raw {
            let row = row
                .as_array()
                .filter(|r| r.len() >= 2)
                .ok_or_else(|| MalformedPayload("ref row must be [parent, edge, …args]".into()))?;
            let parent = row[0]
                .as_u64()
                .ok_or_else(|| MalformedPayload("ref parent must be a token".into()))?;
            let edge = row[1]
                .as_str()
                .ok_or_else(|| MalformedPayload("ref edge must be a string".into()))?
                .to_owned();
            refs.push(HydrationRef {
                parent,
                edge,
                args: row[2..].to_vec(),
            });
        }

        let data_raw = map
            .get("data")
            .and_then(Json::as_array)
            .ok_or_else(|| MalformedPayload("'data' must be an array".into()))?;
        let mut data = Vec::with_capacity(data_raw.len());
        for row in data_raw {
            let row = row
                .as_array()
                .ok_or_else(|| MalformedPayload("data row must be an array".into()))?;
            let token = row
                .first()
                .and_then(Json::as_u64)
                .ok_or_else(|| MalformedPayload("data row must start with a token".into()))?;
            match row.len() {
                2 => data.push(HydrationEntry::Snapshot {
                    token,
                    value: row[1].clone(),
                }),
                4 => {
                    let method = row[1]
                        .as_str()
                        .ok_or_else(|| MalformedPayload("call method must be a string".into()))?
                        .to_owned();
                    let args = row[2]
                        .as_array()
                        .ok_or_else(|| MalformedPayload("call args must be an array".into()))?
                        .clone();
                    data.push(HydrationEntry::Call {
                        token,
                        method,
                        args,
                        result: row[3].clone(),
                    });
                }
                n => {
                    return Err(MalformedPayload(format!(
                        "data row must have 2 or 4 elements, got {n}"
                    )));
                }
            }
        }

        Ok(HydrationPayload { schema, refs, data })
    }
}
