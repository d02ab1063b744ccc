// trellis-protocol: wire message types, schema table, hydration payload,
// and the abstract transport the session cores run over.
//
// All messages use a top-level `op` field for discrimination.  Client
// messages are parsed through a strict structural validator (shape errors
// close the connection); server messages are trusted and parsed via serde.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod hydration;
pub mod transport;

pub use hydration::{HydrationEntry, HydrationPayload, HydrationRef};
pub use transport::{Connect, Transport, TransportClosed, TransportSender};

/// Frozen wire version, echoed in the hello message.
pub const WIRE_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Schema table
// ---------------------------------------------------------------------------

/// Per-connection indexed type table.  Entry 0 is the root type; each entry
/// names the edges defined on that type and the index of the edge's target
/// type.  Edges hidden from the connection context are absent, and so is any
/// type reachable only through hidden edges.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schema {
    pub classes: Vec<SchemaClass>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchemaClass {
    pub edges: Vec<SchemaEdge>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEdge {
    pub name: String,
    pub target: u16,
}

impl Schema {
    /// The target type index of `name` on type `class`, or `None` when the
    /// name is not an edge there.
    pub fn edge_target(&self, class: u16, name: &str) -> Option<u16> {
        self.classes
            .get(class as usize)?
            .edges
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.target)
    }
}

// ---------------------------------------------------------------------------
// Client -> server messages
// ---------------------------------------------------------------------------

/// Messages a client sends.  `args` and `data` fields carry codec-flattened
/// values; correlation is implicit (1-based send order, echoed back in `re`).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ClientMessage {
    Edge {
        tok: u64,
        edge: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        args: Option<Vec<Json>>,
    },
    Get {
        tok: u64,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        args: Option<Vec<Json>>,
    },
    Data {
        tok: u64,
    },
}

/// Structural validation failure; the server closes the connection on any
/// of these.
#[derive(Debug, thiserror::Error)]
#[error("malformed client message: {0}")]
pub struct MalformedMessage(pub String);

/// Strict parse of a client message.
///
/// Only well-typed shapes are accepted: `tok` must be a non-negative
/// integer, `edge`/`name` non-empty strings, `args` (when present) an array,
/// and no extra keys are permitted.
pub fn parse_client_message(json: &Json) -> Result<ClientMessage, MalformedMessage> {
    let map = json
        .as_object()
        .ok_or_else(|| MalformedMessage("message must be an object".into()))?;
    let op = map
        .get("op")
        .and_then(Json::as_str)
        .ok_or_else(|| MalformedMessage("missing 'op'".into()))?;

    let allowed: &[&str] = match op {
        "edge" => &["op", "tok", "edge", "args"],
        "get" => &["op", "tok", "name", "args"],
        "data" => &["op", "tok"],
        other => return Err(MalformedMessage(format!("unknown op '{other}'"))),
    };
    for key in map.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(MalformedMessage(format!("unexpected key '{key}'")));
        }
    }

    let tok = map
        .get("tok")
        .and_then(Json::as_u64)
        .ok_or_else(|| MalformedMessage("'tok' must be a non-negative integer".into()))?;

    let string_field = |name: &str| -> Result<String, MalformedMessage> {
        map.get(name)
            .and_then(Json::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| MalformedMessage(format!("'{name}' must be a non-empty string")))
    };
    let args_field = || -> Result<Option<Vec<Json>>, MalformedMessage> {
        match map.get("args") {
            None => Ok(None),
            Some(Json::Array(items)) => Ok(Some(items.clone())),
            Some(_) => Err(MalformedMessage("'args' must be an array".into())),
        }
    };

    Ok(match op {
        "edge" => ClientMessage::Edge {
            tok,
            edge: string_field("edge")?,
            args: args_field()?,
        },
        "get" => ClientMessage::Get {
            tok,
            name: string_field("name")?,
            args: args_field()?,
        },
        _ => ClientMessage::Data { tok },
    })
}

// ---------------------------------------------------------------------------
// Server -> client messages
// ---------------------------------------------------------------------------

/// Messages a server sends.  `hello` is always message 0 and carries no
/// `re`; every other message echoes the 1-based sequence number of the
/// client message it answers.  Error payloads are codec-flattened values
/// reviving to either a framework error or a user custom error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ServerMessage {
    Hello {
        version: u32,
        schema: Schema,
    },
    Edge {
        tok: u64,
        re: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Json>,
    },
    Get {
        tok: u64,
        re: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Json>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Json>,
    },
    Data {
        tok: u64,
        re: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Json>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Json>,
    },
}

impl ServerMessage {
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_wire(text: &str) -> Result<ServerMessage, serde_json::Error> {
        serde_json::from_str(text)
    }
}
