//! At-await path classification: split a path into its edge prefix and
//! terminal against the session schema.

use crate::error::ClientError;
use trellis_codec::{ErrorCode, MAX_PATH_DEPTH, Path, Segment};
use trellis_protocol::Schema;

/// A classified path: every segment in `edge_path` is an edge; `terminal`
/// is the single trailing non-edge segment, absent for full-node fetches.
#[derive(Debug, PartialEq)]
pub struct Classified<'a> {
    pub edge_path: &'a [Segment],
    pub terminal: Option<&'a Segment>,
}

/// Walk the segments from type index 0, following `edges[name]` until some
/// segment name is not an edge on the current type.  Navigating past a
/// non-edge is a programming error.
pub fn classify<'a>(path: &'a Path, schema: &Schema) -> Result<Classified<'a>, ClientError> {
    if path.len() > MAX_PATH_DEPTH {
        return Err(ClientError::local(
            ErrorCode::InvalidPath,
            "path exceeds max depth",
        ));
    }
    let mut class: u16 = 0;
    for (i, seg) in path.segments.iter().enumerate() {
        match schema.edge_target(class, &seg.name) {
            Some(next) => class = next,
            None => {
                if i != path.segments.len() - 1 {
                    return Err(ClientError::local(
                        ErrorCode::InvalidPath,
                        format!("extra segments after terminal '{}'", seg.name),
                    ));
                }
                return Ok(Classified {
                    edge_path: &path.segments[..i],
                    terminal: Some(seg),
                });
            }
        }
    }
    Ok(Classified {
        edge_path: &path.segments,
        terminal: None,
    })
}
