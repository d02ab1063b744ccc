//! Paths: ordered segment lists addressing nodes and terminals in the graph.

use crate::value::Value;

/// Paths deeper than this are rejected as invalid before any wire traffic.
pub const MAX_PATH_DEPTH: usize = 64;

/// One path segment.
///
/// `args: None` is a bare (property-style) segment; `args: Some(..)` is a
/// call-form segment.  The two produce distinct canonical keys even when the
/// argument list is empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub name: String,
    pub args: Option<Vec<Value>>,
}

impl Segment {
    pub fn prop(name: impl Into<String>) -> Segment {
        Segment {
            name: name.into(),
            args: None,
        }
    }

    pub fn call(name: impl Into<String>, args: Vec<Value>) -> Segment {
        Segment {
            name: name.into(),
            args: Some(args),
        }
    }

    pub fn is_call(&self) -> bool {
        self.args.is_some()
    }
}

/// An ordered list of segments rooted at the session root.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Path {
    pub segments: Vec<Segment>,
}

impl Path {
    pub fn root() -> Path {
        Path {
            segments: Vec::new(),
        }
    }

    pub fn from_segments(segments: Vec<Segment>) -> Path {
        Path { segments }
    }

    /// A new path with one more segment appended.
    pub fn child(&self, seg: Segment) -> Path {
        let mut segments = self.segments.clone();
        segments.push(seg);
        Path { segments }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The canonical cache key for this path.
    pub fn key(&self) -> String {
        crate::fmt::path_key(self)
    }

    /// The path without its final segment; `None` at the root.
    pub fn parent(&self) -> Option<Path> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Path {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }
}
