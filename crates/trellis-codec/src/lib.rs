// trellis-codec: value model, canonical key formatter, and wire codec.
//
// The codec is the lowest layer of the stack: everything that crosses the
// wire, lands in a cache, or becomes a coalescing key goes through the types
// in this crate.  Client and server must register identical custom types or
// deserialization fails.

pub mod codec;
pub mod error;
pub mod fmt;
pub mod path;
pub mod value;

pub use codec::{Codec, CodecBuilder, CustomType};
pub use error::{CodecError, ErrorCode, WireError};
pub use fmt::{args_key, format_value, key_is_descendant, path_key, segment_key};
pub use path::{MAX_PATH_DEPTH, Path, Segment};
pub use value::Value;
