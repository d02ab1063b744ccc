// trellis: bidirectional graph RPC.
//
// A server exposes a typed object graph; clients navigate it with path
// expressions over stubs, and the session cores on both sides handle token
// pipelining, work coalescing, failure poisoning, resource bounds,
// transparent reconnect with replay, and SSR hydration.
//
// This facade re-exports the public surface of the member crates:
//
// - `trellis_codec`: the `Value` domain, canonical key formatter, wire codec
// - `trellis_protocol`: wire messages, schema table, hydration payload,
//   transport abstraction
// - `trellis_server`: class registry, token manager, request dispatcher
// - `trellis_client`: stubs, client session, hydration cache, reconnect

pub use trellis_codec::{
    Codec, CodecBuilder, CodecError, CustomType, ErrorCode, MAX_PATH_DEPTH, Path, Segment, Value,
    WireError,
};
pub use trellis_protocol::{
    ClientMessage, Connect, HydrationEntry, HydrationPayload, HydrationRef, Schema, SchemaClass,
    SchemaEdge, ServerMessage, Transport, TransportClosed, TransportSender, WIRE_VERSION,
};

pub mod server {
    pub use trellis_server::*;
}

pub mod client {
    pub use trellis_client::*;
}
