//! Codec module - serialization/deserialization for frame payloads.
//!
//! [`MsgPackCodec`] encodes opcode argument and result payloads as
//! MessagePack (struct-as-map via `to_vec_named`); message bodies ride
//! inside those payloads as raw byte blobs. The codec is a marker struct
//! with static methods, selected at compile time.
//!
//! Every frame is encoded into a fresh buffer and decoded from a
//! self-contained slice: the codec keeps no state between frames, so a
//! long-lived connection cannot accumulate a shared back-reference table
//! the way a stateful object stream would.

mod msgpack;

pub use msgpack::MsgPackCodec;
