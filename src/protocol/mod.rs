//! Protocol module - opcode vocabulary, frame encoding, operation shapes.
//!
//! The wire discipline on the sync channel is a strict 1:1 ping-pong: a
//! request frame elicits exactly one reply frame before the next request may
//! be written on that channel. The single exception is `Ping`, which is
//! fire-and-forget by design. The push channel runs the same discipline in
//! the opposite direction (`deliver`/`push ping`, each acked once).

mod opcode;
pub mod ops;
mod wire;

pub use opcode::Opcode;
pub use wire::{
    decode_push, decode_push_ack, decode_reply, decode_request, encode_push, encode_push_ack,
    encode_reply, encode_request, RemoteFault, Reply, REQUEST_PREFIX, STATUS_EMPTY, STATUS_FAILED,
    STATUS_VALUE,
};
