//! Leader ↔ learner wire protocol.
//!
//! Every packet on a quorum connection is `{type: u32, zxid: i64, payload,
//! auth}` inside a u32 length-prefixed frame. Payload layouts for the
//! handshake and reconfig packets live next to the packet type definitions.

mod codec;
mod packet;

pub use codec::*;
pub use packet::*;
