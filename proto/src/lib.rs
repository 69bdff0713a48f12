//! Wire structs for the stele P2P stack.
//!
//! These mirror the protobuf schemas exchanged on the wire: the transport
//! packets multiplexed by a peer connection, the authenticated-handshake
//! messages, and the node-info record swapped after key agreement. The
//! structs are written out by hand in the shape `prost-build` would emit,
//! so the crate builds without a protoc toolchain.

pub mod crypto;
pub mod google;
pub mod p2p;

use prost::Message;

/// Serialized size of a message including its uleb128 length prefix.
pub fn length_delimited_len<M: Message>(msg: &M) -> usize {
    let len = msg.encoded_len();
    len + prost::length_delimiter_len(len)
}
