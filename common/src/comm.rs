//! Wire framing constants for the fixed-size packet transport.
//!
//! ```text
//!  ? # # <msg_id:2 BE> <msg_len:4 BE> <payload ...>
//! ```
//!
//! The first packet of a message starts with the three magic bytes below;
//! continuation packets start with a single `?`. Packet size is the
//! transport's minimum delivery unit and does not vary per-message.

/// Marks the first packet of a message.
pub const MSG_HEADER_MAGIC: [u8; 3] = [b'?', b'#', b'#'];

/// Marks a continuation packet.
pub const MSG_CONT_MAGIC: u8 = b'?';

/// Fixed packet size of the underlying transport.
pub const PACKET_SIZE: usize = 64;

/// Bytes of packet payload available after the first-packet header
/// (`?##` + 2-byte msg_id + 4-byte msg_len).
pub const FIRST_PACKET_PAYLOAD: usize = PACKET_SIZE - 3 - 2 - 4;

/// Bytes of packet payload available in a continuation packet (`?` + payload).
pub const CONT_PACKET_PAYLOAD: usize = PACKET_SIZE - 1;

/// Largest message the device will assemble before decoding.
pub const MSG_IN_ENCODED_SIZE: usize = 8 * 1024;
