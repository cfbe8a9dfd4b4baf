//! Tunnel Protocol Definitions
//!
//! This crate defines the stream identifiers and the packet framing that both
//! peers of a tunnel put on the channel. Every channel message carries exactly
//! one [`Packet`]:
//!
//! ```text
//! [0..6)   stream id, 6 ASCII alphanumeric bytes
//! [6]      0x00 terminator
//! [7..11)  packet type, u32 little-endian (0 = Data, 1 = Disconnect)
//! [11..)   payload (Data only)
//! ```

pub mod packet;
pub mod stream_id;

pub use packet::{Chunks, Packet, PacketType, ProtoError};
pub use stream_id::{StreamId, STREAM_ID_LEN};

/// Largest payload carried by one Data packet (60 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 60 * 1024;
