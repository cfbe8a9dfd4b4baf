//! Packet framing and chunking

use crate::stream_id::{StreamId, STREAM_ID_LEN};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketType {
    Data = 0,
    Disconnect = 1,
}

impl TryFrom<u32> for PacketType {
    type Error = ProtoError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::Data),
            1 => Ok(PacketType::Disconnect),
            _ => Err(ProtoError::UnknownPacketType(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Packet too short: {0} bytes")]
    TooShort(usize),

    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u32),

    #[error("Invalid stream id: {0:?}")]
    InvalidStreamId(String),
}

/// One tunnel packet, carried by exactly one channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub stream_id: StreamId,
    pub packet_type: PacketType,
    pub payload: Bytes,
}

impl Packet {
    /// Id field size: 6 id bytes + terminator
    pub const ID_FIELD_SIZE: usize = STREAM_ID_LEN + 1;

    /// Header size: id field (7) + packet type (4) = 11 bytes
    pub const HEADER_SIZE: usize = Self::ID_FIELD_SIZE + 4;

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self {
            stream_id,
            packet_type: PacketType::Data,
            payload,
        }
    }

    pub fn disconnect(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            packet_type: PacketType::Disconnect,
            payload: Bytes::new(),
        }
    }

    /// Split `payload` into sequential Data packets of at most `chunk_size`
    /// bytes each. A payload that fits yields a single packet.
    pub fn chunked(stream_id: StreamId, payload: Bytes, chunk_size: usize) -> Chunks {
        Chunks {
            stream_id,
            remaining: payload,
            chunk_size: chunk_size.max(1),
            done: false,
        }
    }

    /// Encode packet to bytes. Only Data packets carry their payload.
    pub fn encode(&self) -> Bytes {
        let payload_len = match self.packet_type {
            PacketType::Data => self.payload.len(),
            PacketType::Disconnect => 0,
        };

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + payload_len);
        buf.put_slice(self.stream_id.as_bytes());
        buf.put_u8(0);
        buf.put_u32_le(self.packet_type as u32);
        if payload_len > 0 {
            buf.put(self.payload.clone());
        }

        buf.freeze()
    }

    /// Decode packet from one channel message
    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(ProtoError::TooShort(buf.len()));
        }

        let mut id = [0u8; STREAM_ID_LEN];
        buf.copy_to_slice(&mut id);
        // Terminator; its value is not checked.
        buf.advance(1);
        let stream_id = StreamId::from_bytes(id)?;
        let packet_type = PacketType::try_from(buf.get_u32_le())?;

        let payload = match packet_type {
            PacketType::Data => buf,
            PacketType::Disconnect => Bytes::new(),
        };

        Ok(Self {
            stream_id,
            packet_type,
            payload,
        })
    }
}

/// Iterator over the Data packets of a chunked payload
#[derive(Debug)]
pub struct Chunks {
    stream_id: StreamId,
    remaining: Bytes,
    chunk_size: usize,
    done: bool,
}

impl Iterator for Chunks {
    type Item = Packet;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let take = self.remaining.len().min(self.chunk_size);
        let chunk = self.remaining.split_to(take);
        if self.remaining.is_empty() {
            self.done = true;
        }

        Some(Packet::data(self.stream_id, chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_CHUNK_SIZE;

    fn id(s: &str) -> StreamId {
        s.parse().unwrap()
    }

    #[test]
    fn test_data_packet_layout() {
        let packet = Packet::data(id("AB12cd"), Bytes::from_static(b"hi"));
        let encoded = packet.encode();

        assert_eq!(encoded.len(), Packet::HEADER_SIZE + 2);
        assert_eq!(&encoded[..6], b"AB12cd");
        assert_eq!(encoded[6], 0);
        assert_eq!(&encoded[7..11], &[0, 0, 0, 0]);
        assert_eq!(&encoded[11..], b"hi");
    }

    #[test]
    fn test_disconnect_packet_has_no_payload() {
        let mut packet = Packet::disconnect(id("XY9Z01"));
        packet.payload = Bytes::from_static(b"ignored");
        let encoded = packet.encode();

        assert_eq!(encoded.len(), Packet::HEADER_SIZE);
        assert_eq!(&encoded[7..11], &[1, 0, 0, 0]);
    }

    #[test]
    fn test_encode_decode() {
        let payload = Bytes::from("hello world");
        let packet = Packet::data(id("Qw3rty"), payload.clone());

        let decoded = Packet::decode(packet.encode()).unwrap();

        assert_eq!(decoded.stream_id, id("Qw3rty"));
        assert_eq!(decoded.packet_type, PacketType::Data);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_decode_ignores_terminator_value() {
        let mut raw = b"AB12cdZ".to_vec();
        raw.extend_from_slice(&1u32.to_le_bytes());
        raw.extend_from_slice(b"trailing");

        let decoded = Packet::decode(Bytes::from(raw)).unwrap();
        assert_eq!(decoded.stream_id, id("AB12cd"));
        assert_eq!(decoded.packet_type, PacketType::Disconnect);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_decode_too_short() {
        let result = Packet::decode(Bytes::from_static(b"AB12cd\0\0\0\0"));
        assert!(matches!(result, Err(ProtoError::TooShort(10))));
    }

    #[test]
    fn test_decode_unknown_type() {
        let mut raw = b"AB12cd\0".to_vec();
        raw.extend_from_slice(&7u32.to_le_bytes());

        let result = Packet::decode(Bytes::from(raw));
        assert!(matches!(result, Err(ProtoError::UnknownPacketType(7))));
    }

    #[test]
    fn test_empty_data_packet() {
        let decoded = Packet::decode(Packet::data(id("000000"), Bytes::new()).encode()).unwrap();
        assert_eq!(decoded.packet_type, PacketType::Data);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_chunk_counts_and_reassembly() {
        for len in [
            1,
            DEFAULT_CHUNK_SIZE - 1,
            DEFAULT_CHUNK_SIZE,
            DEFAULT_CHUNK_SIZE + 1,
            3 * DEFAULT_CHUNK_SIZE,
            3 * DEFAULT_CHUNK_SIZE + 17,
            1024 * 1024,
        ] {
            let payload: Bytes = (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
            let packets: Vec<Packet> =
                Packet::chunked(id("AB12cd"), payload.clone(), DEFAULT_CHUNK_SIZE).collect();

            assert_eq!(packets.len(), len.div_ceil(DEFAULT_CHUNK_SIZE), "len {len}");
            assert!(packets.iter().all(|p| p.payload.len() <= DEFAULT_CHUNK_SIZE));
            assert!(packets.iter().all(|p| p.packet_type == PacketType::Data));

            let mut reassembled = BytesMut::new();
            for packet in &packets {
                reassembled.extend_from_slice(&packet.payload);
            }
            assert_eq!(reassembled.freeze(), payload);
        }
    }

    #[test]
    fn test_chunk_100_kib() {
        let payload = Bytes::from(vec![7u8; 100 * 1024]);
        let sizes: Vec<usize> = Packet::chunked(id("AB12cd"), payload, DEFAULT_CHUNK_SIZE)
            .map(|p| {
                assert_eq!(p.stream_id, id("AB12cd"));
                p.payload.len()
            })
            .collect();

        assert_eq!(sizes, vec![61440, 40960]);
    }

    #[test]
    fn test_chunk_empty_payload_yields_one_packet() {
        let packets: Vec<Packet> =
            Packet::chunked(id("AB12cd"), Bytes::new(), DEFAULT_CHUNK_SIZE).collect();
        assert_eq!(packets.len(), 1);
        assert!(packets[0].payload.is_empty());
    }
}
