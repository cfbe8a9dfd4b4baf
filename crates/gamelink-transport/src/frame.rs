//! Frames exchanged by [`crate::TcpChannel`] sessions
//!
//! Format: [length: u32][payload: bincode serialized frame]

use crate::channel::{PeerIdentity, TransportError};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelFrame {
    /// First frame of a connecting peer
    Hello {
        identity: PeerIdentity,
        virtual_port: u32,
    },
    /// Reply of the accepting peer
    HelloAck,
    Ping {
        timestamp_us: u64,
    },
    Pong {
        timestamp_us: u64,
    },
    /// Application message
    Message(Bytes),
    Close {
        reason: String,
    },
}

/// Length-delimited bincode codec for [`ChannelFrame`]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_SIZE)
                .new_codec(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = ChannelFrame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<ChannelFrame> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, item: ChannelFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&item)?;
        self.inner.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_incomplete() {
        let mut codec = FrameCodec::new();
        let mut encoded = BytesMut::new();
        codec
            .encode(ChannelFrame::Message(Bytes::from_static(&[1, 2, 3])), &mut encoded)
            .unwrap();

        // Only provide length header
        let mut buf = BytesMut::from(&encoded[..4]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        // Provide rest of frame
        buf.extend_from_slice(&encoded[4..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(ChannelFrame::Message(Bytes::from_static(&[1, 2, 3])))
        );
    }

    #[test]
    fn test_decode_multiple() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                ChannelFrame::Hello {
                    identity: PeerIdentity::new("guest"),
                    virtual_port: 2,
                },
                &mut buf,
            )
            .unwrap();
        codec.encode(ChannelFrame::HelloAck, &mut buf).unwrap();

        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(ChannelFrame::Hello { virtual_port: 2, .. })
        ));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(ChannelFrame::HelloAck));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_garbage() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 2, 0xff, 0xff][..]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
