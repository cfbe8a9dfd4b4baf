//! Seams between the registry and the link it rides on

use crate::registry::MuxError;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Destination of encoded packets, one channel message per packet
pub trait PacketSink: Send + Sync {
    fn send_packet(&self, packet: Bytes) -> Result<(), MuxError>;
}

impl PacketSink for mpsc::UnboundedSender<Bytes> {
    fn send_packet(&self, packet: Bytes) -> Result<(), MuxError> {
        self.send(packet).map_err(|_| MuxError::SinkClosed)
    }
}

/// Tells the registry whether the local peer hosts the real service
pub trait PeerRole: Send + Sync {
    fn is_host(&self) -> bool;
}

/// A role that never changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticRole {
    host: bool,
}

impl StaticRole {
    pub fn host() -> Self {
        Self { host: true }
    }

    pub fn guest() -> Self {
        Self { host: false }
    }
}

impl PeerRole for StaticRole {
    fn is_host(&self) -> bool {
        self.host
    }
}
