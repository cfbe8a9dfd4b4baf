//! Channel trait and the types shared by all channel implementations

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Timeout")]
    Timeout,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Unknown session: {0}")]
    UnknownSession(SessionHandle),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Handle of one session on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(u64);

impl SessionHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a remote peer as understood by the channel implementation
/// (a network address for [`crate::TcpChannel`], an account id for overlay
/// networks)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerIdentity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PeerIdentity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Live telemetry of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RealtimeStatus {
    /// Most recent round-trip time sample
    pub rtt: Option<Duration>,
    /// Whether traffic goes through a relay instead of a direct path
    pub relayed: bool,
}

/// Delivery guarantee requested for one send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendReliability {
    Reliable,
    Unreliable,
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The remote peer closed the session
    ClosedByPeer,
    /// The local side hit an unrecoverable problem (connect failure, I/O error)
    ProblemDetectedLocally(String),
    /// The session was closed through [`Channel::close`]
    ClosedLocally,
}

impl CloseReason {
    pub fn is_self_initiated(&self) -> bool {
        matches!(self, CloseReason::ClosedLocally)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClosedByPeer => write!(f, "closed by peer"),
            CloseReason::ProblemDetectedLocally(detail) => {
                write!(f, "problem detected locally: {}", detail)
            }
            CloseReason::ClosedLocally => write!(f, "closed locally"),
        }
    }
}

/// Events pushed by a channel
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A remote peer wants to open a session; call [`Channel::accept`]
    Incoming {
        session: SessionHandle,
        peer: PeerIdentity,
        virtual_port: u32,
    },
    /// Handshake finished, the session can carry messages
    Connected {
        session: SessionHandle,
        peer: PeerIdentity,
    },
    /// One inbound message, in send order
    Message { session: SessionHandle, data: Bytes },
    /// The session ended
    Closed {
        session: SessionHandle,
        reason: CloseReason,
    },
}

pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// Reliable ordered peer-to-peer messaging service
#[async_trait]
pub trait Channel: Send + Sync {
    /// Open the listening endpoint so remote peers can connect
    async fn listen(&self) -> TransportResult<()>;

    /// Start connecting to `peer`. Returns immediately; completion is reported
    /// as [`ChannelEvent::Connected`] or [`ChannelEvent::Closed`].
    async fn connect(
        &self,
        peer: &PeerIdentity,
        virtual_port: u32,
        timeout: Duration,
    ) -> TransportResult<SessionHandle>;

    /// Accept a session announced by [`ChannelEvent::Incoming`]
    async fn accept(&self, session: SessionHandle) -> TransportResult<()>;

    /// Queue one message. Never waits for the network.
    fn send(
        &self,
        session: SessionHandle,
        data: Bytes,
        reliability: SendReliability,
    ) -> TransportResult<()>;

    /// Current telemetry for a session, `None` if the session is unknown
    fn realtime_status(&self, session: SessionHandle) -> Option<RealtimeStatus>;

    /// Close a session. No [`ChannelEvent::Closed`] is emitted for it.
    async fn close(&self, session: SessionHandle, reason: &str);

    /// Close the listening endpoint
    async fn close_listener(&self);
}
