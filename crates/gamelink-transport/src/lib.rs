//! Channel abstraction for peer-to-peer tunnels
//!
//! A [`Channel`] is a reliable, ordered, message-oriented session between two
//! peers. Implementations own NAT traversal, relaying and encryption; the
//! tunnel only needs connect/accept, fire-and-forget sends, inbound messages
//! and liveness telemetry.
//!
//! Lifecycle changes and inbound messages are delivered as [`ChannelEvent`]s
//! on the receiver returned alongside the channel, mirroring the status-change
//! callbacks of P2P networking libraries.
//!
//! [`TcpChannel`] is a direct TCP implementation used by the CLI and tests.

pub mod channel;
pub mod frame;
pub mod tcp;

pub use channel::{
    Channel, ChannelEvent, ChannelEvents, CloseReason, PeerIdentity, RealtimeStatus,
    SendReliability, SessionHandle, TransportError, TransportResult,
};
pub use frame::{ChannelFrame, FrameCodec};
pub use tcp::{TcpChannel, TcpChannelConfig};
