//! gamelink: share a local TCP service with a peer over one reliable channel
//!
//! The host runs the real service (a game server on a local port); the guest
//! gets a local listening port whose connections are tunneled to that
//! service. All connections are multiplexed over a single peer-to-peer
//! [`Channel`].
//!
//! ```no_run
//! use gamelink_lib::{TunnelConfig, TunnelEngine};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TunnelConfig::builder().guest("203.0.113.7:27015").build()?;
//! let (engine, _channel, events) = TunnelEngine::with_tcp(config)?;
//! engine.run(events).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;

pub use config::{ConfigError, TunnelConfig, TunnelConfigBuilder, TunnelRole};
pub use engine::{TunnelEngine, TunnelError};

// Re-export building blocks
pub use gamelink_bridge::{AcceptMode, BridgeConfig, LocalListener, StreamAttach};
pub use gamelink_connection::{ChannelManager, LinkEvent, LinkPhase, LinkStats, Role};
pub use gamelink_mux::{MuxConfig, StreamHandle, StreamRegistry};
pub use gamelink_proto::{Packet, PacketType, StreamId, DEFAULT_CHUNK_SIZE};
pub use gamelink_transport::{
    Channel, ChannelEvent, ChannelEvents, CloseReason, PeerIdentity, TcpChannel,
    TcpChannelConfig,
};
