//! Stream multiplexer
//!
//! Many local TCP connections share one reliable ordered channel. Each
//! connection is tagged with a [`StreamId`](gamelink_proto::StreamId); its
//! bytes travel as [`Packet`](gamelink_proto::Packet)s through a
//! [`PacketSink`], and packets coming back are routed to the right socket by
//! [`StreamRegistry::handle_incoming`].
//!
//! On the host, the first Data packet for an unknown id opens a connection to
//! the local service and adopts the peer's id.

pub mod config;
pub mod registry;
pub mod sink;

pub use config::MuxConfig;
pub use registry::{MuxError, StreamHandle, StreamOrigin, StreamRegistry};
pub use sink::{PacketSink, PeerRole, StaticRole};
