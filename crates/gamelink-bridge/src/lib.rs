//! Guest-side local socket bridge
//!
//! [`LocalListener`] accepts the local application's TCP connections and
//! hands each one to a [`StreamAttach`] target, normally the stream registry
//! of the current link.

pub mod listener;

pub use listener::{
    AcceptMode, BridgeConfig, BridgeError, LocalListener, StreamAttach, DEFAULT_LISTEN_PORT,
};
