//! Channel lifecycle management
//!
//! [`ChannelManager`] owns the role (host or guest) of the local peer and the
//! state of its channel sessions. The host listens and accepts every incoming
//! session; the guest connects to one peer and reconnects automatically with
//! a fresh virtual port when the session drops, until the retry budget is
//! spent.

pub mod manager;
pub mod retry;

pub use manager::{
    ChannelManager, ConnectionError, LinkEvent, LinkPhase, LinkStats, ManagerConfig, Role,
};
pub use retry::{RetryAttempt, RetryBudget, RetryConfig, RetryError};
