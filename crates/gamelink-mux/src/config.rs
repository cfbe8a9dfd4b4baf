use gamelink_proto::DEFAULT_CHUNK_SIZE;
use std::time::Duration;

/// Read buffer of each stream's read pump (1 MiB)
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Multiplexer configuration
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Local port dialed on `127.0.0.1` when the host sees an unknown stream
    pub local_target_port: Option<u16>,
    /// Largest Data payload per packet
    pub chunk_size: usize,
    pub read_buffer_size: usize,
    /// Bound on the lazy dial to the local target
    pub dial_timeout: Duration,
    /// Send Disconnect when a local socket hits EOF or fails
    pub notify_peer_on_local_close: bool,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            local_target_port: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            dial_timeout: Duration::from_secs(5),
            notify_peer_on_local_close: true,
        }
    }
}

impl MuxConfig {
    pub fn with_local_target_port(mut self, port: u16) -> Self {
        self.local_target_port = Some(port);
        self
    }
}
