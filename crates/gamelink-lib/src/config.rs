//! Tunnel configuration

use gamelink_bridge::{AcceptMode, BridgeConfig, DEFAULT_LISTEN_PORT};
use gamelink_connection::{ManagerConfig, RetryConfig};
use gamelink_mux::MuxConfig;
use gamelink_proto::DEFAULT_CHUNK_SIZE;
use gamelink_transport::{PeerIdentity, TcpChannelConfig};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Largest accepted chunk size (1 MiB)
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("guest mode requires a peer to connect to")]
    MissingPeer,

    #[error("host mode requires a local target port")]
    MissingTargetPort,

    #[error("chunk size must be between 1 and 1048576, got {0}")]
    InvalidChunkSize(usize),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported config file extension: {0:?}")]
    UnsupportedFormat(String),
}

/// Which side of the tunnel this peer is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelRole {
    /// Owns the real service on `local_target_port`
    Host,
    /// Exposes `local_port` and forwards it to the host
    #[default]
    Guest,
}

/// Tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub role: TunnelRole,
    /// Identity announced to the remote peer
    pub identity: String,
    /// Channel listening address (host)
    pub listen_addr: SocketAddr,
    /// Peer to connect to (guest)
    pub peer: Option<String>,
    /// Address the guest's local listener binds to
    pub local_bind: IpAddr,
    /// Port the guest's local listener binds to
    pub local_port: u16,
    /// Port of the real service on the host
    pub local_target_port: Option<u16>,
    pub accept_mode: AcceptMode,
    /// Reconnection attempts before the guest gives up
    pub retry_budget: u32,
    pub chunk_size: usize,
    pub read_buffer_size: usize,
    pub notify_peer_on_local_close: bool,
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub dial_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub keepalive_interval: Duration,
    #[serde(with = "duration_millis")]
    pub ping_interval: Duration,
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Helper module for serializing Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        let mux = MuxConfig::default();
        Self {
            role: TunnelRole::Guest,
            identity: format!("gamelink-{}", uuid::Uuid::new_v4().simple()),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 27015)),
            peer: None,
            local_bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            local_port: DEFAULT_LISTEN_PORT,
            local_target_port: None,
            accept_mode: AcceptMode::Concurrent,
            retry_budget: RetryConfig::default().max_attempts,
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_buffer_size: mux.read_buffer_size,
            notify_peer_on_local_close: mux.notify_peer_on_local_close,
            connect_timeout: Duration::from_secs(10),
            dial_timeout: mux.dial_timeout,
            keepalive_interval: Duration::from_secs(5),
            ping_interval: Duration::from_secs(1),
        }
    }
}

impl TunnelConfig {
    pub fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::default()
    }

    /// Load a YAML (`.yaml`, `.yml`) or JSON (`.json`) config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        match extension.as_str() {
            "yaml" | "yml" => Ok(serde_yaml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.role {
            TunnelRole::Guest => {
                if self.peer.as_deref().map_or(true, str::is_empty) {
                    return Err(ConfigError::MissingPeer);
                }
            }
            TunnelRole::Host => {
                if self.local_target_port.is_none() {
                    return Err(ConfigError::MissingTargetPort);
                }
            }
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::InvalidChunkSize(self.chunk_size));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Zero("read_buffer_size"));
        }
        if self.keepalive_interval.is_zero() {
            return Err(ConfigError::Zero("keepalive_interval"));
        }
        if self.ping_interval.is_zero() {
            return Err(ConfigError::Zero("ping_interval"));
        }
        Ok(())
    }

    pub fn is_host(&self) -> bool {
        self.role == TunnelRole::Host
    }

    pub fn peer_identity(&self) -> Option<PeerIdentity> {
        self.peer.as_deref().map(PeerIdentity::new)
    }

    pub fn channel_config(&self) -> TcpChannelConfig {
        TcpChannelConfig {
            identity: PeerIdentity::new(self.identity.clone()),
            listen_addr: self.listen_addr,
            keepalive_interval: self.keepalive_interval,
            ..Default::default()
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            connect_timeout: self.connect_timeout,
            retry: RetryConfig {
                max_attempts: self.retry_budget,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn mux_config(&self) -> MuxConfig {
        MuxConfig {
            local_target_port: self.local_target_port,
            chunk_size: self.chunk_size,
            read_buffer_size: self.read_buffer_size,
            dial_timeout: self.dial_timeout,
            notify_peer_on_local_close: self.notify_peer_on_local_close,
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            listen_addr: SocketAddr::new(self.local_bind, self.local_port),
            accept_mode: self.accept_mode,
        }
    }
}

/// Builder for TunnelConfig
#[derive(Default)]
pub struct TunnelConfigBuilder {
    config: TunnelConfig,
}

impl TunnelConfigBuilder {
    /// Host the service listening on `local_target_port`
    pub fn host(mut self, local_target_port: u16) -> Self {
        self.config.role = TunnelRole::Host;
        self.config.local_target_port = Some(local_target_port);
        self
    }

    /// Join the host reachable as `peer`
    pub fn guest(mut self, peer: impl Into<String>) -> Self {
        self.config.role = TunnelRole::Guest;
        self.config.peer = Some(peer.into());
        self
    }

    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.config.identity = identity.into();
        self
    }

    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.config.listen_addr = addr;
        self
    }

    pub fn local_bind(mut self, addr: IpAddr) -> Self {
        self.config.local_bind = addr;
        self
    }

    pub fn local_port(mut self, port: u16) -> Self {
        self.config.local_port = port;
        self
    }

    pub fn accept_mode(mut self, mode: AcceptMode) -> Self {
        self.config.accept_mode = mode;
        self
    }

    pub fn retry_budget(mut self, attempts: u32) -> Self {
        self.config.retry_budget = attempts;
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    pub fn notify_peer_on_local_close(mut self, enabled: bool) -> Self {
        self.config.notify_peer_on_local_close = enabled;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.config.dial_timeout = timeout;
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = interval;
        self
    }

    pub fn build(self) -> Result<TunnelConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder_guest() {
        let config = TunnelConfig::builder()
            .guest("192.168.1.20:27015")
            .local_port(9000)
            .build()
            .unwrap();

        assert_eq!(config.role, TunnelRole::Guest);
        assert_eq!(config.peer_identity().unwrap().as_str(), "192.168.1.20:27015");
        assert_eq!(
            config.bridge_config().listen_addr,
            "127.0.0.1:9000".parse().unwrap()
        );
        assert_eq!(config.manager_config().retry.max_attempts, 3);
    }

    #[test]
    fn test_config_builder_host() {
        let config = TunnelConfig::builder().host(25565).build().unwrap();

        assert!(config.is_host());
        assert_eq!(config.mux_config().local_target_port, Some(25565));
        assert_eq!(config.mux_config().chunk_size, 61440);
    }

    #[test]
    fn test_config_builder_missing_peer() {
        let result = TunnelConfig::builder().build();
        assert!(matches!(result, Err(ConfigError::MissingPeer)));
    }

    #[test]
    fn test_config_builder_missing_target() {
        let mut config = TunnelConfig::default();
        config.role = TunnelRole::Host;
        assert!(matches!(config.validate(), Err(ConfigError::MissingTargetPort)));
    }

    #[test]
    fn test_config_builder_bad_chunk_size() {
        let result = TunnelConfig::builder().host(80).chunk_size(0).build();
        assert!(matches!(result, Err(ConfigError::InvalidChunkSize(0))));
    }

    #[test]
    fn test_config_yaml() {
        let yaml = r#"
role: host
local_target_port: 7777
retry_budget: 5
dial_timeout: 250
connect_timeout: 3
accept_mode: single
"#;
        let config: TunnelConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.role, TunnelRole::Host);
        assert_eq!(config.local_target_port, Some(7777));
        assert_eq!(config.retry_budget, 5);
        assert_eq!(config.dial_timeout, Duration::from_millis(250));
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.accept_mode, AcceptMode::Single);
        assert_eq!(config.local_port, 8888);
        config.validate().unwrap();
    }

    #[test]
    fn test_config_json_file() {
        let path = std::env::temp_dir().join(format!(
            "gamelink-config-{}.json",
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::write(&path, r#"{"role":"guest","peer":"10.0.0.1:27015","local_port":8000}"#)
            .unwrap();

        let config = TunnelConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.peer.as_deref(), Some("10.0.0.1:27015"));
        assert_eq!(config.local_port, 8000);
    }

    #[test]
    fn test_config_unsupported_extension() {
        let path = std::env::temp_dir().join(format!(
            "gamelink-config-{}.toml",
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::write(&path, "role = \"host\"").unwrap();

        let result = TunnelConfig::from_file(&path);
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(ext)) if ext == "toml"));
    }
}
