//! Local TCP listener feeding the multiplexer

use gamelink_mux::{StreamHandle, StreamRegistry};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default guest listening port
pub const DEFAULT_LISTEN_PORT: u16 = 8888;

/// Bridge errors
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How accepted connections are handed over
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceptMode {
    /// Every accepted connection is attached immediately
    #[default]
    Concurrent,
    /// One connection at a time; accepting resumes when it closes
    Single,
}

/// Local listener configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub listen_addr: SocketAddr,
    pub accept_mode: AcceptMode,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_LISTEN_PORT)),
            accept_mode: AcceptMode::Concurrent,
        }
    }
}

/// Receives accepted local connections
pub trait StreamAttach: Send + Sync {
    /// Take ownership of `stream`. `None` means it was refused and dropped.
    fn attach(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Option<StreamHandle>;
}

impl StreamAttach for StreamRegistry {
    fn attach(self: Arc<Self>, stream: TcpStream, _addr: SocketAddr) -> Option<StreamHandle> {
        Some(self.attach_local_stream(stream))
    }
}

/// Accept loop for the guest's local port
pub struct LocalListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    accept_mode: AcceptMode,
    shutdown: CancellationToken,
}

impl LocalListener {
    pub async fn bind(config: BridgeConfig) -> Result<Self, BridgeError> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|source| BridgeError::Bind {
                addr: config.listen_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!(
            local_addr = %local_addr,
            accept_mode = ?config.accept_mode,
            "Local TCP listener started"
        );

        Ok(Self {
            listener,
            local_addr,
            accept_mode: config.accept_mode,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the accept loop
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until [`Self::shutdown`] is called
    pub async fn run(&self, target: Arc<dyn StreamAttach>) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(local_addr = %self.local_addr, "Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer_addr = %addr, "Failed to set TCP_NODELAY: {}", e);
            }
            debug!(peer_addr = %addr, "Accepted local connection");

            let Some(handle) = target.clone().attach(stream, addr) else {
                warn!(peer_addr = %addr, "Local connection refused, link not ready");
                continue;
            };

            if self.accept_mode == AcceptMode::Single {
                debug!(stream_id = %handle.id(), "Waiting for stream to close before accepting again");
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = handle.closed() => {
                        debug!(
                            stream_id = %handle.id(),
                            peer_addr = ?handle.peer_addr(),
                            duration_ms = handle.age().as_millis() as u64,
                            "Stream closed, accepting again"
                        );
                    }
                }
            }
        }

        debug!(local_addr = %self.local_addr, "Local listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use gamelink_mux::{MuxConfig, StaticRole};
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    fn registry() -> (Arc<StreamRegistry>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            StreamRegistry::new(MuxConfig::default(), Arc::new(StaticRole::guest()), Arc::new(tx)),
            rx,
        )
    }

    async fn start(
        mode: AcceptMode,
        target: Arc<dyn StreamAttach>,
    ) -> (Arc<LocalListener>, tokio::task::JoinHandle<()>) {
        let listener = Arc::new(
            LocalListener::bind(BridgeConfig {
                listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
                accept_mode: mode,
            })
            .await
            .unwrap(),
        );
        let task = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.run(target).await })
        };
        (listener, task)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_concurrent_mode_attaches_every_connection() {
        let (registry, _rx) = registry();
        let (listener, task) = start(AcceptMode::Concurrent, registry.clone()).await;

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(TcpStream::connect(listener.local_addr()).await.unwrap());
        }
        wait_for(|| registry.stream_count() == 3).await;

        listener.shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_single_mode_serializes_connections() {
        let (registry, _rx) = registry();
        let (listener, _task) = start(AcceptMode::Single, registry.clone()).await;

        let first = TcpStream::connect(listener.local_addr()).await.unwrap();
        wait_for(|| registry.stream_count() == 1).await;
        let first_id = registry.stream_ids()[0];

        let _second = TcpStream::connect(listener.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(registry.stream_ids(), vec![first_id]);

        drop(first);
        wait_for(|| {
            let ids = registry.stream_ids();
            ids.len() == 1 && ids[0] != first_id
        })
        .await;

        listener.shutdown();
    }

    struct Refuse;

    impl StreamAttach for Refuse {
        fn attach(self: Arc<Self>, _stream: TcpStream, _addr: SocketAddr) -> Option<StreamHandle> {
            None
        }
    }

    #[tokio::test]
    async fn test_refused_connection_is_closed() {
        let (listener, _task) = start(AcceptMode::Single, Arc::new(Refuse)).await;

        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        listener.shutdown();
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let result = LocalListener::bind(BridgeConfig {
            listen_addr: taken.local_addr().unwrap(),
            accept_mode: AcceptMode::Concurrent,
        })
        .await;
        assert!(matches!(result, Err(BridgeError::Bind { .. })));
    }
}
