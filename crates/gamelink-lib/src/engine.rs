//! Tunnel engine: wires the channel manager to per-session stream registries

use crate::config::{ConfigError, TunnelConfig};
use bytes::Bytes;
use gamelink_bridge::{BridgeError, LocalListener, StreamAttach};
use gamelink_connection::{ChannelManager, ConnectionError, LinkEvent, LinkStats};
use gamelink_mux::{MuxError, PacketSink, PeerRole, StreamHandle, StreamRegistry};
use gamelink_transport::{Channel, ChannelEvents, SessionHandle, TcpChannel};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Tunnel errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Local listener error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Link to peer lost: {0}")]
    LinkLost(String),

    #[error("Tunnel already running")]
    AlreadyRunning,
}

/// Sends packets of one registry on its channel session
struct SessionSink {
    manager: Arc<ChannelManager>,
    session: SessionHandle,
}

impl PacketSink for SessionSink {
    fn send_packet(&self, packet: Bytes) -> Result<(), MuxError> {
        self.manager
            .send(self.session, packet)
            .map_err(|_| MuxError::SinkClosed)
    }
}

struct ManagerRole(Arc<ChannelManager>);

impl PeerRole for ManagerRole {
    fn is_host(&self) -> bool {
        self.0.is_host()
    }
}

/// Stream registry of one session and the task feeding it inbound packets
struct SessionRoute {
    registry: Arc<StreamRegistry>,
    inbox: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
    dispatch: JoinHandle<()>,
}

impl SessionRoute {
    fn open(registry: Arc<StreamRegistry>, session: SessionHandle) -> Self {
        let (inbox, packets) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let dispatch = tokio::spawn(dispatch_packets(
            registry.clone(),
            session,
            packets,
            cancel.clone(),
        ));
        Self {
            registry,
            inbox,
            cancel,
            dispatch,
        }
    }

    /// Stop dispatching and close every stream of the session
    async fn close(self) {
        self.cancel.cancel();
        drop(self.inbox);
        if self.dispatch.await.is_err() {
            // Dispatch panicked before tearing down
            self.registry.teardown();
        }
    }
}

/// Feed packets of one session to its registry in arrival order, then tear
/// the registry down. A pending lazy dial only holds up its own session.
async fn dispatch_packets(
    registry: Arc<StreamRegistry>,
    session: SessionHandle,
    mut packets: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            packet = packets.recv() => packet,
        };
        let Some(packet) = packet else {
            break;
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = registry.handle_incoming(packet) => {}
        }
    }

    registry.teardown();
    trace!(session = %session, "Session dispatch stopped");
}

/// One end of a tunnel
///
/// The host keeps one stream registry per connected guest; the guest has a
/// single registry bound to its current session, rebuilt after reconnects.
pub struct TunnelEngine {
    config: TunnelConfig,
    manager: Arc<ChannelManager>,
    role: Arc<dyn PeerRole>,
    routes: Mutex<HashMap<SessionHandle, SessionRoute>>,
    link_events: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
    bridge_addr: Mutex<Option<SocketAddr>>,
    shutdown: CancellationToken,
}

impl TunnelEngine {
    pub fn new(config: TunnelConfig, channel: Arc<dyn Channel>) -> Result<Arc<Self>, TunnelError> {
        config.validate()?;

        let (manager, link_events) = ChannelManager::new(channel, config.manager_config());
        Ok(Arc::new(Self {
            role: Arc::new(ManagerRole(manager.clone())),
            config,
            manager,
            routes: Mutex::new(HashMap::new()),
            link_events: Mutex::new(Some(link_events)),
            bridge_addr: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Build an engine on a direct [`TcpChannel`]
    pub fn with_tcp(
        config: TunnelConfig,
    ) -> Result<(Arc<Self>, Arc<TcpChannel>, ChannelEvents), TunnelError> {
        let (channel, events) = TcpChannel::new(config.channel_config());
        let engine = Self::new(config, channel.clone())?;
        Ok((engine, channel, events))
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<SessionHandle, SessionRoute>> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run the tunnel until [`Self::shutdown`] or until the guest link is lost
    pub async fn run(self: &Arc<Self>, channel_events: ChannelEvents) -> Result<(), TunnelError> {
        let mut link_events = self
            .link_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(TunnelError::AlreadyRunning)?;

        let manager_task = {
            let manager = self.manager.clone();
            tokio::spawn(async move { manager.run(channel_events).await })
        };
        let sampler = self.manager.spawn_ping_sampler(self.config.ping_interval);

        let result = self.start_and_drive(&mut link_events).await;

        self.teardown_all().await;
        self.manager.disconnect().await;
        sampler.abort();
        manager_task.abort();

        match &result {
            Ok(()) => info!("Tunnel stopped"),
            Err(e) => warn!("Tunnel stopped: {}", e),
        }
        result
    }

    async fn start_and_drive(
        self: &Arc<Self>,
        link_events: &mut mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Result<(), TunnelError> {
        let listener = if self.config.is_host() {
            self.manager.host().await?;
            None
        } else {
            let listener = Arc::new(LocalListener::bind(self.config.bridge_config()).await?);
            *self.bridge_addr.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(listener.local_addr());

            let peer = self
                .config
                .peer_identity()
                .ok_or(ConfigError::MissingPeer)?;
            self.manager.connect(peer).await?;

            let target: Arc<dyn StreamAttach> = self.clone();
            let accept_loop = listener.clone();
            tokio::spawn(async move { accept_loop.run(target).await });
            Some(listener)
        };

        let result = self.drive(link_events).await;
        if let Some(listener) = listener {
            listener.shutdown();
        }
        result
    }

    async fn drive(
        &self,
        link_events: &mut mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Result<(), TunnelError> {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                event = link_events.recv() => event,
            };

            let Some(event) = event else {
                return Ok(());
            };

            match event {
                LinkEvent::SessionOpened { session, peer } => {
                    let sink = Arc::new(SessionSink {
                        manager: self.manager.clone(),
                        session,
                    });
                    let registry =
                        StreamRegistry::new(self.config.mux_config(), self.role.clone(), sink);
                    let replaced = self
                        .routes()
                        .insert(session, SessionRoute::open(registry, session));
                    if let Some(stale) = replaced {
                        stale.close().await;
                    }
                    info!(session = %session, peer = %peer, "Tunnel session ready");
                }
                LinkEvent::SessionClosed { session, reason } => {
                    let route = self.routes().remove(&session);
                    if let Some(route) = route {
                        route.close().await;
                        info!(session = %session, reason = %reason, "Tunnel session closed");
                    }
                }
                LinkEvent::Message { session, data } => {
                    let routes = self.routes();
                    match routes.get(&session) {
                        Some(route) => {
                            if route.inbox.send(data).is_err() {
                                debug!(session = %session, "Session dispatch already stopped");
                            }
                        }
                        None => debug!(session = %session, "Message for unknown session"),
                    }
                }
                LinkEvent::Reconnecting {
                    attempt,
                    virtual_port,
                } => {
                    info!(attempt, virtual_port, "Link dropped, reconnecting");
                }
                LinkEvent::Disconnected { reason } => {
                    return Err(TunnelError::LinkLost(reason.to_string()));
                }
            }
        }
    }

    async fn teardown_all(&self) {
        let routes: Vec<SessionRoute> = self.routes().drain().map(|(_, route)| route).collect();
        for route in routes {
            route.close().await;
        }
    }

    /// Stop the tunnel
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<ChannelManager> {
        &self.manager
    }

    /// Address of the guest's local listener once bound
    pub fn bridge_addr(&self) -> Option<SocketAddr> {
        *self.bridge_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    /// Number of sessions with a live stream registry
    pub fn session_count(&self) -> usize {
        self.routes().len()
    }

    /// Number of open streams across all sessions
    pub fn stream_count(&self) -> usize {
        self.routes()
            .values()
            .map(|route| route.registry.stream_count())
            .sum()
    }

    /// Link quality as last sampled by the ping sampler; reset when the
    /// link drops
    pub fn link_stats(&self) -> Option<LinkStats> {
        self.manager.last_stats()
    }
}

impl StreamAttach for TunnelEngine {
    fn attach(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Option<StreamHandle> {
        let registry = {
            let session = self.manager.primary_session()?;
            self.routes()
                .get(&session)
                .map(|route| route.registry.clone())
        };

        match registry {
            Some(registry) => {
                let handle = registry.attach_local_stream(stream);
                debug!(stream_id = %handle.id(), peer_addr = %addr, "Local connection tunneled");
                Some(handle)
            }
            None => {
                debug!(peer_addr = %addr, "No session for local connection");
                None
            }
        }
    }
}
