//! Channel lifecycle manager

use crate::retry::{RetryBudget, RetryConfig, RetryError};
use bytes::Bytes;
use gamelink_transport::{
    Channel, ChannelEvent, ChannelEvents, CloseReason, PeerIdentity, SendReliability,
    SessionHandle, TransportError,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Connection manager errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Already running as {0}")]
    RoleConflict(Role),

    #[error("Not connected")]
    NotConnected,

    #[error("Manager has been shut down")]
    Shutdown,
}

/// Role of the local peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Owns the real local service and accepts sessions
    Host,
    /// Connects to a host and exposes a local listening port
    Guest,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => write!(f, "host"),
            Role::Guest => write!(f, "guest"),
        }
    }
}

/// Link phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    Idle,
    /// Listening (host) or connecting (guest)
    Connecting,
    Connected,
    Closed,
}

/// Snapshot of link quality
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub rtt: Option<Duration>,
    pub relayed: bool,
}

/// Events emitted by the manager for the tunnel engine
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A session became usable
    SessionOpened {
        session: SessionHandle,
        peer: PeerIdentity,
    },
    /// A usable session ended
    SessionClosed {
        session: SessionHandle,
        reason: CloseReason,
    },
    /// Inbound message on an open session
    Message { session: SessionHandle, data: Bytes },
    /// Guest link dropped and a new connection attempt is starting
    Reconnecting { attempt: u32, virtual_port: u32 },
    /// Guest retry budget is spent; the link is gone for good
    Disconnected { reason: CloseReason },
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Timeout handed to the channel for each connect
    pub connect_timeout: Duration,
    /// Virtual port of the first guest connection
    pub initial_virtual_port: u32,
    pub retry: RetryConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            initial_virtual_port: 0,
            retry: RetryConfig::default(),
        }
    }
}

struct LinkState {
    role: Option<Role>,
    phase: LinkPhase,
    /// Sessions that completed the handshake, with their peers
    active: HashMap<SessionHandle, PeerIdentity>,
    /// Guest: the session carrying the link
    primary: Option<SessionHandle>,
    /// Guest: the session currently connecting
    pending: Option<SessionHandle>,
    /// Guest: the peer to (re)connect to
    peer: Option<PeerIdentity>,
    listening: bool,
    last_stats: Option<LinkStats>,
    retry: RetryBudget,
}

/// Drives one peer's channel: accept, connect, retry and ping sampling
pub struct ChannelManager {
    channel: Arc<dyn Channel>,
    config: ManagerConfig,
    state: Mutex<LinkState>,
    events: mpsc::UnboundedSender<LinkEvent>,
    shutdown: CancellationToken,
}

impl ChannelManager {
    pub fn new(
        channel: Arc<dyn Channel>,
        config: ManagerConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let state = LinkState {
            role: None,
            phase: LinkPhase::Idle,
            active: HashMap::new(),
            primary: None,
            pending: None,
            peer: None,
            listening: false,
            last_stats: None,
            retry: RetryBudget::new(config.retry.clone(), config.initial_virtual_port),
        };

        let manager = Arc::new(Self {
            channel,
            config,
            state: Mutex::new(state),
            events,
            shutdown: CancellationToken::new(),
        });
        (manager, events_rx)
    }

    fn state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    fn claim_role(&self, role: Role) -> Result<(), ConnectionError> {
        if self.shutdown.is_cancelled() {
            return Err(ConnectionError::Shutdown);
        }
        let mut state = self.state();
        match state.role {
            Some(current) if current != role => Err(ConnectionError::RoleConflict(current)),
            _ => {
                state.role = Some(role);
                state.phase = LinkPhase::Connecting;
                Ok(())
            }
        }
    }

    /// Start hosting: open the listening endpoint and accept every session
    pub async fn host(&self) -> Result<(), ConnectionError> {
        self.claim_role(Role::Host)?;
        self.channel.listen().await?;
        self.state().listening = true;
        info!("Hosting, waiting for peers");
        Ok(())
    }

    /// Connect to a host as guest. Completion is reported as
    /// [`LinkEvent::SessionOpened`]; failures go through the retry budget.
    pub async fn connect(&self, peer: PeerIdentity) -> Result<SessionHandle, ConnectionError> {
        self.claim_role(Role::Guest)?;
        let virtual_port = {
            let mut state = self.state();
            state.peer = Some(peer.clone());
            state.retry.virtual_port()
        };

        info!(peer = %peer, virtual_port, "Connecting to host");
        let session = self
            .channel
            .connect(&peer, virtual_port, self.config.connect_timeout)
            .await?;
        self.state().pending = Some(session);
        Ok(session)
    }

    /// Consume channel events until the channel or the manager shuts down
    pub async fn run(&self, mut events: ChannelEvents) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(event) => self.handle_event(event).await,
                None => {
                    debug!("Channel event stream ended");
                    break;
                }
            }
        }
    }

    /// Apply one channel event to the link state
    pub async fn handle_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Incoming {
                session,
                peer,
                virtual_port,
            } => self.on_incoming(session, peer, virtual_port).await,
            ChannelEvent::Connected { session, peer } => self.on_connected(session, peer).await,
            ChannelEvent::Message { session, data } => {
                if self.state().active.contains_key(&session) {
                    self.emit(LinkEvent::Message { session, data });
                } else {
                    trace!(session = %session, "Dropping message for inactive session");
                }
            }
            ChannelEvent::Closed { session, reason } => self.on_closed(session, reason).await,
        }
    }

    async fn on_incoming(&self, session: SessionHandle, peer: PeerIdentity, virtual_port: u32) {
        let hosting = {
            let state = self.state();
            state.role == Some(Role::Host) && state.listening
        } && !self.shutdown.is_cancelled();

        if !hosting {
            debug!(session = %session, peer = %peer, "Rejecting session, not hosting");
            self.channel.close(session, "not hosting").await;
            return;
        }

        info!(session = %session, peer = %peer, virtual_port, "Accepting session");
        if let Err(e) = self.channel.accept(session).await {
            warn!(session = %session, "Failed to accept session: {}", e);
        }
    }

    async fn on_connected(&self, session: SessionHandle, peer: PeerIdentity) {
        if self.shutdown.is_cancelled() {
            self.channel.close(session, "shutting down").await;
            return;
        }

        let stale = {
            let mut state = self.state();
            let stale = state.role == Some(Role::Guest)
                && state.pending.is_some_and(|pending| pending != session);
            if !stale {
                if state.role == Some(Role::Guest) {
                    state.pending = None;
                    state.primary = Some(session);
                    state.retry.reset();
                }
                state.active.insert(session, peer.clone());
                state.phase = LinkPhase::Connected;
            }
            stale
        };

        if stale {
            debug!(session = %session, "Closing stale session");
            self.channel.close(session, "stale session").await;
            return;
        }

        info!(session = %session, peer = %peer, "Session connected");
        self.emit(LinkEvent::SessionOpened { session, peer });
    }

    async fn on_closed(&self, session: SessionHandle, reason: CloseReason) {
        let (was_active, should_retry) = {
            let mut state = self.state();
            let was_active = state.active.remove(&session).is_some();

            match state.role {
                Some(Role::Guest) => {
                    let current = state.primary == Some(session)
                        || state.pending == Some(session)
                        || (state.pending.is_none() && state.primary.is_none());
                    if !current {
                        trace!(session = %session, "Ignoring close of stale session");
                        return;
                    }
                    state.primary = None;
                    state.pending = None;
                    state.last_stats = None;
                    let self_initiated =
                        reason.is_self_initiated() || self.shutdown.is_cancelled();
                    state.phase = if self_initiated {
                        LinkPhase::Closed
                    } else {
                        LinkPhase::Connecting
                    };
                    (was_active, !self_initiated)
                }
                _ => {
                    if state.active.is_empty() {
                        state.last_stats = None;
                        if state.phase == LinkPhase::Connected {
                            state.phase = LinkPhase::Connecting;
                        }
                    }
                    (was_active, false)
                }
            }
        };

        if was_active {
            info!(session = %session, reason = %reason, "Session closed");
            self.emit(LinkEvent::SessionClosed {
                session,
                reason: reason.clone(),
            });
        } else {
            debug!(session = %session, reason = %reason, "Connection attempt ended");
        }

        if should_retry {
            self.reconnect(reason).await;
        }
    }

    /// Guest reconnection loop, bounded by the retry budget
    async fn reconnect(&self, mut reason: CloseReason) {
        loop {
            let granted = {
                let mut state = self.state();
                let Some(peer) = state.peer.clone() else {
                    state.phase = LinkPhase::Closed;
                    return;
                };
                state.retry.next_attempt().map(|attempt| (attempt, peer))
            };

            let (attempt, peer) = match granted {
                Ok(granted) => granted,
                Err(RetryError::Exhausted(attempts)) => {
                    self.state().phase = LinkPhase::Closed;
                    warn!(
                        "Link lost after {} reconnection attempts: {}",
                        attempts, reason
                    );
                    self.emit(LinkEvent::Disconnected { reason });
                    return;
                }
            };

            info!(
                peer = %peer,
                attempt = attempt.attempt,
                virtual_port = attempt.virtual_port,
                "Reconnecting"
            );
            self.emit(LinkEvent::Reconnecting {
                attempt: attempt.attempt,
                virtual_port: attempt.virtual_port,
            });

            if !attempt.backoff.is_zero() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(attempt.backoff) => {}
                }
            }

            match self
                .channel
                .connect(&peer, attempt.virtual_port, self.config.connect_timeout)
                .await
            {
                Ok(session) => {
                    self.state().pending = Some(session);
                    return;
                }
                Err(e) => {
                    warn!("Reconnection attempt {} failed: {}", attempt.attempt, e);
                    reason = CloseReason::ProblemDetectedLocally(e.to_string());
                }
            }
        }
    }

    /// Close every session and the listener. Safe to call more than once.
    pub async fn disconnect(&self) {
        self.shutdown.cancel();

        let (sessions, listening) = {
            let mut state = self.state();
            let mut sessions: Vec<SessionHandle> = state.active.drain().map(|(s, _)| s).collect();
            sessions.extend(state.pending.take());
            state.primary = None;
            state.last_stats = None;
            state.phase = LinkPhase::Closed;
            (sessions, std::mem::take(&mut state.listening))
        };

        for session in sessions {
            self.channel.close(session, "disconnect").await;
            self.emit(LinkEvent::SessionClosed {
                session,
                reason: CloseReason::ClosedLocally,
            });
        }

        if listening {
            self.channel.close_listener().await;
        }
        debug!("Channel manager disconnected");
    }

    /// Query link quality of the primary session (guest) or the first
    /// connected session (host)
    pub fn sample_ping(&self) -> Option<LinkStats> {
        let session = {
            let state = self.state();
            state.primary.or_else(|| state.active.keys().min().copied())?
        };
        self.sample_session(session)
    }

    /// Query link quality of one session
    pub fn sample_session(&self, session: SessionHandle) -> Option<LinkStats> {
        let status = self.channel.realtime_status(session)?;
        let stats = LinkStats {
            rtt: status.rtt,
            relayed: status.relayed,
        };
        self.state().last_stats = Some(stats);
        Some(stats)
    }

    /// Sample link quality every `interval` until the manager shuts down
    pub fn spawn_ping_sampler(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if let Some(stats) = manager.sample_ping() {
                    debug!(rtt = ?stats.rtt, relayed = stats.relayed, "Link quality");
                }
            }
        })
    }

    /// Send one message on a session
    pub fn send(&self, session: SessionHandle, data: Bytes) -> Result<(), ConnectionError> {
        if !self.state().active.contains_key(&session) {
            return Err(ConnectionError::NotConnected);
        }
        self.channel
            .send(session, data, SendReliability::Reliable)
            .map_err(ConnectionError::from)
    }

    pub fn is_host(&self) -> bool {
        self.state().role == Some(Role::Host)
    }

    pub fn is_connected(&self) -> bool {
        let state = self.state();
        state.phase == LinkPhase::Connected && !state.active.is_empty()
    }

    pub fn role(&self) -> Option<Role> {
        self.state().role
    }

    pub fn phase(&self) -> LinkPhase {
        self.state().phase
    }

    pub fn retries_used(&self) -> u32 {
        self.state().retry.attempt()
    }

    pub fn virtual_port(&self) -> u32 {
        self.state().retry.virtual_port()
    }

    pub fn active_sessions(&self) -> Vec<SessionHandle> {
        let mut sessions: Vec<SessionHandle> = self.state().active.keys().copied().collect();
        sessions.sort();
        sessions
    }

    /// Primary guest session, if connected
    pub fn primary_session(&self) -> Option<SessionHandle> {
        self.state().primary
    }

    pub fn last_stats(&self) -> Option<LinkStats> {
        self.state().last_stats
    }
}
