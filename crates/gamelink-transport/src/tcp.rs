//! Direct TCP implementation of [`Channel`]
//!
//! Every session is one TCP connection carrying [`ChannelFrame`]s. The
//! connecting side opens with `Hello`, the listening side announces the
//! session as [`ChannelEvent::Incoming`] and answers `HelloAck` once the
//! session is accepted. Keepalive pings feed the RTT reported by
//! [`Channel::realtime_status`].
//!
//! Each session has a reader task and a writer task, so a peer that is busy
//! writing never stops draining its socket. Frames produced by the reader
//! (pongs) go through the writer's control queue.

use crate::channel::{
    Channel, ChannelEvent, ChannelEvents, CloseReason, PeerIdentity, RealtimeStatus,
    SendReliability, SessionHandle, TransportError, TransportResult,
};
use crate::frame::{ChannelFrame, FrameCodec};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

type FramedStream = Framed<TcpStream, FrameCodec>;
type FrameSink = SplitSink<FramedStream, ChannelFrame>;
type FrameSource = SplitStream<FramedStream>;

/// TCP channel configuration
#[derive(Debug, Clone)]
pub struct TcpChannelConfig {
    /// Identity announced to the remote side in `Hello`
    pub identity: PeerIdentity,
    /// Address bound by [`Channel::listen`]
    pub listen_addr: SocketAddr,
    /// Interval between keepalive pings
    pub keepalive_interval: Duration,
    /// Time allowed for a connecting peer to send `Hello`, also bounds the
    /// flush of a locally closed session
    pub handshake_timeout: Duration,
    /// Queued messages above which [`SendReliability::Unreliable`] sends are
    /// dropped
    pub unreliable_backlog: usize,
}

impl Default for TcpChannelConfig {
    fn default() -> Self {
        Self {
            identity: PeerIdentity::new("gamelink"),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            keepalive_interval: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            unreliable_backlog: 64,
        }
    }
}

struct SessionSlot {
    outbound: mpsc::UnboundedSender<ChannelFrame>,
    /// Messages queued on `outbound` and not yet taken by the writer
    backlog: Arc<AtomicUsize>,
    status: RealtimeStatus,
    cancel: CancellationToken,
    /// Released by [`Channel::accept`] for sessions announced as Incoming
    accept_gate: Option<oneshot::Sender<()>>,
}

/// Receiving end of a session's outbound queue
struct OutboundQueue {
    frames: mpsc::UnboundedReceiver<ChannelFrame>,
    backlog: Arc<AtomicUsize>,
}

impl OutboundQueue {
    fn taken(&self, frame: &ChannelFrame) {
        if matches!(frame, ChannelFrame::Message(_)) {
            self.backlog.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

struct ListenerState {
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

struct Shared {
    config: TcpChannelConfig,
    events: mpsc::UnboundedSender<ChannelEvent>,
    sessions: Mutex<HashMap<SessionHandle, SessionSlot>>,
    next_session: AtomicU64,
}

impl Shared {
    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionHandle, SessionSlot>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ChannelEvent) {
        // Receiver gone means nobody is interested anymore
        let _ = self.events.send(event);
    }

    fn open_slot(
        &self,
        accept_gate: Option<oneshot::Sender<()>>,
    ) -> (SessionHandle, OutboundQueue, CancellationToken) {
        let session = SessionHandle::new(self.next_session.fetch_add(1, Ordering::Relaxed));
        let (outbound, frames) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        self.sessions().insert(
            session,
            SessionSlot {
                outbound,
                backlog: backlog.clone(),
                status: RealtimeStatus::default(),
                cancel: cancel.clone(),
                accept_gate,
            },
        );

        (session, OutboundQueue { frames, backlog }, cancel)
    }

    /// Remove the session and report it closed, unless it was already closed
    /// locally
    fn finish(&self, session: SessionHandle, reason: CloseReason) {
        if self.sessions().remove(&session).is_some() {
            debug!(session = %session, reason = %reason, "Session ended");
            self.emit(ChannelEvent::Closed { session, reason });
        }
    }

    fn record_rtt(&self, session: SessionHandle, rtt: Duration) {
        if let Some(slot) = self.sessions().get_mut(&session) {
            slot.status.rtt = Some(rtt);
        }
    }
}

/// [`Channel`] over plain TCP connections
pub struct TcpChannel {
    shared: Arc<Shared>,
    listener: Mutex<Option<ListenerState>>,
}

impl TcpChannel {
    pub fn new(config: TcpChannelConfig) -> (Arc<Self>, ChannelEvents) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            shared: Arc::new(Shared {
                config,
                events,
                sessions: Mutex::new(HashMap::new()),
                next_session: AtomicU64::new(1),
            }),
            listener: Mutex::new(None),
        });
        (channel, events_rx)
    }

    /// Address of the listening endpoint, once [`Channel::listen`] succeeded
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|state| state.local_addr)
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions().len()
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn listen(&self) -> TransportResult<()> {
        if self.local_addr().is_some() {
            return Ok(());
        }

        let listener = TcpListener::bind(self.shared.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        info!("Channel listening on {}", local_addr);

        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(ListenerState {
            local_addr,
            cancel: cancel.clone(),
        });

        tokio::spawn(accept_loop(self.shared.clone(), listener, cancel));
        Ok(())
    }

    async fn connect(
        &self,
        peer: &PeerIdentity,
        virtual_port: u32,
        timeout: Duration,
    ) -> TransportResult<SessionHandle> {
        let (session, outbound, cancel) = self.shared.open_slot(None);
        debug!(session = %session, peer = %peer, virtual_port, "Connecting");

        let shared = self.shared.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            let handshake = tokio::select! {
                _ = cancel.cancelled() => return,
                result = tokio::time::timeout(timeout, dial(&shared, &peer, virtual_port)) => result,
            };

            let framed = match handshake {
                Ok(Ok(framed)) => framed,
                Ok(Err(e)) => {
                    warn!(session = %session, peer = %peer, "Connect failed: {}", e);
                    shared.finish(session, CloseReason::ProblemDetectedLocally(e.to_string()));
                    return;
                }
                Err(_) => {
                    warn!(session = %session, peer = %peer, "Connect timed out after {:?}", timeout);
                    shared.finish(
                        session,
                        CloseReason::ProblemDetectedLocally(TransportError::Timeout.to_string()),
                    );
                    return;
                }
            };

            info!(session = %session, peer = %peer, "Session connected");
            shared.emit(ChannelEvent::Connected {
                session,
                peer: peer.clone(),
            });
            run_session(shared, session, framed, outbound, cancel).await;
        });

        Ok(session)
    }

    async fn accept(&self, session: SessionHandle) -> TransportResult<()> {
        let gate = {
            let mut sessions = self.shared.sessions();
            let slot = sessions
                .get_mut(&session)
                .ok_or(TransportError::UnknownSession(session))?;
            slot.accept_gate.take()
        };

        if let Some(gate) = gate {
            gate.send(()).map_err(|_| TransportError::ConnectionClosed)?;
        }
        Ok(())
    }

    fn send(
        &self,
        session: SessionHandle,
        data: Bytes,
        reliability: SendReliability,
    ) -> TransportResult<()> {
        let sessions = self.shared.sessions();
        let slot = sessions
            .get(&session)
            .ok_or(TransportError::UnknownSession(session))?;

        let backlog = slot.backlog.load(Ordering::Relaxed);
        if reliability == SendReliability::Unreliable
            && backlog >= self.shared.config.unreliable_backlog
        {
            trace!(session = %session, len = data.len(), backlog, "Dropping unreliable message");
            return Ok(());
        }

        trace!(session = %session, len = data.len(), ?reliability, "Queue message");
        // Counted before queueing so the writer never decrements below zero
        slot.backlog.fetch_add(1, Ordering::Relaxed);
        if slot.outbound.send(ChannelFrame::Message(data)).is_err() {
            slot.backlog.fetch_sub(1, Ordering::Relaxed);
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }

    fn realtime_status(&self, session: SessionHandle) -> Option<RealtimeStatus> {
        self.shared.sessions().get(&session).map(|slot| slot.status)
    }

    async fn close(&self, session: SessionHandle, reason: &str) {
        let slot = self.shared.sessions().remove(&session);
        if let Some(slot) = slot {
            debug!(session = %session, "Closing session: {}", reason);
            let _ = slot.outbound.send(ChannelFrame::Close {
                reason: reason.to_string(),
            });
            slot.cancel.cancel();
        }
    }

    async fn close_listener(&self) {
        let state = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(state) = state {
            info!("Channel listener on {} closed", state.local_addr);
            state.cancel.cancel();
        }
    }
}

async fn dial(
    shared: &Shared,
    peer: &PeerIdentity,
    virtual_port: u32,
) -> TransportResult<FramedStream> {
    let stream = TcpStream::connect(peer.as_str()).await?;
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, FrameCodec::new());

    framed
        .send(ChannelFrame::Hello {
            identity: shared.config.identity.clone(),
            virtual_port,
        })
        .await?;

    match framed.next().await {
        Some(Ok(ChannelFrame::HelloAck)) => Ok(framed),
        Some(Ok(ChannelFrame::Close { reason })) => Err(TransportError::ProtocolError(format!(
            "rejected by peer: {}",
            reason
        ))),
        Some(Ok(other)) => Err(TransportError::ProtocolError(format!(
            "expected HelloAck, got {:?}",
            other
        ))),
        Some(Err(e)) => Err(e),
        None => Err(TransportError::ConnectionClosed),
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Accept loop stopped");
                return;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                debug!("Inbound connection from {}", addr);
                tokio::spawn(handle_inbound(shared.clone(), stream, addr));
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_inbound(shared: Arc<Shared>, stream: TcpStream, addr: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
    }
    let mut framed = Framed::new(stream, FrameCodec::new());

    let hello =
        tokio::time::timeout(shared.config.handshake_timeout, framed.next()).await;
    let (peer, virtual_port) = match hello {
        Ok(Some(Ok(ChannelFrame::Hello {
            identity,
            virtual_port,
        }))) => (identity, virtual_port),
        Ok(Some(Ok(other))) => {
            warn!("Expected Hello from {}, got {:?}", addr, other);
            return;
        }
        Ok(Some(Err(e))) => {
            warn!("Handshake with {} failed: {}", addr, e);
            return;
        }
        Ok(None) => {
            debug!("{} disconnected during handshake", addr);
            return;
        }
        Err(_) => {
            warn!("Handshake with {} timed out", addr);
            return;
        }
    };

    let (gate_tx, gate_rx) = oneshot::channel();
    let (session, outbound, cancel) = shared.open_slot(Some(gate_tx));
    info!(session = %session, peer = %peer, virtual_port, "Incoming session from {}", addr);

    shared.emit(ChannelEvent::Incoming {
        session,
        peer: peer.clone(),
        virtual_port,
    });

    tokio::select! {
        _ = cancel.cancelled() => {
            let _ = framed
                .send(ChannelFrame::Close { reason: "rejected".to_string() })
                .await;
            return;
        }
        accepted = gate_rx => {
            if accepted.is_err() {
                return;
            }
        }
    }

    if let Err(e) = framed.send(ChannelFrame::HelloAck).await {
        shared.finish(session, CloseReason::ProblemDetectedLocally(e.to_string()));
        return;
    }

    shared.emit(ChannelEvent::Connected {
        session,
        peer: peer.clone(),
    });
    run_session(shared, session, framed, outbound, cancel).await;
}

async fn run_session(
    shared: Arc<Shared>,
    session: SessionHandle,
    framed: FramedStream,
    outbound: OutboundQueue,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    let (sink, source) = framed.split();
    let (control, control_rx) = mpsc::unbounded_channel();

    let mut writer: JoinHandle<()> = tokio::spawn(write_frames(
        shared.clone(),
        session,
        sink,
        outbound,
        control_rx,
        started,
        cancel.clone(),
    ));

    let closed_locally = read_frames(&shared, session, source, control, started, &cancel).await;
    if !closed_locally {
        writer.abort();
        return;
    }

    // Let the writer flush what was queued before the close, Close frame included
    if tokio::time::timeout(shared.config.handshake_timeout, &mut writer)
        .await
        .is_err()
    {
        warn!(session = %session, "Timed out flushing closed session");
        writer.abort();
    }
    debug!(session = %session, "Session stopped");
}

/// Write queued frames and keepalive pings. Stops on cancel after flushing the
/// outbound queue, or on the first write error.
async fn write_frames(
    shared: Arc<Shared>,
    session: SessionHandle,
    mut sink: FrameSink,
    mut outbound: OutboundQueue,
    mut control: mpsc::UnboundedReceiver<ChannelFrame>,
    started: Instant,
    cancel: CancellationToken,
) {
    let interval = shared.config.keepalive_interval;
    let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                while let Ok(frame) = outbound.frames.try_recv() {
                    outbound.taken(&frame);
                    if sink.feed(frame).await.is_err() {
                        break;
                    }
                }
                let _ = sink.close().await;
                return;
            }

            Some(frame) = control.recv() => frame,

            frame = outbound.frames.recv() => {
                let Some(frame) = frame else {
                    return;
                };
                outbound.taken(&frame);
                frame
            }

            _ = keepalive.tick() => ChannelFrame::Ping {
                timestamp_us: started.elapsed().as_micros() as u64,
            },
        };

        if let Err(e) = sink.send(frame).await {
            shared.finish(session, CloseReason::ProblemDetectedLocally(e.to_string()));
            cancel.cancel();
            return;
        }
    }
}

/// Read frames until the session ends. Returns true when it was stopped by
/// the cancel token rather than by the peer or a read error.
async fn read_frames(
    shared: &Shared,
    session: SessionHandle,
    mut source: FrameSource,
    control: mpsc::UnboundedSender<ChannelFrame>,
    started: Instant,
    cancel: &CancellationToken,
) -> bool {
    loop {
        let inbound = tokio::select! {
            _ = cancel.cancelled() => return true,
            inbound = source.next() => inbound,
        };

        match inbound {
            Some(Ok(ChannelFrame::Message(data))) => {
                shared.emit(ChannelEvent::Message { session, data });
            }
            Some(Ok(ChannelFrame::Ping { timestamp_us })) => {
                // Writer gone means the session is ending anyway
                let _ = control.send(ChannelFrame::Pong { timestamp_us });
            }
            Some(Ok(ChannelFrame::Pong { timestamp_us })) => {
                let rtt = started
                    .elapsed()
                    .saturating_sub(Duration::from_micros(timestamp_us));
                trace!(session = %session, ?rtt, "Pong");
                shared.record_rtt(session, rtt);
            }
            Some(Ok(ChannelFrame::Close { reason })) => {
                debug!(session = %session, "Peer closed session: {}", reason);
                shared.finish(session, CloseReason::ClosedByPeer);
                return false;
            }
            Some(Ok(other)) => {
                debug!(session = %session, "Ignoring unexpected frame {:?}", other);
            }
            Some(Err(e)) => {
                shared.finish(session, CloseReason::ProblemDetectedLocally(e.to_string()));
                return false;
            }
            None => {
                shared.finish(session, CloseReason::ClosedByPeer);
                return false;
            }
        }
    }
}
