//! Stream registry: maps stream ids to local sockets

use crate::config::MuxConfig;
use crate::sink::{PacketSink, PeerRole};
use bytes::Bytes;
use gamelink_proto::{Packet, PacketType, ProtoError, StreamId};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error("Failed to connect to local port {port}: {source}")]
    Dial {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out connecting to local port {0}")]
    DialTimeout(u16),

    #[error("Packet sink closed")]
    SinkClosed,
}

/// How a stream entered the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOrigin {
    /// Accepted locally; the id was generated here
    Local,
    /// Dialed on demand for an id chosen by the peer
    Adopted,
}

struct StreamEntry {
    writer: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
    origin: StreamOrigin,
    peer_addr: Option<SocketAddr>,
    opened_at: Instant,
}

impl StreamEntry {
    fn handle(&self, id: StreamId) -> StreamHandle {
        StreamHandle {
            id,
            origin: self.origin,
            peer_addr: self.peer_addr,
            opened_at: self.opened_at,
            cancel: self.cancel.clone(),
        }
    }
}

#[derive(Default)]
struct Streams {
    entries: HashMap<StreamId, StreamEntry>,
    /// Ids with no resolvable local target, only used to avoid log spam
    missing: HashSet<StreamId>,
}

/// Read-only view of a registered stream
#[derive(Debug, Clone)]
pub struct StreamHandle {
    id: StreamId,
    origin: StreamOrigin,
    peer_addr: Option<SocketAddr>,
    opened_at: Instant,
    cancel: CancellationToken,
}

impl StreamHandle {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn origin(&self) -> StreamOrigin {
        self.origin
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the stream has been removed from the registry
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }
}

/// Registry of the local streams multiplexed over one link
pub struct StreamRegistry {
    config: MuxConfig,
    role: Arc<dyn PeerRole>,
    sink: Arc<dyn PacketSink>,
    streams: Mutex<Streams>,
}

impl StreamRegistry {
    pub fn new(
        config: MuxConfig,
        role: Arc<dyn PeerRole>,
        sink: Arc<dyn PacketSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            role,
            sink,
            streams: Mutex::new(Streams::default()),
        })
    }

    fn streams(&self) -> MutexGuard<'_, Streams> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a locally accepted connection under a fresh id and start
    /// forwarding it
    pub fn register_local_stream(self: &Arc<Self>, stream: TcpStream) -> StreamId {
        self.attach_local_stream(stream).id()
    }

    /// Same as [`Self::register_local_stream`], returning the stream handle
    pub fn attach_local_stream(self: &Arc<Self>, stream: TcpStream) -> StreamHandle {
        let peer_addr = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let (writer, writer_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let entry = StreamEntry {
            writer,
            cancel: cancel.clone(),
            origin: StreamOrigin::Local,
            peer_addr,
            opened_at: Instant::now(),
        };

        let (handle, active) = {
            let mut streams = self.streams();
            let id =
                StreamId::generate_unique(|candidate| streams.entries.contains_key(candidate));
            let handle = entry.handle(id);
            streams.missing.remove(&id);
            streams.entries.insert(id, entry);
            (handle, streams.entries.len())
        };

        info!(
            stream_id = %handle.id,
            peer_addr = ?peer_addr,
            active_streams = active,
            "Local stream registered"
        );

        self.spawn_pumps(handle.id, read_half, write_half, writer_rx, cancel);
        handle
    }

    /// Adopt an outbound connection under an id chosen by the peer
    fn adopt_stream(
        self: &Arc<Self>,
        id: StreamId,
        stream: TcpStream,
    ) -> mpsc::UnboundedSender<Bytes> {
        let peer_addr = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let (writer, writer_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        {
            let mut streams = self.streams();
            if let Some(existing) = streams.entries.get(&id) {
                // Raced with another adoption of the same id; keep the first
                return existing.writer.clone();
            }
            streams.missing.remove(&id);
            streams.entries.insert(
                id,
                StreamEntry {
                    writer: writer.clone(),
                    cancel: cancel.clone(),
                    origin: StreamOrigin::Adopted,
                    peer_addr,
                    opened_at: Instant::now(),
                },
            );
        }

        info!(stream_id = %id, peer_addr = ?peer_addr, "Adopted stream from peer");
        self.spawn_pumps(id, read_half, write_half, writer_rx, cancel);
        writer
    }

    fn spawn_pumps(
        self: &Arc<Self>,
        id: StreamId,
        read_half: OwnedReadHalf,
        write_half: OwnedWriteHalf,
        writer_rx: mpsc::UnboundedReceiver<Bytes>,
        cancel: CancellationToken,
    ) {
        tokio::spawn(self.clone().read_pump(id, read_half, cancel));
        tokio::spawn(self.clone().write_pump(id, write_half, writer_rx));
    }

    /// Remove a stream: stop its read pump, let its writer drain and close
    /// the socket. Returns false if the id was not registered.
    pub fn remove_stream(&self, id: StreamId) -> bool {
        let (entry, active) = {
            let mut streams = self.streams();
            streams.missing.remove(&id);
            let entry = streams.entries.remove(&id);
            (entry, streams.entries.len())
        };

        match entry {
            Some(entry) => {
                entry.cancel.cancel();
                debug!(
                    stream_id = %id,
                    duration_ms = entry.opened_at.elapsed().as_millis() as u64,
                    active_streams = active,
                    "Stream removed"
                );
                true
            }
            None => false,
        }
    }

    pub fn lookup_stream(&self, id: StreamId) -> Option<StreamHandle> {
        self.streams().entries.get(&id).map(|entry| entry.handle(id))
    }

    /// Frame `payload` for stream `id` and hand the packets to the sink.
    /// Data larger than the chunk size is split; Disconnect carries nothing.
    pub fn send_framed(
        &self,
        id: StreamId,
        payload: Bytes,
        packet_type: PacketType,
    ) -> Result<usize, MuxError> {
        match packet_type {
            PacketType::Data => {
                let mut sent = 0;
                for packet in Packet::chunked(id, payload, self.config.chunk_size) {
                    self.sink.send_packet(packet.encode())?;
                    sent += 1;
                }
                trace!(stream_id = %id, packets = sent, "Forwarded data");
                Ok(sent)
            }
            PacketType::Disconnect => {
                self.sink.send_packet(Packet::disconnect(id).encode())?;
                Ok(1)
            }
        }
    }

    fn send_disconnect(&self, id: StreamId) {
        if let Err(e) = self.send_framed(id, Bytes::new(), PacketType::Disconnect) {
            debug!(stream_id = %id, "Failed to send disconnect: {}", e);
        }
    }

    /// Route one packet received from the peer
    pub async fn handle_incoming(self: &Arc<Self>, raw: Bytes) {
        let packet = match Packet::decode(raw) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping packet: {}", e);
                return;
            }
        };

        match packet.packet_type {
            PacketType::Data => self.deliver(packet.stream_id, packet.payload).await,
            PacketType::Disconnect => {
                if self.remove_stream(packet.stream_id) {
                    debug!(stream_id = %packet.stream_id, "Peer closed stream");
                } else {
                    trace!(stream_id = %packet.stream_id, "Disconnect for unknown stream");
                }
            }
        }
    }

    async fn deliver(self: &Arc<Self>, id: StreamId, payload: Bytes) {
        let writer = {
            let mut streams = self.streams();
            let writer = streams.entries.get(&id).map(|entry| entry.writer.clone());
            if writer.is_some() {
                streams.missing.remove(&id);
            }
            writer
        };

        let writer = match writer {
            Some(writer) => Some(writer),
            None => match (self.role.is_host(), self.config.local_target_port) {
                (true, Some(port)) => match self.dial(port).await {
                    Ok(stream) => Some(self.adopt_stream(id, stream)),
                    Err(e) => {
                        warn!(stream_id = %id, "{}", e);
                        self.send_disconnect(id);
                        return;
                    }
                },
                _ => None,
            },
        };

        match writer {
            Some(writer) => {
                if writer.send(payload).is_err() {
                    trace!(stream_id = %id, "Writer already closed");
                }
            }
            None => {
                if self.streams().missing.insert(id) {
                    warn!(stream_id = %id, "No local target for stream");
                } else {
                    trace!(stream_id = %id, "No local target for stream");
                }
                self.send_disconnect(id);
            }
        }
    }

    async fn dial(&self, port: u16) -> Result<TcpStream, MuxError> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let stream = tokio::time::timeout(self.config.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| MuxError::DialTimeout(port))?
            .map_err(|source| MuxError::Dial { port, source })?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    async fn read_pump(
        self: Arc<Self>,
        id: StreamId,
        mut read_half: OwnedReadHalf,
        cancel: CancellationToken,
    ) {
        let mut buf = vec![0u8; self.config.read_buffer_size];

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => return,
                read = read_half.read(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    debug!(stream_id = %id, "Local stream closed");
                    break;
                }
                Ok(n) => {
                    if let Err(e) =
                        self.send_framed(id, Bytes::copy_from_slice(&buf[..n]), PacketType::Data)
                    {
                        debug!(stream_id = %id, "Stopping read pump: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    debug!(stream_id = %id, "Local read error: {}", e);
                    break;
                }
            }
        }

        self.close_from_local(id);
    }

    async fn write_pump(
        self: Arc<Self>,
        id: StreamId,
        mut write_half: OwnedWriteHalf,
        mut writer_rx: mpsc::UnboundedReceiver<Bytes>,
    ) {
        // Ends once the entry (and with it the sender) is gone, after the
        // queued payloads are written
        while let Some(data) = writer_rx.recv().await {
            if let Err(e) = write_half.write_all(&data).await {
                debug!(stream_id = %id, "Local write error: {}", e);
                self.close_from_local(id);
                return;
            }
        }
        let _ = write_half.shutdown().await;
    }

    fn close_from_local(&self, id: StreamId) {
        if self.remove_stream(id) && self.config.notify_peer_on_local_close {
            self.send_disconnect(id);
        }
    }

    /// Close every stream and forget every missing id
    pub fn teardown(&self) {
        let entries: Vec<StreamEntry> = {
            let mut streams = self.streams();
            streams.missing.clear();
            streams.entries.drain().map(|(_, entry)| entry).collect()
        };

        for entry in &entries {
            entry.cancel.cancel();
        }
        if !entries.is_empty() {
            info!(closed_streams = entries.len(), "Stream registry torn down");
        }
    }

    pub fn stream_count(&self) -> usize {
        self.streams().entries.len()
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.streams().entries.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn is_missing(&self, id: StreamId) -> bool {
        self.streams().missing.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::StaticRole;
    use tokio::net::TcpListener;

    fn registry(
        role: StaticRole,
        config: MuxConfig,
    ) -> (Arc<StreamRegistry>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StreamRegistry::new(config, Arc::new(role), Arc::new(tx)), rx)
    }

    /// Connected (client, server) socket pair on loopback
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    async fn next_packet(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Packet {
        let raw = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for packet")
            .expect("sink closed");
        Packet::decode(raw).unwrap()
    }

    fn unused_port() -> u16 {
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        reserved.local_addr().unwrap().port()
    }

    fn id(s: &str) -> StreamId {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_large_payload_split_into_chunks() {
        let (registry, mut rx) = registry(StaticRole::guest(), MuxConfig::default());
        let (_client, server) = socket_pair().await;
        let stream_id = registry.register_local_stream(server);

        let sent = registry
            .send_framed(stream_id, Bytes::from(vec![1u8; 100 * 1024]), PacketType::Data)
            .unwrap();
        assert_eq!(sent, 2);

        let first = next_packet(&mut rx).await;
        let second = next_packet(&mut rx).await;
        assert_eq!(first.stream_id, stream_id);
        assert_eq!(second.stream_id, stream_id);
        assert_eq!(first.payload.len(), 61440);
        assert_eq!(second.payload.len(), 40960);
    }

    #[tokio::test]
    async fn test_read_pump_forwards_local_bytes() {
        let (registry, mut rx) = registry(StaticRole::guest(), MuxConfig::default());
        let (mut client, server) = socket_pair().await;
        let stream_id = registry.register_local_stream(server);

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
        client.write_all(&payload).await.unwrap();

        let mut received = Vec::new();
        while received.len() < payload.len() {
            let packet = next_packet(&mut rx).await;
            assert_eq!(packet.stream_id, stream_id);
            assert_eq!(packet.packet_type, PacketType::Data);
            assert!(packet.payload.len() <= 61440);
            received.extend_from_slice(&packet.payload);
        }
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_stream_handle_describes_local_peer() {
        let (registry, _rx) = registry(StaticRole::guest(), MuxConfig::default());
        let (client, server) = socket_pair().await;
        let handle = registry.attach_local_stream(server);

        assert_eq!(handle.origin(), StreamOrigin::Local);
        assert_eq!(handle.peer_addr(), Some(client.local_addr().unwrap()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.age() >= Duration::from_millis(20));

        let looked_up = registry.lookup_stream(handle.id()).unwrap();
        assert_eq!(looked_up.peer_addr(), handle.peer_addr());
    }

    #[tokio::test]
    async fn test_host_adopts_unknown_stream() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = target.local_addr().unwrap().port();
        let (registry, _rx) = registry(
            StaticRole::host(),
            MuxConfig::default().with_local_target_port(port),
        );

        let raw = Packet::data(id("XY9Z01"), Bytes::from_static(b"hello")).encode();
        registry.handle_incoming(raw).await;

        let (mut service, _) = tokio::time::timeout(Duration::from_secs(5), target.accept())
            .await
            .unwrap()
            .unwrap();
        let mut buf = [0u8; 5];
        service.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let handle = registry.lookup_stream(id("XY9Z01")).unwrap();
        assert_eq!(handle.origin(), StreamOrigin::Adopted);
        assert_eq!(registry.stream_count(), 1);

        // Later packets reuse the adopted connection
        registry
            .handle_incoming(Packet::data(id("XY9Z01"), Bytes::from_static(b"again")).encode())
            .await;
        service.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"again");
        assert_eq!(registry.stream_count(), 1);
    }

    #[tokio::test]
    async fn test_host_dial_failure_replies_disconnect() {
        let (registry, mut rx) = registry(
            StaticRole::host(),
            MuxConfig::default().with_local_target_port(unused_port()),
        );

        registry
            .handle_incoming(Packet::data(id("XY9Z01"), Bytes::from_static(b"hello")).encode())
            .await;

        let reply = next_packet(&mut rx).await;
        assert_eq!(reply, Packet::disconnect(id("XY9Z01")));
        assert!(registry.lookup_stream(id("XY9Z01")).is_none());
        assert_eq!(registry.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_peer_disconnect_removes_stream() {
        let (registry, mut rx) = registry(StaticRole::guest(), MuxConfig::default());
        let (mut client, server) = socket_pair().await;
        let handle = registry.attach_local_stream(server);
        let stream_id = handle.id();

        registry
            .handle_incoming(Packet::disconnect(stream_id).encode())
            .await;
        assert!(registry.lookup_stream(stream_id).is_none());
        assert!(handle.is_closed());

        // Local client sees the socket closing
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        // Repeat is a no-op and nothing is sent back
        registry
            .handle_incoming(Packet::disconnect(stream_id).encode())
            .await;
        assert!(!registry.remove_stream(stream_id));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_data_written_in_order_before_disconnect() {
        let (registry, _rx) = registry(StaticRole::guest(), MuxConfig::default());
        let (mut client, server) = socket_pair().await;
        let stream_id = registry.register_local_stream(server);

        for chunk in [&b"one "[..], b"two ", b"three"] {
            registry
                .handle_incoming(Packet::data(stream_id, Bytes::copy_from_slice(chunk)).encode())
                .await;
        }
        registry
            .handle_incoming(Packet::disconnect(stream_id).encode())
            .await;

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"one two three");
    }

    #[tokio::test]
    async fn test_guest_unknown_stream_is_missing() {
        let (registry, mut rx) = registry(StaticRole::guest(), MuxConfig::default());

        for _ in 0..2 {
            registry
                .handle_incoming(Packet::data(id("Gone01"), Bytes::from_static(b"x")).encode())
                .await;
            assert_eq!(next_packet(&mut rx).await, Packet::disconnect(id("Gone01")));
        }
        assert!(registry.is_missing(id("Gone01")));
        assert_eq!(registry.stream_count(), 0);

        assert!(!registry.remove_stream(id("Gone01")));
        assert!(!registry.is_missing(id("Gone01")));
    }

    #[tokio::test]
    async fn test_host_without_target_does_not_dial() {
        let (registry, mut rx) = registry(StaticRole::host(), MuxConfig::default());

        registry
            .handle_incoming(Packet::data(id("NoTgt1"), Bytes::from_static(b"x")).encode())
            .await;
        assert_eq!(next_packet(&mut rx).await, Packet::disconnect(id("NoTgt1")));
        assert!(registry.is_missing(id("NoTgt1")));
    }

    #[tokio::test]
    async fn test_local_eof_notifies_peer() {
        let (registry, mut rx) = registry(StaticRole::guest(), MuxConfig::default());
        let (client, server) = socket_pair().await;
        let handle = registry.attach_local_stream(server);

        drop(client);

        assert_eq!(next_packet(&mut rx).await, Packet::disconnect(handle.id()));
        tokio::time::timeout(Duration::from_secs(5), handle.closed())
            .await
            .unwrap();
        assert!(registry.lookup_stream(handle.id()).is_none());
    }

    #[tokio::test]
    async fn test_local_eof_silent_when_disabled() {
        let config = MuxConfig {
            notify_peer_on_local_close: false,
            ..Default::default()
        };
        let (registry, mut rx) = registry(StaticRole::guest(), config);
        let (client, server) = socket_pair().await;
        let handle = registry.attach_local_stream(server);

        drop(client);
        tokio::time::timeout(Duration::from_secs(5), handle.closed())
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ids_unique_among_open_streams() {
        let (registry, _rx) = registry(StaticRole::guest(), MuxConfig::default());
        let mut clients = Vec::new();
        let mut ids = HashSet::new();

        for _ in 0..32 {
            let (client, server) = socket_pair().await;
            clients.push(client);
            assert!(ids.insert(registry.register_local_stream(server)));
        }

        assert_eq!(registry.stream_count(), 32);
        let listed: HashSet<StreamId> = registry.stream_ids().into_iter().collect();
        assert_eq!(listed, ids);
    }

    #[tokio::test]
    async fn test_teardown_closes_everything() {
        let (registry, mut rx) = registry(StaticRole::guest(), MuxConfig::default());
        let mut clients = Vec::new();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let (client, server) = socket_pair().await;
            clients.push(client);
            handles.push(registry.attach_local_stream(server));
        }
        registry
            .handle_incoming(Packet::data(id("Gone01"), Bytes::from_static(b"x")).encode())
            .await;
        let _ = next_packet(&mut rx).await;

        registry.teardown();

        assert_eq!(registry.stream_count(), 0);
        assert!(!registry.is_missing(id("Gone01")));
        assert!(handles.iter().all(|h| h.is_closed()));

        for client in &mut clients {
            let mut buf = Vec::new();
            let n = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(n, 0);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_packets_dropped() {
        let (registry, mut rx) = registry(StaticRole::host(), MuxConfig::default());

        registry.handle_incoming(Bytes::from_static(b"short")).await;
        let mut unknown = b"AB12cd\0".to_vec();
        unknown.extend_from_slice(&9u32.to_le_bytes());
        registry.handle_incoming(Bytes::from(unknown)).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(registry.stream_count(), 0);
    }
}
