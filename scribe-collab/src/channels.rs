//! Channel-multiplexed transport and its relay server.
//!
//! The low-latency strategy: three reliable logical channels (text,
//! formatting, structure) plus an unreliable datagram path for cursor
//! presence. Each logical channel is realized as its own TCP stream to
//! the channel server — an independently ordered byte pipe, exactly the
//! contract the protocol requires — and awareness datagrams travel over
//! UDP to the same port.
//!
//! Connection establishment per channel: a session preamble carrying the
//! client id and room key (the equivalent of a connect URL's path), then
//! the channel contract verbatim — one tag byte, then length-prefixed
//! frames.
//!
//! The server relays every complete frame to the same-tagged channel of
//! every other client in the room, never back to the sender. It also
//! folds text and formatting operations into a per-room document so a
//! late joiner receives a snapshot of what the room has written so far.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;

use scribe_proto::{AwarenessDatagram, Channel, CursorState, FrameAssembler, Op};

use crate::document::SharedDocument;
use crate::transport::{
    ConnectionState, Transport, TransportError, TransportEvent, TransportKind,
};

/// Datagrams are tiny; this comfortably fits the fixed awareness record.
const DATAGRAM_BUF: usize = 64;
const READ_BUF: usize = 4096;

/// Where the channel strategy connects.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Channel server address; TCP carries the channels, UDP on the same
    /// port carries awareness.
    pub addr: String,
    pub room: String,
    pub client_id: u16,
}

fn encode_preamble(client_id: u16, room: &str) -> Result<Vec<u8>, TransportError> {
    let room_len = u8::try_from(room.len())
        .map_err(|_| TransportError::ConnectFailed(format!("room key too long: {}", room.len())))?;
    let mut out = Vec::with_capacity(3 + room.len() + 1);
    out.extend_from_slice(&client_id.to_be_bytes());
    out.push(room_len);
    out.extend_from_slice(room.as_bytes());
    Ok(out)
}

/// The channel-multiplexed client transport.
pub struct ChannelTransport {
    writers: HashMap<Channel, mpsc::UnboundedSender<Vec<u8>>>,
    udp: Arc<UdpSocket>,
    status_tx: Arc<watch::Sender<ConnectionState>>,
    status_rx: watch::Receiver<ConnectionState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChannelTransport {
    /// Open the three channels in fixed order and the datagram path.
    /// Inbound traffic is delivered on `events`.
    pub async fn connect(
        config: ChannelConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        let (status_tx, status_rx) = watch::channel(ConnectionState::Connecting);
        let status_tx = Arc::new(status_tx);
        let preamble = encode_preamble(config.client_id, &config.room)?;

        let mut streams = Vec::with_capacity(Channel::ALL.len());
        for channel in Channel::ALL {
            let stream = TcpStream::connect(&config.addr)
                .await
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
            stream.set_nodelay(true).ok();
            streams.push((channel, stream));
        }

        let udp = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        udp.connect(&config.addr)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        let udp = Arc::new(udp);

        // Tag every channel before spawning anything, so a failed
        // establishment leaves no detached loops behind.
        let _ = status_tx.send(ConnectionState::StreamsInitializing);
        for (channel, stream) in &mut streams {
            // Session preamble, then the channel's self-identifying tag.
            let mut hello = preamble.clone();
            hello.push(channel.tag());
            stream
                .write_all(&hello)
                .await
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        }

        let mut writers = HashMap::new();
        let mut tasks = Vec::new();
        for (channel, stream) in streams {
            let (read_half, write_half) = stream.into_split();
            let (tx, rx) = mpsc::unbounded_channel();
            writers.insert(channel, tx);
            tasks.push(tokio::spawn(write_loop(channel, write_half, rx)));
            tasks.push(tokio::spawn(read_loop(
                channel,
                read_half,
                events.clone(),
                status_tx.clone(),
            )));
        }
        tasks.push(tokio::spawn(datagram_loop(udp.clone(), events)));

        let _ = status_tx.send(ConnectionState::Connected);
        log::info!(
            "channel transport connected to {} (room {:?}, client {})",
            config.addr,
            config.room,
            config.client_id
        );

        Ok(Self {
            writers,
            udp,
            status_tx,
            status_rx,
            tasks: Mutex::new(tasks),
        })
    }

    fn write_frame(&self, channel: Channel, op: &Op) -> Result<(), TransportError> {
        let frame = op.to_frame()?;
        let writer = self
            .writers
            .get(&channel)
            .ok_or(TransportError::ChannelClosed)?;
        writer
            .send(frame)
            .map_err(|_| TransportError::ChannelClosed)
    }
}

impl Transport for ChannelTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Channels
    }

    fn send_update(&self, update: &[u8]) -> Result<(), TransportError> {
        self.write_frame(Channel::Text, &Op::Raw(update.to_vec()))
    }

    fn edits_supported(&self) -> bool {
        true
    }

    fn send_edit(&self, op: &Op) -> Result<(), TransportError> {
        let channel = match op {
            Op::Format { .. } => Channel::Formatting,
            Op::Structure(_) => Channel::Structure,
            _ => Channel::Text,
        };
        self.write_frame(channel, op)
    }

    fn send_awareness(&self, client_id: u16, state: CursorState) -> Result<(), TransportError> {
        let datagram =
            AwarenessDatagram::new(client_id, state.cursor, state.anchor, state.head).encode();
        // Fire-and-forget: a full socket buffer or transient error just
        // drops this record; the next cursor move supersedes it anyway.
        if let Err(e) = self.udp.try_send(&datagram) {
            log::trace!("awareness datagram dropped: {e}");
        }
        Ok(())
    }

    fn status(&self) -> watch::Receiver<ConnectionState> {
        self.status_rx.clone()
    }

    fn close(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
        let _ = self.status_tx.send(ConnectionState::Disconnected);
    }
}

async fn write_loop(
    channel: Channel,
    mut half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = half.write_all(&frame).await {
            log::warn!("{channel} channel write failed: {e}");
            break;
        }
    }
}

async fn read_loop(
    channel: Channel,
    mut half: OwnedReadHalf,
    events: mpsc::UnboundedSender<TransportEvent>,
    status_tx: Arc<watch::Sender<ConnectionState>>,
) {
    let mut assembler = FrameAssembler::new();
    let mut buf = [0u8; READ_BUF];
    loop {
        match half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                assembler.push(&buf[..n]);
                while let Some(body) = assembler.next_body() {
                    match Op::decode(&body) {
                        Ok(Op::Raw(update)) => {
                            if events.send(TransportEvent::Update(update)).is_err() {
                                return;
                            }
                        }
                        Ok(op) => {
                            if events.send(TransportEvent::Edit(op)).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            log::warn!("dropping frame on {channel} channel: {e}");
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!("{channel} channel read failed: {e}");
                break;
            }
        }
    }
    let _ = status_tx.send(ConnectionState::Disconnected);
    let _ = events.send(TransportEvent::Closed);
}

async fn datagram_loop(udp: Arc<UdpSocket>, events: mpsc::UnboundedSender<TransportEvent>) {
    let mut buf = [0u8; DATAGRAM_BUF];
    loop {
        match udp.recv(&mut buf).await {
            Ok(n) => match AwarenessDatagram::decode(&buf[..n]) {
                Ok(dg) => {
                    if events
                        .send(TransportEvent::Awareness(vec![dg.into()]))
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => log::debug!("dropping malformed awareness datagram: {e}"),
            },
            Err(e) => {
                // Best-effort path: transient errors are not fatal.
                log::debug!("awareness receive failed: {e}");
            }
        }
    }
}

/// Channel server configuration.
#[derive(Debug, Clone)]
pub struct ChannelServerConfig {
    /// Address to bind, TCP and UDP.
    pub bind_addr: String,
}

impl Default for ChannelServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9070".to_string(),
        }
    }
}

#[derive(Default)]
struct PeerChannels {
    writers: HashMap<Channel, mpsc::UnboundedSender<Vec<u8>>>,
    udp_addr: Option<SocketAddr>,
}

struct ChannelRoom {
    doc: SharedDocument,
    peers: RwLock<HashMap<u16, PeerChannels>>,
}

impl ChannelRoom {
    fn new() -> Self {
        Self {
            doc: SharedDocument::new(),
            peers: RwLock::new(HashMap::new()),
        }
    }
}

type Rooms = Arc<RwLock<HashMap<String, Arc<ChannelRoom>>>>;
type ClientIndex = Arc<RwLock<HashMap<u16, String>>>;

/// Relay hub for the channel strategy: rooms of tagged streams plus a
/// datagram fan-out. Frames are relayed verbatim; text and formatting
/// operations are additionally folded into the room document so joining
/// clients can be brought up to date.
pub struct ChannelServer {
    config: ChannelServerConfig,
    rooms: Rooms,
    clients: ClientIndex,
}

impl ChannelServer {
    pub fn new(config: ChannelServerConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            clients: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ChannelServerConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Bind and serve until the task is dropped.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let udp = UdpSocket::bind(&self.config.bind_addr).await?;
        log::info!("channel server listening on {}", self.config.bind_addr);
        self.serve(listener, udp).await
    }

    /// Serve on pre-bound sockets (lets tests bind port 0 first).
    pub async fn serve(&self, listener: TcpListener, udp: UdpSocket) -> std::io::Result<()> {
        let udp = Arc::new(udp);
        tokio::spawn(datagram_relay(
            udp.clone(),
            self.rooms.clone(),
            self.clients.clone(),
        ));

        loop {
            let (stream, addr) = listener.accept().await?;
            stream.set_nodelay(true).ok();
            log::debug!("channel connection from {addr}");
            let rooms = self.rooms.clone();
            let clients = self.clients.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_channel_conn(stream, rooms, clients).await {
                    log::debug!("channel connection from {addr} ended: {e}");
                }
            });
        }
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

async fn handle_channel_conn(
    mut stream: TcpStream,
    rooms: Rooms,
    clients: ClientIndex,
) -> std::io::Result<()> {
    // Session preamble: client id, room key length, room key; then the
    // channel's self-identifying tag byte.
    let mut id_buf = [0u8; 2];
    stream.read_exact(&mut id_buf).await?;
    let client_id = u16::from_be_bytes(id_buf);

    let mut len_buf = [0u8; 1];
    stream.read_exact(&mut len_buf).await?;
    let mut room_buf = vec![0u8; len_buf[0] as usize];
    stream.read_exact(&mut room_buf).await?;
    let room_key = match String::from_utf8(room_buf) {
        Ok(key) => key,
        Err(_) => {
            log::warn!("rejecting channel connection with non-UTF-8 room key");
            return Ok(());
        }
    };

    let mut tag_buf = [0u8; 1];
    stream.read_exact(&mut tag_buf).await?;
    let channel = match Channel::from_tag(tag_buf[0]) {
        Some(ch) => ch,
        None => {
            log::warn!("rejecting channel connection with unknown tag 0x{:02x}", tag_buf[0]);
            return Ok(());
        }
    };

    let room = get_or_create_room(&rooms, &room_key).await;
    clients.write().await.insert(client_id, room_key.clone());

    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
    room.peers
        .write()
        .await
        .entry(client_id)
        .or_default()
        .writers
        .insert(channel, tx.clone());
    log::info!("client {client_id} opened {channel} channel in room {room_key:?}");

    // Bring a joining client up to date over its text channel.
    if channel == Channel::Text {
        let snapshot = room.doc.full_state();
        match Op::Raw(snapshot).to_frame() {
            Ok(frame) => {
                let _ = tx.send(frame);
            }
            Err(e) => log::warn!("room {room_key:?} snapshot not sent: {e}"),
        }
    }

    let writer_task = tokio::spawn(write_loop(channel, write_half, rx));

    relay_read_loop(channel, read_half, client_id, &room).await;

    // Cleanup: this channel is gone; the peer leaves once its last
    // channel closes, and the room dies with its last peer.
    writer_task.abort();
    let peer_gone = {
        let mut peers = room.peers.write().await;
        if let Some(peer) = peers.get_mut(&client_id) {
            peer.writers.remove(&channel);
            if peer.writers.is_empty() {
                peers.remove(&client_id);
                true
            } else {
                false
            }
        } else {
            false
        }
    };
    if peer_gone {
        clients.write().await.remove(&client_id);
        log::info!("client {client_id} left room {room_key:?}");
        let mut rooms_w = rooms.write().await;
        if let Some(r) = rooms_w.get(&room_key) {
            if r.peers.read().await.is_empty() {
                rooms_w.remove(&room_key);
                log::info!("room {room_key:?} removed (empty)");
            }
        }
    }
    Ok(())
}

async fn get_or_create_room(rooms: &Rooms, key: &str) -> Arc<ChannelRoom> {
    {
        let rooms_r = rooms.read().await;
        if let Some(room) = rooms_r.get(key) {
            return room.clone();
        }
    }
    let mut rooms_w = rooms.write().await;
    if let Some(room) = rooms_w.get(key) {
        return room.clone();
    }
    let room = Arc::new(ChannelRoom::new());
    rooms_w.insert(key.to_string(), room.clone());
    log::info!("created channel room {key:?}");
    room
}

async fn relay_read_loop(
    channel: Channel,
    mut half: OwnedReadHalf,
    client_id: u16,
    room: &Arc<ChannelRoom>,
) {
    let mut assembler = FrameAssembler::new();
    let mut buf = [0u8; READ_BUF];
    loop {
        let n = match half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::debug!("{channel} channel read from client {client_id} failed: {e}");
                break;
            }
        };
        assembler.push(&buf[..n]);
        while let Some(body) = assembler.next_body() {
            let op = match Op::decode(&body) {
                Ok(op) => op,
                Err(e) => {
                    log::warn!("dropping frame from client {client_id} on {channel}: {e}");
                    continue;
                }
            };

            // Fold content-bearing ops into the room document so late
            // joiners can be handed a snapshot.
            if matches!(channel, Channel::Text | Channel::Formatting) {
                if let Err(e) = room.doc.apply_remote_op(&op) {
                    log::debug!("room doc skipped op from client {client_id}: {e}");
                }
            }

            // Relay verbatim to every other peer's same-tagged channel.
            let mut frame = Vec::with_capacity(2 + body.len());
            frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
            frame.extend_from_slice(&body);
            let peers = room.peers.read().await;
            for (peer_id, peer) in peers.iter() {
                if *peer_id == client_id {
                    continue;
                }
                if let Some(writer) = peer.writers.get(&channel) {
                    let _ = writer.send(frame.clone());
                }
            }
        }
    }
}

async fn datagram_relay(udp: Arc<UdpSocket>, rooms: Rooms, clients: ClientIndex) {
    let mut buf = [0u8; DATAGRAM_BUF];
    loop {
        let (n, addr) = match udp.recv_from(&mut buf).await {
            Ok(got) => got,
            Err(e) => {
                // A dead socket would make `continue` spin; the datagram
                // path is best-effort, so let it end.
                log::warn!("datagram receive failed, stopping relay: {e}");
                break;
            }
        };
        let dg = match AwarenessDatagram::decode(&buf[..n]) {
            Ok(dg) => dg,
            Err(e) => {
                log::debug!("dropping malformed datagram from {addr}: {e}");
                continue;
            }
        };
        let Some(room_key) = clients.read().await.get(&dg.client_id).cloned() else {
            log::debug!("datagram from unknown client {}", dg.client_id);
            continue;
        };
        let Some(room) = rooms.read().await.get(&room_key).cloned() else {
            continue;
        };
        // Learn the sender's return address, collect everyone else's.
        let targets: Vec<SocketAddr> = {
            let mut peers = room.peers.write().await;
            if let Some(peer) = peers.get_mut(&dg.client_id) {
                peer.udp_addr = Some(addr);
            }
            peers
                .iter()
                .filter(|(id, _)| **id != dg.client_id)
                .filter_map(|(_, peer)| peer.udp_addr)
                .collect()
        };
        for target in targets {
            if let Err(e) = udp.send_to(&buf[..n], target).await {
                log::trace!("datagram relay to {target} failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preamble_layout() {
        let bytes = encode_preamble(0x0102, "doc-1").unwrap();
        assert_eq!(&bytes[..2], &[0x01, 0x02]);
        assert_eq!(bytes[2], 5);
        assert_eq!(&bytes[3..], b"doc-1");
    }

    #[test]
    fn preamble_rejects_long_room_keys() {
        let room = "r".repeat(256);
        assert!(matches!(
            encode_preamble(1, &room),
            Err(TransportError::ConnectFailed(_))
        ));
    }

    #[test]
    fn server_config_default() {
        let config = ChannelServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9070");
    }

    #[tokio::test]
    async fn rooms_start_empty() {
        let server = ChannelServer::with_defaults();
        assert_eq!(server.room_count().await, 0);
    }

    #[tokio::test]
    async fn get_or_create_returns_same_room() {
        let rooms: Rooms = Arc::new(RwLock::new(HashMap::new()));
        let a = get_or_create_room(&rooms, "alpha").await;
        let b = get_or_create_room(&rooms, "alpha").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(rooms.read().await.len(), 1);
    }
}
