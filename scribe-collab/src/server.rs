//! Relay WebSocket server.
//!
//! The fallback transport's hub: one authoritative document and one
//! awareness registry per room, created on the first join and destroyed
//! when the last connection leaves. The room id comes from the
//! connection's request path.
//!
//! Joining clients immediately receive the room's state vector — so they
//! can request exactly the updates they are missing — followed by a
//! snapshot of every known peer's awareness state. Inbound updates are
//! merged into the room document and, when they change it, rebroadcast to
//! every other connection, never the sender. Awareness deltas rebroadcast
//! only the entries that actually changed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use scribe_proto::{Envelope, SyncMessage};

use crate::awareness::{decode_entries, encode_entries, AwarenessRegistry};
use crate::broadcast::{BroadcastGroup, Member};
use crate::document::SharedDocument;

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Broadcast channel capacity per room.
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9080".to_string(),
            broadcast_capacity: 256,
        }
    }
}

/// Server counters.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

struct RelayRoom {
    doc: SharedDocument,
    awareness: Mutex<AwarenessRegistry>,
    group: BroadcastGroup,
}

impl RelayRoom {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            doc: SharedDocument::new(),
            awareness: Mutex::new(AwarenessRegistry::new()),
            group: BroadcastGroup::new(broadcast_capacity),
        }
    }
}

type Rooms = Arc<RwLock<HashMap<String, Arc<RelayRoom>>>>;

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    rooms: Rooms,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> RelayStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.rooms.read().await.len();
        stats
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Bind the configured address and serve until the task is dropped.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve on a pre-bound listener (lets tests bind port 0 first).
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let capacity = self.config.broadcast_capacity;
            tokio::spawn(async move {
                {
                    let mut s = stats.write().await;
                    s.total_connections += 1;
                    s.active_connections += 1;
                }
                if let Err(e) = handle_connection(stream, addr, rooms, stats.clone(), capacity).await
                {
                    log::debug!("relay connection from {addr} ended: {e}");
                }
                stats.write().await.active_connections -= 1;
            });
        }
    }
}

async fn get_or_create_room(rooms: &Rooms, key: &str, capacity: usize) -> Arc<RelayRoom> {
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
    let room = Arc::new(RelayRoom::new(capacity));
    rooms_w.insert(key.to_string(), room.clone());
    log::info!("created relay room {key:?}");
    room
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    rooms: Rooms,
    stats: Arc<RwLock<RelayStats>>,
    capacity: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // The room id is the request path segment.
    let mut path = String::new();
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        path = req.uri().path().to_string();
        Ok(resp)
    })
    .await?;
    let room_key = {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            "default".to_string()
        } else {
            trimmed.to_string()
        }
    };

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let room = get_or_create_room(&rooms, &room_key, capacity).await;
    let conn_id = Uuid::new_v4();
    let mut broadcast_rx = room
        .group
        .join(
            conn_id,
            Member {
                client_id: None,
                user: None,
            },
        )
        .await;
    log::info!("relay connection {conn_id} from {addr} joined room {room_key:?}");

    let mut conn_client_id: Option<u16> = None;
    // Run the connection to completion, then always detach it; a send
    // failure must not leak the membership that keeps the room alive.
    let result = run_connection(
        &mut ws_tx,
        &mut ws_rx,
        &mut broadcast_rx,
        &room,
        conn_id,
        &stats,
        &mut conn_client_id,
    )
    .await;
    if let Err(e) = &result {
        log::debug!("relay connection {conn_id} errored: {e}");
    }

    // Detach this connection without destroying the room document; the
    // room itself goes away with its last member.
    room.group.leave(&conn_id).await;
    if let Some(client_id) = conn_client_id {
        room.awareness.lock().await.remove(client_id);
    }
    if room.group.member_count().await == 0 {
        let mut rooms_w = rooms.write().await;
        if let Some(r) = rooms_w.get(&room_key) {
            if r.group.member_count().await == 0 {
                rooms_w.remove(&room_key);
                log::info!("relay room {room_key:?} removed (empty)");
            }
        }
    }
    log::info!("relay connection {conn_id} left room {room_key:?}");
    Ok(())
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<TcpStream>,
    Message,
>;
type WsSource = futures_util::stream::SplitStream<tokio_tungstenite::WebSocketStream<TcpStream>>;

async fn run_connection(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsSource,
    broadcast_rx: &mut tokio::sync::broadcast::Receiver<crate::broadcast::RoomMessage>,
    room: &Arc<RelayRoom>,
    conn_id: Uuid,
    stats: &Arc<RwLock<RelayStats>>,
    conn_client_id: &mut Option<u16>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Sync step: tell the joiner what we have, so it can ask for exactly
    // what it is missing.
    let hello = Envelope::Sync(SyncMessage::StateVector(room.doc.state_vector()));
    ws_tx.send(Message::Binary(hello.encode().into())).await?;

    // Full snapshot of known peer awareness.
    let snapshot = room.awareness.lock().await.snapshot();
    if !snapshot.is_empty() {
        let env = Envelope::Awareness(encode_entries(&snapshot));
        ws_tx.send(Message::Binary(env.encode().into())).await?;
    }

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += bytes.len() as u64;
                        }
                        match Envelope::decode(&bytes) {
                            Ok(Envelope::Sync(SyncMessage::StateVector(sv))) => {
                                match room.doc.diff(&sv) {
                                    Ok(diff) => {
                                        let env = Envelope::Sync(SyncMessage::Diff(diff));
                                        ws_tx.send(Message::Binary(env.encode().into())).await?;
                                    }
                                    Err(e) => log::warn!("bad state vector from {conn_id}: {e}"),
                                }
                            }
                            Ok(Envelope::Sync(SyncMessage::Diff(update)))
                            | Ok(Envelope::Sync(SyncMessage::Update(update))) => {
                                match room.doc.apply_remote_update(&update) {
                                    Ok(true) => {
                                        let env = Envelope::Sync(SyncMessage::Update(update));
                                        room.group.send(conn_id, Arc::new(env.encode()));
                                    }
                                    Ok(false) => {
                                        log::trace!("duplicate update from {conn_id} merged to no change");
                                    }
                                    Err(e) => {
                                        log::warn!("skipping corrupt update from {conn_id}: {e}");
                                    }
                                }
                            }
                            Ok(Envelope::Awareness(payload)) => {
                                match decode_entries(&payload) {
                                    Ok(entries) => {
                                        if conn_client_id.is_none() {
                                            if let Some(first) = entries.first() {
                                                *conn_client_id = Some(first.client_id);
                                                room.group.set_client_id(&conn_id, first.client_id).await;
                                            }
                                        }
                                        let changed = room.awareness.lock().await.apply(&entries);
                                        if !changed.is_empty() {
                                            let env = Envelope::Awareness(encode_entries(&changed));
                                            room.group.send(conn_id, Arc::new(env.encode()));
                                        }
                                    }
                                    Err(e) => log::warn!("bad awareness payload from {conn_id}: {e}"),
                                }
                            }
                            Err(e) => {
                                log::warn!("dropping malformed message from {conn_id}: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_tx.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::debug!("websocket error from {conn_id}: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            msg = broadcast_rx.recv() => {
                match msg {
                    Ok(room_msg) => {
                        // Never echo a message back to its sender.
                        if room_msg.from != conn_id {
                            ws_tx.send(Message::Binary(room_msg.bytes.to_vec().into())).await?;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("connection {conn_id} lagged by {n} messages");
                    }
                    Err(_) => break,
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9080");
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[test]
    fn server_creation() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9080");
    }

    #[tokio::test]
    async fn stats_start_at_zero() {
        let server = RelayServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn rooms_are_isolated_instances() {
        let rooms: Rooms = Arc::new(RwLock::new(HashMap::new()));
        let a = get_or_create_room(&rooms, "a", 16).await;
        let b = get_or_create_room(&rooms, "b", 16).await;
        assert!(!Arc::ptr_eq(&a, &b));

        a.doc.insert(0, "only in a").unwrap();
        assert_eq!(b.doc.contents(), "");

        let again = get_or_create_room(&rooms, "a", 16).await;
        assert!(Arc::ptr_eq(&a, &again));
    }
}
