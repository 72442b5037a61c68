//! Client session: the consumer-facing seam over document, bridge,
//! compressor, and whichever transport strategy is reachable.
//!
//! `CollabSession::connect` tries the channel-multiplexed strategy first
//! and falls back transparently to the relay WebSocket; everything above
//! the [`Transport`] trait is identical either way. Local edits are
//! authoritative the instant they land in the local document — network
//! delivery is fire-and-forget, and reconnection catches up through the
//! CRDT's own state-vector exchange.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use scribe_proto::{CursorState, Envelope, Op, SyncMessage, MAX_BODY_LEN};

use crate::awareness::{decode_entries, encode_entries, AwarenessEntry, AwarenessRegistry};
use crate::channels::{ChannelConfig, ChannelTransport};
use crate::compress::{DeltaCompressor, BATCH_WINDOW};
use crate::document::{DocError, SharedDocument, UpdateBridge};
use crate::transport::{
    ConnectionState, Transport, TransportError, TransportEvent, TransportKind,
};

/// Largest text payload the typed op path accepts; anything bigger
/// travels as a raw CRDT update instead.
const MAX_TYPED_SEGMENT: usize = MAX_BODY_LEN - 7;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay WebSocket endpoint, e.g. `ws://127.0.0.1:9080`.
    pub relay_url: String,
    /// Room to join.
    pub room: String,
    /// Channel server address; `None` goes straight to the relay.
    pub channel_addr: Option<String>,
    /// Display name carried with awareness on the relay path.
    pub user: Option<String>,
    /// Insert batching window.
    pub batch_window: Duration,
}

impl SessionConfig {
    pub fn new(relay_url: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            room: room.into(),
            channel_addr: None,
            user: None,
            batch_window: BATCH_WINDOW,
        }
    }
}

/// Events surfaced to the consumer (the editing surface).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A remote update was merged into the document.
    RemoteUpdate(Vec<u8>),
    /// A remote typed operation was applied to the document.
    RemoteEdit(Op),
    /// Peer cursors changed.
    AwarenessChange(Vec<AwarenessEntry>),
    /// The transport is gone; edits keep accumulating locally.
    Disconnected,
}

/// Session errors.
#[derive(Debug, Clone)]
pub enum SessionError {
    Doc(DocError),
    Transport(TransportError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Doc(e) => write!(f, "document error: {e}"),
            SessionError::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<DocError> for SessionError {
    fn from(e: DocError) -> Self {
        SessionError::Doc(e)
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        SessionError::Transport(e)
    }
}

/// The relay WebSocket transport: a single channel carrying envelopes,
/// with all document traffic as opaque CRDT blobs.
pub struct RelayTransport {
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
    user: Option<String>,
    status_tx: Arc<watch::Sender<ConnectionState>>,
    status_rx: watch::Receiver<ConnectionState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayTransport {
    /// Connect to `url`/`room` and feed inbound traffic to `events`.
    pub async fn connect(
        url: &str,
        room: &str,
        user: Option<String>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        let (status_tx, status_rx) = watch::channel(ConnectionState::Connecting);
        let status_tx = Arc::new(status_tx);

        let full_url = format!("{}/{}", url.trim_end_matches('/'), room);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&full_url)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }));

        let reader_status = status_tx.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match Envelope::decode(&bytes) {
                            Ok(Envelope::Sync(SyncMessage::StateVector(sv))) => {
                                if events.send(TransportEvent::StateVector(sv)).is_err() {
                                    return;
                                }
                            }
                            Ok(Envelope::Sync(SyncMessage::Diff(update)))
                            | Ok(Envelope::Sync(SyncMessage::Update(update))) => {
                                if events.send(TransportEvent::Update(update)).is_err() {
                                    return;
                                }
                            }
                            Ok(Envelope::Awareness(payload)) => match decode_entries(&payload) {
                                Ok(entries) => {
                                    if events.send(TransportEvent::Awareness(entries)).is_err() {
                                        return;
                                    }
                                }
                                Err(e) => log::warn!("bad awareness payload: {e}"),
                            },
                            Err(e) => log::warn!("dropping malformed relay message: {e}"),
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            let _ = reader_status.send(ConnectionState::Disconnected);
            let _ = events.send(TransportEvent::Closed);
        }));

        let _ = status_tx.send(ConnectionState::Connected);
        log::info!("relay transport connected to {full_url}");

        Ok(Self {
            out_tx,
            user,
            status_tx,
            status_rx,
            tasks: Mutex::new(tasks),
        })
    }

    fn send_envelope(&self, env: Envelope) -> Result<(), TransportError> {
        self.out_tx
            .send(env.encode())
            .map_err(|_| TransportError::ChannelClosed)
    }
}

impl Transport for RelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn send_update(&self, update: &[u8]) -> Result<(), TransportError> {
        self.send_envelope(Envelope::Sync(SyncMessage::Update(update.to_vec())))
    }

    fn send_state_vector(&self, sv: &[u8]) -> Result<(), TransportError> {
        self.send_envelope(Envelope::Sync(SyncMessage::StateVector(sv.to_vec())))
    }

    fn send_diff(&self, diff: &[u8]) -> Result<(), TransportError> {
        self.send_envelope(Envelope::Sync(SyncMessage::Diff(diff.to_vec())))
    }

    fn send_awareness(&self, client_id: u16, state: CursorState) -> Result<(), TransportError> {
        let entry = AwarenessEntry::new(client_id, state, self.user.clone());
        self.send_envelope(Envelope::Awareness(encode_entries(std::slice::from_ref(
            &entry,
        ))))
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

/// A connected editing session on one room.
pub struct CollabSession {
    doc: Arc<SharedDocument>,
    transport: Arc<dyn Transport>,
    compressor: Arc<Mutex<DeltaCompressor>>,
    deadline_tx: watch::Sender<Option<Instant>>,
    awareness: Arc<Mutex<AwarenessRegistry>>,
    client_id: u16,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CollabSession {
    /// Connect, preferring the channel strategy and falling back to the
    /// relay when channel establishment fails.
    pub async fn connect(config: SessionConfig) -> Result<CollabSession, SessionError> {
        let client_id = (Uuid::new_v4().as_u128() & 0xffff) as u16;
        let doc = Arc::new(SharedDocument::new());
        let mut bridge = UpdateBridge::attach(&doc)?;

        let (transport_tx, mut transport_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let transport: Arc<dyn Transport> = match &config.channel_addr {
            Some(addr) => {
                let channel_config = ChannelConfig {
                    addr: addr.clone(),
                    room: config.room.clone(),
                    client_id,
                };
                match ChannelTransport::connect(channel_config, transport_tx.clone()).await {
                    Ok(t) => Arc::new(t),
                    Err(e) => {
                        log::warn!("channel transport unavailable ({e}); falling back to relay");
                        Arc::new(
                            RelayTransport::connect(
                                &config.relay_url,
                                &config.room,
                                config.user.clone(),
                                transport_tx.clone(),
                            )
                            .await?,
                        )
                    }
                }
            }
            None => Arc::new(
                RelayTransport::connect(
                    &config.relay_url,
                    &config.room,
                    config.user.clone(),
                    transport_tx.clone(),
                )
                .await?,
            ),
        };

        // Ask for whatever we are missing (a no-op on the channel path)
        // and announce our presence.
        if let Err(e) = transport.send_state_vector(&doc.state_vector()) {
            log::warn!("initial sync request not sent: {e}");
        }
        if let Err(e) = transport.send_awareness(client_id, CursorState::default()) {
            log::debug!("initial awareness not sent: {e}");
        }

        let compressor = Arc::new(Mutex::new(DeltaCompressor::with_window(
            config.batch_window,
        )));
        let awareness = Arc::new(Mutex::new(AwarenessRegistry::new()));
        let (deadline_tx, deadline_rx) = watch::channel(None::<Instant>);
        let (session_tx, session_rx) = mpsc::unbounded_channel::<SessionEvent>();
        let mut tasks = Vec::new();

        // Inbound pump: apply remote traffic, surface consumer events.
        {
            let doc = doc.clone();
            let transport = transport.clone();
            let awareness = awareness.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = transport_rx.recv().await {
                    match event {
                        TransportEvent::Update(update) => {
                            match doc.apply_remote_update(&update) {
                                Ok(true) => {
                                    let _ = session_tx.send(SessionEvent::RemoteUpdate(update));
                                }
                                Ok(false) => {}
                                Err(e) => log::warn!("skipping corrupt remote update: {e}"),
                            }
                        }
                        TransportEvent::Edit(op) => match doc.apply_remote_op(&op) {
                            Ok(()) => {
                                let _ = session_tx.send(SessionEvent::RemoteEdit(op));
                            }
                            Err(e) => log::warn!("skipping remote op: {e}"),
                        },
                        TransportEvent::StateVector(sv) => match doc.diff(&sv) {
                            Ok(diff) => {
                                if let Err(e) = transport.send_diff(&diff) {
                                    log::warn!("sync diff not sent: {e}");
                                }
                            }
                            Err(e) => log::warn!("bad peer state vector: {e}"),
                        },
                        TransportEvent::Awareness(entries) => {
                            let changed = {
                                let mut reg =
                                    awareness.lock().unwrap_or_else(|p| p.into_inner());
                                reg.apply(&entries)
                            };
                            if !changed.is_empty() {
                                let _ = session_tx.send(SessionEvent::AwarenessChange(changed));
                            }
                        }
                        TransportEvent::Closed => {
                            let _ = session_tx.send(SessionEvent::Disconnected);
                            break;
                        }
                    }
                }
            }));
        }

        // Outbound pump: the bridge hands us every local update the
        // transport should carry.
        {
            let transport = transport.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(update) = bridge.next_update().await {
                    if let Err(e) = transport.send_update(&update) {
                        // The edit stays committed locally and re-syncs on
                        // reconnection.
                        log::warn!("outbound update not sent: {e}");
                    }
                }
            }));
        }

        // Flusher: closes the compressor's batching window.
        if transport.edits_supported() {
            let compressor = compressor.clone();
            let transport = transport.clone();
            let mut deadline_rx = deadline_rx;
            tasks.push(tokio::spawn(async move {
                let mut pending: Option<Instant> = None;
                loop {
                    match pending {
                        None => {
                            if deadline_rx.changed().await.is_err() {
                                break;
                            }
                            pending = *deadline_rx.borrow();
                        }
                        Some(deadline) => {
                            tokio::select! {
                                _ = tokio::time::sleep_until(deadline) => {
                                    let (op, next) = {
                                        let mut c = compressor
                                            .lock()
                                            .unwrap_or_else(|p| p.into_inner());
                                        (c.flush_due(deadline), c.deadline())
                                    };
                                    if let Some(op) = op {
                                        if let Err(e) = transport.send_edit(&op) {
                                            log::warn!("batched insert not sent: {e}");
                                        }
                                    }
                                    pending = next;
                                }
                                changed = deadline_rx.changed() => {
                                    if changed.is_err() {
                                        break;
                                    }
                                    pending = *deadline_rx.borrow();
                                }
                            }
                        }
                    }
                }
            }));
        }

        Ok(CollabSession {
            doc,
            transport,
            compressor,
            deadline_tx,
            awareness,
            client_id,
            events: Some(session_rx),
            tasks: Mutex::new(tasks),
        })
    }

    /// Take the consumer event stream. Can only be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.take()
    }

    /// Connection status stream.
    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.transport.status()
    }

    /// Which strategy this session ended up on.
    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn client_id(&self) -> u16 {
        self.client_id
    }

    /// The shared document replica.
    pub fn document(&self) -> Arc<SharedDocument> {
        self.doc.clone()
    }

    /// Current document text.
    pub fn contents(&self) -> String {
        self.doc.contents()
    }

    /// Apply a local insert and propagate it.
    ///
    /// On the channel strategy every edit travels typed, so the peers'
    /// documents are built from the same operation stream; oversized
    /// payloads are split at character boundaries.
    pub fn insert(&self, pos: u32, text: &str) -> Result<(), SessionError> {
        if self.transport.edits_supported() {
            self.doc
                .with_forwarding_muted(|| self.doc.insert(pos, text))?;
            let (flushed, deadline) = {
                let mut c = self.compressor.lock().unwrap_or_else(|p| p.into_inner());
                let mut out = Vec::new();
                let mut offset = pos;
                for chunk in chunk_at_char_boundaries(text, MAX_TYPED_SEGMENT) {
                    out.extend(c.push_insert(offset, chunk));
                    offset += chunk.len() as u32;
                }
                (out, c.deadline())
            };
            for op in flushed {
                if let Err(e) = self.transport.send_edit(&op) {
                    log::warn!("typed insert not sent: {e}");
                }
            }
            let _ = self.deadline_tx.send(deadline);
        } else {
            self.doc.insert(pos, text)?;
        }
        Ok(())
    }

    /// Apply a local delete and propagate it.
    pub fn delete(&self, pos: u32, len: u32) -> Result<(), SessionError> {
        if self.transport.edits_supported() {
            self.flush_pending();
            self.doc
                .with_forwarding_muted(|| self.doc.delete(pos, len))?;
            let mut remaining = len;
            while remaining > 0 {
                let step = remaining.min(u16::MAX as u32);
                let op = Op::Delete {
                    pos,
                    len: step as u16,
                };
                if let Err(e) = self.transport.send_edit(&op) {
                    log::warn!("typed delete not sent: {e}");
                }
                remaining -= step;
            }
        } else {
            self.doc.delete(pos, len)?;
        }
        Ok(())
    }

    /// Apply local formatting and propagate it.
    pub fn format(&self, tag: u8, start: u32, end: u32, value: &[u8]) -> Result<(), SessionError> {
        if self.transport.edits_supported() {
            self.flush_pending();
            self.doc
                .with_forwarding_muted(|| self.doc.format(tag, start, end, value))?;
            if value.len() > MAX_TYPED_SEGMENT {
                log::warn!("format value too large for the wire; applied locally only");
                return Ok(());
            }
            let op = Op::Format {
                tag,
                start,
                end,
                value: value.to_vec(),
            };
            if let Err(e) = self.transport.send_edit(&op) {
                log::warn!("typed format not sent: {e}");
            }
        } else {
            self.doc.format(tag, start, end, value)?;
        }
        Ok(())
    }

    /// Merge a caller-provided CRDT update locally and propagate it.
    pub fn send_update(&self, update: &[u8]) -> Result<(), SessionError> {
        self.doc.apply_local_update(update)?;
        self.transport.send_update(update)?;
        Ok(())
    }

    /// Broadcast our cursor state, best-effort.
    pub fn send_awareness(&self, cursor: u32, anchor: u32, head: u32) -> Result<(), SessionError> {
        let state = CursorState {
            cursor,
            anchor,
            head,
        };
        self.transport.send_awareness(self.client_id, state)?;
        Ok(())
    }

    /// Last known peer cursor states.
    pub fn awareness_states(&self) -> Vec<AwarenessEntry> {
        self.awareness
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .snapshot()
    }

    /// Number of inserts waiting in the batching window.
    pub fn pending_batch_ops(&self) -> usize {
        self.compressor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pending_ops()
    }

    /// Disconnect: stops read loops and releases writers. Local edits
    /// stay committed in the document.
    pub fn close(&self) {
        self.flush_pending();
        self.transport.close();
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    fn flush_pending(&self) {
        let op = {
            let mut c = self.compressor.lock().unwrap_or_else(|p| p.into_inner());
            c.flush()
        };
        if let Some(op) = op {
            if let Err(e) = self.transport.send_edit(&op) {
                log::warn!("pending batch not sent: {e}");
            }
        }
        let _ = self.deadline_tx.send(None);
    }
}

/// Split `text` into chunks of at most `max` bytes, never inside a
/// character. Typing-sized input yields a single chunk.
fn chunk_at_char_boundaries(text: &str, max: usize) -> Vec<&str> {
    if text.len() <= max {
        return vec![text];
    }
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > max {
        let mut cut = max;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, tail) = rest.split_at(cut);
        chunks.push(head);
        rest = tail;
    }
    if !rest.is_empty() {
        chunks.push(rest);
    }
    chunks
}
