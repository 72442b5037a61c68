//! Room fan-out with backpressure.
//!
//! Each relay room owns one broadcast channel; every connection gets an
//! independent receiver buffering up to `capacity` messages. Messages are
//! pre-encoded `Arc<Vec<u8>>` so a fan-out to N peers never re-serializes,
//! and carry the sender's connection id so receivers can skip their own
//! traffic — the relay never echoes a message back to its sender.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// One fan-out unit: a pre-encoded payload plus its origin connection.
#[derive(Debug, Clone)]
pub struct RoomMessage {
    pub from: Uuid,
    pub bytes: Arc<Vec<u8>>,
}

/// A connection's identity within a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Compact awareness client id announced by the peer, once known.
    pub client_id: Option<u16>,
    pub user: Option<String>,
}

/// Fan-out group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<RoomMessage>,
    members: RwLock<HashMap<Uuid, Member>>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` bounds how many messages a lagging receiver may buffer
    /// before it starts dropping (and gets a `Lagged` error).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Register a connection and hand it a receiver.
    pub async fn join(&self, conn: Uuid, member: Member) -> broadcast::Receiver<RoomMessage> {
        self.members.write().await.insert(conn, member);
        self.sender.subscribe()
    }

    /// Deregister a connection.
    pub async fn leave(&self, conn: &Uuid) -> Option<Member> {
        self.members.write().await.remove(conn)
    }

    /// Record which client id a connection speaks for.
    pub async fn set_client_id(&self, conn: &Uuid, client_id: u16) {
        if let Some(member) = self.members.write().await.get_mut(conn) {
            member.client_id = Some(client_id);
        }
    }

    /// Fan a pre-encoded message out to every receiver. Returns how many
    /// receivers got it; zero receivers is not an error.
    pub fn send(&self, from: Uuid, bytes: Arc<Vec<u8>>) -> usize {
        let count = self
            .sender
            .send(RoomMessage { from, bytes })
            .unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn member(&self, conn: &Uuid) -> Option<Member> {
        self.members.read().await.get(conn).cloned()
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member() -> Member {
        Member {
            client_id: None,
            user: None,
        }
    }

    #[tokio::test]
    async fn join_and_leave_track_membership() {
        let group = BroadcastGroup::new(16);
        let conn = Uuid::new_v4();
        let _rx = group.join(conn, member()).await;
        assert_eq!(group.member_count().await, 1);
        group.leave(&conn).await;
        assert_eq!(group.member_count().await, 0);
    }

    #[tokio::test]
    async fn fan_out_reaches_all_receivers() {
        let group = BroadcastGroup::new(16);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut rx_a = group.join(a, member()).await;
        let mut rx_b = group.join(b, member()).await;

        let sent = group.send(a, Arc::new(vec![1, 2, 3]));
        assert_eq!(sent, 2);

        // Both receive; the sender-side filter happens at the consumer.
        let got_a = rx_a.recv().await.unwrap();
        let got_b = rx_b.recv().await.unwrap();
        assert_eq!(got_a.from, a);
        assert_eq!(*got_b.bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn sender_filter_by_connection_id() {
        let group = BroadcastGroup::new(16);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut rx_a = group.join(a, member()).await;

        group.send(b, Arc::new(vec![9]));
        let msg = rx_a.recv().await.unwrap();
        assert_ne!(msg.from, a, "a's receiver sees b's message");

        group.send(a, Arc::new(vec![8]));
        let own = rx_a.recv().await.unwrap();
        assert_eq!(own.from, a, "a's own message carries a's id to be skipped");
    }

    #[tokio::test]
    async fn client_id_recorded() {
        let group = BroadcastGroup::new(4);
        let conn = Uuid::new_v4();
        let _rx = group.join(conn, member()).await;
        group.set_client_id(&conn, 77).await;
        assert_eq!(group.member(&conn).await.unwrap().client_id, Some(77));
    }

    #[tokio::test]
    async fn stats_count_sends() {
        let group = BroadcastGroup::new(4);
        let conn = Uuid::new_v4();
        let _rx = group.join(conn, member()).await;
        group.send(conn, Arc::new(vec![]));
        group.send(conn, Arc::new(vec![]));
        assert_eq!(group.messages_sent(), 2);
    }
}
