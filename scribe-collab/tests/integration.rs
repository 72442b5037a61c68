//! End-to-end tests for the relay path.
//!
//! These start a real relay server and connect real sessions, verifying
//! convergence, no-echo, catch-up, and room isolation over actual
//! WebSocket connections.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

use scribe_collab::client::{CollabSession, SessionConfig, SessionEvent};
use scribe_collab::server::RelayServer;
use scribe_collab::transport::{ConnectionState, TransportKind};

/// Start a relay server on an ephemeral port; returns its ws:// URL and a
/// handle for inspecting room state.
async fn start_relay() -> (String, Arc<RelayServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(RelayServer::with_defaults());
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (format!("ws://{addr}"), server)
}

async fn connect(url: &str, room: &str) -> CollabSession {
    CollabSession::connect(SessionConfig::new(url, room))
        .await
        .expect("session should connect")
}

/// Poll until `f` holds or the deadline passes.
async fn wait_until(deadline: Duration, f: impl Fn() -> bool) -> bool {
    let step = Duration::from_millis(20);
    let mut waited = Duration::ZERO;
    while waited < deadline {
        if f() {
            return true;
        }
        sleep(step).await;
        waited += step;
    }
    f()
}

#[tokio::test]
async fn session_connects_over_relay() {
    let (url, _server) = start_relay().await;
    let session = connect(&url, "basics").await;
    assert_eq!(session.transport_kind(), TransportKind::Relay);
    assert_eq!(*session.status().borrow(), ConnectionState::Connected);
    session.close();
}

#[tokio::test]
async fn update_reaches_other_client() {
    let (url, _server) = start_relay().await;
    let a = connect(&url, "doc-1").await;
    let mut b = connect(&url, "doc-1").await;
    let mut events_b = b.take_events().unwrap();

    a.insert(0, "Hello").unwrap();

    let event = timeout(Duration::from_secs(2), async {
        loop {
            match events_b.recv().await {
                Some(SessionEvent::RemoteUpdate(update)) => break update,
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    })
    .await
    .expect("b should receive the update");
    assert!(!event.is_empty());
    assert_eq!(b.contents(), "Hello");

    a.close();
    b.close();
}

#[tokio::test]
async fn relay_never_echoes_to_sender() {
    let (url, _server) = start_relay().await;
    let mut a = connect(&url, "no-echo").await;
    let b = connect(&url, "no-echo").await;
    let mut events_a = a.take_events().unwrap();

    a.insert(0, "mine").unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || b.contents() == "mine").await,
        "b should converge"
    );

    // a must not see its own update come back.
    let echoed = timeout(Duration::from_millis(300), async {
        loop {
            match events_a.recv().await {
                Some(SessionEvent::RemoteUpdate(_)) => break true,
                Some(_) => continue,
                None => break false,
            }
        }
    })
    .await;
    assert!(echoed.is_err(), "no RemoteUpdate should arrive at the sender");

    a.close();
    b.close();
}

#[tokio::test]
async fn concurrent_edits_converge() {
    let (url, _server) = start_relay().await;
    let a = connect(&url, "merge").await;
    let b = connect(&url, "merge").await;

    // Concurrent edits from both replicas.
    a.insert(0, "Hello").unwrap();
    b.insert(0, " World").unwrap();

    let converged = wait_until(Duration::from_secs(3), || {
        let ca = a.contents();
        let cb = b.contents();
        !ca.is_empty() && ca == cb && ca.len() == "Hello World".len()
    })
    .await;
    assert!(
        converged,
        "replicas diverged: a={:?} b={:?}",
        a.contents(),
        b.contents()
    );
    let merged = a.contents();
    assert!(merged.contains("Hello"));
    assert!(merged.contains(" World"));

    a.close();
    b.close();
}

#[tokio::test]
async fn late_joiner_catches_up() {
    let (url, _server) = start_relay().await;
    let a = connect(&url, "history").await;
    a.insert(0, "written before b existed").unwrap();
    // Give the relay time to fold the update into the room doc.
    sleep(Duration::from_millis(150)).await;

    let b = connect(&url, "history").await;
    assert!(
        wait_until(Duration::from_secs(2), || {
            b.contents() == "written before b existed"
        })
        .await,
        "late joiner should receive history, got {:?}",
        b.contents()
    );

    a.close();
    b.close();
}

#[tokio::test]
async fn awareness_reaches_peers_with_exact_fields() {
    let (url, _server) = start_relay().await;
    let a = connect(&url, "cursors").await;
    let mut b = connect(&url, "cursors").await;
    let mut events_b = b.take_events().unwrap();
    sleep(Duration::from_millis(100)).await;

    a.send_awareness(10, 5, 15).unwrap();

    let entry = timeout(Duration::from_secs(2), async {
        loop {
            match events_b.recv().await {
                Some(SessionEvent::AwarenessChange(entries)) => {
                    if let Some(e) = entries
                        .iter()
                        .find(|e| e.client_id == a.client_id() && e.cursor == 10)
                    {
                        break e.clone();
                    }
                }
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    })
    .await
    .expect("b should observe a's cursor");
    assert_eq!(entry.cursor, 10);
    assert_eq!(entry.anchor, 5);
    assert_eq!(entry.head, 15);

    a.close();
    b.close();
}

#[tokio::test]
async fn rooms_are_isolated() {
    let (url, _server) = start_relay().await;
    let a = connect(&url, "room-a").await;
    let mut b = connect(&url, "room-b").await;
    let mut events_b = b.take_events().unwrap();

    a.insert(0, "private").unwrap();

    let leaked = timeout(Duration::from_millis(400), async {
        loop {
            match events_b.recv().await {
                Some(SessionEvent::RemoteUpdate(_)) => break true,
                Some(_) => continue,
                None => break false,
            }
        }
    })
    .await;
    assert!(leaked.is_err(), "update crossed room boundaries");
    assert_eq!(b.contents(), "");

    a.close();
    b.close();
}

#[tokio::test]
async fn room_destroyed_when_last_connection_leaves() {
    let (url, server) = start_relay().await;
    let a = connect(&url, "ephemeral").await;
    let b = connect(&url, "ephemeral").await;

    let mut created = false;
    for _ in 0..100 {
        if server.room_count().await == 1 {
            created = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(created, "room should exist while members are connected");

    a.close();
    b.close();

    let mut evicted = false;
    for _ in 0..100 {
        if server.room_count().await == 0 {
            evicted = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(evicted, "room should be destroyed with its last member");
}
