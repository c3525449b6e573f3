//! End-to-end tests against a real relay on an ephemeral port.

use std::sync::Arc;

use playpen_collab::client::SyncClient;
use playpen_collab::protocol::{MessageType, PeerInfo, SyncMessage};
use playpen_collab::provider::NetworkProvider;
use playpen_collab::server::{ServerConfig, SyncServer};
use playpen_collab::session::{CollabSession, SessionConfig, Workspace};
use playpen_core::{BufferKind, DocumentId, TextPatch};
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

const PAGE: &str = "/relay-test";

async fn start_test_server(max_peers_per_room: usize) -> (String, Arc<SyncServer>) {
    start_test_server_with(max_peers_per_room, 64).await
}

async fn start_test_server_with(
    max_peers_per_room: usize,
    broadcast_capacity: usize,
) -> (String, Arc<SyncServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(SyncServer::new(ServerConfig {
        bind_addr: addr.to_string(),
        max_peers_per_room,
        broadcast_capacity,
    }));
    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.serve(listener).await;
    });
    (format!("ws://{addr}"), server)
}

async fn open(url: &str, workspace: &Workspace, name: &str, text: &str) -> CollabSession {
    let config = SessionConfig {
        server_url: url.to_string(),
        ..SessionConfig::default()
    };
    CollabSession::open_relay(
        workspace.clone(),
        BufferKind::Markup,
        PAGE,
        PeerInfo::new(name),
        text,
        config,
    )
    .await
    .unwrap()
}

/// Drive `session` until `done` holds.
async fn drive_until(session: &mut CollabSession, mut done: impl FnMut(&CollabSession) -> bool) {
    timeout(Duration::from_secs(5), async {
        while !done(session) {
            if session.next_update().await.is_none() {
                panic!("session closed");
            }
        }
    })
    .await
    .expect("condition not reached");
}

async fn drive_for(session: &mut CollabSession, dur: Duration) {
    let _ = timeout(dur, async {
        while session.next_update().await.is_some() {}
    })
    .await;
}

#[tokio::test]
async fn test_late_joiner_receives_relay_state() {
    let (url, server) = start_test_server(10).await;
    let mut alice = open(&url, &Workspace::new(), "Alice", "<p>hello</p>").await;
    drive_until(&mut alice, |s| s.text() == "<p>hello</p>").await;

    let mut bob = open(&url, &Workspace::new(), "Bob", "").await;
    drive_until(&mut bob, |s| s.text() == "<p>hello</p>").await;

    assert_eq!(server.room_count().await, 1);
}

#[tokio::test]
async fn test_concurrent_edits_converge_through_relay() {
    let (url, _server) = start_test_server(10).await;
    let mut alice = open(&url, &Workspace::new(), "Alice", "abc").await;
    drive_until(&mut alice, |s| s.text() == "abc").await;
    let mut bob = open(&url, &Workspace::new(), "Bob", "").await;
    drive_until(&mut bob, |s| s.text() == "abc").await;

    alice.local_edit(&TextPatch::insert(1, "X")).unwrap();
    bob.local_edit(&TextPatch::insert(2, "Y")).unwrap();

    drive_until(&mut alice, |s| s.text() == "aXbYc").await;
    drive_until(&mut bob, |s| s.text() == "aXbYc").await;
}

#[tokio::test]
async fn test_presence_and_withdrawal_through_relay() {
    let (url, _server) = start_test_server(10).await;
    let ws_b = Workspace::new();
    let mut alice = open(&url, &Workspace::new(), "Alice", "<p>").await;
    drive_until(&mut alice, |s| s.text() == "<p>").await;
    let mut bob = open(&url, &ws_b, "Bob", "").await;

    // Alice answers Bob's arrival with her presence.
    drive_for(&mut alice, Duration::from_millis(300)).await;
    let roster = ws_b.clone();
    drive_until(&mut bob, move |_| {
        roster
            .collaborators(BufferKind::Markup)
            .iter()
            .any(|c| c.name == "Alice")
    })
    .await;

    alice.close();
    let roster = ws_b.clone();
    drive_until(&mut bob, move |_| roster.collaborators(BufferKind::Markup).is_empty()).await;
}

#[tokio::test]
async fn test_full_room_refuses_join() {
    let (url, server) = start_test_server(1).await;
    let doc = DocumentId::derive(PAGE, BufferKind::Style);

    let mut first = SyncClient::new(url.clone());
    let mut first_inbound = first.connect(doc, &PeerInfo::new("First")).await.unwrap();
    // Admitted once the relay has answered.
    timeout(Duration::from_secs(2), first_inbound.recv())
        .await
        .unwrap()
        .unwrap();

    let mut second = SyncClient::new(url);
    let mut inbound = second.connect(doc, &PeerInfo::new("Second")).await.unwrap();
    let closed = timeout(Duration::from_secs(2), inbound.recv()).await.unwrap();
    assert!(closed.is_none());
    assert_eq!(server.stats().await.rejected_peers, 1);
}

#[tokio::test]
async fn test_ping_pong() {
    let (url, _server) = start_test_server(10).await;
    let doc = DocumentId::derive(PAGE, BufferKind::Script);
    let info = PeerInfo::new("Pinger");

    let mut client = SyncClient::new(url);
    let mut inbound = client.connect(doc, &info).await.unwrap();
    client.send(&SyncMessage::ping(info.peer_id)).unwrap();

    let pong = timeout(Duration::from_secs(2), async {
        loop {
            let msg = inbound.recv().await.expect("connection closed");
            if msg.msg_type == MessageType::Pong {
                return msg;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(pong.peer_id, Uuid::nil());
}

#[tokio::test]
async fn test_join_answered_with_state_then_request() {
    let (url, _server) = start_test_server(10).await;
    let doc = DocumentId::derive(PAGE, BufferKind::Script);

    let mut client = SyncClient::new(url);
    let mut inbound = client.connect(doc, &PeerInfo::new("Solo")).await.unwrap();

    let first = timeout(Duration::from_secs(2), inbound.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(2), inbound.recv()).await.unwrap().unwrap();
    assert_eq!(first.msg_type, MessageType::SyncStep2);
    assert_eq!(second.msg_type, MessageType::SyncStep1);
    assert_eq!(first.doc_id, doc.as_uuid());
}

#[tokio::test]
async fn test_lagging_peer_recovers_through_relay() {
    let (url, _server) = start_test_server_with(10, 2).await;
    let mut alice = open(&url, &Workspace::new(), "Alice", "a").await;
    drive_until(&mut alice, |s| s.text() == "a").await;
    let mut bob = open(&url, &Workspace::new(), "Bob", "").await;
    drive_until(&mut bob, |s| s.text() == "a").await;

    for _ in 0..50 {
        let end = alice.text().len() as u32;
        alice.local_edit(&TextPatch::insert(end, "z")).unwrap();
    }

    let expected = format!("a{}", "z".repeat(50));
    drive_until(&mut bob, move |s| s.text() == expected).await;
}
