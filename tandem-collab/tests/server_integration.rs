//! WebSocket round trips against a live server.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tandem_collab::{
    ClientMessage, Cursor, ErrorKind, MemoryStore, PresenceKind, ServerConfig, ServerMessage,
    SessionConfig, SyncServer,
};
use tandem_core::{Edit, UserId};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

async fn start_test_server() -> (Arc<SyncServer>, String) {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".into(),
        storage_path: None,
        session: SessionConfig {
            presence_timeout: Duration::from_secs(30),
            idle_close_after: Duration::from_secs(30),
            ..SessionConfig::for_testing()
        },
    };
    let server = Arc::new(SyncServer::with_storage(config, Arc::new(MemoryStore::new())));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let serving = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (server, url)
}

struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    async fn connect(url: &str) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        Self { ws }
    }

    async fn join(url: &str, doc_id: Uuid, user: &str) -> Self {
        let mut client = Self::connect(url).await;
        client
            .send(ClientMessage::Join {
                doc_id,
                user: user.into(),
            })
            .await;
        match client.recv().await {
            ServerMessage::Joined(_) => client,
            other => panic!("expected Joined, got {other:?}"),
        }
    }

    async fn send(&mut self, msg: ClientMessage) {
        let bytes = msg.encode().unwrap();
        self.ws.send(Message::Binary(bytes.into())).await.unwrap();
    }

    async fn recv(&mut self) -> ServerMessage {
        timeout(Duration::from_secs(2), async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        return ServerMessage::decode(&data).unwrap()
                    }
                    Some(Ok(_)) => continue,
                    other => panic!("connection ended: {other:?}"),
                }
            }
        })
        .await
        .expect("server should reply")
    }

    /// Next message that is not a presence update.
    async fn recv_edit(&mut self) -> ServerMessage {
        loop {
            match self.recv().await {
                ServerMessage::Presence(_) => continue,
                other => return other,
            }
        }
    }

    /// True if nothing but presence arrives within `wait`.
    async fn is_quiet(&mut self, wait: Duration) -> bool {
        timeout(wait, self.recv_edit()).await.is_err()
    }
}

#[tokio::test]
async fn test_join_returns_snapshot_and_color() {
    let (server, url) = start_test_server().await;
    let doc_id = Uuid::new_v4();
    server
        .registry()
        .submit_operation(doc_id, Edit::insert(0, "existing"), 0, "seed".into())
        .await
        .unwrap();

    let mut client = TestClient::connect(&url).await;
    client
        .send(ClientMessage::Join {
            doc_id,
            user: "alice".into(),
        })
        .await;

    match client.recv().await {
        ServerMessage::Joined(ack) => {
            assert_eq!(ack.snapshot.text, "existing");
            assert_eq!(ack.snapshot.revision, 1);
            assert!(!ack.palette_exhausted);
            assert_eq!(ack.users.len(), 1);
            assert_eq!(ack.users[0].color, ack.color);
        }
        other => panic!("expected Joined, got {other:?}"),
    }
    assert!(server.stats().total_messages >= 1);
}

#[tokio::test]
async fn test_messages_before_join_are_rejected() {
    let (_server, url) = start_test_server().await;
    let mut client = TestClient::connect(&url).await;

    client.send(ClientMessage::Ping).await;
    assert_eq!(client.recv().await, ServerMessage::Pong);

    client
        .send(ClientMessage::Submit {
            edit: Edit::insert(0, "x"),
            base_revision: 0,
        })
        .await;
    match client.recv().await {
        ServerMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::InvalidRequest),
        other => panic!("expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_garbage_frame_gets_an_error_not_a_disconnect() {
    let (_server, url) = start_test_server().await;
    let mut client = TestClient::connect(&url).await;

    client
        .ws
        .send(Message::Binary(vec![0xFF, 0xFF, 0xFF].into()))
        .await
        .unwrap();
    assert!(matches!(
        client.recv().await,
        ServerMessage::Error {
            kind: ErrorKind::InvalidRequest,
            ..
        }
    ));

    client.send(ClientMessage::Ping).await;
    assert_eq!(client.recv().await, ServerMessage::Pong);
}

#[tokio::test]
async fn test_submit_acks_author_and_reaches_others() {
    let (_server, url) = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let mut alice = TestClient::join(&url, doc_id, "alice").await;
    let mut bob = TestClient::join(&url, doc_id, "bob").await;

    alice
        .send(ClientMessage::Submit {
            edit: Edit::insert(0, "hi"),
            base_revision: 0,
        })
        .await;

    match alice.recv_edit().await {
        ServerMessage::Ack(op) => {
            assert_eq!(op.revision, 1);
            assert_eq!(op.author(), &UserId::from("alice"));
        }
        other => panic!("expected Ack, got {other:?}"),
    }
    match bob.recv_edit().await {
        ServerMessage::Remote(op) => {
            assert_eq!(op.revision, 1);
            assert_eq!(op.edit(), &Edit::insert(0, "hi"));
        }
        other => panic!("expected Remote, got {other:?}"),
    }

    // Alice never hears her own edit as a remote one.
    assert!(alice.is_quiet(Duration::from_millis(100)).await);
}

#[tokio::test]
async fn test_concurrent_inserts_converge() {
    let (server, url) = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let mut alice = TestClient::join(&url, doc_id, "alice").await;
    let mut bob = TestClient::join(&url, doc_id, "bob").await;

    // Both type at the start of the empty document without seeing each other.
    alice
        .send(ClientMessage::Submit {
            edit: Edit::insert(0, "A"),
            base_revision: 0,
        })
        .await;
    bob.send(ClientMessage::Submit {
        edit: Edit::insert(0, "B"),
        base_revision: 0,
    })
    .await;

    let mut acked = 0;
    let mut remote = 0;
    for client in [&mut alice, &mut bob] {
        for _ in 0..2 {
            match client.recv_edit().await {
                ServerMessage::Ack(_) => acked += 1,
                ServerMessage::Remote(_) => remote += 1,
                other => panic!("unexpected {other:?}"),
            }
        }
    }
    assert_eq!((acked, remote), (2, 2));

    let snapshot = server.registry().snapshot(doc_id).await.unwrap();
    assert_eq!(snapshot.text, "AB");
    assert_eq!(snapshot.revision, 2);
}

#[tokio::test]
async fn test_remote_edits_arrive_before_ack() {
    let (_server, url) = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let mut alice = TestClient::join(&url, doc_id, "alice").await;
    let mut bob = TestClient::join(&url, doc_id, "bob").await;

    bob.send(ClientMessage::Submit {
        edit: Edit::insert(0, "first"),
        base_revision: 0,
    })
    .await;
    assert!(matches!(bob.recv_edit().await, ServerMessage::Ack(_)));

    alice
        .send(ClientMessage::Submit {
            edit: Edit::insert(0, "second"),
            base_revision: 0,
        })
        .await;
    match alice.recv_edit().await {
        ServerMessage::Remote(op) => assert_eq!(op.revision, 1),
        other => panic!("expected Remote r1 before Ack, got {other:?}"),
    }
    match alice.recv_edit().await {
        ServerMessage::Ack(op) => assert_eq!(op.revision, 2),
        other => panic!("expected Ack r2, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_base_asks_for_resync() {
    let (_server, url) = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let mut alice = TestClient::join(&url, doc_id, "alice").await;
    let mut bob = TestClient::join(&url, doc_id, "bob").await;

    alice
        .send(ClientMessage::Submit {
            edit: Edit::insert(0, "x"),
            base_revision: 42,
        })
        .await;
    match alice.recv_edit().await {
        ServerMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::Resync),
        other => panic!("expected Error, got {other:?}"),
    }
    assert!(bob.is_quiet(Duration::from_millis(100)).await);

    alice.send(ClientMessage::Snapshot).await;
    match alice.recv_edit().await {
        ServerMessage::Snapshot(snapshot) => assert_eq!(snapshot.revision, 0),
        other => panic!("expected Snapshot, got {other:?}"),
    }
}

#[tokio::test]
async fn test_resync_replays_missed_operations() {
    let (server, url) = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let registry = server.registry();
    for i in 0..3 {
        registry
            .submit_operation(doc_id, Edit::insert(0, "z"), i, "seed".into())
            .await
            .unwrap();
    }

    let mut alice = TestClient::join(&url, doc_id, "alice").await;
    alice.send(ClientMessage::Resync { since: 1 }).await;
    match alice.recv_edit().await {
        ServerMessage::CatchUp(ops) => {
            let revisions: Vec<u64> = ops.iter().map(|op| op.revision).collect();
            assert_eq!(revisions, vec![2, 3]);
        }
        other => panic!("expected CatchUp, got {other:?}"),
    }
}

#[tokio::test]
async fn test_presence_is_shared_with_others() {
    let (_server, url) = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let mut alice = TestClient::join(&url, doc_id, "alice").await;
    let mut bob = TestClient::join(&url, doc_id, "bob").await;

    match alice.recv().await {
        ServerMessage::Presence(delta) => {
            assert_eq!(delta.kind, PresenceKind::Joined);
            assert_eq!(delta.user.user, UserId::from("bob"));
        }
        other => panic!("expected Presence, got {other:?}"),
    }

    bob.send(ClientMessage::Cursor {
        cursor: Cursor::at(0),
        revision: 0,
    })
    .await;
    match alice.recv().await {
        ServerMessage::Presence(delta) => {
            assert_eq!(delta.kind, PresenceKind::Moved);
            assert_eq!(delta.user.user, UserId::from("bob"));
        }
        other => panic!("expected Presence, got {other:?}"),
    }

    drop(bob);
    match alice.recv().await {
        ServerMessage::Presence(delta) => {
            assert_eq!(delta.kind, PresenceKind::Left);
            assert_eq!(delta.user.user, UserId::from("bob"));
        }
        other => panic!("expected Presence, got {other:?}"),
    }
}
