//! WebSocket transport in front of the document registry.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── DocumentSession (doc 1) ──┐
//!            ├── handle_connection ─┤                             ├── DocumentStorage
//! Client B ──┘         │            └── DocumentSession (doc 2) ──┘   (RocksDB / memory)
//!                      │                      │
//!                      └──◄── broadcast ──────┘
//! ```
//!
//! One connection carries one user in one document. The connection forwards
//! committed operations and presence changes from the document's broadcast
//! group, skipping its own echoes, and acknowledges its own submissions in
//! commit order relative to everything it forwards.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapters 5 & 8

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use tandem_core::{Revision, UserId};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::broadcast::DocumentEvent;
use crate::error::SessionError;
use crate::presence::{PresenceError, PresenceKind};
use crate::protocol::{ClientMessage, ErrorKind, ProtocolError, ServerMessage};
use crate::registry::DocumentRegistry;
use crate::session::SessionConfig;
use crate::storage::{DocumentStorage, DocumentStore, MemoryStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Per-document session tuning
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            session: SessionConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Server statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<DocumentRegistry>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Open the configured storage and build the server.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let storage: Arc<dyn DocumentStorage> = match &config.storage_path {
            Some(path) => {
                let store = DocumentStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                log::info!(
                    "{} documents in storage at {}",
                    store.list_documents()?.len(),
                    path.display()
                );
                Arc::new(store)
            }
            None => {
                log::info!("No storage path configured; documents live in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::with_storage(config, storage))
    }

    /// Build the server on an existing storage backend.
    pub fn with_storage(config: ServerConfig, storage: Arc<dyn DocumentStorage>) -> Self {
        let registry = Arc::new(DocumentRegistry::new(storage, config.session.clone()));
        Self {
            config,
            registry,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Bind the configured address and serve until an accept error.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = Arc::clone(&self.registry);
            let stats = Arc::clone(&self.stats);
            tokio::spawn(async move {
                stats.total_connections.fetch_add(1, Ordering::Relaxed);
                stats.active_connections.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = handle_connection(stream, addr, &registry, &stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
                stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    /// Close every open document, flushing it to storage.
    pub async fn shutdown(&self) {
        self.registry.close_all().await;
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
        }
    }
}

/// A user joined to a document over one connection.
struct Membership {
    doc_id: Uuid,
    user: UserId,
    events: broadcast::Receiver<Arc<DocumentEvent>>,
    /// Highest revision already delivered to the client.
    seen: Revision,
    /// The inactivity sweep removed this user; the next edit or cursor
    /// update joins them again.
    evicted: bool,
}

impl Membership {
    /// Translate a document event for this client, or skip it.
    fn forward(&mut self, event: &DocumentEvent) -> Option<ServerMessage> {
        match event {
            DocumentEvent::Committed(op) => {
                if op.revision <= self.seen {
                    return None;
                }
                self.seen = op.revision;
                event
                    .is_visible_to(&self.user)
                    .then(|| ServerMessage::Remote(op.clone()))
            }
            DocumentEvent::Presence(delta) => {
                if delta.kind == PresenceKind::Evicted && delta.user.user == self.user {
                    self.evicted = true;
                }
                event
                    .is_visible_to(&self.user)
                    .then(|| ServerMessage::Presence(delta.clone()))
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: &DocumentRegistry,
    stats: &AtomicServerStats,
) -> Result<(), ServerError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    let mut member: Option<Membership> = None;

    let result: Result<(), ServerError> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        stats.total_messages.fetch_add(1, Ordering::Relaxed);
                        stats.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                        match ClientMessage::decode(&data) {
                            Ok(msg) => {
                                handle_message(msg, registry, &mut member, &mut ws_sender).await?
                            }
                            Err(e) => {
                                log::warn!("Failed to decode message from {addr}: {e}");
                                send(&mut ws_sender, &ServerMessage::protocol_error(&e)).await?;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                },

                event = async {
                    match member.as_mut() {
                        Some(m) => m.events.recv().await,
                        None => std::future::pending().await,
                    }
                } => match event {
                    Ok(event) => {
                        let forwarded = member.as_mut().and_then(|m| m.forward(&event));
                        if let Some(msg) = forwarded {
                            send(&mut ws_sender, &msg).await?;
                        }
                    }
                    Err(err) => lost_events(err, &mut member, &mut ws_sender).await?,
                },
            }
        }
        Ok(())
    }
    .await;

    if let Some(m) = member {
        if let Err(e) = registry.leave_document(m.doc_id, m.user.clone()).await {
            log::warn!("Failed to leave {} for {}: {e}", m.doc_id, m.user);
        }
    }
    result
}

async fn handle_message<S>(
    msg: ClientMessage,
    registry: &DocumentRegistry,
    member: &mut Option<Membership>,
    sink: &mut S,
) -> Result<(), ServerError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let reply = match member.as_mut() {
        None => match msg {
            ClientMessage::Ping => ServerMessage::Pong,
            ClientMessage::Join { doc_id, user } => {
                match registry.subscribe_and_join(doc_id, user.clone()).await {
                    Ok((ack, events)) => {
                        *member = Some(Membership {
                            doc_id,
                            user,
                            events,
                            seen: ack.snapshot.revision,
                            evicted: false,
                        });
                        ServerMessage::Joined(ack)
                    }
                    Err(e) => ServerMessage::error(&e),
                }
            }
            _ => ServerMessage::protocol_error(&ProtocolError::Unexpected("join first")),
        },

        Some(m) => match msg {
            ClientMessage::Ping => ServerMessage::Pong,
            ClientMessage::Join { .. } => {
                ServerMessage::protocol_error(&ProtocolError::Unexpected("already joined"))
            }
            ClientMessage::Leave => {
                if let Err(e) = registry.leave_document(m.doc_id, m.user.clone()).await {
                    log::warn!("Failed to leave {} for {}: {e}", m.doc_id, m.user);
                }
                *member = None;
                return Ok(());
            }
            ClientMessage::Submit {
                edit,
                base_revision,
            } => {
                if m.evicted {
                    rejoin(m, registry, sink).await?;
                }
                match registry
                    .submit_operation(m.doc_id, edit, base_revision, m.user.clone())
                    .await
                {
                    Ok(committed) => {
                        // Everything committed before this operation goes out first.
                        let mut closed = false;
                        while m.seen < committed.revision {
                            match m.events.recv().await {
                                Ok(event) => {
                                    if let Some(msg) = m.forward(&event) {
                                        send(sink, &msg).await?;
                                    }
                                }
                                Err(RecvError::Lagged(n)) => send(sink, &missed_events(n)).await?,
                                Err(RecvError::Closed) => {
                                    closed = true;
                                    break;
                                }
                            }
                        }
                        m.seen = m.seen.max(committed.revision);
                        if closed {
                            lost_events(RecvError::Closed, member, sink).await?;
                        } else if m.evicted {
                            // The sweep ran between our last activity and this commit.
                            rejoin(m, registry, sink).await?;
                        }
                        ServerMessage::Ack(committed)
                    }
                    Err(e) => ServerMessage::error(&e),
                }
            }
            ClientMessage::Cursor { cursor, revision } => {
                if m.evicted {
                    rejoin(m, registry, sink).await?;
                }
                let mut result = registry
                    .update_cursor(m.doc_id, m.user.clone(), cursor, revision)
                    .await;
                if let Err(SessionError::Presence(PresenceError::UnknownUser(_))) = result {
                    // Evicted before this connection saw the eviction event.
                    if rejoin(m, registry, sink).await? {
                        result = registry
                            .update_cursor(m.doc_id, m.user.clone(), cursor, revision)
                            .await;
                    }
                }
                match result {
                    Ok(_) => return Ok(()),
                    Err(e) => ServerMessage::error(&e),
                }
            }
            ClientMessage::Resync { since } => {
                match registry.operations_since(m.doc_id, since).await {
                    Ok(operations) => {
                        if let Some(last) = operations.last() {
                            m.seen = m.seen.max(last.revision);
                        }
                        ServerMessage::CatchUp(operations)
                    }
                    Err(e) => ServerMessage::error(&e),
                }
            }
            ClientMessage::Snapshot => match registry.snapshot(m.doc_id).await {
                Ok(snapshot) => {
                    m.seen = m.seen.max(snapshot.revision);
                    ServerMessage::Snapshot(snapshot)
                }
                Err(e) => ServerMessage::error(&e),
            },
        },
    };

    send(sink, &reply).await
}

/// Join the document again after an eviction.
///
/// Takes a fresh subscription, since the session may have been closed and
/// reopened while the user was away. Whatever the old subscription still
/// holds is forwarded first. Returns whether the user is present again.
async fn rejoin<S>(
    m: &mut Membership,
    registry: &DocumentRegistry,
    sink: &mut S,
) -> Result<bool, ServerError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    log::debug!("Rejoining {} to {} after eviction", m.user, m.doc_id);
    let (ack, events) = match registry.subscribe_and_join(m.doc_id, m.user.clone()).await {
        Ok(joined) => joined,
        Err(e) => {
            log::warn!("Failed to rejoin {} to {}: {e}", m.user, m.doc_id);
            send(sink, &ServerMessage::error(&e)).await?;
            return Ok(false);
        }
    };

    let mut reopened = false;
    loop {
        match m.events.try_recv() {
            Ok(event) => {
                if let Some(msg) = m.forward(&event) {
                    send(sink, &msg).await?;
                }
            }
            Err(TryRecvError::Lagged(n)) => send(sink, &missed_events(n)).await?,
            Err(TryRecvError::Closed) => {
                reopened = true;
                break;
            }
            Err(TryRecvError::Empty) => break,
        }
    }

    let revision = ack.snapshot.revision;
    if reopened && revision != m.seen {
        send(
            sink,
            &ServerMessage::Error {
                kind: ErrorKind::Resync,
                message: format!("document reopened at revision {revision}, client saw {}", m.seen),
            },
        )
        .await?;
        m.seen = revision;
    } else {
        m.seen = m.seen.max(revision);
    }
    m.events = events;
    m.evicted = false;
    Ok(true)
}

fn missed_events(n: u64) -> ServerMessage {
    log::warn!("Connection lagged by {n} events");
    ServerMessage::Error {
        kind: ErrorKind::Resync,
        message: format!("missed {n} events"),
    }
}

/// The connection can no longer guarantee gapless delivery.
async fn lost_events<S>(
    err: RecvError,
    member: &mut Option<Membership>,
    sink: &mut S,
) -> Result<(), ServerError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let msg = match err {
        RecvError::Lagged(n) => missed_events(n),
        RecvError::Closed => {
            // The session stopped; the client has to join again.
            *member = None;
            ServerMessage::Error {
                kind: ErrorKind::Unavailable,
                message: "document session ended".to_string(),
            }
        }
    };
    send(sink, &msg).await
}

async fn send<S>(sink: &mut S, msg: &ServerMessage) -> Result<(), ServerError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let encoded = msg.encode()?;
    sink.send(Message::Binary(encoded.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tandem_core::Edit;

    use crate::presence::Cursor;

    /// Decodes everything a connection would have written to the socket.
    #[derive(Default)]
    struct Outbox(Vec<ServerMessage>);

    impl Sink<Message> for Outbox {
        type Error = tungstenite::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            if let Message::Binary(data) = item {
                self.0.push(ServerMessage::decode(&data).unwrap());
            }
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    fn registry(session: SessionConfig) -> DocumentRegistry {
        DocumentRegistry::new(Arc::new(MemoryStore::new()), session)
    }

    async fn join(
        registry: &DocumentRegistry,
        doc_id: Uuid,
        user: &str,
        outbox: &mut Outbox,
    ) -> Option<Membership> {
        let mut member = None;
        handle_message(
            ClientMessage::Join {
                doc_id,
                user: user.into(),
            },
            registry,
            &mut member,
            outbox,
        )
        .await
        .unwrap();
        assert!(member.is_some());
        member
    }

    async fn present(registry: &DocumentRegistry, doc_id: Uuid) -> Vec<UserId> {
        registry
            .active_users(doc_id)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.user)
            .collect()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert!(config.storage_path.is_none());
        assert_eq!(config.session.persist_batch_size, 64);
    }

    #[tokio::test]
    async fn test_server_with_rocks_storage() {
        let dir = tempfile::TempDir::new().unwrap();
        let server = SyncServer::new(ServerConfig {
            storage_path: Some(dir.path().to_path_buf()),
            ..ServerConfig::default()
        })
        .unwrap();
        assert_eq!(server.stats(), ServerStats::default());
        assert_eq!(server.registry().document_count().await, 0);
    }

    #[tokio::test]
    async fn test_lag_before_own_commit_is_reported_ahead_of_ack() {
        let registry = registry(SessionConfig {
            broadcast_capacity: 2,
            presence_timeout: Duration::from_secs(30),
            idle_close_after: Duration::from_secs(30),
            ..SessionConfig::for_testing()
        });
        let doc_id = Uuid::new_v4();
        let mut outbox = Outbox::default();
        let mut member = join(&registry, doc_id, "bob", &mut outbox).await;

        // Five commits overflow bob's two-slot subscription.
        for base in 0..5 {
            registry
                .submit_operation(doc_id, Edit::insert(0, "a"), base, "alice".into())
                .await
                .unwrap();
        }
        outbox.0.clear();

        handle_message(
            ClientMessage::Submit {
                edit: Edit::insert(0, "b"),
                base_revision: 5,
            },
            &registry,
            &mut member,
            &mut outbox,
        )
        .await
        .unwrap();

        assert!(matches!(
            outbox.0.first(),
            Some(ServerMessage::Error {
                kind: ErrorKind::Resync,
                ..
            })
        ));
        match outbox.0.last() {
            Some(ServerMessage::Ack(op)) => assert_eq!(op.revision, 6),
            other => panic!("expected ack, got {other:?}"),
        }
        let forwarded = outbox
            .0
            .iter()
            .filter(|m| matches!(m, ServerMessage::Remote(_)))
            .count();
        assert!(forwarded < 5);
        assert_eq!(member.as_ref().map(|m| m.seen), Some(6));
    }

    #[tokio::test]
    async fn test_edit_after_eviction_rejoins_author() {
        let registry = registry(SessionConfig {
            presence_timeout: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(10),
            idle_close_after: Duration::from_secs(30),
            ..SessionConfig::for_testing()
        });
        let doc_id = Uuid::new_v4();
        let mut outbox = Outbox::default();
        let mut member = join(&registry, doc_id, "bob", &mut outbox).await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while !present(&registry, doc_id).await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("bob was never evicted");

        handle_message(
            ClientMessage::Submit {
                edit: Edit::insert(0, "back"),
                base_revision: 0,
            },
            &registry,
            &mut member,
            &mut outbox,
        )
        .await
        .unwrap();

        assert!(matches!(outbox.0.last(), Some(ServerMessage::Ack(op)) if op.revision == 1));
        assert_eq!(present(&registry, doc_id).await, vec![UserId::from("bob")]);
        assert!(member.as_ref().is_some_and(|m| !m.evicted));
    }

    #[tokio::test]
    async fn test_cursor_after_document_reopened_resubscribes() {
        let registry = registry(SessionConfig {
            presence_timeout: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(10),
            idle_close_after: Duration::from_millis(20),
            ..SessionConfig::for_testing()
        });
        let doc_id = Uuid::new_v4();
        let mut outbox = Outbox::default();
        let mut member = join(&registry, doc_id, "bob", &mut outbox).await;

        // Eviction empties the document, which then closes.
        tokio::time::timeout(Duration::from_secs(2), async {
            while registry.document_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("document never closed");

        handle_message(
            ClientMessage::Cursor {
                cursor: Cursor::at(0),
                revision: 0,
            },
            &registry,
            &mut member,
            &mut outbox,
        )
        .await
        .unwrap();
        assert_eq!(present(&registry, doc_id).await, vec![UserId::from("bob")]);

        registry
            .submit_operation(doc_id, Edit::insert(0, "hi"), 0, "alice".into())
            .await
            .unwrap();

        // The commit reaches bob through the reopened session's group.
        let m = member.as_mut().unwrap();
        let revision = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match m.events.recv().await.unwrap().as_ref() {
                    DocumentEvent::Committed(op) => break op.revision,
                    DocumentEvent::Presence(_) => {}
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(revision, 1);
    }
}
