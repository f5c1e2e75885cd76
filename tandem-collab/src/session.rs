//! Per-document session actor.
//!
//! ```text
//!   DocumentHandle ──mpsc──►┌────────────────────────────────────┐
//!   DocumentHandle ──mpsc──►│ DocumentSession (one tokio task)   │
//!        ▲                  │  Document (text + revision log)    │
//!        │ oneshot replies  │  PresenceTable                     │
//!        └──────────────────│  select! { command, sweep, idle }  │
//!                           └──────┬──────────────────┬──────────┘
//!                                  │ broadcast         │ persist (no await)
//!                                  ▼                   ▼
//!                           BroadcastGroup      PersistenceWriter
//! ```
//!
//! The task exclusively owns the document, its log and its presence table.
//! Commands are handled strictly one at a time in arrival order, and that
//! order is the commit order. Nothing inside command handling awaits I/O.
//!
//! Lifecycle: the task loads the document from storage when spawned. When
//! the last user leaves (or is evicted) an idle deadline is armed; a join
//! disarms it. On expiry, or on an explicit close, the session stops taking
//! commands, answers anything still queued with `DocumentClosed`, flushes
//! persistence, saves a snapshot and removes itself from the registry.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tandem_core::{
    CommittedOperation, Document, DocumentError, ErrorClass, Operation, Revision, Snapshot,
    UserId,
};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, DocumentEvent};
use crate::error::SessionError;
use crate::presence::{
    Cursor, CursorColor, PresenceDelta, PresenceError, PresenceKind, PresenceTable,
    UserPresence, DEFAULT_PALETTE,
};
use crate::storage::{DocumentStorage, PersistenceWriter, StoreError};

/// Registry map a session removes itself from when it stops.
pub(crate) type RegistryMap = RwLock<HashMap<Uuid, DocumentHandle>>;

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Commands buffered per document before senders wait (default: 256)
    pub command_capacity: usize,
    /// Events a subscriber may fall behind before lagging (default: 1024)
    pub broadcast_capacity: usize,
    /// Inactivity after which a user is evicted (default: 60s)
    pub presence_timeout: Duration,
    /// How often the presence table is swept (default: 5s)
    pub sweep_interval: Duration,
    /// How long an empty document stays open (default: 30s)
    pub idle_close_after: Duration,
    /// Max committed operations per storage write (default: 64)
    pub persist_batch_size: usize,
    /// Delay before retrying a failed storage write (default: 500ms)
    pub persist_retry_delay: Duration,
    /// Cursor colors, assigned in order (default: [`DEFAULT_PALETTE`])
    pub palette: Vec<CursorColor>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_capacity: 256,
            broadcast_capacity: 1024,
            presence_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
            idle_close_after: Duration::from_secs(30),
            persist_batch_size: 64,
            persist_retry_delay: Duration::from_millis(500),
            palette: DEFAULT_PALETTE.to_vec(),
        }
    }
}

impl SessionConfig {
    /// Short timers so lifecycle tests finish quickly.
    pub fn for_testing() -> Self {
        Self {
            command_capacity: 64,
            broadcast_capacity: 256,
            presence_timeout: Duration::from_millis(200),
            sweep_interval: Duration::from_millis(25),
            idle_close_after: Duration::from_millis(150),
            persist_batch_size: 8,
            persist_retry_delay: Duration::from_millis(10),
            palette: DEFAULT_PALETTE.to_vec(),
        }
    }
}

/// Reply to a successful join: everything a client needs to start editing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinAck {
    pub color: CursorColor,
    /// Every palette color was taken; `color` is shared with someone else.
    pub palette_exhausted: bool,
    pub snapshot: Snapshot,
    /// Everyone present after the join, the joiner included.
    pub users: Vec<UserPresence>,
}

/// Counters reported by [`DocumentHandle::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub revision: Revision,
    /// Highest revision known to be in durable storage.
    pub durable_revision: Revision,
    pub commits: u64,
    /// Submissions rejected as invalid by the client's fault.
    pub rejected: u64,
    pub integrity_faults: u64,
    pub evictions: u64,
    pub active_users: usize,
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    Submit {
        operation: Operation,
        reply: Reply<CommittedOperation>,
    },
    Join {
        user: UserId,
        reply: Reply<JoinAck>,
    },
    Leave {
        user: UserId,
        reply: Reply<bool>,
    },
    UpdateCursor {
        user: UserId,
        cursor: Cursor,
        revision: Revision,
        reply: Reply<UserPresence>,
    },
    Snapshot {
        reply: Reply<Snapshot>,
    },
    ActiveUsers {
        reply: Reply<Vec<UserPresence>>,
    },
    OperationsSince {
        revision: Revision,
        reply: Reply<Vec<CommittedOperation>>,
    },
    Stats {
        reply: Reply<SessionStats>,
    },
    Close {
        reply: Reply<()>,
    },
}

impl Command {
    fn reject(self, err: SessionError) {
        // A dropped receiver means the caller gave up; nothing to do.
        match self {
            Command::Submit { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::Join { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::Leave { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::UpdateCursor { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Err(err));
            }
            Command::ActiveUsers { reply } => {
                let _ = reply.send(Err(err));
            }
            Command::OperationsSince { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::Stats { reply } => {
                let _ = reply.send(Err(err));
            }
            Command::Close { reply } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// Cheap, cloneable address of a running document session.
#[derive(Clone)]
pub struct DocumentHandle {
    doc_id: Uuid,
    session_id: Uuid,
    commands: mpsc::Sender<Command>,
    events: Arc<BroadcastGroup>,
    stopped: watch::Receiver<bool>,
}

impl DocumentHandle {
    /// Spawn a session for `doc_id` on the current tokio runtime.
    pub fn spawn(doc_id: Uuid, storage: Arc<dyn DocumentStorage>, config: SessionConfig) -> Self {
        Self::spawn_registered(doc_id, storage, config, Weak::new())
    }

    pub(crate) fn spawn_registered(
        doc_id: Uuid,
        storage: Arc<dyn DocumentStorage>,
        config: SessionConfig,
        registry: Weak<RegistryMap>,
    ) -> Self {
        let (commands, rx) = mpsc::channel(config.command_capacity.max(1));
        let (stopped_tx, stopped) = watch::channel(false);
        let events = Arc::new(BroadcastGroup::new(config.broadcast_capacity));
        let session_id = Uuid::new_v4();

        tokio::spawn(run_session(
            doc_id,
            session_id,
            storage,
            config,
            Arc::clone(&events),
            rx,
            registry,
            stopped_tx,
        ));

        Self {
            doc_id,
            session_id,
            commands,
            events,
            stopped,
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// Identifies this incarnation of the document's session.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Receive every committed operation and presence change from now on.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Arc<DocumentEvent>> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &BroadcastGroup {
        &self.events
    }

    /// The session no longer accepts commands.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Wait until the session has flushed and deregistered.
    pub async fn stopped(&self) {
        let mut stopped = self.stopped.clone();
        // An error means the task is gone, which is stopped as well.
        let _ = stopped.wait_for(|done| *done).await;
    }

    pub async fn submit(&self, operation: Operation) -> Result<CommittedOperation, SessionError> {
        self.request(|reply| Command::Submit { operation, reply })
            .await
    }

    pub async fn join(&self, user: UserId) -> Result<JoinAck, SessionError> {
        self.request(|reply| Command::Join { user, reply }).await
    }

    /// Returns whether the user was present.
    pub async fn leave(&self, user: UserId) -> Result<bool, SessionError> {
        self.request(|reply| Command::Leave { user, reply }).await
    }

    /// `revision` is the revision the client observed the cursor at.
    pub async fn update_cursor(
        &self,
        user: UserId,
        cursor: Cursor,
        revision: Revision,
    ) -> Result<UserPresence, SessionError> {
        self.request(|reply| Command::UpdateCursor {
            user,
            cursor,
            revision,
            reply,
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<Snapshot, SessionError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn active_users(&self) -> Result<Vec<UserPresence>, SessionError> {
        self.request(|reply| Command::ActiveUsers { reply }).await
    }

    pub async fn operations_since(
        &self,
        revision: Revision,
    ) -> Result<Vec<CommittedOperation>, SessionError> {
        self.request(|reply| Command::OperationsSince { revision, reply })
            .await
    }

    pub async fn stats(&self) -> Result<SessionStats, SessionError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Close the session and wait for it to flush and deregister.
    pub async fn close(&self) -> Result<(), SessionError> {
        let result = self.request(|reply| Command::Close { reply }).await;
        self.stopped().await;
        match result {
            Err(SessionError::DocumentClosed(_)) => Ok(()),
            other => other,
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SessionError::DocumentClosed(self.doc_id))?;
        rx.await
            .map_err(|_| SessionError::DocumentClosed(self.doc_id))?
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    doc_id: Uuid,
    session_id: Uuid,
    storage: Arc<dyn DocumentStorage>,
    config: SessionConfig,
    events: Arc<BroadcastGroup>,
    mut rx: mpsc::Receiver<Command>,
    registry: Weak<RegistryMap>,
    stopped: watch::Sender<bool>,
) {
    match DocumentSession::open(doc_id, storage, config, events).await {
        Ok(session) => session.run(rx).await,
        Err(err) => {
            log::error!("Document {doc_id}: {err}");
            rx.close();
            while let Some(command) = rx.recv().await {
                command.reject(err.clone());
            }
        }
    }
    deregister(&registry, doc_id, session_id).await;
    let _ = stopped.send(true);
}

async fn deregister(registry: &Weak<RegistryMap>, doc_id: Uuid, session_id: Uuid) {
    let Some(registry) = registry.upgrade() else {
        return;
    };
    let mut map = registry.write().await;
    if map
        .get(&doc_id)
        .is_some_and(|handle| handle.session_id == session_id)
    {
        map.remove(&doc_id);
        log::debug!("Document {doc_id}: removed from registry");
    }
}

struct DocumentSession {
    doc_id: Uuid,
    document: Document,
    presence: PresenceTable,
    events: Arc<BroadcastGroup>,
    writer: PersistenceWriter,
    storage: Arc<dyn DocumentStorage>,
    config: SessionConfig,
    /// Revision of the snapshot currently in storage.
    stored_snapshot: Revision,
    idle_deadline: Option<tokio::time::Instant>,
    stats: SessionStats,
}

impl DocumentSession {
    async fn open(
        doc_id: Uuid,
        storage: Arc<dyn DocumentStorage>,
        config: SessionConfig,
        events: Arc<BroadcastGroup>,
    ) -> Result<Self, SessionError> {
        let open_error = |source| SessionError::Open { doc_id, source };

        let store = Arc::clone(&storage);
        let stored = tokio::task::spawn_blocking(move || store.load_document(doc_id))
            .await
            .map_err(|e| open_error(StoreError::DatabaseError(e.to_string())))?
            .map_err(open_error)?;

        let stored_snapshot = stored.snapshot.revision;
        let mut document = Document::from_snapshot(stored.snapshot);
        for op in stored.operations {
            let revision = op.revision;
            document.restore(op).map_err(|source| {
                open_error(StoreError::Replay {
                    doc_id,
                    revision,
                    source,
                })
            })?;
        }

        let head = document.head();
        let writer = PersistenceWriter::spawn(
            doc_id,
            Arc::clone(&storage),
            head,
            config.persist_batch_size,
            config.persist_retry_delay,
        );
        log::info!(
            "Document {doc_id}: opened at r{head} ({} chars)",
            document.text().len()
        );

        Ok(Self {
            doc_id,
            document,
            presence: PresenceTable::new(config.palette.clone(), config.presence_timeout),
            events,
            writer,
            storage,
            stored_snapshot,
            idle_deadline: None,
            stats: SessionStats {
                revision: head,
                durable_revision: head,
                ..SessionStats::default()
            },
            config,
        })
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut closers = Vec::new();
        self.arm_idle_close();

        loop {
            let deadline = self.idle_deadline;
            let idle = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Close { reply }) => {
                        log::info!("Document {}: close requested", self.doc_id);
                        closers.push(reply);
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = sweep.tick() => self.sweep(Instant::now()),
                _ = idle => {
                    log::info!("Document {}: idle, closing", self.doc_id);
                    break;
                }
            }
        }

        rx.close();
        while let Some(command) = rx.recv().await {
            match command {
                Command::Close { reply } => closers.push(reply),
                other => other.reject(SessionError::DocumentClosed(self.doc_id)),
            }
        }

        self.shutdown().await;
        for reply in closers {
            let _ = reply.send(Ok(()));
        }
    }

    fn handle(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Submit { operation, reply } => {
                let _ = reply.send(self.submit(operation, now));
            }
            Command::Join { user, reply } => {
                let _ = reply.send(Ok(self.join(user, now)));
            }
            Command::Leave { user, reply } => {
                let _ = reply.send(Ok(self.leave(&user)));
            }
            Command::UpdateCursor {
                user,
                cursor,
                revision,
                reply,
            } => {
                let _ = reply.send(self.update_cursor(user, cursor, revision, now));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(self.document.snapshot()));
            }
            Command::ActiveUsers { reply } => {
                let _ = reply.send(Ok(self.presence.active_users()));
            }
            Command::OperationsSince { revision, reply } => {
                let _ = reply.send(
                    self.document
                        .operations_since(revision)
                        .map_err(SessionError::from),
                );
            }
            Command::Stats { reply } => {
                let _ = reply.send(Ok(self.stats()));
            }
            Command::Close { reply } => {
                // Intercepted by the run loop.
                let _ = reply.send(Err(SessionError::DocumentClosed(self.doc_id)));
            }
        }
    }

    fn submit(
        &mut self,
        operation: Operation,
        now: Instant,
    ) -> Result<CommittedOperation, SessionError> {
        let author = operation.author.clone();
        let base = operation.base_revision;

        let committed = match self.document.commit(operation) {
            Ok(committed) => committed,
            Err(err) => {
                self.record_rejection(&author, base, &err);
                return Err(err.into());
            }
        };

        self.stats.commits += 1;
        self.presence.touch(&author, now);
        self.presence
            .map_cursors(committed.edit(), &author, committed.revision);
        self.writer.persist(committed.clone());
        self.events.send_committed(committed.clone());
        log::debug!(
            "Document {}: r{} {} by {author}",
            self.doc_id,
            committed.revision,
            committed.edit()
        );
        Ok(committed)
    }

    fn record_rejection(&mut self, author: &UserId, base: Revision, err: &DocumentError) {
        match err.class() {
            ErrorClass::Integrity => {
                self.stats.integrity_faults += 1;
                log::error!(
                    "Document {}: integrity fault on submission by {author} at r{base}: {err}",
                    self.doc_id
                );
            }
            ErrorClass::Validation => {
                self.stats.rejected += 1;
                log::warn!(
                    "Document {}: rejected submission by {author} at r{base}: {err}",
                    self.doc_id
                );
            }
        }
    }

    fn join(&mut self, user: UserId, now: Instant) -> JoinAck {
        let outcome = self.presence.join(user.clone(), self.document.head(), now);
        self.idle_deadline = None;

        if outcome.color_shared {
            log::warn!(
                "Document {}: palette exhausted, {user} shares color {}",
                self.doc_id,
                outcome.color.hex()
            );
        }
        if !outcome.rejoined {
            log::info!("Document {}: {user} joined", self.doc_id);
            if let Some(session) = self.presence.get(&user) {
                self.events.send_presence(PresenceDelta {
                    kind: PresenceKind::Joined,
                    user: session.presence(),
                });
            }
        }

        JoinAck {
            color: outcome.color,
            palette_exhausted: outcome.color_shared,
            snapshot: self.document.snapshot(),
            users: self.presence.active_users(),
        }
    }

    fn leave(&mut self, user: &UserId) -> bool {
        let Some(session) = self.presence.leave(user) else {
            return false;
        };
        log::info!("Document {}: {user} left", self.doc_id);
        self.events.send_presence(PresenceDelta {
            kind: PresenceKind::Left,
            user: session.presence(),
        });
        self.arm_idle_close();
        true
    }

    fn update_cursor(
        &mut self,
        user: UserId,
        cursor: Cursor,
        revision: Revision,
        now: Instant,
    ) -> Result<UserPresence, SessionError> {
        if !self.presence.contains(&user) {
            return Err(PresenceError::UnknownUser(user).into());
        }

        let mapped = match self.document.log().since(revision) {
            Ok(later) => later.iter().fold(cursor, |cursor, op| {
                cursor.transformed(op.edit(), op.author() == &user)
            }),
            // History is gone; the clamp below is the best available.
            Err(DocumentError::BaseCompacted { .. }) => cursor,
            Err(err) => return Err(err.into()),
        };
        let mapped = mapped.clamped(self.document.text().len());

        let presence = self
            .presence
            .update_cursor(&user, mapped, self.document.head(), now)?
            .presence();
        log::trace!(
            "Document {}: {user} cursor at {}",
            self.doc_id,
            presence.cursor.position
        );
        self.events.send_presence(PresenceDelta {
            kind: PresenceKind::Moved,
            user: presence.clone(),
        });
        Ok(presence)
    }

    fn sweep(&mut self, now: Instant) {
        let evicted = self.presence.evict_idle(now);
        if evicted.is_empty() {
            return;
        }
        for session in evicted {
            self.stats.evictions += 1;
            log::info!(
                "Document {}: evicted {} after {:?} idle",
                self.doc_id,
                session.user,
                now.duration_since(session.last_active)
            );
            self.events.send_presence(PresenceDelta {
                kind: PresenceKind::Evicted,
                user: session.presence(),
            });
        }
        self.arm_idle_close();
    }

    fn arm_idle_close(&mut self) {
        if self.presence.is_empty() && self.idle_deadline.is_none() {
            self.idle_deadline =
                Some(tokio::time::Instant::now() + self.config.idle_close_after);
        }
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            revision: self.document.head(),
            durable_revision: self.writer.durable_revision(),
            active_users: self.presence.len(),
            ..self.stats
        }
    }

    async fn shutdown(self) {
        let doc_id = self.doc_id;
        let durable = self.writer.finish().await;
        let snapshot = self.document.snapshot();
        let head = snapshot.revision;

        if head > self.stored_snapshot {
            let storage = Arc::clone(&self.storage);
            let saved =
                tokio::task::spawn_blocking(move || storage.save_snapshot(doc_id, &snapshot))
                    .await;
            match saved {
                Ok(Ok(())) => log::info!("Document {doc_id}: snapshot saved at r{head}"),
                Ok(Err(e)) => {
                    log::error!("Document {doc_id}: failed to save snapshot at r{head}: {e}")
                }
                Err(e) => log::error!("Document {doc_id}: snapshot task failed: {e}"),
            }
        }
        log::info!(
            "Document {doc_id}: closed at r{head} (durable ops through r{durable}, {} commits)",
            self.stats.commits
        );
    }
}
