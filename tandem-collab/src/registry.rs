//! Process-wide routing table from document id to running session.
//!
//! Sessions are opened lazily on first use and remove themselves after their
//! idle-close deadline. The registry never touches document state; it only
//! hands out [`DocumentHandle`]s.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tandem_core::{CommittedOperation, Edit, Operation, Revision, Snapshot, UserId};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::broadcast::DocumentEvent;
use crate::error::SessionError;
use crate::presence::{Cursor, PresenceError, UserPresence};
use crate::session::{DocumentHandle, JoinAck, RegistryMap, SessionConfig, SessionStats};
use crate::storage::DocumentStorage;

/// Attempts made when a command races with a session that is closing.
const MAX_ATTEMPTS: usize = 3;

pub struct DocumentRegistry {
    documents: Arc<RegistryMap>,
    storage: Arc<dyn DocumentStorage>,
    config: SessionConfig,
}

impl DocumentRegistry {
    pub fn new(storage: Arc<dyn DocumentStorage>, config: SessionConfig) -> Self {
        Self {
            documents: Arc::new(RwLock::new(HashMap::new())),
            storage,
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Handle to the running session for `doc_id`, spawning one if needed.
    ///
    /// A session that is shutting down is waited for, so its snapshot is in
    /// storage before the replacement loads.
    pub async fn get_or_open(&self, doc_id: Uuid) -> DocumentHandle {
        loop {
            // Fast path: read lock
            let existing = self.documents.read().await.get(&doc_id).cloned();
            if let Some(handle) = existing {
                if !handle.is_closed() {
                    return handle;
                }
                handle.stopped().await;
                self.forget(&handle).await;
                continue;
            }

            // Slow path: write lock, double-checked
            let mut documents = self.documents.write().await;
            match documents.get(&doc_id) {
                Some(handle) if !handle.is_closed() => return handle.clone(),
                Some(_) => continue,
                None => {}
            }

            let handle = DocumentHandle::spawn_registered(
                doc_id,
                Arc::clone(&self.storage),
                self.config.clone(),
                Arc::downgrade(&self.documents),
            );
            documents.insert(doc_id, handle.clone());
            log::debug!("Document {doc_id}: session {} started", handle.session_id());
            return handle;
        }
    }

    /// Handle to a session that is already running.
    pub async fn get(&self, doc_id: Uuid) -> Option<DocumentHandle> {
        self.documents
            .read()
            .await
            .get(&doc_id)
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    pub async fn submit_operation(
        &self,
        doc_id: Uuid,
        edit: Edit,
        base_revision: Revision,
        author: UserId,
    ) -> Result<CommittedOperation, SessionError> {
        let operation = Operation::new(edit, author, base_revision);
        self.dispatch(doc_id, |handle| {
            let operation = operation.clone();
            async move { handle.submit(operation).await }
        })
        .await
    }

    pub async fn join_document(&self, doc_id: Uuid, user: UserId) -> Result<JoinAck, SessionError> {
        self.dispatch(doc_id, |handle| {
            let user = user.clone();
            async move { handle.join(user).await }
        })
        .await
    }

    /// Subscribe to the document's events, then join it. Subscribing first
    /// guarantees every event after the join snapshot is observed.
    pub async fn subscribe_and_join(
        &self,
        doc_id: Uuid,
        user: UserId,
    ) -> Result<(JoinAck, broadcast::Receiver<Arc<DocumentEvent>>), SessionError> {
        self.dispatch(doc_id, |handle| {
            let user = user.clone();
            async move {
                let events = handle.subscribe();
                let ack = handle.join(user).await?;
                Ok((ack, events))
            }
        })
        .await
    }

    /// Returns whether the user was present. Never opens a document.
    pub async fn leave_document(&self, doc_id: Uuid, user: UserId) -> Result<bool, SessionError> {
        match self.get(doc_id).await {
            Some(handle) => match handle.leave(user).await {
                Err(SessionError::DocumentClosed(_)) => Ok(false),
                other => other,
            },
            None => Ok(false),
        }
    }

    /// Never opens a document: nobody can hold a cursor in a closed one.
    pub async fn update_cursor(
        &self,
        doc_id: Uuid,
        user: UserId,
        cursor: Cursor,
        revision: Revision,
    ) -> Result<UserPresence, SessionError> {
        match self.get(doc_id).await {
            Some(handle) => handle.update_cursor(user, cursor, revision).await,
            None => Err(PresenceError::UnknownUser(user).into()),
        }
    }

    pub async fn snapshot(&self, doc_id: Uuid) -> Result<Snapshot, SessionError> {
        self.dispatch(doc_id, |handle| async move { handle.snapshot().await })
            .await
    }

    pub async fn operations_since(
        &self,
        doc_id: Uuid,
        revision: Revision,
    ) -> Result<Vec<CommittedOperation>, SessionError> {
        self.dispatch(doc_id, |handle| async move {
            handle.operations_since(revision).await
        })
        .await
    }

    /// Presence of a running document; empty if it is not open.
    pub async fn active_users(&self, doc_id: Uuid) -> Result<Vec<UserPresence>, SessionError> {
        match self.get(doc_id).await {
            Some(handle) => handle.active_users().await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn stats(&self, doc_id: Uuid) -> Option<SessionStats> {
        self.get(doc_id).await?.stats().await.ok()
    }

    pub async fn open_documents(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .documents
            .read()
            .await
            .iter()
            .filter(|(_, handle)| !handle.is_closed())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub async fn document_count(&self) -> usize {
        self.open_documents().await.len()
    }

    /// Close every session, waiting for each to flush.
    pub async fn close_all(&self) {
        let handles: Vec<DocumentHandle> = self.documents.read().await.values().cloned().collect();
        log::info!("Closing {} documents", handles.len());
        for handle in handles {
            if let Err(e) = handle.close().await {
                log::warn!("Document {}: close failed: {e}", handle.doc_id());
            }
        }
    }

    /// Route a command, reopening the document if it closed underneath us.
    async fn dispatch<T, F, Fut>(&self, doc_id: Uuid, command: F) -> Result<T, SessionError>
    where
        F: Fn(DocumentHandle) -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        let mut attempt = 1;
        loop {
            let handle = self.get_or_open(doc_id).await;
            match command(handle).await {
                Err(SessionError::DocumentClosed(_)) if attempt < MAX_ATTEMPTS => {
                    log::debug!("Document {doc_id}: session closed mid-request, retrying");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn forget(&self, stale: &DocumentHandle) {
        let mut documents = self.documents.write().await;
        if documents
            .get(&stale.doc_id())
            .is_some_and(|handle| handle.session_id() == stale.session_id())
        {
            documents.remove(&stale.doc_id());
        }
    }
}
