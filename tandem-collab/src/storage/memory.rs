//! In-process storage backend.
//!
//! Used when the server runs without a data directory, and by tests that
//! need to inspect what a session persisted or simulate write failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tandem_core::{CommittedOperation, Revision, Snapshot};
use uuid::Uuid;

use super::{contiguous_after, DocumentStorage, StoreError, StoredDocument};

#[derive(Debug, Default)]
struct Entry {
    snapshot: Option<Snapshot>,
    operations: Vec<CommittedOperation>,
}

impl Entry {
    fn last_revision(&self) -> Revision {
        self.operations.last().map_or_else(
            || self.snapshot.as_ref().map_or(0, |s| s.revision),
            |op| op.revision,
        )
    }
}

/// Storage kept in a mutex-guarded map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<Uuid, Entry>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document with initial text at revision 0.
    pub fn with_document(self, doc_id: Uuid, text: impl Into<String>) -> Self {
        self.lock().insert(
            doc_id,
            Entry {
                snapshot: Some(Snapshot {
                    text: text.into(),
                    revision: 0,
                }),
                operations: Vec::new(),
            },
        );
        self
    }

    /// Highest revision durably stored for `doc_id`.
    pub fn persisted_revision(&self, doc_id: Uuid) -> Revision {
        self.lock().get(&doc_id).map_or(0, Entry::last_revision)
    }

    /// Latest saved snapshot, if any.
    pub fn snapshot(&self, doc_id: Uuid) -> Option<Snapshot> {
        self.lock().get(&doc_id).and_then(|e| e.snapshot.clone())
    }

    /// Number of operations stored after the latest snapshot.
    pub fn operation_count(&self, doc_id: Uuid) -> usize {
        self.lock().get(&doc_id).map_or(0, |e| e.operations.len())
    }

    /// Make every subsequent write fail until switched back off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::DatabaseError("writes disabled".into()));
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Entry>> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DocumentStorage for MemoryStore {
    fn load_document(&self, doc_id: Uuid) -> Result<StoredDocument, StoreError> {
        let documents = self.lock();
        let Some(entry) = documents.get(&doc_id) else {
            return Ok(StoredDocument::empty());
        };
        let snapshot = entry.snapshot.clone().unwrap_or(Snapshot {
            text: String::new(),
            revision: 0,
        });
        let operations = contiguous_after(doc_id, snapshot.revision, entry.operations.clone());
        Ok(StoredDocument {
            snapshot,
            operations,
        })
    }

    fn append_operations(
        &self,
        doc_id: Uuid,
        operations: &[CommittedOperation],
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut documents = self.lock();
        let entry = documents.entry(doc_id).or_default();

        let floor = entry.last_revision();
        let mut last = floor;
        let mut accepted = Vec::with_capacity(operations.len());
        for op in operations.iter().filter(|op| op.revision > floor) {
            if op.revision != last + 1 {
                return Err(StoreError::RevisionGap {
                    doc_id,
                    expected: last + 1,
                    found: op.revision,
                });
            }
            last = op.revision;
            accepted.push(op.clone());
        }
        entry.operations.extend(accepted);
        Ok(())
    }

    fn save_snapshot(&self, doc_id: Uuid, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut documents = self.lock();
        let entry = documents.entry(doc_id).or_default();
        entry.operations.retain(|op| op.revision > snapshot.revision);
        entry.snapshot = Some(snapshot.clone());
        Ok(())
    }
}
