//! Durable storage boundary for document sessions.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐  committed ops   ┌───────────────────┐
//! │ DocumentSession  │ ───────────────► │ PersistenceWriter │  (own task,
//! │ (commit + ack    │  fire-and-forget │ batches, retries) │   off the
//! │  happen first)   │                  └─────────┬─────────┘   critical path)
//! └────────┬─────────┘                            │ spawn_blocking
//!          │ open: load_document                  ▼
//!          │ close: save_snapshot      ┌────────────────────────┐
//!          └──────────────────────────►│ dyn DocumentStorage    │
//!                                      │  MemoryStore           │
//!                                      │  DocumentStore (Rocks) │
//!                                      └────────────────────────┘
//! ```
//!
//! Commits are acknowledged before they are durable. If the process dies in
//! between, the tail of the history is lost from storage while clients may
//! still hold it; after restart such clients are rejected with an
//! invalid-base error and must resync from a snapshot.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 3

pub mod memory;
pub mod rocks;
pub mod writer;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig};
pub use writer::PersistenceWriter;

use tandem_core::{CommittedOperation, DocumentError, Revision, Snapshot};
use thiserror::Error;
use uuid::Uuid;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    DatabaseError(String),
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("deserialization error: {0}")]
    DeserializationError(String),
    #[error("compression error: {0}")]
    CompressionError(String),
    /// An append would leave a hole in the persisted history.
    #[error("revision gap in document {doc_id}: expected {expected}, found {found}")]
    RevisionGap {
        doc_id: Uuid,
        expected: Revision,
        found: Revision,
    },
    /// A persisted operation no longer applies on top of its predecessors.
    #[error("stored history of {doc_id} does not replay at r{revision}: {source}")]
    Replay {
        doc_id: Uuid,
        revision: Revision,
        source: DocumentError,
    },
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// What a session needs to reopen a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    /// Latest snapshot (empty text at revision 0 for a new document).
    pub snapshot: Snapshot,
    /// Persisted operations after the snapshot, contiguous, oldest first.
    pub operations: Vec<CommittedOperation>,
}

impl StoredDocument {
    pub fn empty() -> Self {
        Self {
            snapshot: Snapshot {
                text: String::new(),
                revision: 0,
            },
            operations: Vec::new(),
        }
    }

    pub fn last_persisted_revision(&self) -> Revision {
        self.operations
            .last()
            .map_or(self.snapshot.revision, |op| op.revision)
    }
}

/// Persistence contract consumed by document sessions.
///
/// Implementations are called from blocking worker threads, never from
/// inside a session's command loop.
pub trait DocumentStorage: Send + Sync + 'static {
    /// Load the latest snapshot plus the operations persisted after it.
    /// Unknown documents load as [`StoredDocument::empty`].
    fn load_document(&self, doc_id: Uuid) -> Result<StoredDocument, StoreError>;

    /// Append committed operations in revision order. Operations at or below
    /// the last persisted revision are skipped, so redelivery is harmless.
    fn append_operations(
        &self,
        doc_id: Uuid,
        operations: &[CommittedOperation],
    ) -> Result<(), StoreError>;

    /// Persist a snapshot and drop the operations it covers.
    fn save_snapshot(&self, doc_id: Uuid, snapshot: &Snapshot) -> Result<(), StoreError>;
}

/// Keep only the contiguous run of operations that follows `after`.
pub(crate) fn contiguous_after(
    doc_id: Uuid,
    after: Revision,
    operations: Vec<CommittedOperation>,
) -> Vec<CommittedOperation> {
    let mut expected = after + 1;
    let mut contiguous = Vec::with_capacity(operations.len());
    for op in operations {
        if op.revision < expected {
            continue;
        }
        if op.revision != expected {
            log::warn!(
                "Document {doc_id}: persisted history stops at r{}, found r{} next",
                expected - 1,
                op.revision
            );
            break;
        }
        expected += 1;
        contiguous.push(op);
    }
    contiguous
}
