use tandem_core::{DocumentError, ErrorClass};
use thiserror::Error;
use uuid::Uuid;

use crate::presence::PresenceError;
use crate::storage::StoreError;

/// Errors returned to the caller of a document command.
///
/// Every variant is local to the request that produced it: no error affects
/// other participants of the same document, or other documents.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Presence(#[from] PresenceError),

    /// The document session stopped before handling the command.
    #[error("document {0} is closed")]
    DocumentClosed(Uuid),

    /// The document could not be loaded from durable storage.
    #[error("failed to open document {doc_id}: {source}")]
    Open { doc_id: Uuid, source: StoreError },
}

impl SessionError {
    /// Transform defects are integrity faults; everything else the client
    /// can act on.
    pub fn is_integrity_fault(&self) -> bool {
        matches!(self, SessionError::Document(e) if e.class() == ErrorClass::Integrity)
    }

    /// The client must discard local state and fetch a snapshot.
    pub fn requires_resync(&self) -> bool {
        matches!(self, SessionError::Document(e) if e.requires_resync())
    }
}
