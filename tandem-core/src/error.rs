use thiserror::Error;

use crate::operation::{Edit, Revision};

/// Errors raised while validating, transforming or committing operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    /// The author claims to have seen a revision that was never committed.
    #[error("base revision {base} is ahead of head revision {head}")]
    InvalidBase { base: u64, head: u64 },

    /// The base revision predates the oldest operation still held in memory.
    #[error("base revision {base} predates retained history starting at {floor}")]
    BaseCompacted { base: u64, floor: u64 },

    /// The operation does not fit the document it was authored against.
    #[error("malformed operation {edit} for document of length {len} at revision {revision}")]
    Malformed {
        edit: Edit,
        len: usize,
        revision: Revision,
    },

    /// An edit reached the text with positions outside it.
    #[error("{edit} out of bounds for text of length {len}")]
    OutOfBounds { edit: Edit, len: usize },

    /// A transformed operation no longer fits the current text.
    #[error("integrity fault: transformed {edit} does not fit text of length {len} at revision {revision}")]
    IntegrityFault {
        edit: Edit,
        len: usize,
        revision: Revision,
    },

    /// Restored history is not contiguous.
    #[error("revision gap: expected {expected}, found {found}")]
    RevisionGap { expected: u64, found: u64 },
}

/// How an error should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller mistake; reported to the submitting client only.
    Validation,
    /// Transform defect; the edit is rejected and the fault recorded.
    Integrity,
}

impl DocumentError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DocumentError::IntegrityFault { .. }
            | DocumentError::OutOfBounds { .. }
            | DocumentError::RevisionGap { .. } => ErrorClass::Integrity,
            DocumentError::InvalidBase { .. }
            | DocumentError::BaseCompacted { .. }
            | DocumentError::Malformed { .. } => ErrorClass::Validation,
        }
    }

    /// True when the client should drop local state and resync from a snapshot.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            DocumentError::InvalidBase { .. } | DocumentError::BaseCompacted { .. }
        )
    }
}
