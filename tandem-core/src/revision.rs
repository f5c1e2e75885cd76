//! Append-only history of committed operations.

use crate::error::DocumentError;
use crate::operation::{CommittedOperation, Operation, Revision};

/// Ordered, gapless history for one document.
///
/// Entry `i` always carries revision `floor + i + 1`. The floor is 0 for a
/// document whose whole history is in memory, and the snapshot revision for
/// a document restored from a compacted snapshot.
#[derive(Debug, Clone, Default)]
pub struct RevisionLog {
    floor: Revision,
    entries: Vec<CommittedOperation>,
}

impl RevisionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty log whose history starts after `floor`.
    pub fn with_floor(floor: Revision) -> Self {
        Self {
            floor,
            entries: Vec::new(),
        }
    }

    /// Latest committed revision.
    pub fn head(&self) -> Revision {
        self.floor + self.entries.len() as Revision
    }

    /// Oldest revision a submission may still be based on.
    pub fn floor(&self) -> Revision {
        self.floor
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Assign the next revision to `operation` and append it.
    pub fn append(&mut self, operation: Operation) -> &CommittedOperation {
        let revision = self.head() + 1;
        self.entries.push(CommittedOperation {
            revision,
            operation,
        });
        &self.entries[self.entries.len() - 1]
    }

    /// Append an already numbered operation, e.g. one read back from storage.
    pub fn push(&mut self, committed: CommittedOperation) -> Result<(), DocumentError> {
        let expected = self.head() + 1;
        if committed.revision != expected {
            return Err(DocumentError::RevisionGap {
                expected,
                found: committed.revision,
            });
        }
        self.entries.push(committed);
        Ok(())
    }

    /// Every operation committed after `revision`, oldest first.
    pub fn since(&self, revision: Revision) -> Result<&[CommittedOperation], DocumentError> {
        let head = self.head();
        if revision > head {
            return Err(DocumentError::InvalidBase {
                base: revision,
                head,
            });
        }
        if revision < self.floor {
            return Err(DocumentError::BaseCompacted {
                base: revision,
                floor: self.floor,
            });
        }
        Ok(&self.entries[(revision - self.floor) as usize..])
    }

    pub fn get(&self, revision: Revision) -> Option<&CommittedOperation> {
        if revision <= self.floor {
            return None;
        }
        self.entries.get((revision - self.floor - 1) as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommittedOperation> {
        self.entries.iter()
    }
}
