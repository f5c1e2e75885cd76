//! Authoritative document state and the commit protocol.
//!
//! ```text
//! submit(op @ base)
//!       │
//!       ▼
//! log.since(base) ──► validate op against len(doc @ base)
//!       │
//!       ▼
//! fold transform(op, committed[i]).0   for i in base+1..=head
//!       │
//!       ▼
//! bounds check vs current text ──► IntegrityFault (nothing mutated)
//!       │
//!       ▼
//! apply to text, append to log ──► CommittedOperation(head + 1)
//! ```
//!
//! The text is a cache: it always equals the initial text folded with every
//! committed operation, and [`Document::replay`] recomputes it from scratch.

use crate::error::DocumentError;
use crate::operation::{CommittedOperation, Operation, Revision, Snapshot};
use crate::revision::RevisionLog;
use crate::text::DocumentText;
use crate::transform::transform_against;

/// One document: initial text, revision log and the cached current text.
#[derive(Debug, Clone)]
pub struct Document {
    /// Text at `log.floor()`.
    initial: DocumentText,
    text: DocumentText,
    log: RevisionLog,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Empty document at revision 0.
    pub fn new() -> Self {
        Self::from_text("")
    }

    /// Document whose revision 0 is `text`.
    pub fn from_text(text: &str) -> Self {
        Self::from_snapshot(Snapshot {
            text: text.to_string(),
            revision: 0,
        })
    }

    /// Document restored from a snapshot; history before it is not retained.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let initial = DocumentText::from(snapshot.text.as_str());
        Self {
            text: initial.clone(),
            initial,
            log: RevisionLog::with_floor(snapshot.revision),
        }
    }

    pub fn head(&self) -> Revision {
        self.log.head()
    }

    pub fn text(&self) -> &DocumentText {
        &self.text
    }

    pub fn log(&self) -> &RevisionLog {
        &self.log
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            text: self.text.to_string(),
            revision: self.log.head(),
        }
    }

    /// Committed operations after `revision`, for catch-up replay.
    pub fn operations_since(
        &self,
        revision: Revision,
    ) -> Result<Vec<CommittedOperation>, DocumentError> {
        Ok(self.log.since(revision)?.to_vec())
    }

    /// Express `op` against the current head without committing it.
    pub fn rebase(&self, op: &Operation) -> Result<Operation, DocumentError> {
        let concurrent = self.log.since(op.base_revision)?;

        let len_at_base = concurrent
            .iter()
            .fold(self.text.len() as isize, |len, c| len - c.edit().len_delta());
        let len_at_base = len_at_base.max(0) as usize;
        if !op.edit.fits(len_at_base) {
            return Err(DocumentError::Malformed {
                edit: op.edit.clone(),
                len: len_at_base,
                revision: op.base_revision,
            });
        }

        Ok(transform_against(op, concurrent))
    }

    /// Transform, validate, apply and append `op`.
    ///
    /// On error the document is unchanged.
    pub fn commit(&mut self, op: Operation) -> Result<CommittedOperation, DocumentError> {
        let head = self.log.head();
        let mut rebased = self.rebase(&op)?;

        let len = self.text.len();
        if !rebased.edit.fits(len) {
            return Err(DocumentError::IntegrityFault {
                edit: rebased.edit,
                len,
                revision: head,
            });
        }

        self.text.apply(&rebased.edit)?;
        rebased.base_revision = head;
        let committed = self.log.append(rebased).clone();
        log::trace!(
            "committed r{} {} by {} (authored at r{})",
            committed.revision,
            committed.edit(),
            committed.author(),
            op.base_revision
        );
        Ok(committed)
    }

    /// Re-apply an operation that was committed in an earlier session.
    pub fn restore(&mut self, committed: CommittedOperation) -> Result<(), DocumentError> {
        let expected = self.log.head() + 1;
        if committed.revision != expected {
            return Err(DocumentError::RevisionGap {
                expected,
                found: committed.revision,
            });
        }
        self.text.apply(committed.edit())?;
        self.log.push(committed)
    }

    /// Recompute the text at `revision` from the initial text and the log.
    pub fn text_at(&self, revision: Revision) -> Result<String, DocumentError> {
        let upto = self.log.since(revision)?.len();
        let replayed = self.log.len() - upto;

        let mut text = self.initial.clone();
        for committed in self.log.iter().take(replayed) {
            text.apply(committed.edit())?;
        }
        Ok(text.to_string())
    }

    /// Recompute the current text from scratch.
    pub fn replay(&self) -> Result<String, DocumentError> {
        self.text_at(self.log.head())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Edit;

    #[test]
    fn test_sequential_commits() {
        let mut doc = Document::new();
        let c1 = doc.commit(Operation::insert(0, "hello", "alice", 0)).unwrap();
        let c2 = doc.commit(Operation::insert(5, " world", "alice", 1)).unwrap();
        assert_eq!(c1.revision, 1);
        assert_eq!(c2.revision, 2);
        assert_eq!(doc.text().to_string(), "hello world");
        assert_eq!(doc.head(), 2);
    }

    #[test]
    fn test_committed_operation_is_expressed_against_previous_revision() {
        let mut doc = Document::from_text("ABC");
        doc.commit(Operation::insert(0, "1", "alice", 0)).unwrap();
        let c = doc.commit(Operation::insert(3, "2", "bob", 0)).unwrap();
        assert_eq!(c.operation.base_revision, 1);
        assert_eq!(c.edit(), &Edit::insert(4, "2"));
        assert_eq!(doc.text().to_string(), "1ABC2");
    }

    #[test]
    fn test_concurrent_submissions_transform() {
        let mut doc = Document::from_text("ABC");
        doc.commit(Operation::insert(1, "X", "x", 0)).unwrap();
        let c = doc.commit(Operation::delete(0, 2, "y", 0)).unwrap();
        assert_eq!(c.edit(), &Edit::delete(0, 3));
        assert_eq!(doc.text().to_string(), "C");
    }

    #[test]
    fn test_invalid_base_leaves_document_untouched() {
        let mut doc = Document::from_text("abc");
        doc.commit(Operation::insert(0, "x", "a", 0)).unwrap();
        let err = doc.commit(Operation::insert(0, "y", "a", 99)).unwrap_err();
        assert_eq!(err, DocumentError::InvalidBase { base: 99, head: 1 });
        assert_eq!(doc.head(), 1);
        assert_eq!(doc.text().to_string(), "xabc");
    }

    #[test]
    fn test_malformed_against_base_length() {
        let mut doc = Document::from_text("abc");
        doc.commit(Operation::insert(3, "def", "a", 0)).unwrap();
        // Fits the current text but not the text at revision 0.
        let err = doc.commit(Operation::delete(2, 3, "b", 0)).unwrap_err();
        assert!(matches!(err, DocumentError::Malformed { len: 3, revision: 0, .. }));
        assert_eq!(doc.head(), 1);
    }

    #[test]
    fn test_text_at_and_replay() {
        let mut doc = Document::from_text("base");
        doc.commit(Operation::insert(4, "1", "a", 0)).unwrap();
        doc.commit(Operation::insert(5, "2", "a", 1)).unwrap();
        doc.commit(Operation::delete(0, 4, "a", 2)).unwrap();
        assert_eq!(doc.text_at(0).unwrap(), "base");
        assert_eq!(doc.text_at(1).unwrap(), "base1");
        assert_eq!(doc.text_at(2).unwrap(), "base12");
        assert_eq!(doc.replay().unwrap(), doc.text().to_string());
        assert_eq!(doc.replay().unwrap(), "12");
    }

    #[test]
    fn test_restore_from_snapshot() {
        let mut doc = Document::from_snapshot(Snapshot {
            text: "abc".into(),
            revision: 5,
        });
        assert_eq!(doc.head(), 5);
        doc.restore(CommittedOperation {
            revision: 6,
            operation: Operation::insert(3, "d", "a", 5),
        })
        .unwrap();
        assert_eq!(doc.snapshot().text, "abcd");

        let gap = doc.restore(CommittedOperation {
            revision: 8,
            operation: Operation::retain("a", 7),
        });
        assert!(matches!(gap, Err(DocumentError::RevisionGap { expected: 7, found: 8 })));

        let stale = doc.commit(Operation::insert(0, "z", "b", 2)).unwrap_err();
        assert_eq!(stale, DocumentError::BaseCompacted { base: 2, floor: 5 });
    }

    #[test]
    fn test_integrity_fault_when_text_disagrees_with_log() {
        let mut doc = Document::from_text("abc");
        doc.commit(Operation::insert(0, "xyz", "writer", 0)).unwrap();
        // Cached text shorter than the log implies.
        doc.text = DocumentText::from("ab");

        // Fits the clamped base length, lands past the end once rebased.
        let err = doc.commit(Operation::insert(0, "q", "zed", 0)).unwrap_err();
        assert_eq!(
            err,
            DocumentError::IntegrityFault {
                edit: Edit::insert(3, "q"),
                len: 2,
                revision: 1,
            }
        );
        assert_eq!(doc.head(), 1);
        assert_eq!(doc.text().to_string(), "ab");
    }

    #[test]
    fn test_retain_bumps_revision() {
        let mut doc = Document::from_text("abc");
        let c = doc.commit(Operation::retain("a", 0)).unwrap();
        assert_eq!(c.revision, 1);
        assert_eq!(doc.text().to_string(), "abc");
    }
}
