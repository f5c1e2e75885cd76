//! Edit values exchanged between editors and the document session.
//!
//! An [`Operation`] is immutable once built: transformation and commit
//! produce new values and never touch their inputs.
//!
//! All positions and lengths count Unicode scalar values (`char`s), never
//! bytes, so that every replica agrees on offsets regardless of encoding.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Revision number. Revision 0 is the initial (empty or loaded) text; the
/// first accepted operation commits revision 1.
pub type Revision = u64;

/// Opaque user identifier.
///
/// Ordering is lexicographic on the underlying string and is used to break
/// ties between concurrent inserts at the same position.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A single edit over a linear character sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Edit {
    /// Insert `text` before the character at `position`.
    Insert { position: usize, text: String },
    /// Remove `len` characters starting at `position`.
    Delete { position: usize, len: usize },
    /// No-op placeholder. Commits still bump the revision.
    Retain,
}

impl Edit {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        Edit::Insert {
            position,
            text: text.into(),
        }
    }

    pub fn delete(position: usize, len: usize) -> Self {
        Edit::Delete { position, len }
    }

    /// True when applying the edit leaves the text unchanged.
    pub fn is_noop(&self) -> bool {
        match self {
            Edit::Insert { text, .. } => text.is_empty(),
            Edit::Delete { len, .. } => *len == 0,
            Edit::Retain => true,
        }
    }

    /// Change in document length (in chars) caused by this edit.
    pub fn len_delta(&self) -> isize {
        match self {
            Edit::Insert { text, .. } => text.chars().count() as isize,
            Edit::Delete { len, .. } => -(*len as isize),
            Edit::Retain => 0,
        }
    }

    /// Check that the edit fits a document of `doc_len` chars.
    pub fn fits(&self, doc_len: usize) -> bool {
        match self {
            Edit::Insert { position, .. } => *position <= doc_len,
            Edit::Delete { position, len } => position
                .checked_add(*len)
                .is_some_and(|end| end <= doc_len),
            Edit::Retain => true,
        }
    }
}

impl fmt::Display for Edit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edit::Insert { position, text } => write!(f, "insert({position}, {text:?})"),
            Edit::Delete { position, len } => write!(f, "delete({position}, {len})"),
            Edit::Retain => f.write_str("retain"),
        }
    }
}

/// An edit authored by one user against the revision they last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub edit: Edit,
    pub author: UserId,
    pub base_revision: Revision,
}

impl Operation {
    pub fn new(edit: Edit, author: impl Into<UserId>, base_revision: Revision) -> Self {
        Self {
            edit,
            author: author.into(),
            base_revision,
        }
    }

    pub fn insert(
        position: usize,
        text: impl Into<String>,
        author: impl Into<UserId>,
        base_revision: Revision,
    ) -> Self {
        Self::new(Edit::insert(position, text), author, base_revision)
    }

    pub fn delete(
        position: usize,
        len: usize,
        author: impl Into<UserId>,
        base_revision: Revision,
    ) -> Self {
        Self::new(Edit::delete(position, len), author, base_revision)
    }

    pub fn retain(author: impl Into<UserId>, base_revision: Revision) -> Self {
        Self::new(Edit::Retain, author, base_revision)
    }

    /// Same author and base, different edit.
    pub(crate) fn with_edit(&self, edit: Edit) -> Self {
        Self {
            edit,
            author: self.author.clone(),
            base_revision: self.base_revision,
        }
    }
}

/// An operation that has been assigned its place in history.
///
/// `revision` is strictly increasing and gapless per document. The wrapped
/// operation is expressed against `revision - 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedOperation {
    pub revision: Revision,
    pub operation: Operation,
}

impl CommittedOperation {
    pub fn edit(&self) -> &Edit {
        &self.operation.edit
    }

    pub fn author(&self) -> &UserId {
        &self.operation.author
    }
}

/// Text and revision of a document at one point in its history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub text: String,
    pub revision: Revision,
}
