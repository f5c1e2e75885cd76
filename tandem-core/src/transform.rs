//! Operational transform over linear text.
//!
//! `transform(a, b)` takes two operations authored against the same base
//! and returns `(a', b')` such that
//!
//! ```text
//! apply(apply(T, a), b') == apply(apply(T, b), a')
//! ```
//!
//! The whole case table lives in [`transform_edits`] so it can be audited
//! in one place:
//!
//! | a \ b  | Insert                     | Delete                        | Retain |
//! |--------|----------------------------|-------------------------------|--------|
//! | Insert | lower position first;      | shift / absorb, see below     | as-is  |
//! |        | ties broken by author id   |                               |        |
//! | Delete | mirror of Insert/Delete    | subtract overlap, shift left  | as-is  |
//! | Retain | as-is                      | as-is                         | as-is  |
//!
//! Insert vs Delete: an insert at or before the delete start pushes the
//! delete right; an insert at or after the delete end moves left by the
//! deleted length; an insert strictly inside the range is absorbed (it
//! becomes `Retain`) and the delete grows to cover the inserted text.
//!
//! Position arithmetic saturates at zero. Bounds are checked again when the
//! result is committed.
//!
//! Reference: Ellis & Gibbs, "Concurrency Control in Groupware Systems" (1989)

use crate::operation::{CommittedOperation, Edit, Operation, UserId};

/// Transform two concurrent operations against each other.
pub fn transform(a: &Operation, b: &Operation) -> (Operation, Operation) {
    let (a_edit, b_edit) = transform_edits(&a.edit, &a.author, &b.edit, &b.author);
    (a.with_edit(a_edit), b.with_edit(b_edit))
}

/// Fold `op` through a run of committed operations, in order.
///
/// `committed` must be exactly the operations committed after
/// `op.base_revision`; the result is expressed against the revision of the
/// last one.
pub fn transform_against<'a, I>(op: &Operation, committed: I) -> Operation
where
    I: IntoIterator<Item = &'a CommittedOperation>,
{
    committed
        .into_iter()
        .fold(op.clone(), |acc, c| transform(&acc, &c.operation).0)
}

/// Edit-level case table. Authors only matter for the Insert/Insert tie.
pub fn transform_edits(a: &Edit, a_author: &UserId, b: &Edit, b_author: &UserId) -> (Edit, Edit) {
    match (a, b) {
        (Edit::Retain, _) | (_, Edit::Retain) => (a.clone(), b.clone()),

        (
            Edit::Insert { position: pa, text: ta },
            Edit::Insert { position: pb, text: tb },
        ) => {
            let a_first = if pa != pb {
                pa < pb
            } else {
                insert_precedes(a_author, ta, b_author, tb)
            };
            if a_first {
                (a.clone(), Edit::insert(pb + char_len(ta), tb.clone()))
            } else {
                (Edit::insert(pa + char_len(tb), ta.clone()), b.clone())
            }
        }

        (Edit::Insert { position, text }, Edit::Delete { position: dp, len }) => {
            insert_vs_delete(*position, text, *dp, *len)
        }

        (Edit::Delete { position: dp, len }, Edit::Insert { position, text }) => {
            let (insert, delete) = insert_vs_delete(*position, text, *dp, *len);
            (delete, insert)
        }

        (
            Edit::Delete { position: pa, len: la },
            Edit::Delete { position: pb, len: lb },
        ) => (
            delete_vs_delete(*pa, *la, *pb, *lb),
            delete_vs_delete(*pb, *lb, *pa, *la),
        ),
    }
}

/// Map a cursor offset through a committed edit.
///
/// `sticky` is set when the cursor's owner authored the edit, so their own
/// typing carries the cursor along.
pub fn transform_position(position: usize, edit: &Edit, sticky: bool) -> usize {
    match edit {
        Edit::Insert { position: at, text } => {
            if *at < position || (*at == position && sticky) {
                position + char_len(text)
            } else {
                position
            }
        }
        Edit::Delete { position: start, len } => {
            let end = start.saturating_add(*len);
            if position <= *start {
                position
            } else if position >= end {
                position - len
            } else {
                *start
            }
        }
        Edit::Retain => position,
    }
}

/// Returns `(insert', delete')`.
fn insert_vs_delete(at: usize, text: &str, start: usize, len: usize) -> (Edit, Edit) {
    let end = start.saturating_add(len);
    if at <= start {
        (
            Edit::insert(at, text),
            Edit::delete(start + char_len(text), len),
        )
    } else if at >= end {
        (Edit::insert(at.saturating_sub(len), text), Edit::delete(start, len))
    } else {
        // Deletion wins: the inserted text is removed along with the range.
        (Edit::Retain, Edit::delete(start, len + char_len(text)))
    }
}

/// Returns `a` adjusted to apply after `b`.
fn delete_vs_delete(a_start: usize, a_len: usize, b_start: usize, b_len: usize) -> Edit {
    let a_end = a_start.saturating_add(a_len);
    let b_end = b_start.saturating_add(b_len);

    // Part of `b` lying before `a` shifts `a` left.
    let before = b_end.min(a_start).saturating_sub(b_start);
    // Chars removed by both are only removed once.
    let overlap = a_end.min(b_end).saturating_sub(a_start.max(b_start));

    Edit::delete(a_start.saturating_sub(before), a_len.saturating_sub(overlap))
}

/// Whether insert `a` lands before insert `b` at the same position.
fn insert_precedes(a_author: &UserId, a_text: &str, b_author: &UserId, b_text: &str) -> bool {
    (a_author, a_text) <= (b_author, b_text)
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}
