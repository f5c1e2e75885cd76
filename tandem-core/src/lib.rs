//! # tandem-core: operational-transform kernel for shared text documents
//!
//! Pure, synchronous building blocks used by the per-document session in
//! `tandem-collab`:
//!
//! ```text
//!  Operation (edit + author + base revision)
//!       │
//!       ▼
//!  transform / transform_against      ◄── case table, no state, no I/O
//!       │
//!       ▼
//!  Document::commit ──► RevisionLog (gapless, append-only)
//!                   └─► DocumentText (rope, char-indexed)
//! ```
//!
//! ## Modules
//!
//! - [`operation`]: `UserId`, `Edit`, `Operation`, `CommittedOperation`, `Snapshot`
//! - [`transform`]: pairwise transform, fold against history, cursor mapping
//! - [`revision`]: the revision log
//! - [`document`]: commit protocol, replay, restore
//! - [`text`]: char-indexed text storage
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Pairwise transform | <100ns |
//! | Commit against 100 concurrent ops | <50μs |
//! | Replay 10k ops | <20ms |

pub mod document;
pub mod error;
pub mod operation;
pub mod revision;
pub mod text;
pub mod transform;

pub use document::Document;
pub use error::{DocumentError, ErrorClass};
pub use operation::{CommittedOperation, Edit, Operation, Revision, Snapshot, UserId};
pub use revision::RevisionLog;
pub use text::DocumentText;
pub use transform::{transform, transform_against, transform_edits, transform_position};
