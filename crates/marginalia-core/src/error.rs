//! Validation failures raised before anything is written.

use thiserror::Error;

/// A rule violated by an annotation, category, or hierarchy change.
///
/// These are detected by pure checks in this crate and surfaced by the
/// storage layer as `Error::Validation`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("page number must be >= 1, got {0}")]
    PageOutOfRange(u32),

    #[error("updated_at precedes created_at")]
    TimestampOrder,

    #[error("selection start {start} is after end {end}")]
    SelectionBounds { start: usize, end: usize },

    #[error("invalid color: {0:?} (expected #RRGGBB)")]
    InvalidColor(String),

    #[error("name must not be empty")]
    EmptyName,

    #[error("a category named {0:?} already exists under this parent")]
    DuplicateName(String),

    #[error("moving {id} under {parent} would create a cycle")]
    Cycle { id: String, parent: String },

    #[error("note {0} cannot reply to itself or one of its replies")]
    ThreadCycle(String),

    #[error("parent note {parent} belongs to a different document")]
    ThreadDocumentMismatch { parent: String },

    #[error("split position {position} is not strictly inside {start}..{end}")]
    SplitPosition {
        position: usize,
        start: usize,
        end: usize,
    },

    #[error("merge needs at least two highlights, got {0}")]
    MergeTooFew(usize),

    #[error("highlights to merge must share document and page")]
    MergeMixedPages,

    #[error("default category {0} cannot be deleted")]
    ProtectedCategory(String),

    #[error("category {0} has children; a reassignment target is required")]
    HasChildren(String),

    #[error("unknown category template: {0}")]
    UnknownTemplate(String),

    #[error("{0}")]
    Other(String),
}
