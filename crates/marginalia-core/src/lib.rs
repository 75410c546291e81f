//! # Marginalia Core
//!
//! Pure logic shared by the Marginalia storage engine: the annotation and
//! category models, the category-hierarchy arena, note-thread
//! reconstruction, highlight merge/split geometry, and snippet extraction.
//!
//! This crate performs no I/O. Everything that touches SQLite, the
//! filesystem, or the tokio runtime lives in the `marginalia` crate.

pub mod defaults;
pub mod error;
pub mod hierarchy;
pub mod highlight;
pub mod models;
pub mod text;
pub mod thread;

pub use error::ValidationError;
pub use models::{
    Annotation, AnnotationFilter, AnnotationKind, AnnotationSearchResult, AnnotationStats,
    AnnotationType, Bookmark, BulkOperationResult, Category, DocumentSearchResult, Highlight,
    HighlightColor, Note, Point, TextSelection, DEFAULT_CATEGORY_ID,
};
