//! # Marginalia
//!
//! Annotation storage and full-text document search for ebook readers.
//!
//! Marginalia keeps a reader's bookmarks, highlights, and notes in a local
//! SQLite database with an FTS5 mirror, organizes them into a hierarchy of
//! categories, and maintains a second database indexing the page text of
//! the documents themselves.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌────────────────┐
//! │ Coordinator  │──▶│ Bookmarks        │──▶│ annotations.db │
//! │              │   │ Highlights Notes │   │ + FTS5 mirror  │
//! │              │──▶│ Categories       │   └────────────────┘
//! └──────────────┘   └──────────────────┘
//!
//! ┌──────────────┐   ┌──────────────────┐   ┌────────────────┐
//! │   Readers    │──▶│ Indexer (pool)   │──▶│ search_index.db│
//! │ txt/pdf/epub │   │                  │   │ + FTS5 (bm25)  │
//! └──────────────┘   └──────────────────┘   └────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! marg init                                   # create both databases
//! marg bookmark add book.epub 12 --title "Chapter 3"
//! marg index dir ~/Books                      # index a library
//! marg index search "white whale"
//! marg annotations export book.epub --format json
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema setup for both databases |
//! | [`store`] | Annotation persistence and annotation search |
//! | [`category`] | Category hierarchy and cache |
//! | [`bookmarks`] | Bookmark operations |
//! | [`highlights`] | Highlight operations, merge and split |
//! | [`notes`] | Note operations and reply threads |
//! | [`coordinator`] | Entry point over all annotation operations |
//! | [`export`] | JSON and CSV export/import |
//! | [`search_index`] | Page-content full-text index |
//! | [`reader`] | Page text extraction per format |
//! | [`indexer`] | Batch indexing worker pool |
//! | [`progress`] | Indexing progress reporting |

pub mod bookmarks;
pub mod category;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod export;
pub mod highlights;
pub mod indexer;
pub mod migrate;
pub mod notes;
pub mod progress;
pub mod reader;
pub mod search_index;
pub mod store;

pub use coordinator::AnnotationCoordinator;
pub use error::{Error, Result};
pub use indexer::DocumentIndexer;
pub use search_index::SearchIndex;
pub use store::AnnotationStore;

pub use marginalia_core::{
    Annotation, AnnotationFilter, AnnotationKind, AnnotationSearchResult, AnnotationStats,
    AnnotationType, Bookmark, BulkOperationResult, Category, DocumentSearchResult, Highlight,
    HighlightColor, Note, Point, TextSelection,
};
