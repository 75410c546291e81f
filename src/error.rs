//! Error taxonomy for the storage and indexing layers.
//!
//! Internal code returns [`Result`] and uses `?` freely. The public
//! operations on [`AnnotationStore`](crate::store::AnnotationStore),
//! [`SearchIndex`](crate::search_index::SearchIndex) and the managers built
//! on them catch these errors at their boundary, log them, and hand the
//! caller a plain failure value (`false`, `None`, or an empty list).

use marginalia_core::ValidationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("search index error: {0}")]
    Index(String),

    #[error("unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("could not extract text from {path}: {message}")]
    Extract { path: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl Error {
    /// Storage and index faults are environmental; everything else is the
    /// caller's input. Used to pick the log level at the boundary.
    pub fn is_fault(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Index(_) | Error::Io(_))
    }

    /// A row that could not be turned back into a model value.
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        let msg: String = msg.into();
        Error::Storage(sqlx::Error::Decode(msg.into()))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Converts an internal result into the failure-sentinel form used at the
/// public API boundary, logging the error on the way.
pub(crate) trait Reported<T> {
    fn reported(self, op: &'static str) -> Option<T>;
}

impl<T> Reported<T> for Result<T> {
    fn reported(self, op: &'static str) -> Option<T> {
        match self {
            Ok(v) => Some(v),
            Err(err) => {
                if err.is_fault() {
                    tracing::error!(op, error = %err, "operation failed");
                } else {
                    tracing::warn!(op, error = %err, "operation rejected");
                }
                None
            }
        }
    }
}
