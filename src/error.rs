//! Error types for the strata library.
//!
//! All fallible operations return [`Result`], whose error is the
//! [`StrataError`] enum. Indexing failures are split into two classes:
//!
//! - **aborting** errors ([`StrataError::Aborting`]) mean the in-memory state
//!   of a per-thread buffer can no longer be trusted, so every document
//!   buffered since the last flush is discarded;
//! - every other error raised while indexing a document is **non-aborting**:
//!   only the offending document is marked deleted and indexing continues.
//!
//! # Examples
//!
//! ```
//! use strata::error::{StrataError, Result};
//!
//! fn check(max_doc: u32, doc: u32) -> Result<()> {
//!     if doc >= max_doc {
//!         return Err(StrataError::invalid_argument(format!("doc {doc} out of bounds")));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check(10, 3).is_ok());
//! assert!(!check(10, 12).unwrap_err().is_aborting());
//! ```

use std::io;

use thiserror::Error;

/// The main error type for strata operations.
#[derive(Error, Debug)]
pub enum StrataError {
    /// I/O errors from the underlying storage.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Storage-related errors (missing files, closed storage, corrupt checksums).
    #[error("Storage error: {0}")]
    Storage(String),

    /// Index-related errors.
    #[error("Index error: {0}")]
    Index(String),

    /// Analysis-related errors (tokenization, filtering).
    #[error("Analysis error: {0}")]
    Analysis(String),

    /// A document could not be indexed; only that document is affected.
    #[error("Document error: {0}")]
    Document(String),

    /// The per-thread buffer is corrupt and must be discarded.
    #[error("Aborting error: {0}")]
    Aborting(String),

    /// A merge was aborted before it committed.
    #[error("Merge aborted: {0}")]
    MergeAborted(String),

    /// The writer or one of its components is closed.
    #[error("Already closed: {0}")]
    AlreadyClosed(String),

    /// Invalid argument passed by the caller.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary encoding errors.
    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// Generic error for other cases.
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error.
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with StrataError.
pub type Result<T> = std::result::Result<T, StrataError>;

impl StrataError {
    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        StrataError::Index(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        StrataError::Storage(msg.into())
    }

    /// Create a new analysis error.
    pub fn analysis<S: Into<String>>(msg: S) -> Self {
        StrataError::Analysis(msg.into())
    }

    /// Create a new per-document error.
    pub fn document<S: Into<String>>(msg: S) -> Self {
        StrataError::Document(msg.into())
    }

    /// Create a new aborting error.
    pub fn aborting<S: Into<String>>(msg: S) -> Self {
        StrataError::Aborting(msg.into())
    }

    /// Create a new merge-aborted error.
    pub fn merge_aborted<S: Into<String>>(msg: S) -> Self {
        StrataError::MergeAborted(msg.into())
    }

    /// Create a new already-closed error.
    pub fn already_closed<S: Into<String>>(msg: S) -> Self {
        StrataError::AlreadyClosed(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        StrataError::InvalidArgument(msg.into())
    }

    /// Create a new internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        StrataError::Other(format!("Internal error: {}", msg.into()))
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        StrataError::Other(msg.into())
    }

    /// Whether this error requires the whole per-thread buffer to be discarded.
    pub fn is_aborting(&self) -> bool {
        matches!(self, StrataError::Aborting(_))
    }

    /// Whether this error reports an explicitly aborted merge.
    pub fn is_merge_aborted(&self) -> bool {
        matches!(self, StrataError::MergeAborted(_))
    }
}
