//! # Strata
//!
//! The write path of a segmented inverted index: concurrent document
//! buffering, ticketed segment flushing, generation-ordered delete and
//! doc-values update resolution, reference-counted file deletion, pluggable
//! merge policies and schedulers, and durable two-phase commits.
//!
//! ## Features
//!
//! - Lock-striped per-thread indexing buffers with RAM-based flushing and stalling
//! - Deletes by term or query and in-place numeric/binary doc-values updates
//! - Near-real-time snapshots that see uncommitted changes
//! - Tiered and log-structured merge policies, serial or concurrent scheduling
//! - Pluggable storage (in-memory or file system) and segment codec
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use strata::document::Document;
//! use strata::index::{IndexWriter, IndexWriterConfig, Query};
//! use strata::storage::memory::MemoryStorage;
//!
//! # fn main() -> strata::error::Result<()> {
//! let writer = IndexWriter::open(Arc::new(MemoryStorage::new()), IndexWriterConfig::default())?;
//! writer.add_document(
//!     &Document::builder()
//!         .add_keyword("id", "1")
//!         .add_text("body", "segments all the way down")
//!         .build(),
//! )?;
//! writer.commit()?;
//!
//! let snapshot = writer.get_reader(true)?;
//! assert_eq!(snapshot.search(&Query::term("body", "segments")).len(), 1);
//! writer.close()?;
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod document;
pub mod error;
pub mod index;
pub mod storage;
pub mod util;

pub mod prelude {
    pub use crate::document::{Document, Field, FieldValue};
    pub use crate::error::{Result, StrataError};
    pub use crate::index::{IndexSnapshot, IndexWriter, IndexWriterConfig, OpenMode, Query, Term};
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
