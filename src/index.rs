//! The index write path.
//!
//! This module holds everything between a [`Document`](crate::document::Document)
//! handed to [`IndexWriter`](writer::IndexWriter) and the immutable segments
//! on [`Storage`](crate::storage::Storage):
//!
//! - [`segment`]: per-segment metadata, generations and commit points;
//! - [`codec`]: how a flushed or merged segment is laid out in files;
//! - [`reader`]: read-only views over segments and whole-index snapshots;
//! - [`writer`]: per-thread buffers, flush control, the delete stream and
//!   the [`IndexWriter`](writer::IndexWriter) itself;
//! - [`merge`]: merge policies, schedulers and the segment merger.

pub mod codec;
pub mod deleter;
pub mod field_infos;
pub mod live_docs;
pub mod merge;
pub mod query;
pub mod reader;
pub mod segment;
pub mod term;
pub mod writer;

pub use query::Query;
pub use reader::{DocAddress, IndexSnapshot, SegmentReader};
pub use term::Term;
pub use writer::{IndexWriter, IndexWriterConfig, OpenMode};
