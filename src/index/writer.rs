//! Buffering, flushing and publishing of documents and deletes.
//!
//! Indexing threads write into [`per_thread`] buffers checked out of the
//! [`thread_pool`]. [`flush_control`] decides when a buffer flushes and
//! stalls indexing when flushing falls behind. Deletes and doc-values
//! updates travel through the [`delete_queue`], are frozen into packets and
//! resolved against segments by the [`updates_stream`]. The
//! [`index_writer`] ties everything to a commit point.

pub mod block_pool;
pub mod buffered_updates;
pub mod config;
pub mod delete_queue;
pub mod doc_values_updates;
pub mod documents_writer;
pub mod events;
pub mod flush_control;
pub mod flush_policy;
pub mod flush_queue;
pub mod frozen_updates;
pub mod index_writer;
pub mod indexing_chain;
pub mod per_thread;
pub mod ram;
pub mod readers_pool;
pub mod stall_control;
pub mod thread_pool;
pub mod updates_stream;

pub use config::{IndexWriterConfig, IndexWriterSettings, OpenMode};
pub use index_writer::IndexWriter;
