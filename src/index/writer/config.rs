//! Configuration for the index writer.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::analysis::Analyzer;
use crate::analysis::analyzer::StandardAnalyzer;
use crate::error::{Result, StrataError};
use crate::index::codec::{Codec, DefaultCodec};
use crate::index::merge::policy::MergePolicy;
use crate::index::merge::scheduler::{ConcurrentMergeScheduler, MergeScheduler};
use crate::index::merge::tiered::TieredMergePolicy;
use crate::index::writer::flush_policy::{FlushByRamOrCountsPolicy, FlushPolicy};

/// Default RAM buffer size in MB.
pub const DEFAULT_RAM_BUFFER_SIZE_MB: f64 = 16.0;

/// Default per-buffer hard limit in MB.
pub const DEFAULT_RAM_PER_THREAD_HARD_LIMIT_MB: u32 = 1945;

/// Default number of concurrent per-thread buffers.
pub const DEFAULT_MAX_THREAD_STATES: usize = 8;

/// How [`IndexWriter::open`](crate::index::writer::IndexWriter::open) treats
/// an existing index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenMode {
    /// Start a new, empty index, discarding any existing commit.
    Create,
    /// Open the existing index; fail if there is none.
    Append,
    /// Open the existing index or create one.
    CreateOrAppend,
}

/// Plain writer parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexWriterSettings {
    /// How an existing index is treated on open.
    pub open_mode: OpenMode,

    /// Flush once buffered documents and deletes use this much RAM.
    /// `None` disables flushing by RAM.
    pub ram_buffer_size_mb: Option<f64>,

    /// Flush a buffer once it holds this many documents.
    /// `None` disables flushing by document count.
    pub max_buffered_docs: Option<usize>,

    /// Apply deletes once this many delete terms are buffered.
    pub max_buffered_delete_terms: Option<usize>,

    /// A single buffer is flushed once it reaches this size, whatever the policy says.
    pub ram_per_thread_hard_limit_mb: u32,

    /// Indexing threads stall once active plus flushing bytes exceed this
    /// multiple of the RAM buffer.
    pub stall_ram_multiplier: f64,

    /// Maximum number of concurrent per-thread buffers.
    pub max_thread_states: usize,

    /// Keep segment readers open between operations.
    pub reader_pooling: bool,

    /// Keep segments whose documents are all deleted.
    pub keep_fully_deleted_segments: bool,

    /// Assert RAM accounting bounds in release builds too.
    pub check_ram_invariant: bool,
}

impl Default for IndexWriterSettings {
    fn default() -> Self {
        IndexWriterSettings {
            open_mode: OpenMode::CreateOrAppend,
            ram_buffer_size_mb: Some(DEFAULT_RAM_BUFFER_SIZE_MB),
            max_buffered_docs: None,
            max_buffered_delete_terms: None,
            ram_per_thread_hard_limit_mb: DEFAULT_RAM_PER_THREAD_HARD_LIMIT_MB,
            stall_ram_multiplier: 2.0,
            max_thread_states: DEFAULT_MAX_THREAD_STATES,
            reader_pooling: false,
            keep_fully_deleted_segments: false,
            check_ram_invariant: false,
        }
    }
}

impl IndexWriterSettings {
    /// Check the settings for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.ram_buffer_size_mb.is_none() && self.max_buffered_docs.is_none() {
            return Err(StrataError::invalid_argument(
                "at least one of ram_buffer_size_mb and max_buffered_docs must be set",
            ));
        }
        if let Some(mb) = self.ram_buffer_size_mb {
            if mb <= 0.0 {
                return Err(StrataError::invalid_argument(format!(
                    "ram_buffer_size_mb must be > 0, got {mb}"
                )));
            }
            if mb >= self.ram_per_thread_hard_limit_mb as f64 {
                return Err(StrataError::invalid_argument(format!(
                    "ram_buffer_size_mb {mb} must be below the per-thread hard limit of {} MB",
                    self.ram_per_thread_hard_limit_mb
                )));
            }
        }
        if self.max_buffered_docs.is_some_and(|n| n < 2) {
            return Err(StrataError::invalid_argument("max_buffered_docs must be at least 2"));
        }
        if self.max_buffered_delete_terms.is_some_and(|n| n < 1) {
            return Err(StrataError::invalid_argument(
                "max_buffered_delete_terms must be at least 1",
            ));
        }
        if self.max_thread_states == 0 {
            return Err(StrataError::invalid_argument("max_thread_states must be at least 1"));
        }
        if self.stall_ram_multiplier < 1.0 {
            return Err(StrataError::invalid_argument(
                "stall_ram_multiplier must be at least 1.0",
            ));
        }
        Ok(())
    }

    /// RAM buffer in bytes, if flushing by RAM.
    pub fn ram_buffer_bytes(&self) -> Option<i64> {
        self.ram_buffer_size_mb
            .map(|mb| (mb * 1024.0 * 1024.0) as i64)
    }

    /// Per-buffer hard limit in bytes.
    pub fn hard_limit_bytes(&self) -> i64 {
        self.ram_per_thread_hard_limit_mb as i64 * 1024 * 1024
    }
}

/// Full writer configuration: settings plus pluggable components.
#[derive(Clone)]
pub struct IndexWriterConfig {
    /// Plain parameters.
    pub settings: IndexWriterSettings,
    /// Analyzer for text fields.
    pub analyzer: Arc<dyn Analyzer>,
    /// Segment file format.
    pub codec: Arc<dyn Codec>,
    /// Picks the merges to run.
    pub merge_policy: Arc<dyn MergePolicy>,
    /// Runs the merges.
    pub merge_scheduler: Arc<dyn MergeScheduler>,
    /// Decides which buffers to flush.
    pub flush_policy: Arc<dyn FlushPolicy>,
}

impl Default for IndexWriterConfig {
    fn default() -> Self {
        IndexWriterConfig {
            settings: IndexWriterSettings::default(),
            analyzer: Arc::new(StandardAnalyzer::new()),
            codec: Arc::new(DefaultCodec::new()),
            merge_policy: Arc::new(TieredMergePolicy::default()),
            merge_scheduler: Arc::new(ConcurrentMergeScheduler::default()),
            flush_policy: Arc::new(FlushByRamOrCountsPolicy::new()),
        }
    }
}

impl fmt::Debug for IndexWriterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexWriterConfig")
            .field("settings", &self.settings)
            .field("analyzer", &self.analyzer.name())
            .field("codec", &self.codec.name())
            .field("merge_policy", &self.merge_policy)
            .field("merge_scheduler", &self.merge_scheduler)
            .field("flush_policy", &self.flush_policy)
            .finish()
    }
}

impl IndexWriterConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the open mode.
    pub fn with_open_mode(mut self, mode: OpenMode) -> Self {
        self.settings.open_mode = mode;
        self
    }

    /// Set the RAM buffer size; `None` disables flushing by RAM.
    pub fn with_ram_buffer_size_mb(mut self, mb: Option<f64>) -> Self {
        self.settings.ram_buffer_size_mb = mb;
        self
    }

    /// Set the per-buffer document limit; `None` disables it.
    pub fn with_max_buffered_docs(mut self, docs: Option<usize>) -> Self {
        self.settings.max_buffered_docs = docs;
        self
    }

    /// Set the buffered delete-term limit; `None` disables it.
    pub fn with_max_buffered_delete_terms(mut self, terms: Option<usize>) -> Self {
        self.settings.max_buffered_delete_terms = terms;
        self
    }

    /// Set the per-buffer hard limit.
    pub fn with_ram_per_thread_hard_limit_mb(mut self, mb: u32) -> Self {
        self.settings.ram_per_thread_hard_limit_mb = mb;
        self
    }

    /// Set the stall multiplier.
    pub fn with_stall_ram_multiplier(mut self, multiplier: f64) -> Self {
        self.settings.stall_ram_multiplier = multiplier;
        self
    }

    /// Set the number of per-thread buffers.
    pub fn with_max_thread_states(mut self, states: usize) -> Self {
        self.settings.max_thread_states = states;
        self
    }

    /// Enable or disable reader pooling.
    pub fn with_reader_pooling(mut self, pooling: bool) -> Self {
        self.settings.reader_pooling = pooling;
        self
    }

    /// Keep or drop fully deleted segments.
    pub fn with_keep_fully_deleted_segments(mut self, keep: bool) -> Self {
        self.settings.keep_fully_deleted_segments = keep;
        self
    }

    /// Assert RAM accounting bounds in release builds.
    pub fn with_check_ram_invariant(mut self, check: bool) -> Self {
        self.settings.check_ram_invariant = check;
        self
    }

    /// Set the analyzer.
    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Set the codec.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Set the merge policy.
    pub fn with_merge_policy(mut self, policy: Arc<dyn MergePolicy>) -> Self {
        self.merge_policy = policy;
        self
    }

    /// Set the merge scheduler.
    pub fn with_merge_scheduler(mut self, scheduler: Arc<dyn MergeScheduler>) -> Self {
        self.merge_scheduler = scheduler;
        self
    }

    /// Set the flush policy.
    pub fn with_flush_policy(mut self, policy: Arc<dyn FlushPolicy>) -> Self {
        self.flush_policy = policy;
        self
    }
}
