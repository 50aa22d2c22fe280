//! Segment merging.
//!
//! A [`MergePolicy`] looks at the segments of the index and proposes
//! [`OneMerge`]s; a [`MergeScheduler`] decides on which threads they run;
//! the [`SegmentMerger`] does the actual work of combining readers into one
//! new segment. The writer registers merges, runs them through the scheduler
//! and commits the result.
//!
//! Two policy families are provided:
//!
//! - [`TieredMergePolicy`] (the default) scores candidate windows of
//!   similarly sized segments and prefers merges that reclaim deletes;
//! - [`LogMergePolicy`] groups segments into logarithmic levels, measured
//!   either in bytes ([`LogByteSizeMergePolicy`]) or in documents
//!   ([`LogDocMergePolicy`]).

pub mod log;
pub mod merger;
pub mod policy;
pub mod scheduler;
pub mod tiered;

pub use self::log::{LogByteSizeMergePolicy, LogDocMergePolicy, LogMergePolicy, LogMergePolicyConfig};
pub use merger::{DocMap, MergedSegment, SegmentMerger};
pub use policy::{
    MergePolicy, MergeSpecification, MergeTrigger, NoMergePolicy, OneMerge, SegmentStats,
};
pub use scheduler::{
    ConcurrentMergeScheduler, ConcurrentMergeSchedulerConfig, MergeScheduler, MergeSource,
    SerialMergeScheduler,
};
pub use tiered::{TieredMergePolicy, TieredMergePolicyConfig};
