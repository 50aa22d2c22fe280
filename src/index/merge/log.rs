//! Log-structured merge policies.
//!
//! Segments are bucketed into levels by the logarithm (base `merge_factor`)
//! of their size. Starting from the oldest segment, each run of
//! `merge_factor` adjacent segments within `LEVEL_LOG_SPAN` of the highest
//! remaining level is merged. Unlike the tiered policy only adjacent
//! segments merge, so document order is preserved.
//!
//! "Size" is bytes for [`LogByteSizeMergePolicy`] and documents for
//! [`LogDocMergePolicy`].

use std::fmt::Debug;
use std::marker::PhantomData;

use ahash::AHashMap;
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};
use crate::index::merge::policy::{MergePolicy, MergeSpecification, MergeTrigger, OneMerge, SegmentStats};

/// Segments within this many levels of the top level form one level.
pub const LEVEL_LOG_SPAN: f64 = 0.75;

/// Default segments merged at once.
pub const DEFAULT_MERGE_FACTOR: usize = 10;

const MB: f64 = 1024.0 * 1024.0;

/// Tunables of the log policies. Sizes are in the policy's unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMergePolicyConfig {
    /// Segments merged at once; also the log base of levels.
    pub merge_factor: usize,
    /// Segments smaller than this all share the lowest level.
    pub min_merge_size: u64,
    /// Segments at least this large are never merged naturally.
    pub max_merge_size: u64,
    /// Segments larger than this are left alone by forced merges.
    pub max_merge_size_for_forced_merge: u64,
    /// Segments with at least this many documents are never merged.
    pub max_merge_docs: u64,
    /// Discount sizes by the fraction of deleted documents.
    pub calibrate_size_by_deletes: bool,
}

impl LogMergePolicyConfig {
    /// Check the value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.merge_factor < 2 {
            return Err(StrataError::invalid_argument("merge_factor cannot be less than 2"));
        }
        Ok(())
    }
}

/// How a log policy measures segments.
pub trait LogSize: Debug + Send + Sync + 'static {
    /// Policy name for logging.
    const NAME: &'static str;

    /// Defaults for this measure.
    fn default_config() -> LogMergePolicyConfig;

    /// Size of a segment in this measure.
    fn size(segment: &SegmentStats, calibrate_by_deletes: bool) -> u64;
}

/// Measure segments in bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteSize;

impl LogSize for ByteSize {
    const NAME: &'static str = "LogByteSizeMergePolicy";

    fn default_config() -> LogMergePolicyConfig {
        LogMergePolicyConfig {
            merge_factor: DEFAULT_MERGE_FACTOR,
            min_merge_size: (1.6 * MB) as u64,
            max_merge_size: (2048.0 * MB) as u64,
            max_merge_size_for_forced_merge: u64::MAX,
            max_merge_docs: i32::MAX as u64,
            calibrate_size_by_deletes: true,
        }
    }

    fn size(segment: &SegmentStats, calibrate_by_deletes: bool) -> u64 {
        if calibrate_by_deletes {
            segment.size()
        } else {
            segment.size_in_bytes
        }
    }
}

/// Measure segments in documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocCount;

impl LogSize for DocCount {
    const NAME: &'static str = "LogDocMergePolicy";

    fn default_config() -> LogMergePolicyConfig {
        LogMergePolicyConfig {
            merge_factor: DEFAULT_MERGE_FACTOR,
            min_merge_size: 1000,
            max_merge_size: u64::MAX,
            max_merge_size_for_forced_merge: u64::MAX,
            max_merge_docs: i32::MAX as u64,
            calibrate_size_by_deletes: true,
        }
    }

    fn size(segment: &SegmentStats, calibrate_by_deletes: bool) -> u64 {
        size_docs(segment, calibrate_by_deletes)
    }
}

fn size_docs(segment: &SegmentStats, calibrate_by_deletes: bool) -> u64 {
    if calibrate_by_deletes {
        segment.num_docs()
    } else {
        segment.max_doc() as u64
    }
}

/// Log merge policy over a size measure.
#[derive(Debug, Clone)]
pub struct LogMergePolicy<S: LogSize> {
    config: LogMergePolicyConfig,
    _measure: PhantomData<S>,
}

/// Log merge policy measuring segments in bytes.
pub type LogByteSizeMergePolicy = LogMergePolicy<ByteSize>;

/// Log merge policy measuring segments in documents.
pub type LogDocMergePolicy = LogMergePolicy<DocCount>;

impl<S: LogSize> Default for LogMergePolicy<S> {
    fn default() -> Self {
        LogMergePolicy {
            config: S::default_config(),
            _measure: PhantomData,
        }
    }
}

impl<S: LogSize> LogMergePolicy<S> {
    /// Policy with the measure's defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy with explicit tunables.
    pub fn with_config(config: LogMergePolicyConfig) -> Result<Self> {
        config.validate()?;
        Ok(LogMergePolicy {
            config,
            _measure: PhantomData,
        })
    }

    /// Current tunables.
    pub fn config(&self) -> &LogMergePolicyConfig {
        &self.config
    }

    fn size(&self, segment: &SegmentStats) -> u64 {
        S::size(segment, self.config.calibrate_size_by_deletes)
    }

    fn size_docs(&self, segment: &SegmentStats) -> u64 {
        size_docs(segment, self.config.calibrate_size_by_deletes)
    }

    fn too_large_for_forced_merge(&self, segment: &SegmentStats) -> bool {
        self.size(segment) > self.config.max_merge_size_for_forced_merge
            || self.size_docs(segment) > self.config.max_merge_docs
    }

    fn merge_of(segments: &[SegmentStats]) -> OneMerge {
        OneMerge::new(segments.iter().map(|s| s.info.clone()).collect())
    }

    fn is_merged(
        &self,
        segments: &[SegmentStats],
        max_num_segments: usize,
        segments_to_merge: &AHashMap<String, bool>,
    ) -> bool {
        let mut num_to_merge = 0;
        let mut merge_info = None;
        let mut segment_is_original = false;
        for segment in segments {
            if num_to_merge > max_num_segments {
                break;
            }
            if let Some(&is_original) = segments_to_merge.get(segment.name()) {
                segment_is_original = is_original;
                num_to_merge += 1;
                merge_info = Some(segment);
            }
        }
        num_to_merge <= max_num_segments
            && (num_to_merge != 1 || !segment_is_original || merge_info.is_some_and(SegmentStats::is_merged))
    }

    fn find_forced_merges_size_limit(&self, segments: &[SegmentStats], last: usize) -> Option<MergeSpecification> {
        let merge_factor = self.config.merge_factor;
        let mut spec = MergeSpecification::new();
        let mut last = last;
        let mut start = last as isize - 1;
        while start >= 0 {
            let s = start as usize;
            if self.too_large_for_forced_merge(&segments[s]) {
                trace!("forced merge: skip segment {} (too large)", segments[s].name());
                // merge the run after the oversized segment, unless it is
                // a single segment that is already merged
                if last - s - 1 > 1 || (s != last - 1 && !segments[s + 1].is_merged()) {
                    spec.add(Self::merge_of(&segments[s + 1..last]));
                }
                last = s;
            } else if last - s == merge_factor {
                spec.add(Self::merge_of(&segments[s..last]));
                last = s;
            }
            start -= 1;
        }
        if last > 0 && (1 < last || !segments[0].is_merged()) {
            spec.add(Self::merge_of(&segments[..last]));
        }
        (!spec.is_empty()).then_some(spec)
    }

    fn find_forced_merges_max_num_segments(
        &self,
        segments: &[SegmentStats],
        max_num_segments: usize,
        last: usize,
    ) -> Option<MergeSpecification> {
        let merge_factor = self.config.merge_factor;
        let mut spec = MergeSpecification::new();
        let mut last = last;

        while last + 1 >= merge_factor + max_num_segments {
            spec.add(Self::merge_of(&segments[last - merge_factor..last]));
            last -= merge_factor;
        }

        if spec.is_empty() {
            if max_num_segments == 1 {
                if last > 1 || !segments[0].is_merged() {
                    spec.add(Self::merge_of(&segments[..last]));
                }
            } else if last > max_num_segments {
                // pick the cheapest window of adjacent segments that
                // brings the count down to the target
                let final_merge_size = last - max_num_segments + 1;
                let mut best_size = 0u64;
                let mut best_start = 0usize;
                for i in 0..(last - final_merge_size + 1) {
                    let sum: u64 = segments[i..i + final_merge_size]
                        .iter()
                        .map(|s| self.size(s))
                        .sum();
                    if i == 0 || (sum < 2 * self.size(&segments[i - 1]) && sum < best_size) {
                        best_start = i;
                        best_size = sum;
                    }
                }
                spec.add(Self::merge_of(&segments[best_start..best_start + final_merge_size]));
            }
        }
        (!spec.is_empty()).then_some(spec)
    }
}

impl<S: LogSize> MergePolicy for LogMergePolicy<S> {
    fn find_merges(&self, trigger: MergeTrigger, segments: &[SegmentStats]) -> Option<MergeSpecification> {
        let n = segments.len();
        trace!("{} find_merges({trigger:?}): {n} segments", S::NAME);
        if n == 0 {
            return None;
        }
        let merge_factor = self.config.merge_factor;
        let norm = (merge_factor as f64).ln();
        let levels: Vec<f64> = segments
            .iter()
            .map(|s| (self.size(s).max(1) as f64).ln() / norm)
            .collect();
        let level_floor = if self.config.min_merge_size == 0 {
            0.0
        } else {
            (self.config.min_merge_size as f64).ln() / norm
        };

        let mut spec: Option<MergeSpecification> = None;
        let mut start = 0;
        while start < n {
            let max_level = levels[start..]
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max);

            let level_bottom = if max_level <= level_floor {
                // every remaining segment is below the floor
                -1.0
            } else {
                let bottom = max_level - LEVEL_LOG_SPAN;
                if bottom < level_floor { level_floor } else { bottom }
            };

            let mut upto = n - 1;
            while upto > start && levels[upto] < level_bottom {
                upto -= 1;
            }
            trace!("level {level_bottom:.3} to {max_level:.3}: {} segments", upto + 1 - start);

            let mut end = start + merge_factor;
            while end <= upto + 1 {
                let window = &segments[start..end];
                let any_merging = window.iter().any(|s| s.merging);
                let any_too_large = window.iter().any(|s| {
                    self.size(s) >= self.config.max_merge_size
                        || self.size_docs(s) >= self.config.max_merge_docs
                });
                if !any_merging && !any_too_large {
                    let merge = Self::merge_of(window);
                    debug!("{} add merge {}", S::NAME, merge.seg_string());
                    spec.get_or_insert_with(MergeSpecification::new).add(merge);
                }
                start = end;
                end = start + merge_factor;
            }
            start = upto + 1;
        }
        spec
    }

    fn find_forced_merges(
        &self,
        segments: &[SegmentStats],
        max_segment_count: usize,
        segments_to_merge: &AHashMap<String, bool>,
    ) -> Option<MergeSpecification> {
        let max_segment_count = max_segment_count.max(1);
        if self.is_merged(segments, max_segment_count, segments_to_merge) {
            trace!("already merged; skip");
            return None;
        }

        // only segments up to the last one the forced merge covers take part
        let Some(last) = segments
            .iter()
            .rposition(|s| segments_to_merge.contains_key(s.name()))
            .map(|idx| idx + 1)
        else {
            return None;
        };

        if max_segment_count == 1 && last == 1 && segments[0].is_merged() {
            trace!("already 1 seg; skip");
            return None;
        }

        if segments[..last]
            .iter()
            .any(|s| self.too_large_for_forced_merge(s))
        {
            self.find_forced_merges_size_limit(segments, last)
        } else {
            self.find_forced_merges_max_num_segments(segments, max_segment_count, last)
        }
    }

    fn find_forced_deletes_merges(&self, segments: &[SegmentStats]) -> Option<MergeSpecification> {
        let merge_factor = self.config.merge_factor;
        let mut spec = MergeSpecification::new();
        let mut first_with_deletions: Option<usize> = None;

        for (i, segment) in segments.iter().enumerate() {
            if segment.del_count > 0 {
                match first_with_deletions {
                    None => first_with_deletions = Some(i),
                    Some(first) if i - first == merge_factor => {
                        spec.add(Self::merge_of(&segments[first..i]));
                        first_with_deletions = Some(i);
                    }
                    Some(_) => {}
                }
            } else if let Some(first) = first_with_deletions.take() {
                spec.add(Self::merge_of(&segments[first..i]));
            }
        }
        if let Some(first) = first_with_deletions {
            spec.add(Self::merge_of(&segments[first..]));
        }
        (!spec.is_empty()).then_some(spec)
    }
}
