//! Merge policy interface and the merge descriptors it produces.

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};
use crate::index::segment::SegmentCommitInfo;

/// What caused the writer to ask for merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MergeTrigger {
    /// A buffer was flushed into a new segment.
    SegmentFlush,
    /// A full flush (commit, reader refresh) finished.
    FullFlush,
    /// The application called `maybe_merge` or `force_merge`.
    Explicit,
    /// A merge finished.
    MergeFinished,
    /// The writer is closing.
    Closing,
}

/// Snapshot of one segment as a merge policy sees it.
#[derive(Debug, Clone)]
pub struct SegmentStats {
    /// The segment.
    pub info: Arc<SegmentCommitInfo>,
    /// Bytes of all files of the segment.
    pub size_in_bytes: u64,
    /// Deleted documents, including deletes not written yet.
    pub del_count: u32,
    /// Whether the segment is part of a running or pending merge.
    pub merging: bool,
}

impl SegmentStats {
    /// Stats for one segment.
    pub fn new(info: Arc<SegmentCommitInfo>, size_in_bytes: u64, del_count: u32, merging: bool) -> Self {
        SegmentStats {
            info,
            size_in_bytes,
            del_count,
            merging,
        }
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        self.info.name()
    }

    /// Documents in the segment, deleted ones included.
    pub fn max_doc(&self) -> u32 {
        self.info.max_doc()
    }

    /// Fraction of documents deleted.
    pub fn delete_ratio(&self) -> f64 {
        if self.max_doc() == 0 {
            0.0
        } else {
            (self.del_count as f64 / self.max_doc() as f64).min(1.0)
        }
    }

    /// Byte size discounted by the fraction of deleted documents.
    pub fn size(&self) -> u64 {
        if self.max_doc() == 0 {
            self.size_in_bytes
        } else {
            (self.size_in_bytes as f64 * (1.0 - self.delete_ratio())) as u64
        }
    }

    /// Live documents.
    pub fn num_docs(&self) -> u64 {
        self.max_doc().saturating_sub(self.del_count) as u64
    }

    /// A segment without deletions needs no merge to be "merged".
    pub fn is_merged(&self) -> bool {
        self.del_count == 0
    }
}

#[derive(Debug, Default)]
struct MergeState {
    aborted: bool,
    paused: bool,
    registered: bool,
    merge_gen: u64,
    max_num_segments: Option<usize>,
    estimated_bytes: u64,
    info: Option<Arc<SegmentCommitInfo>>,
    error: Option<String>,
}

/// One merge: the segments to combine plus its run state.
///
/// The merging thread calls [`check_aborted`](Self::check_aborted) between
/// units of work; it blocks while the merge is paused and fails once the
/// merge is aborted.
pub struct OneMerge {
    segments: Vec<Arc<SegmentCommitInfo>>,
    total_doc_count: u64,
    state: Mutex<MergeState>,
    resumed: Condvar,
}

impl Debug for OneMerge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneMerge")
            .field("segments", &self.segment_names())
            .field("total_doc_count", &self.total_doc_count)
            .finish()
    }
}

impl OneMerge {
    /// A merge of `segments`, in the order given.
    pub fn new(segments: Vec<Arc<SegmentCommitInfo>>) -> Self {
        debug_assert!(!segments.is_empty(), "a merge needs at least one segment");
        let total_doc_count = segments.iter().map(|s| s.max_doc() as u64).sum();
        OneMerge {
            segments,
            total_doc_count,
            state: Mutex::new(MergeState::default()),
            resumed: Condvar::new(),
        }
    }

    /// Segments to merge.
    pub fn segments(&self) -> &[Arc<SegmentCommitInfo>] {
        &self.segments
    }

    /// Names of the segments to merge.
    pub fn segment_names(&self) -> Vec<String> {
        self.segments.iter().map(|s| s.name().to_string()).collect()
    }

    /// Documents across all input segments, deleted ones included.
    pub fn total_doc_count(&self) -> u64 {
        self.total_doc_count
    }

    /// Stop the merge at its next checkpoint.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        self.resumed.notify_all();
    }

    /// Whether [`abort`](Self::abort) was called.
    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    /// Pause or resume the merge.
    pub fn set_pause(&self, paused: bool) {
        let mut state = self.state.lock();
        state.paused = paused;
        if !paused {
            self.resumed.notify_all();
        }
    }

    /// Whether the merge is paused.
    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Block while paused; fail if aborted.
    pub fn check_aborted(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.aborted {
            return Err(StrataError::merge_aborted(self.seg_string()));
        }
        while state.paused {
            self.resumed
                .wait_for(&mut state, Duration::from_millis(1000));
            if state.aborted {
                return Err(StrataError::merge_aborted(self.seg_string()));
            }
        }
        Ok(())
    }

    /// Limit a forced merge targets, if any.
    pub fn max_num_segments(&self) -> Option<usize> {
        self.state.lock().max_num_segments
    }

    /// Record the segment-count target of a forced merge.
    pub fn set_max_num_segments(&self, max: Option<usize>) {
        self.state.lock().max_num_segments = max;
    }

    /// Whether the writer accepted the merge.
    pub fn is_registered(&self) -> bool {
        self.state.lock().registered
    }

    /// Mark the merge as accepted by the writer.
    pub fn set_registered(&self, registered: bool) {
        self.state.lock().registered = registered;
    }

    /// Update-stream generation the merge started at.
    pub fn merge_gen(&self) -> u64 {
        self.state.lock().merge_gen
    }

    /// Record the update-stream generation the merge started at.
    pub fn set_merge_gen(&self, gen: u64) {
        self.state.lock().merge_gen = gen;
    }

    /// Estimated bytes of the merged segment.
    pub fn estimated_bytes(&self) -> u64 {
        self.state.lock().estimated_bytes
    }

    /// Record the estimated size of the merged segment.
    pub fn set_estimated_bytes(&self, bytes: u64) {
        self.state.lock().estimated_bytes = bytes;
    }

    /// The merged segment, once the writer allocated it.
    pub fn info(&self) -> Option<Arc<SegmentCommitInfo>> {
        self.state.lock().info.clone()
    }

    /// Record the merged segment.
    pub fn set_info(&self, info: Arc<SegmentCommitInfo>) {
        self.state.lock().info = Some(info);
    }

    /// Error the merge failed with.
    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    /// Record a failure.
    pub fn set_error(&self, error: String) {
        self.state.lock().error = Some(error);
    }

    /// Human-readable description, e.g. `_0 _1 into _5 [maxNumSegments=1]`.
    pub fn seg_string(&self) -> String {
        let state = self.state.try_lock();
        let mut out = self.segment_names().join(" ");
        if let Some(state) = state {
            if let Some(info) = &state.info {
                out.push_str(" into ");
                out.push_str(info.name());
            }
            if let Some(max) = state.max_num_segments {
                out.push_str(&format!(" [maxNumSegments={max}]"));
            }
            if state.aborted {
                out.push_str(" [ABORTED]");
            }
        }
        out
    }
}

/// Merges proposed by one policy call.
#[derive(Debug, Default)]
pub struct MergeSpecification {
    /// The proposed merges.
    pub merges: Vec<OneMerge>,
}

impl MergeSpecification {
    /// An empty specification.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a merge.
    pub fn add(&mut self, merge: OneMerge) {
        self.merges.push(merge);
    }

    /// Number of merges.
    pub fn len(&self) -> usize {
        self.merges.len()
    }

    /// Whether no merge was proposed.
    pub fn is_empty(&self) -> bool {
        self.merges.is_empty()
    }

    /// Segment names of every merge, for logging.
    pub fn seg_string(&self) -> String {
        self.merges
            .iter()
            .enumerate()
            .map(|(i, m)| format!("{}: {}", i + 1, m.seg_string()))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Decides which segments to merge.
///
/// Policies are pure: they see a snapshot of segment stats and return the
/// merges they would like to run. The writer registers the proposals and
/// hands them to the merge scheduler.
pub trait MergePolicy: Send + Sync + Debug {
    /// Natural merges after a flush or merge.
    fn find_merges(&self, trigger: MergeTrigger, segments: &[SegmentStats]) -> Option<MergeSpecification>;

    /// Merges bringing the segments listed in `segments_to_merge` down to
    /// at most `max_segment_count`. The map value tells whether the segment
    /// existed when the forced merge started.
    fn find_forced_merges(
        &self,
        segments: &[SegmentStats],
        max_segment_count: usize,
        segments_to_merge: &AHashMap<String, bool>,
    ) -> Option<MergeSpecification>;

    /// Merges reclaiming deleted documents.
    fn find_forced_deletes_merges(&self, segments: &[SegmentStats]) -> Option<MergeSpecification>;
}

/// A policy that never merges.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMergePolicy;

impl MergePolicy for NoMergePolicy {
    fn find_merges(&self, _trigger: MergeTrigger, _segments: &[SegmentStats]) -> Option<MergeSpecification> {
        None
    }

    fn find_forced_merges(
        &self,
        _segments: &[SegmentStats],
        _max_segment_count: usize,
        _segments_to_merge: &AHashMap<String, bool>,
    ) -> Option<MergeSpecification> {
        None
    }

    fn find_forced_deletes_merges(&self, _segments: &[SegmentStats]) -> Option<MergeSpecification> {
        None
    }
}
