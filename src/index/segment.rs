//! Segment metadata, generations and commit points.
//!
//! A [`SegmentInfo`] is written once, when a segment is flushed or merged,
//! and never changes. Everything that moves afterwards (deletes, doc-values
//! updates, the generation of the delete packets already applied) lives in
//! a [`SegmentCommitInfo`] wrapped around it. [`SegmentInfos`] is the ordered
//! list of live segments and knows how to persist itself as a `segments_N`
//! commit file.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};
use crate::storage::{self, Storage};

/// Prefix of commit files: `segments_1`, `segments_2`, ...
pub const SEGMENTS_PREFIX: &str = "segments_";

/// Prefix of a commit file that has been written but not yet published.
pub const PENDING_SEGMENTS_PREFIX: &str = "pending_segments_";

/// Diagnostics key recording how a segment was created.
pub const SOURCE_DIAGNOSTIC: &str = "source";

/// Name of the segment created from the given counter value: `_0`, `_1`, ... `_a`, `_10`.
pub fn segment_name(counter: u64) -> String {
    format!("_{}", to_base36(counter))
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Name of the live-docs file for a delete generation.
pub fn live_docs_file_name(segment: &str, del_gen: i64) -> String {
    format!("{segment}_{}.liv", to_base36(del_gen as u64))
}

/// Name of the doc-values update file for a field-infos generation.
pub fn field_updates_file_name(segment: &str, gen: i64) -> String {
    format!("{segment}_{}.dvu", to_base36(gen as u64))
}

/// Name of the commit file for a generation.
pub fn segments_file_name(gen: i64) -> String {
    format!("{SEGMENTS_PREFIX}{gen}")
}

/// Parse the generation out of a `segments_N` file name.
pub fn generation_from_segments_file_name(name: &str) -> Option<i64> {
    name.strip_prefix(SEGMENTS_PREFIX)?.parse().ok()
}

/// Newest commit generation among the given file names.
pub fn last_commit_generation(files: &[String]) -> Option<i64> {
    files
        .iter()
        .filter_map(|f| generation_from_segments_file_name(f))
        .max()
}

/// Immutable description of a segment written by a flush or a merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// Segment name, unique within the index.
    pub name: String,

    /// Number of documents, deleted or not.
    pub max_doc: u32,

    /// Codec that wrote the segment.
    pub codec: String,

    /// The segment's own files (not live-docs or update generations).
    pub files: BTreeSet<String>,

    /// Free-form diagnostics, e.g. `source = flush`.
    pub diagnostics: BTreeMap<String, String>,
}

impl SegmentInfo {
    /// Create segment info for a new segment.
    pub fn new<S: Into<String>>(name: S, max_doc: u32, codec: &str) -> Self {
        SegmentInfo {
            name: name.into(),
            max_doc,
            codec: codec.to_string(),
            files: BTreeSet::new(),
            diagnostics: BTreeMap::new(),
        }
    }

    /// Add a diagnostic entry.
    pub fn with_diagnostic(mut self, key: &str, value: &str) -> Self {
        self.diagnostics.insert(key.to_string(), value.to_string());
        self
    }
}

/// The mutable per-commit state of a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitState {
    /// Number of deleted documents reflected in the current live docs.
    pub del_count: u32,
    /// Generation of the current live-docs file, -1 if none.
    pub del_gen: i64,
    /// Generation the next live-docs file is written under.
    pub next_write_del_gen: i64,
    /// Generation of the current doc-values updates, -1 if none.
    pub field_infos_gen: i64,
    /// Generation the next doc-values update file is written under.
    pub next_write_field_infos_gen: i64,
    /// For each updated field, the generation of the file holding its column.
    pub field_update_gens: BTreeMap<String, i64>,
    /// Doc-values update files by generation.
    pub update_files: BTreeMap<i64, String>,
}

impl Default for CommitState {
    fn default() -> Self {
        CommitState {
            del_count: 0,
            del_gen: -1,
            next_write_del_gen: 1,
            field_infos_gen: -1,
            next_write_field_infos_gen: 1,
            field_update_gens: BTreeMap::new(),
            update_files: BTreeMap::new(),
        }
    }
}

/// A segment as seen by one commit point: immutable info plus the state
/// that moves as deletes and doc-values updates are written.
#[derive(Debug)]
pub struct SegmentCommitInfo {
    info: SegmentInfo,
    state: Mutex<CommitState>,
    size_in_bytes: Mutex<Option<u64>>,
    buffered_deletes_gen: AtomicU64,
}

impl SegmentCommitInfo {
    /// Wrap a freshly written segment.
    pub fn new(info: SegmentInfo) -> Self {
        Self::with_state(info, CommitState::default())
    }

    /// Wrap a segment with existing commit state.
    pub fn with_state(info: SegmentInfo, state: CommitState) -> Self {
        SegmentCommitInfo {
            info,
            state: Mutex::new(state),
            size_in_bytes: Mutex::new(None),
            buffered_deletes_gen: AtomicU64::new(0),
        }
    }

    /// The immutable segment info.
    pub fn info(&self) -> &SegmentInfo {
        &self.info
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Number of documents, deleted or not.
    pub fn max_doc(&self) -> u32 {
        self.info.max_doc
    }

    /// A copy of the current commit state.
    pub fn state(&self) -> CommitState {
        self.state.lock().clone()
    }

    /// Number of deleted documents.
    pub fn del_count(&self) -> u32 {
        self.state.lock().del_count
    }

    /// Set the number of deleted documents.
    pub fn set_del_count(&self, del_count: u32) -> Result<()> {
        if del_count > self.info.max_doc {
            return Err(StrataError::index(format!(
                "del count {del_count} exceeds max doc {} for segment {}",
                self.info.max_doc, self.info.name
            )));
        }
        self.state.lock().del_count = del_count;
        Ok(())
    }

    /// Current delete generation, -1 if the segment has no deletes on disk.
    pub fn del_gen(&self) -> i64 {
        self.state.lock().del_gen
    }

    /// Whether a live-docs file exists.
    pub fn has_deletions(&self) -> bool {
        self.del_gen() != -1
    }

    /// Generation the next live-docs file will be written under.
    pub fn next_write_del_gen(&self) -> i64 {
        self.state.lock().next_write_del_gen
    }

    /// Skip a delete generation, e.g. after a failed write.
    pub fn advance_next_write_del_gen(&self) {
        self.state.lock().next_write_del_gen += 1;
    }

    /// Make the pending write generation the current one.
    pub fn advance_del_gen(&self) {
        let mut state = self.state.lock();
        state.del_gen = state.next_write_del_gen;
        state.next_write_del_gen = state.del_gen + 1;
        drop(state);
        *self.size_in_bytes.lock() = None;
    }

    /// Current doc-values update generation, -1 if none.
    pub fn field_infos_gen(&self) -> i64 {
        self.state.lock().field_infos_gen
    }

    /// Whether doc-values update files exist.
    pub fn has_field_updates(&self) -> bool {
        self.field_infos_gen() != -1
    }

    /// Generation the next update file will be written under.
    pub fn next_write_field_infos_gen(&self) -> i64 {
        self.state.lock().next_write_field_infos_gen
    }

    /// Skip an update generation, e.g. after a failed write.
    pub fn advance_next_write_field_infos_gen(&self) {
        self.state.lock().next_write_field_infos_gen += 1;
    }

    /// Publish an update file written under the pending generation that
    /// now holds the columns of `fields`. Files no field points at any
    /// more are dropped from the segment.
    pub fn advance_field_infos_gen(&self, file: String, fields: &[String]) {
        let mut state = self.state.lock();
        let gen = state.next_write_field_infos_gen;
        state.field_infos_gen = gen;
        state.next_write_field_infos_gen = gen + 1;
        state.update_files.insert(gen, file);
        for field in fields {
            state.field_update_gens.insert(field.clone(), gen);
        }
        let referenced: BTreeSet<i64> = state.field_update_gens.values().copied().collect();
        state.update_files.retain(|g, _| referenced.contains(g));
        drop(state);
        *self.size_in_bytes.lock() = None;
    }

    /// Field name to update-file generation.
    pub fn field_update_gens(&self) -> BTreeMap<String, i64> {
        self.state.lock().field_update_gens.clone()
    }

    /// Update file name for a generation.
    pub fn update_file(&self, gen: i64) -> Option<String> {
        self.state.lock().update_files.get(&gen).cloned()
    }

    /// Generation of the newest delete packet already applied to this segment.
    pub fn buffered_deletes_gen(&self) -> u64 {
        self.buffered_deletes_gen.load(Ordering::Acquire)
    }

    /// Record the newest delete packet applied to this segment.
    pub fn set_buffered_deletes_gen(&self, gen: u64) {
        self.buffered_deletes_gen.store(gen, Ordering::Release);
    }

    /// Every file this segment references in the current generation.
    pub fn files(&self) -> BTreeSet<String> {
        let mut files = self.info.files.clone();
        let state = self.state.lock();
        if state.del_gen != -1 {
            files.insert(live_docs_file_name(&self.info.name, state.del_gen));
        }
        files.extend(state.update_files.values().cloned());
        files
    }

    /// Total size of the referenced files. Cached until the next generation change.
    pub fn size_in_bytes(&self, storage: &dyn Storage) -> Result<u64> {
        if let Some(size) = *self.size_in_bytes.lock() {
            return Ok(size);
        }
        let mut size = 0;
        for file in self.files() {
            size += storage.file_size(&file)?;
        }
        *self.size_in_bytes.lock() = Some(size);
        Ok(size)
    }

    /// Deep copy, detached from later changes to this instance.
    pub fn snapshot(&self) -> SegmentCommitInfo {
        let copy = SegmentCommitInfo::with_state(self.info.clone(), self.state());
        copy.set_buffered_deletes_gen(self.buffered_deletes_gen());
        copy
    }
}

/// Hands out unique segment names, shared by flushes and merges.
#[derive(Debug, Default)]
pub struct SegmentNamer {
    counter: AtomicU64,
}

impl SegmentNamer {
    /// Start naming at `counter`, usually [`SegmentInfos::counter`].
    pub fn new(counter: u64) -> Self {
        SegmentNamer {
            counter: AtomicU64::new(counter),
        }
    }

    /// Allocate the next name.
    pub fn next_name(&self) -> String {
        segment_name(self.counter.fetch_add(1, Ordering::AcqRel))
    }

    /// The counter value the next name will use.
    pub fn counter(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }
}

#[derive(Serialize, Deserialize)]
struct SegmentRecord {
    info: SegmentInfo,
    state: CommitState,
}

#[derive(Serialize, Deserialize)]
struct CommitRecord {
    version: u64,
    counter: u64,
    generation: i64,
    user_data: BTreeMap<String, String>,
    segments: Vec<SegmentRecord>,
}

/// The ordered list of segments making up the index.
#[derive(Debug, Clone)]
pub struct SegmentInfos {
    segments: Vec<Arc<SegmentCommitInfo>>,
    /// Counter used to name new segments.
    pub counter: u64,
    /// Incremented on every change of the segment set.
    pub version: u64,
    generation: i64,
    /// Opaque key/value data stored with each commit.
    pub user_data: BTreeMap<String, String>,
}

impl Default for SegmentInfos {
    fn default() -> Self {
        SegmentInfos {
            segments: Vec::new(),
            counter: 0,
            version: 0,
            generation: -1,
            user_data: BTreeMap::new(),
        }
    }
}

impl SegmentInfos {
    /// An empty segment list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether there are no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Iterate in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<SegmentCommitInfo>> {
        self.segments.iter()
    }

    /// The segments as a slice.
    pub fn as_slice(&self) -> &[Arc<SegmentCommitInfo>] {
        &self.segments
    }

    /// Look up a segment by name.
    pub fn get(&self, name: &str) -> Option<&Arc<SegmentCommitInfo>> {
        self.segments.iter().find(|s| s.name() == name)
    }

    /// Whether a segment with this name is live.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Append a segment.
    pub fn add(&mut self, segment: Arc<SegmentCommitInfo>) {
        self.segments.push(segment);
        self.changed();
    }

    /// Remove a segment by name.
    pub fn remove(&mut self, name: &str) -> Option<Arc<SegmentCommitInfo>> {
        let idx = self.segments.iter().position(|s| s.name() == name)?;
        self.changed();
        Some(self.segments.remove(idx))
    }

    /// Drop all segments.
    pub fn clear(&mut self) {
        self.segments.clear();
        self.changed();
    }

    /// Replace the merged segments by the merge result, which takes the
    /// position of the first merged segment. `None` just removes them.
    pub fn apply_merge_changes(
        &mut self,
        merged: &BTreeSet<String>,
        result: Option<Arc<SegmentCommitInfo>>,
    ) {
        let mut result = result;
        let mut out = Vec::with_capacity(self.segments.len());
        for segment in self.segments.drain(..) {
            if merged.contains(segment.name()) {
                if let Some(new_segment) = result.take() {
                    out.push(new_segment);
                }
            } else {
                out.push(segment);
            }
        }
        if let Some(new_segment) = result {
            out.push(new_segment);
        }
        self.segments = out;
        self.changed();
    }

    /// Total documents across segments, deleted or not.
    pub fn total_max_doc(&self) -> u64 {
        self.segments.iter().map(|s| s.max_doc() as u64).sum()
    }

    /// Record a change of the segment set.
    pub fn changed(&mut self) {
        self.version += 1;
    }

    /// Generation of the last commit read or written, -1 if none.
    pub fn generation(&self) -> i64 {
        self.generation
    }

    /// The generation the next commit will be written under.
    pub fn next_generation(&self) -> i64 {
        if self.generation < 1 { 1 } else { self.generation + 1 }
    }

    /// Adopt the generation of a commit written from a copy of this list.
    pub fn update_generation(&mut self, committed: &SegmentInfos) {
        self.generation = committed.generation;
    }

    /// Commit file of the last commit, if any.
    pub fn segments_file_name(&self) -> Option<String> {
        (self.generation > 0).then(|| segments_file_name(self.generation))
    }

    /// All files referenced by the segments, plus the commit file if requested.
    pub fn files(&self, include_commit_file: bool) -> BTreeSet<String> {
        let mut files = BTreeSet::new();
        for segment in &self.segments {
            files.extend(segment.files());
        }
        if include_commit_file {
            if let Some(name) = self.segments_file_name() {
                files.insert(name);
            }
        }
        files
    }

    /// Copy with every segment snapshotted, for a commit point.
    pub fn deep_clone(&self) -> SegmentInfos {
        SegmentInfos {
            segments: self
                .segments
                .iter()
                .map(|s| Arc::new(s.snapshot()))
                .collect(),
            counter: self.counter,
            version: self.version,
            generation: self.generation,
            user_data: self.user_data.clone(),
        }
    }

    /// Write the pending commit file for the next generation.
    ///
    /// Nothing is visible to readers until [`finish_commit`](Self::finish_commit).
    pub fn prepare_commit(&self, storage: &dyn Storage) -> Result<i64> {
        let generation = self.next_generation();
        let record = CommitRecord {
            version: self.version,
            counter: self.counter,
            generation,
            user_data: self.user_data.clone(),
            segments: self
                .segments
                .iter()
                .map(|s| SegmentRecord {
                    info: s.info().clone(),
                    state: s.state(),
                })
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;
        let pending = format!("{PENDING_SEGMENTS_PREFIX}{generation}");
        storage::write_all(storage, &pending, &bytes)?;
        Ok(generation)
    }

    /// Publish a prepared commit by renaming it into place.
    pub fn finish_commit(&mut self, storage: &dyn Storage, generation: i64) -> Result<String> {
        let pending = format!("{PENDING_SEGMENTS_PREFIX}{generation}");
        let name = segments_file_name(generation);
        storage.sync()?;
        storage.rename_file(&pending, &name)?;
        storage.sync()?;
        self.generation = generation;
        Ok(name)
    }

    /// Remove a prepared but unpublished commit.
    pub fn rollback_commit(storage: &dyn Storage, generation: i64) {
        let _ = storage.delete_file(&format!("{PENDING_SEGMENTS_PREFIX}{generation}"));
    }

    /// Read a specific commit.
    pub fn read(storage: &dyn Storage, generation: i64) -> Result<SegmentInfos> {
        let bytes = storage::read_all(storage, &segments_file_name(generation))?;
        let record: CommitRecord = serde_json::from_slice(&bytes)?;
        let segments = record
            .segments
            .into_iter()
            .map(|r| Arc::new(SegmentCommitInfo::with_state(r.info, r.state)))
            .collect();
        Ok(SegmentInfos {
            segments,
            counter: record.counter,
            version: record.version,
            generation,
            user_data: record.user_data,
        })
    }

    /// Read the newest commit in the storage.
    pub fn read_latest(storage: &dyn Storage) -> Result<SegmentInfos> {
        let files = storage.list_files()?;
        match last_commit_generation(&files) {
            Some(generation) => Self::read(storage, generation),
            None => Err(StrataError::index("no segments_N file found in storage")),
        }
    }
}
