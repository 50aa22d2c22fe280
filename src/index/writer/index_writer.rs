//! The index writer.
//!
//! [`IndexWriter`] ties the concurrent [`DocumentsWriter`] front end to the
//! segment list. It owns the writer lock, publishes flushed segments and
//! frozen delete packets in ticket order, resolves buffered deletes against
//! the live segments, registers and commits merges and writes commit points.
//!
//! All public operations take `&self`; the writer can be shared between
//! indexing threads behind an `Arc`.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//!
//! use strata::document::Document;
//! use strata::index::{IndexWriter, IndexWriterConfig, Term};
//! use strata::storage::memory::MemoryStorage;
//!
//! # fn main() -> strata::error::Result<()> {
//! let writer = IndexWriter::open(Arc::new(MemoryStorage::new()), IndexWriterConfig::default())?;
//! writer.add_document(&Document::builder().add_keyword("id", "1").build())?;
//! writer.add_document(&Document::builder().add_keyword("id", "2").build())?;
//! writer.delete_terms(vec![Term::new("id", "1")])?;
//! writer.commit()?;
//!
//! let snapshot = writer.get_reader(true)?;
//! assert_eq!(snapshot.num_docs(), 1);
//! writer.close()?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::document::Document;
use crate::error::{Result, StrataError};
use crate::index::deleter::FileDeleter;
use crate::index::field_infos::{DocValuesType, FieldNumbers};
use crate::index::merge::merger::{DocMap, SegmentMerger};
use crate::index::merge::policy::{MergeTrigger, OneMerge, SegmentStats};
use crate::index::merge::scheduler::MergeSource;
use crate::index::query::Query;
use crate::index::reader::{IndexSnapshot, SegmentReader};
use crate::index::segment::{
    SOURCE_DIAGNOSTIC, SegmentCommitInfo, SegmentInfo, SegmentInfos, SegmentNamer,
    last_commit_generation,
};
use crate::index::term::Term;
use crate::index::writer::config::{IndexWriterConfig, OpenMode};
use crate::index::writer::doc_values_updates::{DocValuesValue, FieldUpdates};
use crate::index::writer::documents_writer::DocumentsWriter;
use crate::index::writer::events::Event;
use crate::index::writer::flush_queue::FlushPublisher;
use crate::index::writer::frozen_updates::FrozenBufferedUpdates;
use crate::index::writer::per_thread::FlushedSegment;
use crate::index::writer::readers_pool::{ReaderPool, ReadersAndUpdates};
use crate::index::writer::updates_stream::BufferedUpdatesStream;
use crate::storage::{Storage, StorageLock, WRITE_LOCK_NAME};

const MERGE_WAIT: Duration = Duration::from_millis(1000);

/// Everything guarded by the writer lock.
#[derive(Debug)]
struct WriterState {
    segment_infos: SegmentInfos,
    /// The last commit, restored by rollback.
    rollback_infos: SegmentInfos,
    deleter: FileDeleter,
    merging: AHashSet<String>,
    pending_merges: VecDeque<Arc<OneMerge>>,
    running_merges: Vec<Arc<OneMerge>>,
    merge_exceptions: Vec<Arc<OneMerge>>,
    /// Segments a forced merge must still cover; `true` for segments that
    /// existed when it started.
    segments_to_merge: AHashMap<String, bool>,
    merge_gen: u64,
    stop_merges: bool,
    change_count: u64,
    last_commit_change_count: u64,
}

impl WriterState {
    fn max_num_segments_merges_pending(&self) -> bool {
        self.pending_merges
            .iter()
            .chain(self.running_merges.iter())
            .any(|m| m.max_num_segments().is_some())
    }

    fn is_pending_or_running(&self, merge: &Arc<OneMerge>) -> bool {
        self.pending_merges
            .iter()
            .chain(self.running_merges.iter())
            .any(|m| Arc::ptr_eq(m, merge))
    }
}

/// What `merge_init` reserved for a merge.
#[derive(Debug)]
struct MergeInit {
    name: String,
    gen: u64,
}

/// The source entries and merge-time readers of a running merge.
struct MergeInputs {
    entries: Vec<Arc<ReadersAndUpdates>>,
    readers: Vec<SegmentReader>,
}

/// A commit point prepared under the writer lock.
struct PendingCommit {
    infos: SegmentInfos,
    change_count: u64,
    files: BTreeSet<String>,
}

#[derive(Debug)]
struct WriterInner {
    storage: Arc<dyn Storage>,
    config: IndexWriterConfig,
    field_numbers: Arc<FieldNumbers>,
    namer: Arc<SegmentNamer>,
    updates_stream: Arc<BufferedUpdatesStream>,
    docs_writer: DocumentsWriter,
    pool: ReaderPool,
    state: Mutex<WriterState>,
    merge_done: Condvar,
    full_flush_lock: Mutex<()>,
    commit_lock: Mutex<()>,
    write_lock: Mutex<Option<Box<dyn StorageLock>>>,
    closing: AtomicBool,
    closed: AtomicBool,
}

/// Adds, updates and deletes documents and maintains the segments of an
/// index.
#[derive(Debug)]
pub struct IndexWriter {
    inner: Arc<WriterInner>,
}

impl IndexWriter {
    /// Open a writer on `storage`.
    ///
    /// Takes the storage's write lock for the writer's lifetime. How an
    /// existing commit is treated depends on the configured [`OpenMode`].
    pub fn open(storage: Arc<dyn Storage>, config: IndexWriterConfig) -> Result<Self> {
        config.settings.validate()?;
        let mut write_lock = storage.obtain_lock(WRITE_LOCK_NAME)?;
        match WriterInner::new(Arc::clone(&storage), config) {
            Ok(inner) => {
                *inner.write_lock.lock() = Some(write_lock);
                Ok(IndexWriter {
                    inner: Arc::new(inner),
                })
            }
            Err(e) => {
                if let Err(release_err) = write_lock.release() {
                    warn!("cannot release write lock: {release_err}");
                }
                Err(e)
            }
        }
    }

    /// The writer's configuration.
    pub fn config(&self) -> &IndexWriterConfig {
        &self.inner.config
    }

    /// Add a document.
    pub fn add_document(&self, doc: &Document) -> Result<()> {
        self.inner.update_document(doc, None)
    }

    /// Add a block of documents that become visible atomically.
    pub fn add_documents(&self, docs: &[Document]) -> Result<()> {
        self.inner.update_documents(docs, None)
    }

    /// Delete every document containing `term`, then add `doc`.
    pub fn update_document(&self, term: Term, doc: &Document) -> Result<()> {
        self.inner.update_document(doc, Some(term))
    }

    /// Delete every document containing `term`, then add `docs` as a block.
    pub fn update_documents(&self, term: Term, docs: &[Document]) -> Result<()> {
        self.inner.update_documents(docs, Some(term))
    }

    /// Delete every document containing any of `terms`.
    pub fn delete_terms(&self, terms: Vec<Term>) -> Result<()> {
        self.inner.ensure_open()?;
        if self.inner.docs_writer.delete_terms(terms)? {
            self.inner.process_events(true)?;
        }
        Ok(())
    }

    /// Delete every document matching any of `queries`.
    pub fn delete_queries(&self, queries: Vec<Query>) -> Result<()> {
        self.inner.ensure_open()?;
        if self.inner.docs_writer.delete_queries(queries)? {
            self.inner.process_events(true)?;
        }
        Ok(())
    }

    /// Set the numeric doc value of `field` on every document containing
    /// `term`. `None` unsets it. The field must already exist as a numeric
    /// doc-values field.
    pub fn update_numeric_doc_value(&self, term: Term, field: &str, value: Option<i64>) -> Result<()> {
        self.inner.ensure_open()?;
        if !self.inner.field_numbers.contains(field, DocValuesType::Numeric) {
            return Err(StrataError::invalid_argument(format!(
                "can only update existing numeric doc-values fields, not \"{field}\""
            )));
        }
        if self.inner.docs_writer.update_numeric_doc_value(term, field, value)? {
            self.inner.process_events(true)?;
        }
        Ok(())
    }

    /// Set the binary doc value of `field` on every document containing
    /// `term`. `None` unsets it.
    pub fn update_binary_doc_value(&self, term: Term, field: &str, value: Option<Vec<u8>>) -> Result<()> {
        self.inner.ensure_open()?;
        if !self.inner.field_numbers.contains(field, DocValuesType::Binary) {
            return Err(StrataError::invalid_argument(format!(
                "can only update existing binary doc-values fields, not \"{field}\""
            )));
        }
        if self.inner.docs_writer.update_binary_doc_value(term, field, value)? {
            self.inner.process_events(true)?;
        }
        Ok(())
    }

    /// Drop every document, buffered or committed. Takes effect for
    /// readers immediately and for the storage on the next commit.
    pub fn delete_all(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.delete_all()
    }

    /// Flush buffered documents and resolve buffered deletes.
    pub fn flush(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.flush(true, true)
    }

    /// Flush and write a new commit point.
    pub fn commit(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let _commit = self.inner.commit_lock.lock();
        self.inner.commit_internal()
    }

    /// Flush and open a point-in-time view of the index, including
    /// uncommitted changes. With `apply_all_deletes`, buffered deletes are
    /// resolved first.
    pub fn get_reader(&self, apply_all_deletes: bool) -> Result<IndexSnapshot> {
        self.inner.ensure_open()?;
        self.inner.get_reader(apply_all_deletes)
    }

    /// Merge down to at most `max_num_segments` segments. With `wait`,
    /// returns once the merges finished and reports the first one that
    /// failed.
    pub fn force_merge(&self, max_num_segments: usize, wait: bool) -> Result<()> {
        self.inner.ensure_open()?;
        if max_num_segments == 0 {
            return Err(StrataError::invalid_argument("max_num_segments must be >= 1"));
        }
        self.inner.force_merge(max_num_segments, wait)
    }

    /// Merge away segments whose delete ratio exceeds the policy's limit.
    pub fn force_merge_deletes(&self, wait: bool) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.force_merge_deletes(wait)
    }

    /// Ask the merge policy for merges and hand them to the scheduler.
    pub fn maybe_merge(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.maybe_merge(MergeTrigger::Explicit, None)
    }

    /// Wait until no merge is pending or running. Returns the first merge
    /// failure recorded meanwhile.
    pub fn wait_for_merges(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.wait_for_merges()
    }

    /// Live documents, buffered ones included. Unresolved deletes are not
    /// subtracted.
    pub fn num_docs(&self) -> u64 {
        let state = self.inner.state.lock();
        let segments: u64 = state
            .segment_infos
            .iter()
            .map(|info| (info.max_doc() - self.inner.pool.num_deleted_docs(info)) as u64)
            .sum();
        segments + self.inner.docs_writer.num_docs()
    }

    /// All documents, deleted or not, buffered ones included.
    pub fn max_doc(&self) -> u64 {
        let state = self.inner.state.lock();
        state.segment_infos.total_max_doc() + self.inner.docs_writer.num_docs()
    }

    /// Number of published segments.
    pub fn segment_count(&self) -> usize {
        self.inner.state.lock().segment_infos.len()
    }

    /// Names of the published segments, in index order.
    pub fn segment_names(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .segment_infos
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    /// RAM held by buffered documents and deletes.
    pub fn ram_bytes_used(&self) -> i64 {
        self.inner.docs_writer.flush_control().net_bytes()
            + self.inner.docs_writer.flush_control().delete_bytes_used()
    }

    /// Whether anything changed since the last commit.
    pub fn has_uncommitted_changes(&self) -> bool {
        let changed = {
            let state = self.inner.state.lock();
            state.change_count != state.last_commit_change_count
        };
        changed || self.inner.docs_writer.any_changes() || self.inner.updates_stream.any()
    }

    /// Whether the writer was closed or rolled back.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Flush, wait for merges, commit and release the write lock.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    /// Discard everything since the last commit and close the writer.
    pub fn rollback(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) || self.inner.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.rollback_internal()
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        if let Err(e) = self.inner.close() {
            warn!("closing index writer on drop failed: {e}");
        }
    }
}

impl WriterInner {
    fn new(storage: Arc<dyn Storage>, config: IndexWriterConfig) -> Result<Self> {
        let existing = last_commit_generation(&storage.list_files()?);
        let (committed, create) = match (config.settings.open_mode, existing) {
            (OpenMode::Append, None) => {
                return Err(StrataError::index("no commit found to append to"));
            }
            (OpenMode::Create, Some(gen)) => (SegmentInfos::read(storage.as_ref(), gen)?, true),
            (_, Some(gen)) => (SegmentInfos::read(storage.as_ref(), gen)?, false),
            (_, None) => (SegmentInfos::new(), true),
        };

        // the previous commit stays on disk until the first new commit
        let mut deleter = FileDeleter::new(Arc::clone(&storage), &committed)?;
        let mut segment_infos = committed;
        if create {
            segment_infos.clear();
        }
        deleter.checkpoint(&segment_infos, false)?;

        let field_numbers = Arc::new(FieldNumbers::new());
        for info in segment_infos.iter() {
            let reader = SegmentReader::open(storage.as_ref(), config.codec.as_ref(), Arc::clone(info))?;
            for field in reader.field_infos().iter() {
                field_numbers.add_or_get(&field.name, field.doc_values)?;
            }
        }

        let namer = Arc::new(SegmentNamer::new(segment_infos.counter));
        let updates_stream = Arc::new(BufferedUpdatesStream::new());
        let docs_writer = DocumentsWriter::new(
            config.settings.clone(),
            Arc::clone(&storage),
            Arc::clone(&config.codec),
            Arc::clone(&config.flush_policy),
            Arc::clone(&field_numbers),
            Arc::clone(&namer),
            Arc::clone(&updates_stream),
        );
        let pool = ReaderPool::new(
            Arc::clone(&storage),
            Arc::clone(&config.codec),
            config.settings.reader_pooling,
        );

        info!(
            "opened index writer: mode {:?}, {} segments, commit generation {}",
            config.settings.open_mode,
            segment_infos.len(),
            segment_infos.generation()
        );

        let state = WriterState {
            rollback_infos: segment_infos.deep_clone(),
            segment_infos,
            deleter,
            merging: AHashSet::new(),
            pending_merges: VecDeque::new(),
            running_merges: Vec::new(),
            merge_exceptions: Vec::new(),
            segments_to_merge: AHashMap::new(),
            merge_gen: 0,
            stop_merges: false,
            // a fresh index is committed even when empty
            change_count: u64::from(create),
            last_commit_change_count: 0,
        };

        Ok(WriterInner {
            storage,
            config,
            field_numbers,
            namer,
            updates_stream,
            docs_writer,
            pool,
            state: Mutex::new(state),
            merge_done: Condvar::new(),
            full_flush_lock: Mutex::new(()),
            commit_lock: Mutex::new(()),
            write_lock: Mutex::new(None),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StrataError::already_closed("this index writer is closed"));
        }
        Ok(())
    }

    fn update_document(self: &Arc<Self>, doc: &Document, term: Option<Term>) -> Result<()> {
        self.ensure_open()?;
        if self
            .docs_writer
            .update_document(doc, self.config.analyzer.as_ref(), term)?
        {
            self.process_events(true)?;
        }
        Ok(())
    }

    fn update_documents(self: &Arc<Self>, docs: &[Document], term: Option<Term>) -> Result<()> {
        self.ensure_open()?;
        if self
            .docs_writer
            .update_documents(docs, self.config.analyzer.as_ref(), term)?
        {
            self.process_events(true)?;
        }
        Ok(())
    }

    /// Drain the documents writer's events. Never called with the writer
    /// lock held.
    fn process_events(self: &Arc<Self>, trigger_merge: bool) -> Result<bool> {
        let mut processed = false;
        while let Some(event) = self.docs_writer.events().poll() {
            processed = true;
            match event {
                Event::ApplyDeletes => {
                    self.docs_writer.purge_buffer(&**self, true)?;
                    let mut state = self.state.lock();
                    self.apply_all_deletes_and_updates(&mut state)?;
                }
                Event::MergePending => {
                    self.docs_writer.purge_buffer(&**self, false)?;
                    if trigger_merge {
                        self.maybe_merge(MergeTrigger::SegmentFlush, None)?;
                    }
                }
                Event::ForcedPurge => {
                    self.docs_writer.purge_buffer(&**self, true)?;
                }
                Event::FlushFailed { segment } => {
                    self.state.lock().deleter.refresh(&segment)?;
                }
                Event::DeleteNewFiles { files } => {
                    self.state.lock().deleter.delete_new_files(&files);
                }
            }
        }
        Ok(processed)
    }

    fn checkpoint(&self, state: &mut WriterState) -> Result<()> {
        state.change_count += 1;
        state.segment_infos.changed();
        state.deleter.checkpoint(&state.segment_infos, false)
    }

    /// Resolve every buffered packet against the live segments and drop
    /// segments left without live documents.
    fn apply_all_deletes_and_updates(&self, state: &mut WriterState) -> Result<()> {
        let result = self
            .updates_stream
            .apply_deletes_and_updates(&self.pool, state.segment_infos.as_slice())?;
        if result.any_deletes {
            self.checkpoint(state)?;
        }
        if !self.config.settings.keep_fully_deleted_segments && !result.all_deleted.is_empty() {
            for info in &result.all_deleted {
                // merging segments go away with their merge
                if state.merging.contains(info.name()) {
                    continue;
                }
                info!("dropping fully deleted segment {}", info.name());
                state.segment_infos.remove(info.name());
                state.segments_to_merge.remove(info.name());
                self.pool.drop(info);
            }
            self.checkpoint(state)?;
        }
        self.updates_stream.prune(&state.segment_infos);
        Ok(())
    }

    /// Run a full flush and hand the result to `then`, still inside the
    /// full-flush lock. Returns `then`'s value and whether a segment was
    /// flushed.
    fn full_flush<T, F>(self: &Arc<Self>, then: F) -> Result<(T, bool)>
    where
        F: FnOnce(&mut WriterState) -> Result<T>,
    {
        let _full_flush = self.full_flush_lock.lock();
        let flushed = self
            .docs_writer
            .flush_all_threads(&**self)
            .and_then(|any| self.process_events(false).map(|_| any));
        self.docs_writer.finish_full_flush(flushed.is_ok());
        let any_flushed = flushed?;
        let mut state = self.state.lock();
        let value = then(&mut *state)?;
        Ok((value, any_flushed))
    }

    fn flush(self: &Arc<Self>, trigger_merge: bool, apply_all_deletes: bool) -> Result<()> {
        let ((), any_flushed) = self.full_flush(|state| {
            if apply_all_deletes {
                self.apply_all_deletes_and_updates(state)?;
            }
            Ok(())
        })?;
        debug!("flush done, segments flushed: {any_flushed}");
        if any_flushed && trigger_merge {
            self.maybe_merge(MergeTrigger::FullFlush, None)?;
        }
        Ok(())
    }

    fn get_reader(self: &Arc<Self>, apply_all_deletes: bool) -> Result<IndexSnapshot> {
        let start = Instant::now();
        let (snapshot, any_flushed) = self.full_flush(|state| {
            if apply_all_deletes {
                self.apply_all_deletes_and_updates(state)?;
            }
            self.snapshot(state)
        })?;
        debug!(
            "opened snapshot of {} segments in {:?}",
            snapshot.segment_readers().len(),
            start.elapsed()
        );
        if any_flushed {
            self.maybe_merge(MergeTrigger::FullFlush, None)?;
        }
        Ok(snapshot)
    }

    fn snapshot(&self, state: &mut WriterState) -> Result<IndexSnapshot> {
        let mut readers = Vec::with_capacity(state.segment_infos.len());
        let mut wrote = false;
        for info in state.segment_infos.iter() {
            let Some(rld) = self.pool.get(info, true) else {
                continue;
            };
            let reader = rld.read_only_clone();
            wrote |= self.pool.release(rld)?;
            readers.push(reader?);
        }
        if wrote {
            self.checkpoint(state)?;
        }
        Ok(IndexSnapshot::new(readers, state.segment_infos.version))
    }

    fn commit_internal(self: &Arc<Self>) -> Result<()> {
        let start = Instant::now();
        let (pending, any_flushed) = self.full_flush(|state| {
            self.apply_all_deletes_and_updates(state)?;
            if self.pool.commit(&state.segment_infos)? {
                self.checkpoint(state)?;
            }
            let mut infos = state.segment_infos.deep_clone();
            infos.counter = self.namer.counter();
            let files = infos.files(false);
            state.deleter.inc_ref(&files);
            Ok(PendingCommit {
                infos,
                change_count: state.change_count,
                files,
            })
        })?;
        if any_flushed {
            self.maybe_merge(MergeTrigger::FullFlush, None)?;
        }

        let PendingCommit {
            mut infos,
            change_count,
            files,
        } = pending;
        {
            let mut state = self.state.lock();
            if change_count == state.last_commit_change_count {
                debug!("commit skipped: no changes since the last commit");
                return state.deleter.dec_ref(&files);
            }
        }

        let published = infos
            .prepare_commit(self.storage.as_ref())
            .and_then(|generation| {
                infos
                    .finish_commit(self.storage.as_ref(), generation)
                    .inspect_err(|_| SegmentInfos::rollback_commit(self.storage.as_ref(), generation))
            });

        let mut state = self.state.lock();
        let name = match published {
            Ok(name) => name,
            Err(e) => {
                warn!("commit failed: {e}");
                state.deleter.dec_ref(&files)?;
                return Err(e);
            }
        };
        state.deleter.checkpoint(&infos, true)?;
        state.segment_infos.update_generation(&infos);
        state.last_commit_change_count = change_count;
        state.rollback_infos = infos.deep_clone();
        state.deleter.dec_ref(&files)?;
        info!(
            "committed {name}: {} segments in {:?}",
            infos.len(),
            start.elapsed()
        );
        Ok(())
    }

    fn delete_all(self: &Arc<Self>) -> Result<()> {
        let _full_flush = self.full_flush_lock.lock();
        let aborted = self.docs_writer.lock_and_abort_all();
        self.process_events(false)?;
        let mut state = self.state.lock();
        self.abort_merges(&mut state);
        state.stop_merges = false;
        state.segment_infos.clear();
        state.segments_to_merge.clear();
        self.updates_stream.clear();
        self.pool.drop_all(false)?;
        self.checkpoint(&mut state)?;
        self.field_numbers.clear();
        drop(aborted);
        info!("deleted all documents");
        Ok(())
    }

    /// Abort pending and running merges and wait for running ones to stop.
    /// Leaves `stop_merges` set.
    fn abort_merges(&self, state: &mut parking_lot::MutexGuard<'_, WriterState>) {
        state.stop_merges = true;
        let pending: Vec<Arc<OneMerge>> = state.pending_merges.drain(..).collect();
        for merge in pending {
            debug!("aborting pending merge {}", merge.seg_string());
            merge.abort();
            self.merge_finish(state, &merge);
        }
        for merge in &state.running_merges {
            debug!("aborting running merge {}", merge.seg_string());
            merge.abort();
        }
        while !state.running_merges.is_empty() {
            debug!("waiting for {} running merges to abort", state.running_merges.len());
            self.merge_done.wait_for(state, MERGE_WAIT);
        }
    }

    fn segment_stats(&self, state: &WriterState) -> Result<Vec<SegmentStats>> {
        state
            .segment_infos
            .iter()
            .map(|info| {
                Ok(SegmentStats::new(
                    Arc::clone(info),
                    info.size_in_bytes(self.storage.as_ref())?,
                    self.pool.num_deleted_docs(info),
                    state.merging.contains(info.name()),
                ))
            })
            .collect()
    }

    fn maybe_merge(self: &Arc<Self>, trigger: MergeTrigger, max_num_segments: Option<usize>) -> Result<()> {
        self.ensure_open()?;
        let found = {
            let mut state = self.state.lock();
            self.update_pending_merges(&mut state, trigger, max_num_segments)?
        };
        if found {
            debug!("new merges registered ({trigger:?})");
        }
        let source: Arc<dyn MergeSource> = Arc::clone(self) as Arc<dyn MergeSource>;
        self.config.merge_scheduler.merge(source, trigger)
    }

    fn update_pending_merges(
        &self,
        state: &mut WriterState,
        trigger: MergeTrigger,
        max_num_segments: Option<usize>,
    ) -> Result<bool> {
        if state.stop_merges || self.closed.load(Ordering::Acquire) {
            return Ok(false);
        }
        let stats = self.segment_stats(state)?;
        let spec = match max_num_segments {
            Some(max) => {
                self.config
                    .merge_policy
                    .find_forced_merges(&stats, max, &state.segments_to_merge)
            }
            None => self.config.merge_policy.find_merges(trigger, &stats),
        };
        let Some(spec) = spec else {
            return Ok(false);
        };
        let mut found = false;
        for merge in spec.merges {
            let merge = Arc::new(merge);
            if max_num_segments.is_some() {
                merge.set_max_num_segments(max_num_segments);
            }
            found |= self.register_merge(state, &merge, &stats);
        }
        Ok(found)
    }

    /// Queue a merge unless one of its segments is already merging or gone.
    fn register_merge(&self, state: &mut WriterState, merge: &Arc<OneMerge>, stats: &[SegmentStats]) -> bool {
        if merge.is_registered() {
            return true;
        }
        if state.stop_merges {
            merge.abort();
            return false;
        }
        for info in merge.segments() {
            if state.merging.contains(info.name()) || !self.pool.info_is_live(&state.segment_infos, info) {
                debug!("not registering {}: {} is merging or gone", merge.seg_string(), info.name());
                return false;
            }
        }

        let mut estimated = 0;
        for info in merge.segments() {
            state.merging.insert(info.name().to_string());
            estimated += stats
                .iter()
                .find(|s| s.name() == info.name())
                .map_or(0, SegmentStats::size);
        }
        merge.set_estimated_bytes(estimated);
        merge.set_merge_gen(state.merge_gen);
        merge.set_registered(true);
        debug!(
            "registered merge {} (~{} bytes)",
            merge.seg_string(),
            estimated
        );
        state.pending_merges.push_back(Arc::clone(merge));
        true
    }

    fn merge_finish(&self, state: &mut WriterState, merge: &Arc<OneMerge>) {
        if merge.is_registered() {
            for info in merge.segments() {
                state.merging.remove(info.name());
                if let Some(rld) = self.pool.get(info, false) {
                    rld.drop_merging_updates();
                }
            }
            merge.set_registered(false);
        }
        state.running_merges.retain(|m| !Arc::ptr_eq(m, merge));
        self.merge_done.notify_all();
    }

    fn run_merge(&self, merge: &Arc<OneMerge>) -> Result<()> {
        let start = Instant::now();
        let result = match self.merge_init(merge) {
            Ok(init) => {
                let result = self.merge_middle(merge, &init);
                if result.is_err() {
                    let mut state = self.state.lock();
                    if let Err(e) = state.deleter.refresh(&init.name) {
                        warn!("cannot clean up files of failed merge {}: {e}", init.name);
                    }
                }
                result
            }
            Err(e) => Err(e),
        };

        let mut state = self.state.lock();
        self.merge_finish(&mut state, merge);
        match result {
            Ok(()) => {
                info!("merge {} done in {:?}", merge.seg_string(), start.elapsed());
                let closing = self.closing.load(Ordering::Acquire);
                if !merge.is_aborted() && (merge.max_num_segments().is_some() || !closing) {
                    // picked up by the scheduler's next call to next_merge
                    if let Err(e) = self.update_pending_merges(
                        &mut state,
                        MergeTrigger::MergeFinished,
                        merge.max_num_segments(),
                    ) {
                        warn!("cannot look for follow-up merges: {e}");
                    }
                }
                Ok(())
            }
            Err(e) if e.is_merge_aborted() => {
                debug!("merge {} aborted", merge.seg_string());
                Ok(())
            }
            Err(e) => {
                warn!("merge {} failed: {e}", merge.seg_string());
                merge.set_error(e.to_string());
                if merge.merge_gen() == state.merge_gen
                    && !state.merge_exceptions.iter().any(|m| Arc::ptr_eq(m, merge))
                {
                    state.merge_exceptions.push(Arc::clone(merge));
                }
                Err(e)
            }
        }
    }

    /// Bring the merged segments up to date with buffered deletes and
    /// reserve the new segment's name.
    fn merge_init(&self, merge: &Arc<OneMerge>) -> Result<MergeInit> {
        let mut state = self.state.lock();
        if state.stop_merges {
            merge.abort();
            return Err(StrataError::merge_aborted(format!(
                "merge {} aborted: merges are stopped",
                merge.seg_string()
            )));
        }
        merge.check_aborted()?;

        let result = self
            .updates_stream
            .apply_deletes_and_updates(&self.pool, merge.segments())?;
        if result.any_deletes {
            self.checkpoint(&mut state)?;
        }
        let name = self.namer.next_name();
        self.updates_stream.prune(&state.segment_infos);
        debug!(
            "merge init {} into {name} at deletes gen {}",
            merge.seg_string(),
            result.gen
        );
        Ok(MergeInit {
            name,
            gen: result.gen,
        })
    }

    fn merge_middle(&self, merge: &Arc<OneMerge>, init: &MergeInit) -> Result<()> {
        merge.check_aborted()?;
        let mut inputs = MergeInputs {
            entries: Vec::with_capacity(merge.segments().len()),
            readers: Vec::with_capacity(merge.segments().len()),
        };
        let outcome = self.open_merge_inputs(merge, &mut inputs).and_then(|()| self.merge_and_commit(merge, init, &inputs));
        if outcome.is_err() {
            self.release_merge_inputs(inputs);
        }
        outcome
    }

    fn open_merge_inputs(&self, merge: &Arc<OneMerge>, inputs: &mut MergeInputs) -> Result<()> {
        for info in merge.segments() {
            let rld = self.pool.get(info, true).ok_or_else(|| {
                StrataError::internal(format!("no pool entry for merging segment {}", info.name()))
            })?;
            let reader = {
                let _state = self.state.lock();
                rld.reader_for_merge()
            };
            inputs.entries.push(rld);
            inputs.readers.push(reader?);
        }
        Ok(())
    }

    fn release_merge_inputs(&self, inputs: MergeInputs) {
        let mut state = self.state.lock();
        let mut wrote = false;
        for rld in inputs.entries {
            rld.drop_merging_updates();
            match self.pool.release(rld) {
                Ok(w) => wrote |= w,
                Err(e) => warn!("cannot release merge input: {e}"),
            }
        }
        if wrote {
            if let Err(e) = self.checkpoint(&mut state) {
                warn!("checkpoint after releasing merge inputs failed: {e}");
            }
        }
    }

    fn merge_and_commit(&self, merge: &Arc<OneMerge>, init: &MergeInit, inputs: &MergeInputs) -> Result<()> {
        let merged = SegmentMerger::new(&inputs.readers, &self.field_numbers).merge(merge)?;
        merge.check_aborted()?;

        let mut info = SegmentInfo::new(&init.name, merged.data.max_doc, self.config.codec.name())
            .with_diagnostic(SOURCE_DIAGNOSTIC, "merge");
        if merged.data.max_doc > 0 {
            info.files = self
                .config
                .codec
                .write_segment(self.storage.as_ref(), &init.name, &merged.data)?;
        }
        let info = Arc::new(SegmentCommitInfo::new(info));
        info.set_buffered_deletes_gen(init.gen);
        merge.set_info(Arc::clone(&info));

        self.commit_merge(merge, inputs, &merged.doc_maps, info)
    }

    /// Collect deletes and doc-values updates that reached the merged
    /// segments while the merge ran, renumbered for the merged segment.
    fn carried_changes(&self, inputs: &MergeInputs, doc_maps: &[DocMap]) -> (Vec<u32>, FieldUpdates) {
        let mut deletes = Vec::new();
        let mut updates = FieldUpdates::new();
        for ((rld, reader), map) in inputs.entries.iter().zip(&inputs.readers).zip(doc_maps) {
            if let Some(current) = rld.live_docs() {
                for doc in 0..reader.max_doc() {
                    if reader.is_live(doc) && !current.is_live(doc) {
                        if let Some(new_doc) = map.get(doc) {
                            deletes.push(new_doc);
                        }
                    }
                }
            }
            let merging = rld.merging_field_updates();
            for (field, values) in &merging.numeric {
                for (&doc, value) in values {
                    if let Some(new_doc) = map.get(doc) {
                        updates.add(field, new_doc, &DocValuesValue::Numeric(*value));
                    }
                }
            }
            for (field, values) in &merging.binary {
                for (&doc, value) in values {
                    if let Some(new_doc) = map.get(doc) {
                        updates.add(field, new_doc, &DocValuesValue::Binary(value.clone()));
                    }
                }
            }
        }
        (deletes, updates)
    }

    fn commit_merge(
        &self,
        merge: &Arc<OneMerge>,
        inputs: &MergeInputs,
        doc_maps: &[DocMap],
        info: Arc<SegmentCommitInfo>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if merge.is_aborted() {
            state.deleter.delete_new_files(&info.files());
            return Err(StrataError::merge_aborted(format!(
                "merge {} aborted before commit",
                merge.seg_string()
            )));
        }

        let (deletes, updates) = self.carried_changes(inputs, doc_maps);
        let merged_rld = if deletes.is_empty() && !updates.any() {
            None
        } else {
            let rld = self.pool.get(&info, true).ok_or_else(|| {
                StrataError::internal(format!("no pool entry for merged segment {}", info.name()))
            })?;
            rld.init_writable_live_docs()?;
            for doc in &deletes {
                rld.delete(*doc);
            }
            rld.write_field_updates(&updates)?;
            debug!(
                "carried {} deletes and updates of {:?} into {}",
                deletes.len(),
                updates.fields(),
                info.name()
            );
            Some(rld)
        };

        let all_deleted = info.max_doc() == 0
            || merged_rld
                .as_ref()
                .is_some_and(|rld| rld.num_deleted_docs() == info.max_doc());
        let drop_segment = all_deleted && !self.config.settings.keep_fully_deleted_segments;

        let names: BTreeSet<String> = merge.segment_names().into_iter().collect();
        if drop_segment {
            self.pool.drop(&info);
            state.segment_infos.apply_merge_changes(&names, None);
        } else {
            state
                .segment_infos
                .apply_merge_changes(&names, Some(Arc::clone(&info)));
        }
        for rld in &inputs.entries {
            self.pool.drop(rld.info());
        }
        for name in &names {
            state.segments_to_merge.remove(name);
        }
        if let Some(rld) = merged_rld {
            if !drop_segment {
                self.pool.release(rld)?;
            }
        }
        self.checkpoint(&mut state)?;

        if drop_segment {
            info!("merged segment {} has no live documents; dropped", info.name());
            state.deleter.delete_new_files(&info.files());
        } else if merge.max_num_segments().is_some() {
            state
                .segments_to_merge
                .entry(info.name().to_string())
                .or_insert(false);
        }
        debug!(
            "committed merge {} into {} ({} docs)",
            merge.seg_string(),
            info.name(),
            info.max_doc()
        );
        Ok(())
    }

    fn force_merge(self: &Arc<Self>, max_num_segments: usize, wait: bool) -> Result<()> {
        info!("force merge to {max_num_segments} segments");
        self.flush(true, true)?;
        {
            let mut state = self.state.lock();
            state.merge_exceptions.clear();
            state.merge_gen += 1;
            let names: Vec<String> = state.segment_infos.iter().map(|s| s.name().to_string()).collect();
            state.segments_to_merge = names.into_iter().map(|n| (n, true)).collect();
            let queued: Vec<Arc<OneMerge>> = state
                .pending_merges
                .iter()
                .chain(state.running_merges.iter())
                .cloned()
                .collect();
            for merge in queued {
                merge.set_max_num_segments(Some(max_num_segments));
                if let Some(info) = merge.info() {
                    state.segments_to_merge.insert(info.name().to_string(), true);
                }
            }
        }

        self.maybe_merge(MergeTrigger::Explicit, Some(max_num_segments))?;

        if wait {
            let mut state = self.state.lock();
            loop {
                if let Some(failed) = state
                    .merge_exceptions
                    .iter()
                    .find(|m| m.max_num_segments().is_some())
                {
                    return Err(StrataError::index(format!(
                        "background merge {} hit exception: {}",
                        failed.seg_string(),
                        failed.error().unwrap_or_default()
                    )));
                }
                if !state.max_num_segments_merges_pending() {
                    break;
                }
                self.merge_done.wait_for(&mut state, MERGE_WAIT);
            }
            drop(state);
            self.ensure_open()?;
        }
        Ok(())
    }

    fn force_merge_deletes(self: &Arc<Self>, wait: bool) -> Result<()> {
        info!("force merge deletes");
        self.flush(true, true)?;
        let registered = {
            let mut state = self.state.lock();
            let stats = self.segment_stats(&state)?;
            let spec = self.config.merge_policy.find_forced_deletes_merges(&stats);
            let mut registered = Vec::new();
            for merge in spec.map(|s| s.merges).unwrap_or_default() {
                let merge = Arc::new(merge);
                if self.register_merge(&mut state, &merge, &stats) {
                    registered.push(merge);
                }
            }
            registered
        };

        let source: Arc<dyn MergeSource> = Arc::clone(self) as Arc<dyn MergeSource>;
        self.config
            .merge_scheduler
            .merge(source, MergeTrigger::Explicit)?;

        if wait {
            let mut state = self.state.lock();
            loop {
                if let Some(failed) = registered.iter().find(|m| m.error().is_some()) {
                    return Err(StrataError::index(format!(
                        "background merge {} hit exception: {}",
                        failed.seg_string(),
                        failed.error().unwrap_or_default()
                    )));
                }
                if !registered.iter().any(|m| state.is_pending_or_running(m)) {
                    break;
                }
                self.merge_done.wait_for(&mut state, MERGE_WAIT);
            }
        }
        Ok(())
    }

    fn wait_for_merges(self: &Arc<Self>) -> Result<()> {
        let source: Arc<dyn MergeSource> = Arc::clone(self) as Arc<dyn MergeSource>;
        self.config
            .merge_scheduler
            .merge(source, MergeTrigger::Closing)?;

        let mut state = self.state.lock();
        while !state.pending_merges.is_empty() || !state.running_merges.is_empty() {
            self.merge_done.wait_for(&mut state, MERGE_WAIT);
        }
        let result = match state.merge_exceptions.drain(..).next() {
            Some(failed) => Err(StrataError::index(format!(
                "merge {} failed: {}",
                failed.seg_string(),
                failed.error().unwrap_or_default()
            ))),
            None => Ok(()),
        };
        result
    }

    fn close(self: &Arc<Self>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) || self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("closing index writer");
        let committed = self
            .flush(true, true)
            .and_then(|()| self.wait_for_merges())
            .and_then(|()| {
                let _commit = self.commit_lock.lock();
                self.commit_internal()
            });
        if let Err(e) = &committed {
            warn!("close could not commit, rolling back: {e}");
        }
        let shutdown = self.rollback_internal();
        committed.and(shutdown)
    }

    /// Abort merges and buffers, return to the last commit, release every
    /// resource and mark the writer closed.
    fn rollback_internal(self: &Arc<Self>) -> Result<()> {
        info!("rolling back to the last commit");
        {
            let mut state = self.state.lock();
            self.abort_merges(&mut state);
        }
        self.config.merge_scheduler.close();

        self.docs_writer.close();
        let aborted = self.docs_writer.lock_and_abort_all();
        for event in self.docs_writer.events().drain() {
            let mut state = self.state.lock();
            match event {
                Event::DeleteNewFiles { files } => state.deleter.delete_new_files(&files),
                Event::FlushFailed { segment } => state.deleter.refresh(&segment)?,
                _ => {}
            }
        }

        let result = {
            let mut state = self.state.lock();
            let dropped = self.pool.drop_all(false).map(|_| ());
            self.updates_stream.clear();
            state.segment_infos = state.rollback_infos.deep_clone();
            let state = &mut *state;
            dropped
                .and_then(|()| state.deleter.checkpoint(&state.segment_infos, false))
                .and_then(|()| state.deleter.refresh_all())
                .and_then(|()| state.deleter.close())
        };
        drop(aborted);

        if let Some(mut lock) = self.write_lock.lock().take() {
            lock.release()?;
        }
        self.closed.store(true, Ordering::Release);
        result
    }
}

impl FlushPublisher for WriterInner {
    fn publish_flushed_segment(
        &self,
        segment: FlushedSegment,
        global: Option<Arc<FrozenBufferedUpdates>>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(packet) = global.filter(|p| p.any()) {
            self.updates_stream.push(packet);
        }
        let gen = match segment.private_updates {
            Some(packet) if packet.any() => self.updates_stream.push(Arc::new(packet)),
            _ => self.updates_stream.get_next_gen(),
        };
        let info = segment.segment;
        info.set_buffered_deletes_gen(gen);
        debug!(
            "publishing segment {} ({} docs, {} deleted) at deletes gen {gen}",
            info.name(),
            info.max_doc(),
            segment.del_count
        );
        if self.pool.is_pooling() {
            self.pool.insert_flushed(&info, segment.live_docs);
        }
        state.segment_infos.add(info);
        self.checkpoint(&mut state)
    }

    fn publish_frozen_updates(&self, packet: Arc<FrozenBufferedUpdates>) -> Result<()> {
        let _state = self.state.lock();
        if packet.any() {
            let gen = self.updates_stream.push(packet);
            debug!("published frozen updates at gen {gen}");
        }
        Ok(())
    }
}

impl MergeSource for WriterInner {
    fn next_merge(&self) -> Option<Arc<OneMerge>> {
        let mut state = self.state.lock();
        let merge = state.pending_merges.pop_front()?;
        state.running_merges.push(Arc::clone(&merge));
        Some(merge)
    }

    fn has_pending_merges(&self) -> bool {
        !self.state.lock().pending_merges.is_empty()
    }

    fn merge(&self, merge: &Arc<OneMerge>) -> Result<()> {
        self.run_merge(merge)
    }

    fn discard_merge(&self, merge: &Arc<OneMerge>) {
        let mut state = self.state.lock();
        merge.abort();
        self.merge_finish(&mut state, merge);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::merge::policy::NoMergePolicy;
    use crate::index::merge::scheduler::SerialMergeScheduler;
    use crate::storage::memory::MemoryStorage;

    fn config() -> IndexWriterConfig {
        IndexWriterConfig::default()
            .with_merge_policy(Arc::new(NoMergePolicy))
            .with_merge_scheduler(Arc::new(SerialMergeScheduler::new()))
    }

    fn doc(id: &str, body: &str) -> Document {
        Document::builder()
            .add_keyword("id", id)
            .add_text("body", body)
            .add_numeric("rank", 1)
            .build()
    }

    fn ids(snapshot: &IndexSnapshot) -> Vec<String> {
        let mut ids: Vec<String> = snapshot
            .search(&Query::numeric_range("rank", None, None))
            .into_iter()
            .filter_map(|address| {
                snapshot
                    .stored_fields(address)
                    .iter()
                    .find(|f| f.name == "id")
                    .and_then(|f| f.value.as_text().map(str::to_string))
            })
            .collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_delete_term_hits_earlier_docs_only() {
        let writer = IndexWriter::open(Arc::new(MemoryStorage::new()), config()).unwrap();
        writer
            .add_document(&Document::builder().add_keyword("id", "d1").add_keyword("tag", "t").add_numeric("rank", 1).build())
            .unwrap();
        writer
            .add_document(&Document::builder().add_keyword("id", "d2").add_keyword("tag", "t").add_numeric("rank", 1).build())
            .unwrap();
        writer.delete_terms(vec![Term::new("tag", "t")]).unwrap();
        writer
            .add_document(&Document::builder().add_keyword("id", "d3").add_keyword("tag", "t").add_numeric("rank", 1).build())
            .unwrap();

        let snapshot = writer.get_reader(true).unwrap();
        assert_eq!(ids(&snapshot), vec!["d3"]);
        writer.rollback().unwrap();
    }

    #[test]
    fn test_update_document_replaces() {
        let writer = IndexWriter::open(Arc::new(MemoryStorage::new()), config()).unwrap();
        writer.add_document(&doc("a", "first version")).unwrap();
        writer.commit().unwrap();
        writer
            .update_document(Term::new("id", "a"), &doc("a", "second version"))
            .unwrap();

        let snapshot = writer.get_reader(true).unwrap();
        assert_eq!(snapshot.num_docs(), 1);
        assert_eq!(snapshot.doc_freq(&Term::new("body", "second")), 1);
        writer.close().unwrap();
    }

    #[test]
    fn test_commit_and_reopen() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        {
            let writer = IndexWriter::open(Arc::clone(&storage), config()).unwrap();
            writer.add_document(&doc("a", "alpha")).unwrap();
            writer.add_document(&doc("b", "beta")).unwrap();
            writer.delete_terms(vec![Term::new("id", "a")]).unwrap();
            writer.close().unwrap();
        }

        let writer = IndexWriter::open(
            Arc::clone(&storage),
            config().with_open_mode(OpenMode::Append),
        )
        .unwrap();
        assert_eq!(writer.num_docs(), 1);
        let snapshot = writer.get_reader(true).unwrap();
        assert_eq!(ids(&snapshot), vec!["b"]);
        writer.rollback().unwrap();
    }

    #[test]
    fn test_append_without_commit_fails() {
        let result = IndexWriter::open(
            Arc::new(MemoryStorage::new()),
            config().with_open_mode(OpenMode::Append),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_second_writer_is_locked_out() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let writer = IndexWriter::open(Arc::clone(&storage), config()).unwrap();
        assert!(IndexWriter::open(Arc::clone(&storage), config()).is_err());
        writer.close().unwrap();
        IndexWriter::open(storage, config()).unwrap().close().unwrap();
    }

    #[test]
    fn test_rollback_restores_last_commit() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let writer = IndexWriter::open(Arc::clone(&storage), config()).unwrap();
        writer.add_document(&doc("a", "kept")).unwrap();
        writer.commit().unwrap();
        writer.add_document(&doc("b", "lost")).unwrap();
        writer.flush().unwrap();
        writer.rollback().unwrap();
        assert!(writer.is_closed());
        assert!(writer.add_document(&doc("c", "late")).is_err());

        let writer = IndexWriter::open(storage, config().with_open_mode(OpenMode::Append)).unwrap();
        assert_eq!(writer.max_doc(), 1);
        writer.rollback().unwrap();
    }

    #[test]
    fn test_delete_all() {
        let writer = IndexWriter::open(Arc::new(MemoryStorage::new()), config()).unwrap();
        writer.add_document(&doc("a", "one")).unwrap();
        writer.flush().unwrap();
        writer.add_document(&doc("b", "two")).unwrap();
        writer.delete_all().unwrap();
        assert_eq!(writer.max_doc(), 0);
        assert_eq!(writer.segment_count(), 0);
        writer.add_document(&doc("c", "three")).unwrap();
        assert_eq!(ids(&writer.get_reader(true).unwrap()), vec!["c"]);
        writer.close().unwrap();
    }

    #[test]
    fn test_fully_deleted_segment_is_dropped() {
        let writer = IndexWriter::open(Arc::new(MemoryStorage::new()), config()).unwrap();
        writer.add_document(&doc("a", "one")).unwrap();
        writer.flush().unwrap();
        writer.add_document(&doc("b", "two")).unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.segment_count(), 2);

        writer.delete_terms(vec![Term::new("id", "a")]).unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.segment_count(), 1);
        writer.close().unwrap();
    }

    #[test]
    fn test_force_merge_to_one_segment() {
        let writer = IndexWriter::open(
            Arc::new(MemoryStorage::new()),
            IndexWriterConfig::default().with_merge_scheduler(Arc::new(SerialMergeScheduler::new())),
        )
        .unwrap();
        for i in 0..4 {
            writer.add_document(&doc(&format!("d{i}"), "merge me")).unwrap();
            writer.flush().unwrap();
        }
        writer.delete_terms(vec![Term::new("id", "d2")]).unwrap();
        writer.force_merge(1, true).unwrap();

        assert_eq!(writer.segment_count(), 1);
        let snapshot = writer.get_reader(true).unwrap();
        assert_eq!(snapshot.max_doc(), 3);
        assert_eq!(ids(&snapshot), vec!["d0", "d1", "d3"]);
        writer.close().unwrap();
    }

    #[test]
    fn test_numeric_update_requires_existing_field() {
        let writer = IndexWriter::open(Arc::new(MemoryStorage::new()), config()).unwrap();
        writer.add_document(&doc("a", "x")).unwrap();
        assert!(writer
            .update_numeric_doc_value(Term::new("id", "a"), "missing", Some(3))
            .is_err());
        writer
            .update_numeric_doc_value(Term::new("id", "a"), "rank", Some(7))
            .unwrap();
        let snapshot = writer.get_reader(true).unwrap();
        let hits = snapshot.search(&Query::numeric_range("rank", Some(7), Some(7)));
        assert_eq!(hits.len(), 1);
        writer.close().unwrap();
    }

    #[test]
    fn test_commit_without_changes_keeps_generation() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let writer = IndexWriter::open(Arc::clone(&storage), config()).unwrap();
        writer.add_document(&doc("a", "x")).unwrap();
        writer.commit().unwrap();
        let files = storage.list_files().unwrap();
        writer.commit().unwrap();
        assert_eq!(storage.list_files().unwrap(), files);
        assert!(!writer.has_uncommitted_changes());
        writer.close().unwrap();
    }
}
