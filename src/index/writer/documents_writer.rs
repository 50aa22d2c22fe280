//! The documents writer: the concurrent front end of the index writer.
//!
//! Indexing threads check a per-thread buffer out of the pool, index into it
//! without any shared lock and hand it back. Flush control decides after
//! every document whether a buffer has to be flushed; the thread that
//! triggered it does the flushing itself. Flushed segments and frozen
//! delete packets go through the ticket queue so they publish in the order
//! their packets were frozen. Work the index writer has to do under its own
//! lock is reported through the [`EventQueue`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::analysis::Analyzer;
use crate::document::Document;
use crate::error::{Result, StrataError};
use crate::index::codec::Codec;
use crate::index::field_infos::FieldNumbers;
use crate::index::query::Query;
use crate::index::segment::SegmentNamer;
use crate::index::term::Term;
use crate::index::writer::config::IndexWriterSettings;
use crate::index::writer::delete_queue::DeleteQueue;
use crate::index::writer::doc_values_updates::DocValuesUpdate;
use crate::index::writer::events::{Event, EventQueue};
use crate::index::writer::flush_control::FlushControl;
use crate::index::writer::flush_policy::FlushPolicy;
use crate::index::writer::flush_queue::{FlushPublisher, FlushTicketQueue};
use crate::index::writer::per_thread::PerThreadWriter;
use crate::index::writer::thread_pool::{PerThreadPool, ThreadState};
use crate::index::writer::updates_stream::BufferedUpdatesStream;
use crate::storage::Storage;

/// Every slot of the pool, aborted and held until dropped.
///
/// Returned by [`DocumentsWriter::lock_and_abort_all`]; indexing threads
/// block in the pool until the guard is dropped.
#[derive(Debug)]
pub struct AbortedThreadStates<'a> {
    pool: &'a PerThreadPool,
    states: Vec<ThreadState>,
}

impl Drop for AbortedThreadStates<'_> {
    fn drop(&mut self) {
        for state in self.states.drain(..) {
            self.pool.restore(state);
        }
    }
}

/// Concurrent document buffering and flushing.
#[derive(Debug)]
pub struct DocumentsWriter {
    settings: IndexWriterSettings,
    storage: Arc<dyn Storage>,
    codec: Arc<dyn Codec>,
    field_numbers: Arc<FieldNumbers>,
    namer: Arc<SegmentNamer>,
    flush_control: FlushControl,
    ticket_queue: FlushTicketQueue,
    events: EventQueue,
    num_docs_in_ram: AtomicI64,
    pending_changes_in_full_flush: AtomicBool,
    closed: AtomicBool,
    // serializes deletes, aborts and the delete-queue swap of a full flush
    sync: Mutex<()>,
}

impl DocumentsWriter {
    /// Create a documents writer.
    pub fn new(
        settings: IndexWriterSettings,
        storage: Arc<dyn Storage>,
        codec: Arc<dyn Codec>,
        flush_policy: Arc<dyn FlushPolicy>,
        field_numbers: Arc<FieldNumbers>,
        namer: Arc<SegmentNamer>,
        updates_stream: Arc<BufferedUpdatesStream>,
    ) -> Self {
        let pool = Arc::new(PerThreadPool::new(settings.max_thread_states));
        let flush_control = FlushControl::new(settings.clone(), pool, flush_policy, updates_stream);
        DocumentsWriter {
            settings,
            storage,
            codec,
            field_numbers,
            namer,
            flush_control,
            ticket_queue: FlushTicketQueue::new(),
            events: EventQueue::new(),
            num_docs_in_ram: AtomicI64::new(0),
            pending_changes_in_full_flush: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sync: Mutex::new(()),
        }
    }

    /// Flush control.
    pub fn flush_control(&self) -> &FlushControl {
        &self.flush_control
    }

    /// Events for the index writer.
    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    /// The current delete queue.
    pub fn delete_queue(&self) -> Arc<DeleteQueue> {
        self.flush_control.delete_queue()
    }

    /// Documents buffered in RAM, including documents deleted by failures.
    pub fn num_docs(&self) -> u64 {
        self.num_docs_in_ram.load(Ordering::Acquire).max(0) as u64
    }

    /// Term deletes buffered in the global delete buffer.
    pub fn num_buffered_delete_terms(&self) -> usize {
        self.delete_queue().num_global_term_deletes()
    }

    /// Whether anything is buffered that a flush would publish.
    pub fn any_changes(&self) -> bool {
        self.num_docs_in_ram.load(Ordering::Acquire) != 0
            || self.delete_queue().any_changes()
            || self.ticket_queue.has_tickets()
            || self.pending_changes_in_full_flush.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StrataError::already_closed("documents writer is closed"));
        }
        Ok(())
    }

    fn subtract_flushed_num_docs(&self, num_docs: u32) {
        self.num_docs_in_ram
            .fetch_sub(num_docs as i64, Ordering::AcqRel);
    }

    /// Index one document. Returns true if events were queued.
    pub fn update_document(
        &self,
        doc: &Document,
        analyzer: &dyn Analyzer,
        delete_term: Option<Term>,
    ) -> Result<bool> {
        let has_events = self.pre_update()?;
        let is_update = delete_term.is_some();
        let flushing = self.index_with_thread_state(is_update, |dwpt| {
            dwpt.update_document(doc, analyzer, delete_term)
        })?;
        self.post_update(flushing, has_events)
    }

    /// Index a block of documents atomically. Returns true if events were queued.
    pub fn update_documents(
        &self,
        docs: &[Document],
        analyzer: &dyn Analyzer,
        delete_term: Option<Term>,
    ) -> Result<bool> {
        let has_events = self.pre_update()?;
        let is_update = delete_term.is_some();
        let flushing = self.index_with_thread_state(is_update, |dwpt| {
            dwpt.update_documents(docs, analyzer, delete_term)
        })?;
        self.post_update(flushing, has_events)
    }

    fn index_with_thread_state<F>(&self, is_update: bool, index: F) -> Result<Option<PerThreadWriter>>
    where
        F: FnOnce(&mut PerThreadWriter) -> Result<()>,
    {
        let mut thread_state = self.flush_control.obtain_and_lock();
        let result = self.index_locked(&mut thread_state, is_update, index);
        self.flush_control.release(thread_state);
        result
    }

    fn index_locked<F>(
        &self,
        thread_state: &mut ThreadState,
        is_update: bool,
        index: F,
    ) -> Result<Option<PerThreadWriter>>
    where
        F: FnOnce(&mut PerThreadWriter) -> Result<()>,
    {
        self.ensure_open()?;
        self.ensure_initialized(thread_state);
        let (result, aborted, before) = {
            let Some(dwpt) = thread_state.dwpt.as_mut() else {
                return Err(StrataError::internal("slot has no buffer after initialization"));
            };
            let before = dwpt.num_docs();
            let result = index(dwpt);
            let aborted = dwpt.check_and_reset_aborted();
            if !aborted {
                self.num_docs_in_ram
                    .fetch_add((dwpt.num_docs() - before) as i64, Ordering::AcqRel);
            }
            (result, aborted, before)
        };
        if aborted {
            warn!("indexing aborted the buffer of slot {}", thread_state.ord());
            self.subtract_flushed_num_docs(before);
            self.flush_control.do_on_abort(thread_state);
        }
        result?;
        Ok(self.flush_control.do_after_document(thread_state, is_update))
    }

    fn ensure_initialized(&self, thread_state: &mut ThreadState) {
        if thread_state.dwpt.is_none() {
            thread_state.dwpt = Some(PerThreadWriter::new(
                self.namer.next_name(),
                Arc::clone(&self.storage),
                Arc::clone(&self.codec),
                Arc::clone(&self.field_numbers),
                self.flush_control.delete_queue(),
            ));
        }
    }

    fn pre_update(&self) -> Result<bool> {
        self.ensure_open()?;
        let mut has_events = false;
        if self.flush_control.any_stalled_threads() || self.flush_control.num_queued_flushes() > 0 {
            debug!("queued or stalled flushes, helping out before indexing");
            loop {
                while let Some(dwpt) = self.flush_control.next_pending_flush() {
                    has_events |= self.do_flush(dwpt)?;
                }
                if self.flush_control.any_stalled_threads() {
                    debug!("indexing is stalled; waiting");
                }
                self.flush_control.wait_if_stalled();
                if self.flush_control.num_queued_flushes() == 0 {
                    break;
                }
            }
        }
        Ok(has_events)
    }

    fn post_update(&self, flushing: Option<PerThreadWriter>, has_events: bool) -> Result<bool> {
        let mut has_events = has_events | self.apply_all_deletes(&self.delete_queue());
        match flushing {
            Some(dwpt) => has_events |= self.do_flush(dwpt)?,
            None => {
                if let Some(dwpt) = self.flush_control.next_pending_flush() {
                    has_events |= self.do_flush(dwpt)?;
                }
            }
        }
        Ok(has_events)
    }

    fn do_flush(&self, dwpt: PerThreadWriter) -> Result<bool> {
        let mut has_events = false;
        let mut next = Some(dwpt);
        while let Some(mut flushing) = next.take() {
            has_events = true;
            let ticket = self.ticket_queue.add_flush_ticket(&mut flushing);
            let num_docs = flushing.num_docs();
            let outcome = flushing.flush();
            self.subtract_flushed_num_docs(num_docs);

            let outcome = match outcome {
                Ok(flushed) => {
                    let fully_deleted = flushed.del_count == flushed.segment.max_doc();
                    if fully_deleted && !self.settings.keep_fully_deleted_segments {
                        info!(
                            "dropping flushed segment {}: all {} documents are deleted",
                            flushed.segment.name(),
                            num_docs
                        );
                        self.events.put(Event::DeleteNewFiles {
                            files: flushed.segment.files(),
                        });
                        self.ticket_queue.mark_ticket_dropped(&ticket);
                    } else {
                        self.ticket_queue.add_segment(&ticket, flushed);
                    }
                    Ok(())
                }
                Err(e) => {
                    warn!("flush of segment {} failed: {e}", flushing.segment_name());
                    self.events.put(Event::FlushFailed {
                        segment: flushing.segment_name().to_string(),
                    });
                    self.ticket_queue.mark_ticket_failed(&ticket);
                    Err(e)
                }
            };

            let backlog = self.ticket_queue.ticket_count() >= self.flush_control.pool().num_slots();
            self.flush_control.do_after_flush(flushing.segment_name());
            flushing.check_and_reset_aborted();
            outcome?;

            if backlog {
                // publishing cannot keep up with flushing threads
                self.events.put(Event::ForcedPurge);
                break;
            }
            next = self.flush_control.next_pending_flush();
        }

        if has_events {
            self.events.put(Event::MergePending);
        }
        if let Some(limit) = self.settings.ram_buffer_bytes() {
            let delete_bytes = self.flush_control.delete_bytes_used();
            if delete_bytes > limit / 2 {
                debug!("force apply deletes: {delete_bytes} delete bytes vs RAM buffer {limit}");
                has_events = true;
                if !self.apply_all_deletes(&self.delete_queue()) {
                    self.events.put(Event::ApplyDeletes);
                }
            }
        }
        Ok(has_events)
    }

    fn apply_all_deletes(&self, delete_queue: &DeleteQueue) -> bool {
        if !self.flush_control.get_and_reset_apply_all_deletes() {
            return false;
        }
        if !self.flush_control.is_full_flush() {
            self.ticket_queue.add_deletes(delete_queue);
        }
        self.events.put(Event::ApplyDeletes);
        true
    }

    /// Delete every document containing any of the terms.
    pub fn delete_terms(&self, terms: Vec<Term>) -> Result<bool> {
        let _sync = self.sync.lock();
        let delete_queue = self.delete_queue();
        delete_queue.add_delete(terms);
        self.flush_control.do_on_delete();
        Ok(self.apply_all_deletes(&delete_queue))
    }

    /// Delete every document matching any of the queries.
    pub fn delete_queries(&self, queries: Vec<Query>) -> Result<bool> {
        let _sync = self.sync.lock();
        let delete_queue = self.delete_queue();
        delete_queue.add_delete_queries(queries);
        self.flush_control.do_on_delete();
        Ok(self.apply_all_deletes(&delete_queue))
    }

    /// Set a numeric doc value on every document containing `term`.
    pub fn update_numeric_doc_value(&self, term: Term, field: &str, value: Option<i64>) -> Result<bool> {
        let _sync = self.sync.lock();
        let delete_queue = self.delete_queue();
        delete_queue.add_numeric_update(DocValuesUpdate::numeric(term, field, value));
        self.flush_control.do_on_delete();
        Ok(self.apply_all_deletes(&delete_queue))
    }

    /// Set a binary doc value on every document containing `term`.
    pub fn update_binary_doc_value(&self, term: Term, field: &str, value: Option<Vec<u8>>) -> Result<bool> {
        let _sync = self.sync.lock();
        let delete_queue = self.delete_queue();
        delete_queue.add_binary_update(DocValuesUpdate::binary(term, field, value));
        self.flush_control.do_on_delete();
        Ok(self.apply_all_deletes(&delete_queue))
    }

    /// Publish finished tickets. A forced purge waits for a concurrent one.
    pub fn purge_buffer(&self, publisher: &dyn FlushPublisher, forced: bool) -> Result<usize> {
        if forced {
            self.ticket_queue.force_purge(publisher)
        } else {
            self.ticket_queue.try_purge(publisher)
        }
    }

    /// Flush every buffer that exists now and publish the results.
    ///
    /// Must be followed by [`finish_full_flush`](Self::finish_full_flush).
    /// Returns true if any segment was flushed.
    pub fn flush_all_threads(&self, publisher: &dyn FlushPublisher) -> Result<bool> {
        let flushing_queue = {
            let _sync = self.sync.lock();
            self.pending_changes_in_full_flush
                .store(self.any_changes(), Ordering::Release);
            self.flush_control.mark_for_full_flush()
        };

        let mut anything_flushed = false;
        while let Some(dwpt) = self.flush_control.next_pending_flush() {
            anything_flushed |= self.do_flush(dwpt)?;
        }
        self.flush_control.wait_for_flush();
        if !anything_flushed && flushing_queue.any_changes() {
            debug!("full flush without documents, freezing global deletes");
            self.ticket_queue.add_deletes(&flushing_queue);
        }
        self.ticket_queue.force_purge(publisher)?;
        debug_assert!(!flushing_queue.any_changes());
        Ok(anything_flushed)
    }

    /// End a full flush. On failure queued and blocked buffers are aborted.
    pub fn finish_full_flush(&self, success: bool) {
        if success {
            self.flush_control.finish_full_flush();
        } else {
            let discarded = self.flush_control.abort_full_flushes();
            self.num_docs_in_ram
                .fetch_sub(discarded as i64, Ordering::AcqRel);
        }
        self.pending_changes_in_full_flush
            .store(false, Ordering::Release);
    }

    fn abort_thread_state(&self, thread_state: &mut ThreadState) {
        if let Some(dwpt) = thread_state.dwpt.as_mut() {
            self.subtract_flushed_num_docs(dwpt.num_docs());
            dwpt.abort();
            dwpt.check_and_reset_aborted();
        }
        self.flush_control.do_on_abort(thread_state);
    }

    /// Discard everything buffered since the last flush.
    pub fn abort(&self) {
        let _sync = self.sync.lock();
        info!("aborting all buffered documents and deletes");
        self.delete_queue().clear();
        let pool = self.flush_control.pool();
        for ord in 0..pool.num_slots() {
            if let Some(mut thread_state) = pool.take_blocking(ord) {
                self.abort_thread_state(&mut thread_state);
                pool.restore(thread_state);
            }
        }
        let discarded = self.flush_control.abort_pending_flushes();
        self.num_docs_in_ram
            .fetch_sub(discarded as i64, Ordering::AcqRel);
        self.flush_control.wait_for_flush();
    }

    /// Abort everything and keep every slot checked out until the returned
    /// guard is dropped.
    pub fn lock_and_abort_all(&self) -> AbortedThreadStates<'_> {
        let _sync = self.sync.lock();
        info!("locking and aborting all buffers");
        self.delete_queue().clear();
        let pool = self.flush_control.pool();
        let mut states = pool.take_all_blocking();
        for thread_state in &mut states {
            self.abort_thread_state(thread_state);
        }
        self.delete_queue().clear();
        let discarded = self.flush_control.abort_pending_flushes();
        self.num_docs_in_ram
            .fetch_sub(discarded as i64, Ordering::AcqRel);
        self.flush_control.wait_for_flush();
        self.ticket_queue.clear();
        AbortedThreadStates {
            pool: pool.as_ref(),
            states,
        }
    }

    /// Refuse further documents.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.flush_control.set_closed();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
