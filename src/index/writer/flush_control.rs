//! Flush control: the state machine that decides which per-thread buffers
//! flush, keeps the RAM counters honest and orchestrates full flushes.
//!
//! A buffer moves through these states:
//!
//! ```text
//!   Active --(policy / hard limit)--> FlushPending --(checkout)--> CheckedOut --(flushed)--> Retired
//! ```
//!
//! Bytes of active buffers are counted as *active*; bytes of pending,
//! checked-out and blocked buffers as *flushing*. Every transition moves a
//! buffer's bytes between the two counters, so `active + flush` always
//! equals the bytes committed by live buffers.
//!
//! During a full flush every buffer that still follows the old delete queue
//! is forced into the flush queue. Buffers following the new queue that turn
//! pending meanwhile are *blocked* until the full flush finishes, so their
//! segments publish after the full flush's segments.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::{debug, error, trace};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::index::writer::config::IndexWriterSettings;
use crate::index::writer::delete_queue::DeleteQueue;
use crate::index::writer::flush_policy::FlushPolicy;
use crate::index::writer::per_thread::PerThreadWriter;
use crate::index::writer::ram::RamAccountant;
use crate::index::writer::stall_control::StallControl;
use crate::index::writer::thread_pool::{PerThreadPool, ThreadState};
use crate::index::writer::updates_stream::BufferedUpdatesStream;

/// What flush control knows about one pool slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotAccounting {
    /// Bytes last committed for the slot's buffer.
    pub bytes_used: i64,
    /// Documents in the slot's buffer.
    pub num_docs: u32,
    /// Whether the buffer is marked for flush.
    pub flush_pending: bool,
}

#[derive(Debug)]
struct BlockedFlush {
    dwpt: PerThreadWriter,
    bytes: i64,
}

/// The mutable state behind flush control's lock. Flush policies read and
/// update it through the public methods.
#[derive(Debug)]
pub struct FlushState {
    settings: IndexWriterSettings,
    ram: Arc<RamAccountant>,
    slots: Vec<SlotAccounting>,
    num_pending: usize,
    delete_bytes_used: i64,
    num_global_term_deletes: usize,
    apply_all_deletes: bool,
    flushing: HashMap<String, i64>,
    flush_queue: VecDeque<PerThreadWriter>,
    blocked_flushes: Vec<BlockedFlush>,
    full_flush_buffer: Vec<PerThreadWriter>,
    full_flush: bool,
    closed: bool,
}

impl FlushState {
    fn new(settings: IndexWriterSettings, ram: Arc<RamAccountant>) -> Self {
        FlushState {
            settings,
            ram,
            slots: Vec::new(),
            num_pending: 0,
            delete_bytes_used: 0,
            num_global_term_deletes: 0,
            apply_all_deletes: false,
            flushing: HashMap::new(),
            flush_queue: VecDeque::new(),
            blocked_flushes: Vec::new(),
            full_flush_buffer: Vec::new(),
            full_flush: false,
            closed: false,
        }
    }

    /// Writer settings.
    pub fn settings(&self) -> &IndexWriterSettings {
        &self.settings
    }

    /// Bytes of active buffers.
    pub fn active_bytes(&self) -> i64 {
        self.ram.active()
    }

    /// Bytes of buffered deletes, in the delete queue and the update stream.
    pub fn delete_bytes_used(&self) -> i64 {
        self.delete_bytes_used
    }

    /// Term deletes in the delete queue's global buffer.
    pub fn num_global_term_deletes(&self) -> usize {
        self.num_global_term_deletes
    }

    /// Accounting of one slot.
    pub fn slot(&self, ord: usize) -> Option<&SlotAccounting> {
        self.slots.get(ord)
    }

    /// Accounting of every slot seen so far.
    pub fn slots(&self) -> impl Iterator<Item = (usize, &SlotAccounting)> {
        self.slots.iter().enumerate()
    }

    fn slot_mut(&mut self, ord: usize) -> &mut SlotAccounting {
        if self.slots.len() <= ord {
            self.slots.resize(ord + 1, SlotAccounting::default());
        }
        &mut self.slots[ord]
    }

    fn is_pending(&self, ord: usize) -> bool {
        self.slots.get(ord).is_some_and(|s| s.flush_pending)
    }

    /// Mark a slot's buffer pending flush and move its bytes to the
    /// flushing counter. Buffers without documents are left alone.
    pub fn set_flush_pending(&mut self, ord: usize) {
        let slot = self.slot_mut(ord);
        if slot.flush_pending || slot.num_docs == 0 {
            return;
        }
        slot.flush_pending = true;
        let bytes = slot.bytes_used;
        self.ram.move_to_flush(bytes);
        self.num_pending += 1;
        trace!("slot {ord} pending flush with {bytes} bytes");
    }

    /// Ask the writer to apply all buffered deletes.
    pub fn set_apply_all_deletes(&mut self) {
        self.apply_all_deletes = true;
    }
}

/// Coordinates flushing across all per-thread buffers.
#[derive(Debug)]
pub struct FlushControl {
    state: Mutex<FlushState>,
    flushed: Condvar,
    ram: Arc<RamAccountant>,
    stall: StallControl,
    pool: Arc<PerThreadPool>,
    policy: Arc<dyn FlushPolicy>,
    delete_queue: RwLock<Arc<DeleteQueue>>,
    updates_stream: Arc<BufferedUpdatesStream>,
}

impl FlushControl {
    /// Create flush control over a pool.
    pub fn new(
        settings: IndexWriterSettings,
        pool: Arc<PerThreadPool>,
        policy: Arc<dyn FlushPolicy>,
        updates_stream: Arc<BufferedUpdatesStream>,
    ) -> Self {
        let ram = Arc::new(RamAccountant::new());
        FlushControl {
            state: Mutex::new(FlushState::new(settings, Arc::clone(&ram))),
            flushed: Condvar::new(),
            ram,
            stall: StallControl::new(),
            pool,
            policy,
            delete_queue: RwLock::new(Arc::new(DeleteQueue::new(0))),
            updates_stream,
        }
    }

    /// The current delete queue.
    pub fn delete_queue(&self) -> Arc<DeleteQueue> {
        Arc::clone(&self.delete_queue.read())
    }

    /// The RAM counters.
    pub fn ram(&self) -> &Arc<RamAccountant> {
        &self.ram
    }

    /// Bytes of active buffers.
    pub fn active_bytes(&self) -> i64 {
        self.ram.active()
    }

    /// Bytes of pending and flushing buffers.
    pub fn flush_bytes(&self) -> i64 {
        self.ram.flush()
    }

    /// `active + flush`.
    pub fn net_bytes(&self) -> i64 {
        self.ram.net()
    }

    /// Bytes of buffered deletes in the delete queue and the update stream.
    pub fn delete_bytes_used(&self) -> i64 {
        self.delete_queue.read().bytes_used() + self.updates_stream.bytes_used()
    }

    fn refresh_delete_stats(&self, state: &mut FlushState) {
        let queue = self.delete_queue.read();
        state.delete_bytes_used = queue.bytes_used() + self.updates_stream.bytes_used();
        state.num_global_term_deletes = queue.num_global_term_deletes();
    }

    fn stall_limit_bytes(&self, state: &FlushState) -> i64 {
        match state.settings.ram_buffer_size_mb {
            Some(mb) => (state.settings.stall_ram_multiplier * mb * 1024.0 * 1024.0) as i64,
            None => i64::MAX,
        }
    }

    fn update_stall_state(&self, state: &FlushState) -> bool {
        let limit = self.stall_limit_bytes(state);
        let active = self.ram.active();
        let flush = self.ram.flush();
        // a stall that no pending flush could release would never open
        let stall = active.saturating_add(flush) > limit && active < limit && !state.closed;
        self.stall.update_stalled(stall);
        stall
    }

    fn check_ram(&self, state: &FlushState) {
        if !cfg!(debug_assertions) && !state.settings.check_ram_invariant {
            return;
        }
        let Some(ram_buffer) = state.settings.ram_buffer_bytes() else {
            return;
        };
        if !self.ram.within_bounds(ram_buffer) {
            error!(
                "RAM accounting out of bounds: active {} flush {} buffer {ram_buffer}",
                self.ram.active(),
                self.ram.flush()
            );
            if state.settings.check_ram_invariant {
                panic!("RAM accounting invariant violated");
            }
        }
    }

    fn commit_bytes(&self, state: &mut FlushState, thread_state: &ThreadState) {
        let (bytes, docs) = thread_state
            .dwpt
            .as_ref()
            .map_or((0, 0), |d| (d.bytes_used(), d.num_docs()));
        let slot = state.slot_mut(thread_state.ord());
        let delta = bytes - slot.bytes_used;
        slot.bytes_used = bytes;
        slot.num_docs = docs;
        if slot.flush_pending {
            self.ram.add_flush(delta);
        } else {
            self.ram.add_active(delta);
        }
    }

    /// Take the buffer out of a slot and forget its accounting. The bytes
    /// are left to the caller.
    fn reset_slot(state: &mut FlushState, thread_state: &mut ThreadState) -> Option<PerThreadWriter> {
        *state.slot_mut(thread_state.ord()) = SlotAccounting::default();
        thread_state.dwpt.take()
    }

    fn checkout_and_block(&self, state: &mut FlushState, thread_state: &mut ThreadState) {
        let ord = thread_state.ord();
        let bytes = state.slot(ord).map_or(0, |s| s.bytes_used);
        if let Some(dwpt) = Self::reset_slot(state, thread_state) {
            debug!("blocking flush of {} until the full flush finishes", dwpt.segment_name());
            state.num_pending -= 1;
            state.blocked_flushes.push(BlockedFlush { dwpt, bytes });
        }
    }

    fn internal_checkout(
        &self,
        state: &mut FlushState,
        thread_state: &mut ThreadState,
    ) -> Option<PerThreadWriter> {
        let ord = thread_state.ord();
        debug_assert!(state.is_pending(ord));
        thread_state.dwpt.as_ref()?;
        let bytes = state.slot(ord).map_or(0, |s| s.bytes_used);
        let dwpt = Self::reset_slot(state, thread_state)?;
        debug_assert!(!state.flushing.contains_key(dwpt.segment_name()));
        state.flushing.insert(dwpt.segment_name().to_string(), bytes);
        state.num_pending -= 1;
        Some(dwpt)
    }

    /// Account a finished document of the caller's buffer, consult the
    /// policy and return a buffer the caller must flush, if any.
    pub fn do_after_document(
        &self,
        thread_state: &mut ThreadState,
        is_update: bool,
    ) -> Option<PerThreadWriter> {
        let mut state = self.state.lock();
        self.refresh_delete_stats(&mut state);
        self.commit_bytes(&mut state, thread_state);

        let ord = thread_state.ord();
        if !state.is_pending(ord) {
            if is_update {
                self.policy.on_update(&mut state, ord);
            } else {
                self.policy.on_insert(&mut state, ord);
            }
            let hard_limit = state.settings.hard_limit_bytes();
            if !state.is_pending(ord) && state.slot(ord).is_some_and(|s| s.bytes_used > hard_limit) {
                debug!("slot {ord} crossed the per-thread hard limit");
                state.set_flush_pending(ord);
            }
        }

        let flushing = if state.full_flush {
            if state.is_pending(ord) {
                self.checkout_and_block(&mut state, thread_state);
                state.flush_queue.pop_front()
            } else {
                None
            }
        } else if state.is_pending(ord) {
            self.internal_checkout(&mut state, thread_state)
        } else {
            None
        };

        self.update_stall_state(&state);
        self.check_ram(&state);
        flushing
    }

    /// Mark a slot's buffer pending flush.
    pub fn set_flush_pending(&self, ord: usize) {
        let mut state = self.state.lock();
        state.set_flush_pending(ord);
        self.update_stall_state(&state);
    }

    /// Check out a pending buffer the caller holds.
    pub fn try_checkout_for_flush(&self, thread_state: &mut ThreadState) -> Option<PerThreadWriter> {
        let mut state = self.state.lock();
        let dwpt = if state.is_pending(thread_state.ord()) {
            self.internal_checkout(&mut state, thread_state)
        } else {
            None
        };
        self.update_stall_state(&state);
        dwpt
    }

    /// Next buffer waiting to be flushed: queued ones first, then (outside
    /// a full flush) any pending buffer whose slot is free right now.
    pub fn next_pending_flush(&self) -> Option<PerThreadWriter> {
        let mut state = self.state.lock();
        if let Some(dwpt) = state.flush_queue.pop_front() {
            self.update_stall_state(&state);
            return Some(dwpt);
        }
        if state.full_flush || state.num_pending == 0 {
            return None;
        }

        let pending: Vec<usize> = state
            .slots()
            .filter(|(_, s)| s.flush_pending)
            .map(|(ord, _)| ord)
            .collect();
        let mut found = None;
        for ord in pending {
            if let Some(mut thread_state) = self.pool.try_take(ord) {
                let dwpt = if state.is_pending(ord) {
                    self.internal_checkout(&mut state, &mut thread_state)
                } else {
                    None
                };
                self.pool.restore(thread_state);
                if dwpt.is_some() {
                    found = dwpt;
                    break;
                }
            }
        }
        self.update_stall_state(&state);
        found
    }

    /// Record that a checked-out buffer finished flushing (successfully or not).
    pub fn do_after_flush(&self, segment_name: &str) {
        let mut state = self.state.lock();
        self.after_flush_locked(&mut state, segment_name);
    }

    fn after_flush_locked(&self, state: &mut FlushState, segment_name: &str) {
        match state.flushing.remove(segment_name) {
            Some(bytes) => self.ram.release_flush(bytes),
            None => debug_assert!(false, "{segment_name} was not flushing"),
        }
        self.update_stall_state(state);
        self.check_ram(state);
        self.flushed.notify_all();
    }

    /// Release the bytes of an aborted buffer and empty its slot.
    pub fn do_on_abort(&self, thread_state: &mut ThreadState) {
        let mut state = self.state.lock();
        let ord = thread_state.ord();
        let slot = state.slot(ord).cloned().unwrap_or_default();
        if slot.flush_pending {
            self.ram.release_flush(slot.bytes_used);
            state.num_pending -= 1;
        } else {
            self.ram.release_active(slot.bytes_used);
        }
        Self::reset_slot(&mut state, thread_state);
        self.update_stall_state(&state);
    }

    /// Consult the policy after a global delete.
    pub fn do_on_delete(&self) {
        let mut state = self.state.lock();
        self.refresh_delete_stats(&mut state);
        self.policy.on_delete(&mut state, None);
    }

    /// Check out a slot for the calling thread. A buffer left over from
    /// before a full flush is enrolled in that flush first.
    pub fn obtain_and_lock(&self) -> ThreadState {
        let mut thread_state = self.pool.obtain();
        let current = self.delete_queue();
        let stale = thread_state
            .dwpt
            .as_ref()
            .is_some_and(|d| !Arc::ptr_eq(d.delete_queue(), &current));
        if stale {
            self.add_flushable_state(&mut thread_state);
        }
        thread_state
    }

    /// Return a slot checked out by [`obtain_and_lock`](Self::obtain_and_lock).
    pub fn release(&self, thread_state: ThreadState) {
        self.pool.release(thread_state);
    }

    fn add_flushable_state(&self, thread_state: &mut ThreadState) {
        let has_docs = thread_state.dwpt.as_ref().is_some_and(|d| d.num_docs() > 0);
        let mut state = self.state.lock();
        debug_assert!(state.full_flush, "stale buffer outside a full flush");
        self.commit_bytes(&mut state, thread_state);
        let ord = thread_state.ord();
        if has_docs {
            state.set_flush_pending(ord);
            if let Some(dwpt) = self.internal_checkout(&mut state, thread_state) {
                state.full_flush_buffer.push(dwpt);
            }
        } else {
            let bytes = state.slot(ord).map_or(0, |s| s.bytes_used);
            self.ram.release_active(bytes);
            Self::reset_slot(&mut state, thread_state);
        }
    }

    /// Start a full flush: swap in a delete queue one generation newer and
    /// move every buffer of the old queue into the flush queue, waiting for
    /// slots in use by indexing threads. Returns the old queue.
    pub fn mark_for_full_flush(&self) -> Arc<DeleteQueue> {
        let flushing_queue = {
            let mut state = self.state.lock();
            debug_assert!(!state.full_flush, "full flush already running");
            debug_assert!(state.full_flush_buffer.is_empty());
            state.full_flush = true;
            let mut queue = self.delete_queue.write();
            let old = Arc::clone(&queue);
            *queue = Arc::new(DeleteQueue::new(old.generation() + 1));
            old
        };
        debug!(
            "full flush: delete queue generation {} -> {}",
            flushing_queue.generation(),
            flushing_queue.generation() + 1
        );

        for ord in 0..self.pool.num_slots() {
            let Some(mut thread_state) = self.pool.take_blocking(ord) else {
                continue;
            };
            let on_old_queue = thread_state
                .dwpt
                .as_ref()
                .is_some_and(|d| Arc::ptr_eq(d.delete_queue(), &flushing_queue));
            if on_old_queue {
                self.add_flushable_state(&mut thread_state);
            }
            self.pool.restore(thread_state);
        }

        let mut state = self.state.lock();
        self.prune_blocked_queue(&mut state, &flushing_queue);
        let buffered = std::mem::take(&mut state.full_flush_buffer);
        state.flush_queue.extend(buffered);
        self.update_stall_state(&state);
        flushing_queue
    }

    fn prune_blocked_queue(&self, state: &mut FlushState, queue: &Arc<DeleteQueue>) {
        let blocked = std::mem::take(&mut state.blocked_flushes);
        for flush in blocked {
            if Arc::ptr_eq(flush.dwpt.delete_queue(), queue) {
                state
                    .flushing
                    .insert(flush.dwpt.segment_name().to_string(), flush.bytes);
                state.flush_queue.push_back(flush.dwpt);
            } else {
                state.blocked_flushes.push(flush);
            }
        }
    }

    /// End a successful full flush; blocked buffers become flushable.
    pub fn finish_full_flush(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.full_flush);
        debug_assert!(state.flush_queue.is_empty());
        debug_assert!(state.flushing.is_empty());
        if !state.blocked_flushes.is_empty() {
            let queue = self.delete_queue();
            self.prune_blocked_queue(&mut state, &queue);
            debug_assert!(state.blocked_flushes.is_empty());
        }
        state.full_flush = false;
        self.update_stall_state(&state);
    }

    /// Abort queued and blocked flushes and end the full flush.
    /// Returns the number of documents discarded.
    pub fn abort_full_flushes(&self) -> u64 {
        let discarded = self.abort_pending_flushes();
        self.state.lock().full_flush = false;
        discarded
    }

    /// Abort queued and blocked flushes. Returns the number of documents discarded.
    pub fn abort_pending_flushes(&self) -> u64 {
        let mut state = self.state.lock();
        let mut discarded = 0u64;

        let mut queued: Vec<PerThreadWriter> = state.flush_queue.drain(..).collect();
        queued.append(&mut state.full_flush_buffer);
        for mut dwpt in queued {
            discarded += dwpt.num_docs() as u64;
            dwpt.abort();
            self.after_flush_locked(&mut state, dwpt.segment_name());
        }

        let blocked = std::mem::take(&mut state.blocked_flushes);
        for BlockedFlush { mut dwpt, bytes } in blocked {
            state.flushing.insert(dwpt.segment_name().to_string(), bytes);
            discarded += dwpt.num_docs() as u64;
            dwpt.abort();
            self.after_flush_locked(&mut state, dwpt.segment_name());
        }

        self.update_stall_state(&state);
        discarded
    }

    /// Wait until no buffer is being flushed.
    pub fn wait_for_flush(&self) {
        let mut state = self.state.lock();
        while !state.flushing.is_empty() {
            self.flushed.wait(&mut state);
        }
    }

    /// Signal that the writer is closing; the stall gate stays open.
    pub fn set_closed(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.update_stall_state(&state);
    }

    /// Whether deletes should be applied, clearing the request.
    pub fn get_and_reset_apply_all_deletes(&self) -> bool {
        std::mem::replace(&mut self.state.lock().apply_all_deletes, false)
    }

    /// Request that deletes be applied.
    pub fn set_apply_all_deletes(&self) {
        self.state.lock().apply_all_deletes = true;
    }

    /// Whether a full flush is running.
    pub fn is_full_flush(&self) -> bool {
        self.state.lock().full_flush
    }

    /// Buffers waiting in the flush queue.
    pub fn num_queued_flushes(&self) -> usize {
        self.state.lock().flush_queue.len()
    }

    /// Buffers blocked until the running full flush finishes.
    pub fn num_blocked_flushes(&self) -> usize {
        self.state.lock().blocked_flushes.len()
    }

    /// Buffers checked out and being written.
    pub fn num_flushing(&self) -> usize {
        self.state.lock().flushing.len()
    }

    /// Buffers marked pending but not checked out.
    pub fn num_pending(&self) -> usize {
        self.state.lock().num_pending
    }

    /// Whether indexing threads are stalled.
    pub fn any_stalled_threads(&self) -> bool {
        self.stall.any_stalled_threads()
    }

    /// Block once if indexing is stalled.
    pub fn wait_if_stalled(&self) {
        self.stall.wait_if_stalled();
    }

    /// The stall gate.
    pub fn stall_control(&self) -> &StallControl {
        &self.stall
    }

    /// The slot pool.
    pub fn pool(&self) -> &Arc<PerThreadPool> {
        &self.pool
    }
}
