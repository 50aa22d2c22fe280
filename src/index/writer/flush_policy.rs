//! Flush policies decide which per-thread buffers become pending flush.
//!
//! A policy is consulted by flush control, under its lock, after every
//! document and every delete. It only ever marks buffers pending or asks
//! for deletes to be applied; checking buffers out and writing them is
//! flush control's job.

use log::debug;

use crate::index::writer::flush_control::FlushState;

/// Decides when buffers flush and when buffered deletes are applied.
pub trait FlushPolicy: Send + Sync + std::fmt::Debug {
    /// Called after a document was added by the buffer in slot `ord`.
    fn on_insert(&self, state: &mut FlushState, ord: usize);

    /// Called after a delete; `ord` is the slot of the buffer that issued
    /// it, `None` for a global delete.
    fn on_delete(&self, state: &mut FlushState, ord: Option<usize>);

    /// Called after a document update (a delete plus an insert).
    fn on_update(&self, state: &mut FlushState, ord: usize) {
        self.on_insert(state, ord);
        self.on_delete(state, Some(ord));
    }
}

/// The default policy.
///
/// - A buffer holding `max_buffered_docs` documents is marked pending.
/// - Once active bytes plus buffered delete bytes reach the RAM buffer, the
///   largest buffer that is not pending yet is marked pending.
/// - Deletes are applied once `max_buffered_delete_terms` global term
///   deletes are buffered, or once delete bytes exceed half the RAM buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushByRamOrCountsPolicy;

impl FlushByRamOrCountsPolicy {
    /// Create the policy.
    pub fn new() -> Self {
        FlushByRamOrCountsPolicy
    }

    fn mark_largest_pending(&self, state: &mut FlushState, ord: usize, total_ram: i64) {
        let mut largest = ord;
        let mut max_ram = state.slot(ord).map_or(0, |s| s.bytes_used);
        for (candidate, slot) in state.slots() {
            if !slot.flush_pending && slot.num_docs > 0 && slot.bytes_used > max_ram {
                max_ram = slot.bytes_used;
                largest = candidate;
            }
        }
        debug!(
            "flush by RAM: active {} + deletes {} = {total_ram}, marking slot {largest} ({max_ram} bytes)",
            state.active_bytes(),
            state.delete_bytes_used(),
        );
        state.set_flush_pending(largest);
    }
}

impl FlushPolicy for FlushByRamOrCountsPolicy {
    fn on_insert(&self, state: &mut FlushState, ord: usize) {
        let num_docs = state.slot(ord).map_or(0, |s| s.num_docs) as usize;
        if let Some(max_docs) = state.settings().max_buffered_docs {
            if num_docs >= max_docs {
                state.set_flush_pending(ord);
                return;
            }
        }
        if let Some(limit) = state.settings().ram_buffer_bytes() {
            let total_ram = state.active_bytes() + state.delete_bytes_used();
            if total_ram >= limit {
                self.mark_largest_pending(state, ord, total_ram);
            }
        }
    }

    fn on_delete(&self, state: &mut FlushState, _ord: Option<usize>) {
        if let Some(max_terms) = state.settings().max_buffered_delete_terms {
            if state.num_global_term_deletes() >= max_terms {
                state.set_apply_all_deletes();
            }
        }
        if let Some(limit) = state.settings().ram_buffer_bytes() {
            let delete_bytes = state.delete_bytes_used();
            if delete_bytes > limit / 2 {
                debug!("delete bytes {delete_bytes} exceed half the RAM buffer, applying deletes");
                state.set_apply_all_deletes();
            }
        }
    }
}
