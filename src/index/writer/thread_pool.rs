//! Pool of per-thread buffer slots.
//!
//! Indexing threads check a [`ThreadState`] out, index into its buffer
//! without holding any lock and hand it back. A thread gets the slot it used
//! last when that slot is free, otherwise the least recently used free slot,
//! otherwise a new slot while under the configured maximum. When every slot
//! is checked out the caller waits for one to be returned.

use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::index::writer::per_thread::PerThreadWriter;

/// A checked-out slot: its ordinal and its (lazily created) buffer.
#[derive(Debug)]
pub struct ThreadState {
    ord: usize,
    /// The buffer, created on first use and taken away on flush.
    pub dwpt: Option<PerThreadWriter>,
}

impl ThreadState {
    /// Slot ordinal.
    pub fn ord(&self) -> usize {
        self.ord
    }

    /// Whether the slot holds a buffer.
    pub fn is_initialized(&self) -> bool {
        self.dwpt.is_some()
    }
}

#[derive(Debug)]
struct Slot {
    state: Option<ThreadState>,
    last_owner: Option<ThreadId>,
    last_used: u64,
}

#[derive(Debug, Default)]
struct PoolInner {
    slots: Vec<Slot>,
    clock: u64,
}

/// Fixed-capacity pool of slots with thread affinity.
#[derive(Debug)]
pub struct PerThreadPool {
    inner: Mutex<PoolInner>,
    returned: Condvar,
    max_slots: usize,
}

impl PerThreadPool {
    /// Create a pool with at most `max_slots` slots.
    pub fn new(max_slots: usize) -> Self {
        PerThreadPool {
            inner: Mutex::new(PoolInner::default()),
            returned: Condvar::new(),
            max_slots: max_slots.max(1),
        }
    }

    /// Maximum number of slots.
    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    /// Number of slots created so far.
    pub fn num_slots(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Check out a slot for the calling thread, waiting if none is free.
    pub fn obtain(&self) -> ThreadState {
        let me = thread::current().id();
        let mut inner = self.inner.lock();
        loop {
            let affine = inner
                .slots
                .iter()
                .position(|s| s.state.is_some() && s.last_owner == Some(me));
            let chosen = affine.or_else(|| {
                inner
                    .slots
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.state.is_some())
                    .min_by_key(|(_, s)| s.last_used)
                    .map(|(i, _)| i)
            });
            if let Some(ord) = chosen {
                if let Some(state) = inner.slots[ord].state.take() {
                    return state;
                }
            }
            if inner.slots.len() < self.max_slots {
                let ord = inner.slots.len();
                inner.slots.push(Slot {
                    state: None,
                    last_owner: Some(me),
                    last_used: 0,
                });
                return ThreadState { ord, dwpt: None };
            }
            self.returned.wait(&mut inner);
        }
    }

    /// Return a checked-out slot.
    pub fn release(&self, state: ThreadState) {
        let me = thread::current().id();
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let clock = inner.clock;
        if let Some(slot) = inner.slots.get_mut(state.ord) {
            debug_assert!(slot.state.is_none(), "slot {} returned twice", state.ord);
            slot.last_owner = Some(me);
            slot.last_used = clock;
            slot.state = Some(state);
        }
        drop(inner);
        self.returned.notify_all();
    }

    /// Put a slot back without claiming it for the calling thread.
    pub fn restore(&self, state: ThreadState) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.get_mut(state.ord) {
            debug_assert!(slot.state.is_none(), "slot {} returned twice", state.ord);
            slot.state = Some(state);
        }
        drop(inner);
        self.returned.notify_all();
    }

    /// Create every slot up to the maximum and check all of them out,
    /// waiting for busy ones. Indexing blocks until they are restored.
    pub fn take_all_blocking(&self) -> Vec<ThreadState> {
        {
            let mut inner = self.inner.lock();
            while inner.slots.len() < self.max_slots {
                let ord = inner.slots.len();
                inner.slots.push(Slot {
                    state: Some(ThreadState { ord, dwpt: None }),
                    last_owner: None,
                    last_used: 0,
                });
            }
        }
        (0..self.max_slots)
            .filter_map(|ord| self.take_blocking(ord))
            .collect()
    }

    /// Check out a specific slot if it is free right now.
    pub fn try_take(&self, ord: usize) -> Option<ThreadState> {
        self.inner
            .lock()
            .slots
            .get_mut(ord)
            .and_then(|s| s.state.take())
    }

    /// Check out a specific slot, waiting until its user returns it.
    pub fn take_blocking(&self, ord: usize) -> Option<ThreadState> {
        let mut inner = self.inner.lock();
        loop {
            let slot = inner.slots.get_mut(ord)?;
            if let Some(state) = slot.state.take() {
                return Some(state);
            }
            self.returned.wait(&mut inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_same_thread_gets_same_slot() {
        let pool = PerThreadPool::new(4);
        let state = pool.obtain();
        assert_eq!(state.ord(), 0);
        assert!(!state.is_initialized());
        pool.release(state);

        let state = pool.obtain();
        assert_eq!(state.ord(), 0);
        let second = pool.obtain();
        assert_eq!(second.ord(), 1);
        assert_eq!(pool.num_slots(), 2);
        pool.release(state);
        pool.release(second);
    }

    #[test]
    fn test_try_take_skips_busy_slot() {
        let pool = PerThreadPool::new(2);
        let state = pool.obtain();
        assert!(pool.try_take(0).is_none());
        assert!(pool.try_take(5).is_none());
        pool.release(state);
        assert!(pool.try_take(0).is_some());
    }

    #[test]
    fn test_full_pool_waits_for_release() {
        let pool = Arc::new(PerThreadPool::new(1));
        let state = pool.obtain();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let state = pool.obtain();
                let ord = state.ord();
                pool.release(state);
                ord
            })
        };
        thread::sleep(Duration::from_millis(20));
        pool.release(state);
        assert_eq!(waiter.join().unwrap(), 0);
    }

    #[test]
    fn test_take_blocking_waits_for_owner() {
        let pool = Arc::new(PerThreadPool::new(1));
        let state = pool.obtain();

        let taker = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.take_blocking(0).map(|s| s.ord()))
        };
        thread::sleep(Duration::from_millis(20));
        pool.release(state);
        assert_eq!(taker.join().unwrap(), Some(0));
    }

    #[test]
    fn test_take_all_creates_missing_slots() {
        let pool = PerThreadPool::new(3);
        let state = pool.obtain();
        pool.release(state);

        let all = pool.take_all_blocking();
        assert_eq!(all.len(), 3);
        assert_eq!(pool.num_slots(), 3);
        assert!(pool.try_take(1).is_none());
        for state in all {
            pool.restore(state);
        }
        assert!(pool.try_take(2).is_some());
    }
}
