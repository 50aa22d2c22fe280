//! Gate that stalls indexing threads while flushing falls behind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::trace;
use parking_lot::{Condvar, Mutex};

const STALL_RECHECK: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct StallState {
    stalled: bool,
    was_stalled: bool,
    num_waiting: usize,
}

/// Blocks indexing threads while the gate is closed.
///
/// Flush control recomputes the gate after every document, checkout and
/// finished flush. A waiting thread wakes on the first broadcast (or after
/// a one second recheck) and returns; the caller stalls again if needed.
#[derive(Debug, Default)]
pub struct StallControl {
    stalled: AtomicBool,
    state: Mutex<StallState>,
    cond: Condvar,
}

impl StallControl {
    /// Create an open gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open or close the gate and wake every waiter.
    pub fn update_stalled(&self, stalled: bool) {
        let mut state = self.state.lock();
        if stalled && !state.stalled {
            trace!("stalling indexing threads");
        }
        state.stalled = stalled;
        state.was_stalled |= stalled;
        self.stalled.store(stalled, Ordering::Release);
        self.cond.notify_all();
    }

    /// Wait once if the gate is closed.
    pub fn wait_if_stalled(&self) {
        if !self.stalled.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.state.lock();
        if state.stalled {
            state.num_waiting += 1;
            self.cond.wait_for(&mut state, STALL_RECHECK);
            state.num_waiting -= 1;
        }
    }

    /// Whether the gate is closed.
    pub fn any_stalled_threads(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }

    /// Whether some thread is currently waiting.
    pub fn has_blocked(&self) -> bool {
        self.state.lock().num_waiting > 0
    }

    /// Whether the gate was ever closed.
    pub fn was_stalled(&self) -> bool {
        self.state.lock().was_stalled
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    use super::*;

    #[test]
    fn test_open_gate_does_not_wait() {
        let control = StallControl::new();
        let start = Instant::now();
        control.wait_if_stalled();
        assert!(start.elapsed() < STALL_RECHECK);
        assert!(!control.was_stalled());
    }

    #[test]
    fn test_waiter_released_on_update() {
        let control = Arc::new(StallControl::new());
        control.update_stalled(true);
        assert!(control.any_stalled_threads());

        let waiter = {
            let control = Arc::clone(&control);
            thread::spawn(move || control.wait_if_stalled())
        };
        while !control.has_blocked() {
            thread::yield_now();
        }
        control.update_stalled(false);
        waiter.join().unwrap();

        assert!(!control.any_stalled_threads());
        assert!(control.was_stalled());
        assert!(!control.has_blocked());
    }
}
