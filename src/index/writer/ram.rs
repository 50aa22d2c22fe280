//! RAM accounting for buffered documents.
//!
//! Bytes of per-thread buffers are either *active* (still accepting
//! documents) or *flushing* (pending flush, checked out or being written).
//! The sum of both is what the stall gate and the flush policy look at.

use std::sync::atomic::{AtomicI64, Ordering};

/// Bytes a buffered term delete costs, including map overhead.
pub const BYTES_PER_DEL_TERM: i64 = 9 * 8 + 7 * 16 + 10 * 4;

/// Bytes a buffered doc-ID delete costs.
pub const BYTES_PER_DEL_DOCID: i64 = 2 * 8 + 16 + 4;

/// Bytes a buffered query delete costs, excluding the query itself.
pub const BYTES_PER_DEL_QUERY: i64 = 5 * 8 + 2 * 16 + 2 * 4 + 24;

/// Bytes a buffered doc-values update costs, excluding term and value.
pub const BYTES_PER_DV_UPDATE: i64 = 8 * 8 + 4 * 16 + 2 * 4;

/// Convert megabytes to bytes.
pub fn mb_to_bytes(mb: f64) -> i64 {
    (mb * 1024.0 * 1024.0) as i64
}

/// Thread-safe active/flush byte counters with peak tracking.
#[derive(Debug, Default)]
pub struct RamAccountant {
    active: AtomicI64,
    flush: AtomicI64,
    peak_active: AtomicI64,
    peak_flush: AtomicI64,
    peak_net: AtomicI64,
    peak_delta: AtomicI64,
}

impl RamAccountant {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of buffers still accepting documents.
    pub fn active(&self) -> i64 {
        self.active.load(Ordering::Acquire)
    }

    /// Bytes of buffers pending or undergoing flush.
    pub fn flush(&self) -> i64 {
        self.flush.load(Ordering::Acquire)
    }

    /// `active + flush`.
    pub fn net(&self) -> i64 {
        self.active() + self.flush()
    }

    /// Account a change of an active buffer.
    pub fn add_active(&self, delta: i64) {
        let active = self.active.fetch_add(delta, Ordering::AcqRel) + delta;
        debug_assert!(active >= 0, "active bytes went negative: {active}");
        self.peak_delta.fetch_max(delta, Ordering::Relaxed);
        self.peak_active.fetch_max(active, Ordering::Relaxed);
        self.track_net();
    }

    /// Account a change of a pending buffer.
    pub fn add_flush(&self, delta: i64) {
        let flush = self.flush.fetch_add(delta, Ordering::AcqRel) + delta;
        debug_assert!(flush >= 0, "flush bytes went negative: {flush}");
        self.peak_delta.fetch_max(delta, Ordering::Relaxed);
        self.peak_flush.fetch_max(flush, Ordering::Relaxed);
        self.track_net();
    }

    /// Move a buffer's bytes from active to flush.
    pub fn move_to_flush(&self, bytes: i64) {
        self.active.fetch_sub(bytes, Ordering::AcqRel);
        let flush = self.flush.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.peak_flush.fetch_max(flush, Ordering::Relaxed);
    }

    /// Release active bytes, e.g. on abort.
    pub fn release_active(&self, bytes: i64) {
        let active = self.active.fetch_sub(bytes, Ordering::AcqRel) - bytes;
        debug_assert!(active >= 0, "active bytes went negative: {active}");
    }

    /// Release flushing bytes after a flush completed or failed.
    pub fn release_flush(&self, bytes: i64) {
        let flush = self.flush.fetch_sub(bytes, Ordering::AcqRel) - bytes;
        debug_assert!(flush >= 0, "flush bytes went negative: {flush}");
    }

    fn track_net(&self) {
        let net = self.net();
        self.peak_net.fetch_max(net, Ordering::Relaxed);
    }

    /// Check that net bytes stay within the slack allowed on top of the
    /// RAM buffer. Returns false if the accounting looks broken.
    pub fn within_bounds(&self, ram_buffer_bytes: i64) -> bool {
        let expected = 2 * ram_buffer_bytes
            + self.peak_active.load(Ordering::Relaxed)
            + self.peak_flush.load(Ordering::Relaxed)
            + self.peak_net.load(Ordering::Relaxed)
            + self.peak_delta.load(Ordering::Relaxed);
        self.net() <= expected && self.active() >= 0 && self.flush() >= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_between_active_and_flush() {
        let ram = RamAccountant::new();
        ram.add_active(100);
        ram.add_active(50);
        assert_eq!(ram.active(), 150);

        ram.move_to_flush(100);
        assert_eq!(ram.active(), 50);
        assert_eq!(ram.flush(), 100);
        assert_eq!(ram.net(), 150);

        ram.release_flush(100);
        ram.release_active(50);
        assert_eq!(ram.net(), 0);
        assert!(ram.within_bounds(1024));
    }

    #[test]
    fn test_mb_to_bytes() {
        assert_eq!(mb_to_bytes(1.0), 1024 * 1024);
        assert_eq!(mb_to_bytes(0.5), 512 * 1024);
    }
}
