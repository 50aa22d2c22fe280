//! Merge schedulers.
//!
//! A scheduler pulls registered merges from a [`MergeSource`] (the index
//! writer) and runs them. [`ConcurrentMergeScheduler`] runs each merge on its
//! own thread, pausing the largest merges when more than `max_thread_count`
//! are active and stalling the caller when `max_merge_count` merge threads
//! exist and more merges are pending. [`SerialMergeScheduler`] runs merges
//! on the calling thread.

use std::fmt::Debug;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};
use crate::index::merge::policy::{MergeTrigger, OneMerge};

/// Pause after an unexpected merge failure, so a persistent failure does
/// not spin.
const FAILURE_BACKOFF: Duration = Duration::from_millis(250);

/// Where schedulers get merges from.
pub trait MergeSource: Send + Sync {
    /// Take the next registered merge, if any.
    fn next_merge(&self) -> Option<Arc<OneMerge>>;

    /// Whether registered merges are waiting.
    fn has_pending_merges(&self) -> bool;

    /// Run a merge to completion, including commit and cleanup.
    fn merge(&self, merge: &Arc<OneMerge>) -> Result<()>;

    /// Unregister a merge that will never run.
    fn discard_merge(&self, merge: &Arc<OneMerge>);
}

/// Runs merges.
pub trait MergeScheduler: Send + Sync + Debug {
    /// Run or start every pending merge of `source`.
    fn merge(&self, source: Arc<dyn MergeSource>, trigger: MergeTrigger) -> Result<()>;

    /// Wait until every merge started by this scheduler finished.
    fn sync(&self);

    /// Merges currently running.
    fn num_running(&self) -> usize;

    /// Release resources; waits for running merges.
    fn close(&self) {
        self.sync();
    }
}

/// Tunables of [`ConcurrentMergeScheduler`]. `None` picks a default from
/// the number of CPUs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrentMergeSchedulerConfig {
    /// Merges allowed to run at the same time; further merges are paused.
    pub max_thread_count: Option<usize>,
    /// Merge threads allowed before the producer stalls.
    pub max_merge_count: Option<usize>,
}

impl ConcurrentMergeSchedulerConfig {
    /// Resolve `(max_thread_count, max_merge_count)`.
    pub fn resolve(&self) -> Result<(usize, usize)> {
        let threads = match self.max_thread_count {
            Some(0) => return Err(StrataError::invalid_argument("max_thread_count must be at least 1")),
            Some(n) => n,
            None => (num_cpus::get() / 2).clamp(1, 4),
        };
        let merges = self.max_merge_count.unwrap_or(threads + 5);
        if merges < threads {
            return Err(StrataError::invalid_argument(format!(
                "max_merge_count ({merges}) must be >= max_thread_count ({threads})"
            )));
        }
        Ok((threads, merges))
    }
}

#[derive(Debug)]
struct MergeThread {
    id: u64,
    current: Option<Arc<OneMerge>>,
    handle: Option<JoinHandle<()>>,
    done: bool,
}

#[derive(Debug, Default)]
struct SchedulerState {
    threads: Vec<MergeThread>,
    next_id: u64,
}

impl SchedulerState {
    fn live_threads(&self) -> usize {
        self.threads.iter().filter(|t| !t.done).count()
    }

    fn running_merges(&self) -> usize {
        self.threads.iter().filter(|t| t.current.is_some()).count()
    }
}

#[derive(Debug)]
struct Shared {
    max_thread_count: usize,
    max_merge_count: usize,
    state: Mutex<SchedulerState>,
    changed: Condvar,
}

impl Shared {
    /// Pause the largest merges beyond `max_thread_count`, resume the rest.
    fn update_merge_threads(&self, state: &mut SchedulerState) {
        let mut active: Vec<&Arc<OneMerge>> = state
            .threads
            .iter()
            .filter_map(|t| t.current.as_ref())
            .collect();
        active.sort_by(|a, b| b.total_doc_count().cmp(&a.total_doc_count()));

        let count = active.len();
        for (idx, merge) in active.into_iter().enumerate() {
            let pause = idx + self.max_thread_count < count;
            if pause != merge.is_paused() {
                debug!(
                    "{} merge {}",
                    if pause { "pause" } else { "resume" },
                    merge.seg_string()
                );
                merge.set_pause(pause);
            }
        }
    }

    fn set_current(&self, id: u64, merge: Option<Arc<OneMerge>>, done: bool) {
        let mut state = self.state.lock();
        if let Some(thread) = state.threads.iter_mut().find(|t| t.id == id) {
            thread.current = merge;
            thread.done = done;
        }
        self.update_merge_threads(&mut state);
        self.changed.notify_all();
    }

    /// Join and forget threads that finished their last merge.
    fn reap_finished(&self) {
        let finished: Vec<JoinHandle<()>> = {
            let mut state = self.state.lock();
            let mut finished = Vec::new();
            state.threads.retain_mut(|t| {
                if t.done {
                    finished.extend(t.handle.take());
                }
                !t.done
            });
            finished
        };
        for handle in finished {
            if handle.join().is_err() {
                error!("merge thread panicked");
            }
        }
    }
}

/// Runs merges on background threads.
#[derive(Debug)]
pub struct ConcurrentMergeScheduler {
    shared: Arc<Shared>,
}

impl Default for ConcurrentMergeScheduler {
    fn default() -> Self {
        let threads = (num_cpus::get() / 2).clamp(1, 4);
        Self::with_counts(threads, threads + 5)
    }
}

impl ConcurrentMergeScheduler {
    /// Scheduler with the given config.
    pub fn new(config: ConcurrentMergeSchedulerConfig) -> Result<Self> {
        let (threads, merges) = config.resolve()?;
        Ok(Self::with_counts(threads, merges))
    }

    fn with_counts(max_thread_count: usize, max_merge_count: usize) -> Self {
        ConcurrentMergeScheduler {
            shared: Arc::new(Shared {
                max_thread_count,
                max_merge_count,
                state: Mutex::new(SchedulerState::default()),
                changed: Condvar::new(),
            }),
        }
    }

    /// Merges allowed to run at the same time.
    pub fn max_thread_count(&self) -> usize {
        self.shared.max_thread_count
    }

    /// Merge threads allowed before producers stall.
    pub fn max_merge_count(&self) -> usize {
        self.shared.max_merge_count
    }

    fn stall_while_behind(&self, source: &dyn MergeSource) {
        let mut stalled = false;
        loop {
            let pending = source.has_pending_merges();
            let mut state = self.shared.state.lock();
            if !pending || state.live_threads() < self.shared.max_merge_count {
                break;
            }
            if !stalled {
                info!(
                    "too many merges running ({} threads); stalling incoming work",
                    state.live_threads()
                );
                stalled = true;
            }
            self.shared
                .changed
                .wait_for(&mut state, Duration::from_millis(250));
        }
    }

    fn spawn(&self, source: Arc<dyn MergeSource>, first: Arc<OneMerge>) -> Result<()> {
        self.shared.reap_finished();
        let shared = Arc::clone(&self.shared);
        let mut state = self.shared.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        let thread_merge = Arc::clone(&first);
        let handle = thread::Builder::new()
            .name(format!("strata-merge-{id}"))
            .spawn(move || run_merge_thread(shared, id, source, thread_merge))?;

        state.threads.push(MergeThread {
            id,
            current: Some(first),
            handle: Some(handle),
            done: false,
        });
        self.shared.update_merge_threads(&mut state);
        Ok(())
    }
}

fn run_merge_thread(shared: Arc<Shared>, id: u64, source: Arc<dyn MergeSource>, first: Arc<OneMerge>) {
    let mut merge = first;
    loop {
        debug!("merge thread {id}: start {}", merge.seg_string());
        if let Err(e) = source.merge(&merge) {
            if e.is_merge_aborted() {
                debug!("merge thread {id}: {} aborted", merge.seg_string());
            } else {
                error!("merge thread {id}: merge {} failed: {e}", merge.seg_string());
                thread::sleep(FAILURE_BACKOFF);
            }
            break;
        }
        debug!("merge thread {id}: done {}", merge.seg_string());

        // keep the thread busy with whatever the writer registered meanwhile
        match source.next_merge() {
            Some(next) => {
                shared.set_current(id, Some(Arc::clone(&next)), false);
                merge = next;
            }
            None => break,
        }
    }
    shared.set_current(id, None, true);
}

impl MergeScheduler for ConcurrentMergeScheduler {
    fn merge(&self, source: Arc<dyn MergeSource>, trigger: MergeTrigger) -> Result<()> {
        debug!("merge requested ({trigger:?})");
        loop {
            self.stall_while_behind(source.as_ref());
            let Some(merge) = source.next_merge() else {
                return Ok(());
            };
            if let Err(e) = self.spawn(Arc::clone(&source), Arc::clone(&merge)) {
                warn!("failed to start merge thread: {e}");
                source.discard_merge(&merge);
                return Err(e);
            }
        }
    }

    fn sync(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut state = self.shared.state.lock();
                state
                    .threads
                    .iter_mut()
                    .filter_map(|t| t.handle.take())
                    .collect()
            };
            for handle in handles {
                if handle.join().is_err() {
                    error!("merge thread panicked");
                }
            }

            let mut state = self.shared.state.lock();
            state.threads.retain(|t| !t.done);
            if state.threads.is_empty() {
                return;
            }
            self.shared
                .changed
                .wait_for(&mut state, Duration::from_millis(100));
        }
    }

    fn num_running(&self) -> usize {
        self.shared.state.lock().running_merges()
    }
}

/// Runs merges on the calling thread, one caller at a time.
#[derive(Debug, Default)]
pub struct SerialMergeScheduler {
    running: Mutex<()>,
}

impl SerialMergeScheduler {
    /// Create the scheduler.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MergeScheduler for SerialMergeScheduler {
    fn merge(&self, source: Arc<dyn MergeSource>, trigger: MergeTrigger) -> Result<()> {
        let _running = self.running.lock();
        debug!("serial merge ({trigger:?})");
        while let Some(merge) = source.next_merge() {
            source.merge(&merge)?;
        }
        Ok(())
    }

    fn sync(&self) {
        drop(self.running.lock());
    }

    fn num_running(&self) -> usize {
        usize::from(self.running.is_locked())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::index::merge::policy::tests::stats;

    #[derive(Default)]
    struct BlockingSource {
        pending: Mutex<VecDeque<Arc<OneMerge>>>,
        release: AtomicBool,
        fail: AtomicBool,
        completed: Mutex<Vec<String>>,
        discarded: Mutex<usize>,
    }

    impl BlockingSource {
        fn with_merges(merges: Vec<Arc<OneMerge>>) -> Arc<Self> {
            Arc::new(BlockingSource {
                pending: Mutex::new(merges.into_iter().collect()),
                ..Default::default()
            })
        }
    }

    impl MergeSource for BlockingSource {
        fn next_merge(&self) -> Option<Arc<OneMerge>> {
            self.pending.lock().pop_front()
        }

        fn has_pending_merges(&self) -> bool {
            !self.pending.lock().is_empty()
        }

        fn merge(&self, merge: &Arc<OneMerge>) -> Result<()> {
            if self.fail.load(Ordering::Acquire) {
                return Err(StrataError::index("disk full"));
            }
            while !self.release.load(Ordering::Acquire) {
                merge.check_aborted()?;
                thread::sleep(Duration::from_millis(5));
            }
            merge.check_aborted()?;
            self.completed.lock().push(merge.segment_names().join(","));
            Ok(())
        }

        fn discard_merge(&self, _merge: &Arc<OneMerge>) {
            *self.discarded.lock() += 1;
        }
    }

    fn one_merge(name: &str, docs: u32) -> Arc<OneMerge> {
        Arc::new(OneMerge::new(vec![stats(name, docs, 100, 0).info]))
    }

    #[test]
    fn test_config_defaults() {
        let (threads, merges) = ConcurrentMergeSchedulerConfig::default().resolve().unwrap();
        assert!((1..=4).contains(&threads));
        assert_eq!(merges, threads + 5);

        let bad = ConcurrentMergeSchedulerConfig {
            max_thread_count: Some(3),
            max_merge_count: Some(2),
        };
        assert!(bad.resolve().is_err());
    }

    #[test]
    fn test_largest_excess_merge_is_paused() {
        let scheduler = ConcurrentMergeScheduler::new(ConcurrentMergeSchedulerConfig {
            max_thread_count: Some(1),
            max_merge_count: Some(3),
        })
        .unwrap();
        let big = one_merge("_big", 1000);
        let small = one_merge("_small", 10);
        let source = BlockingSource::with_merges(vec![Arc::clone(&big), Arc::clone(&small)]);

        scheduler
            .merge(source.clone(), MergeTrigger::Explicit)
            .unwrap();
        assert_eq!(scheduler.num_running(), 2);
        assert!(big.is_paused());
        assert!(!small.is_paused());

        source.release.store(true, Ordering::Release);
        scheduler.sync();
        assert_eq!(*source.completed.lock(), vec!["_small", "_big"]);
        assert_eq!(scheduler.num_running(), 0);
    }

    #[test]
    fn test_producer_stalls_at_max_merge_count() {
        let scheduler = Arc::new(
            ConcurrentMergeScheduler::new(ConcurrentMergeSchedulerConfig {
                max_thread_count: Some(1),
                max_merge_count: Some(1),
            })
            .unwrap(),
        );
        let source = BlockingSource::with_merges(vec![one_merge("_0", 10), one_merge("_1", 10)]);

        let producer = {
            let scheduler = Arc::clone(&scheduler);
            let source: Arc<dyn MergeSource> = source.clone();
            thread::spawn(move || scheduler.merge(source, MergeTrigger::SegmentFlush))
        };
        thread::sleep(Duration::from_millis(100));
        assert!(!producer.is_finished());

        source.release.store(true, Ordering::Release);
        producer.join().unwrap().unwrap();
        scheduler.sync();
        assert_eq!(source.completed.lock().len(), 2);
    }

    #[test]
    fn test_failed_merge_ends_thread() {
        let scheduler = ConcurrentMergeScheduler::new(ConcurrentMergeSchedulerConfig {
            max_thread_count: Some(2),
            max_merge_count: Some(2),
        })
        .unwrap();
        let source = BlockingSource::with_merges(vec![one_merge("_0", 10)]);
        source.fail.store(true, Ordering::Release);

        scheduler
            .merge(source.clone(), MergeTrigger::Explicit)
            .unwrap();
        scheduler.sync();
        assert!(source.completed.lock().is_empty());
        assert_eq!(scheduler.num_running(), 0);
    }

    #[test]
    fn test_finished_merge_threads_are_reaped() {
        let scheduler = ConcurrentMergeScheduler::new(ConcurrentMergeSchedulerConfig {
            max_thread_count: Some(2),
            max_merge_count: Some(4),
        })
        .unwrap();

        for i in 0..50 {
            let source = BlockingSource::with_merges(vec![one_merge(&format!("_{i}"), 10)]);
            source.release.store(true, Ordering::Release);
            scheduler
                .merge(source.clone(), MergeTrigger::SegmentFlush)
                .unwrap();
            while scheduler.shared.state.lock().live_threads() > 0 {
                thread::sleep(Duration::from_millis(1));
            }
            assert_eq!(source.completed.lock().len(), 1);
            assert!(scheduler.shared.state.lock().threads.len() <= 1);
        }

        scheduler.sync();
        assert!(scheduler.shared.state.lock().threads.is_empty());
    }

    #[test]
    fn test_serial_scheduler_runs_inline() {
        let scheduler = SerialMergeScheduler::new();
        let source = BlockingSource::with_merges(vec![one_merge("_0", 10), one_merge("_1", 20)]);
        source.release.store(true, Ordering::Release);
        scheduler
            .merge(source.clone(), MergeTrigger::Explicit)
            .unwrap();
        assert_eq!(*source.completed.lock(), vec!["_0", "_1"]);
        assert_eq!(scheduler.num_running(), 0);
    }
}
