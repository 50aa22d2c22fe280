//! The shared, append-only queue of deletes and doc-values updates.
//!
//! Every delete or update issued while documents are being indexed is
//! appended as an immutable node. Each per-thread buffer keeps a
//! [`DeleteSlice`], a `(head, tail)` window over the queue: when the buffer
//! finishes a document it moves its tail to the queue tail and applies the
//! nodes in `(head, tail]` to its own pending updates, limited to the
//! documents it indexed before those nodes arrived. The queue also keeps
//! one global slice feeding a global buffer that becomes the global packet
//! on the next flush.
//!
//! ```text
//!   sentinel -> d1 -> d2 -> d3 -> d4   (tail)
//!               ^head       ^tail        thread A's slice covers d2, d3
//! ```

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use log::trace;
use parking_lot::Mutex;

use crate::index::query::Query;
use crate::index::term::Term;
use crate::index::writer::buffered_updates::{BufferedUpdates, MAX_DOC_ID_UPTO};
use crate::index::writer::doc_values_updates::DocValuesUpdate;
use crate::index::writer::frozen_updates::FrozenBufferedUpdates;

#[derive(Debug)]
enum Op {
    Sentinel,
    Term(Term),
    Terms(Vec<Term>),
    Queries(Vec<Query>),
    Update(DocValuesUpdate),
}

#[derive(Debug)]
struct Node {
    op: Op,
    next: OnceLock<Arc<Node>>,
}

impl Node {
    fn new(op: Op) -> Arc<Node> {
        Arc::new(Node {
            op,
            next: OnceLock::new(),
        })
    }

    fn apply(&self, updates: &mut BufferedUpdates, doc_id_upto: u32) {
        match &self.op {
            Op::Sentinel => {}
            Op::Term(term) => updates.add_term(term.clone(), doc_id_upto),
            Op::Terms(terms) => {
                for term in terms {
                    updates.add_term(term.clone(), doc_id_upto);
                }
            }
            Op::Queries(queries) => {
                for query in queries {
                    updates.add_query(query.clone(), doc_id_upto);
                }
            }
            Op::Update(update) => updates.add_update(update.clone(), doc_id_upto),
        }
    }
}

/// A window over the delete queue owned by one buffer.
#[derive(Debug, Clone)]
pub struct DeleteSlice {
    head: Arc<Node>,
    tail: Arc<Node>,
}

impl DeleteSlice {
    fn new(current_tail: Arc<Node>) -> Self {
        DeleteSlice {
            head: Arc::clone(&current_tail),
            tail: current_tail,
        }
    }

    /// Apply every node after `head` up to and including `tail`, then
    /// collapse the slice onto its tail.
    pub fn apply(&mut self, updates: &mut BufferedUpdates, doc_id_upto: u32) {
        if Arc::ptr_eq(&self.head, &self.tail) {
            return;
        }
        let mut current = Arc::clone(&self.head);
        loop {
            let next = match current.next.get() {
                Some(next) => Arc::clone(next),
                None => {
                    debug_assert!(false, "slice tail not reachable from head");
                    break;
                }
            };
            next.apply(updates, doc_id_upto);
            let reached_tail = Arc::ptr_eq(&next, &self.tail);
            current = next;
            if reached_tail {
                break;
            }
        }
        self.reset();
    }

    /// Collapse the slice without applying it.
    pub fn reset(&mut self) {
        self.head = Arc::clone(&self.tail);
    }

    /// Whether the slice covers no node.
    pub fn is_empty(&self) -> bool {
        Arc::ptr_eq(&self.head, &self.tail)
    }

    /// Whether the last node of the slice is a delete of this term.
    pub fn is_tail_term(&self, term: &Term) -> bool {
        matches!(&self.tail.op, Op::Term(t) if t == term)
    }
}

#[derive(Debug)]
struct GlobalBuffer {
    slice: DeleteSlice,
    updates: BufferedUpdates,
}

/// The shared delete/update queue of one flush generation.
#[derive(Debug)]
pub struct DeleteQueue {
    tail: Mutex<Arc<Node>>,
    global: Mutex<GlobalBuffer>,
    generation: u64,
    num_global_term_deletes: AtomicUsize,
    global_bytes_used: AtomicI64,
}

impl DeleteQueue {
    /// Create an empty queue.
    pub fn new(generation: u64) -> Self {
        let sentinel = Node::new(Op::Sentinel);
        DeleteQueue {
            tail: Mutex::new(Arc::clone(&sentinel)),
            global: Mutex::new(GlobalBuffer {
                slice: DeleteSlice::new(sentinel),
                updates: BufferedUpdates::new(),
            }),
            generation,
            num_global_term_deletes: AtomicUsize::new(0),
            global_bytes_used: AtomicI64::new(0),
        }
    }

    /// The queue generation; a full flush swaps in generation + 1.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn append(&self, op: Op) -> Arc<Node> {
        let node = Node::new(op);
        let mut tail = self.tail.lock();
        let linked = tail.next.set(Arc::clone(&node));
        debug_assert!(linked.is_ok(), "tail node already linked");
        *tail = Arc::clone(&node);
        node
    }

    fn current_tail(&self) -> Arc<Node> {
        Arc::clone(&self.tail.lock())
    }

    /// Append term deletes.
    pub fn add_delete(&self, terms: Vec<Term>) {
        self.append(Op::Terms(terms));
        self.try_apply_global_slice();
    }

    /// Append query deletes.
    pub fn add_delete_queries(&self, queries: Vec<Query>) {
        self.append(Op::Queries(queries));
        self.try_apply_global_slice();
    }

    /// Append a numeric doc-values update.
    pub fn add_numeric_update(&self, update: DocValuesUpdate) {
        self.append(Op::Update(update));
        self.try_apply_global_slice();
    }

    /// Append a binary doc-values update.
    pub fn add_binary_update(&self, update: DocValuesUpdate) {
        self.append(Op::Update(update));
        self.try_apply_global_slice();
    }

    /// Append a term delete on behalf of a buffer and move the buffer's
    /// slice tail onto it, so the buffer applies it with its own limit.
    pub fn add(&self, term: Term, slice: &mut DeleteSlice) {
        let node = self.append(Op::Term(term));
        slice.tail = node;
        self.try_apply_global_slice();
    }

    /// A new empty slice positioned at the current tail.
    pub fn new_slice(&self) -> DeleteSlice {
        DeleteSlice::new(self.current_tail())
    }

    /// Move a slice's tail to the queue tail. Returns true if it moved.
    pub fn update_slice(&self, slice: &mut DeleteSlice) -> bool {
        let tail = self.current_tail();
        if Arc::ptr_eq(&slice.tail, &tail) {
            false
        } else {
            slice.tail = tail;
            true
        }
    }

    fn apply_global(&self, global: &mut GlobalBuffer) {
        global.slice.apply(&mut global.updates, MAX_DOC_ID_UPTO);
        self.num_global_term_deletes
            .store(global.updates.num_term_deletes(), Ordering::Release);
        self.global_bytes_used
            .store(global.updates.bytes_used(), Ordering::Release);
    }

    /// Fold new nodes into the global buffer if nobody else is doing so.
    pub fn try_apply_global_slice(&self) {
        if let Some(mut global) = self.global.try_lock() {
            if self.update_slice(&mut global.slice) {
                self.apply_global(&mut global);
            }
        }
    }

    /// Freeze the global buffer into a packet.
    ///
    /// The caller's slice (if any) is first extended to the current tail so
    /// the caller can apply everything the global packet covers.
    pub fn freeze_global_buffer(
        &self,
        caller_slice: Option<&mut DeleteSlice>,
    ) -> Option<FrozenBufferedUpdates> {
        let mut global = self.global.lock();
        let tail = self.current_tail();
        if let Some(slice) = caller_slice {
            slice.tail = Arc::clone(&tail);
        }
        if !Arc::ptr_eq(&global.slice.tail, &tail) {
            global.slice.tail = tail;
            self.apply_global(&mut global);
        }

        if !global.updates.any() {
            return None;
        }
        let packet = FrozenBufferedUpdates::new(&global.updates, None);
        trace!(
            "delete queue {}: froze global packet with {} terms, {} queries",
            self.generation,
            packet.terms().len(),
            packet.queries().len()
        );
        global.updates.clear();
        self.num_global_term_deletes.store(0, Ordering::Release);
        self.global_bytes_used.store(0, Ordering::Release);
        Some(packet)
    }

    /// Whether anything was queued that is not yet frozen.
    pub fn any_changes(&self) -> bool {
        let global = self.global.lock();
        global.updates.any()
            || !global.slice.is_empty()
            || !Arc::ptr_eq(&global.slice.tail, &self.current_tail())
    }

    /// Drop everything not yet frozen.
    pub fn clear(&self) {
        let mut global = self.global.lock();
        let tail = self.current_tail();
        global.slice = DeleteSlice::new(tail);
        global.updates.clear();
        self.num_global_term_deletes.store(0, Ordering::Release);
        self.global_bytes_used.store(0, Ordering::Release);
    }

    /// Term deletes folded into the global buffer so far.
    pub fn num_global_term_deletes(&self) -> usize {
        self.num_global_term_deletes.load(Ordering::Acquire)
    }

    /// RAM held by the global buffer.
    pub fn bytes_used(&self) -> i64 {
        self.global_bytes_used.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_slice_applies_with_limit() {
        let queue = DeleteQueue::new(0);
        let mut slice = queue.new_slice();
        let mut updates = BufferedUpdates::new();

        queue.add_delete(vec![Term::new("id", "1")]);
        queue.add_delete_queries(vec![Query::MatchAll]);
        assert!(queue.update_slice(&mut slice));
        assert!(!queue.update_slice(&mut slice));

        slice.apply(&mut updates, 3);
        assert!(slice.is_empty());
        assert_eq!(updates.terms()[&Term::new("id", "1")], 3);
        assert_eq!(updates.queries()[&Query::MatchAll], 3);

        // applying an empty slice is a no-op
        slice.apply(&mut updates, 9);
        assert_eq!(updates.terms()[&Term::new("id", "1")], 3);
    }

    #[test]
    fn test_add_moves_caller_tail() {
        let queue = DeleteQueue::new(0);
        let mut slice = queue.new_slice();
        let term = Term::new("id", "7");

        queue.add(term.clone(), &mut slice);
        assert!(slice.is_tail_term(&term));

        let mut updates = BufferedUpdates::new();
        slice.apply(&mut updates, 2);
        assert_eq!(updates.terms()[&term], 2);
    }

    #[test]
    fn test_freeze_global_buffer() {
        let queue = DeleteQueue::new(3);
        assert!(!queue.any_changes());
        assert!(queue.freeze_global_buffer(None).is_none());

        queue.add_delete(vec![Term::new("id", "1"), Term::new("id", "2")]);
        assert!(queue.any_changes());
        assert_eq!(queue.num_global_term_deletes(), 2);

        let mut caller = queue.new_slice();
        queue.add_delete(vec![Term::new("id", "3")]);
        let packet = queue.freeze_global_buffer(Some(&mut caller)).unwrap();
        assert_eq!(packet.terms().len(), 3);
        assert!(!caller.is_empty());
        assert!(!queue.any_changes());
        assert_eq!(queue.bytes_used(), 0);
    }

    #[test]
    fn test_clear_discards_pending() {
        let queue = DeleteQueue::new(0);
        queue.add_delete(vec![Term::new("id", "1")]);
        queue.clear();
        assert!(!queue.any_changes());
        assert!(queue.freeze_global_buffer(None).is_none());
    }

    #[test]
    fn test_concurrent_appends_are_never_lost() {
        let queue = Arc::new(DeleteQueue::new(0));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..100 {
                        queue.add_delete(vec![Term::new("id", format!("{t}-{i}"))]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let packet = queue.freeze_global_buffer(None).unwrap();
        assert_eq!(packet.terms().len(), 400);
    }
}
