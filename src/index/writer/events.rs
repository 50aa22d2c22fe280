//! Events raised by the documents writer for the index writer to process.
//!
//! Indexing threads must not take the index writer's lock, so follow-up work
//! they discover (apply deletes, purge tickets, clean up after a failed
//! flush) is queued here and drained by the writer after each operation.

use std::collections::BTreeSet;

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use log::trace;

/// Follow-up work for the index writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Resolve every buffered delete against the live segments.
    ApplyDeletes,
    /// A flush finished; the merge policy may want to run.
    MergePending,
    /// Too many tickets are queued; publish them before continuing.
    ForcedPurge,
    /// A flush failed; remove whatever files the segment left behind.
    FlushFailed {
        /// Name of the failed segment.
        segment: String,
    },
    /// Delete files of a flushed segment that was never published.
    DeleteNewFiles {
        /// The files to delete.
        files: BTreeSet<String>,
    },
}

/// Multi-producer event queue.
#[derive(Debug, Clone)]
pub struct EventQueue {
    sender: Sender<Event>,
    receiver: Receiver<Event>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        EventQueue { sender, receiver }
    }

    /// Queue an event.
    pub fn put(&self, event: Event) {
        trace!("event {event:?}");
        // the receiver lives as long as the queue
        let _ = self.sender.send(event);
    }

    /// Take the next event, if any.
    pub fn poll(&self) -> Option<Event> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Take every queued event.
    pub fn drain(&self) -> Vec<Event> {
        self.receiver.try_iter().collect()
    }

    /// Whether events are waiting.
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Number of events waiting.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_come_out_in_order() {
        let events = EventQueue::new();
        assert!(events.is_empty());
        events.put(Event::ApplyDeletes);
        events.clone().put(Event::FlushFailed {
            segment: "_3".into(),
        });
        assert_eq!(events.len(), 2);
        assert_eq!(events.poll(), Some(Event::ApplyDeletes));
        assert_eq!(
            events.drain(),
            vec![Event::FlushFailed {
                segment: "_3".into()
            }]
        );
        assert_eq!(events.poll(), None);
    }
}
