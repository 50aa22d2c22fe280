//! Orders the publication of flushed segments and frozen packets.
//!
//! Flushes run concurrently, but packets must reach the update stream in the
//! order they were frozen. Every flush (and every standalone freeze of the
//! global delete buffer) takes a ticket under the queue lock at freeze time.
//! Tickets are published strictly from the head: a finished flush behind a
//! slower one waits until the slower one completes or fails.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::error::Result;
use crate::index::writer::delete_queue::DeleteQueue;
use crate::index::writer::frozen_updates::FrozenBufferedUpdates;
use crate::index::writer::per_thread::{FlushedSegment, PerThreadWriter};

/// Receives published tickets, in ticket order.
pub trait FlushPublisher {
    /// Publish a flushed segment together with the global packet frozen
    /// when its flush started.
    fn publish_flushed_segment(
        &self,
        segment: FlushedSegment,
        global: Option<Arc<FrozenBufferedUpdates>>,
    ) -> Result<()>;

    /// Publish a global packet without a segment.
    fn publish_frozen_updates(&self, packet: Arc<FrozenBufferedUpdates>) -> Result<()>;
}

#[derive(Debug)]
enum TicketState {
    /// The flush is still running.
    Pending,
    /// The flush produced a segment.
    Segment(FlushedSegment),
    /// The flush produced nothing worth publishing.
    Dropped,
    /// The flush failed.
    Failed,
    /// A global packet frozen without a flush.
    Deletes,
}

#[derive(Debug)]
struct FlushTicket {
    global: Option<Arc<FrozenBufferedUpdates>>,
    state: TicketState,
}

impl FlushTicket {
    fn can_publish(&self) -> bool {
        !matches!(self.state, TicketState::Pending)
    }
}

/// Handle on a ticket taken by [`FlushTicketQueue::add_flush_ticket`].
#[derive(Debug, Clone)]
pub struct Ticket(Arc<Mutex<FlushTicket>>);

/// FIFO of flush tickets.
#[derive(Debug, Default)]
pub struct FlushTicketQueue {
    queue: Mutex<VecDeque<Ticket>>,
    ticket_count: AtomicUsize,
    purge_lock: Mutex<()>,
}

impl FlushTicketQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Freeze the global buffer of `queue` into a deletes-only ticket.
    pub fn add_deletes(&self, delete_queue: &DeleteQueue) {
        let mut queue = self.queue.lock();
        self.ticket_count.fetch_add(1, Ordering::AcqRel);
        let global = delete_queue.freeze_global_buffer(None).map(Arc::new);
        trace!("deletes ticket, packet: {}", global.is_some());
        queue.push_back(Ticket(Arc::new(Mutex::new(FlushTicket {
            global,
            state: TicketState::Deletes,
        }))));
    }

    /// Take a ticket for a flush. The buffer's global packet is frozen while
    /// the queue lock is held, so packets are frozen in ticket order.
    pub fn add_flush_ticket(&self, dwpt: &mut PerThreadWriter) -> Ticket {
        let mut queue = self.queue.lock();
        self.ticket_count.fetch_add(1, Ordering::AcqRel);
        let global = dwpt.prepare_flush().map(Arc::new);
        let ticket = Ticket(Arc::new(Mutex::new(FlushTicket {
            global,
            state: TicketState::Pending,
        })));
        queue.push_back(ticket.clone());
        ticket
    }

    /// Attach a flushed segment to its ticket.
    pub fn add_segment(&self, ticket: &Ticket, segment: FlushedSegment) {
        let _queue = self.queue.lock();
        ticket.0.lock().state = TicketState::Segment(segment);
    }

    /// Mark a ticket whose flush produced no segment to publish.
    pub fn mark_ticket_dropped(&self, ticket: &Ticket) {
        let _queue = self.queue.lock();
        ticket.0.lock().state = TicketState::Dropped;
    }

    /// Mark a ticket whose flush failed. Its global packet still publishes.
    pub fn mark_ticket_failed(&self, ticket: &Ticket) {
        let _queue = self.queue.lock();
        ticket.0.lock().state = TicketState::Failed;
    }

    /// Whether any ticket is queued.
    pub fn has_tickets(&self) -> bool {
        self.ticket_count() != 0
    }

    /// Number of queued tickets.
    pub fn ticket_count(&self) -> usize {
        self.ticket_count.load(Ordering::Acquire)
    }

    /// Publish ready tickets from the head, waiting for a concurrent purge.
    pub fn force_purge(&self, publisher: &dyn FlushPublisher) -> Result<usize> {
        let _purge = self.purge_lock.lock();
        self.inner_purge(publisher)
    }

    /// Publish ready tickets unless another thread is already purging.
    pub fn try_purge(&self, publisher: &dyn FlushPublisher) -> Result<usize> {
        match self.purge_lock.try_lock() {
            Some(_purge) => self.inner_purge(publisher),
            None => Ok(0),
        }
    }

    fn inner_purge(&self, publisher: &dyn FlushPublisher) -> Result<usize> {
        let mut purged = 0;
        loop {
            let head = {
                let queue = self.queue.lock();
                match queue.front() {
                    Some(ticket) if ticket.0.lock().can_publish() => ticket.clone(),
                    _ => break,
                }
            };

            let (global, state) = {
                let mut ticket = head.0.lock();
                let state = std::mem::replace(&mut ticket.state, TicketState::Dropped);
                (ticket.global.take(), state)
            };
            let published = publish(publisher, global, state);

            {
                let mut queue = self.queue.lock();
                let polled = queue.pop_front();
                debug_assert!(polled.is_some_and(|t| Arc::ptr_eq(&t.0, &head.0)));
                self.ticket_count.fetch_sub(1, Ordering::AcqRel);
            }
            purged += 1;
            published?;
        }
        if purged > 0 {
            debug!("published {purged} flush tickets");
        }
        Ok(purged)
    }

    /// Drop every ticket without publishing.
    pub fn clear(&self) {
        let mut queue = self.queue.lock();
        queue.clear();
        self.ticket_count.store(0, Ordering::Release);
    }
}

fn publish(
    publisher: &dyn FlushPublisher,
    global: Option<Arc<FrozenBufferedUpdates>>,
    state: TicketState,
) -> Result<()> {
    match state {
        TicketState::Segment(segment) => publisher.publish_flushed_segment(segment, global),
        TicketState::Pending => Ok(()),
        TicketState::Dropped | TicketState::Failed | TicketState::Deletes => match global {
            Some(packet) if packet.any() => publisher.publish_frozen_updates(packet),
            _ => Ok(()),
        },
    }
}
