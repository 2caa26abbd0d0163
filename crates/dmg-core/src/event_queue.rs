//! Single-threaded discrete-event timeline with individually cancellable timers.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use crate::sim_time::{SimDuration, SimTime};


/// Handle to a scheduled event. Cancelling an expired or already cancelled
/// event is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventId(u64);

impl EventId {
    /// Never refers to a scheduled event
    pub const NONE: EventId = EventId(0);
}

struct Entry<E> {
    at: SimTime,
    id: u64,
    ev: E,
}

impl<E> PartialEq for Entry<E> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.id == other.id
    }
}

impl<E> Eq for Entry<E> {}

impl<E> PartialOrd for Entry<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Entry<E> {
    /// Reversed so the max-heap pops the earliest event first; ties fire in
    /// scheduling order
    fn cmp(&self, other: &Self) -> Ordering {
        other.at.cmp(&self.at).then_with(|| other.id.cmp(&self.id))
    }
}

/// Anything that can arm and disarm timers for events of type `E`
pub trait EventScheduler<E> {
    fn now(&self) -> SimTime;
    fn schedule(&mut self, delay: SimDuration, ev: E) -> EventId;
    fn cancel(&mut self, id: EventId);
    fn is_pending(&self, id: EventId) -> bool;
}

pub struct EventQueue<E> {
    now: SimTime,
    heap: BinaryHeap<Entry<E>>,
    pending: HashSet<u64>,
    next_id: u64,
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventQueue<E> {
    pub fn new() -> Self {
        EventQueue {
            now: SimTime::ZERO,
            heap: BinaryHeap::new(),
            pending: HashSet::new(),
            next_id: 1,
        }
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    pub fn schedule_at(&mut self, at: SimTime, ev: E) -> EventId {
        let at = if at < self.now {
            tracing::warn!("event scheduled in the past ({} < {}), firing now", at, self.now);
            self.now
        } else {
            at
        };
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(id);
        self.heap.push(Entry { at, id, ev });
        EventId(id)
    }

    pub fn schedule(&mut self, delay: SimDuration, ev: E) -> EventId {
        self.schedule_at(self.now + delay, ev)
    }

    pub fn cancel(&mut self, id: EventId) {
        // Entry stays in the heap and is skipped when popped
        self.pending.remove(&id.0);
    }

    pub fn is_pending(&self, id: EventId) -> bool {
        self.pending.contains(&id.0)
    }

    /// Time of the next live event, if any
    pub fn peek_time(&mut self) -> Option<SimTime> {
        self.drop_cancelled_head();
        self.heap.peek().map(|e| e.at)
    }

    /// Removes the next live event and advances the clock to its timestamp
    pub fn pop_next(&mut self) -> Option<(SimTime, E)> {
        self.drop_cancelled_head();
        let entry = self.heap.pop()?;
        self.pending.remove(&entry.id);
        self.now = entry.at;
        tracing::trace!(ts = %self.now, "firing event {}", entry.id);
        Some((entry.at, entry.ev))
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    fn drop_cancelled_head(&mut self) {
        while let Some(head) = self.heap.peek() {
            if self.pending.contains(&head.id) {
                break;
            }
            self.heap.pop();
        }
    }
}

impl<E> EventScheduler<E> for EventQueue<E> {
    fn now(&self) -> SimTime {
        self.now
    }

    fn schedule(&mut self, delay: SimDuration, ev: E) -> EventId {
        EventQueue::schedule(self, delay, ev)
    }

    fn cancel(&mut self, id: EventId) {
        EventQueue::cancel(self, id)
    }

    fn is_pending(&self, id: EventId) -> bool {
        EventQueue::is_pending(self, id)
    }
}

/// Lets a component schedule its own event type on a shared outer queue.
/// `wrap` turns the component event into the outer event, typically by
/// tagging it with the owning node.
pub struct ScopedScheduler<'a, O, F> {
    queue: &'a mut EventQueue<O>,
    wrap: F,
}

impl<'a, O, F> ScopedScheduler<'a, O, F> {
    pub fn new(queue: &'a mut EventQueue<O>, wrap: F) -> Self {
        ScopedScheduler { queue, wrap }
    }
}

impl<'a, I, O, F> EventScheduler<I> for ScopedScheduler<'a, O, F>
where
    F: Fn(I) -> O,
{
    fn now(&self) -> SimTime {
        self.queue.now()
    }

    fn schedule(&mut self, delay: SimDuration, ev: I) -> EventId {
        let outer = (self.wrap)(ev);
        self.queue.schedule(delay, outer)
    }

    fn cancel(&mut self, id: EventId) {
        self.queue.cancel(id)
    }

    fn is_pending(&self, id: EventId) -> bool {
        self.queue.is_pending(id)
    }
}

/// Re-types the events of a component that is itself driven through a
/// scheduler, e.g. MacLow timers carried inside the MAC's own events.
pub struct MappedScheduler<'a, O, F> {
    inner: &'a mut dyn EventScheduler<O>,
    wrap: F,
}

impl<'a, O, F> MappedScheduler<'a, O, F> {
    pub fn new(inner: &'a mut dyn EventScheduler<O>, wrap: F) -> Self {
        MappedScheduler { inner, wrap }
    }
}

impl<'a, I, O, F> EventScheduler<I> for MappedScheduler<'a, O, F>
where
    F: Fn(I) -> O,
{
    fn now(&self) -> SimTime {
        self.inner.now()
    }

    fn schedule(&mut self, delay: SimDuration, ev: I) -> EventId {
        let outer = (self.wrap)(ev);
        self.inner.schedule(delay, outer)
    }

    fn cancel(&mut self, id: EventId) {
        self.inner.cancel(id)
    }

    fn is_pending(&self, id: EventId) -> bool {
        self.inner.is_pending(id)
    }
}
