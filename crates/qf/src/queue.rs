//! Bounded event queue with a dedicated front slot.
//!
//! The front slot holds the event the consumer takes next; the ring holds
//! everything behind it. A producer that finds the front slot empty fills it
//! directly and must wake the consumer; every other post lands in the ring.
//! `capacity` counts the front slot, so the ring has `capacity - 1` entries.
//!
//! The queue itself is not synchronized. Each active object keeps its queue
//! behind the global critical section.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::event::{EventRef, Margin};

/// Result of checking a post against the free capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Accept,
    /// Too little room for the requested margin; nothing changes.
    Reject,
    /// No room at all under [`Margin::NoMargin`]; the caller must halt.
    Overflow,
}

/// Usage snapshot of one event queue.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub capacity: usize,
    pub free: usize,
    /// Lowest free count ever observed (worst backlog).
    pub min_free: usize,
}

impl QueueStats {
    pub const fn len(&self) -> usize {
        self.capacity - self.free
    }

    pub const fn is_empty(&self) -> bool {
        self.free == self.capacity
    }
}

#[derive(Debug)]
pub struct EventQueue {
    front: Option<EventRef>,
    ring: Box<[Option<EventRef>]>,
    head: usize,
    tail: usize,
    n_free: usize,
    n_min: usize,
}

impl EventQueue {
    /// Creates an empty queue holding up to `capacity` events.
    ///
    /// `capacity` must be at least 1.
    pub fn new(capacity: usize) -> Self {
        let ring = vec![None; capacity.saturating_sub(1)].into_boxed_slice();
        Self {
            front: None,
            ring,
            head: 0,
            tail: 0,
            n_free: capacity,
            n_min: capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.len() + 1
    }

    pub fn free(&self) -> usize {
        self.n_free
    }

    pub fn min_free(&self) -> usize {
        self.n_min
    }

    pub fn len(&self) -> usize {
        self.capacity() - self.n_free
    }

    pub fn is_empty(&self) -> bool {
        self.front.is_none()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            capacity: self.capacity(),
            free: self.n_free,
            min_free: self.n_min,
        }
    }

    pub(crate) fn admit(&self, margin: Margin) -> Admission {
        match margin {
            Margin::NoMargin if self.n_free > 0 => Admission::Accept,
            Margin::NoMargin => Admission::Overflow,
            Margin::Keep(keep) if self.n_free > keep => Admission::Accept,
            Margin::Keep(_) => Admission::Reject,
        }
    }

    /// Appends `event` behind everything already queued.
    ///
    /// Must only be called after [`admit`](Self::admit) accepted. Returns
    /// `true` when the queue was empty and the consumer needs a wake-up.
    pub(crate) fn push_back(&mut self, event: EventRef) -> bool {
        self.take_slot();
        if self.front.is_none() {
            self.front = Some(event);
            return true;
        }
        self.ring[self.head] = Some(event);
        self.head = self.next(self.head);
        false
    }

    /// Puts `event` ahead of everything already queued.
    ///
    /// Same contract as [`push_back`](Self::push_back).
    pub(crate) fn push_front(&mut self, event: EventRef) -> bool {
        self.take_slot();
        match self.front.replace(event) {
            None => true,
            Some(previous) => {
                self.tail = self.prev(self.tail);
                self.ring[self.tail] = Some(previous);
                false
            }
        }
    }

    /// Removes the event at the front and refills the front slot from the
    /// ring.
    pub(crate) fn take(&mut self) -> Option<EventRef> {
        let event = self.front.take()?;
        self.n_free += 1;
        if self.n_free < self.capacity() {
            self.front = self.ring[self.tail].take();
            self.tail = self.next(self.tail);
        }
        Some(event)
    }

    fn take_slot(&mut self) {
        self.n_free -= 1;
        if self.n_min > self.n_free {
            self.n_min = self.n_free;
        }
    }

    fn next(&self, index: usize) -> usize {
        if index + 1 == self.ring.len() {
            0
        } else {
            index + 1
        }
    }

    fn prev(&self, index: usize) -> usize {
        if index == 0 {
            self.ring.len() - 1
        } else {
            index - 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Signal;

    fn evt(raw: u16) -> EventRef {
        EventRef::from(Signal(raw))
    }

    fn drain(queue: &mut EventQueue) -> Vec<u16> {
        core::iter::from_fn(|| queue.take())
            .map(|e| e.signal().raw())
            .collect()
    }

    #[test]
    fn fifo_order_across_front_and_ring() {
        let mut queue = EventQueue::new(4);
        assert!(queue.push_back(evt(10)));
        assert!(!queue.push_back(evt(11)));
        assert!(!queue.push_back(evt(12)));
        assert!(!queue.push_back(evt(13)));
        assert_eq!(queue.free(), 0);
        assert_eq!(drain(&mut queue), vec![10, 11, 12, 13]);
        assert_eq!(queue.free(), 4);
        assert_eq!(queue.min_free(), 0);
    }

    #[test]
    fn ring_wraps_around() {
        let mut queue = EventQueue::new(3);
        let mut seen = Vec::new();
        for round in 0..5u16 {
            queue.push_back(evt(round * 2));
            queue.push_back(evt(round * 2 + 1));
            seen.extend(drain(&mut queue));
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[test]
    fn interleaved_take_keeps_order() {
        let mut queue = EventQueue::new(3);
        queue.push_back(evt(1));
        queue.push_back(evt(2));
        assert_eq!(queue.take().map(|e| e.signal().raw()), Some(1));
        queue.push_back(evt(3));
        queue.push_back(evt(4));
        assert_eq!(drain(&mut queue), vec![2, 3, 4]);
    }

    #[test]
    fn lifo_post_jumps_the_line() {
        let mut queue = EventQueue::new(4);
        queue.push_back(evt(1));
        queue.push_back(evt(2));
        assert!(!queue.push_front(evt(9)));
        assert_eq!(drain(&mut queue), vec![9, 1, 2]);
    }

    #[test]
    fn lifo_into_empty_queue_wakes() {
        let mut queue = EventQueue::new(2);
        assert!(queue.push_front(evt(5)));
        assert_eq!(drain(&mut queue), vec![5]);
    }

    #[test]
    fn margin_admission() {
        let mut queue = EventQueue::new(3);
        assert_eq!(queue.admit(Margin::Keep(2)), Admission::Accept);
        queue.push_back(evt(1));
        // two free, margin two must be preserved
        assert_eq!(queue.admit(Margin::Keep(2)), Admission::Reject);
        assert_eq!(queue.admit(Margin::Keep(1)), Admission::Accept);
        queue.push_back(evt(2));
        queue.push_back(evt(3));
        assert_eq!(queue.admit(Margin::Keep(0)), Admission::Reject);
        assert_eq!(queue.admit(Margin::NoMargin), Admission::Overflow);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn single_slot_queue_uses_front_only() {
        let mut queue = EventQueue::new(1);
        assert_eq!(queue.capacity(), 1);
        assert!(queue.push_back(evt(7)));
        assert_eq!(queue.admit(Margin::NoMargin), Admission::Overflow);
        assert_eq!(drain(&mut queue), vec![7]);
        assert!(queue.push_back(evt(8)));
        assert_eq!(drain(&mut queue), vec![8]);
    }

    #[test]
    fn stats_report_backlog() {
        let mut queue = EventQueue::new(5);
        queue.push_back(evt(1));
        queue.push_back(evt(2));
        let stats = queue.stats();
        assert_eq!(stats.capacity, 5);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats.min_free, 3);
        assert!(!stats.is_empty());
    }
}
