/// Monotonic microsecond timestamps and the deadline queue.
///
/// Every engine entry point takes an explicit `now`; the host learns when
/// to wake through `next_deadline()`. The queue is a plain binary heap of
/// `(deadline, action)`. Entries are never cancelled in place; the owner
/// revalidates an action against current state when it fires and discards
/// stale ones.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::ops::Add;
use std::time::Duration;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub const fn from_micros(us: u64) -> Self {
        Timestamp(us)
    }

    pub const fn from_millis(ms: u64) -> Self {
        Timestamp(ms * 1_000)
    }

    pub const fn from_secs(s: u64) -> Self {
        Timestamp(s * 1_000_000)
    }

    pub const fn as_micros(self) -> u64 {
        self.0
    }

    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, d: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(d.as_micros() as u64))
    }
}

struct Entry<A> {
    deadline: Timestamp,
    seq: u64,
    action: A,
}

impl<A> PartialEq for Entry<A> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<A> Eq for Entry<A> {}

impl<A> PartialOrd for Entry<A> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<A> Ord for Entry<A> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Priority queue over `(deadline, action)`. FIFO among equal deadlines.
pub struct TimerQueue<A> {
    heap: BinaryHeap<Reverse<Entry<A>>>,
    seq: u64,
}

impl<A> TimerQueue<A> {
    pub fn new() -> Self {
        TimerQueue {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    pub fn schedule(&mut self, deadline: Timestamp, action: A) {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Reverse(Entry {
            deadline,
            seq,
            action,
        }));
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.heap.peek().map(|Reverse(e)| e.deadline)
    }

    /// Pop the next action whose deadline has passed.
    pub fn pop_due(&mut self, now: Timestamp) -> Option<A> {
        match self.heap.peek() {
            Some(Reverse(e)) if e.deadline <= now => {
                self.heap.pop().map(|Reverse(e)| e.action)
            }
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

impl<A> Default for TimerQueue<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut q = TimerQueue::new();
        q.schedule(Timestamp::from_millis(30), "c");
        q.schedule(Timestamp::from_millis(10), "a");
        q.schedule(Timestamp::from_millis(20), "b");

        assert_eq!(q.next_deadline(), Some(Timestamp::from_millis(10)));
        assert_eq!(q.pop_due(Timestamp::from_millis(5)), None);
        assert_eq!(q.pop_due(Timestamp::from_millis(25)), Some("a"));
        assert_eq!(q.pop_due(Timestamp::from_millis(25)), Some("b"));
        assert_eq!(q.pop_due(Timestamp::from_millis(25)), None);
        assert_eq!(q.pop_due(Timestamp::from_millis(30)), Some("c"));
    }

    #[test]
    fn fifo_among_equal_deadlines() {
        let mut q = TimerQueue::new();
        let t = Timestamp::from_secs(1);
        q.schedule(t, 1);
        q.schedule(t, 2);
        q.schedule(t, 3);
        assert_eq!(q.pop_due(t), Some(1));
        assert_eq!(q.pop_due(t), Some(2));
        assert_eq!(q.pop_due(t), Some(3));
    }
}
