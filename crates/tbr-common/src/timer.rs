//! Deadline queue keyed by entry identity.
//!
//! Every key owns at most one pending deadline. Re-scheduling a key moves
//! its deadline, cancelling removes it, and [`TimerQueue::cancel_where`]
//! drops every timer belonging to a torn-down link in one pass.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::time::Instant;

/// Heap slot ordered so that the earliest deadline sits on top of the
/// max-heap. `seq` breaks ties in scheduling order and identifies the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    at: Instant,
    seq: u64,
}

impl Ord for Slot {
    fn cmp(&self, other: &Self) -> Ordering {
        other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Slot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A priority queue of deadlines, one per key.
///
/// Cancelled and rescheduled slots are left in the heap and skipped lazily;
/// only slots still referenced from `live` ever fire.
#[derive(Debug)]
pub struct TimerQueue<K> {
    heap: BinaryHeap<Slot>,
    live: HashMap<u64, K>,
    by_key: HashMap<K, Slot>,
    next_seq: u64,
}

impl<K> TimerQueue<K>
where
    K: Eq + Hash + Clone,
{
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            by_key: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Arms (or re-arms) the timer for `key`.
    ///
    /// Returns the previous deadline if the key already had one.
    pub fn schedule(&mut self, key: K, at: Instant) -> Option<Instant> {
        let previous = self.cancel_slot(&key);

        let slot = Slot {
            at,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        self.heap.push(slot);
        self.live.insert(slot.seq, key.clone());
        self.by_key.insert(key, slot);
        self.compact();
        previous
    }

    /// Cancels the timer for `key`. Returns true if one was pending.
    pub fn cancel(&mut self, key: &K) -> bool {
        let cancelled = self.cancel_slot(key).is_some();
        self.compact();
        cancelled
    }

    /// Cancels every timer whose key matches `pred`.
    ///
    /// Returns the number of timers cancelled.
    pub fn cancel_where<F>(&mut self, mut pred: F) -> usize
    where
        F: FnMut(&K) -> bool,
    {
        let keys: Vec<K> = self.by_key.keys().filter(|k| pred(k)).cloned().collect();
        for key in &keys {
            self.cancel_slot(key);
        }
        self.compact();
        keys.len()
    }

    /// Cancels every pending timer.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
        self.by_key.clear();
    }

    /// Returns the pending deadline for `key`, if any.
    pub fn deadline(&self, key: &K) -> Option<Instant> {
        self.by_key.get(key).map(|slot| slot.at)
    }

    /// Returns true if `key` has a pending timer.
    pub fn contains(&self, key: &K) -> bool {
        self.by_key.contains_key(key)
    }

    /// Returns the earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.by_key.values().map(|slot| slot.at).min()
    }

    /// Removes and returns every key whose deadline is at or before `now`,
    /// earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<K> {
        let mut expired = Vec::new();

        while let Some(top) = self.heap.peek().copied() {
            if top.at > now {
                break;
            }
            self.heap.pop();
            if let Some(key) = self.live.remove(&top.seq) {
                self.by_key.remove(&key);
                expired.push(key);
            }
        }

        expired
    }

    /// Returns the number of pending timers.
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Returns true if no timer is pending.
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    fn cancel_slot(&mut self, key: &K) -> Option<Instant> {
        let slot = self.by_key.remove(key)?;
        self.live.remove(&slot.seq);
        Some(slot.at)
    }

    /// Drops dead slots once they dominate the heap.
    fn compact(&mut self) {
        if self.heap.len() > 64 && self.heap.len() > 2 * self.live.len() {
            let live = &self.live;
            self.heap.retain(|slot| live.contains_key(&slot.seq));
        }
    }
}

impl<K> Default for TimerQueue<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
