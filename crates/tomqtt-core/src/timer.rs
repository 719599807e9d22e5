//! Cooperative timer wheel.
//!
//! A flat list of `(deadline, key)` pairs over a small, typed key set.
//! Adding a key that is already pending moves its deadline instead of
//! duplicating it; every periodic behaviour in the bridges (keepalive,
//! command timeouts, write retries, pollers) leans on that retriggerable
//! semantics. Cardinality is a handful of entries, so a scanned `Vec`
//! beats a heap.

use std::time::{Duration, Instant};

/// Timer wheel over keys of type `K`.
#[derive(Debug)]
pub struct TimerWheel<K> {
    entries: Vec<Entry<K>>,
    seq: u64,
}

#[derive(Debug)]
struct Entry<K> {
    deadline: Instant,
    seq: u64,
    key: K,
}

impl<K: PartialEq> TimerWheel<K> {
    /// Create an empty wheel.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            seq: 0,
        }
    }

    /// Arm `key` to fire `delay` from `now`. An already-pending equal key
    /// is re-armed, not duplicated.
    pub fn add(&mut self, now: Instant, delay: Duration, key: K) {
        self.remove(&key);
        self.seq += 1;
        self.entries.push(Entry {
            deadline: now + delay,
            seq: self.seq,
            key,
        });
    }

    /// Cancel a pending key; unknown keys are ignored.
    pub fn remove(&mut self, key: &K) {
        self.entries.retain(|e| e.key != *key);
    }

    /// True when `key` is armed.
    pub fn pending(&self, key: &K) -> bool {
        self.entries.iter().any(|e| e.key == *key)
    }

    /// Remove and return every key whose deadline passed, in deadline
    /// order; ties fire in insertion order.
    pub fn flush(&mut self, now: Instant) -> Vec<K> {
        let mut due: Vec<Entry<K>> = Vec::new();
        let mut rest: Vec<Entry<K>> = Vec::new();
        for e in self.entries.drain(..) {
            if e.deadline <= now {
                due.push(e);
            } else {
                rest.push(e);
            }
        }
        self.entries = rest;
        due.sort_by_key(|e| (e.deadline, e.seq));
        due.into_iter().map(|e| e.key).collect()
    }

    /// Time until the next deadline; `None` means "sleep until I/O".
    pub fn wait_time(&self, now: Instant) -> Option<Duration> {
        self.entries
            .iter()
            .map(|e| e.deadline)
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
    }
}

impl<K: PartialEq> Default for TimerWheel<K> {
    fn default() -> Self {
        Self::new()
    }
}
