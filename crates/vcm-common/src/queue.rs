//! Idempotent pending-work queue.
//!
//! Work is enqueued when a change is detected and removed only after the
//! external call that propagates it has completed, so an aborted drain
//! leaves the remaining entries in place (at-least-once delivery).

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Insertion-ordered queue with at most one entry per key.
///
/// Enqueueing a key that is already pending replaces its value but keeps
/// its position, so the latest intent wins without reordering the queue.
#[derive(Debug, Clone)]
pub struct PendingQueue<K, V> {
    order: VecDeque<K>,
    entries: HashMap<K, V>,
}

impl<K, V> PendingQueue<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    /// Adds work for `key`. Returns true if the key was not pending yet.
    pub fn enqueue(&mut self, key: K, value: V) -> bool {
        if let Some(existing) = self.entries.get_mut(&key) {
            *existing = value;
            return false;
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, value);
        true
    }

    /// Removes the entry for `key` once its work is done.
    pub fn complete(&mut self, key: &K) -> Option<V> {
        let value = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(value)
    }

    /// Copies the pending entries in insertion order.
    ///
    /// Draining iterates the snapshot and calls [`complete`](Self::complete)
    /// per entry, so new work enqueued meanwhile waits for the next drain.
    pub fn snapshot(&self) -> Vec<(K, V)>
    where
        V: Clone,
    {
        self.order
            .iter()
            .filter_map(|k| self.entries.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// Returns the pending value for `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every pending entry.
    pub fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }
}

impl<K, V> Default for PendingQueue<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
