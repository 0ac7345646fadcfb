//! Priority dictionary with lazy deletion.
//!
//! Updating a priority pushes a new heap entry, stamped with a fresh
//! sequence number, and leaves the old one in place. Entries whose stamp
//! disagrees with the live map are skipped when they surface at the top.
//! Once the heap holds more than twice as many entries as there are live
//! keys it's rebuilt from the live map.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::hash::Hash;

use fnv::FnvHashMap;

/// Map from keys to non-negative priorities with cheap access to the
/// lowest-priority key.
///
/// Keys with equal priority come out in the order they were last set.
#[derive(Debug, Clone)]
pub struct PriorityDict<K: Ord + Hash + Clone> {
    live: FnvHashMap<K, (u64, u64)>,
    heap: BinaryHeap<Reverse<(u64, u64, K)>>,
    seq: u64,
}

impl<K: Ord + Hash + Clone> Default for PriorityDict<K> {
    fn default() -> Self {
        Self {
            live: FnvHashMap::default(),
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }
}

impl<K: Ord + Hash + Clone> PriorityDict<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Number of heap entries, stale ones included.
    pub fn heap_len(&self) -> usize {
        self.heap.len()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.live.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<u64> {
        self.live.get(key).map(|(p, _)| *p)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, u64)> {
        self.live.iter().map(|(k, (p, _))| (k, *p))
    }

    /// Inserts the key or updates its priority.
    pub fn set(&mut self, key: K, priority: u64) {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        self.live.insert(key.clone(), (priority, seq));
        self.heap.push(Reverse((priority, seq, key)));
        self.maybe_rebuild();
    }

    pub fn remove(&mut self, key: &K) -> Option<u64> {
        let removed = self.live.remove(key).map(|(p, _)| p);
        if removed.is_some() {
            self.maybe_rebuild();
        }
        removed
    }

    /// Increments the key's priority, returning the new value.
    pub fn increment(&mut self, key: &K) -> Option<u64> {
        let priority = self.get(key)?.saturating_add(1);
        self.set(key.clone(), priority);
        Some(priority)
    }

    /// Decrements the key's priority, never going below zero.
    pub fn decrement(&mut self, key: &K) -> Option<u64> {
        let current = self.get(key)?;
        let priority = current.saturating_sub(1);
        if priority != current {
            self.set(key.clone(), priority);
        }
        Some(priority)
    }

    /// Returns the key with the lowest priority without removing it.
    pub fn peek_min(&mut self) -> Option<(&K, u64)> {
        self.discard_stale();
        self.heap.peek().map(|Reverse((p, _, k))| (k, *p))
    }

    /// Removes and returns the key with the lowest priority.
    pub fn pop_min(&mut self) -> Option<(K, u64)> {
        self.discard_stale();
        let Reverse((priority, _, key)) = self.heap.pop()?;
        self.live.remove(&key);
        Some((key, priority))
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse((priority, seq, key))) = self.heap.peek() {
            if self.live.get(key) == Some(&(*priority, *seq)) {
                break;
            }
            self.heap.pop();
        }
    }

    fn maybe_rebuild(&mut self) {
        if self.heap.len() > 2 * self.live.len() {
            self.heap = self
                .live
                .iter()
                .map(|(k, (p, seq))| Reverse((*p, *seq, k.clone())))
                .collect();
            trace!("rebuilt priority heap with {} live entries", self.live.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_comes_first() {
        let mut pd = PriorityDict::new();
        pd.set("a", 3);
        pd.set("b", 1);
        pd.set("c", 2);
        assert_eq!(pd.peek_min(), Some((&"b", 1)));
        pd.set("b", 5);
        assert_eq!(pd.peek_min(), Some((&"c", 2)));
        assert_eq!(pd.pop_min(), Some(("c", 2)));
        assert_eq!(pd.pop_min(), Some(("a", 3)));
        assert_eq!(pd.pop_min(), Some(("b", 5)));
        assert_eq!(pd.pop_min(), None);
    }

    #[test]
    fn ties_follow_insertion_order() {
        let mut pd = PriorityDict::new();
        pd.set("b", 0);
        pd.set("a", 0);
        pd.set("c", 0);
        assert_eq!(pd.peek_min(), Some((&"b", 0)));
        pd.increment(&"b");
        pd.decrement(&"b");
        assert_eq!(pd.pop_min(), Some(("a", 0)));
        assert_eq!(pd.pop_min(), Some(("c", 0)));
        assert_eq!(pd.pop_min(), Some(("b", 0)));
    }

    #[test]
    fn removed_keys_never_surface() {
        let mut pd = PriorityDict::new();
        pd.set(1u8, 0);
        pd.set(2u8, 1);
        pd.remove(&1);
        assert_eq!(pd.peek_min(), Some((&2, 1)));
        assert!(!pd.contains(&1));
        assert_eq!(pd.increment(&1), None);
    }

    #[test]
    fn decrement_is_floored() {
        let mut pd = PriorityDict::new();
        pd.set("w", 1);
        assert_eq!(pd.decrement(&"w"), Some(0));
        assert_eq!(pd.decrement(&"w"), Some(0));
        assert_eq!(pd.get(&"w"), Some(0));
    }

    #[test]
    fn reinserting_old_priority_does_not_duplicate() {
        let mut pd = PriorityDict::new();
        pd.set("x", 3);
        pd.set("y", 10);
        pd.set("x", 4);
        pd.set("x", 3);
        assert_eq!(pd.pop_min(), Some(("x", 3)));
        assert_eq!(pd.pop_min(), Some(("y", 10)));
        assert!(pd.is_empty());
        assert_eq!(pd.peek_min(), None);
    }

    #[test]
    fn heap_growth_is_bounded() {
        let mut pd = PriorityDict::new();
        for k in 0..4u32 {
            pd.set(k, 0);
        }
        for _ in 0..1000 {
            for k in 0..4u32 {
                pd.increment(&k);
            }
        }
        assert!(pd.heap_len() <= 2 * pd.len());
        assert_eq!(pd.get(&2), Some(1000));
    }
}
