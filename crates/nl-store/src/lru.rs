//! Bounded most-recently-used map with an eviction callback.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// A fixed-capacity map ordered by recency of last access. When an insert
/// pushes the map past capacity, the single least-recently-used entry is
/// evicted and the eviction handler fires exactly once for it. `remove` and
/// `clear` never fire the handler.
pub struct LruMap<K, V> {
    capacity: usize,
    entries: HashMap<K, V>,
    order: VecDeque<K>,
    on_evict: Option<Box<dyn FnMut(&K, &V) + Send>>,
}

impl<K: Eq + Hash + Clone, V> LruMap<K, V> {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "LruMap capacity must be positive");
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
            on_evict: None,
        }
    }

    pub fn with_eviction_handler(
        capacity: usize,
        handler: impl FnMut(&K, &V) + Send + 'static,
    ) -> Self {
        let mut map = Self::new(capacity);
        map.on_evict = Some(Box::new(handler));
        map
    }

    /// Look up a key, bumping it to the most-recently-used position on a hit.
    /// Misses do not mutate the order.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if !self.entries.contains_key(key) {
            return None;
        }
        self.touch(key);
        self.entries.get(key)
    }

    /// Insert at the most-recently-used position. Re-inserting an existing
    /// key discards its old position without evicting a third entry.
    pub fn insert(&mut self, key: K, value: V) {
        let replaced = self.entries.insert(key.clone(), value).is_some();
        if replaced {
            self.touch(&key);
            return;
        }

        self.order.push_back(key);
        if self.entries.len() > self.capacity {
            if let Some(lru_key) = self.order.pop_front() {
                if let Some(lru_value) = self.entries.remove(&lru_key) {
                    if let Some(handler) = self.on_evict.as_mut() {
                        handler(&lru_key, &lru_value);
                    }
                }
            }
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.order.retain(|k| k != key);
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }

    fn touch(&mut self, key: &K) {
        self.order.retain(|k| k != key);
        self.order.push_back(key.clone());
    }
}
