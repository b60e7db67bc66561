//! Bounded, thread-safe LRU cache.
//!
//! Used by the manifest layer for per-name descriptor lookups. All
//! operations take one mutex; recency under concurrent `get`s of the same
//! key is whatever the last mover observed.

use lru::LruCache as Inner;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Recency-ordered `key -> value` store that evicts the least recently used
/// entry once `max_size` is exceeded.
#[derive(Debug)]
pub struct LruCache<K: Hash + Eq, V: Clone> {
    inner: Mutex<Inner<K, V>>,
    max_size: usize,
}

impl<K: Hash + Eq, V: Clone> LruCache<K, V> {
    /// Create a cache holding at most `max_size` entries. A `max_size` of 0
    /// is treated as 1.
    pub fn new(max_size: usize) -> Self {
        let cap = NonZeroUsize::new(max_size.max(1)).expect("capacity is at least 1");
        Self { inner: Mutex::new(Inner::new(cap)), max_size: cap.get() }
    }

    /// Get a value, marking the key most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        self.lock().get(key).cloned()
    }

    /// Insert or update a value; evicts the least recent entry at capacity.
    pub fn set(&self, key: K, value: V) {
        self.lock().put(key, value);
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
