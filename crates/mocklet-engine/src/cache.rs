//! Bounded concurrency-safe cache used by the body-matcher regex compiler
//! and the per-script logger registry.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;

/// A small bounded map with least-recently-used eviction.
///
/// Multiple in-flight requests hit these caches concurrently, so all access
/// goes through a single mutex. The caches here are tiny (tens of entries)
/// and the guarded sections are short, so contention is not a concern.
pub struct BoundedCache<K, V> {
    max_size: usize,
    state: Mutex<CacheState<K, V>>,
}

struct CacheState<K, V> {
    entries: HashMap<K, Entry<V>>,
    tick: u64,
}

struct Entry<V> {
    value: V,
    last_used: u64,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache holding at most `max_size` entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                tick: 0,
            }),
        }
    }

    /// Look up a value, refreshing its recency on hit.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;
        state.entries.get_mut(key).map(|entry| {
            entry.last_used = tick;
            entry.value.clone()
        })
    }

    /// Return the cached value for `key`, computing and inserting it on miss.
    ///
    /// A `None` from the compute closure is not cached, so a bad input (e.g.
    /// an invalid regex pattern) is re-evaluated on each lookup rather than
    /// poisoning an entry slot.
    pub fn get_or_compute<F>(&self, key: K, compute: F) -> Option<V>
    where
        F: FnOnce() -> Option<V>,
    {
        if let Some(value) = self.get(&key) {
            return Some(value);
        }
        let value = compute()?;
        self.insert(key, value.clone());
        Some(value)
    }

    /// Insert a value, evicting the least-recently-used entry when full.
    pub fn insert(&self, key: K, value: V) {
        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;

        if !state.entries.contains_key(&key) && state.entries.len() >= self.max_size {
            if let Some(oldest) = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(k, _)| k.clone())
            {
                state.entries.remove(&oldest);
            }
        }

        state.entries.insert(
            key,
            Entry {
                value,
                last_used: tick,
            },
        );
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
