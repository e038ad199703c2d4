//! Concurrent per-key state registry.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::Result;

/// Lazily populated map from key to shared per-key state.
///
/// Creation is optimistic: two callers racing on a new key may both build a
/// value, the first insert wins and the other value is dropped. Lookups for
/// distinct keys never contend on a global lock.
pub struct Registry<V> {
    entries: DashMap<String, Arc<V>>,
}

impl<V> Registry<V> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Look up an existing entry.
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Return the entry for `key`, building it with `make` if absent.
    pub fn get_or_insert_with<F>(&self, key: &str, make: F) -> Arc<V>
    where
        F: FnOnce() -> V,
    {
        if let Some(existing) = self.get(key) {
            return existing;
        }

        let fresh = Arc::new(make());
        self.entries
            .entry(key.to_string())
            .or_insert(fresh)
            .value()
            .clone()
    }

    /// Like [`get_or_insert_with`](Self::get_or_insert_with) for fallible
    /// construction; nothing is inserted when `make` fails.
    pub fn get_or_try_insert_with<F>(&self, key: &str, make: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Result<V>,
    {
        if let Some(existing) = self.get(key) {
            return Ok(existing);
        }

        let fresh = Arc::new(make()?);
        Ok(self
            .entries
            .entry(key.to_string())
            .or_insert(fresh)
            .value()
            .clone())
    }

    /// Number of keys with state.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key has state yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V> Default for Registry<V> {
    fn default() -> Self {
        Self::new()
    }
}
