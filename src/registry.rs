//! Non-owning lookup of shared objects by identity.
//!
//! Ownership stays one-directional (engine → repository → parent); the
//! registry only remembers where a live object can be found. Entries whose
//! object has been dropped are pruned lazily.

use std::{
    collections::HashMap,
    fmt,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

/// Map of weakly held values, keyed by id.
pub struct Registry<K, V> {
    entries: Mutex<HashMap<K, Weak<V>>>,
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Copy,
{
    /// Empty registry.
    pub fn new() -> Self {
        Registry {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Remember `value` under `key`. Returns `false`, leaving the registry
    /// unchanged, when another live value is already registered there.
    pub fn register(&self, key: K, value: &Arc<V>) -> bool {
        let mut entries = self.lock();
        if entries
            .get(&key)
            .is_some_and(|existing| existing.strong_count() > 0)
        {
            return false;
        }
        entries.insert(key, Arc::downgrade(value));
        true
    }

    /// Live value for `key`.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let mut entries = self.lock();
        let value = entries.get(key)?.upgrade();
        if value.is_none() {
            entries.remove(key);
        }
        value
    }

    /// Forget `key`, returning the value if it is still live.
    pub fn unregister(&self, key: &K) -> Option<Arc<V>> {
        self.lock().remove(key)?.upgrade()
    }

    /// Every value that is still alive.
    pub fn live(&self) -> Vec<Arc<V>> {
        let mut entries = self.lock();
        let mut live = Vec::with_capacity(entries.len());
        entries.retain(|_, value| match value.upgrade() {
            Some(value) => {
                live.push(value);
                true
            }
            None => false,
        });
        live
    }

    /// Drop entries whose value is gone; returns how many were dropped.
    pub fn prune(&self) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, value| value.strong_count() > 0);
        before - entries.len()
    }

    /// Number of entries, dead ones included until the next prune.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no entry is tracked, live or not.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Weak<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, V> Default for Registry<K, V>
where
    K: Eq + Hash + Copy,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for Registry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self
            .entries
            .lock()
            .map(|entries| entries.len())
            .unwrap_or_default();
        f.debug_struct("Registry").field("entries", &len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_does_not_keep_values_alive() {
        let registry = Registry::new();
        let a = Arc::new("a");
        let b = Arc::new("b");
        assert!(registry.register(1, &a));
        assert!(registry.register(2, &b));
        assert_eq!(registry.get(&1).as_deref(), Some(&"a"));

        drop(a);
        assert!(registry.get(&1).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.live().len(), 1);
    }

    #[test]
    fn live_keys_are_not_replaced() {
        let registry = Registry::new();
        let first = Arc::new(1);
        let second = Arc::new(2);
        assert!(registry.register(7, &first));
        assert!(!registry.register(7, &second));
        assert_eq!(registry.get(&7).as_deref(), Some(&1));

        drop(first);
        assert!(registry.register(7, &second));
        assert_eq!(registry.unregister(&7).as_deref(), Some(&2));
        assert!(registry.is_empty());
    }

    #[test]
    fn prune_counts_dead_entries() {
        let registry = Registry::new();
        let values: Vec<_> = (0..4).map(Arc::new).collect();
        for (key, value) in values.iter().enumerate() {
            registry.register(key, value);
        }
        let keep = values[3].clone();
        drop(values);
        assert_eq!(registry.prune(), 3);
        assert_eq!(registry.get(&3), Some(keep));
    }
}
