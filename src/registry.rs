//! Concurrent key/value registry backing the image and connection tables.
//!
//! Reads (`range`, `pairs`, `values`) vastly outnumber writes, so the map is
//! sharded with [`DashMap`]. Iteration always works on a point-in-time copy:
//! a visitor may freely call back into the registry without holding a shard
//! guard.

use dashmap::DashMap;
use std::collections::HashMap;
use std::hash::Hash;

pub struct Registry<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, V>,
}

impl<K, V> Default for Registry<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the value for `key`.
    pub fn store(&self, key: K, value: V) {
        self.entries.insert(key, value);
    }

    pub fn load<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Remove `key`, returning the value it held.
    pub fn delete<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.remove(key).map(|(_, value)| value)
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.contains_key(key)
    }

    /// Visit every entry until `visit` returns `false`.
    ///
    /// Order is unspecified. Entries stored or deleted concurrently may or
    /// may not be observed.
    pub fn range<F>(&self, mut visit: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        for (key, value) in self.snapshot() {
            if !visit(&key, &value) {
                break;
            }
        }
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn pairs(&self) -> HashMap<K, V> {
        self.snapshot().into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn snapshot(&self) -> Vec<(K, V)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_store_load_delete() {
        let registry: Registry<String, u32> = Registry::new();
        assert!(registry.is_empty());

        registry.store("a".to_string(), 1);
        registry.store("b".to_string(), 2);
        assert_eq!(registry.load("a"), Some(1));
        assert_eq!(registry.len(), 2);

        registry.store("a".to_string(), 10);
        assert_eq!(registry.load("a"), Some(10));

        assert_eq!(registry.delete("a"), Some(10));
        assert_eq!(registry.load("a"), None);
        assert_eq!(registry.delete("a"), None);
        assert!(!registry.contains("a"));
        assert!(registry.contains("b"));
    }

    #[test]
    fn test_range_stops_when_visitor_returns_false() {
        let registry: Registry<u32, u32> = Registry::new();
        for i in 0..10 {
            registry.store(i, i * 2);
        }

        let mut visited = 0;
        registry.range(|_, _| {
            visited += 1;
            visited < 3
        });
        assert_eq!(visited, 3);
    }

    #[test]
    fn test_range_allows_mutation_from_visitor() {
        let registry: Registry<u32, u32> = Registry::new();
        registry.store(1, 1);
        registry.store(2, 2);

        registry.range(|key, _| {
            registry.delete(key);
            true
        });
        assert!(registry.is_empty());
    }

    #[test]
    fn test_keys_values_pairs() {
        let registry: Registry<String, Arc<String>> = Registry::new();
        registry.store("x".to_string(), Arc::new("one".to_string()));
        registry.store("y".to_string(), Arc::new("two".to_string()));

        let mut keys = registry.keys();
        keys.sort();
        assert_eq!(keys, vec!["x".to_string(), "y".to_string()]);

        let mut values: Vec<String> = registry.values().iter().map(|v| v.to_string()).collect();
        values.sort();
        assert_eq!(values, vec!["one".to_string(), "two".to_string()]);

        let pairs = registry.pairs();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs["x"].as_str(), "one");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_store_and_range() {
        let registry: Arc<Registry<u32, u32>> = Arc::new(Registry::new());

        let mut handles = Vec::new();
        for t in 0..4u32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..250u32 {
                    let key = t * 1000 + i;
                    registry.store(key, key);
                    registry.range(|k, v| {
                        assert_eq!(k, v);
                        true
                    });
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.len(), 1000);
    }
}
