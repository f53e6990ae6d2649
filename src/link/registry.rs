use std::hash::Hash;
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;

/// A copy-on-write map: readers get a consistent snapshot without holding a lock, writers
///  replace the whole map. Updates are expected to be rare compared to reads (links are
///  registered on open and removed on close).
pub struct LinkRegistry<K, V> {
    map: RwLock<Arc<FxHashMap<K, V>>>,
}

impl <K: Hash+Eq+Clone+Send+Sync, V: Clone+Send+Sync> Default for LinkRegistry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl <K: Hash+Eq+Clone+Send+Sync, V: Clone+Send+Sync> LinkRegistry<K, V> {
    pub fn new() -> LinkRegistry<K, V> {
        LinkRegistry {
            map: RwLock::new(Arc::new(FxHashMap::default())),
        }
    }

    pub fn snapshot(&self) -> Arc<FxHashMap<K, V>> {
        match self.map.read() {
            Ok(m) => m.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.snapshot().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Applies `f` to a copy of the map and publishes the copy
    pub fn update<R>(&self, f: impl FnOnce(&mut FxHashMap<K, V>) -> R) -> R {
        let mut guard = match self.map.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut map = (**guard).clone();
        let result = f(&mut map);
        *guard = Arc::new(map);
        result
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.update(|m| m.insert(key, value))
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.update(|m| m.remove(key))
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_insert_remove() {
        let registry = LinkRegistry::<u32, u32>::new();
        assert!(registry.is_empty());

        assert_eq!(registry.insert(1, 2), None);
        assert_eq!(registry.insert(1, 3), Some(2));
        assert_eq!(registry.get(&1), Some(3));
        assert_eq!(registry.remove(&1), Some(3));
        assert_eq!(registry.remove(&1), None);
    }

    #[test]
    fn test_snapshot_is_stable() {
        let registry = LinkRegistry::<u32, u32>::new();
        registry.insert(1, 1);
        let snapshot = registry.snapshot();
        registry.insert(2, 2);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inserts() {
        let registry = Arc::new(LinkRegistry::<u32, u32>::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..50 {
                    registry.insert(i * 100 + j, j);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(registry.len(), 16 * 50);
    }
}
