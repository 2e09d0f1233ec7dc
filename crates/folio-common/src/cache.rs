//! TTL cache used for read-through caches in the engine.
//!
//! Thin wrapper over `mini_moka::sync::Cache` so callers don't have to
//! repeat the builder dance or the trait bounds at every use site.

use std::hash::Hash;
use std::time::Duration;

pub type Cache<K, V> = mini_moka::sync::Cache<K, V>;

/// Create a new cache with the given capacity and TTL.
pub fn new_cache<K, V>(max_capacity: u64, ttl: Duration) -> Cache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    mini_moka::sync::Cache::builder()
        .max_capacity(max_capacity)
        .time_to_live(ttl)
        .build()
}

/// A named TTL cache. The name only shows up in logs.
#[derive(Clone)]
pub struct TtlCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    name: &'static str,
    inner: Cache<K, V>,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, max_capacity: u64, ttl: Duration) -> Self {
        Self {
            name,
            inner: new_cache(max_capacity, ttl),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key)
    }

    pub fn insert(&self, key: K, value: V) {
        self.inner.insert(key, value);
    }

    pub fn invalidate(&self, key: &K) {
        self.inner.invalidate(key);
    }

    /// Drop every entry. Returns nothing; the cache refills on the next read.
    pub fn invalidate_all(&self) {
        tracing::debug!(cache = self.name, "invalidating all entries");
        self.inner.invalidate_all();
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let cache = TtlCache::<String, u32>::new("test", 10, Duration::from_secs(60));
        cache.insert("a".into(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"b".to_string()), None);
    }

    #[test]
    fn test_invalidate_single_key() {
        let cache = TtlCache::<String, u32>::new("test", 10, Duration::from_secs(60));
        cache.insert("a".into(), 1);
        cache.insert("b".into(), 2);
        cache.invalidate(&"a".to_string());
        assert_eq!(cache.get(&"a".to_string()), None);
        assert_eq!(cache.get(&"b".to_string()), Some(2));
    }

    #[test]
    fn test_invalidate_all() {
        let cache = TtlCache::<String, u32>::new("test", 10, Duration::from_secs(60));
        cache.insert("a".into(), 1);
        cache.invalidate_all();
        assert_eq!(cache.get(&"a".to_string()), None);
    }
}
