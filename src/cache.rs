use lru::LruCache;
use std::borrow::Borrow;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;

/// Use at least this many slots to avoid degenerate eviction
const MIN_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
}

/// In-memory key/value store with a fixed time-to-live.
///
/// Expired entries are removed lazily when they are read; nothing sweeps in
/// the background. The store is also bounded, evicting the least recently
/// used entry once `capacity` is reached.
pub struct TtlCache<K: Hash + Eq, V> {
    entries: LruCache<K, CacheEntry<V>>,
    ttl: Duration,
}

impl<K: Hash + Eq, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(MIN_CAPACITY)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(cap),
            ttl,
        }
    }

    pub fn get<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let entry = self.entries.get(key)?;
        if Self::is_valid(entry, self.ttl) {
            return Some(entry.value.clone());
        }

        // Expired - remove from memory
        self.entries.pop(key);
        None
    }

    pub fn insert(&mut self, key: K, value: V) {
        let entry = CacheEntry {
            value,
            stored_at: Instant::now(),
        };
        self.entries.put(key, entry);
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.pop(key).map(|entry| entry.value)
    }

    /// Whether a live entry exists, without refreshing its LRU position
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries
            .peek(key)
            .is_some_and(|entry| Self::is_valid(entry, self.ttl))
    }

    pub fn clear_expired(&mut self) -> usize
    where
        K: Clone,
    {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, entry)| !Self::is_valid(entry, self.ttl))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.entries.pop(key);
        }
        expired.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_valid(entry: &CacheEntry<V>, ttl: Duration) -> bool {
        entry.stored_at.elapsed() < ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIVE_HOURS: Duration = Duration::from_secs(5 * 60 * 60);

    #[tokio::test(start_paused = true)]
    async fn test_hit_before_ttl_miss_after() {
        let mut cache: TtlCache<String, u32> = TtlCache::new(FIVE_HOURS, 64);
        cache.insert("trackA".to_string(), 7);

        tokio::time::advance(Duration::from_secs(4 * 3600 + 59 * 60)).await;
        assert_eq!(cache.get("trackA"), Some(7));

        tokio::time::advance(Duration::from_secs(2 * 60)).await;
        assert_eq!(cache.get("trackA"), None);
        assert!(cache.is_empty(), "expired entry should be evicted on read");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_boundary_in_milliseconds() {
        let ttl = Duration::from_millis(1000);
        let mut cache: TtlCache<&'static str, &'static str> = TtlCache::new(ttl, 64);
        cache.insert("k", "v");

        tokio::time::advance(Duration::from_millis(999)).await;
        assert_eq!(cache.get("k"), Some("v"));

        tokio::time::advance(Duration::from_millis(2)).await;
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reinsert_refreshes_timestamp() {
        let ttl = Duration::from_secs(10);
        let mut cache: TtlCache<&'static str, u8> = TtlCache::new(ttl, 64);
        cache.insert("k", 1);

        tokio::time::advance(Duration::from_secs(8)).await;
        cache.insert("k", 2);

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get("k"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_expired_only_drops_stale_entries() {
        let ttl = Duration::from_secs(10);
        let mut cache: TtlCache<String, u8> = TtlCache::new(ttl, 64);
        cache.insert("old".to_string(), 1);
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.insert("new".to_string(), 2);
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(cache.clear_expired(), 1);
        assert!(!cache.contains("old"));
        assert!(cache.contains("new"));
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let mut cache: TtlCache<u32, u32> = TtlCache::new(Duration::from_secs(60), 16);
        for i in 0..16 {
            cache.insert(i, i);
        }
        // Touch 0 so 1 becomes the oldest
        assert_eq!(cache.get(&0), Some(0));
        cache.insert(100, 100);

        assert_eq!(cache.len(), 16);
        assert!(cache.contains(&0));
        assert!(!cache.contains(&1));
    }

    #[test]
    fn test_remove_returns_value() {
        let mut cache: TtlCache<String, u8> = TtlCache::new(Duration::from_secs(60), 16);
        cache.insert("k".to_string(), 3);
        assert_eq!(cache.remove("k"), Some(3));
        assert_eq!(cache.remove("k"), None);
    }
}
