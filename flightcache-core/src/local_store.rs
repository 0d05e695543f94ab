use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::store::{AsyncCacheStore, CacheStore};
use crate::worker::StopSignal;
use crate::{CacheEntry, CacheError, CacheKey};

/// In-process cache store.
///
/// Entries live in a `HashMap` behind a single `parking_lot::RwLock`: lookups
/// share the read lock, inserts and removals take the write lock. Expiry is
/// checked lazily on `get`; an entry found past its expiry instant is removed
/// and reported as absent. There is no capacity-based eviction, so memory is
/// bounded by TTLs and key cardinality. [`LocalStore::spawn_sweeper`] reclaims
/// expired entries that are never read again.
///
/// # Examples
///
/// ```
/// use flightcache_core::{CacheKey, CacheStore, LocalStore};
/// use std::time::Duration;
///
/// let store = LocalStore::new();
/// let key = CacheKey::from_raw("demo::f:01");
///
/// store.set(&key, &"value".to_string(), Some(Duration::from_secs(60))).unwrap();
/// assert_eq!(store.get(&key).unwrap().unwrap().value, "value");
/// ```
pub struct LocalStore<V> {
    entries: RwLock<HashMap<CacheKey, CacheEntry<V>>>,
}

impl<V> Default for LocalStore<V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<V: Clone + Send + Sync> LocalStore<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Removes every expired entry and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        before - entries.len()
    }

    /// Starts a thread that purges expired entries every `interval`.
    ///
    /// The thread holds only a weak reference and exits once the store is
    /// dropped or the returned handle is stopped or dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle
    where
        V: 'static,
    {
        let store: Weak<Self> = Arc::downgrade(self);
        let stop = Arc::new(StopSignal::default());
        let signal = Arc::clone(&stop);

        let spawned = thread::Builder::new()
            .name("flightcache-sweeper".into())
            .spawn(move || {
                while !signal.wait(interval) {
                    let Some(store) = store.upgrade() else { break };
                    let removed = store.purge_expired();
                    if removed > 0 {
                        debug!(removed, "purged expired cache entries");
                    }
                }
            });

        if let Err(err) = &spawned {
            tracing::warn!(error = %err, "could not start cache sweeper thread");
        }

        SweeperHandle {
            stop,
            thread: spawned.ok(),
        }
    }
}

impl<V: Clone + Send + Sync> CacheStore<V> for LocalStore<V> {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry<V>>, CacheError> {
        // Read lock released before any removal
        {
            let entries = self.entries.read();
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired() => return Ok(Some(entry.clone())),
                Some(_) => {}
            }
        }

        let mut entries = self.entries.write();
        // Another writer may have replaced the entry in the meantime
        if let Some(entry) = entries.get(key) {
            if !entry.is_expired() {
                return Ok(Some(entry.clone()));
            }
            entries.remove(key);
        }
        Ok(None)
    }

    fn set(&self, key: &CacheKey, value: &V, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.entries
            .write()
            .insert(key.clone(), CacheEntry::new(value.clone(), ttl));
        Ok(())
    }

    fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn exists(&self, key: &CacheKey) -> Result<bool, CacheError> {
        Ok(self
            .entries
            .read()
            .get(key)
            .is_some_and(|entry| !entry.is_expired()))
    }
}

#[async_trait]
impl<V: Clone + Send + Sync> AsyncCacheStore<V> for LocalStore<V> {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry<V>>, CacheError> {
        CacheStore::get(self, key)
    }

    async fn set(
        &self,
        key: &CacheKey,
        value: &V,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        CacheStore::set(self, key, value, ttl)
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        CacheStore::delete(self, key)
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool, CacheError> {
        CacheStore::exists(self, key)
    }
}

/// Handle of a running sweeper thread; stops the thread when dropped.
pub struct SweeperHandle {
    stop: Arc<StopSignal>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::LocalStore;
    use crate::store::CacheStore;
    use crate::CacheKey;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn key(raw: &str) -> CacheKey {
        CacheKey::from_raw(raw)
    }

    #[test]
    fn test_set_and_get() {
        let store = LocalStore::new();
        store.set(&key("a"), &1, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(store.get(&key("a")).unwrap().unwrap().value, 1);
        assert!(store.get(&key("b")).unwrap().is_none());
    }

    #[test]
    fn test_set_overwrites() {
        let store = LocalStore::new();
        store.set(&key("a"), &1, None).unwrap();
        store.set(&key("a"), &2, None).unwrap();
        assert_eq!(store.get(&key("a")).unwrap().unwrap().value, 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_expired_entry_is_removed_on_get() {
        let store = LocalStore::new();
        store.set(&key("a"), &1, Some(Duration::from_millis(30))).unwrap();
        thread::sleep(Duration::from_millis(60));

        assert_eq!(store.len(), 1);
        assert!(store.get(&key("a")).unwrap().is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_exists_and_delete() {
        let store = LocalStore::new();
        store.set(&key("a"), &"x", None).unwrap();
        assert!(store.exists(&key("a")).unwrap());
        assert!(!store.is_expired(&key("a")).unwrap());

        store.delete(&key("a")).unwrap();
        assert!(!store.exists(&key("a")).unwrap());
        assert!(store.is_expired(&key("a")).unwrap());
    }

    #[test]
    fn test_purge_expired() {
        let store = LocalStore::new();
        store.set(&key("short"), &1, Some(Duration::from_millis(20))).unwrap();
        store.set(&key("long"), &2, Some(Duration::from_secs(60))).unwrap();
        store.set(&key("forever"), &3, None).unwrap();
        thread::sleep(Duration::from_millis(50));

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_sweeper_reclaims_unread_entries() {
        let store = Arc::new(LocalStore::new());
        store.set(&key("a"), &1, Some(Duration::from_millis(20))).unwrap();
        let sweeper = store.spawn_sweeper(Duration::from_millis(10));

        thread::sleep(Duration::from_millis(150));
        assert!(store.is_empty());
        sweeper.stop();
    }

    #[test]
    fn test_concurrent_writers() {
        let store = Arc::new(LocalStore::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..100 {
                        let k = key(&format!("{}-{}", t, i));
                        store.set(&k, &i, None).unwrap();
                        assert_eq!(store.get(&k).unwrap().unwrap().value, i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 800);
    }

    #[tokio::test]
    async fn test_async_store_delegates() {
        let store = LocalStore::new();
        crate::store::AsyncCacheStore::set(&store, &key("a"), &7, None).await.unwrap();
        let entry = crate::store::AsyncCacheStore::get(&store, &key("a")).await.unwrap();
        assert_eq!(entry.unwrap().value, 7);
        assert!(crate::store::AsyncCacheStore::exists(&store, &key("a")).await.unwrap());
    }
}
