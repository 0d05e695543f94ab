use std::time::Duration;

use async_trait::async_trait;

use crate::{CacheEntry, CacheError, CacheKey};

/// Storage for cache entries, shared by every backend.
///
/// Each operation is atomic from the caller's point of view and `set`
/// overwrites unconditionally. A `ttl` of `None` stores an entry that never
/// expires on its own.
pub trait CacheStore<V>: Send + Sync {
    /// Returns the live entry for `key`, or `None` when absent or expired.
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry<V>>, CacheError>;

    fn set(&self, key: &CacheKey, value: &V, ttl: Option<Duration>) -> Result<(), CacheError>;

    fn delete(&self, key: &CacheKey) -> Result<(), CacheError>;

    fn exists(&self, key: &CacheKey) -> Result<bool, CacheError>;

    /// True when the entry is expired or missing.
    fn is_expired(&self, key: &CacheKey) -> Result<bool, CacheError> {
        Ok(!self.exists(key)?)
    }
}

/// Async counterpart of [`CacheStore`], used by suspending call styles.
#[async_trait]
pub trait AsyncCacheStore<V: Send + Sync>: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry<V>>, CacheError>;

    async fn set(&self, key: &CacheKey, value: &V, ttl: Option<Duration>)
        -> Result<(), CacheError>;

    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError>;

    async fn exists(&self, key: &CacheKey) -> Result<bool, CacheError>;

    async fn is_expired(&self, key: &CacheKey) -> Result<bool, CacheError> {
        Ok(!self.exists(key).await?)
    }
}
