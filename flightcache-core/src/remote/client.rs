use std::time::Duration;

use async_trait::async_trait;

use crate::RemoteError;

/// Minimal key-value operations the remote backend needs from a service.
///
/// Keys are fully prefixed by the caller. A `ttl` of `None` stores without
/// expiry. The compare-and-* operations must be atomic on the service side;
/// they are what keeps a lock from being released or extended by a holder
/// that lost it.
pub trait RemoteClient: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError>;

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), RemoteError>;

    /// Stores `value` only when `key` is absent; returns whether it was stored.
    fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, RemoteError>;

    fn delete(&self, key: &str) -> Result<(), RemoteError>;

    fn exists(&self, key: &str) -> Result<bool, RemoteError>;

    /// Deletes `key` only while it still holds `expected`.
    fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, RemoteError>;

    /// Resets the expiry of `key` to `ttl` only while it still holds `expected`.
    fn expire_if_equals(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> Result<bool, RemoteError>;
}

/// Async counterpart of [`RemoteClient`].
#[async_trait]
pub trait AsyncRemoteClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError>;

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>)
        -> Result<(), RemoteError>;

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, RemoteError>;

    async fn delete(&self, key: &str) -> Result<(), RemoteError>;

    async fn exists(&self, key: &str) -> Result<bool, RemoteError>;

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, RemoteError>;

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> Result<bool, RemoteError>;
}
