use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::config::{OnError, RemoteConfig};
use crate::store::{AsyncCacheStore, CacheStore};
use crate::{CacheEntry, CacheError, CacheKey};

#[derive(Serialize)]
struct EnvelopeRef<'a, V> {
    value: &'a V,
    created_at: DateTime<Utc>,
    ttl_ms: Option<u64>,
}

#[derive(Deserialize)]
struct Envelope<V> {
    value: V,
    created_at: DateTime<Utc>,
    ttl_ms: Option<u64>,
}

fn encode<V: Serialize>(value: &V, ttl: Option<Duration>) -> Result<Vec<u8>, CacheError> {
    let envelope = EnvelopeRef {
        value,
        created_at: Utc::now(),
        ttl_ms: ttl.map(|ttl| u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)),
    };
    Ok(serde_json::to_vec(&envelope)?)
}

fn decode<V: DeserializeOwned>(bytes: &[u8]) -> Result<CacheEntry<V>, serde_json::Error> {
    let envelope: Envelope<V> = serde_json::from_slice(bytes)?;
    let age = (Utc::now() - envelope.created_at)
        .to_std()
        .unwrap_or(Duration::ZERO);
    Ok(CacheEntry::with_age(
        envelope.value,
        age,
        envelope.ttl_ms.map(Duration::from_millis),
    ))
}

/// Cache store kept in a remote key-value service.
///
/// Each value is stored under `"<prefix>:<key>"` as a JSON envelope carrying
/// the value, its wall-clock creation time and its TTL; the service also
/// expires the key after the TTL. Entries that fail to decode are misses in
/// silent mode and [`CacheError::Serialization`] in raise mode. A value that
/// cannot be serialized always fails `set`.
pub struct RemoteStore<V> {
    config: RemoteConfig,
    _value: PhantomData<fn() -> V>,
}

impl<V> RemoteStore<V> {
    pub fn new(config: RemoteConfig) -> Result<Self, CacheError> {
        config.validate()?;
        Ok(Self {
            config,
            _value: PhantomData,
        })
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn decoded(&self, key: &str, bytes: &[u8]) -> Result<Option<CacheEntry<V>>, CacheError>
    where
        V: DeserializeOwned,
    {
        match decode(bytes) {
            Ok(entry) if entry.is_expired() => Ok(None),
            Ok(entry) => Ok(Some(entry)),
            Err(err) => match self.config.on_error() {
                OnError::Raise => Err(CacheError::Serialization(err)),
                OnError::Silent => {
                    warn!(key, error = %err, "discarding undecodable remote cache entry");
                    Ok(None)
                }
            },
        }
    }
}

impl<V> CacheStore<V> for RemoteStore<V>
where
    V: Serialize + DeserializeOwned + Send + Sync,
{
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry<V>>, CacheError> {
        let client = self.config.require_sync()?;
        let remote_key = self.config.remote_key(key);
        match client.get(&remote_key) {
            Ok(Some(bytes)) => self.decoded(&remote_key, &bytes),
            Ok(None) => Ok(None),
            Err(err) => self.config.absorb("get", &remote_key, err, None),
        }
    }

    fn set(&self, key: &CacheKey, value: &V, ttl: Option<Duration>) -> Result<(), CacheError> {
        let client = self.config.require_sync()?;
        let bytes = encode(value, ttl)?;
        let remote_key = self.config.remote_key(key);
        match client.set(&remote_key, &bytes, ttl) {
            Ok(()) => Ok(()),
            Err(err) => self.config.absorb("set", &remote_key, err, ()),
        }
    }

    fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        let client = self.config.require_sync()?;
        let remote_key = self.config.remote_key(key);
        match client.delete(&remote_key) {
            Ok(()) => Ok(()),
            Err(err) => self.config.absorb("delete", &remote_key, err, ()),
        }
    }

    fn exists(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let client = self.config.require_sync()?;
        let remote_key = self.config.remote_key(key);
        match client.exists(&remote_key) {
            Ok(found) => Ok(found),
            Err(err) => self.config.absorb("exists", &remote_key, err, false),
        }
    }
}

#[async_trait]
impl<V> AsyncCacheStore<V> for RemoteStore<V>
where
    V: Serialize + DeserializeOwned + Send + Sync,
{
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry<V>>, CacheError> {
        let client = self.config.require_async()?;
        let remote_key = self.config.remote_key(key);
        match self.config.timed(client.get(&remote_key)).await {
            Ok(Some(bytes)) => self.decoded(&remote_key, &bytes),
            Ok(None) => Ok(None),
            Err(err) => self.config.absorb("get", &remote_key, err, None),
        }
    }

    async fn set(
        &self,
        key: &CacheKey,
        value: &V,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let client = self.config.require_async()?;
        let bytes = encode(value, ttl)?;
        let remote_key = self.config.remote_key(key);
        match self.config.timed(client.set(&remote_key, &bytes, ttl)).await {
            Ok(()) => Ok(()),
            Err(err) => self.config.absorb("set", &remote_key, err, ()),
        }
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        let client = self.config.require_async()?;
        let remote_key = self.config.remote_key(key);
        match self.config.timed(client.delete(&remote_key)).await {
            Ok(()) => Ok(()),
            Err(err) => self.config.absorb("delete", &remote_key, err, ()),
        }
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let client = self.config.require_async()?;
        let remote_key = self.config.remote_key(key);
        match self.config.timed(client.exists(&remote_key)).await {
            Ok(found) => Ok(found),
            Err(err) => self.config.absorb("exists", &remote_key, err, false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RemoteStore;
    use crate::remote::{MemoryRemote, OnError, RemoteClient, RemoteConfig};
    use crate::store::CacheStore;
    use crate::{CacheError, CacheKey};
    use std::thread;
    use std::time::Duration;

    fn key(raw: &str) -> CacheKey {
        CacheKey::from_raw(raw)
    }

    fn store(remote: &MemoryRemote) -> RemoteStore<Vec<String>> {
        RemoteStore::new(RemoteConfig::new(remote.clone()).with_key_prefix("t")).unwrap()
    }

    #[test]
    fn test_round_trip_through_service() {
        let remote = MemoryRemote::new();
        let store = store(&remote);
        let value = vec!["a".to_string(), "b".to_string()];

        store.set(&key("m::f:01"), &value, Some(Duration::from_secs(30))).unwrap();
        assert_eq!(remote.keys(), vec!["t:m::f:01".to_string()]);

        let entry = store.get(&key("m::f:01")).unwrap().unwrap();
        assert_eq!(entry.value, value);
        assert_eq!(entry.ttl, Some(Duration::from_secs(30)));
        assert!(!entry.is_expired());
    }

    #[test]
    fn test_entries_visible_to_other_processes() {
        let remote = MemoryRemote::new();
        store(&remote)
            .set(&key("m::f:01"), &vec!["shared".to_string()], None)
            .unwrap();

        let other = store(&remote.clone());
        assert!(other.exists(&key("m::f:01")).unwrap());
        assert_eq!(remote.ttl("t:m::f:01"), Some(None));
    }

    #[test]
    fn test_service_expiry() {
        let remote = MemoryRemote::new();
        let store = store(&remote);
        store
            .set(&key("m::f:01"), &vec![], Some(Duration::from_millis(20)))
            .unwrap();
        thread::sleep(Duration::from_millis(40));
        assert!(store.get(&key("m::f:01")).unwrap().is_none());
    }

    #[test]
    fn test_outage_is_a_miss_in_silent_mode() {
        let remote = MemoryRemote::new();
        let store = store(&remote);
        remote.set_available(false);

        assert!(store.get(&key("m::f:01")).unwrap().is_none());
        store.set(&key("m::f:01"), &vec![], None).unwrap();
        assert!(!store.exists(&key("m::f:01")).unwrap());
    }

    #[test]
    fn test_outage_is_an_error_in_raise_mode() {
        let remote = MemoryRemote::new();
        let store: RemoteStore<u32> = RemoteStore::new(
            RemoteConfig::new(remote.clone()).with_on_error(OnError::Raise),
        )
        .unwrap();
        remote.set_available(false);

        assert!(matches!(
            store.get(&key("m::f:01")),
            Err(CacheError::StoreUnavailable(_))
        ));
        assert!(matches!(
            store.set(&key("m::f:01"), &1, None),
            Err(CacheError::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_async_write_outage_is_an_error_in_raise_mode() {
        use crate::store::AsyncCacheStore;

        let remote = MemoryRemote::new();
        let store: RemoteStore<u32> = RemoteStore::new(
            RemoteConfig::new(remote.clone()).with_on_error(OnError::Raise),
        )
        .unwrap();
        remote.set_writes_available(false);

        assert!(AsyncCacheStore::get(&store, &key("m::f:01")).await.unwrap().is_none());
        assert!(matches!(
            AsyncCacheStore::set(&store, &key("m::f:01"), &1, None).await,
            Err(CacheError::StoreUnavailable(_))
        ));
    }

    #[test]
    fn test_undecodable_entry() {
        let remote = MemoryRemote::new();
        remote.set("t:m::f:01", b"not json", None).unwrap();

        assert!(store(&remote).get(&key("m::f:01")).unwrap().is_none());

        let strict: RemoteStore<u32> = RemoteStore::new(
            RemoteConfig::new(remote.clone())
                .with_key_prefix("t")
                .with_on_error(OnError::Raise),
        )
        .unwrap();
        assert!(matches!(
            strict.get(&key("m::f:01")),
            Err(CacheError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_async_round_trip() {
        use crate::store::AsyncCacheStore;

        let remote = MemoryRemote::new();
        let store: RemoteStore<u32> = RemoteStore::new(RemoteConfig::new(remote)).unwrap();
        AsyncCacheStore::set(&store, &key("m::f:02"), &9, None).await.unwrap();
        let entry = AsyncCacheStore::get(&store, &key("m::f:02")).await.unwrap();
        assert_eq!(entry.unwrap().value, 9);
        assert!(AsyncCacheStore::exists(&store, &key("m::f:02")).await.unwrap());
        AsyncCacheStore::delete(&store, &key("m::f:02")).await.unwrap();
        assert!(AsyncCacheStore::is_expired(&store, &key("m::f:02")).await.unwrap());
    }
}
