use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::client::{AsyncRemoteClient, RemoteClient};
use crate::RemoteError;

struct Slot {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Default)]
struct Shared {
    slots: Mutex<HashMap<String, Slot>>,
    unavailable: AtomicBool,
    writes_unavailable: AtomicBool,
}

/// Key-value service held in process memory.
///
/// Clones share the same data, so several engines built on clones behave like
/// processes sharing one server. [`MemoryRemote::set_available`] simulates an
/// outage: while unavailable every operation fails with
/// [`RemoteError::Unavailable`]. [`MemoryRemote::set_writes_available`] fails
/// value writes only.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    shared: Arc<Shared>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.shared.unavailable.store(!available, Ordering::SeqCst);
    }

    /// While off, plain `set` calls fail. Reads and the lock operations
    /// (`set_if_absent` and the compare operations) keep working.
    pub fn set_writes_available(&self, available: bool) {
        self.shared
            .writes_unavailable
            .store(!available, Ordering::SeqCst);
    }

    /// Remaining time to live of `key`; `Some(None)` for keys without expiry.
    pub fn ttl(&self, key: &str) -> Option<Option<Duration>> {
        let now = Instant::now();
        let slots = self.shared.slots.lock();
        slots
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.expires_at.map(|at| at.saturating_duration_since(now)))
    }

    /// Live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .shared
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn clear(&self) {
        self.shared.slots.lock().clear();
    }

    fn check(&self) -> Result<(), RemoteError> {
        if self.shared.unavailable.load(Ordering::SeqCst) {
            Err(RemoteError::Unavailable("memory remote switched off".into()))
        } else {
            Ok(())
        }
    }

    fn live_value(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let mut slots = self.shared.slots.lock();
        match slots.get(key) {
            Some(slot) if slot.is_live(now) => Some(slot.value.clone()),
            Some(_) => {
                slots.remove(key);
                None
            }
            None => None,
        }
    }
}

fn deadline(ttl: Option<Duration>) -> Option<Instant> {
    ttl.and_then(|ttl| Instant::now().checked_add(ttl))
}

impl RemoteClient for MemoryRemote {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        self.check()?;
        Ok(self.live_value(key))
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), RemoteError> {
        self.check()?;
        if self.shared.writes_unavailable.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("memory remote rejects writes".into()));
        }
        self.shared.slots.lock().insert(
            key.to_string(),
            Slot {
                value: value.to_vec(),
                expires_at: deadline(ttl),
            },
        );
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, RemoteError> {
        self.check()?;
        let now = Instant::now();
        let mut slots = self.shared.slots.lock();
        if slots.get(key).is_some_and(|slot| slot.is_live(now)) {
            return Ok(false);
        }
        slots.insert(
            key.to_string(),
            Slot {
                value: value.to_vec(),
                expires_at: deadline(Some(ttl)),
            },
        );
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<(), RemoteError> {
        self.check()?;
        self.shared.slots.lock().remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool, RemoteError> {
        self.check()?;
        Ok(self.live_value(key).is_some())
    }

    fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, RemoteError> {
        self.check()?;
        let now = Instant::now();
        let mut slots = self.shared.slots.lock();
        match slots.get(key) {
            Some(slot) if slot.is_live(now) && slot.value == expected => {
                slots.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn expire_if_equals(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> Result<bool, RemoteError> {
        self.check()?;
        let now = Instant::now();
        let mut slots = self.shared.slots.lock();
        match slots.get_mut(key) {
            Some(slot) if slot.is_live(now) && slot.value == expected => {
                slot.expires_at = deadline(Some(ttl));
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl AsyncRemoteClient for MemoryRemote {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        RemoteClient::get(self, key)
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), RemoteError> {
        RemoteClient::set(self, key, value, ttl)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, RemoteError> {
        RemoteClient::set_if_absent(self, key, value, ttl)
    }

    async fn delete(&self, key: &str) -> Result<(), RemoteError> {
        RemoteClient::delete(self, key)
    }

    async fn exists(&self, key: &str) -> Result<bool, RemoteError> {
        RemoteClient::exists(self, key)
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, RemoteError> {
        RemoteClient::delete_if_equals(self, key, expected)
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> Result<bool, RemoteError> {
        RemoteClient::expire_if_equals(self, key, expected, ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryRemote;
    use crate::remote::RemoteClient;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_clones_share_data() {
        let a = MemoryRemote::new();
        let b = a.clone();
        a.set("k", b"v", None).unwrap();
        assert_eq!(b.get("k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(b.ttl("k"), Some(None));
    }

    #[test]
    fn test_expiry() {
        let remote = MemoryRemote::new();
        remote.set("k", b"v", Some(Duration::from_millis(20))).unwrap();
        assert!(remote.exists("k").unwrap());
        thread::sleep(Duration::from_millis(40));
        assert!(!remote.exists("k").unwrap());
        assert!(remote.get("k").unwrap().is_none());
    }

    #[test]
    fn test_set_if_absent() {
        let remote = MemoryRemote::new();
        assert!(remote.set_if_absent("lock", b"a", Duration::from_secs(1)).unwrap());
        assert!(!remote.set_if_absent("lock", b"b", Duration::from_secs(1)).unwrap());
        assert_eq!(remote.get("lock").unwrap(), Some(b"a".to_vec()));
    }

    #[test]
    fn test_compare_operations() {
        let remote = MemoryRemote::new();
        remote.set("lock", b"a", Some(Duration::from_millis(50))).unwrap();

        assert!(!remote.expire_if_equals("lock", b"b", Duration::from_secs(5)).unwrap());
        assert!(remote.expire_if_equals("lock", b"a", Duration::from_secs(5)).unwrap());
        assert!(remote.ttl("lock").unwrap().unwrap() > Duration::from_secs(4));

        assert!(!remote.delete_if_equals("lock", b"b").unwrap());
        assert!(remote.delete_if_equals("lock", b"a").unwrap());
        assert!(remote.keys().is_empty());
    }

    #[test]
    fn test_outage() {
        let remote = MemoryRemote::new();
        remote.set_available(false);
        assert!(remote.get("k").is_err());
        assert!(remote.set("k", b"v", None).is_err());
        remote.set_available(true);
        assert!(remote.set("k", b"v", None).is_ok());
    }

    #[test]
    fn test_write_outage_spares_reads_and_locks() {
        let remote = MemoryRemote::new();
        remote.set("k", b"v", None).unwrap();
        remote.set_writes_available(false);

        assert!(remote.set("k", b"w", None).is_err());
        assert_eq!(remote.get("k").unwrap(), Some(b"v".to_vec()));
        assert!(remote.set_if_absent("lock", b"a", Duration::from_secs(1)).unwrap());
        assert!(remote.delete_if_equals("lock", b"a").unwrap());

        remote.set_writes_available(true);
        assert!(remote.set("k", b"w", None).is_ok());
    }
}
