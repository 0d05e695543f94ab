use std::time::{Duration, Instant};

/// A cached value together with the moment it was produced and its TTL.
///
/// Entries without a TTL never expire on their own; never-die functions store
/// their results this way and rely on the background refresh instead.
///
/// # Examples
///
/// ```
/// use flightcache_core::CacheEntry;
/// use std::time::Duration;
///
/// let entry = CacheEntry::new(42, Some(Duration::from_secs(60)));
/// assert_eq!(entry.value, 42);
/// assert!(!entry.is_expired());
///
/// let forever = CacheEntry::new("warm", None);
/// assert!(forever.expires_at().is_none());
/// ```
#[derive(Clone, Debug)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: Instant,
    pub ttl: Option<Duration>,
}

impl<V> CacheEntry<V> {
    /// Creates an entry stamped with `Instant::now()`.
    pub fn new(value: V, ttl: Option<Duration>) -> Self {
        Self {
            value,
            created_at: Instant::now(),
            ttl,
        }
    }

    /// Creates an entry that is already `age` old.
    ///
    /// Used when rebuilding entries read from a remote store, where the
    /// creation time travels as wall-clock time.
    pub fn with_age(value: V, age: Duration, ttl: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            value,
            created_at: now.checked_sub(age).unwrap_or(now),
            ttl,
        }
    }

    /// `created_at + ttl`, or `None` for entries that never expire.
    pub fn expires_at(&self) -> Option<Instant> {
        self.ttl.and_then(|ttl| self.created_at.checked_add(ttl))
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Returns true once the entry reached its expiry instant.
    pub fn is_expired(&self) -> bool {
        match self.expires_at() {
            Some(expires_at) => Instant::now() >= expires_at,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_new_entry_not_expired() {
        let entry = CacheEntry::new(42, Some(Duration::from_secs(10)));
        assert_eq!(entry.value, 42);
        assert!(!entry.is_expired());
    }

    #[test]
    fn test_entry_expiration() {
        let entry = CacheEntry::new("data", Some(Duration::from_millis(50)));
        thread::sleep(Duration::from_millis(80));
        assert!(entry.is_expired());
    }

    #[test]
    fn test_no_ttl_never_expires() {
        let entry = CacheEntry::new(100, None);
        thread::sleep(Duration::from_millis(20));
        assert!(!entry.is_expired());
        assert!(entry.expires_at().is_none());
    }

    #[test]
    fn test_with_age_backdates_entry() {
        let entry = CacheEntry::with_age(1, Duration::from_millis(300), Some(Duration::from_secs(1)));
        assert!(entry.age() >= Duration::from_millis(300));
        assert!(!entry.is_expired());

        let stale = CacheEntry::with_age(1, Duration::from_secs(2), Some(Duration::from_secs(1)));
        assert!(stale.is_expired());
    }
}
