//! Per-key single-flight locking.
//!
//! A [`FlightGuard`] (or [`AsyncFlightGuard`]) proves that its holder is the
//! only computation in flight for a key within the coordinator's scope. The
//! lock is released when the guard is dropped, so every exit path, including
//! panics and cancelled futures, gives the key back.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

use crate::{CacheError, CacheKey};

/// Description of an acquired per-key lock.
#[derive(Clone, Debug)]
pub struct LockHandle {
    pub key: CacheKey,
    pub holder_token: String,
    pub acquired_at: Instant,
    /// How long the lock survives without its holder; `None` for process-local
    /// locks, which die with their holder.
    pub timeout: Option<Duration>,
}

impl LockHandle {
    pub fn new(key: CacheKey, timeout: Option<Duration>) -> Self {
        Self {
            key,
            holder_token: new_token(),
            acquired_at: Instant::now(),
            timeout,
        }
    }
}

/// Random holder token, unique enough to tell lock owners apart across
/// processes.
pub fn new_token() -> String {
    format!("{:032x}", fastrand::u128(..))
}

/// Scoped single-flight lock for synchronous callers.
///
/// An unlocked guard is handed out when a degraded remote lock falls back to
/// best-effort execution.
pub struct FlightGuard {
    handle: Option<LockHandle>,
    _lease: Option<Box<dyn Any>>,
}

impl FlightGuard {
    pub fn new<L: Any>(handle: LockHandle, lease: L) -> Self {
        Self {
            handle: Some(handle),
            _lease: Some(Box::new(lease)),
        }
    }

    pub fn unlocked() -> Self {
        Self {
            handle: None,
            _lease: None,
        }
    }

    pub fn handle(&self) -> Option<&LockHandle> {
        self.handle.as_ref()
    }

    pub fn is_locked(&self) -> bool {
        self.handle.is_some()
    }
}

/// Releases a lock from async code.
#[async_trait]
pub trait AsyncLease: Send {
    async fn release(self: Box<Self>);
}

/// Scoped single-flight lock for async callers.
///
/// Call [`AsyncFlightGuard::release`] on the normal path; dropping the guard
/// without it (for example when the caller's future is cancelled) still
/// releases the lock, on a best-effort basis for remote locks.
pub struct AsyncFlightGuard {
    handle: Option<LockHandle>,
    lease: Option<Box<dyn AsyncLease>>,
}

impl AsyncFlightGuard {
    pub fn new<L: AsyncLease + 'static>(handle: LockHandle, lease: L) -> Self {
        Self {
            handle: Some(handle),
            lease: Some(Box::new(lease)),
        }
    }

    pub fn unlocked() -> Self {
        Self {
            handle: None,
            lease: None,
        }
    }

    pub fn handle(&self) -> Option<&LockHandle> {
        self.handle.as_ref()
    }

    pub fn is_locked(&self) -> bool {
        self.handle.is_some()
    }

    pub async fn release(mut self) {
        if let Some(lease) = self.lease.take() {
            lease.release().await;
        }
    }
}

/// Coordinates synchronous computations so one runs per key at a time.
pub trait SingleFlight: Send + Sync {
    /// Blocks until the caller holds the lock for `key`.
    fn acquire(&self, key: &CacheKey) -> Result<FlightGuard, CacheError>;
}

/// Coordinates async computations so one runs per key at a time.
#[async_trait]
pub trait AsyncSingleFlight: Send + Sync {
    /// Suspends until the caller holds the lock for `key`.
    async fn acquire(&self, key: &CacheKey) -> Result<AsyncFlightGuard, CacheError>;
}

/// Runs `f` while holding the single-flight lock for `key`.
pub fn with_lock<F, R>(flights: &dyn SingleFlight, key: &CacheKey, f: F) -> Result<R, CacheError>
where
    F: FnOnce() -> R,
{
    let _guard = flights.acquire(key)?;
    Ok(f())
}

type SyncLocks = DashMap<CacheKey, Arc<Mutex<()>>>;
type AsyncLocks = DashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>;

/// Process-local single-flight coordinator.
///
/// Keeps one mutex per key, created on first use and dropped from the registry
/// by the last holder once nobody else references it. Blocking callers use
/// `parking_lot` mutexes, async callers `tokio` mutexes.
#[derive(Default)]
pub struct LocalFlights {
    sync_locks: Arc<SyncLocks>,
    async_locks: Arc<AsyncLocks>,
}

impl LocalFlights {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys that currently have a live lock.
    pub fn active_keys(&self) -> usize {
        self.sync_locks.len() + self.async_locks.len()
    }
}

impl SingleFlight for LocalFlights {
    fn acquire(&self, key: &CacheKey) -> Result<FlightGuard, CacheError> {
        let lock = Arc::clone(self.sync_locks.entry(key.clone()).or_default().value());
        let guard = lock.lock_arc();

        let permit = LocalPermit {
            guard: Some(guard),
            lock,
            key: key.clone(),
            registry: Arc::clone(&self.sync_locks),
        };
        Ok(FlightGuard::new(LockHandle::new(key.clone(), None), permit))
    }
}

#[async_trait]
impl AsyncSingleFlight for LocalFlights {
    async fn acquire(&self, key: &CacheKey) -> Result<AsyncFlightGuard, CacheError> {
        let lock = Arc::clone(self.async_locks.entry(key.clone()).or_default().value());
        let guard = Arc::clone(&lock).lock_owned().await;

        let permit = AsyncLocalPermit {
            guard: Some(guard),
            lock,
            key: key.clone(),
            registry: Arc::clone(&self.async_locks),
        };
        Ok(AsyncFlightGuard::new(
            LockHandle::new(key.clone(), None),
            permit,
        ))
    }
}

struct LocalPermit {
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
    lock: Arc<Mutex<()>>,
    key: CacheKey,
    registry: Arc<SyncLocks>,
}

impl Drop for LocalPermit {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the registry and this permit still reference the lock: no waiter
        // can be queued on it, and new callers clone under the same shard lock.
        self.registry.remove_if(&self.key, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2
        });
    }
}

struct AsyncLocalPermit {
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
    lock: Arc<tokio::sync::Mutex<()>>,
    key: CacheKey,
    registry: Arc<AsyncLocks>,
}

impl Drop for AsyncLocalPermit {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.registry.remove_if(&self.key, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2
        });
    }
}

#[async_trait]
impl AsyncLease for AsyncLocalPermit {
    async fn release(self: Box<Self>) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn key(raw: &str) -> CacheKey {
        CacheKey::from_raw(raw)
    }

    #[test]
    fn test_one_holder_per_key() {
        let flights = Arc::new(LocalFlights::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let flights = Arc::clone(&flights);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    let _guard = SingleFlight::acquire(&*flights, &key("same")).unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_distinct_keys_do_not_block() {
        let flights = LocalFlights::new();
        let a = SingleFlight::acquire(&flights, &key("a")).unwrap();
        let b = SingleFlight::acquire(&flights, &key("b")).unwrap();
        assert!(a.is_locked() && b.is_locked());
        assert_eq!(flights.active_keys(), 2);
    }

    #[test]
    fn test_lock_reclaimed_after_release() {
        let flights = LocalFlights::new();
        {
            let guard = SingleFlight::acquire(&flights, &key("a")).unwrap();
            assert_eq!(guard.handle().unwrap().key, key("a"));
            assert_eq!(flights.active_keys(), 1);
        }
        assert_eq!(flights.active_keys(), 0);
    }

    #[test]
    fn test_lock_released_on_panic() {
        let flights = Arc::new(LocalFlights::new());
        let worker = {
            let flights = Arc::clone(&flights);
            thread::spawn(move || {
                let _guard = SingleFlight::acquire(&*flights, &key("a")).unwrap();
                panic!("computation blew up");
            })
        };
        assert!(worker.join().is_err());

        let guard = SingleFlight::acquire(&*flights, &key("a")).unwrap();
        assert!(guard.is_locked());
    }

    #[test]
    fn test_with_lock_runs_closure() {
        let flights = LocalFlights::new();
        let value = with_lock(&flights, &key("a"), || 5).unwrap();
        assert_eq!(value, 5);
        assert_eq!(flights.active_keys(), 0);
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(new_token(), new_token());
        assert_eq!(new_token().len(), 32);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_async_one_holder_per_key() {
        let flights = Arc::new(LocalFlights::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let flights = Arc::clone(&flights);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                tokio::spawn(async move {
                    let guard = AsyncSingleFlight::acquire(&*flights, &key("same"))
                        .await
                        .unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    guard.release().await;
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(flights.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_async_guard_released_on_drop() {
        let flights = LocalFlights::new();
        let guard = AsyncSingleFlight::acquire(&flights, &key("a")).await.unwrap();
        drop(guard);

        let again = tokio::time::timeout(
            Duration::from_secs(1),
            AsyncSingleFlight::acquire(&flights, &key("a")),
        )
        .await;
        assert!(again.is_ok());
    }
}
