//! Background refresh of never-die entries.
//!
//! A never-die function registers each (function, arguments) pair it resolves.
//! The scheduler's worker thread wakes on a short tick and re-runs every
//! registration whose last successful refresh is older than 90% of its TTL,
//! so readers keep hitting a warm entry. A failed refresh leaves the stored
//! value alone and is retried on the next tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::worker::StopSignal;
use crate::{CacheError, CacheKey};

/// Fraction of the TTL after which an entry is refreshed.
pub const REFRESH_RATIO: f64 = 0.9;
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);
pub const MIN_TICK: Duration = Duration::from_millis(10);

/// Result of one refresh; the error is only logged.
pub type RefreshResult = Result<(), String>;

/// Work run when a registration is due.
#[derive(Clone)]
pub enum RefreshTask {
    /// Runs on a short-lived thread of its own.
    Blocking(Arc<dyn Fn() -> RefreshResult + Send + Sync>),
    /// Spawned on the runtime that registered it.
    Async {
        runtime: Handle,
        task: Arc<dyn Fn() -> BoxFuture<'static, RefreshResult> + Send + Sync>,
    },
}

/// Liveness handle of whatever registered an entry, usually a wrapped
/// function. Once every clone is dropped its registrations are orphaned:
/// the next tick removes them and a new registration replaces them.
#[derive(Clone, Debug, Default)]
pub struct RefreshOwner(Arc<()>);

impl RefreshOwner {
    pub fn new() -> Self {
        Self::default()
    }

    fn watch(&self) -> Weak<()> {
        Arc::downgrade(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshState {
    Warm,
    Refreshing,
}

/// One (function, arguments) pair kept warm by the scheduler.
pub struct NeverDieRegistration {
    key: CacheKey,
    ttl: Duration,
    task: RefreshTask,
    owner: Option<Weak<()>>,
    last_refresh: Mutex<Instant>,
    refreshing: AtomicBool,
    refreshes: AtomicU64,
    failures: AtomicU64,
}

impl NeverDieRegistration {
    fn new(key: CacheKey, ttl: Duration, owner: Option<Weak<()>>, task: RefreshTask) -> Self {
        Self {
            key,
            ttl,
            task,
            owner,
            last_refresh: Mutex::new(Instant::now()),
            refreshing: AtomicBool::new(false),
            refreshes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn function_id(&self) -> &str {
        self.key.function_id()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Age after which the entry is refreshed.
    pub fn refresh_threshold(&self) -> Duration {
        self.ttl.mul_f64(REFRESH_RATIO)
    }

    /// When the value was last produced, by a caller or by a refresh.
    pub fn last_refresh(&self) -> Instant {
        *self.last_refresh.lock()
    }

    /// True once the owner this entry was registered with is gone.
    /// Registrations made without an owner are never orphaned.
    pub fn is_orphaned(&self) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|owner| owner.strong_count() == 0)
    }

    pub fn is_owned_by(&self, owner: &RefreshOwner) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|watched| Weak::ptr_eq(watched, &owner.watch()))
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_refresh()) >= self.refresh_threshold()
    }

    pub fn state(&self) -> RefreshState {
        if self.refreshing.load(Ordering::Acquire) {
            RefreshState::Refreshing
        } else {
            RefreshState::Warm
        }
    }

    /// Successful background refreshes so far.
    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        *self.last_refresh.lock() = Instant::now();
    }

    fn finish(&self, result: RefreshResult) {
        match result {
            Ok(()) => {
                self.touch();
                self.refreshes.fetch_add(1, Ordering::Relaxed);
                debug!(key = %self.key, "never-die entry refreshed");
            }
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %self.key, error = %err, "never-die refresh failed, keeping previous value");
            }
        }
    }
}

/// Clears the refreshing flag however the refresh ends, panics included.
struct RefreshPermit(Arc<NeverDieRegistration>);

impl RefreshPermit {
    fn try_take(registration: &Arc<NeverDieRegistration>) -> Option<Self> {
        registration
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RefreshPermit(Arc::clone(registration)))
    }
}

impl Drop for RefreshPermit {
    fn drop(&mut self) {
        self.0.refreshing.store(false, Ordering::Release);
    }
}

struct SchedulerState {
    registrations: RwLock<HashMap<CacheKey, Arc<NeverDieRegistration>>>,
    tick: Duration,
    stop: StopSignal,
}

impl SchedulerState {
    /// The configured tick, shortened to a tenth of the smallest TTL.
    fn effective_tick(&self) -> Duration {
        let smallest = self
            .registrations
            .read()
            .values()
            .map(|registration| registration.ttl / 10)
            .min();
        smallest
            .map_or(self.tick, |ttl| ttl.min(self.tick))
            .max(MIN_TICK)
    }

    fn run_due(&self) -> usize {
        self.drop_orphans();
        let now = Instant::now();
        let due: Vec<Arc<NeverDieRegistration>> = self
            .registrations
            .read()
            .values()
            .filter(|registration| registration.is_due(now))
            .cloned()
            .collect();

        let mut dispatched = 0;
        for registration in due {
            let Some(permit) = RefreshPermit::try_take(&registration) else {
                continue;
            };
            dispatch(permit);
            dispatched += 1;
        }
        dispatched
    }

    fn drop_orphans(&self) {
        let orphaned = self
            .registrations
            .read()
            .values()
            .any(|registration| registration.is_orphaned());
        if !orphaned {
            return;
        }
        self.registrations.write().retain(|key, registration| {
            let keep = !registration.is_orphaned();
            if !keep {
                debug!(key = %key, "never-die owner dropped, registration removed");
            }
            keep
        });
    }
}

fn dispatch(permit: RefreshPermit) {
    match permit.0.task.clone() {
        RefreshTask::Blocking(task) => {
            let spawned = thread::Builder::new()
                .name("flightcache-refresh".into())
                .spawn(move || {
                    let result = task();
                    permit.0.finish(result);
                });
            if let Err(err) = spawned {
                warn!(error = %err, "could not start never-die refresh thread");
            }
        }
        RefreshTask::Async { runtime, task } => {
            runtime.spawn(async move {
                let result = task().await;
                permit.0.finish(result);
            });
        }
    }
}

static GLOBAL_SCHEDULER: Lazy<Arc<NeverDieScheduler>> =
    Lazy::new(|| Arc::new(NeverDieScheduler::new()));

/// Owner of all never-die registrations and of the worker that refreshes them.
///
/// The worker thread starts with the first registration and runs until
/// [`NeverDieScheduler::shutdown`] or drop. Registering a key again with
/// another TTL replaces it, as does registering over an entry whose
/// [`RefreshOwner`] is gone. Orphaned entries are removed on the next tick.
///
/// # Examples
///
/// ```
/// use flightcache_core::{CacheKey, NeverDieScheduler, RefreshTask};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let scheduler = NeverDieScheduler::new();
/// let key = CacheKey::from_raw("demo::warm:00");
/// scheduler
///     .register(key.clone(), Duration::from_secs(10), RefreshTask::Blocking(Arc::new(|| Ok(()))))
///     .unwrap();
///
/// let registration = scheduler.registration(&key).unwrap();
/// assert_eq!(registration.refresh_threshold(), Duration::from_secs(9));
/// scheduler.shutdown();
/// ```
pub struct NeverDieScheduler {
    state: Arc<SchedulerState>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Default for NeverDieScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl NeverDieScheduler {
    pub fn new() -> Self {
        Self::with_tick(DEFAULT_TICK)
    }

    pub fn with_tick(tick: Duration) -> Self {
        Self {
            state: Arc::new(SchedulerState {
                registrations: RwLock::new(HashMap::new()),
                tick: tick.max(MIN_TICK),
                stop: StopSignal::default(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// The process-wide scheduler shared by engines that do not bring their own.
    pub fn global() -> Arc<NeverDieScheduler> {
        Arc::clone(&GLOBAL_SCHEDULER)
    }

    /// Registers `key` for background refresh and returns true when the
    /// registration is new or replaced an existing one.
    ///
    /// An existing registration is kept when it has the same TTL and its
    /// owner is still alive. The refresh clock starts now.
    pub fn register(
        &self,
        key: CacheKey,
        ttl: Duration,
        task: RefreshTask,
    ) -> Result<bool, CacheError> {
        self.insert(key, ttl, None, task)
    }

    /// Like [`register`](Self::register), tying the registration to `owner`.
    pub fn register_owned(
        &self,
        key: CacheKey,
        ttl: Duration,
        owner: &RefreshOwner,
        task: RefreshTask,
    ) -> Result<bool, CacheError> {
        self.insert(key, ttl, Some(owner.watch()), task)
    }

    fn insert(
        &self,
        key: CacheKey,
        ttl: Duration,
        owner: Option<Weak<()>>,
        task: RefreshTask,
    ) -> Result<bool, CacheError> {
        if ttl.is_zero() {
            return Err(CacheError::InvalidConfig("never-die ttl must be > 0".into()));
        }
        {
            let mut registrations = self.state.registrations.write();
            if registrations
                .get(&key)
                .is_some_and(|existing| existing.ttl == ttl && !existing.is_orphaned())
            {
                return Ok(false);
            }
            debug!(key = %key, ?ttl, "never-die entry registered");
            registrations.insert(
                key.clone(),
                Arc::new(NeverDieRegistration::new(key, ttl, owner, task)),
            );
        }
        self.ensure_worker();
        Ok(true)
    }

    pub fn is_registered(&self, key: &CacheKey) -> bool {
        self.state.registrations.read().contains_key(key)
    }

    pub fn registration(&self, key: &CacheKey) -> Option<Arc<NeverDieRegistration>> {
        self.state.registrations.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.registrations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.registrations.read().is_empty()
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.state.registrations.read().keys().cloned().collect()
    }

    /// Restarts the refresh clock of `key` after its value was rewritten on
    /// the call path.
    pub fn mark_refreshed(&self, key: &CacheKey) {
        if let Some(registration) = self.registration(key) {
            registration.touch();
        }
    }

    /// Drops every registration.
    pub fn clear(&self) {
        self.state.registrations.write().clear();
    }

    /// Runs one tick: dispatches every due registration that is not already
    /// refreshing and returns how many were dispatched.
    pub fn run_due(&self) -> usize {
        self.state.run_due()
    }

    /// Tick the worker currently sleeps between passes.
    pub fn tick(&self) -> Duration {
        self.state.effective_tick()
    }

    /// Stops the worker thread. Registrations are kept but no longer refreshed.
    pub fn shutdown(&self) {
        self.state.stop.stop();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }

    fn ensure_worker(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() || self.state.stop.is_stopped() {
            return;
        }
        let state = Arc::clone(&self.state);
        let spawned = thread::Builder::new()
            .name("flightcache-never-die".into())
            .spawn(move || {
                debug!("never-die scheduler started");
                while !state.stop.wait(state.effective_tick()) {
                    state.run_due();
                }
                debug!("never-die scheduler stopped");
            });
        match spawned {
            Ok(handle) => *worker = Some(handle),
            Err(err) => warn!(error = %err, "could not start never-die scheduler"),
        }
    }
}

impl Drop for NeverDieScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
