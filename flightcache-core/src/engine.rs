use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::never_die::{NeverDieScheduler, RefreshOwner, RefreshResult, RefreshTask};
use crate::remote::{RemoteConfig, RemoteFlights, RemoteStore};
use crate::single_flight::{LocalFlights, SingleFlight};
use crate::store::CacheStore;
use crate::{Args, CacheError, CacheKey, CallError, KeyCodec, LocalStore};
#[cfg(feature = "stats")]
use crate::CacheStats;

/// Maps a function's arguments to the [`Args`] its key is derived from.
pub type KeyFn<A> = Arc<dyn Fn(&A) -> Result<Args, CacheError> + Send + Sync>;

/// Decoration-time settings of a cached function.
///
/// `A` is the argument type of the wrapped function, usually a tuple.
pub struct CacheOptions<A> {
    ttl: Duration,
    never_die: bool,
    ignore_fields: Vec<String>,
    key_fn: KeyFn<A>,
}

impl<A> CacheOptions<A> {
    /// Keys calls by the serialized arguments: tuples become positional
    /// arguments, structs and maps keyword arguments.
    pub fn new(ttl: Duration) -> Self
    where
        A: Serialize + 'static,
    {
        Self::with_key_fn(ttl, |args: &A| Args::from_value(args))
    }

    /// Keys calls by the [`Args`] `key_fn` builds.
    pub fn with_key_fn<F>(ttl: Duration, key_fn: F) -> Self
    where
        F: Fn(&A) -> Result<Args, CacheError> + Send + Sync + 'static,
    {
        Self {
            ttl,
            never_die: false,
            ignore_fields: Vec::new(),
            key_fn: Arc::new(key_fn),
        }
    }

    /// Keeps results warm in the background instead of letting them expire.
    pub fn never_die(mut self, never_die: bool) -> Self {
        self.never_die = never_die;
        self
    }

    /// Keyword arguments left out of the key.
    pub fn ignore_fields<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_fields = names.into_iter().map(Into::into).collect();
        self
    }

    /// Lifetime of a result, and for never-die functions the refresh period.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether results are refreshed in the background instead of expiring.
    pub fn is_never_die(&self) -> bool {
        self.never_die
    }

    /// Keyword arguments dropped before the key is derived.
    pub fn ignored_fields(&self) -> &[String] {
        &self.ignore_fields
    }

    /// Derives the key of one call.
    pub fn key(&self, function_id: &str, args: &A) -> Result<CacheKey, CacheError> {
        let args = (self.key_fn)(args)?.without(&self.ignore_fields);
        KeyCodec::derive(function_id, &args)
    }

    /// TTL handed to the store; never-die entries are kept without expiry.
    pub fn store_ttl(&self) -> Option<Duration> {
        if self.never_die {
            None
        } else {
            Some(self.ttl)
        }
    }

    /// Fails with [`CacheError::InvalidConfig`] for a zero TTL.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.ttl.is_zero() {
            return Err(CacheError::InvalidConfig("ttl must be > 0".into()));
        }
        Ok(())
    }
}

impl<A> Clone for CacheOptions<A> {
    fn clone(&self) -> Self {
        Self {
            ttl: self.ttl,
            never_die: self.never_die,
            ignore_fields: self.ignore_fields.clone(),
            key_fn: Arc::clone(&self.key_fn),
        }
    }
}

impl<A> fmt::Debug for CacheOptions<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("ttl", &self.ttl)
            .field("never_die", &self.never_die)
            .field("ignore_fields", &self.ignore_fields)
            .finish_non_exhaustive()
    }
}

/// Call-time settings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Recompute even when a live entry exists, then store the new result.
    pub skip_cache: bool,
}

impl CallOptions {
    /// Options for a call that bypasses the lookup and overwrites the entry.
    pub fn skip_cache() -> Self {
        Self { skip_cache: true }
    }
}

/// Wraps blocking computations with caching, single-flight and never-die
/// refresh over one store.
///
/// # Examples
///
/// ```
/// use flightcache_core::{CacheEngine, CacheOptions};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let runs = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&runs);
///
/// let engine = CacheEngine::local();
/// let square = engine
///     .wrap(
///         "demo::square",
///         CacheOptions::new(Duration::from_secs(60)),
///         move |(x,): &(u64,)| {
///             counter.fetch_add(1, Ordering::SeqCst);
///             Ok::<_, std::io::Error>(x * x)
///         },
///     )
///     .unwrap();
///
/// assert_eq!(square.call(&(12,)).unwrap(), 144);
/// assert_eq!(square.call(&(12,)).unwrap(), 144);
/// assert_eq!(runs.load(Ordering::SeqCst), 1);
/// ```
pub struct CacheEngine<V> {
    store: Arc<dyn CacheStore<V>>,
    flights: Arc<dyn SingleFlight>,
    scheduler: Arc<NeverDieScheduler>,
}

impl<V> Clone for CacheEngine<V> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            flights: Arc::clone(&self.flights),
            scheduler: Arc::clone(&self.scheduler),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> CacheEngine<V> {
    pub fn new(
        store: Arc<dyn CacheStore<V>>,
        flights: Arc<dyn SingleFlight>,
        scheduler: Arc<NeverDieScheduler>,
    ) -> Self {
        Self {
            store,
            flights,
            scheduler,
        }
    }

    /// In-process store and locks, with the process-wide scheduler.
    pub fn local() -> Self {
        Self::new(
            Arc::new(LocalStore::new()),
            Arc::new(LocalFlights::new()),
            NeverDieScheduler::global(),
        )
    }

    /// Store and locks in the remote service, with the process-wide scheduler.
    pub fn remote(config: RemoteConfig) -> Result<Self, CacheError>
    where
        V: Serialize + DeserializeOwned,
    {
        config.require_sync()?;
        Ok(Self::new(
            Arc::new(RemoteStore::new(config.clone())?),
            Arc::new(RemoteFlights::new(config)?),
            NeverDieScheduler::global(),
        ))
    }

    /// Replaces the scheduler never-die functions wrapped by this engine
    /// register with.
    pub fn with_scheduler(mut self, scheduler: Arc<NeverDieScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// The store results are kept in.
    pub fn store(&self) -> &Arc<dyn CacheStore<V>> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<NeverDieScheduler> {
        &self.scheduler
    }

    /// Wraps `compute` under `function_id`.
    ///
    /// Fails with [`CacheError::InvalidConfig`] when the options are invalid.
    pub fn wrap<A, E, F>(
        &self,
        function_id: impl Into<String>,
        options: CacheOptions<A>,
        compute: F,
    ) -> Result<CachedFn<A, V, E>, CacheError>
    where
        A: Clone + Send + Sync + 'static,
        E: fmt::Display + 'static,
        F: Fn(&A) -> Result<V, E> + Send + Sync + 'static,
    {
        options.validate()?;
        let function_id = function_id.into();

        #[cfg(feature = "stats")]
        let stats = {
            let stats = Arc::new(CacheStats::new());
            crate::stats_registry::register(&function_id, Arc::clone(&stats));
            stats
        };

        Ok(CachedFn {
            inner: Arc::new(CachedInner {
                function_id,
                options,
                compute: Box::new(compute),
                store: Arc::clone(&self.store),
                flights: Arc::clone(&self.flights),
                scheduler: Arc::clone(&self.scheduler),
                owner: RefreshOwner::new(),
                #[cfg(feature = "stats")]
                stats,
            }),
        })
    }
}

/// A computation wrapped by [`CacheEngine::wrap`].
///
/// Cloning is cheap; clones share the same function.
pub struct CachedFn<A, V, E> {
    inner: Arc<CachedInner<A, V, E>>,
}

impl<A, V, E> Clone for CachedFn<A, V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct CachedInner<A, V, E> {
    function_id: String,
    options: CacheOptions<A>,
    compute: Box<dyn Fn(&A) -> Result<V, E> + Send + Sync>,
    store: Arc<dyn CacheStore<V>>,
    flights: Arc<dyn SingleFlight>,
    scheduler: Arc<NeverDieScheduler>,
    owner: RefreshOwner,
    #[cfg(feature = "stats")]
    stats: Arc<CacheStats>,
}

impl<A, V, E> CachedFn<A, V, E>
where
    A: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: fmt::Display + 'static,
{
    /// [`call_with`](Self::call_with) with default options.
    pub fn call(&self, args: &A) -> Result<V, CallError<E>> {
        self.call_with(args, CallOptions::default())
    }

    /// Serves `args` from the store or computes it, once per key at a time.
    ///
    /// The computation's own error comes back as [`CallError::Compute`] and is
    /// never stored.
    pub fn call_with(&self, args: &A, call: CallOptions) -> Result<V, CallError<E>> {
        let key = self.key_for(args)?;
        let value = self.inner.resolve(&key, args, call)?;
        if self.inner.options.never_die {
            self.ensure_registered(&key, args)?;
        }
        Ok(value)
    }

    /// The key `args` are stored under, after ignored fields are dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use flightcache_core::{CacheEngine, CacheOptions};
    /// use std::time::Duration;
    ///
    /// let engine = CacheEngine::local();
    /// let double = engine
    ///     .wrap(
    ///         "demo::double",
    ///         CacheOptions::new(Duration::from_secs(60)),
    ///         |(x,): &(u64,)| Ok::<_, std::io::Error>(x * 2),
    ///     )
    ///     .unwrap();
    ///
    /// let key = double.key_for(&(4,)).unwrap();
    /// assert_eq!(key.function_id(), "demo::double");
    /// assert_eq!(key, double.key_for(&(4,)).unwrap());
    /// assert_ne!(key, double.key_for(&(5,)).unwrap());
    /// ```
    pub fn key_for(&self, args: &A) -> Result<CacheKey, CacheError> {
        self.inner.options.key(&self.inner.function_id, args)
    }

    /// Whether a live entry exists for `args`.
    pub fn is_cached(&self, args: &A) -> Result<bool, CacheError> {
        self.inner.store.exists(&self.key_for(args)?)
    }

    /// Deletes the entry for `args`. A never-die registration stays in place
    /// and repopulates the entry on its next refresh.
    pub fn invalidate(&self, args: &A) -> Result<(), CacheError> {
        self.inner.store.delete(&self.key_for(args)?)
    }

    /// Identity the function was wrapped under; every key starts with it.
    pub fn function_id(&self) -> &str {
        &self.inner.function_id
    }

    pub fn options(&self) -> &CacheOptions<A> {
        &self.inner.options
    }

    /// Counters of this function, also reachable through
    /// [`stats_registry`](crate::stats_registry) by function id.
    #[cfg(feature = "stats")]
    pub fn stats(&self) -> &CacheStats {
        &self.inner.stats
    }

    fn ensure_registered(&self, key: &CacheKey, args: &A) -> Result<(), CacheError> {
        let ttl = self.inner.options.ttl;
        let scheduler = &self.inner.scheduler;
        if scheduler
            .registration(key)
            .is_some_and(|registration| registration.ttl() == ttl && !registration.is_orphaned())
        {
            return Ok(());
        }

        let inner: Weak<CachedInner<A, V, E>> = Arc::downgrade(&self.inner);
        let refresh_key = key.clone();
        let refresh_args = args.clone();
        let task = RefreshTask::Blocking(Arc::new(move || match inner.upgrade() {
            Some(inner) => inner.refresh(&refresh_key, &refresh_args),
            None => Err("cached function dropped".to_string()),
        }));
        scheduler.register_owned(key.clone(), ttl, &self.inner.owner, task)?;
        Ok(())
    }
}

impl<A, V, E> CachedInner<A, V, E>
where
    V: Clone,
    E: fmt::Display,
{
    fn resolve(&self, key: &CacheKey, args: &A, call: CallOptions) -> Result<V, CallError<E>> {
        if !call.skip_cache {
            if let Some(entry) = self.store.get(key)? {
                #[cfg(feature = "stats")]
                self.stats.record_hit();
                return Ok(entry.value);
            }
        }
        #[cfg(feature = "stats")]
        self.stats.record_miss();

        let _guard = self.flights.acquire(key)?;
        if !call.skip_cache {
            // Another caller may have filled the entry while we waited
            if let Some(entry) = self.store.get(key)? {
                return Ok(entry.value);
            }
        }

        #[cfg(feature = "stats")]
        self.stats.record_computation();
        let value = (self.compute)(args).map_err(CallError::Compute)?;
        self.store.set(key, &value, self.options.store_ttl())?;
        if self.options.never_die {
            self.scheduler.mark_refreshed(key);
        }
        Ok(value)
    }

    fn refresh(&self, key: &CacheKey, args: &A) -> RefreshResult {
        let _guard = self.flights.acquire(key).map_err(|err| err.to_string())?;
        match (self.compute)(args) {
            Ok(value) => {
                self.store
                    .set(key, &value, self.options.store_ttl())
                    .map_err(|err| err.to_string())?;
                #[cfg(feature = "stats")]
                self.stats.record_refresh();
                debug!(function = %self.function_id, "refreshed never-die entry");
                Ok(())
            }
            Err(err) => {
                #[cfg(feature = "stats")]
                self.stats.record_refresh_failure();
                Err(err.to_string())
            }
        }
    }
}
