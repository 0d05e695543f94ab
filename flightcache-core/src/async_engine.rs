use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::engine::{CacheOptions, CallOptions};
use crate::never_die::{NeverDieScheduler, RefreshOwner, RefreshResult, RefreshTask};
use crate::remote::{RemoteConfig, RemoteFlights, RemoteStore};
use crate::single_flight::{AsyncSingleFlight, LocalFlights};
use crate::store::AsyncCacheStore;
use crate::{CacheError, CacheKey, CallError, LocalStore};
#[cfg(feature = "stats")]
use crate::CacheStats;

type AsyncCompute<A, V, E> = Box<dyn Fn(A) -> BoxFuture<'static, Result<V, E>> + Send + Sync>;

/// Async counterpart of [`CacheEngine`](crate::CacheEngine): wraps
/// computations returning futures, and waits for stores and locks without
/// blocking the runtime.
///
/// # Examples
///
/// ```
/// use flightcache_core::{AsyncCacheEngine, CacheOptions};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let engine = AsyncCacheEngine::local();
/// let greet = engine
///     .wrap(
///         "demo::greet",
///         CacheOptions::new(Duration::from_secs(60)),
///         |(name,): (String,)| async move { Ok::<_, std::io::Error>(format!("hello {}", name)) },
///     )
///     .unwrap();
///
/// assert_eq!(greet.call(("ana".to_string(),)).await.unwrap(), "hello ana");
/// # }
/// ```
pub struct AsyncCacheEngine<V> {
    store: Arc<dyn AsyncCacheStore<V>>,
    flights: Arc<dyn AsyncSingleFlight>,
    scheduler: Arc<NeverDieScheduler>,
}

impl<V> Clone for AsyncCacheEngine<V> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            flights: Arc::clone(&self.flights),
            scheduler: Arc::clone(&self.scheduler),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> AsyncCacheEngine<V> {
    pub fn new(
        store: Arc<dyn AsyncCacheStore<V>>,
        flights: Arc<dyn AsyncSingleFlight>,
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

    /// Requires the configuration to carry an async client.
    pub fn remote(config: RemoteConfig) -> Result<Self, CacheError>
    where
        V: Serialize + DeserializeOwned,
    {
        config.require_async()?;
        Ok(Self::new(
            Arc::new(RemoteStore::new(config.clone())?),
            Arc::new(RemoteFlights::new(config)?),
            NeverDieScheduler::global(),
        ))
    }

    /// Replaces the scheduler never-die functions register with.
    pub fn with_scheduler(mut self, scheduler: Arc<NeverDieScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn store(&self) -> &Arc<dyn AsyncCacheStore<V>> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<NeverDieScheduler> {
        &self.scheduler
    }

    /// Wraps the async `compute` under `function_id`.
    ///
    /// Fails with [`CacheError::InvalidConfig`] when the options are invalid.
    pub fn wrap<A, E, F, Fut>(
        &self,
        function_id: impl Into<String>,
        options: CacheOptions<A>,
        compute: F,
    ) -> Result<AsyncCachedFn<A, V, E>, CacheError>
    where
        A: Clone + Send + Sync + 'static,
        E: fmt::Display + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        options.validate()?;
        let function_id = function_id.into();

        #[cfg(feature = "stats")]
        let stats = {
            let stats = Arc::new(CacheStats::new());
            crate::stats_registry::register(&function_id, Arc::clone(&stats));
            stats
        };

        let compute: AsyncCompute<A, V, E> = Box::new(move |args| Box::pin(compute(args)));
        Ok(AsyncCachedFn {
            inner: Arc::new(AsyncCachedInner {
                function_id,
                options,
                compute,
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

/// An async computation wrapped by [`AsyncCacheEngine::wrap`].
pub struct AsyncCachedFn<A, V, E> {
    inner: Arc<AsyncCachedInner<A, V, E>>,
}

impl<A, V, E> Clone for AsyncCachedFn<A, V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct AsyncCachedInner<A, V, E> {
    function_id: String,
    options: CacheOptions<A>,
    compute: AsyncCompute<A, V, E>,
    store: Arc<dyn AsyncCacheStore<V>>,
    flights: Arc<dyn AsyncSingleFlight>,
    scheduler: Arc<NeverDieScheduler>,
    owner: RefreshOwner,
    #[cfg(feature = "stats")]
    stats: Arc<CacheStats>,
}

impl<A, V, E> AsyncCachedFn<A, V, E>
where
    A: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: fmt::Display + Send + 'static,
{
    /// [`call_with`](Self::call_with) with default options.
    pub async fn call(&self, args: A) -> Result<V, CallError<E>> {
        self.call_with(args, CallOptions::default()).await
    }

    /// Serves `args` from the store or awaits the computation, once per key at
    /// a time. Dropping the returned future releases the key's lock.
    pub async fn call_with(&self, args: A, call: CallOptions) -> Result<V, CallError<E>> {
        let key = self.key_for(&args)?;
        let registration_args = self.inner.options.is_never_die().then(|| args.clone());
        let value = self.inner.resolve(&key, args, call).await?;
        if let Some(args) = registration_args {
            self.ensure_registered(&key, args)?;
        }
        Ok(value)
    }

    /// The key `args` are stored under, after ignored fields are dropped.
    pub fn key_for(&self, args: &A) -> Result<CacheKey, CacheError> {
        self.inner.options.key(&self.inner.function_id, args)
    }

    /// Whether a live entry exists for `args`.
    pub async fn is_cached(&self, args: &A) -> Result<bool, CacheError> {
        let key = self.key_for(args)?;
        self.inner.store.exists(&key).await
    }

    /// Deletes the entry for `args`.
    pub async fn invalidate(&self, args: &A) -> Result<(), CacheError> {
        let key = self.key_for(args)?;
        self.inner.store.delete(&key).await
    }

    /// Identity the function was wrapped under.
    pub fn function_id(&self) -> &str {
        &self.inner.function_id
    }

    pub fn options(&self) -> &CacheOptions<A> {
        &self.inner.options
    }

    /// Counters of this function.
    #[cfg(feature = "stats")]
    pub fn stats(&self) -> &CacheStats {
        &self.inner.stats
    }

    fn ensure_registered(&self, key: &CacheKey, args: A) -> Result<(), CacheError> {
        let ttl = self.inner.options.ttl();
        let scheduler = &self.inner.scheduler;
        if scheduler
            .registration(key)
            .is_some_and(|registration| registration.ttl() == ttl && !registration.is_orphaned())
        {
            return Ok(());
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!(key = %key, "no tokio runtime to refresh never-die entry on");
            return Ok(());
        };

        let inner: Weak<AsyncCachedInner<A, V, E>> = Arc::downgrade(&self.inner);
        let refresh_key = key.clone();
        let task = Arc::new(move || -> BoxFuture<'static, RefreshResult> {
            let inner = inner.clone();
            let key = refresh_key.clone();
            let args = args.clone();
            Box::pin(async move {
                match inner.upgrade() {
                    Some(inner) => inner.refresh(&key, args).await,
                    None => Err("cached function dropped".to_string()),
                }
            })
        });
        scheduler.register_owned(
            key.clone(),
            ttl,
            &self.inner.owner,
            RefreshTask::Async { runtime, task },
        )?;
        Ok(())
    }
}

impl<A, V, E> AsyncCachedInner<A, V, E>
where
    A: Send + Sync,
    V: Clone + Send + Sync,
    E: fmt::Display + Send,
{
    async fn resolve(&self, key: &CacheKey, args: A, call: CallOptions) -> Result<V, CallError<E>> {
        if !call.skip_cache {
            if let Some(entry) = self.store.get(key).await? {
                #[cfg(feature = "stats")]
                self.stats.record_hit();
                return Ok(entry.value);
            }
        }
        #[cfg(feature = "stats")]
        self.stats.record_miss();

        let guard = self.flights.acquire(key).await?;
        let outcome = self.fill(key, args, call).await;
        guard.release().await;
        outcome
    }

    /// Runs under the key's lock.
    async fn fill(&self, key: &CacheKey, args: A, call: CallOptions) -> Result<V, CallError<E>> {
        if !call.skip_cache {
            if let Some(entry) = self.store.get(key).await? {
                return Ok(entry.value);
            }
        }

        #[cfg(feature = "stats")]
        self.stats.record_computation();
        let value = (self.compute)(args).await.map_err(CallError::Compute)?;
        self.store
            .set(key, &value, self.options.store_ttl())
            .await?;
        if self.options.is_never_die() {
            self.scheduler.mark_refreshed(key);
        }
        Ok(value)
    }

    async fn refresh(&self, key: &CacheKey, args: A) -> RefreshResult {
        let guard = self
            .flights
            .acquire(key)
            .await
            .map_err(|err| err.to_string())?;
        let outcome = match (self.compute)(args).await {
            Ok(value) => match self.store.set(key, &value, self.options.store_ttl()).await {
                Ok(()) => {
                    #[cfg(feature = "stats")]
                    self.stats.record_refresh();
                    debug!(function = %self.function_id, "refreshed never-die entry");
                    Ok(())
                }
                Err(err) => Err(err.to_string()),
            },
            Err(err) => {
                #[cfg(feature = "stats")]
                self.stats.record_refresh_failure();
                Err(err.to_string())
            }
        };
        guard.release().await;
        outcome
    }
}
