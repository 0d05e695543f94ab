use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::{info, warn};

use super::client::{AsyncRemoteClient, RemoteClient};
use crate::{CacheError, CacheKey, RemoteError};

pub const DEFAULT_KEY_PREFIX: &str = "cache";
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// What the remote backend does when the service fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnError {
    /// Log the failure and behave as a cache miss (or as an unlocked call for
    /// lock operations).
    #[default]
    Silent,
    /// Surface the failure as [`CacheError::StoreUnavailable`].
    Raise,
}

impl FromStr for OnError {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "silent" => Ok(OnError::Silent),
            "raise" => Ok(OnError::Raise),
            other => Err(CacheError::InvalidConfig(format!(
                "on_error must be \"silent\" or \"raise\", got {:?}",
                other
            ))),
        }
    }
}

/// Connection and behaviour settings of the remote backend.
///
/// # Examples
///
/// ```
/// use flightcache_core::remote::{MemoryRemote, OnError, RemoteConfig};
/// use std::time::Duration;
///
/// let config = RemoteConfig::new(MemoryRemote::new())
///     .with_key_prefix("billing")
///     .with_lock_timeout(Duration::from_secs(30))
///     .with_on_error(OnError::Raise);
///
/// assert_eq!(config.lock_wait(), Duration::from_secs(60));
/// ```
#[derive(Clone)]
pub struct RemoteConfig {
    sync_client: Option<Arc<dyn RemoteClient>>,
    async_client: Option<Arc<dyn AsyncRemoteClient>>,
    key_prefix: String,
    lock_timeout: Duration,
    lock_wait: Option<Duration>,
    operation_timeout: Duration,
    on_error: OnError,
}

impl RemoteConfig {
    /// Uses `client` for both blocking and async call styles.
    pub fn new<C>(client: C) -> Self
    where
        C: RemoteClient + AsyncRemoteClient + 'static,
    {
        let client = Arc::new(client);
        let sync_client: Arc<dyn RemoteClient> = client.clone();
        let async_client: Arc<dyn AsyncRemoteClient> = client;
        Self::empty()
            .with_sync_client(sync_client)
            .with_async_client(async_client)
    }

    /// A configuration without any client; add one with
    /// [`with_sync_client`](Self::with_sync_client) or
    /// [`with_async_client`](Self::with_async_client).
    pub fn empty() -> Self {
        Self {
            sync_client: None,
            async_client: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_wait: None,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            on_error: OnError::default(),
        }
    }

    pub fn with_sync_client(mut self, client: Arc<dyn RemoteClient>) -> Self {
        self.sync_client = Some(client);
        self
    }

    pub fn with_async_client(mut self, client: Arc<dyn AsyncRemoteClient>) -> Self {
        self.async_client = Some(client);
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// How long a lock survives if its holder stops heartbeating.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// How long a caller waits for another holder's lock before giving up.
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = Some(wait);
        self
    }

    /// Upper bound for a single async service call.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn sync_client(&self) -> Option<&Arc<dyn RemoteClient>> {
        self.sync_client.as_ref()
    }

    pub fn async_client(&self) -> Option<&Arc<dyn AsyncRemoteClient>> {
        self.async_client.as_ref()
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Configured wait budget, twice the lock timeout by default.
    pub fn lock_wait(&self) -> Duration {
        self.lock_wait.unwrap_or(self.lock_timeout * 2)
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    pub fn on_error(&self) -> OnError {
        self.on_error
    }

    /// Service key holding the value of `key`.
    pub fn remote_key(&self, key: &CacheKey) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    /// Service key holding the single-flight lock of `key`.
    ///
    /// Derived keys end in a hex digest, so a `:lock` suffix never names a
    /// value, whatever the function id.
    pub fn lock_key(&self, key: &CacheKey) -> String {
        format!("{}:{}:lock", self.key_prefix, key)
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.sync_client.is_none() && self.async_client.is_none() {
            return Err(CacheError::InvalidConfig(
                "remote configuration needs a sync or an async client".into(),
            ));
        }
        if self.lock_timeout.is_zero() {
            return Err(CacheError::InvalidConfig("lock_timeout must be > 0".into()));
        }
        if self.operation_timeout.is_zero() {
            return Err(CacheError::InvalidConfig(
                "operation_timeout must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn require_sync(&self) -> Result<Arc<dyn RemoteClient>, CacheError> {
        self.sync_client.clone().ok_or(CacheError::NotConfigured(
            "remote configuration has no blocking client",
        ))
    }

    pub(crate) fn require_async(&self) -> Result<Arc<dyn AsyncRemoteClient>, CacheError> {
        self.async_client.clone().ok_or(CacheError::NotConfigured(
            "remote configuration has no async client",
        ))
    }

    /// Applies the `on_error` policy to a failed service call: `fallback` in
    /// silent mode, `StoreUnavailable` in raise mode.
    pub(crate) fn absorb<T>(
        &self,
        operation: &'static str,
        key: &str,
        err: RemoteError,
        fallback: T,
    ) -> Result<T, CacheError> {
        match self.on_error {
            OnError::Raise => Err(CacheError::StoreUnavailable(err)),
            OnError::Silent => {
                warn!(operation, key, error = %err, "remote cache operation failed");
                Ok(fallback)
            }
        }
    }

    /// Bounds an async service call by the operation timeout.
    pub(crate) async fn timed<T, F>(&self, call: F) -> Result<T, RemoteError>
    where
        F: Future<Output = Result<T, RemoteError>>,
    {
        match tokio::time::timeout(self.operation_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(self.operation_timeout)),
        }
    }
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("sync_client", &self.sync_client.is_some())
            .field("async_client", &self.async_client.is_some())
            .field("key_prefix", &self.key_prefix)
            .field("lock_timeout", &self.lock_timeout)
            .field("lock_wait", &self.lock_wait())
            .field("operation_timeout", &self.operation_timeout)
            .field("on_error", &self.on_error)
            .finish()
    }
}

static REMOTE_CONFIG: Lazy<RwLock<Option<RemoteConfig>>> = Lazy::new(|| RwLock::new(None));

/// Installs the process-wide remote configuration.
///
/// Fails with [`CacheError::AlreadyConfigured`] when a configuration is
/// already installed; call [`reset_remote_config`] first to replace it.
pub fn configure_remote(config: RemoteConfig) -> Result<(), CacheError> {
    config.validate()?;
    let mut slot = REMOTE_CONFIG.write();
    if slot.is_some() {
        return Err(CacheError::AlreadyConfigured);
    }
    info!(
        key_prefix = %config.key_prefix,
        on_error = ?config.on_error,
        "remote cache configured"
    );
    *slot = Some(config);
    Ok(())
}

/// The installed process-wide remote configuration.
pub fn remote_config() -> Result<RemoteConfig, CacheError> {
    REMOTE_CONFIG.read().clone().ok_or(CacheError::NotConfigured(
        "remote cache is not configured; call configure_remote() first",
    ))
}

/// Removes the process-wide remote configuration. Engines built earlier keep
/// the configuration they were built with.
pub fn reset_remote_config() {
    REMOTE_CONFIG.write().take();
}
