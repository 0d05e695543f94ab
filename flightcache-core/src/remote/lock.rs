use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::client::{AsyncRemoteClient, RemoteClient};
use super::config::{OnError, RemoteConfig};
use crate::single_flight::{
    AsyncFlightGuard, AsyncLease, AsyncSingleFlight, FlightGuard, LocalFlights, LockHandle,
    SingleFlight,
};
use crate::worker::StopSignal;
use crate::{CacheError, CacheKey};

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(200);

/// Cross-process single-flight coordinator built on the remote service.
///
/// The lock for a key is the service key `"<prefix>:<key>:lock"`, created with
/// set-if-absent and holding a random token. It expires after `lock_timeout`
/// unless its holder's heartbeat extends it, so a crashed holder never blocks
/// a key for longer than that. Callers in the same process first queue on a
/// local lock, so only one of them polls the service at a time.
///
/// When the lock cannot be taken within `lock_wait`, or the service fails,
/// the caller proceeds without the remote lock in silent mode and gets
/// [`CacheError::LockTimeout`] / [`CacheError::StoreUnavailable`] in raise
/// mode.
pub struct RemoteFlights {
    config: RemoteConfig,
    local: LocalFlights,
}

impl RemoteFlights {
    pub fn new(config: RemoteConfig) -> Result<Self, CacheError> {
        config.validate()?;
        Ok(Self {
            config,
            local: LocalFlights::new(),
        })
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.config.lock_timeout() / 2).max(Duration::from_millis(1))
    }

    /// Outcome of a wait that ran out of budget.
    fn timed_out(&self, key: &CacheKey, lock_key: &str) -> Result<(), CacheError> {
        let waited = self.config.lock_wait();
        match self.config.on_error() {
            OnError::Raise => Err(CacheError::LockTimeout {
                key: key.to_string(),
                waited,
            }),
            OnError::Silent => {
                warn!(
                    lock_key,
                    ?waited,
                    "remote lock not acquired in time, computing without it"
                );
                Ok(())
            }
        }
    }
}

impl SingleFlight for RemoteFlights {
    fn acquire(&self, key: &CacheKey) -> Result<FlightGuard, CacheError> {
        let client = self.config.require_sync()?;
        let local = SingleFlight::acquire(&self.local, key)?;

        let lock_key = self.config.lock_key(key);
        let lock_timeout = self.config.lock_timeout();
        let handle = LockHandle::new(key.clone(), Some(lock_timeout));
        let token = handle.holder_token.clone();
        let deadline = Instant::now() + self.config.lock_wait();
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match client.set_if_absent(&lock_key, token.as_bytes(), lock_timeout) {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => {
                    self.config.absorb("lock", &lock_key, err, ())?;
                    return Ok(local);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                self.timed_out(key, &lock_key)?;
                return Ok(local);
            }
            thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        debug!(lock_key = %lock_key, "remote lock acquired");
        let heartbeat = Heartbeat::spawn(
            Arc::clone(&client),
            lock_key.clone(),
            token.clone(),
            lock_timeout,
            self.heartbeat_interval(),
        );
        let lease = RemoteLease {
            client,
            lock_key,
            token,
            heartbeat: Some(heartbeat),
        };
        // Tuple fields drop in order: the remote lock goes before the local one.
        Ok(FlightGuard::new(handle, (lease, local)))
    }
}

struct RemoteLease {
    client: Arc<dyn RemoteClient>,
    lock_key: String,
    token: String,
    heartbeat: Option<Heartbeat>,
}

impl Drop for RemoteLease {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }
        match self
            .client
            .delete_if_equals(&self.lock_key, self.token.as_bytes())
        {
            Ok(true) => {}
            Ok(false) => warn!(lock_key = %self.lock_key, "remote lock was lost before release"),
            Err(err) => {
                warn!(lock_key = %self.lock_key, error = %err, "could not release remote lock")
            }
        }
    }
}

/// Thread extending a held lock until stopped.
struct Heartbeat {
    stop: Arc<StopSignal>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Heartbeat {
    fn spawn(
        client: Arc<dyn RemoteClient>,
        lock_key: String,
        token: String,
        lock_timeout: Duration,
        interval: Duration,
    ) -> Self {
        let stop = Arc::new(StopSignal::default());
        let signal = Arc::clone(&stop);
        let spawned = thread::Builder::new()
            .name("flightcache-lock-heartbeat".into())
            .spawn(move || {
                while !signal.wait(interval) {
                    match client.expire_if_equals(&lock_key, token.as_bytes(), lock_timeout) {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(lock_key = %lock_key, "remote lock lost, heartbeat stopped");
                            break;
                        }
                        Err(err) => {
                            warn!(lock_key = %lock_key, error = %err, "lock heartbeat failed")
                        }
                    }
                }
            });
        if let Err(err) = &spawned {
            warn!(error = %err, "could not start lock heartbeat thread");
        }
        Self {
            stop,
            thread: spawned.ok(),
        }
    }

    fn stop(mut self) {
        self.stop.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[async_trait]
impl AsyncSingleFlight for RemoteFlights {
    async fn acquire(&self, key: &CacheKey) -> Result<AsyncFlightGuard, CacheError> {
        let client = self.config.require_async()?;
        let local = AsyncSingleFlight::acquire(&self.local, key).await?;

        let lock_key = self.config.lock_key(key);
        let lock_timeout = self.config.lock_timeout();
        let handle = LockHandle::new(key.clone(), Some(lock_timeout));
        let token = handle.holder_token.clone();
        let deadline = Instant::now() + self.config.lock_wait();
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let attempt = self
                .config
                .timed(client.set_if_absent(&lock_key, token.as_bytes(), lock_timeout))
                .await;
            match attempt {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => {
                    if let Err(raised) = self.config.absorb("lock", &lock_key, err, ()) {
                        local.release().await;
                        return Err(raised);
                    }
                    return Ok(local);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                if let Err(raised) = self.timed_out(key, &lock_key) {
                    local.release().await;
                    return Err(raised);
                }
                return Ok(local);
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        debug!(lock_key = %lock_key, "remote lock acquired");
        let heartbeat = spawn_async_heartbeat(
            Arc::clone(&client),
            lock_key.clone(),
            token.clone(),
            lock_timeout,
            self.heartbeat_interval(),
        );
        let lease = AsyncRemoteLease {
            client,
            config: self.config.clone(),
            lock_key,
            token,
            heartbeat: Some(heartbeat),
            local: Some(local),
        };
        Ok(AsyncFlightGuard::new(handle, lease))
    }
}

fn spawn_async_heartbeat(
    client: Arc<dyn AsyncRemoteClient>,
    lock_key: String,
    token: String,
    lock_timeout: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match client
                .expire_if_equals(&lock_key, token.as_bytes(), lock_timeout)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    warn!(lock_key = %lock_key, "remote lock lost, heartbeat stopped");
                    break;
                }
                Err(err) => warn!(lock_key = %lock_key, error = %err, "lock heartbeat failed"),
            }
        }
    })
}

struct AsyncRemoteLease {
    client: Arc<dyn AsyncRemoteClient>,
    config: RemoteConfig,
    lock_key: String,
    token: String,
    heartbeat: Option<JoinHandle<()>>,
    local: Option<AsyncFlightGuard>,
}

#[async_trait]
impl AsyncLease for AsyncRemoteLease {
    async fn release(mut self: Box<Self>) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        let released = self
            .config
            .timed(
                self.client
                    .delete_if_equals(&self.lock_key, self.token.as_bytes()),
            )
            .await;
        match released {
            Ok(true) => {}
            Ok(false) => warn!(lock_key = %self.lock_key, "remote lock was lost before release"),
            Err(err) => {
                warn!(lock_key = %self.lock_key, error = %err, "could not release remote lock")
            }
        }
        // Marks the remote lock as handled for Drop
        self.token.clear();
        if let Some(local) = self.local.take() {
            local.release().await;
        }
    }
}

impl Drop for AsyncRemoteLease {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        if self.token.is_empty() {
            return;
        }
        // Cancelled before release: let the runtime delete the lock, or leave
        // it to expire after lock_timeout.
        match Handle::try_current() {
            Ok(runtime) => {
                let client = Arc::clone(&self.client);
                let lock_key = std::mem::take(&mut self.lock_key);
                let token = std::mem::take(&mut self.token);
                runtime.spawn(async move {
                    if let Err(err) = client.delete_if_equals(&lock_key, token.as_bytes()).await {
                        warn!(lock_key = %lock_key, error = %err, "could not release remote lock");
                    }
                });
            }
            Err(_) => {
                debug!(lock_key = %self.lock_key, "no runtime to release remote lock, leaving it to expire")
            }
        }
    }
}
