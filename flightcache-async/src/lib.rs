//! # Flightcache Async
//!
//! Async function-result caching with single-flight misses and background
//! never-die refresh, built on the same core as `flightcache`.
//!
//! ## Features
//!
//! - **Non-blocking**: waiting callers await the key's lock instead of blocking
//!   a runtime thread
//! - **Cancellation-safe**: dropping a call's future releases its lock
//! - **Never-die**: refreshes are spawned on the Tokio runtime of the first call
//! - **Local or remote** stores, as in the sync crate
//!
//! ## Quick Start
//!
//! ```rust
//! use flightcache_async::cached_async;
//!
//! #[cached_async(ttl = 60)]
//! async fn fetch(id: u64) -> Result<String, anyhow::Error> {
//!     Ok(format!("item {}", id))
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! assert_eq!(fetch(1).await.unwrap(), "item 1");
//! // Served from the cache
//! assert_eq!(fetch(1).await.unwrap(), "item 1");
//! # }
//! ```
//!
//! ## Without Macros
//!
//! ```rust
//! use flightcache_async::{AsyncCacheEngine, CacheOptions, CallOptions};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let engine = AsyncCacheEngine::local();
//! let upper = engine
//!     .wrap(
//!         "docs::upper",
//!         CacheOptions::new(Duration::from_secs(30)),
//!         |(s,): (String,)| async move { Ok::<_, std::io::Error>(s.to_uppercase()) },
//!     )
//!     .unwrap();
//!
//! assert_eq!(upper.call(("abc".to_string(),)).await.unwrap(), "ABC");
//! let fresh = upper
//!     .call_with(("abc".to_string(),), CallOptions::skip_cache())
//!     .await
//!     .unwrap();
//! assert_eq!(fresh, "ABC");
//! # }
//! ```

// Re-export the macro
pub use flightcache_async_macros::cached_async;

// Re-export the async engine and what it is configured with
pub use flightcache_core::{
    remote, Args, AsyncCacheEngine, AsyncCacheStore, AsyncCachedFn, AsyncFlightGuard,
    AsyncLease, AsyncSingleFlight, CacheEntry, CacheError, CacheKey, CacheOptions, CallError,
    CallOptions, KeyCodec, LocalFlights, LocalStore, NeverDieScheduler, RemoteError,
};

// Re-export stats functionality from flightcache-core
#[cfg(feature = "stats")]
pub use flightcache_core::{stats_registry, CacheStats};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cached_async;
    pub use crate::{AsyncCacheEngine, CacheOptions, CallOptions};
    #[cfg(feature = "stats")]
    pub use crate::{stats_registry, CacheStats};
}
