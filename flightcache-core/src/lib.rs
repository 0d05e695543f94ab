//! # Flightcache Core
//!
//! Core building blocks for the flightcache function-result cache.
//!
//! A wrapped function's result is stored under a key derived from its
//! identity and arguments. Concurrent misses for the same key are collapsed
//! so that only one caller computes, and "never-die" entries are refreshed
//! in the background before they go stale.
//!
//! ## Features
//!
//! - **Deterministic Keys**: SHA-256 of a canonical JSON encoding of the arguments
//! - **Local Store**: In-process map with lazy and periodic expiry
//! - **Remote Store**: Shared key/value server with configurable failure handling
//! - **Single-Flight**: Per-key locks, in process or across processes
//! - **Never-Die**: Background refresh at 90% of the TTL
//! - **Statistics**: Hit/miss/refresh counters per function (`stats` feature)
//!
//! ## Module Organization
//!
//! - [`keys`](CacheKey) - Argument normalisation and key derivation
//! - [`store`](CacheStore) - The store contract, sync and async
//! - [`remote`] - Remote client contract, configuration, store and locks
//! - [`single_flight`](SingleFlight) - Per-key lock coordination
//! - [`never_die`](NeverDieScheduler) - Background refresh scheduling
//! - [`engine`](CacheEngine) - Wrapping computations with the above
//!
mod async_engine;
mod cache_entry;
mod engine;
mod error;
mod keys;
mod local_store;
mod never_die;
mod single_flight;
mod store;
mod worker;

pub mod remote;

#[cfg(feature = "stats")]
mod stats;

#[cfg(feature = "stats")]
pub mod stats_registry;

pub use async_engine::{AsyncCacheEngine, AsyncCachedFn};
pub use cache_entry::CacheEntry;
pub use engine::{CacheEngine, CacheOptions, CachedFn, CallOptions, KeyFn};
pub use error::{CacheError, CallError, RemoteError};
pub use keys::{function_id, Args, CacheKey, KeyCodec};
pub use local_store::{LocalStore, SweeperHandle};
pub use never_die::{
    NeverDieRegistration, NeverDieScheduler, RefreshOwner, RefreshResult, RefreshState,
    RefreshTask, DEFAULT_TICK, MIN_TICK, REFRESH_RATIO,
};
pub use single_flight::{
    new_token, with_lock, AsyncFlightGuard, AsyncLease, AsyncSingleFlight, FlightGuard,
    LocalFlights, LockHandle, SingleFlight,
};
pub use store::{AsyncCacheStore, CacheStore};

#[cfg(feature = "stats")]
pub use stats::CacheStats;

/// Re-exports used by code generated from the `#[cached]` attributes.
#[doc(hidden)]
pub mod __private {
    pub use futures_util::future::BoxFuture;
    pub use once_cell::sync::OnceCell;
}
