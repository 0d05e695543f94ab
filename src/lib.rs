//! # Flightcache
//!
//! Function-result caching for Rust: results live for a TTL in a local or
//! remote store, concurrent misses for the same arguments compute once, and
//! "never-die" results are refreshed in the background before they expire.
//!
//! ## Features
//!
//! - **Easy to use**: add `#[cached(ttl = ..)]` to a function returning `Result`
//! - **Single-flight**: one computation per key at a time, across threads or,
//!   with the remote backend, across processes
//! - **Never-die**: results refreshed at 90% of their TTL, and the last good
//!   value kept when a refresh fails
//! - **Local or remote**: in-process store, or any key/value service behind
//!   [`remote::RemoteClient`] (Redis with the `redis` feature)
//! - **Errors are never cached**
//!
//! ## Quick Start
//!
//! ```rust
//! use flightcache::cached;
//!
//! #[cached(ttl = 60)]
//! fn square(x: u64) -> Result<u64, anyhow::Error> {
//!     Ok(x * x)
//! }
//!
//! assert_eq!(square(12).unwrap(), 144);
//! // Served from the cache
//! assert_eq!(square(12).unwrap(), 144);
//! ```
//!
//! ## Per-Call Options
//!
//! Every cached function gets a `<name>_with` companion taking
//! [`CallOptions`]:
//!
//! ```rust
//! use flightcache::{cached, CallOptions};
//!
//! #[cached(ttl = 60, ignore = ["request_id"])]
//! fn lookup(name: String, request_id: u64) -> Result<usize, anyhow::Error> {
//!     Ok(name.len())
//! }
//!
//! lookup("ana".to_string(), 1).unwrap();
//! // Recomputes and overwrites the stored value
//! lookup_with("ana".to_string(), 2, CallOptions::skip_cache()).unwrap();
//! ```
//!
//! ## Without Macros
//!
//! ```rust
//! use flightcache::{CacheEngine, CacheOptions};
//! use std::time::Duration;
//!
//! let engine = CacheEngine::local();
//! let len = engine
//!     .wrap(
//!         "docs::len",
//!         CacheOptions::new(Duration::from_secs(5)).never_die(true),
//!         |(s,): &(String,)| Ok::<_, std::io::Error>(s.len()),
//!     )
//!     .unwrap();
//!
//! assert_eq!(len.call(&("four".to_string(),)).unwrap(), 4);
//! ```
//!
//! ## Remote Store
//!
//! Configure the process-wide remote backend once at startup, then use
//! `backend = "remote"`:
//!
//! ```rust,ignore
//! use flightcache::remote::{configure_remote, OnError, RemoteConfig};
//! use flightcache::remote::{AsyncRedisRemote, RedisRemote};
//!
//! let timeout = std::time::Duration::from_secs(2);
//! let config = RemoteConfig::empty()
//!     .with_sync_client(Arc::new(RedisRemote::open("redis://127.0.0.1/", timeout)?))
//!     .with_async_client(Arc::new(AsyncRedisRemote::connect("redis://127.0.0.1/", timeout).await?))
//!     .with_key_prefix("myapp")
//!     .with_on_error(OnError::Silent);
//! configure_remote(config)?;
//!
//! #[cached(ttl = 300, backend = "remote")]
//! fn report(day: String) -> Result<Report, anyhow::Error> {
//!     build_report(&day)
//! }
//! ```
//!
//! ## Statistics
//!
//! With the `stats` feature (default), each cached function records hits,
//! misses, computations and refreshes:
//!
//! ```rust
//! # #[cfg(feature = "stats")]
//! # {
//! use flightcache::{cached, stats_registry};
//!
//! #[cached(ttl = 60, name = "docs_double")]
//! fn double(x: i32) -> Result<i32, anyhow::Error> {
//!     Ok(x * 2)
//! }
//!
//! double(1).unwrap();
//! double(1).unwrap();
//!
//! let stats = stats_registry::get("docs_double").unwrap();
//! assert_eq!(stats.hits(), 1);
//! assert_eq!(stats.misses(), 1);
//! # }
//! ```
//!
//! ## Async
//!
//! See the `flightcache-async` crate for `#[cached_async]`.

pub use flightcache_core::*;
pub use flightcache_macros::cached;
