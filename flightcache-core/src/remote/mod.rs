//! Shared cache backed by an external key-value service.
//!
//! [`RemoteStore`] keeps entries in the service so every process sharing the
//! same key prefix sees the same values, and [`RemoteFlights`] turns the
//! service into a cross-process lock. Both talk to the service through the
//! [`RemoteClient`] / [`AsyncRemoteClient`] traits; [`MemoryRemote`] is an
//! in-process implementation for tests, and `RedisRemote` (feature `redis`)
//! talks to Redis.

mod client;
mod config;
mod lock;
mod memory;
#[cfg(feature = "redis")]
mod redis_remote;
mod store;

pub use client::{AsyncRemoteClient, RemoteClient};
pub use config::{
    configure_remote, remote_config, reset_remote_config, OnError, RemoteConfig,
    DEFAULT_KEY_PREFIX, DEFAULT_LOCK_TIMEOUT, DEFAULT_OPERATION_TIMEOUT,
};
pub use lock::RemoteFlights;
pub use memory::MemoryRemote;
#[cfg(feature = "redis")]
pub use redis_remote::{AsyncRedisRemote, RedisRemote};
pub use store::RemoteStore;
