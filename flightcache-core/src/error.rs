use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by the caching layer itself.
///
/// Errors produced by a wrapped computation never travel through this type;
/// they are carried unchanged by [`CallError::Compute`].
#[derive(Debug, Error)]
pub enum CacheError {
    /// An argument could not be turned into a canonical cache key.
    #[error("cannot encode cache key: {0}")]
    Encoding(String),

    /// The remote store failed or timed out and `on_error` is `raise`.
    #[error("remote store unavailable: {0}")]
    StoreUnavailable(#[source] RemoteError),

    /// The remote lock for a key could not be acquired within the wait budget.
    #[error("lock for `{key}` not acquired within {waited:?}")]
    LockTimeout { key: String, waited: Duration },

    /// A cached value could not be written to or read from its wire format.
    #[error("cannot (de)serialize cached value: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A backend was used before it was configured.
    #[error("{0}")]
    NotConfigured(&'static str),

    /// `configure_remote` was called twice without a reset in between.
    #[error("remote cache already configured; call reset_remote_config() first")]
    AlreadyConfigured,

    /// Options or configuration values are out of range.
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),
}

/// Errors returned by remote key-value clients.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("service unreachable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Outcome of a failed call through a cached function.
///
/// `Cache` carries failures of the caching layer (key encoding, strict-mode
/// store errors). `Compute` carries the wrapped computation's own error,
/// untouched.
#[derive(Debug)]
pub enum CallError<E> {
    Cache(CacheError),
    Compute(E),
}

impl<E> CallError<E> {
    /// Collapses both variants into the computation's error type.
    ///
    /// This is what the attribute macros use, so a function returning
    /// `Result<T, anyhow::Error>` (or any error implementing
    /// `From<CacheError>`) keeps its signature.
    pub fn flatten(self) -> E
    where
        E: From<CacheError>,
    {
        match self {
            CallError::Cache(err) => E::from(err),
            CallError::Compute(err) => err,
        }
    }

    /// Returns the computation error, if that is what failed.
    pub fn into_compute(self) -> Option<E> {
        match self {
            CallError::Compute(err) => Some(err),
            CallError::Cache(_) => None,
        }
    }

    pub fn is_compute(&self) -> bool {
        matches!(self, CallError::Compute(_))
    }
}

impl<E> From<CacheError> for CallError<E> {
    fn from(err: CacheError) -> Self {
        CallError::Cache(err)
    }
}

impl<E: fmt::Display> fmt::Display for CallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Cache(err) => write!(f, "{}", err),
            CallError::Compute(err) => write!(f, "{}", err),
        }
    }
}

impl<E> std::error::Error for CallError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CallError::Cache(err) => Some(err),
            CallError::Compute(err) => Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum AppError {
        Cache(String),
        Boom,
    }

    impl From<CacheError> for AppError {
        fn from(err: CacheError) -> Self {
            AppError::Cache(err.to_string())
        }
    }

    #[test]
    fn test_flatten_keeps_compute_error() {
        let err: CallError<AppError> = CallError::Compute(AppError::Boom);
        assert!(err.is_compute());
        assert_eq!(err.flatten(), AppError::Boom);
    }

    #[test]
    fn test_flatten_converts_cache_error() {
        let err: CallError<AppError> = CacheError::Encoding("bad".into()).into();
        assert!(!err.is_compute());
        assert_eq!(
            err.flatten(),
            AppError::Cache("cannot encode cache key: bad".to_string())
        );
    }

    #[test]
    fn test_store_unavailable_display() {
        let err = CacheError::StoreUnavailable(RemoteError::Unavailable("refused".into()));
        assert_eq!(
            err.to_string(),
            "remote store unavailable: service unreachable: refused"
        );
    }
}
