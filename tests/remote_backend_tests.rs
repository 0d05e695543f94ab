//! Integration tests for `#[cached(backend = "remote")]`

use flightcache::remote::{configure_remote, reset_remote_config, MemoryRemote, RemoteConfig};
use flightcache::{cached, function_id, Args, CacheError, KeyCodec};
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, thiserror::Error)]
enum ReportError {
    #[error(transparent)]
    Cache(#[from] CacheError),
}

static REPORT_CALLS: AtomicUsize = AtomicUsize::new(0);

#[cached(ttl = 60, backend = "remote")]
fn report(day: String) -> Result<String, ReportError> {
    REPORT_CALLS.fetch_add(1, Ordering::SeqCst);
    Ok(format!("report for {}", day))
}

#[cached(ttl = 60, backend = "remote")]
fn unconfigured(x: u32) -> Result<u32, ReportError> {
    Ok(x)
}

#[test]
#[serial(remote_config)]
fn test_remote_backend_requires_configuration() {
    reset_remote_config();
    let err = unconfigured(1).unwrap_err();
    assert!(matches!(
        err,
        ReportError::Cache(CacheError::NotConfigured(_))
    ));
}

#[test]
#[serial(remote_config)]
fn test_remote_backend_stores_under_prefixed_key() {
    reset_remote_config();
    let remote = MemoryRemote::new();
    configure_remote(RemoteConfig::new(remote.clone()).with_key_prefix("reports")).unwrap();

    let day = "monday".to_string();
    assert_eq!(report(day.clone()).unwrap(), "report for monday");
    assert_eq!(report(day.clone()).unwrap(), "report for monday");
    assert_eq!(REPORT_CALLS.load(Ordering::SeqCst), 1);

    let key = KeyCodec::derive(
        &function_id(module_path!(), "report"),
        &Args::new().kwarg("day", &day).unwrap(),
    )
    .unwrap();
    assert_eq!(remote.keys(), vec![format!("reports:{}", key)]);

    reset_remote_config();
}
