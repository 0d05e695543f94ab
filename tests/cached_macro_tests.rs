//! Integration tests for the `#[cached]` attribute

use flightcache::{cached, CacheError, CallOptions};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error("not found: {0}")]
    NotFound(u32),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

static SQUARE_CALLS: AtomicUsize = AtomicUsize::new(0);

#[cached(ttl = 60)]
fn square(x: u64) -> Result<u64, AppError> {
    SQUARE_CALLS.fetch_add(1, Ordering::SeqCst);
    Ok(x * x)
}

#[test]
fn test_repeated_call_is_served_from_cache() {
    let before = SQUARE_CALLS.load(Ordering::SeqCst);
    assert_eq!(square(1_001).unwrap(), 1_002_001);
    assert_eq!(square(1_001).unwrap(), 1_002_001);
    assert_eq!(SQUARE_CALLS.load(Ordering::SeqCst) - before, 1);
}

static FIND_CALLS: AtomicUsize = AtomicUsize::new(0);

#[cached(ttl = 60)]
fn find(id: u32) -> Result<String, AppError> {
    FIND_CALLS.fetch_add(1, Ordering::SeqCst);
    if id == 0 {
        return Err(AppError::NotFound(id));
    }
    Ok(format!("record {}", id))
}

#[test]
fn test_errors_are_not_cached() {
    let before = FIND_CALLS.load(Ordering::SeqCst);
    assert!(matches!(find(0), Err(AppError::NotFound(0))));
    assert!(matches!(find(0), Err(AppError::NotFound(0))));
    assert_eq!(FIND_CALLS.load(Ordering::SeqCst) - before, 2);

    assert_eq!(find(5).unwrap(), "record 5");
}

static VERSION: AtomicUsize = AtomicUsize::new(0);

#[cached(ttl = 60)]
fn versioned(name: String) -> Result<String, AppError> {
    let version = VERSION.fetch_add(1, Ordering::SeqCst);
    Ok(format!("{}@{}", name, version))
}

#[test]
fn test_skip_cache_recomputes_and_overwrites() {
    let first = versioned("cfg".to_string()).unwrap();
    let forced = versioned_with("cfg".to_string(), CallOptions::skip_cache()).unwrap();
    assert_ne!(first, forced);
    assert_eq!(versioned("cfg".to_string()).unwrap(), forced);
}

static GREET_CALLS: AtomicUsize = AtomicUsize::new(0);

#[cached(ttl = 60, ignore = ["request_id"])]
fn greet(name: String, request_id: u64) -> Result<String, AppError> {
    GREET_CALLS.fetch_add(1, Ordering::SeqCst);
    Ok(format!("hello {} ({})", name, request_id))
}

#[test]
fn test_ignored_parameter_does_not_change_key() {
    let before = GREET_CALLS.load(Ordering::SeqCst);
    let first = greet("ana".to_string(), 1).unwrap();
    let second = greet("ana".to_string(), 2).unwrap();
    assert_eq!(first, second);
    assert_eq!(GREET_CALLS.load(Ordering::SeqCst) - before, 1);
}

#[derive(Clone, Serialize)]
struct Query {
    table: String,
    limit: u32,
}

static QUERY_CALLS: AtomicUsize = AtomicUsize::new(0);

#[cached(ttl = 60)]
fn run_query(query: Query, page: u32) -> Result<Vec<u32>, anyhow::Error> {
    QUERY_CALLS.fetch_add(1, Ordering::SeqCst);
    Ok((0..query.limit).map(|i| i + page * query.limit).collect())
}

#[test]
fn test_struct_arguments_and_anyhow_errors() {
    let query = Query {
        table: "users".to_string(),
        limit: 3,
    };
    let before = QUERY_CALLS.load(Ordering::SeqCst);
    assert_eq!(run_query(query.clone(), 1).unwrap(), vec![3, 4, 5]);
    assert_eq!(run_query(query.clone(), 1).unwrap(), vec![3, 4, 5]);
    assert_eq!(run_query(query, 2).unwrap(), vec![6, 7, 8]);
    assert_eq!(QUERY_CALLS.load(Ordering::SeqCst) - before, 2);
}

static SHORT_CALLS: AtomicUsize = AtomicUsize::new(0);

#[cached(ttl_ms = 100)]
fn short_lived(x: u32) -> Result<usize, AppError> {
    Ok(SHORT_CALLS.fetch_add(1, Ordering::SeqCst) + x as usize)
}

#[test]
fn test_entry_expires_after_ttl() {
    let first = short_lived(0).unwrap();
    assert_eq!(short_lived(0).unwrap(), first);
    thread::sleep(Duration::from_millis(150));
    assert_ne!(short_lived(0).unwrap(), first);
}

static SLOW_CALLS: AtomicUsize = AtomicUsize::new(0);

#[cached(ttl = 60)]
fn slow_double(x: u64) -> Result<u64, AppError> {
    SLOW_CALLS.fetch_add(1, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(100));
    Ok(x * 2)
}

#[test]
fn test_concurrent_callers_compute_once() {
    let handles: Vec<_> = (0..10)
        .map(|_| thread::spawn(|| slow_double(21).unwrap()))
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), 42);
    }
    assert_eq!(SLOW_CALLS.load(Ordering::SeqCst), 1);
}

static CONFIG_LOADS: AtomicUsize = AtomicUsize::new(0);

#[cached(ttl = 60)]
fn load_config() -> Result<String, AppError> {
    CONFIG_LOADS.fetch_add(1, Ordering::SeqCst);
    Ok("config".to_string())
}

#[test]
fn test_zero_argument_function() {
    load_config().unwrap();
    load_config().unwrap();
    assert_eq!(CONFIG_LOADS.load(Ordering::SeqCst), 1);
}

static TICKS: AtomicUsize = AtomicUsize::new(0);

#[cached(ttl_ms = 100, never_die = true)]
fn ticker(name: String) -> Result<usize, AppError> {
    let _ = name;
    Ok(TICKS.fetch_add(1, Ordering::SeqCst))
}

#[test]
fn test_never_die_refreshes_in_background() {
    let first = ticker("t".to_string()).unwrap();
    thread::sleep(Duration::from_millis(250));
    let later = ticker("t".to_string()).unwrap();
    assert!(later > first, "background refresh should have run");
    assert!(TICKS.load(Ordering::SeqCst) >= 2);
}
