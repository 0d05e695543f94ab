//! Process-wide lookup of cache statistics by function identifier.
//!
//! Every wrapped function registers its [`CacheStats`] here when created, so
//! counters can be inspected without holding the wrapper itself.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::CacheStats;

static STATS_REGISTRY: Lazy<RwLock<HashMap<String, Arc<CacheStats>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Registers `stats` under `function_id`, replacing any earlier registration.
pub fn register(function_id: &str, stats: Arc<CacheStats>) {
    STATS_REGISTRY.write().insert(function_id.to_string(), stats);
}

/// Returns a snapshot of the statistics for `function_id`.
///
/// ```
/// use flightcache_core::stats_registry;
///
/// if let Some(stats) = stats_registry::get("billing::load_invoice") {
///     println!("hit rate: {:.2}%", stats.hit_rate() * 100.0);
/// }
/// ```
pub fn get(function_id: &str) -> Option<CacheStats> {
    STATS_REGISTRY
        .read()
        .get(function_id)
        .map(|stats| (**stats).clone())
}

/// Returns the live counters for `function_id`.
pub fn get_shared(function_id: &str) -> Option<Arc<CacheStats>> {
    STATS_REGISTRY.read().get(function_id).cloned()
}

pub fn list() -> Vec<String> {
    STATS_REGISTRY.read().keys().cloned().collect()
}

/// Resets the counters of `function_id`; false when it is not registered.
pub fn reset(function_id: &str) -> bool {
    match STATS_REGISTRY.read().get(function_id) {
        Some(stats) => {
            stats.reset();
            true
        }
        None => false,
    }
}

/// Forgets every registration. Counters held elsewhere keep their values.
pub fn clear() {
    STATS_REGISTRY.write().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial(stats_registry)]
    fn test_register_and_get() {
        let stats = Arc::new(CacheStats::new());
        register("registry_test::a", Arc::clone(&stats));
        stats.record_hit();

        assert_eq!(get("registry_test::a").unwrap().hits(), 1);
        assert_eq!(get_shared("registry_test::a").unwrap().hits(), 1);
        assert!(get("registry_test::missing").is_none());
    }

    #[test]
    #[serial(stats_registry)]
    fn test_list_and_clear() {
        clear();
        register("registry_test::b", Arc::new(CacheStats::new()));
        register("registry_test::c", Arc::new(CacheStats::new()));

        let names = list();
        assert!(names.contains(&"registry_test::b".to_string()));
        assert!(names.contains(&"registry_test::c".to_string()));

        clear();
        assert!(list().is_empty());
    }

    #[test]
    #[serial(stats_registry)]
    fn test_reset() {
        let stats = Arc::new(CacheStats::new());
        register("registry_test::d", Arc::clone(&stats));
        stats.record_miss();

        assert!(reset("registry_test::d"));
        assert_eq!(stats.misses(), 0);
        assert!(!reset("registry_test::nonexistent"));
    }
}
