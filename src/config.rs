//! Tunables for the indexing cache and its prefetch companion.
//!
//! Every knob enumerated in the external-interfaces configuration table has a
//! field here, with `Default` matching the documented default exactly.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Soft byte ceiling for the cache, triggering commit-time eviction.
pub const DEFAULT_MAX_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Soft byte ceiling across `cache` + `spillover` triggering eviction.
    pub indexing_cache_max_bytes: u64,

    /// Fraction of ops retained when eviction runs.
    pub indexing_cache_flush_ratio: f64,

    /// Batch size used to size the prefetch's bulk lookups; does not affect
    /// the cache itself.
    pub sync_events_query_size: usize,

    /// Pattern-recording samples 1-in-N handler invocations per event name.
    pub sampling_rate: u64,

    /// Expected-value cutoff above which a predicted DB row is prefetched.
    pub db_prediction_threshold: f64,

    /// Expected-value cutoff above which a predicted RPC call is dispatched
    /// upstream immediately (rather than merely looked up in the persistent
    /// store).
    pub rpc_prediction_threshold: f64,

    /// Constant-pattern LRU capacity, per event name.
    pub max_constant_pattern_count: usize,

    /// Base delay for the RPC retry backoff.
    pub retry_base_delay: Duration,

    /// Maximum retry attempts before an RPC error is surfaced to the caller.
    pub retry_max_attempts: u32,

    /// Response bodies that must never be persisted to the request-result
    /// store, even on an otherwise-successful call. Flagged in the design
    /// notes as empirically derived and likely to grow; kept configurable
    /// rather than hard-coded.
    pub uncacheable_responses: HashSet<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            indexing_cache_max_bytes: DEFAULT_MAX_BYTES,
            indexing_cache_flush_ratio: 0.25,
            sync_events_query_size: 1000,
            sampling_rate: 10,
            db_prediction_threshold: 0.2,
            rpc_prediction_threshold: 0.8,
            max_constant_pattern_count: 10,
            retry_base_delay: Duration::from_millis(125),
            retry_max_attempts: 9,
            uncacheable_responses: ["0x".to_string(), "null".to_string()].into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.indexing_cache_max_bytes, 512 * 1024 * 1024);
        assert_eq!(cfg.indexing_cache_flush_ratio, 0.25);
        assert_eq!(cfg.sampling_rate, 10);
        assert_eq!(cfg.db_prediction_threshold, 0.2);
        assert_eq!(cfg.rpc_prediction_threshold, 0.8);
        assert_eq!(cfg.max_constant_pattern_count, 10);
        assert_eq!(cfg.retry_base_delay, Duration::from_millis(125));
        assert_eq!(cfg.retry_max_attempts, 9);
        assert!(cfg.uncacheable_responses.contains("0x"));
        assert!(cfg.uncacheable_responses.contains("null"));
    }
}
