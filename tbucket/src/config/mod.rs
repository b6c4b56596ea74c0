//! Process-wide knobs: acquire deadlines, retry budgets, cache TTLs, and
//! bucket TTL multiplier. Plain structs with hand-written `Default` impls,
//! the way the teacher's `service/config.rs` and `network/config.rs` do it
//! — no config-file loader, since this is a library embedded in someone
//! else's process, not a standalone service.

pub mod resolver;

use std::time::Duration;

pub use resolver::ConfigResolver;

/// Top-level engine configuration, constructed once per [`crate::Limiter`].
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Bounds the sum of retries and I/O for one `acquire` call (spec §5: default 5s).
    pub acquire_deadline: Duration,
    /// Acquire-engine conflict-retry budget (spec §4.E step 9: ≤3 attempts, ≤250ms).
    pub conflict_retry: ConflictRetryPolicy,
    /// Store-gateway transient-failure retry policy (throttling, resets).
    pub store_retry: crate::store::RetryPolicy,
    /// Config-resolver cache TTL (spec §4.D: ≤2s).
    pub config_cache_ttl: Duration,
    /// Entity-record cache TTL (spec §4.E step 1: ≤5s).
    pub entity_cache_ttl: Duration,
    /// Bucket TTL is refreshed to `now + bucket_ttl_multiplier * refill_period` on every
    /// write (spec §3: k ≥ 2, default ~10).
    pub bucket_ttl_multiplier: i64,
    /// Namespace name→id cache capacity (a tiny LRU per spec §4.G).
    pub namespace_cache_capacity: usize,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            acquire_deadline: Duration::from_secs(5),
            conflict_retry: ConflictRetryPolicy::default(),
            store_retry: crate::store::RetryPolicy::default(),
            config_cache_ttl: Duration::from_secs(2),
            entity_cache_ttl: Duration::from_secs(5),
            bucket_ttl_multiplier: 10,
            namespace_cache_capacity: 256,
        }
    }
}

/// The acquire engine's own retry budget for transaction conflicts,
/// distinct from the store gateway's transport-retry budget.
#[derive(Debug, Clone, Copy)]
pub struct ConflictRetryPolicy {
    pub max_attempts: u32,
    pub max_total: Duration,
}

impl Default for ConflictRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_total: Duration::from_millis(250),
        }
    }
}
