//! TTL computation shared by the acquire engine and lease reconciliation.

/// `now + k * refill_period`, in Unix epoch seconds, per spec §3: every
/// bucket write refreshes its TTL so abandoned buckets evict automatically.
#[must_use]
pub fn bucket_ttl_epoch_s(now_ms: i64, refill_period_ms: i64, multiplier: i64) -> i64 {
    now_ms / 1000 + multiplier * (refill_period_ms / 1000).max(1)
}
