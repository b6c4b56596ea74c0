//! Pure token-bucket algebra: refill, try-consume, force-consume, available,
//! retry-after. Every function here is deterministic and side-effect free —
//! the store gateway is the only thing that ever persists the result of
//! applying one of these to a snapshot.

use crate::limit::MILLI;
use serde::{Deserialize, Serialize};

/// A bucket's persisted state at a point in time.
///
/// `tokens_milli` may be negative: a force-consume that overdraws the
/// bucket leaves a debt that subsequent refills pay down before the bucket
/// can hold positive tokens again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSnapshot {
    pub tokens_milli: i64,
    pub last_refill_ms: i64,
    pub capacity_milli: i64,
    pub burst_milli: i64,
    pub refill_amount_milli: i64,
    pub refill_period_ms: i64,
}

impl BucketSnapshot {
    /// A freshly synthesized bucket, full to capacity, as if it had just
    /// refilled at `now_ms`. Used when no snapshot exists yet (absent key).
    #[must_use]
    pub fn fresh(capacity_milli: i64, burst_milli: i64, refill_amount_milli: i64, refill_period_ms: i64, now_ms: i64) -> Self {
        Self {
            tokens_milli: capacity_milli,
            last_refill_ms: now_ms,
            capacity_milli,
            burst_milli,
            refill_amount_milli,
            refill_period_ms,
        }
    }

    /// Applies refill and returns the new snapshot. `last_refill_ms` always
    /// advances to `now_ms`, even when no tokens are added, so the clock
    /// stays monotone across calls that land in the same refill tick.
    #[must_use]
    pub fn refill(&self, now_ms: i64) -> Self {
        let elapsed = (now_ms - self.last_refill_ms).max(0);
        let grown = self.tokens_milli + refill_amount_for(elapsed, self.refill_amount_milli, self.refill_period_ms);
        Self {
            tokens_milli: grown.min(self.burst_milli),
            last_refill_ms: now_ms,
            ..*self
        }
    }
}

/// Amount of tokens (in whole, not milli) the store gateway should deduct or
/// credit. Passed to [`try_consume`]/[`force_consume`] as whole tokens, not
/// milli-tokens — callers think in tokens, buckets store milli-tokens.
pub type Tokens = i64;

/// Outcome of [`try_consume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOutcome {
    pub success: bool,
    /// Bucket state after refill (and, if `success`, after the deduction).
    pub snapshot: BucketSnapshot,
    /// Tokens available after refill, signed, in whole tokens.
    pub available: i64,
    /// Seconds to wait before the deficit would be paid down, `0.0` on success.
    pub retry_after_seconds: f64,
}

/// Refills, then deducts `amount` tokens iff the post-refill balance covers
/// it. On failure the snapshot returned is the post-refill (but
/// not-deducted) state — the caller never writes it back, since step 6 of
/// the acquire protocol never persists a failed attempt.
#[must_use]
pub fn try_consume(snapshot: &BucketSnapshot, amount: Tokens, now_ms: i64) -> ConsumeOutcome {
    let refilled = snapshot.refill(now_ms);
    let amount_milli = amount * MILLI;
    if refilled.tokens_milli >= amount_milli {
        let after = BucketSnapshot {
            tokens_milli: refilled.tokens_milli - amount_milli,
            ..refilled
        };
        ConsumeOutcome {
            success: true,
            available: refilled.tokens_milli / MILLI,
            retry_after_seconds: 0.0,
            snapshot: after,
        }
    } else {
        let deficit_milli = amount_milli - refilled.tokens_milli;
        ConsumeOutcome {
            success: false,
            available: refilled.tokens_milli / MILLI,
            retry_after_seconds: retry_after(deficit_milli, refilled.refill_amount_milli, refilled.refill_period_ms),
            snapshot: refilled,
        }
    }
}

/// Refills, then deducts `amount` tokens unconditionally — the balance may
/// go negative. `amount` may itself be negative to credit tokens back (used
/// by lease reconciliation when fewer tokens were actually spent than were
/// reserved). Returns the new snapshot and the resulting `tokens_milli`.
#[must_use]
pub fn force_consume(snapshot: &BucketSnapshot, amount: Tokens, now_ms: i64) -> (i64, BucketSnapshot) {
    let refilled = snapshot.refill(now_ms);
    let after = BucketSnapshot {
        tokens_milli: refilled.tokens_milli - amount * MILLI,
        ..refilled
    };
    (after.tokens_milli, after)
}

/// Refill-without-write projection: how many tokens (signed, whole) would
/// be available right now without mutating anything.
#[must_use]
pub fn available(snapshot: &BucketSnapshot, now_ms: i64) -> i64 {
    snapshot.refill(now_ms).tokens_milli / MILLI
}

/// Seconds until `deficit_milli` would be paid down by the refill rate.
/// `0.0` when there is no deficit.
#[must_use]
pub fn retry_after(deficit_milli: i64, refill_amount_milli: i64, refill_period_ms: i64) -> f64 {
    if deficit_milli <= 0 {
        return 0.0;
    }
    (deficit_milli as f64 / refill_amount_milli as f64) * (refill_period_ms as f64 / 1000.0)
}

/// `elapsed_ms · refill_amount_milli / refill_period_ms`, the milli-token
/// growth over `elapsed_ms`. Integer division truncates toward zero, same
/// as the reference implementation this is ported from.
fn refill_amount_for(elapsed_ms: i64, refill_amount_milli: i64, refill_period_ms: i64) -> i64 {
    (elapsed_ms as i128 * refill_amount_milli as i128 / refill_period_ms as i128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(tokens_milli: i64, last_refill_ms: i64) -> BucketSnapshot {
        BucketSnapshot {
            tokens_milli,
            last_refill_ms,
            capacity_milli: 100_000_000,
            burst_milli: 100_000_000,
            refill_amount_milli: 100_000_000,
            refill_period_ms: 60_000,
        }
    }

    #[test]
    fn no_time_elapsed_no_refill() {
        let s = snap(50_000_000, 1_000).refill(1_000);
        assert_eq!(s.tokens_milli, 50_000_000);
        assert_eq!(s.last_refill_ms, 1_000);
    }

    #[test]
    fn partial_refill() {
        let s = snap(0, 0).refill(30_000);
        assert_eq!(s.tokens_milli, 50_000_000);
    }

    #[test]
    fn full_refill_capped_at_burst() {
        let s = snap(0, 0).refill(120_000);
        assert_eq!(s.tokens_milli, 100_000_000);
    }

    #[test]
    fn negative_bucket_refills_towards_zero() {
        let s = snap(-50_000_000, 0).refill(30_000);
        assert_eq!(s.tokens_milli, 0);
    }

    #[test]
    fn consume_success() {
        let out = try_consume(&snap(100_000_000, 0), 50_000, 0);
        assert!(out.success);
        assert_eq!(out.snapshot.tokens_milli, 50_000_000);
        assert_eq!(out.available, 100_000);
        assert_eq!(out.retry_after_seconds, 0.0);
    }

    #[test]
    fn consume_exact_capacity() {
        let out = try_consume(&snap(100_000_000, 0), 100_000, 0);
        assert!(out.success);
        assert_eq!(out.snapshot.tokens_milli, 0);
    }

    #[test]
    fn consume_insufficient_capacity() {
        let out = try_consume(&snap(100_000_000, 0), 150_000, 0);
        assert!(!out.success);
        assert_eq!(out.available, 100_000);
        assert!(out.retry_after_seconds > 0.0);
    }

    #[test]
    fn consume_with_refill() {
        let out = try_consume(&snap(0, 0), 30_000, 30_000);
        assert!(out.success);
        assert_eq!(out.available, 50_000); // pre-deduction balance after refill
    }

    #[test]
    fn force_consume_within_capacity() {
        let (tokens, _) = force_consume(&snap(100_000_000, 0), 50_000, 0);
        assert_eq!(tokens, 50_000_000);
    }

    #[test]
    fn force_consume_beyond_capacity_goes_negative() {
        let (tokens, _) = force_consume(&snap(100_000_000, 0), 150_000, 0);
        assert_eq!(tokens, -50_000_000);
    }

    #[test]
    fn force_consume_negative_amount_returns_tokens() {
        let (tokens, _) = force_consume(&snap(100_000_000, 0), -50_000, 0);
        assert_eq!(tokens, 150_000_000); // capped on next refill, not here
    }

    #[test]
    fn available_after_refill() {
        assert_eq!(available(&snap(0, 0), 30_000), 50_000);
    }

    #[test]
    fn available_negative_bucket() {
        assert_eq!(available(&snap(-100_000_000, 0), 30_000), -50_000);
    }

    #[test]
    fn retry_after_no_deficit() {
        assert_eq!(retry_after(0, 100_000_000, 60_000), 0.0);
    }

    #[test]
    fn retry_after_small_deficit() {
        let secs = retry_after(10_000_000, 100_000_000, 60_000);
        assert!((5.9..6.1).contains(&secs));
    }

    #[test]
    fn retry_after_large_deficit() {
        let secs = retry_after(100_000_000, 100_000_000, 60_000);
        assert!((59.9..60.1).contains(&secs));
    }

    #[test]
    fn fresh_bucket_starts_full() {
        let s = BucketSnapshot::fresh(100_000_000, 150_000_000, 100_000_000, 60_000, 42);
        assert_eq!(s.tokens_milli, 100_000_000);
        assert_eq!(s.last_refill_ms, 42);
        assert_eq!(s.burst_milli, 150_000_000);
    }
}
