//! Wall-clock abstraction used by the bucket algebra and the acquire engine.
//!
//! The remote store is the source of truth for `last_refill_ms`, but the
//! store's wire protocol (e.g. DynamoDB's API) has no "give me your clock"
//! primitive, so every `now_ms` stamped into a transaction is produced
//! locally. [`Clock`] exists so tests can replace that local clock with a
//! deterministic one instead of racing the real wall clock.

use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the current wall-clock time, in milliseconds since the Unix epoch.
///
/// Implementations must be monotonic-enough for bucket refill math: small
/// backward jumps are tolerated (refill just becomes a no-op), but a clock
/// that jumps backward by more than a refill period will under-refill.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// Default clock backed by [`SystemTime::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before Unix epoch")
            .as_millis() as i64
    }
}


/// Re-exported for downstream crates that want a deterministic clock in
/// their own tests without depending on `tbucket-core`'s private test module.
#[doc(hidden)]
pub mod testing {
    use super::Clock;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    /// Deterministic clock: time only advances when explicitly told to.
    #[derive(Clone)]
    pub struct FixedClock {
        millis: Arc<AtomicI64>,
    }

    impl FixedClock {
        /// Creates a clock fixed at `initial_ms`.
        #[must_use]
        pub fn new(initial_ms: i64) -> Self {
            Self {
                millis: Arc::new(AtomicI64::new(initial_ms)),
            }
        }

        /// Advances the clock by `delta_ms` (may be negative).
        pub fn advance(&self, delta_ms: i64) {
            self.millis.fetch_add(delta_ms, Ordering::Relaxed);
        }

        /// Sets the clock to an absolute value.
        pub fn set(&self, ms: i64) {
            self.millis.store(ms, Ordering::Relaxed);
        }
    }

    impl Clock for FixedClock {
        fn now_ms(&self) -> i64 {
            self.millis.load(Ordering::Relaxed)
        }
    }
}
