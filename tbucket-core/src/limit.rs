//! The [`Limit`] value object: an immutable token-bucket shape.

use serde::{Deserialize, Serialize};

use crate::validation;

/// One thousandth of a token, the internal unit of all bucket arithmetic.
///
/// Keeping everything in milli-tokens lets the bucket algebra stay integer
/// arithmetic end to end (spec §4.B: "Sub-millisecond timing is never
/// required" and "all arithmetic is integer").
pub const MILLI: i64 = 1000;

/// An immutable rate-limit shape: capacity, burst headroom, and refill rate.
///
/// Two `Limit`s with the same `name` but different shapes are never merged —
/// the caller always supplies (or the config resolver always resolves) one
/// authoritative shape per `(entity, resource, name)` tuple at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    /// Identifies this limit among the others consumed in one `acquire`
    /// (e.g. `"rpm"`, `"tpm"`).
    pub name: String,
    /// Steady-state capacity, in whole tokens.
    pub capacity: i64,
    /// Maximum tokens a bucket may hold, in whole tokens. Always `>= capacity`.
    pub burst: i64,
    /// Tokens added per `refill_period`, in whole tokens.
    pub refill_amount: i64,
    /// Refill cadence, in milliseconds.
    pub refill_period_ms: i64,
}

impl Limit {
    /// Builds a limit with an explicit shape, validating `burst >= capacity`
    /// and that every magnitude is positive.
    ///
    /// # Panics
    ///
    /// Panics if `name` is not a valid identifier (spec §6: non-empty, at
    /// most 128 characters, no control characters, no `/` — a `/` in
    /// particular would corrupt `PK`/`SK` parsing once this name is
    /// embedded in a bucket key), if `burst < capacity`, or if `capacity`,
    /// `refill_amount`, or `refill_period_ms` is not strictly positive.
    /// `Limit`s are normally constructed once at startup from trusted
    /// configuration, so a panic here surfaces a programming error
    /// immediately rather than letting a malformed shape silently corrupt
    /// bucket math — or key parsing — later.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: i64, burst: i64, refill_amount: i64, refill_period_ms: i64) -> Self {
        let name = name.into();
        if let Err(e) = validation::validate_identifier("limit_name", &name) {
            panic!("{e}");
        }
        assert!(capacity > 0, "capacity must be positive");
        assert!(refill_amount > 0, "refill_amount must be positive");
        assert!(refill_period_ms > 0, "refill_period_ms must be positive");
        assert!(burst >= capacity, "burst must be >= capacity");
        Self {
            name,
            capacity,
            burst,
            refill_amount,
            refill_period_ms,
        }
    }

    /// A limit that refills fully every second. `burst` defaults to `capacity`.
    #[must_use]
    pub fn per_second(name: impl Into<String>, capacity: i64) -> Self {
        Self::with_burst(name, capacity, capacity, 1_000)
    }

    /// A limit that refills fully every minute. `burst` defaults to `capacity`.
    #[must_use]
    pub fn per_minute(name: impl Into<String>, capacity: i64) -> Self {
        Self::with_burst(name, capacity, capacity, 60_000)
    }

    /// A limit that refills fully every hour. `burst` defaults to `capacity`.
    #[must_use]
    pub fn per_hour(name: impl Into<String>, capacity: i64) -> Self {
        Self::with_burst(name, capacity, capacity, 3_600_000)
    }

    /// A limit that refills fully every day. `burst` defaults to `capacity`.
    #[must_use]
    pub fn per_day(name: impl Into<String>, capacity: i64) -> Self {
        Self::with_burst(name, capacity, capacity, 86_400_000)
    }

    /// Like [`Limit::per_second`]/[`Limit::per_minute`]/etc but with an
    /// explicit burst capacity, for the "higher burst" tier pattern shown in
    /// the hierarchical-limits example (`tpm=100_000, burst=150_000`).
    #[must_use]
    pub fn with_burst(name: impl Into<String>, capacity: i64, burst: i64, refill_period_ms: i64) -> Self {
        Self::new(name, capacity, burst, capacity, refill_period_ms)
    }

    /// Converts `capacity` to milli-tokens.
    #[must_use]
    pub fn capacity_milli(&self) -> i64 {
        self.capacity * MILLI
    }

    /// Converts `burst` to milli-tokens.
    #[must_use]
    pub fn burst_milli(&self) -> i64 {
        self.burst * MILLI
    }

    /// Converts `refill_amount` to milli-tokens.
    #[must_use]
    pub fn refill_amount_milli(&self) -> i64 {
        self.refill_amount * MILLI
    }
}
