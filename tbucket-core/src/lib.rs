//! Pure keyspace schema, bucket algebra, and value types shared by the
//! async `tbucket` engine. Nothing in this crate performs I/O; every
//! function is deterministic given its inputs, which is what lets the
//! acquire engine reason about retries and the test suite run without a
//! store.

#![forbid(unsafe_code)]

pub mod bucket;
pub mod clock;
pub mod error;
pub mod id;
pub mod keyspace;
pub mod limit;
pub mod validation;

pub use bucket::{available, force_consume, retry_after, try_consume, BucketSnapshot, ConsumeOutcome, Tokens};
pub use clock::{Clock, SystemClock};
pub use error::{LimiterError, RateLimitExceeded, Side, ValidationError, Violation};
pub use id::generate_namespace_id;
pub use keyspace::ItemKey;
pub use limit::{Limit, MILLI};
