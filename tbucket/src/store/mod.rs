//! The store module is the only part of the engine that talks to the
//! remote KV store.

pub mod gateway;
pub mod memory;
pub mod retry;

#[cfg(feature = "dynamodb")]
pub mod dynamodb;

pub use gateway::{
    BucketCondition, ConfigPayload, Index, ItemPayload, OnUnavailable, QueryItem, SkPredicate, StoreError, StoreGateway, WriteOp,
};
pub use memory::InMemoryGateway;
pub use retry::{full_jitter_delay, retry_with_backoff, RetryPolicy};

#[cfg(feature = "dynamodb")]
pub use dynamodb::DynamoDbGateway;

/// Maps a store-layer error onto the public error taxonomy. A `Conflict`
/// outside of `transact_write` (e.g. from a plain `put_item`/`put_config`
/// call) always indicates a bug: nothing outside the acquire engine's
/// bucket transaction is conditional on anything other than
/// "does not already exist".
pub(crate) fn store_error_to_limiter(err: StoreError) -> tbucket_core::error::LimiterError {
    use tbucket_core::error::LimiterError;
    match err {
        StoreError::Conflict => LimiterError::Transport(anyhow::anyhow!("unexpected conflict on non-transactional write")),
        StoreError::Transport(e) => LimiterError::Transport(e),
    }
}
