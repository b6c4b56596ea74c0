//! Typed wrapper over the remote KV store: point reads, conditional puts,
//! batch gets, transactional multi-write, and paginated index queries.
//!
//! No component above the store module ever builds a raw key string or
//! talks to the backing store directly — everything funnels through
//! [`StoreGateway`], mirroring how the teacher's `MapDataStore` is the sole
//! seam between the in-process record store and its persistence backend.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tbucket_core::bucket::BucketSnapshot;
use tbucket_core::keyspace::ItemKey;
use tbucket_core::limit::Limit;
use thiserror::Error;

/// Errors a [`StoreGateway`] implementation may surface. Transient failures
/// (throttling, connection resets) are retried internally by the gateway
/// up to its own budget (see [`super::retry`]); once that budget is
/// exhausted, or a transaction loses its optimistic-concurrency race, one
/// of these variants reaches the acquire engine, which owns the next
/// layer of retry policy.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A conditional write's condition expression failed because a
    /// concurrent writer changed the item between read and write.
    #[error("transaction conflict")]
    Conflict,

    /// The store is unreachable or throttling beyond the retry budget.
    #[error("store transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

/// Arbitrary JSON payload for non-bucket, non-config items (entity
/// records, namespace name→id mappings). Buckets and configs get their own
/// typed attribute layout (spec's bit-exact persisted attribute list);
/// everything else is a small JSON document.
pub type ItemPayload = serde_json::Value;

/// A resolved limit set plus the optional `on_unavailable` policy, the
/// payload shape for `#CONFIG`-suffixed items at any of the three scopes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigPayload {
    pub limits: Vec<Limit>,
    pub on_unavailable: Option<OnUnavailable>,
}

/// Policy applied when no limits are resolvable for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnUnavailable {
    Allow,
    Deny,
}

impl Default for OnUnavailable {
    fn default() -> Self {
        Self::Deny
    }
}

/// Per-item condition attached to a [`WriteOp`] inside a [`StoreGateway::transact_write`] call.
#[derive(Debug, Clone, Copy)]
pub enum BucketCondition {
    /// No condition; the write always applies.
    None,
    /// `attribute_not_exists(PK) OR last_refill_ms = :seen_ms` — the
    /// optimistic-concurrency check that catches a concurrent writer.
    AbsentOrLastRefillMs(i64),
}

/// One operation inside a transactional multi-write. A transaction holding
/// up to 100 of these either commits as a whole or leaves every item
/// unchanged.
pub enum WriteOp {
    /// Create or overwrite a bucket, refreshing its TTL.
    PutBucket {
        key: ItemKey,
        snapshot: BucketSnapshot,
        ttl_epoch_s: i64,
        condition: BucketCondition,
    },
    /// Create or overwrite a config record.
    PutConfig {
        key: ItemKey,
        payload: ConfigPayload,
        expect_absent: bool,
    },
    /// Create or overwrite an arbitrary item (entity record, namespace mapping).
    PutItem {
        key: ItemKey,
        payload: ItemPayload,
        expect_absent: bool,
    },
    /// Remove an item unconditionally.
    Delete { key: ItemKey },
    /// Assert a condition without writing anything (used to pin a parent's
    /// `last_refill_ms` as part of the same transaction that mutates a child).
    ConditionCheck { key: ItemKey, condition: BucketCondition },
}

/// Which secondary index a [`StoreGateway::query`] call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Index {
    /// Parent→children: list an entity's direct children.
    ParentChildren,
    /// Resource→entities: aggregator fan-out over all items for a resource.
    ResourceEntities,
    /// Entity configs: list the resources an entity has explicit config for.
    EntityConfigs,
}

/// Sort-key filter for a query. Every schema's SK prefix is chosen so a
/// `BeginsWith` query returns precisely one category (spec §4.A).
#[derive(Debug, Clone)]
pub enum SkPredicate {
    BeginsWith(String),
    Exact(String),
}

impl SkPredicate {
    #[must_use]
    pub fn matches(&self, sk: &str) -> bool {
        match self {
            Self::BeginsWith(prefix) => sk.starts_with(prefix.as_str()),
            Self::Exact(exact) => sk == exact,
        }
    }
}

/// One row returned by [`StoreGateway::query`].
#[derive(Debug, Clone)]
pub struct QueryItem {
    pub key: ItemKey,
    pub payload: ItemPayload,
}

/// Typed wrapper over the remote KV store. Implementations: [`super::memory::InMemoryGateway`]
/// for tests and single-process use, [`super::dynamodb::DynamoDbGateway`] (feature `dynamodb`)
/// for production.
#[async_trait]
pub trait StoreGateway: Send + Sync {
    /// Point read of a bucket snapshot. `None` means absent (never acquired,
    /// or evicted by TTL).
    async fn get_bucket(&self, key: &ItemKey) -> Result<Option<BucketSnapshot>, StoreError>;

    /// Batch point read of up to 100 bucket snapshots in one round trip.
    /// Keys with no stored bucket are simply absent from the returned map.
    async fn batch_get_buckets(&self, keys: &[ItemKey]) -> Result<HashMap<ItemKey, BucketSnapshot>, StoreError>;

    /// Point read of an arbitrary item (entity record, namespace mapping).
    async fn get_item(&self, key: &ItemKey) -> Result<Option<ItemPayload>, StoreError>;

    /// Conditional create-if-absent or unconditional overwrite of an
    /// arbitrary item, outside of a transaction.
    async fn put_item(&self, key: &ItemKey, payload: ItemPayload, expect_absent: bool) -> Result<(), StoreError>;

    /// Point read of a config record at any of the three scopes.
    async fn get_config(&self, key: &ItemKey) -> Result<Option<ConfigPayload>, StoreError>;

    /// Conditional create-if-absent or unconditional overwrite of a config
    /// record, outside of a transaction.
    async fn put_config(&self, key: &ItemKey, payload: ConfigPayload, expect_absent: bool) -> Result<(), StoreError>;

    /// Commits up to 100 operations as a single transaction. Returns
    /// `Err(StoreError::Conflict)` if any item's condition failed due to a
    /// concurrent write, in which case none of the operations applied.
    async fn transact_write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError>;

    /// Paginated query against one of the three secondary indexes. The
    /// implementation is responsible for following continuation tokens
    /// internally up to `limit` (or exhaustion) before returning.
    async fn query(
        &self,
        index: Index,
        pk: &str,
        sk_predicate: SkPredicate,
        limit: Option<usize>,
    ) -> Result<Vec<QueryItem>, StoreError>;
}
