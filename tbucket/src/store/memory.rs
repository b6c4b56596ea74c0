//! In-process, `DashMap`-backed [`StoreGateway`]: used by tests and by
//! single-process deployments that don't need cross-process coordination.
//!
//! Every item carries its own `ttl_epoch_s`; reads that observe an expired
//! item treat it as absent and lazily remove it, the same "TTL is advisory,
//! checked on access" discipline a real store's background sweep
//! approximates. A single [`Mutex`] serializes `transact_write` calls so
//! the all-or-nothing guarantee is exact rather than approximated — a
//! stronger guarantee than production stores give, but one single-process
//! callers are entitled to rely on.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use tbucket_core::bucket::BucketSnapshot;
use tbucket_core::keyspace::ItemKey;

use super::gateway::{
    BucketCondition, ConfigPayload, Index, ItemPayload, QueryItem, SkPredicate, StoreError, StoreGateway, WriteOp,
};

#[derive(Clone)]
enum StoredValue {
    Bucket(BucketSnapshot),
    Config(ConfigPayload),
    Item(ItemPayload),
}

struct Entry {
    value: StoredValue,
    ttl_epoch_s: Option<i64>,
}

/// Gateway backed by an in-process `DashMap`. Never evicts by itself on a
/// timer; callers that want TTL enforcement to actually free memory should
/// pair this with a periodic `clear_expired` sweep of their own. TTL is
/// honored lazily, as if it were an access-time check against a store's
/// background sweep.
pub struct InMemoryGateway {
    entries: DashMap<ItemKey, Entry>,
    write_lock: Mutex<()>,
    now_epoch_s: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl InMemoryGateway {
    /// Creates an empty gateway using the real wall clock for TTL checks.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(|| {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("system clock is before Unix epoch")
                .as_secs() as i64
        })
    }

    /// Creates an empty gateway using a caller-supplied epoch-seconds clock,
    /// for deterministic TTL-expiry tests.
    pub fn with_clock(now_epoch_s: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        Self {
            entries: DashMap::new(),
            write_lock: Mutex::new(()),
            now_epoch_s: Box::new(now_epoch_s),
        }
    }

    fn is_live(&self, entry: &Entry) -> bool {
        match entry.ttl_epoch_s {
            Some(ttl) => ttl > (self.now_epoch_s)(),
            None => true,
        }
    }

    fn read_bucket(&self, key: &ItemKey) -> Option<BucketSnapshot> {
        let entry = self.entries.get(key)?;
        if !self.is_live(&entry) {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        match &entry.value {
            StoredValue::Bucket(snapshot) => Some(*snapshot),
            _ => None,
        }
    }

    fn check_condition(&self, key: &ItemKey, condition: &BucketCondition) -> Result<(), StoreError> {
        match condition {
            BucketCondition::None => Ok(()),
            BucketCondition::AbsentOrLastRefillMs(seen_ms) => match self.read_bucket(key) {
                None => Ok(()),
                Some(snapshot) if snapshot.last_refill_ms == *seen_ms => Ok(()),
                Some(_) => Err(StoreError::Conflict),
            },
        }
    }
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreGateway for InMemoryGateway {
    async fn get_bucket(&self, key: &ItemKey) -> Result<Option<BucketSnapshot>, StoreError> {
        Ok(self.read_bucket(key))
    }

    async fn batch_get_buckets(&self, keys: &[ItemKey]) -> Result<HashMap<ItemKey, BucketSnapshot>, StoreError> {
        Ok(keys
            .iter()
            .filter_map(|k| self.read_bucket(k).map(|snapshot| (k.clone(), snapshot)))
            .collect())
    }

    async fn get_item(&self, key: &ItemKey) -> Result<Option<ItemPayload>, StoreError> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        if !self.is_live(&entry) {
            drop(entry);
            self.entries.remove(key);
            return Ok(None);
        }
        match &entry.value {
            StoredValue::Item(payload) => Ok(Some(payload.clone())),
            _ => Ok(None),
        }
    }

    async fn put_item(&self, key: &ItemKey, payload: ItemPayload, expect_absent: bool) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        if expect_absent && self.entries.contains_key(key) {
            return Err(StoreError::Conflict);
        }
        self.entries.insert(
            key.clone(),
            Entry {
                value: StoredValue::Item(payload),
                ttl_epoch_s: None,
            },
        );
        Ok(())
    }

    async fn get_config(&self, key: &ItemKey) -> Result<Option<ConfigPayload>, StoreError> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        match &entry.value {
            StoredValue::Config(cfg) => Ok(Some(cfg.clone())),
            _ => Ok(None),
        }
    }

    async fn put_config(&self, key: &ItemKey, payload: ConfigPayload, expect_absent: bool) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        if expect_absent && self.entries.contains_key(key) {
            return Err(StoreError::Conflict);
        }
        self.entries.insert(
            key.clone(),
            Entry {
                value: StoredValue::Config(payload),
                ttl_epoch_s: None,
            },
        );
        Ok(())
    }

    async fn transact_write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        for op in &ops {
            match op {
                WriteOp::PutBucket { key, condition, .. } | WriteOp::ConditionCheck { key, condition } => {
                    self.check_condition(key, condition)?;
                }
                WriteOp::PutConfig { key, expect_absent, .. } | WriteOp::PutItem { key, expect_absent, .. } => {
                    if *expect_absent && self.entries.contains_key(key) {
                        return Err(StoreError::Conflict);
                    }
                }
                WriteOp::Delete { .. } => {}
            }
        }
        for op in ops {
            match op {
                WriteOp::PutBucket {
                    key,
                    snapshot,
                    ttl_epoch_s,
                    ..
                } => {
                    self.entries.insert(
                        key,
                        Entry {
                            value: StoredValue::Bucket(snapshot),
                            ttl_epoch_s: Some(ttl_epoch_s),
                        },
                    );
                }
                WriteOp::PutConfig { key, payload, .. } => {
                    self.entries.insert(
                        key,
                        Entry {
                            value: StoredValue::Config(payload),
                            ttl_epoch_s: None,
                        },
                    );
                }
                WriteOp::PutItem { key, payload, .. } => {
                    self.entries.insert(
                        key,
                        Entry {
                            value: StoredValue::Item(payload),
                            ttl_epoch_s: None,
                        },
                    );
                }
                WriteOp::Delete { key } => {
                    self.entries.remove(&key);
                }
                WriteOp::ConditionCheck { .. } => {}
            }
        }
        Ok(())
    }

    async fn query(
        &self,
        _index: Index,
        pk: &str,
        sk_predicate: SkPredicate,
        limit: Option<usize>,
    ) -> Result<Vec<QueryItem>, StoreError> {
        let mut out = Vec::new();
        for entry in &self.entries {
            let key = entry.key();
            if key.pk != pk || !sk_predicate.matches(&key.sk) {
                continue;
            }
            if !self.is_live(entry.value()) {
                continue;
            }
            let payload = match &entry.value().value {
                StoredValue::Item(p) => p.clone(),
                StoredValue::Config(cfg) => serde_json::to_value(cfg).map_err(|e| StoreError::Transport(e.into()))?,
                StoredValue::Bucket(snap) => serde_json::to_value(snap).map_err(|e| StoreError::Transport(e.into()))?,
            };
            out.push(QueryItem { key: key.clone(), payload });
            if let Some(limit) = limit {
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }
}
