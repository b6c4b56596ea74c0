//! [`Lease`]: the handle an `acquire` returns, used for post-hoc
//! reconciliation (spec §4.F) — adjusting consumption after the fact once
//! the real cost of an operation is known.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tbucket_core::bucket::{force_consume, BucketSnapshot};
use tbucket_core::clock::Clock;
use tbucket_core::error::{LimiterError, Side};
use tbucket_core::keyspace::{self, ItemKey};
use tbucket_core::limit::Limit;

use crate::config::ConfigResolver;
use crate::store::{store_error_to_limiter, BucketCondition, StoreGateway, WriteOp};
use crate::ttl::bucket_ttl_epoch_s;

#[derive(Clone)]
struct TrackedBucket {
    key: ItemKey,
    limit: Limit,
    side: Side,
    entity_id: String,
}

/// A handle to the buckets touched by one successful `acquire`.
///
/// There is no explicit release: token buckets refill on their own, so the
/// only operation a lease supports beyond reading `consumed` is `adjust`,
/// for reconciling a reservation against the operation's real cost once
/// it's known.
pub struct Lease {
    ns: String,
    entity_id: String,
    resource: String,
    gateway: Arc<dyn StoreGateway>,
    clock: Arc<dyn Clock>,
    config: Arc<ConfigResolver>,
    bucket_ttl_multiplier: i64,
    tracked: Mutex<Vec<TrackedBucket>>,
    consumed: Mutex<HashMap<String, i64>>,
}

impl Lease {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ns: String,
        entity_id: String,
        resource: String,
        gateway: Arc<dyn StoreGateway>,
        clock: Arc<dyn Clock>,
        config: Arc<ConfigResolver>,
        bucket_ttl_multiplier: i64,
        tracked: Vec<(ItemKey, Limit, Side, String)>,
        consumed: HashMap<String, i64>,
    ) -> Self {
        Self {
            ns,
            entity_id,
            resource,
            gateway,
            clock,
            config,
            bucket_ttl_multiplier,
            tracked: Mutex::new(
                tracked
                    .into_iter()
                    .map(|(key, limit, side, entity_id)| TrackedBucket { key, limit, side, entity_id })
                    .collect(),
            ),
            consumed: Mutex::new(consumed),
        }
    }

    /// The resource this lease was acquired for.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// A read-only snapshot of the running net consumption, by limit name.
    #[must_use]
    pub fn consumed(&self) -> HashMap<String, i64> {
        self.consumed.lock().clone()
    }

    /// Reconciles actual consumption against the reservation made at
    /// `acquire` time. For each named limit, force-consumes `delta` tokens
    /// (negative to credit tokens back) against every bucket tracked under
    /// that name — both self and parent side, if the acquire cascaded and
    /// touched both.
    ///
    /// Writes carry no condition: an adjustment never fails on capacity,
    /// and is best-effort with respect to concurrent writes to the same
    /// bucket (the last writer wins). Adjusting a limit name outside the
    /// original acquire is permitted if its shape can still be resolved
    /// from the entity's own stored config; otherwise that name is
    /// silently skipped rather than raising an error, since `adjust` must
    /// never throw due to an unavailable shape any more than it throws due
    /// to capacity.
    pub async fn adjust(&self, deltas: &HashMap<String, i64>) -> Result<(), LimiterError> {
        if deltas.is_empty() {
            return Ok(());
        }
        let now = self.clock.now_ms();

        let mut targets = self.tracked.lock().clone();
        for name in deltas.keys() {
            if targets.iter().any(|t| &t.limit.name == name) {
                continue;
            }
            if let Some(limit) = self.resolve_shape(name).await {
                let key = keyspace::bucket_key(&self.ns, &self.entity_id, &self.resource, name);
                targets.push(TrackedBucket {
                    key,
                    limit,
                    side: Side::SelfEntity,
                    entity_id: self.entity_id.clone(),
                });
            }
        }

        let mut ops = Vec::new();
        let mut touched: Vec<(String, i64)> = Vec::new();
        for target in &targets {
            let Some(&delta) = deltas.get(&target.limit.name) else {
                continue;
            };
            let current = self
                .gateway
                .get_bucket(&target.key)
                .await
                .map_err(store_error_to_limiter)?
                .unwrap_or_else(|| {
                    BucketSnapshot::fresh(
                        target.limit.capacity_milli(),
                        target.limit.burst_milli(),
                        target.limit.refill_amount_milli(),
                        target.limit.refill_period_ms,
                        now,
                    )
                });
            let (_, after) = force_consume(&current, delta, now);
            tracing::debug!(
                entity_id = %target.entity_id,
                side = ?target.side,
                limit = %target.limit.name,
                delta,
                "adjusting lease bucket"
            );
            ops.push(WriteOp::PutBucket {
                key: target.key.clone(),
                snapshot: after,
                ttl_epoch_s: bucket_ttl_epoch_s(now, target.limit.refill_period_ms, self.bucket_ttl_multiplier),
                condition: BucketCondition::None,
            });
            touched.push((target.limit.name.clone(), delta));
        }

        if ops.is_empty() {
            return Ok(());
        }

        self.gateway.transact_write(ops).await.map_err(store_error_to_limiter)?;

        *self.tracked.lock() = targets;
        let mut consumed = self.consumed.lock();
        for (name, delta) in touched {
            *consumed.entry(name).or_insert(0) += delta;
        }
        Ok(())
    }

    async fn resolve_shape(&self, limit_name: &str) -> Option<Limit> {
        let resolved = self.config.resolve(&self.entity_id, &self.resource, None, true).await.ok()?;
        resolved.limits.into_iter().find(|l| l.name == limit_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryGateway;
    use std::time::Duration;
    use tbucket_core::clock::testing::FixedClock;

    fn lease(gateway: Arc<InMemoryGateway>, clock: Arc<FixedClock>) -> Lease {
        let config = Arc::new(ConfigResolver::new("ns1", gateway.clone(), clock.clone(), Duration::from_secs(2)));
        let limit = Limit::per_minute("tpm", 1000);
        let key = keyspace::bucket_key("ns1", "u1", "api", "tpm");
        Lease::new(
            "ns1".to_string(),
            "u1".to_string(),
            "api".to_string(),
            gateway,
            clock,
            config,
            10,
            vec![(key, limit, Side::SelfEntity, "u1".to_string())],
            HashMap::from([("tpm".to_string(), 100)]),
        )
    }

    #[tokio::test]
    async fn adjust_drives_bucket_negative_and_updates_consumed() {
        let gateway = Arc::new(InMemoryGateway::new());
        let clock = Arc::new(FixedClock::new(0));
        let key = keyspace::bucket_key("ns1", "u1", "api", "tpm");
        gateway
            .transact_write(vec![WriteOp::PutBucket {
                key: key.clone(),
                snapshot: BucketSnapshot {
                    tokens_milli: 900_000,
                    last_refill_ms: 0,
                    capacity_milli: 1_000_000,
                    burst_milli: 1_000_000,
                    refill_amount_milli: 1_000_000,
                    refill_period_ms: 60_000,
                },
                ttl_epoch_s: 1_000_000,
                condition: BucketCondition::None,
            }])
            .await
            .unwrap();

        let lease = lease(gateway.clone(), clock.clone());
        lease.adjust(&HashMap::from([("tpm".to_string(), 950)])).await.unwrap();

        let snapshot = gateway.get_bucket(&key).await.unwrap().unwrap();
        assert_eq!(snapshot.tokens_milli, -50_000);
        assert_eq!(lease.consumed()["tpm"], 1050);
    }

    #[tokio::test]
    async fn adjust_with_unknown_name_is_a_no_op() {
        let gateway = Arc::new(InMemoryGateway::new());
        let clock = Arc::new(FixedClock::new(0));
        let lease = lease(gateway, clock);
        lease.adjust(&HashMap::from([("unknown".to_string(), 10)])).await.unwrap();
        assert!(!lease.consumed().contains_key("unknown"));
    }

    #[tokio::test]
    async fn empty_deltas_is_a_no_op() {
        let gateway = Arc::new(InMemoryGateway::new());
        let clock = Arc::new(FixedClock::new(0));
        let lease = lease(gateway, clock);
        lease.adjust(&HashMap::new()).await.unwrap();
        assert_eq!(lease.consumed()["tpm"], 100);
    }
}
