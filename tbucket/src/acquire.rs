//! The acquire engine: the central protocol that turns
//! `(entity, resource, consume)` into either a committed [`Lease`] or a
//! `RateLimitExceeded`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tbucket_core::bucket::{try_consume, BucketSnapshot};
use tbucket_core::clock::Clock;
use tbucket_core::error::{LimiterError, RateLimitExceeded, Side, ValidationError, Violation};
use tbucket_core::keyspace::{self, ItemKey};
use tbucket_core::limit::Limit;
use tbucket_core::validation;

use crate::config::{ConfigResolver, ConflictRetryPolicy};
use crate::entity::Entity;
use crate::lease::Lease;
use crate::store::{BucketCondition, OnUnavailable, RetryPolicy, StoreError, StoreGateway, WriteOp};
use crate::ttl::bucket_ttl_epoch_s;

/// A single acquire may touch at most this many distinct limit names
/// (summed across self and, if cascading, parent) before it's rejected
/// up-front (spec §4.E step 4).
const MAX_LIMITS_PER_ACQUIRE: usize = 50;

/// Input to [`AcquireEngine::acquire`].
#[derive(Debug, Clone, Default)]
pub struct AcquireRequest {
    pub limits: Option<Vec<Limit>>,
    pub cascade: bool,
    pub use_stored_limits: bool,
    pub require_entity: bool,
}

struct EntityCacheEntry {
    entity: Entity,
    inserted_at_ms: i64,
}

/// One bucket touched by an in-flight acquire attempt.
struct TouchedBucket {
    key: ItemKey,
    limit: Limit,
    side: Side,
    entity_id: String,
    amount: i64,
}

/// Runs the full acquire protocol (spec §4.E) for one namespace. Shares
/// its [`StoreGateway`] and [`ConfigResolver`] with the owning
/// [`crate::namespace::ScopedLimiter`]; owns its own small entity cache.
pub struct AcquireEngine {
    ns: String,
    gateway: Arc<dyn StoreGateway>,
    clock: Arc<dyn Clock>,
    config: Arc<ConfigResolver>,
    entities: Arc<crate::entity::EntityRepo>,
    entity_cache: DashMap<String, EntityCacheEntry>,
    entity_cache_ttl_ms: i64,
    bucket_ttl_multiplier: i64,
    conflict_retry: ConflictRetryPolicy,
    /// Bounds the sum of retries and I/O for one `acquire` call (spec §5).
    acquire_deadline: Duration,
    /// Set once this process has logged the `on_unavailable = allow`
    /// fallback for this namespace, so the warning doesn't repeat on
    /// every call (spec §7).
    logged_fallback: AtomicBool,
}

impl AcquireEngine {
    #[must_use]
    pub fn new(
        ns: impl Into<String>,
        gateway: Arc<dyn StoreGateway>,
        clock: Arc<dyn Clock>,
        config: Arc<ConfigResolver>,
        entities: Arc<crate::entity::EntityRepo>,
        entity_cache_ttl: Duration,
        bucket_ttl_multiplier: i64,
        conflict_retry: ConflictRetryPolicy,
        acquire_deadline: Duration,
    ) -> Self {
        Self {
            ns: ns.into(),
            gateway,
            clock,
            config,
            entities,
            entity_cache: DashMap::new(),
            entity_cache_ttl_ms: entity_cache_ttl.as_millis() as i64,
            bucket_ttl_multiplier,
            conflict_retry,
            acquire_deadline,
            logged_fallback: AtomicBool::new(false),
        }
    }

    /// Runs the acquire protocol. See spec §4.E for the full algorithm;
    /// this is its direct transcription. Bounded by `acquire_deadline`:
    /// exceeding it surfaces as a transport error rather than hanging.
    #[tracing::instrument(level = "debug", skip(self, consume, req), fields(ns = %self.ns))]
    pub async fn acquire(&self, entity_id: &str, resource: &str, consume: &HashMap<String, i64>, req: &AcquireRequest) -> Result<Lease, LimiterError> {
        match tokio::time::timeout(self.acquire_deadline, self.acquire_inner(entity_id, resource, consume, req)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(LimiterError::Transport(anyhow::anyhow!(
                "acquire for entity {entity_id:?} resource {resource:?} exceeded deadline of {:?}",
                self.acquire_deadline
            ))),
        }
    }

    async fn acquire_inner(&self, entity_id: &str, resource: &str, consume: &HashMap<String, i64>, req: &AcquireRequest) -> Result<Lease, LimiterError> {
        validation::validate_identifier("resource", resource)?;
        let entity = self.resolve_entity(entity_id, req.require_entity).await?;
        // An entity created with `cascade=true` always cascades; `req.cascade`
        // is a per-call opt-in on top of that for entities that don't carry
        // the flag themselves. Either way, no parent means nothing to do.
        let cascade = (req.cascade || entity.cascade) && entity.parent_id.is_some();

        let self_limits = self.resolve_effective(entity_id, resource, req.limits.as_deref(), req.use_stored_limits).await?;
        let parent_limits = if cascade {
            self.effective_limits_best_effort(entity.parent_id.as_deref().expect("cascade implies parent_id"), resource)
                .await
        } else {
            Vec::new()
        };

        let mut touched = Vec::new();
        for limit in &self_limits.limits {
            if let Some(&amount) = consume.get(&limit.name) {
                touched.push((Side::SelfEntity, entity_id.to_string(), limit.clone(), amount));
            }
        }
        if cascade {
            let parent_id = entity.parent_id.as_deref().expect("cascade implies parent_id");
            for limit in &parent_limits {
                if let Some(&amount) = consume.get(&limit.name) {
                    touched.push((Side::Parent, parent_id.to_string(), limit.clone(), amount));
                }
            }
        }

        if touched.len() > MAX_LIMITS_PER_ACQUIRE {
            return Err(LimiterError::Validation(ValidationError::new(
                "consume",
                touched.len().to_string(),
                "a single acquire may touch at most 50 limits",
            )));
        }

        if touched.is_empty() {
            // Either `on_unavailable = allow` bypassed resolution, or none
            // of the requested limit names resolved to a shape on either
            // side — in both cases there is nothing to reserve.
            return Ok(Lease::new(
                self.ns.clone(),
                entity_id.to_string(),
                resource.to_string(),
                self.gateway.clone(),
                self.clock.clone(),
                self.config.clone(),
                self.bucket_ttl_multiplier,
                Vec::new(),
                HashMap::new(),
            ));
        }

        let touched: Vec<TouchedBucket> = touched
            .into_iter()
            .map(|(side, side_entity_id, limit, amount)| TouchedBucket {
                key: keyspace::bucket_key(&self.ns, &side_entity_id, resource, &limit.name),
                limit,
                side,
                entity_id: side_entity_id,
                amount,
            })
            .collect();

        let retry_policy = RetryPolicy {
            max_attempts: self.conflict_retry.max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: self.conflict_retry.max_total,
            deadline: self.conflict_retry.max_total,
        };

        let start = std::time::Instant::now();
        let mut attempt = 0;
        loop {
            tracing::debug!(entity_id, resource, attempt, "acquire attempt");
            match self.try_commit(entity_id, resource, &touched).await {
                Ok(lease) => return Ok(lease),
                // A capacity failure is the domain's normal rejection signal —
                // retrying won't help until the bucket refills, so it is
                // returned immediately rather than consuming the conflict
                // retry budget.
                Err(AttemptOutcome::Violations(v)) => return Err(v.into()),
                Err(AttemptOutcome::Transport(e)) => return Err(LimiterError::Transport(e)),
                Err(AttemptOutcome::Conflict) => {
                    attempt += 1;
                    if attempt >= retry_policy.max_attempts || start.elapsed() >= retry_policy.deadline {
                        tracing::warn!(entity_id, resource, attempt, "conflict retry budget exhausted");
                        return Err(LimiterError::ConflictExhausted);
                    }
                    tracing::warn!(entity_id, resource, attempt, "retrying after write conflict");
                    tokio::time::sleep(crate::store::full_jitter_delay(&retry_policy, attempt - 1)).await;
                }
            }
        }
    }

    /// One attempt: re-reads current snapshots, evaluates capacity, and
    /// either commits a transactional write or reports why it didn't.
    async fn try_commit(&self, entity_id: &str, resource: &str, touched: &[TouchedBucket]) -> Result<Lease, AttemptOutcome> {
        let now = self.clock.now_ms();
        let keys: Vec<ItemKey> = touched.iter().map(|t| t.key.clone()).collect();
        let snapshots = self
            .gateway
            .batch_get_buckets(&keys)
            .await
            .map_err(|e| AttemptOutcome::Transport(store_error_anyhow(e)))?;

        let mut violations = Vec::new();
        let mut ops = Vec::new();
        let mut tracked = Vec::new();
        let mut consumed = HashMap::new();

        for t in touched {
            let current = snapshots.get(&t.key).copied().unwrap_or_else(|| {
                BucketSnapshot::fresh(t.limit.capacity_milli(), t.limit.burst_milli(), t.limit.refill_amount_milli(), t.limit.refill_period_ms, now)
            });
            let seen_ms = current.last_refill_ms;
            let outcome = try_consume(&current, t.amount, now);

            if !outcome.success {
                violations.push(Violation {
                    entity_id: t.entity_id.clone(),
                    limit_name: t.limit.name.clone(),
                    resource: resource.to_string(),
                    available: outcome.available,
                    exceeded: true,
                    retry_after_seconds: outcome.retry_after_seconds,
                    side: t.side,
                });
                continue;
            }

            ops.push(WriteOp::PutBucket {
                key: t.key.clone(),
                snapshot: outcome.snapshot,
                ttl_epoch_s: bucket_ttl_epoch_s(now, t.limit.refill_period_ms, self.bucket_ttl_multiplier),
                condition: BucketCondition::AbsentOrLastRefillMs(seen_ms),
            });
            tracked.push((t.key.clone(), t.limit.clone(), t.side, t.entity_id.clone()));
            consumed.insert(t.limit.name.clone(), t.amount);
        }

        if !violations.is_empty() {
            return Err(AttemptOutcome::Violations(RateLimitExceeded::new(violations)));
        }

        self.gateway.transact_write(ops).await.map_err(|e| match e {
            StoreError::Conflict => AttemptOutcome::Conflict,
            StoreError::Transport(e) => AttemptOutcome::Transport(e),
        })?;

        Ok(Lease::new(
            self.ns.clone(),
            entity_id.to_string(),
            resource.to_string(),
            self.gateway.clone(),
            self.clock.clone(),
            self.config.clone(),
            self.bucket_ttl_multiplier,
            tracked,
            consumed,
        ))
    }

    async fn resolve_entity(&self, entity_id: &str, require_entity: bool) -> Result<Entity, LimiterError> {
        let now = self.clock.now_ms();
        if let Some(cached) = self.entity_cache.get(entity_id) {
            if now - cached.inserted_at_ms < self.entity_cache_ttl_ms {
                return Ok(cached.entity.clone());
            }
        }

        let existing = self.entities.get(entity_id).await.map_err(LimiterError::Transport)?;
        let entity = match existing {
            Some(e) => e,
            None if require_entity => return Err(LimiterError::EntityNotFound(entity_id.to_string())),
            None => match self.entities.create(entity_id, None, None, HashMap::new(), false).await {
                Ok(e) => e,
                Err(LimiterError::EntityExists(_)) => self
                    .entities
                    .get(entity_id)
                    .await
                    .map_err(LimiterError::Transport)?
                    .ok_or_else(|| LimiterError::EntityNotFound(entity_id.to_string()))?,
                Err(other) => return Err(other),
            },
        };

        self.entity_cache.insert(
            entity_id.to_string(),
            EntityCacheEntry {
                entity: entity.clone(),
                inserted_at_ms: now,
            },
        );
        Ok(entity)
    }

    /// Resolves the caller-facing effective limits for `entity_id`,
    /// applying the `on_unavailable` fail-open/fail-closed branch (spec
    /// §4.E step 10) when nothing is configured.
    async fn resolve_effective(
        &self,
        entity_id: &str,
        resource: &str,
        limits: Option<&[Limit]>,
        use_stored_limits: bool,
    ) -> Result<crate::config::resolver::ResolvedConfig, LimiterError> {
        match self.config.resolve(entity_id, resource, limits, use_stored_limits).await {
            Ok(resolved) => Ok(resolved),
            Err(crate::config::resolver::ResolveError::Unconfigured { on_unavailable }) => {
                if on_unavailable == OnUnavailable::Allow {
                    if self.logged_fallback.compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed).is_ok() {
                        tracing::warn!(ns = %self.ns, entity_id, resource, "no limits configured anywhere; on_unavailable=allow is letting requests through");
                    }
                    Ok(crate::config::resolver::ResolvedConfig {
                        limits: Vec::new(),
                        on_unavailable,
                    })
                } else {
                    Err(LimiterError::LimitsUnavailable)
                }
            }
            Err(crate::config::resolver::ResolveError::Transport(e)) => Err(LimiterError::Transport(e.into())),
        }
    }

    /// Resolves the parent side's limits for a cascading acquire. A parent
    /// with nothing configured simply contributes no buckets — cascade
    /// never raises `LimitsUnavailable` on the parent's behalf.
    async fn effective_limits_best_effort(&self, entity_id: &str, resource: &str) -> Vec<Limit> {
        match self.config.resolve(entity_id, resource, None, true).await {
            Ok(resolved) => resolved.limits,
            Err(_) => Vec::new(),
        }
    }
}

enum AttemptOutcome {
    Violations(RateLimitExceeded),
    Conflict,
    Transport(anyhow::Error),
}

fn store_error_anyhow(e: StoreError) -> anyhow::Error {
    match e {
        StoreError::Conflict => anyhow::anyhow!("unexpected conflict on non-transactional read"),
        StoreError::Transport(e) => e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::resolver::ConfigResolver;
    use crate::entity::EntityRepo;
    use crate::store::{ConfigPayload, InMemoryGateway};
    use tbucket_core::clock::testing::FixedClock;

    fn engine(gateway: Arc<InMemoryGateway>, clock: Arc<FixedClock>) -> AcquireEngine {
        let config = Arc::new(ConfigResolver::new("ns1", gateway.clone(), clock.clone(), Duration::from_secs(2)));
        let entities = Arc::new(EntityRepo::new("ns1", gateway.clone()));
        AcquireEngine::new(
            "ns1",
            gateway,
            clock,
            config,
            entities,
            Duration::from_secs(5),
            10,
            ConflictRetryPolicy::default(),
            Duration::from_secs(5),
        )
    }

    async fn set_system_limits(gateway: &InMemoryGateway, limits: Vec<Limit>) {
        gateway
            .put_config(
                &keyspace::system_config_key("ns1"),
                ConfigPayload { limits, on_unavailable: None },
                false,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn basic_consume_allows_five_then_denies_sixth() {
        let gateway = Arc::new(InMemoryGateway::new());
        let clock = Arc::new(FixedClock::new(0));
        set_system_limits(&gateway, vec![Limit::per_minute("rpm", 5)]).await;
        let engine = engine(gateway, clock);

        let req = AcquireRequest::default();
        for _ in 0..5 {
            engine.acquire("u1", "api", &HashMap::from([("rpm".to_string(), 1)]), &req).await.unwrap();
        }
        let err = engine
            .acquire("u1", "api", &HashMap::from([("rpm".to_string(), 1)]), &req)
            .await
            .unwrap_err();
        match err {
            LimiterError::RateLimitExceeded(e) => {
                assert_eq!(e.violations.len(), 1);
                assert_eq!(e.violations[0].limit_name, "rpm");
                assert_eq!(e.violations[0].available, 0);
                assert!(e.retry_after_seconds > 11.0 && e.retry_after_seconds < 13.0);
            }
            other => panic!("expected RateLimitExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn multi_limit_denies_only_the_exhausted_name() {
        let gateway = Arc::new(InMemoryGateway::new());
        let clock = Arc::new(FixedClock::new(0));
        set_system_limits(&gateway, vec![Limit::per_minute("rpm", 5), Limit::per_minute("tpm", 100)]).await;
        let engine = engine(gateway, clock);

        let req = AcquireRequest::default();
        let consume = HashMap::from([("rpm".to_string(), 1), ("tpm".to_string(), 40)]);
        engine.acquire("u1", "api", &consume, &req).await.unwrap();
        engine.acquire("u1", "api", &consume, &req).await.unwrap();
        let err = engine.acquire("u1", "api", &consume, &req).await.unwrap_err();
        match err {
            LimiterError::RateLimitExceeded(e) => {
                assert_eq!(e.violations.len(), 1);
                assert_eq!(e.violations[0].limit_name, "tpm");
                assert_eq!(e.violations[0].available, 20);
            }
            other => panic!("expected RateLimitExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn post_hoc_reconciliation_can_drive_bucket_negative() {
        let gateway = Arc::new(InMemoryGateway::new());
        let clock = Arc::new(FixedClock::new(0));
        set_system_limits(&gateway, vec![Limit::per_minute("tpm", 1000)]).await;
        let engine = engine(gateway, clock);

        let req = AcquireRequest::default();
        let lease = engine
            .acquire("u1", "api", &HashMap::from([("tpm".to_string(), 100)]), &req)
            .await
            .unwrap();
        lease.adjust(&HashMap::from([("tpm".to_string(), 950)])).await.unwrap();
        assert_eq!(lease.consumed()["tpm"], 1050);
    }

    #[tokio::test]
    async fn cascade_block_attributes_violation_to_parent() {
        let gateway = Arc::new(InMemoryGateway::new());
        let clock = Arc::new(FixedClock::new(0));
        let engine = engine(gateway.clone(), clock);

        engine.entities.create("proj", None, None, HashMap::new(), true).await.unwrap();
        engine
            .entities
            .create("k1", None, Some("proj".to_string()), HashMap::new(), true)
            .await
            .unwrap();
        gateway
            .put_config(
                &keyspace::entity_config_key("ns1", "proj", "api"),
                ConfigPayload {
                    limits: vec![Limit::per_minute("rpm", 5)],
                    on_unavailable: None,
                },
                false,
            )
            .await
            .unwrap();
        gateway
            .put_config(
                &keyspace::entity_config_key("ns1", "k1", "api"),
                ConfigPayload {
                    limits: vec![Limit::per_minute("rpm", 100)],
                    on_unavailable: None,
                },
                false,
            )
            .await
            .unwrap();

        let req = AcquireRequest {
            cascade: true,
            ..Default::default()
        };
        for _ in 0..5 {
            engine.acquire("k1", "api", &HashMap::from([("rpm".to_string(), 1)]), &req).await.unwrap();
        }
        let err = engine
            .acquire("k1", "api", &HashMap::from([("rpm".to_string(), 1)]), &req)
            .await
            .unwrap_err();
        match err {
            LimiterError::RateLimitExceeded(e) => {
                assert_eq!(e.violations.len(), 1);
                assert_eq!(e.violations[0].side, Side::Parent);
                assert_eq!(e.violations[0].entity_id, "proj");
            }
            other => panic!("expected RateLimitExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unconfigured_with_allow_policy_bypasses_acquire() {
        let gateway = Arc::new(InMemoryGateway::new());
        let clock = Arc::new(FixedClock::new(0));
        gateway
            .put_config(
                &keyspace::system_config_key("ns1"),
                ConfigPayload {
                    limits: Vec::new(),
                    on_unavailable: Some(OnUnavailable::Allow),
                },
                false,
            )
            .await
            .unwrap();
        let engine = engine(gateway, clock);

        let req = AcquireRequest::default();
        let lease = engine
            .acquire("u1", "api", &HashMap::from([("rpm".to_string(), 1)]), &req)
            .await
            .unwrap();
        assert!(lease.consumed().is_empty());
    }

    #[tokio::test]
    async fn unconfigured_with_deny_policy_raises_limits_unavailable() {
        let gateway = Arc::new(InMemoryGateway::new());
        let clock = Arc::new(FixedClock::new(0));
        let engine = engine(gateway, clock);
        let req = AcquireRequest::default();
        let err = engine
            .acquire("u1", "api", &HashMap::from([("rpm".to_string(), 1)]), &req)
            .await
            .unwrap_err();
        assert!(matches!(err, LimiterError::LimitsUnavailable));
    }

    #[tokio::test]
    async fn require_entity_without_existing_entity_errors() {
        let gateway = Arc::new(InMemoryGateway::new());
        let clock = Arc::new(FixedClock::new(0));
        set_system_limits(&gateway, vec![Limit::per_minute("rpm", 5)]).await;
        let engine = engine(gateway, clock);
        let req = AcquireRequest {
            require_entity: true,
            ..Default::default()
        };
        let err = engine
            .acquire("ghost", "api", &HashMap::from([("rpm".to_string(), 1)]), &req)
            .await
            .unwrap_err();
        assert!(matches!(err, LimiterError::EntityNotFound(_)));
    }

    #[tokio::test]
    async fn entity_level_cascade_flag_cascades_without_a_per_call_opt_in() {
        let gateway = Arc::new(InMemoryGateway::new());
        let clock = Arc::new(FixedClock::new(0));
        let engine = engine(gateway.clone(), clock);

        engine.entities.create("proj", None, None, HashMap::new(), true).await.unwrap();
        engine
            .entities
            .create("k1", None, Some("proj".to_string()), HashMap::new(), true) // entity-level cascade=true
            .await
            .unwrap();
        gateway
            .put_config(
                &keyspace::entity_config_key("ns1", "proj", "api"),
                ConfigPayload {
                    limits: vec![Limit::per_minute("rpm", 1)],
                    on_unavailable: None,
                },
                false,
            )
            .await
            .unwrap();

        let req = AcquireRequest::default(); // no per-call cascade opt-in
        engine.acquire("k1", "api", &HashMap::from([("rpm".to_string(), 1)]), &req).await.unwrap();
        let err = engine.acquire("k1", "api", &HashMap::from([("rpm".to_string(), 1)]), &req).await.unwrap_err();
        match err {
            LimiterError::RateLimitExceeded(e) => assert_eq!(e.violations[0].side, Side::Parent),
            other => panic!("expected RateLimitExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cascade_without_parent_is_a_no_op() {
        let gateway = Arc::new(InMemoryGateway::new());
        let clock = Arc::new(FixedClock::new(0));
        set_system_limits(&gateway, vec![Limit::per_minute("rpm", 5)]).await;
        let engine = engine(gateway, clock);
        let req = AcquireRequest {
            cascade: true,
            ..Default::default()
        };
        let lease = engine
            .acquire("solo", "api", &HashMap::from([("rpm".to_string(), 1)]), &req)
            .await
            .unwrap();
        assert_eq!(lease.consumed()["rpm"], 1);
    }
}
