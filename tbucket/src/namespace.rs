//! Namespace registration and the per-namespace scoped facade (spec §4.G).
//!
//! Every key lives behind a `<namespace-id>/` prefix. [`NamespaceScoper`]
//! resolves a human-chosen name to that id (through a tiny LRU, since the
//! mapping almost never changes once registered) and hands back a cached
//! [`ScopedLimiter`] wired to that namespace's own acquire engine, entity
//! repo, and config resolver — built once per namespace id and reused
//! across calls so each namespace's config cache actually gets to live
//! out its TTL instead of being rebuilt on every lookup.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tbucket_core::bucket;
use tbucket_core::clock::Clock;
use tbucket_core::error::LimiterError;
use tbucket_core::keyspace;
use tbucket_core::limit::Limit;
use tbucket_core::{generate_namespace_id, validation};

use crate::acquire::{AcquireEngine, AcquireRequest};
use crate::config::{ConfigResolver, LimiterConfig};
use crate::entity::{Entity, EntityRepo};
use crate::lease::Lease;
use crate::store::{ConfigPayload, OnUnavailable, StoreGateway, WriteOp};

/// `default`, and anything starting with `_`, exist implicitly and can
/// never be (re-)registered by a caller.
#[must_use]
pub fn is_reserved_namespace(name: &str) -> bool {
    name == "default" || name.starts_with('_')
}

const DEFAULT_NAMESPACE_NAME: &str = "default";
const DEFAULT_NAMESPACE_ID: &str = "default";

/// Fixed-capacity name→id cache, evicted oldest-first. Namespace mappings
/// are near-permanent once registered, so this exists only to avoid a
/// store round trip on the hot path, not for correctness.
struct NameCache {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashMap<String, String>,
}

impl NameCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    fn get(&mut self, name: &str) -> Option<String> {
        let id = self.entries.get(name).cloned()?;
        self.touch(name);
        Some(id)
    }

    fn insert(&mut self, name: &str, id: String) {
        if !self.entries.contains_key(name) && self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(name.to_string(), id);
        self.touch(name);
    }

    fn touch(&mut self, name: &str) {
        self.order.retain(|n| n != name);
        self.order.push_back(name.to_string());
    }
}

/// Resolves namespace names to ids and caches one [`ScopedLimiter`] per
/// namespace id. Shared by every [`ScopedLimiter`] it hands out, so the
/// same `Arc<dyn StoreGateway>` and name cache back every namespace.
pub struct NamespaceScoper {
    gateway: Arc<dyn StoreGateway>,
    clock: Arc<dyn Clock>,
    config: LimiterConfig,
    names: Mutex<NameCache>,
    scoped: DashMap<String, Arc<ScopedLimiter>>,
}

impl NamespaceScoper {
    /// Builds the scoper and idempotently registers the implicit `default`
    /// namespace, per spec §4.G.
    pub async fn init(gateway: Arc<dyn StoreGateway>, clock: Arc<dyn Clock>, config: LimiterConfig) -> Result<Self, LimiterError> {
        let scoper = Self {
            gateway,
            clock,
            config: config.clone(),
            names: Mutex::new(NameCache::new(config.namespace_cache_capacity)),
            scoped: DashMap::new(),
        };
        scoper.ensure_default_registered().await?;
        Ok(scoper)
    }

    async fn ensure_default_registered(&self) -> Result<(), LimiterError> {
        let name_key = keyspace::namespace_name_key(DEFAULT_NAMESPACE_NAME);
        if self.gateway.get_item(&name_key).await.map_err(|e| LimiterError::Transport(anyhow::anyhow!(e)))?.is_some() {
            return Ok(());
        }
        let id_key = keyspace::namespace_id_key(DEFAULT_NAMESPACE_ID);
        let _ = self
            .gateway
            .transact_write(vec![
                WriteOp::PutItem {
                    key: name_key,
                    payload: serde_json::json!(DEFAULT_NAMESPACE_ID),
                    expect_absent: true,
                },
                WriteOp::PutItem {
                    key: id_key,
                    payload: serde_json::json!(DEFAULT_NAMESPACE_NAME),
                    expect_absent: true,
                },
            ])
            .await; // a concurrent initializer winning the race is fine.
        Ok(())
    }

    /// Registers a new namespace name, generating a fresh id. Reserved
    /// names cannot be registered. Registering a name that already exists
    /// is idempotent: the existing id is returned rather than erroring.
    pub async fn register(&self, name: &str) -> Result<String, LimiterError> {
        validation::validate_namespace_name(name).map_err(LimiterError::from)?;
        if is_reserved_namespace(name) {
            return Err(LimiterError::from(tbucket_core::error::ValidationError::new(
                "namespace_name",
                name.to_string(),
                "this name is reserved and cannot be registered",
            )));
        }

        let name_key = keyspace::namespace_name_key(name);
        let id = generate_namespace_id();
        let id_key = keyspace::namespace_id_key(&id);
        let result = self
            .gateway
            .transact_write(vec![
                WriteOp::PutItem {
                    key: name_key.clone(),
                    payload: serde_json::json!(id),
                    expect_absent: true,
                },
                WriteOp::PutItem {
                    key: id_key,
                    payload: serde_json::json!(name),
                    expect_absent: true,
                },
            ])
            .await;

        match result {
            Ok(()) => {
                self.names.lock().insert(name, id.clone());
                Ok(id)
            }
            Err(_conflict_or_transport) => {
                // Either this name raced another registration of itself, or
                // the freshly generated id collided (astronomically
                // unlikely). Either way, resolving the name again is the
                // correct recovery: it either already points at the id we
                // wanted, or at whoever won the race.
                self.resolve(name).await
            }
        }
    }

    /// Resolves a namespace name to its id, consulting the tiny LRU first.
    pub async fn resolve(&self, name: &str) -> Result<String, LimiterError> {
        if name == DEFAULT_NAMESPACE_NAME {
            return Ok(DEFAULT_NAMESPACE_ID.to_string());
        }
        if let Some(id) = self.names.lock().get(name) {
            return Ok(id);
        }
        let key = keyspace::namespace_name_key(name);
        let payload = self
            .gateway
            .get_item(&key)
            .await
            .map_err(|e| LimiterError::Transport(anyhow::anyhow!(e)))?
            .ok_or_else(|| LimiterError::NamespaceNotFound(name.to_string()))?;
        let id: String = serde_json::from_value(payload).map_err(|e| LimiterError::Transport(e.into()))?;
        self.names.lock().insert(name, id.clone());
        Ok(id)
    }

    /// Resolves `name` and returns its (cached, shared) scoped view.
    pub async fn namespace(&self, name: &str) -> Result<Arc<ScopedLimiter>, LimiterError> {
        let id = self.resolve(name).await?;
        if let Some(existing) = self.scoped.get(&id) {
            return Ok(existing.clone());
        }
        let scoped = Arc::new(ScopedLimiter::new(id.clone(), self.gateway.clone(), self.clock.clone(), self.config.clone()));
        self.scoped.insert(id, scoped.clone());
        Ok(scoped)
    }

    /// The `default` namespace's scoped view, used for unqualified calls
    /// at the top level.
    pub async fn default_namespace(&self) -> Result<Arc<ScopedLimiter>, LimiterError> {
        self.namespace(DEFAULT_NAMESPACE_NAME).await
    }
}

/// Effective config at system scope, for `get_system_defaults`.
#[derive(Debug, Clone, Default)]
pub struct SystemDefaults {
    pub limits: Vec<Limit>,
    pub on_unavailable: Option<OnUnavailable>,
}

/// A namespace-scoped view over the whole public operation surface. Every
/// key this builds goes through its own namespace-id prefix; it shares
/// the store gateway with every other namespace but has its own acquire
/// engine, entity repo, and config cache.
pub struct ScopedLimiter {
    ns: String,
    gateway: Arc<dyn StoreGateway>,
    clock: Arc<dyn Clock>,
    config: Arc<ConfigResolver>,
    entities: Arc<EntityRepo>,
    engine: AcquireEngine,
}

impl ScopedLimiter {
    fn new(ns: String, gateway: Arc<dyn StoreGateway>, clock: Arc<dyn Clock>, cfg: LimiterConfig) -> Self {
        let config = Arc::new(ConfigResolver::new(ns.clone(), gateway.clone(), clock.clone(), cfg.config_cache_ttl));
        let entities = Arc::new(EntityRepo::new(ns.clone(), gateway.clone()));
        let engine = AcquireEngine::new(
            ns.clone(),
            gateway.clone(),
            clock.clone(),
            config.clone(),
            entities.clone(),
            cfg.entity_cache_ttl,
            cfg.bucket_ttl_multiplier,
            cfg.conflict_retry,
            cfg.acquire_deadline,
        );
        Self {
            ns,
            gateway,
            clock,
            config,
            entities,
            engine,
        }
    }

    /// Runs the acquire protocol (spec §4.E).
    pub async fn acquire(&self, entity_id: &str, resource: &str, consume: &HashMap<String, i64>, req: &AcquireRequest) -> Result<Lease, LimiterError> {
        self.engine.acquire(entity_id, resource, consume, req).await
    }

    /// Projects current availability for each of the entity's effective
    /// limits on `resource`, without consuming anything.
    pub async fn available(&self, entity_id: &str, resource: &str, limits: Option<&[Limit]>) -> Result<HashMap<String, i64>, LimiterError> {
        let resolved = self.config.resolve(entity_id, resource, limits, false).await;
        let limits = match resolved {
            Ok(r) => r.limits,
            Err(_) => return Ok(HashMap::new()),
        };
        let now = self.clock.now_ms();
        let mut out = HashMap::new();
        for limit in limits {
            let key = keyspace::bucket_key(&self.ns, entity_id, resource, &limit.name);
            let snapshot = self.gateway.get_bucket(&key).await.map_err(|e| LimiterError::Transport(anyhow::anyhow!(e)))?;
            let value = match snapshot {
                Some(s) => bucket::available(&s, now),
                None => limit.capacity,
            };
            out.insert(limit.name, value);
        }
        Ok(out)
    }

    /// Seconds until every name in `needed` would have enough tokens
    /// available, assuming nothing else consumes from these buckets in
    /// the meantime. `0.0` if already satisfied.
    pub async fn time_until_available(&self, entity_id: &str, resource: &str, needed: &HashMap<String, i64>, limits: Option<&[Limit]>) -> Result<f64, LimiterError> {
        let resolved = self.config.resolve(entity_id, resource, limits, false).await;
        let limits = match resolved {
            Ok(r) => r.limits,
            Err(_) => return Ok(0.0),
        };
        let now = self.clock.now_ms();
        let mut max_wait = 0.0_f64;
        for limit in &limits {
            let Some(&want) = needed.get(&limit.name) else { continue };
            let key = keyspace::bucket_key(&self.ns, entity_id, resource, &limit.name);
            let snapshot = self
                .gateway
                .get_bucket(&key)
                .await
                .map_err(|e| LimiterError::Transport(anyhow::anyhow!(e)))?
                .unwrap_or_else(|| tbucket_core::BucketSnapshot::fresh(limit.capacity_milli(), limit.burst_milli(), limit.refill_amount_milli(), limit.refill_period_ms, now));
            let refilled = snapshot.refill(now);
            let deficit_milli = want * tbucket_core::MILLI - refilled.tokens_milli;
            let wait = bucket::retry_after(deficit_milli, limit.refill_amount_milli(), limit.refill_period_ms);
            max_wait = max_wait.max(wait);
        }
        Ok(max_wait)
    }

    pub async fn create_entity(
        &self,
        entity_id: &str,
        name: Option<String>,
        parent_id: Option<String>,
        metadata: HashMap<String, String>,
        cascade: bool,
    ) -> Result<Entity, LimiterError> {
        self.entities.create(entity_id, name, parent_id, metadata, cascade).await
    }

    pub async fn get_entity(&self, entity_id: &str) -> Result<Option<Entity>, LimiterError> {
        self.entities.get(entity_id).await.map_err(LimiterError::Transport)
    }

    pub async fn get_children(&self, parent_id: &str) -> Result<Vec<String>, LimiterError> {
        self.entities.get_children(parent_id).await
    }

    pub async fn delete_entity(&self, entity_id: &str) -> Result<(), LimiterError> {
        self.entities.delete(entity_id).await.map_err(LimiterError::Transport)
    }

    pub async fn set_limits(&self, entity_id: &str, resource: &str, limits: Vec<Limit>) -> Result<(), LimiterError> {
        validation::validate_identifier("resource", resource).map_err(LimiterError::from)?;
        let key = keyspace::entity_config_key(&self.ns, entity_id, resource);
        self.config
            .put(&key, ConfigPayload { limits, on_unavailable: None })
            .await
            .map_err(|e| LimiterError::Transport(anyhow::anyhow!(e)))?;
        self.config.invalidate(entity_id, resource);
        Ok(())
    }

    pub async fn get_limits(&self, entity_id: &str, resource: &str) -> Result<Vec<Limit>, LimiterError> {
        let key = keyspace::entity_config_key(&self.ns, entity_id, resource);
        Ok(self
            .config
            .get(&key)
            .await
            .map_err(|e| LimiterError::Transport(anyhow::anyhow!(e)))?
            .map(|c| c.limits)
            .unwrap_or_default())
    }

    pub async fn set_resource_defaults(&self, resource: &str, limits: Vec<Limit>) -> Result<(), LimiterError> {
        validation::validate_identifier("resource", resource).map_err(LimiterError::from)?;
        let key = keyspace::resource_config_key(&self.ns, resource);
        self.config
            .put(&key, ConfigPayload { limits, on_unavailable: None })
            .await
            .map_err(|e| LimiterError::Transport(anyhow::anyhow!(e)))?;
        self.config.invalidate_resource(resource);
        Ok(())
    }

    pub async fn get_resource_defaults(&self, resource: &str) -> Result<Vec<Limit>, LimiterError> {
        let key = keyspace::resource_config_key(&self.ns, resource);
        Ok(self
            .config
            .get(&key)
            .await
            .map_err(|e| LimiterError::Transport(anyhow::anyhow!(e)))?
            .map(|c| c.limits)
            .unwrap_or_default())
    }

    pub async fn set_system_defaults(&self, limits: Vec<Limit>, on_unavailable: Option<OnUnavailable>) -> Result<(), LimiterError> {
        let key = keyspace::system_config_key(&self.ns);
        self.config
            .put(&key, ConfigPayload { limits, on_unavailable })
            .await
            .map_err(|e| LimiterError::Transport(anyhow::anyhow!(e)))?;
        self.config.invalidate_all();
        Ok(())
    }

    pub async fn get_system_defaults(&self) -> Result<SystemDefaults, LimiterError> {
        let key = keyspace::system_config_key(&self.ns);
        let cfg = self.config.get(&key).await.map_err(|e| LimiterError::Transport(anyhow::anyhow!(e)))?;
        Ok(match cfg {
            Some(c) => SystemDefaults {
                limits: c.limits,
                on_unavailable: c.on_unavailable,
            },
            None => SystemDefaults::default(),
        })
    }

    /// Never raises: a reachability probe with a bounded timeout, used for
    /// health checks.
    pub async fn is_available(&self, timeout: Option<Duration>) -> bool {
        let probe = keyspace::namespace_id_key(&self.ns);
        let call = self.gateway.get_item(&probe);
        match timeout {
            Some(t) => tokio::time::timeout(t, call).await.map(|r| r.is_ok()).unwrap_or(false),
            None => call.await.is_ok(),
        }
    }
}
