//! Resolves effective limits and `on_unavailable` policy for an
//! (entity, resource) pair from the layered config hierarchy
//! (entity-resource → resource → system), with a bounded, short-TTL cache.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tbucket_core::clock::Clock;
use tbucket_core::keyspace;
use tbucket_core::limit::Limit;
use tokio::sync::OnceCell;

use crate::store::{ConfigPayload, OnUnavailable, StoreError, StoreGateway};

/// The result of resolving effective configuration for one call.
#[derive(Debug, Clone, Default)]
pub struct ResolvedConfig {
    pub limits: Vec<Limit>,
    pub on_unavailable: OnUnavailable,
}

/// Why no limits could be resolved — distinguishes "nothing configured
/// anywhere" from "the store itself is unreachable", since the two are
/// handled differently by the acquire engine's `on_unavailable` branch.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no limits configured at any scope and none were supplied")]
    Unconfigured { on_unavailable: OnUnavailable },
    #[error("store unreachable while resolving config: {0}")]
    Transport(#[from] StoreError),
}

/// Cache key: (entity_id, resource). Namespace isolation comes from the
/// fact that each namespace's `ConfigResolver` is a distinct instance
/// holding its own `DashMap` (see `crate::namespace`).
type CacheKey = (String, String);

struct CacheEntry {
    cell: Arc<OnceCell<Result<ResolvedConfig, ()>>>,
    inserted_at_ms: i64,
}

/// Namespace-scoped config resolver. Each [`crate::namespace::ScopedLimiter`]
/// owns one, so different namespaces never share cached entries even
/// though they may share the same underlying [`StoreGateway`].
pub struct ConfigResolver {
    ns: String,
    gateway: Arc<dyn StoreGateway>,
    clock: Arc<dyn Clock>,
    cache: DashMap<CacheKey, CacheEntry>,
    ttl_ms: i64,
}

impl ConfigResolver {
    #[must_use]
    pub fn new(ns: impl Into<String>, gateway: Arc<dyn StoreGateway>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            ns: ns.into(),
            gateway,
            clock,
            cache: DashMap::new(),
            ttl_ms: ttl.as_millis() as i64,
        }
    }

    /// Resolves effective limits and policy for `(entity_id, resource)`.
    ///
    /// When `explicit_limits` is `Some` and `use_stored_limits` is `false`,
    /// this never reads the store: the caller's limits are effective for
    /// this call only (spec §4.D step 1).
    pub async fn resolve(
        &self,
        entity_id: &str,
        resource: &str,
        explicit_limits: Option<&[Limit]>,
        use_stored_limits: bool,
    ) -> Result<ResolvedConfig, ResolveError> {
        if let Some(limits) = explicit_limits {
            if !use_stored_limits {
                return Ok(ResolvedConfig {
                    limits: limits.to_vec(),
                    on_unavailable: OnUnavailable::Deny,
                });
            }
        }

        let key = (entity_id.to_string(), resource.to_string());
        let cell = self.cached_cell(key);

        let result = cell
            .get_or_init(|| async { self.resolve_uncached(entity_id, resource).await.map_err(|_| ()) })
            .await
            .clone();

        match result {
            Ok(resolved) if !resolved.limits.is_empty() => Ok(resolved),
            Ok(resolved) => match explicit_limits {
                Some(limits) => Ok(ResolvedConfig {
                    limits: limits.to_vec(),
                    on_unavailable: resolved.on_unavailable,
                }),
                None => Err(ResolveError::Unconfigured {
                    on_unavailable: resolved.on_unavailable,
                }),
            },
            Err(()) => match explicit_limits {
                Some(limits) => Ok(ResolvedConfig {
                    limits: limits.to_vec(),
                    on_unavailable: OnUnavailable::default(),
                }),
                None => Err(ResolveError::Unconfigured {
                    on_unavailable: OnUnavailable::default(),
                }),
            },
        }
    }

    /// Looks up (or starts) the singleflight cell for `key`, evicting it
    /// first if its TTL has expired.
    fn cached_cell(&self, key: CacheKey) -> Arc<OnceCell<Result<ResolvedConfig, ()>>> {
        let now = self.clock.now_ms();
        if let Some(entry) = self.cache.get(&key) {
            if now - entry.inserted_at_ms < self.ttl_ms {
                return entry.cell.clone();
            }
        }
        let cell = Arc::new(OnceCell::new());
        self.cache.insert(
            key,
            CacheEntry {
                cell: cell.clone(),
                inserted_at_ms: now,
            },
        );
        cell
    }

    async fn resolve_uncached(&self, entity_id: &str, resource: &str) -> Result<ResolvedConfig, StoreError> {
        let entity_resource = self
            .gateway
            .get_config(&keyspace::entity_config_key(&self.ns, entity_id, resource))
            .await?;
        let resource_cfg = self.gateway.get_config(&keyspace::resource_config_key(&self.ns, resource)).await?;
        let system_cfg = self.gateway.get_config(&keyspace::system_config_key(&self.ns)).await?;

        let limits = entity_resource
            .as_ref()
            .filter(|c| !c.limits.is_empty())
            .or_else(|| resource_cfg.as_ref().filter(|c| !c.limits.is_empty()))
            .or_else(|| system_cfg.as_ref().filter(|c| !c.limits.is_empty()))
            .map(|c| c.limits.clone())
            .unwrap_or_default();

        let on_unavailable = entity_resource
            .as_ref()
            .and_then(|c| c.on_unavailable)
            .or_else(|| resource_cfg.as_ref().and_then(|c| c.on_unavailable))
            .or_else(|| system_cfg.as_ref().and_then(|c| c.on_unavailable))
            .unwrap_or_default();

        Ok(ResolvedConfig { limits, on_unavailable })
    }

    /// Best-effort same-process invalidation after an explicit
    /// `set_limits` / `set_resource_defaults` / `set_system_defaults`.
    /// Cross-process invalidation relies entirely on TTL expiry.
    pub fn invalidate(&self, entity_id: &str, resource: &str) {
        self.cache.remove(&(entity_id.to_string(), resource.to_string()));
    }

    /// Invalidates every cache entry for `resource` across all entities —
    /// used after `set_resource_defaults`, since any entity without its
    /// own entity-resource override may now see a different effective
    /// limit set. Best-effort, same-process only.
    pub fn invalidate_resource(&self, resource: &str) {
        self.cache.retain(|key, _| key.1 != resource);
    }

    /// Invalidates the entire cache — used after `set_system_defaults`,
    /// since it is the last fallback for every (entity, resource) pair.
    /// Best-effort, same-process only.
    pub fn invalidate_all(&self) {
        self.cache.clear();
    }

    /// Stores a config record directly via `put_config`, bypassing the
    /// transactional write path (config writes are not part of the
    /// bucket-mutation transaction protocol).
    pub async fn put(&self, key: &tbucket_core::keyspace::ItemKey, payload: ConfigPayload) -> Result<(), StoreError> {
        self.gateway.put_config(key, payload, false).await
    }

    /// Reads a config record directly, bypassing the cache (used by
    /// `get_limits` / `get_resource_defaults` / `get_system_defaults`,
    /// which must reflect the latest write, not a stale cache entry).
    pub async fn get(&self, key: &tbucket_core::keyspace::ItemKey) -> Result<Option<ConfigPayload>, StoreError> {
        self.gateway.get_config(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryGateway;
    use tbucket_core::clock::testing::FixedClock;

    fn resolver(ttl: Duration) -> (ConfigResolver, Arc<InMemoryGateway>, Arc<FixedClock>) {
        let gateway = Arc::new(InMemoryGateway::new());
        let clock = Arc::new(FixedClock::new(0));
        let resolver = ConfigResolver::new("ns1", gateway.clone(), clock.clone(), ttl);
        (resolver, gateway, clock)
    }

    #[tokio::test]
    async fn explicit_limits_win_without_store_read() {
        let (resolver, _gw, _clock) = resolver(Duration::from_secs(2));
        let limits = vec![Limit::per_minute("rpm", 5)];
        let resolved = resolver.resolve("u1", "api", Some(&limits), false).await.unwrap();
        assert_eq!(resolved.limits, limits);
    }

    #[tokio::test]
    async fn falls_back_through_layers() {
        let (resolver, gw, _clock) = resolver(Duration::from_secs(2));
        gw.put_config(
            &keyspace::system_config_key("ns1"),
            ConfigPayload {
                limits: vec![Limit::per_minute("rpm", 5)],
                on_unavailable: Some(OnUnavailable::Allow),
            },
            false,
        )
        .await
        .unwrap();

        let resolved = resolver.resolve("u1", "api", None, false).await.unwrap();
        assert_eq!(resolved.limits[0].capacity, 5);
        assert_eq!(resolved.on_unavailable, OnUnavailable::Allow);
    }

    #[tokio::test]
    async fn entity_resource_config_wins_over_system() {
        let (resolver, gw, _clock) = resolver(Duration::from_secs(2));
        gw.put_config(
            &keyspace::system_config_key("ns1"),
            ConfigPayload {
                limits: vec![Limit::per_minute("rpm", 5)],
                on_unavailable: None,
            },
            false,
        )
        .await
        .unwrap();
        gw.put_config(
            &keyspace::entity_config_key("ns1", "u1", "api"),
            ConfigPayload {
                limits: vec![Limit::per_minute("rpm", 50)],
                on_unavailable: None,
            },
            false,
        )
        .await
        .unwrap();

        let resolved = resolver.resolve("u1", "api", None, false).await.unwrap();
        assert_eq!(resolved.limits[0].capacity, 50);
    }

    #[tokio::test]
    async fn unconfigured_without_explicit_limits_errors() {
        let (resolver, _gw, _clock) = resolver(Duration::from_secs(2));
        let err = resolver.resolve("u1", "api", None, false).await.unwrap_err();
        assert!(matches!(err, ResolveError::Unconfigured { .. }));
    }

    #[tokio::test]
    async fn cache_expires_after_ttl() {
        let (resolver, gw, clock) = resolver(Duration::from_millis(100));
        gw.put_config(
            &keyspace::system_config_key("ns1"),
            ConfigPayload {
                limits: vec![Limit::per_minute("rpm", 5)],
                on_unavailable: None,
            },
            false,
        )
        .await
        .unwrap();
        let first = resolver.resolve("u1", "api", None, false).await.unwrap();
        assert_eq!(first.limits[0].capacity, 5);

        gw.put_config(
            &keyspace::system_config_key("ns1"),
            ConfigPayload {
                limits: vec![Limit::per_minute("rpm", 99)],
                on_unavailable: None,
            },
            false,
        )
        .await
        .unwrap();
        let cached = resolver.resolve("u1", "api", None, false).await.unwrap();
        assert_eq!(cached.limits[0].capacity, 5); // still cached

        clock.advance(200);
        let refreshed = resolver.resolve("u1", "api", None, false).await.unwrap();
        assert_eq!(refreshed.limits[0].capacity, 99);
    }

    #[tokio::test]
    async fn invalidate_forces_refresh_before_ttl() {
        let (resolver, gw, _clock) = resolver(Duration::from_secs(2));
        gw.put_config(
            &keyspace::system_config_key("ns1"),
            ConfigPayload {
                limits: vec![Limit::per_minute("rpm", 5)],
                on_unavailable: None,
            },
            false,
        )
        .await
        .unwrap();
        resolver.resolve("u1", "api", None, false).await.unwrap();

        gw.put_config(
            &keyspace::system_config_key("ns1"),
            ConfigPayload {
                limits: vec![Limit::per_minute("rpm", 7)],
                on_unavailable: None,
            },
            false,
        )
        .await
        .unwrap();
        resolver.invalidate("u1", "api");
        let refreshed = resolver.resolve("u1", "api", None, false).await.unwrap();
        assert_eq!(refreshed.limits[0].capacity, 7);
    }
}
