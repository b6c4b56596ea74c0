//! The top-level [`Limiter`] facade: owns the shared store gateway and
//! clock, registers/resolves namespaces, and exposes the unqualified
//! public surface as a thin delegation to the `default` namespace's
//! [`ScopedLimiter`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tbucket_core::clock::{Clock, SystemClock};
use tbucket_core::error::LimiterError;
use tbucket_core::limit::Limit;

use crate::acquire::AcquireRequest;
use crate::config::LimiterConfig;
use crate::entity::Entity;
use crate::lease::Lease;
use crate::namespace::{NamespaceScoper, ScopedLimiter, SystemDefaults};
use crate::store::{OnUnavailable, StoreGateway};

/// Entry point for the whole engine. Construct one per process (or per
/// tenant pool), share it across tasks — everything inside is `Send +
/// Sync` and safe to call concurrently.
pub struct Limiter {
    namespaces: NamespaceScoper,
    default: Arc<ScopedLimiter>,
}

impl Limiter {
    /// Builds a limiter over `gateway`, using the real wall clock and
    /// default tuning (spec §5's defaults).
    pub async fn new(gateway: Arc<dyn StoreGateway>) -> Result<Self, LimiterError> {
        Self::with_config(gateway, Arc::new(SystemClock), LimiterConfig::default()).await
    }

    /// Builds a limiter with an explicit clock and configuration, for
    /// tests or callers that need non-default tuning.
    pub async fn with_config(gateway: Arc<dyn StoreGateway>, clock: Arc<dyn Clock>, config: LimiterConfig) -> Result<Self, LimiterError> {
        let namespaces = NamespaceScoper::init(gateway, clock, config).await?;
        let default = namespaces.default_namespace().await?;
        Ok(Self { namespaces, default })
    }

    /// Registers a new namespace name and returns its id. Reserved names
    /// (`default`, and anything starting with `_`) cannot be registered.
    pub async fn register_namespace(&self, name: &str) -> Result<String, LimiterError> {
        self.namespaces.register(name).await
    }

    /// Resolves `name` to its scoped view. Every operation on the returned
    /// handle is isolated from every other namespace's keys.
    pub async fn namespace(&self, name: &str) -> Result<Arc<ScopedLimiter>, LimiterError> {
        self.namespaces.namespace(name).await
    }

    pub async fn acquire(&self, entity_id: &str, resource: &str, consume: &HashMap<String, i64>, req: &AcquireRequest) -> Result<Lease, LimiterError> {
        self.default.acquire(entity_id, resource, consume, req).await
    }

    pub async fn available(&self, entity_id: &str, resource: &str, limits: Option<&[Limit]>) -> Result<HashMap<String, i64>, LimiterError> {
        self.default.available(entity_id, resource, limits).await
    }

    pub async fn time_until_available(&self, entity_id: &str, resource: &str, needed: &HashMap<String, i64>, limits: Option<&[Limit]>) -> Result<f64, LimiterError> {
        self.default.time_until_available(entity_id, resource, needed, limits).await
    }

    pub async fn create_entity(
        &self,
        entity_id: &str,
        name: Option<String>,
        parent_id: Option<String>,
        metadata: HashMap<String, String>,
        cascade: bool,
    ) -> Result<Entity, LimiterError> {
        self.default.create_entity(entity_id, name, parent_id, metadata, cascade).await
    }

    pub async fn get_entity(&self, entity_id: &str) -> Result<Option<Entity>, LimiterError> {
        self.default.get_entity(entity_id).await
    }

    pub async fn get_children(&self, parent_id: &str) -> Result<Vec<String>, LimiterError> {
        self.default.get_children(parent_id).await
    }

    pub async fn delete_entity(&self, entity_id: &str) -> Result<(), LimiterError> {
        self.default.delete_entity(entity_id).await
    }

    pub async fn set_limits(&self, entity_id: &str, resource: &str, limits: Vec<Limit>) -> Result<(), LimiterError> {
        self.default.set_limits(entity_id, resource, limits).await
    }

    pub async fn get_limits(&self, entity_id: &str, resource: &str) -> Result<Vec<Limit>, LimiterError> {
        self.default.get_limits(entity_id, resource).await
    }

    pub async fn set_resource_defaults(&self, resource: &str, limits: Vec<Limit>) -> Result<(), LimiterError> {
        self.default.set_resource_defaults(resource, limits).await
    }

    pub async fn get_resource_defaults(&self, resource: &str) -> Result<Vec<Limit>, LimiterError> {
        self.default.get_resource_defaults(resource).await
    }

    pub async fn set_system_defaults(&self, limits: Vec<Limit>, on_unavailable: Option<OnUnavailable>) -> Result<(), LimiterError> {
        self.default.set_system_defaults(limits, on_unavailable).await
    }

    pub async fn get_system_defaults(&self) -> Result<SystemDefaults, LimiterError> {
        self.default.get_system_defaults().await
    }

    /// Never raises: a reachability probe, for health checks.
    pub async fn is_available(&self, timeout: Option<Duration>) -> bool {
        self.default.is_available(timeout).await
    }
}
