//! Entity records: rate-limited principals (users, API keys, projects).
//!
//! Mirrors the teacher's `RecordStore` CRUD shape (`get`/`put` over a
//! single backing store) but without the CRDT merge, versioning, or
//! eviction machinery that shape carries for mutable replicated state —
//! an entity record here is plain, namespace-owned, single-writer data.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tbucket_core::error::{LimiterError, ValidationError};
use tbucket_core::keyspace;
use tbucket_core::validation;

use crate::store::{store_error_to_limiter, Index, SkPredicate, StoreError, StoreGateway};

/// A rate-limited principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: Option<String>,
    pub parent_id: Option<String>,
    pub metadata: HashMap<String, String>,
    pub cascade: bool,
}

/// CRUD + hierarchy queries over entity records, namespace-scoped.
pub struct EntityRepo {
    ns: String,
    gateway: Arc<dyn StoreGateway>,
}

impl EntityRepo {
    #[must_use]
    pub fn new(ns: impl Into<String>, gateway: Arc<dyn StoreGateway>) -> Self {
        Self { ns: ns.into(), gateway }
    }

    /// Creates a new entity. Validates `entity_id`, checks the parent
    /// resolves in the same namespace with no grandparent, and rejects an
    /// entity naming itself as its own parent.
    pub async fn create(
        &self,
        entity_id: &str,
        name: Option<String>,
        parent_id: Option<String>,
        metadata: HashMap<String, String>,
        cascade: bool,
    ) -> Result<Entity, LimiterError> {
        validation::validate_identifier("entity_id", entity_id).map_err(LimiterError::from)?;

        if let Some(parent) = &parent_id {
            if parent == entity_id {
                return Err(LimiterError::Validation(ValidationError::new(
                    "parent_id",
                    parent.clone(),
                    "an entity cannot be its own parent",
                )));
            }
            let parent_entity = self.get(parent).await.map_err(LimiterError::Transport)?;
            let Some(parent_entity) = parent_entity else {
                return Err(LimiterError::EntityNotFound(parent.clone()));
            };
            if parent_entity.parent_id.is_some() {
                return Err(LimiterError::Validation(ValidationError::new(
                    "parent_id",
                    parent.clone(),
                    "parent chain length must be at most 1 (no grandparents)",
                )));
            }
        }

        let key = keyspace::entity_key(&self.ns, entity_id);
        let entity = Entity {
            id: entity_id.to_string(),
            name,
            parent_id: parent_id.clone(),
            metadata,
            cascade,
        };
        let payload = serde_json::to_value(&entity).expect("Entity is always serializable");
        self.gateway
            .put_item(&key, payload, true)
            .await
            .map_err(|e| match e {
                StoreError::Conflict => LimiterError::EntityExists(entity_id.to_string()),
                StoreError::Transport(e) => LimiterError::Transport(e),
            })?;

        if let Some(parent) = parent_id {
            let index_key = keyspace::parent_children_index_key(&self.ns, &parent, entity_id);
            self.gateway
                .put_item(&index_key, serde_json::Value::Null, false)
                .await
                .map_err(store_error_to_limiter)?;
        }

        Ok(entity)
    }

    /// Fetches an entity record, or `None` if it doesn't exist.
    pub async fn get(&self, entity_id: &str) -> Result<Option<Entity>, anyhow::Error> {
        let key = keyspace::entity_key(&self.ns, entity_id);
        let Some(payload) = self.gateway.get_item(&key).await.map_err(anyhow::Error::from)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(payload)?))
    }

    /// Lists the direct children of `parent_id` via the parent→children
    /// secondary index.
    pub async fn get_children(&self, parent_id: &str) -> Result<Vec<String>, LimiterError> {
        let pk = keyspace::parent_children_index_key(&self.ns, parent_id, "").pk;
        let items = self
            .gateway
            .query(Index::ParentChildren, &pk, SkPredicate::BeginsWith(String::new()), None)
            .await
            .map_err(store_error_to_limiter)?;
        Ok(items.into_iter().map(|item| item.key.sk).collect())
    }

    /// Deletes an entity record. Does not cascade to its buckets or
    /// configs — those evict on their own TTL; does not remove it from
    /// the parent→children index eagerly for the same reason a real
    /// store's secondary indexes aren't kept strictly consistent with a
    /// best-effort delete path.
    pub async fn delete(&self, entity_id: &str) -> Result<(), anyhow::Error> {
        let key = keyspace::entity_key(&self.ns, entity_id);
        self.gateway
            .transact_write(vec![crate::store::WriteOp::Delete { key }])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryGateway;

    fn repo() -> EntityRepo {
        EntityRepo::new("ns1", Arc::new(InMemoryGateway::new()))
    }

    #[tokio::test]
    async fn create_then_get_roundtrips() {
        let repo = repo();
        repo.create("u1", Some("Alice".into()), None, HashMap::new(), false).await.unwrap();
        let entity = repo.get("u1").await.unwrap().unwrap();
        assert_eq!(entity.name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn duplicate_create_fails() {
        let repo = repo();
        repo.create("u1", None, None, HashMap::new(), false).await.unwrap();
        let err = repo.create("u1", None, None, HashMap::new(), false).await.unwrap_err();
        assert!(matches!(err, LimiterError::EntityExists(_)));
    }

    #[tokio::test]
    async fn self_parent_is_rejected() {
        let repo = repo();
        let err = repo.create("u1", None, Some("u1".into()), HashMap::new(), false).await.unwrap_err();
        assert!(matches!(err, LimiterError::Validation(_)));
    }

    #[tokio::test]
    async fn grandparent_is_rejected() {
        let repo = repo();
        repo.create("grandparent", None, None, HashMap::new(), false).await.unwrap();
        repo.create("parent", None, Some("grandparent".into()), HashMap::new(), false).await.unwrap();
        let err = repo.create("child", None, Some("parent".into()), HashMap::new(), false).await.unwrap_err();
        assert!(matches!(err, LimiterError::Validation(_)));
    }

    #[tokio::test]
    async fn children_are_listed_via_index() {
        let repo = repo();
        repo.create("proj", None, None, HashMap::new(), false).await.unwrap();
        repo.create("k1", None, Some("proj".into()), HashMap::new(), true).await.unwrap();
        repo.create("k2", None, Some("proj".into()), HashMap::new(), true).await.unwrap();
        let mut children = repo.get_children("proj").await.unwrap();
        children.sort();
        assert_eq!(children, vec!["k1".to_string(), "k2".to_string()]);
    }
}
