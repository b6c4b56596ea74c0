//! Pure key builders and parsers for the single-table keyspace.
//!
//! Every PK is namespace-prefixed (`<ns>/...`) except the `NAMESPACE#`
//! partition itself, which predates namespace resolution. All functions
//! here are total and side-effect free; nothing here touches a store.

/// Composite primary key of one item: partition key + sort key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemKey {
    pub pk: String,
    pub sk: String,
}

impl ItemKey {
    fn new(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
        }
    }
}

/// `<ns>/ENTITY#<entity-id>` / `#META` — the entity record.
#[must_use]
pub fn entity_key(ns: &str, entity_id: &str) -> ItemKey {
    ItemKey::new(format!("{ns}/ENTITY#{entity_id}"), "#META")
}

/// `<ns>/ENTITY#<entity-id>` / `#CONFIG#<resource>` — per-entity-per-resource limits.
#[must_use]
pub fn entity_config_key(ns: &str, entity_id: &str, resource: &str) -> ItemKey {
    ItemKey::new(format!("{ns}/ENTITY#{entity_id}"), format!("#CONFIG#{resource}"))
}

/// `<ns>/ENTITY#<entity-id>` / `BUCKET#<resource>#<limit-name>` — live bucket.
#[must_use]
pub fn bucket_key(ns: &str, entity_id: &str, resource: &str, limit_name: &str) -> ItemKey {
    ItemKey::new(format!("{ns}/ENTITY#{entity_id}"), format!("BUCKET#{resource}#{limit_name}"))
}

/// Extracts `(resource, limit_name)` from a bucket sort key, if it is one.
#[must_use]
pub fn parse_bucket_sk(sk: &str) -> Option<(&str, &str)> {
    let rest = sk.strip_prefix("BUCKET#")?;
    rest.split_once('#')
}

/// `<ns>/ENTITY#<entity-id>` / `#USAGE#<resource>#<window-start>` — usage snapshot.
///
/// Consumed by the out-of-scope aggregator; produced here only so the
/// engine can name the key it refreshes a TTL on, not so anything reads it.
#[must_use]
pub fn usage_key(ns: &str, entity_id: &str, resource: &str, window_start_ms: i64) -> ItemKey {
    ItemKey::new(format!("{ns}/ENTITY#{entity_id}"), format!("#USAGE#{resource}#{window_start_ms}"))
}

/// Extracts `(resource, window_start_ms)` from a usage sort key, if it is one.
#[must_use]
pub fn parse_usage_sk(sk: &str) -> Option<(&str, i64)> {
    let rest = sk.strip_prefix("#USAGE#")?;
    let (resource, window) = rest.rsplit_once('#')?;
    window.parse().ok().map(|w| (resource, w))
}

/// `<ns>/RESOURCE#<resource>` / `#CONFIG` — per-resource defaults.
#[must_use]
pub fn resource_config_key(ns: &str, resource: &str) -> ItemKey {
    ItemKey::new(format!("{ns}/RESOURCE#{resource}"), "#CONFIG")
}

/// `<ns>/SYSTEM#` / `#CONFIG` — system defaults.
#[must_use]
pub fn system_config_key(ns: &str) -> ItemKey {
    ItemKey::new(format!("{ns}/SYSTEM#"), "#CONFIG")
}

/// `NAMESPACE#` / `NAME#<name>` — name to namespace-id lookup. Unscoped:
/// this partition exists before any namespace-id is known.
#[must_use]
pub fn namespace_name_key(name: &str) -> ItemKey {
    ItemKey::new("NAMESPACE#", format!("NAME#{name}"))
}

/// `NAMESPACE#` / `ID#<id>` — namespace-id existence check.
#[must_use]
pub fn namespace_id_key(id: &str) -> ItemKey {
    ItemKey::new("NAMESPACE#", format!("ID#{id}"))
}

/// Secondary index: parent→children. PK = `<ns>/PARENT#<parent-id>`, SK = child entity-id.
#[must_use]
pub fn parent_children_index_key(ns: &str, parent_id: &str, child_id: &str) -> ItemKey {
    ItemKey::new(format!("{ns}/PARENT#{parent_id}"), child_id.to_string())
}

/// Secondary index: resource→entities (aggregator fan-out). PK =
/// `<ns>/RESOURCE#<resource>`, SK = the bucket/usage item's own sort key.
#[must_use]
pub fn resource_entities_index_key(ns: &str, resource: &str, item_sk: &str) -> ItemKey {
    ItemKey::new(format!("{ns}/RESOURCE#{resource}"), item_sk.to_string())
}

/// Secondary index: entity configs (listing per-entity configs). PK =
/// `<ns>/ENTITY_CONFIG#<entity-id>`, SK = resource.
#[must_use]
pub fn entity_config_index_key(ns: &str, entity_id: &str, resource: &str) -> ItemKey {
    ItemKey::new(format!("{ns}/ENTITY_CONFIG#{entity_id}"), resource.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_key_is_namespace_prefixed() {
        let k = entity_key("ns1", "u1");
        assert_eq!(k.pk, "ns1/ENTITY#u1");
        assert_eq!(k.sk, "#META");
    }

    #[test]
    fn bucket_key_roundtrips_through_parse() {
        let k = bucket_key("ns1", "u1", "gpt-4", "tpm");
        assert_eq!(k.sk, "BUCKET#gpt-4#tpm");
        assert_eq!(parse_bucket_sk(&k.sk), Some(("gpt-4", "tpm")));
    }

    #[test]
    fn parse_bucket_sk_rejects_other_categories() {
        assert_eq!(parse_bucket_sk("#META"), None);
        assert_eq!(parse_bucket_sk("#CONFIG#gpt-4"), None);
    }

    #[test]
    fn usage_key_roundtrips_through_parse() {
        let k = usage_key("ns1", "u1", "gpt-4", 120_000);
        assert_eq!(parse_usage_sk(&k.sk), Some(("gpt-4", 120_000)));
    }

    #[test]
    fn namespace_keys_are_unscoped() {
        assert_eq!(namespace_name_key("acme").pk, "NAMESPACE#");
        assert_eq!(namespace_id_key("abc123xyz00").pk, "NAMESPACE#");
    }

    #[test]
    fn distinct_namespaces_never_collide() {
        let a = bucket_key("ns-a", "u1", "gpt-4", "tpm");
        let b = bucket_key("ns-b", "u1", "gpt-4", "tpm");
        assert_ne!(a.pk, b.pk);
    }
}
