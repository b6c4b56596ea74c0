//! DynamoDB-backed [`StoreGateway`].
//!
//! Single-table design: `PK`/`SK` composite key, three global secondary
//! indexes (`parent_children_index`, `resource_entities_index`,
//! `entity_configs_index`) matching the keyspace's three secondary-index
//! partitions. Bucket items use the bit-exact attribute layout the config
//! resolver and acquire engine assume (`tokens_milli`, `last_refill_ms`,
//! `capacity_milli`, `burst_milli`, `refill_amount_milli`,
//! `refill_period_ms`, `ttl`); config items store one attribute per limit
//! name (`l_<name>_cp` / `_br` / `_ra` / `_rp`) plus an optional
//! `on_unavailable` string. Everything else (entity records, namespace
//! mappings) is a single JSON-encoded `data` string attribute.
//!
//! The table must already exist with `ttl` configured as the TTL
//! attribute; this gateway never issues `CreateTable`.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use tbucket_core::bucket::BucketSnapshot;
use tbucket_core::keyspace::ItemKey;
use tbucket_core::limit::Limit;

use super::gateway::{
    BucketCondition, ConfigPayload, Index, ItemPayload, OnUnavailable, QueryItem, SkPredicate, StoreError, StoreGateway, WriteOp,
};

/// DynamoDB-backed store gateway.
#[derive(Debug, Clone)]
pub struct DynamoDbGateway {
    client: Client,
    table_name: String,
}

impl DynamoDbGateway {
    /// Builds a gateway from a pre-constructed client. The table must carry
    /// a `PK`/`SK` composite key and the three secondary indexes named in
    /// the module docs.
    #[must_use]
    pub fn new(client: Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }

    /// Builds a gateway using the standard AWS SDK config chain
    /// (environment, profile, or IMDS credentials) and a default table name.
    pub async fn from_env() -> Self {
        Self::from_env_with_table("tbucket").await
    }

    /// Like [`Self::from_env`] with an explicit table name.
    pub async fn from_env_with_table(table_name: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let client = Client::new(&config);
        Self::new(client, table_name)
    }

    fn index_name(index: Index) -> &'static str {
        match index {
            Index::ParentChildren => "parent_children_index",
            Index::ResourceEntities => "resource_entities_index",
            Index::EntityConfigs => "entity_configs_index",
        }
    }
}

fn map_sdk_error(err: impl std::error::Error + Send + Sync + 'static) -> StoreError {
    StoreError::Transport(anyhow::Error::new(err))
}

fn n(value: i64) -> AttributeValue {
    AttributeValue::N(value.to_string())
}

fn get_n(item: &HashMap<String, AttributeValue>, attr: &str) -> Option<i64> {
    item.get(attr)?.as_n().ok()?.parse().ok()
}

fn bucket_from_item(item: &HashMap<String, AttributeValue>) -> Option<BucketSnapshot> {
    Some(BucketSnapshot {
        tokens_milli: get_n(item, "tokens_milli")?,
        last_refill_ms: get_n(item, "last_refill_ms")?,
        capacity_milli: get_n(item, "capacity_milli")?,
        burst_milli: get_n(item, "burst_milli")?,
        refill_amount_milli: get_n(item, "refill_amount_milli")?,
        refill_period_ms: get_n(item, "refill_period_ms")?,
    })
}

fn bucket_to_item(key: &ItemKey, snapshot: &BucketSnapshot, ttl_epoch_s: i64) -> HashMap<String, AttributeValue> {
    HashMap::from([
        ("PK".to_string(), AttributeValue::S(key.pk.clone())),
        ("SK".to_string(), AttributeValue::S(key.sk.clone())),
        ("tokens_milli".to_string(), n(snapshot.tokens_milli)),
        ("last_refill_ms".to_string(), n(snapshot.last_refill_ms)),
        ("capacity_milli".to_string(), n(snapshot.capacity_milli)),
        ("burst_milli".to_string(), n(snapshot.burst_milli)),
        ("refill_amount_milli".to_string(), n(snapshot.refill_amount_milli)),
        ("refill_period_ms".to_string(), n(snapshot.refill_period_ms)),
        ("ttl".to_string(), n(ttl_epoch_s)),
    ])
}

/// Encodes a config payload as one `l_<name>_{cp,br,ra,rp}` attribute group
/// per limit, plus an optional `on_unavailable` string.
fn config_to_item(key: &ItemKey, payload: &ConfigPayload) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::from([
        ("PK".to_string(), AttributeValue::S(key.pk.clone())),
        ("SK".to_string(), AttributeValue::S(key.sk.clone())),
    ]);
    for limit in &payload.limits {
        item.insert(format!("l_{}_cp", limit.name), n(limit.capacity));
        item.insert(format!("l_{}_br", limit.name), n(limit.burst));
        item.insert(format!("l_{}_ra", limit.name), n(limit.refill_amount));
        item.insert(format!("l_{}_rp", limit.name), n(limit.refill_period_ms));
    }
    if let Some(policy) = payload.on_unavailable {
        let s = match policy {
            OnUnavailable::Allow => "allow",
            OnUnavailable::Deny => "deny",
        };
        item.insert("on_unavailable".to_string(), AttributeValue::S(s.to_string()));
    }
    item
}

fn config_from_item(item: &HashMap<String, AttributeValue>) -> ConfigPayload {
    let mut names: Vec<&str> = Vec::new();
    for key in item.keys() {
        if let Some(rest) = key.strip_prefix("l_") {
            if let Some(name) = rest.strip_suffix("_cp") {
                names.push(name);
            }
        }
    }
    let limits = names
        .into_iter()
        .filter_map(|name| {
            let cp = get_n(item, &format!("l_{name}_cp"))?;
            let br = get_n(item, &format!("l_{name}_br"))?;
            let ra = get_n(item, &format!("l_{name}_ra"))?;
            let rp = get_n(item, &format!("l_{name}_rp"))?;
            Some(Limit::new(name, cp, br, ra, rp))
        })
        .collect();
    let on_unavailable = item.get("on_unavailable").and_then(|v| v.as_s().ok()).and_then(|s| match s.as_str() {
        "allow" => Some(OnUnavailable::Allow),
        "deny" => Some(OnUnavailable::Deny),
        _ => None,
    });
    ConfigPayload { limits, on_unavailable }
}

fn item_payload_to_item(key: &ItemKey, payload: &ItemPayload) -> Result<HashMap<String, AttributeValue>, StoreError> {
    let data = serde_json::to_string(payload).map_err(map_sdk_error)?;
    Ok(HashMap::from([
        ("PK".to_string(), AttributeValue::S(key.pk.clone())),
        ("SK".to_string(), AttributeValue::S(key.sk.clone())),
        ("data".to_string(), AttributeValue::S(data)),
    ]))
}

fn item_payload_from_item(item: &HashMap<String, AttributeValue>) -> Result<ItemPayload, StoreError> {
    let data = item.get("data").and_then(|v| v.as_s().ok()).ok_or_else(|| {
        StoreError::Transport(anyhow::anyhow!("missing 'data' attribute"))
    })?;
    serde_json::from_str(data).map_err(map_sdk_error)
}

#[async_trait]
impl StoreGateway for DynamoDbGateway {
    async fn get_bucket(&self, key: &ItemKey) -> Result<Option<BucketSnapshot>, StoreError> {
        let result = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(key.pk.clone()))
            .key("SK", AttributeValue::S(key.sk.clone()))
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(result.item().and_then(bucket_from_item))
    }

    async fn batch_get_buckets(&self, keys: &[ItemKey]) -> Result<HashMap<ItemKey, BucketSnapshot>, StoreError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let request_keys: Vec<HashMap<String, AttributeValue>> = keys
            .iter()
            .map(|k| {
                HashMap::from([
                    ("PK".to_string(), AttributeValue::S(k.pk.clone())),
                    ("SK".to_string(), AttributeValue::S(k.sk.clone())),
                ])
            })
            .collect();

        let keys_and_attrs = aws_sdk_dynamodb::types::KeysAndAttributes::builder()
            .set_keys(Some(request_keys))
            .build()
            .map_err(|e| StoreError::Transport(anyhow::Error::new(e)))?;

        let result = self
            .client
            .batch_get_item()
            .request_items(&self.table_name, keys_and_attrs)
            .send()
            .await
            .map_err(map_sdk_error)?;

        let mut out = HashMap::new();
        if let Some(responses) = result.responses() {
            if let Some(items) = responses.get(&self.table_name) {
                for item in items {
                    let pk = item.get("PK").and_then(|v| v.as_s().ok());
                    let sk = item.get("SK").and_then(|v| v.as_s().ok());
                    if let (Some(pk), Some(sk), Some(snapshot)) = (pk, sk, bucket_from_item(item)) {
                        out.insert(ItemKey { pk: pk.clone(), sk: sk.clone() }, snapshot);
                    }
                }
            }
        }
        Ok(out)
    }

    async fn get_item(&self, key: &ItemKey) -> Result<Option<ItemPayload>, StoreError> {
        let result = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(key.pk.clone()))
            .key("SK", AttributeValue::S(key.sk.clone()))
            .send()
            .await
            .map_err(map_sdk_error)?;
        result.item().map(item_payload_from_item).transpose()
    }

    async fn put_item(&self, key: &ItemKey, payload: ItemPayload, expect_absent: bool) -> Result<(), StoreError> {
        let mut builder = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item_payload_to_item(key, &payload)?));
        if expect_absent {
            builder = builder.condition_expression("attribute_not_exists(PK)");
        }
        builder.send().await.map_err(|e| classify_put_error(e))?;
        Ok(())
    }

    async fn get_config(&self, key: &ItemKey) -> Result<Option<ConfigPayload>, StoreError> {
        let result = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(key.pk.clone()))
            .key("SK", AttributeValue::S(key.sk.clone()))
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(result.item().map(config_from_item))
    }

    async fn put_config(&self, key: &ItemKey, payload: ConfigPayload, expect_absent: bool) -> Result<(), StoreError> {
        let mut builder = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(config_to_item(key, &payload)));
        if expect_absent {
            builder = builder.condition_expression("attribute_not_exists(PK)");
        }
        builder.send().await.map_err(|e| classify_put_error(e))?;
        Ok(())
    }

    async fn transact_write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        use aws_sdk_dynamodb::types::{Delete, Put, TransactWriteItem, Update};

        let mut items = Vec::with_capacity(ops.len());
        for op in ops {
            let item = match op {
                WriteOp::PutBucket { key, snapshot, ttl_epoch_s, condition } => {
                    let mut builder = Put::builder()
                        .table_name(&self.table_name)
                        .set_item(Some(bucket_to_item(&key, &snapshot, ttl_epoch_s)));
                    builder = apply_bucket_condition(builder, condition);
                    TransactWriteItem::builder()
                        .put(builder.build().map_err(|e| StoreError::Transport(anyhow::Error::new(e)))?)
                        .build()
                }
                WriteOp::PutConfig { key, payload, expect_absent } => {
                    let mut builder = Put::builder().table_name(&self.table_name).set_item(Some(config_to_item(&key, &payload)));
                    if expect_absent {
                        builder = builder.condition_expression("attribute_not_exists(PK)");
                    }
                    TransactWriteItem::builder()
                        .put(builder.build().map_err(|e| StoreError::Transport(anyhow::Error::new(e)))?)
                        .build()
                }
                WriteOp::PutItem { key, payload, expect_absent } => {
                    let mut builder = Put::builder()
                        .table_name(&self.table_name)
                        .set_item(Some(item_payload_to_item(&key, &payload)?));
                    if expect_absent {
                        builder = builder.condition_expression("attribute_not_exists(PK)");
                    }
                    TransactWriteItem::builder()
                        .put(builder.build().map_err(|e| StoreError::Transport(anyhow::Error::new(e)))?)
                        .build()
                }
                WriteOp::Delete { key } => TransactWriteItem::builder()
                    .delete(
                        Delete::builder()
                            .table_name(&self.table_name)
                            .key("PK", AttributeValue::S(key.pk))
                            .key("SK", AttributeValue::S(key.sk))
                            .build()
                            .map_err(|e| StoreError::Transport(anyhow::Error::new(e)))?,
                    )
                    .build(),
                WriteOp::ConditionCheck { key, condition } => {
                    let mut builder = aws_sdk_dynamodb::types::ConditionCheck::builder()
                        .table_name(&self.table_name)
                        .key("PK", AttributeValue::S(key.pk))
                        .key("SK", AttributeValue::S(key.sk));
                    builder = apply_condition_check(builder, condition);
                    TransactWriteItem::builder()
                        .condition_check(builder.build().map_err(|e| StoreError::Transport(anyhow::Error::new(e)))?)
                        .build()
                }
            };
            items.push(item);
        }

        self.client
            .transact_write_items()
            .set_transact_items(Some(items))
            .send()
            .await
            .map_err(|err| {
                if err.as_service_error().is_some_and(|e| e.is_transaction_canceled_exception()) {
                    StoreError::Conflict
                } else {
                    map_sdk_error(err)
                }
            })?;
        Ok(())
    }

    async fn query(
        &self,
        index: Index,
        pk: &str,
        sk_predicate: SkPredicate,
        limit: Option<usize>,
    ) -> Result<Vec<QueryItem>, StoreError> {
        let mut out = Vec::new();
        let mut exclusive_start_key = None;

        loop {
            let mut query = self
                .client
                .query()
                .table_name(&self.table_name)
                .index_name(Self::index_name(index))
                .key_condition_expression(match &sk_predicate {
                    SkPredicate::BeginsWith(_) => "PK = :pk AND begins_with(SK, :sk)",
                    SkPredicate::Exact(_) => "PK = :pk AND SK = :sk",
                })
                .expression_attribute_values(":pk", AttributeValue::S(pk.to_string()))
                .expression_attribute_values(
                    ":sk",
                    AttributeValue::S(match &sk_predicate {
                        SkPredicate::BeginsWith(prefix) => prefix.clone(),
                        SkPredicate::Exact(exact) => exact.clone(),
                    }),
                );
            if let Some(start_key) = exclusive_start_key.take() {
                query = query.set_exclusive_start_key(Some(start_key));
            }

            let output = query.send().await.map_err(map_sdk_error)?;
            for item in output.items() {
                let pk_val = item.get("PK").and_then(|v| v.as_s().ok());
                let sk_val = item.get("SK").and_then(|v| v.as_s().ok());
                if let (Some(pk_val), Some(sk_val)) = (pk_val, sk_val) {
                    let payload = if item.contains_key("data") {
                        item_payload_from_item(item)?
                    } else if item.contains_key("tokens_milli") {
                        serde_json::to_value(bucket_from_item(item)).map_err(map_sdk_error)?
                    } else {
                        serde_json::to_value(config_from_item(item)).map_err(map_sdk_error)?
                    };
                    out.push(QueryItem {
                        key: ItemKey { pk: pk_val.clone(), sk: sk_val.clone() },
                        payload,
                    });
                    if let Some(limit) = limit {
                        if out.len() >= limit {
                            return Ok(out);
                        }
                    }
                }
            }

            match output.last_evaluated_key() {
                Some(last_key) if !last_key.is_empty() => exclusive_start_key = Some(last_key.clone()),
                _ => break,
            }
        }
        Ok(out)
    }
}

fn apply_bucket_condition(
    builder: aws_sdk_dynamodb::types::builders::PutBuilder,
    condition: BucketCondition,
) -> aws_sdk_dynamodb::types::builders::PutBuilder {
    match condition {
        BucketCondition::None => builder,
        BucketCondition::AbsentOrLastRefillMs(seen_ms) => builder
            .condition_expression("attribute_not_exists(PK) OR last_refill_ms = :seen_ms")
            .expression_attribute_values(":seen_ms", n(seen_ms)),
    }
}

fn apply_condition_check(
    builder: aws_sdk_dynamodb::types::builders::ConditionCheckBuilder,
    condition: BucketCondition,
) -> aws_sdk_dynamodb::types::builders::ConditionCheckBuilder {
    match condition {
        BucketCondition::None => builder.condition_expression("attribute_exists(PK)"),
        BucketCondition::AbsentOrLastRefillMs(seen_ms) => builder
            .condition_expression("attribute_not_exists(PK) OR last_refill_ms = :seen_ms")
            .expression_attribute_values(":seen_ms", n(seen_ms)),
    }
}

fn classify_put_error(err: aws_sdk_dynamodb::error::SdkError<aws_sdk_dynamodb::operation::put_item::PutItemError>) -> StoreError {
    if err.as_service_error().is_some_and(|e| e.is_conditional_check_failed_exception()) {
        StoreError::Conflict
    } else {
        map_sdk_error(err)
    }
}
