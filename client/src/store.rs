//! Durable store adapter.
//!
//! Generic keyed persistence with secondary indexes. Everything durable in
//! the client (the operation queue, conflicts, sync state, cached entities
//! and the cache mirror) sits on top of [`DurableStore`].
//!
//! `init` performs versioned schema migration: missing stores and indexes
//! are added, existing data is never destroyed. Batch writes apply fully or
//! not at all.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tillsync_engine::{EntityState, EntityType, Timestamp, Version};
use tokio::sync::RwLock;

/// Named stores used by the sync client.
pub const QUEUE_STORE: &str = "sync_queue";
pub const CONFLICT_STORE: &str = "conflicts";
pub const CONFLICT_ARCHIVE_STORE: &str = "conflict_archive";
pub const CACHE_STORE: &str = "cache_index";
pub const STATE_STORE: &str = "sync_state";
pub const ENTITY_STORE: &str = "entities";

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store not found: {0}")]
    UnknownStore(String),

    #[error("index not found: {0}.{1}")]
    UnknownIndex(String, String),

    #[error("schema regression: store is at v{current}, requested v{requested}")]
    SchemaRegression { current: u32, requested: u32 },

    #[error("storage io: {0}")]
    Io(String),

    #[error("corrupt store file: {0}")]
    Corrupt(String),

    #[error("serialization: {0}")]
    Serialization(String),
}

/// A secondary index over one payload field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDef {
    pub name: String,
    /// Top-level payload field the index reads
    pub field: String,
}

impl IndexDef {
    pub fn new(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field: field.into(),
        }
    }
}

/// A named store and its indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreDef {
    pub name: String,
    pub indexes: Vec<IndexDef>,
}

impl StoreDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, name: impl Into<String>, field: impl Into<String>) -> Self {
        self.indexes.push(IndexDef::new(name, field));
        self
    }
}

/// Versioned description of all named stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSchema {
    pub version: u32,
    pub stores: Vec<StoreDef>,
}

impl StoreSchema {
    /// The schema the sync client needs.
    pub fn sync_default() -> Self {
        Self {
            version: 1,
            stores: vec![
                StoreDef::new(QUEUE_STORE)
                    .with_index("by_scope", "scopeId")
                    .with_index("by_status", "status"),
                StoreDef::new(CONFLICT_STORE)
                    .with_index("by_entity_type", "entityType")
                    .with_index("by_resolved", "resolved"),
                StoreDef::new(CONFLICT_ARCHIVE_STORE).with_index("by_entity_type", "entityType"),
                StoreDef::new(CACHE_STORE),
                StoreDef::new(STATE_STORE),
                StoreDef::new(ENTITY_STORE).with_index("by_entity_type", "entityType"),
            ],
        }
    }
}

/// Generic keyed persistence with secondary indexes.
///
/// Per-operation failures propagate as `Err`; they are never swallowed.
/// `init` failures are fatal to the caller.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Idempotent versioned migration: adds missing stores and indexes,
    /// never destroys existing data.
    async fn init(&self, schema: &StoreSchema) -> Result<(), StoreError>;

    async fn get(&self, store: &str, id: &str) -> Result<Option<Value>, StoreError>;

    async fn get_all(&self, store: &str) -> Result<Vec<Value>, StoreError>;

    async fn put(&self, store: &str, id: &str, item: Value) -> Result<(), StoreError>;

    /// All-or-nothing batch write: no partial application is observable.
    async fn batch_put(&self, store: &str, items: Vec<(String, Value)>) -> Result<(), StoreError>;

    async fn delete(&self, store: &str, id: &str) -> Result<(), StoreError>;

    async fn clear_store(&self, store: &str) -> Result<(), StoreError>;

    /// Rows whose indexed field equals `value` (string form).
    async fn get_by_index(
        &self,
        store: &str,
        index: &str,
        value: &str,
    ) -> Result<Vec<Value>, StoreError>;
}

/// Typed helpers over the generic contract: one tagged record type per named
/// store, deserialized at the call site.
#[async_trait]
pub trait TypedStore: DurableStore {
    async fn get_typed<T: DeserializeOwned + Send>(
        &self,
        store: &str,
        id: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.get(store, id).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    async fn get_all_typed<T: DeserializeOwned + Send>(
        &self,
        store: &str,
    ) -> Result<Vec<T>, StoreError> {
        self.get_all(store)
            .await?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(|e| StoreError::Serialization(e.to_string())))
            .collect()
    }

    async fn get_by_index_typed<T: DeserializeOwned + Send>(
        &self,
        store: &str,
        index: &str,
        value: &str,
    ) -> Result<Vec<T>, StoreError> {
        self.get_by_index(store, index, value)
            .await?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(|e| StoreError::Serialization(e.to_string())))
            .collect()
    }

    async fn put_typed<T: Serialize + Sync>(
        &self,
        store: &str,
        id: &str,
        item: &T,
    ) -> Result<(), StoreError> {
        let value =
            serde_json::to_value(item).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.put(store, id, value).await
    }
}

impl<S: DurableStore + ?Sized> TypedStore for S {}

/// A local entity record as persisted in [`ENTITY_STORE`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEntity {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub data: Value,
    pub version: Version,
    pub updated_at: Timestamp,
    pub deleted: bool,
}

impl StoredEntity {
    pub fn key(entity_type: &str, entity_id: &str) -> String {
        format!("{entity_type}:{entity_id}")
    }

    pub fn as_entity_state(&self) -> EntityState {
        EntityState {
            data: self.data.clone(),
            version: self.version,
            updated_at: self.updated_at,
            deleted: self.deleted,
        }
    }
}

#[derive(Debug, Default)]
struct Shard {
    rows: BTreeMap<String, Value>,
    /// index name -> payload field
    indexes: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct Inner {
    version: u32,
    shards: HashMap<String, Shard>,
}

impl Inner {
    fn shard(&self, store: &str) -> Result<&Shard, StoreError> {
        self.shards
            .get(store)
            .ok_or_else(|| StoreError::UnknownStore(store.to_string()))
    }

    fn shard_mut(&mut self, store: &str) -> Result<&mut Shard, StoreError> {
        self.shards
            .get_mut(store)
            .ok_or_else(|| StoreError::UnknownStore(store.to_string()))
    }

    fn migrate(&mut self, schema: &StoreSchema) -> Result<(), StoreError> {
        if schema.version < self.version {
            return Err(StoreError::SchemaRegression {
                current: self.version,
                requested: schema.version,
            });
        }
        for def in &schema.stores {
            let shard = self.shards.entry(def.name.clone()).or_default();
            for index in &def.indexes {
                shard
                    .indexes
                    .entry(index.name.clone())
                    .or_insert_with(|| index.field.clone());
            }
        }
        self.version = schema.version;
        Ok(())
    }
}

/// Serialized form of the whole store, used by [`FileStore`].
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedStore {
    version: u32,
    shards: BTreeMap<String, PersistedShard>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedShard {
    indexes: BTreeMap<String, String>,
    rows: BTreeMap<String, Value>,
}

/// In-process implementation of the durable-store contract.
///
/// The single lock makes every batch write atomic by construction.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn export_persisted(&self) -> PersistedStore {
        let inner = self.inner.read().await;
        PersistedStore {
            version: inner.version,
            shards: inner
                .shards
                .iter()
                .map(|(name, shard)| {
                    (
                        name.clone(),
                        PersistedShard {
                            indexes: shard.indexes.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                            rows: shard.rows.clone(),
                        },
                    )
                })
                .collect(),
        }
    }

    async fn import_persisted(&self, persisted: PersistedStore) {
        let mut inner = self.inner.write().await;
        inner.version = persisted.version;
        inner.shards = persisted
            .shards
            .into_iter()
            .map(|(name, shard)| {
                (
                    name,
                    Shard {
                        rows: shard.rows,
                        indexes: shard.indexes.into_iter().collect(),
                    },
                )
            })
            .collect();
    }
}

fn index_matches(row: &Value, field: &str, value: &str) -> bool {
    match row.get(field) {
        Some(Value::String(s)) => s == value,
        Some(other) => other.to_string() == value,
        None => false,
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn init(&self, schema: &StoreSchema) -> Result<(), StoreError> {
        self.inner.write().await.migrate(schema)
    }

    async fn get(&self, store: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.shard(store)?.rows.get(id).cloned())
    }

    async fn get_all(&self, store: &str) -> Result<Vec<Value>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.shard(store)?.rows.values().cloned().collect())
    }

    async fn put(&self, store: &str, id: &str, item: Value) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.shard_mut(store)?.rows.insert(id.to_string(), item);
        Ok(())
    }

    async fn batch_put(&self, store: &str, items: Vec<(String, Value)>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        // Validate before touching anything so a failure leaves no partial
        // batch observable.
        let shard = inner.shard_mut(store)?;
        for (id, item) in items {
            shard.rows.insert(id, item);
        }
        Ok(())
    }

    async fn delete(&self, store: &str, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.shard_mut(store)?.rows.remove(id);
        Ok(())
    }

    async fn clear_store(&self, store: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.shard_mut(store)?.rows.clear();
        Ok(())
    }

    async fn get_by_index(
        &self,
        store: &str,
        index: &str,
        value: &str,
    ) -> Result<Vec<Value>, StoreError> {
        let inner = self.inner.read().await;
        let shard = inner.shard(store)?;
        let field = shard
            .indexes
            .get(index)
            .ok_or_else(|| StoreError::UnknownIndex(store.to_string(), index.to_string()))?;
        Ok(shard
            .rows
            .values()
            .filter(|row| index_matches(row, field, value))
            .cloned()
            .collect())
    }
}

/// JSON-file-backed implementation: a [`MemoryStore`] loaded at `init` and
/// rewritten atomically (write-temp-then-rename) after every mutation.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    mem: MemoryStore,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            mem: MemoryStore::new(),
        }
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let persisted = self.mem.export_persisted().await;
        let bytes =
            serde_json::to_vec(&persisted).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }

    async fn load(&self) -> Result<(), StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let persisted: PersistedStore = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                self.mem.import_persisted(persisted).await;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn init(&self, schema: &StoreSchema) -> Result<(), StoreError> {
        self.load().await?;
        self.mem.init(schema).await?;
        self.persist().await
    }

    async fn get(&self, store: &str, id: &str) -> Result<Option<Value>, StoreError> {
        self.mem.get(store, id).await
    }

    async fn get_all(&self, store: &str) -> Result<Vec<Value>, StoreError> {
        self.mem.get_all(store).await
    }

    async fn put(&self, store: &str, id: &str, item: Value) -> Result<(), StoreError> {
        self.mem.put(store, id, item).await?;
        self.persist().await
    }

    async fn batch_put(&self, store: &str, items: Vec<(String, Value)>) -> Result<(), StoreError> {
        self.mem.batch_put(store, items).await?;
        self.persist().await
    }

    async fn delete(&self, store: &str, id: &str) -> Result<(), StoreError> {
        self.mem.delete(store, id).await?;
        self.persist().await
    }

    async fn clear_store(&self, store: &str) -> Result<(), StoreError> {
        self.mem.clear_store(store).await?;
        self.persist().await
    }

    async fn get_by_index(
        &self,
        store: &str,
        index: &str,
        value: &str,
    ) -> Result<Vec<Value>, StoreError> {
        self.mem.get_by_index(store, index, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn ready_store() -> MemoryStore {
        let store = MemoryStore::new();
        store.init(&StoreSchema::sync_default()).await.unwrap();
        store
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let store = ready_store().await;
        store
            .put(QUEUE_STORE, "op-1", json!({"scopeId": "b1"}))
            .await
            .unwrap();

        // Re-running migration keeps existing data.
        store.init(&StoreSchema::sync_default()).await.unwrap();
        assert!(store.get(QUEUE_STORE, "op-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn migration_adds_new_stores_and_indexes() {
        let store = ready_store().await;
        store.put(ENTITY_STORE, "e-1", json!({"till": "2"})).await.unwrap();

        let mut schema = StoreSchema::sync_default();
        schema.version = 2;
        schema.stores.push(StoreDef::new("receipts").with_index("by_till", "till"));
        schema
            .stores
            .iter_mut()
            .find(|s| s.name == ENTITY_STORE)
            .unwrap()
            .indexes
            .push(IndexDef::new("by_till", "till"));

        store.init(&schema).await.unwrap();

        // New store exists and the new index works over pre-existing rows.
        assert!(store.get_all("receipts").await.unwrap().is_empty());
        let rows = store.get_by_index(ENTITY_STORE, "by_till", "2").await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn schema_regression_is_fatal() {
        let store = ready_store().await;
        let mut newer = StoreSchema::sync_default();
        newer.version = 3;
        store.init(&newer).await.unwrap();

        let result = store.init(&StoreSchema::sync_default()).await;
        assert!(matches!(
            result,
            Err(StoreError::SchemaRegression {
                current: 3,
                requested: 1
            })
        ));
    }

    #[tokio::test]
    async fn unknown_store_propagates() {
        let store = ready_store().await;
        assert!(matches!(
            store.get("nope", "x").await,
            Err(StoreError::UnknownStore(_))
        ));
        assert!(matches!(
            store.batch_put("nope", vec![("a".into(), json!(1))]).await,
            Err(StoreError::UnknownStore(_))
        ));
    }

    #[tokio::test]
    async fn batch_put_to_unknown_store_writes_nothing() {
        let store = ready_store().await;
        let result = store
            .batch_put("nope", vec![("a".into(), json!(1)), ("b".into(), json!(2))])
            .await;
        assert!(result.is_err());
        // Nothing leaked into any known store.
        for def in &StoreSchema::sync_default().stores {
            assert!(store.get_all(&def.name).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn get_by_index_matches_non_string_fields() {
        let store = ready_store().await;
        store
            .put(CONFLICT_STORE, "c-1", json!({"entityType": "order", "resolved": false}))
            .await
            .unwrap();
        store
            .put(CONFLICT_STORE, "c-2", json!({"entityType": "order", "resolved": true}))
            .await
            .unwrap();

        let unresolved = store
            .get_by_index(CONFLICT_STORE, "by_resolved", "false")
            .await
            .unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0]["entityType"], "order");
    }

    #[tokio::test]
    async fn unknown_index_propagates() {
        let store = ready_store().await;
        assert!(matches!(
            store.get_by_index(CACHE_STORE, "by_nothing", "x").await,
            Err(StoreError::UnknownIndex(_, _))
        ));
    }

    #[tokio::test]
    async fn typed_roundtrip() {
        let store = ready_store().await;
        let entity = StoredEntity {
            entity_type: "order".into(),
            entity_id: "order-1".into(),
            data: json!({"total": 10}),
            version: 3,
            updated_at: 1000,
            deleted: false,
        };

        let key = StoredEntity::key("order", "order-1");
        store.put_typed(ENTITY_STORE, &key, &entity).await.unwrap();

        let loaded: StoredEntity = store
            .get_typed(ENTITY_STORE, &key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, entity);

        let by_type: Vec<StoredEntity> = store
            .get_by_index_typed(ENTITY_STORE, "by_entity_type", "order")
            .await
            .unwrap();
        assert_eq!(by_type.len(), 1);
    }

    #[tokio::test]
    async fn clear_store_only_touches_one_store() {
        let store = ready_store().await;
        store.put(QUEUE_STORE, "op-1", json!({})).await.unwrap();
        store.put(ENTITY_STORE, "e-1", json!({})).await.unwrap();

        store.clear_store(QUEUE_STORE).await.unwrap();
        assert!(store.get_all(QUEUE_STORE).await.unwrap().is_empty());
        assert_eq!(store.get_all(ENTITY_STORE).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("till.json");

        {
            let store = FileStore::new(&path);
            store.init(&StoreSchema::sync_default()).await.unwrap();
            store
                .put(QUEUE_STORE, "op-1", json!({"scopeId": "b1", "status": "pending"}))
                .await
                .unwrap();
        }

        let reopened = FileStore::new(&path);
        reopened.init(&StoreSchema::sync_default()).await.unwrap();
        let row = reopened.get(QUEUE_STORE, "op-1").await.unwrap().unwrap();
        assert_eq!(row["scopeId"], "b1");

        let by_scope = reopened
            .get_by_index(QUEUE_STORE, "by_scope", "b1")
            .await
            .unwrap();
        assert_eq!(by_scope.len(), 1);
    }

    #[tokio::test]
    async fn file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("till.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();

        let store = FileStore::new(&path);
        let result = store.init(&StoreSchema::sync_default()).await;
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
    }
}
