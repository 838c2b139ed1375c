//! Flat backend adapter.
//!
//! Every record is one entry in a [`KvStore`], addressed by the composite key
//! `{db}:{version}:{table}:{key}` and holding the JSON envelope
//! `{ "value": …, "expiresAt": … }`.
//!
//! # Guarantees
//!
//! The underlying store has no transactions and no batch primitive:
//!
//! - `bulk_put` / `bulk_delete` validate their input up front, then write
//!   entry by entry. An I/O failure mid-batch leaves the earlier entries
//!   written; nothing is rolled back.
//! - Transaction commits apply table by table with the same caveat, and
//!   writes that land between a transaction's snapshot and its commit are
//!   silently overwritten.
//!
//! Entries that fail to decode are treated as absent, removed, and logged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::adapter::{BackendKind, StorageAdapter, TableChanges, TableSnapshot};
use crate::error::{StorageError, StorageResult};
use crate::expiry::{Clock, StoredEntry, with_expiry};
use crate::key::Key;
use crate::schema::{Schema, TableSchema};

/// [`StorageAdapter`] over a flat [`KvStore`](crate::kv::KvStore).
pub struct FlatAdapter {
    store: Arc<dyn crate::kv::KvStore>,
    schema: Arc<Schema>,
    db_name: String,
    version: u32,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for FlatAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatAdapter")
            .field("db_name", &self.db_name)
            .field("version", &self.version)
            .field("tables", &self.schema.len())
            .finish_non_exhaustive()
    }
}

impl FlatAdapter {
    /// Bind a flat store to a schema under `{db_name}:{version}`.
    #[must_use]
    pub fn new(
        store: Arc<dyn crate::kv::KvStore>,
        schema: Arc<Schema>,
        db_name: impl Into<String>,
        version: u32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            schema,
            db_name: db_name.into(),
            version,
            clock,
        }
    }

    /// The underlying key-value store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn crate::kv::KvStore> {
        &self.store
    }

    /// Prefix shared by every entry of `table`: `{db}:{version}:{table}:`.
    #[must_use]
    pub fn table_prefix(&self, table: &str) -> String {
        format!("{}:{}:{table}:", self.db_name, self.version)
    }

    /// Physical key of a record: `{db}:{version}:{table}:{key}`.
    #[must_use]
    pub fn storage_key(&self, table: &str, key: &Key) -> String {
        format!("{}:{}:{table}:{key}", self.db_name, self.version)
    }

    /// Serialize an envelope.
    fn encode(entry: &StoredEntry) -> StorageResult<Vec<u8>> {
        serde_json::to_vec(entry).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// Deserialize an envelope read from `physical_key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::CorruptedRecord`] if the bytes are not a JSON
    /// envelope around an object.
    pub fn decode(physical_key: &str, bytes: &[u8]) -> StorageResult<StoredEntry> {
        let entry: StoredEntry =
            serde_json::from_slice(bytes).map_err(|e| StorageError::CorruptedRecord {
                key: physical_key.to_owned(),
                reason: e.to_string(),
            })?;
        if !entry.value.is_object() {
            return Err(StorageError::CorruptedRecord {
                key: physical_key.to_owned(),
                reason: "envelope value is not an object".into(),
            });
        }
        Ok(entry)
    }

    /// Validate a record and build its physical key and encoded envelope.
    fn prepare(
        &self,
        table: &TableSchema,
        record: Value,
        ttl: Option<Duration>,
        now: i64,
    ) -> StorageResult<(String, Vec<u8>)> {
        let key = Key::extract(table.name(), table.key(), &record)?;
        let entry = with_expiry(record, ttl, now);
        Ok((self.storage_key(table.name(), &key), Self::encode(&entry)?))
    }

    /// Read one entry, evicting it if it is expired or corrupted.
    async fn read_live(&self, physical_key: &str) -> StorageResult<Option<Value>> {
        let Some(bytes) = self.store.get(physical_key).await? else {
            return Ok(None);
        };

        let entry = match Self::decode(physical_key, &bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = physical_key, error = %e, "Removing corrupted entry");
                self.store.delete(physical_key).await?;
                return Ok(None);
            },
        };

        if entry.is_expired(self.clock.now_millis()) {
            debug!(key = physical_key, "Evicting expired entry");
            self.store.delete(physical_key).await?;
            return Ok(None);
        }

        Ok(Some(entry.into_value()))
    }

    /// Every live record of a table, in physical key order.
    async fn live_records(&self, table: &TableSchema) -> StorageResult<Vec<Value>> {
        let keys = self.store.list_keys(&self.table_prefix(table.name())).await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.read_live(&key).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl StorageAdapter for FlatAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Flat
    }

    async fn get(&self, table: &str, key: &Key) -> StorageResult<Option<Value>> {
        let table = self.schema.require(table)?;
        self.read_live(&self.storage_key(table.name(), key)).await
    }

    async fn get_all(&self, table: &str) -> StorageResult<Vec<Value>> {
        let table = self.schema.require(table)?;
        self.live_records(table).await
    }

    async fn put(&self, table: &str, record: Value, ttl: Option<Duration>) -> StorageResult<()> {
        let table = self.schema.require(table)?;
        let (physical_key, bytes) = self.prepare(table, record, ttl, self.clock.now_millis())?;
        debug!(key = %physical_key, "Writing entry");
        self.store.set(&physical_key, bytes).await
    }

    async fn bulk_put(
        &self,
        table: &str,
        records: Vec<Value>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        let table = self.schema.require(table)?;
        let now = self.clock.now_millis();
        let prepared = records
            .into_iter()
            .map(|record| self.prepare(table, record, ttl, now))
            .collect::<StorageResult<Vec<_>>>()?;

        debug!(table = table.name(), count = prepared.len(), "Writing entries");
        for (physical_key, bytes) in prepared {
            self.store.set(&physical_key, bytes).await?;
        }
        Ok(())
    }

    async fn delete(&self, table: &str, key: &Key) -> StorageResult<()> {
        let table = self.schema.require(table)?;
        self.store
            .delete(&self.storage_key(table.name(), key))
            .await?;
        Ok(())
    }

    async fn bulk_delete(&self, table: &str, keys: &[Key]) -> StorageResult<()> {
        let table = self.schema.require(table)?;
        for key in keys {
            self.store
                .delete(&self.storage_key(table.name(), key))
                .await?;
        }
        Ok(())
    }

    async fn clear(&self, table: &str) -> StorageResult<()> {
        let table = self.schema.require(table)?;
        let removed = self
            .store
            .clear_prefix(&self.table_prefix(table.name()))
            .await?;
        debug!(table = table.name(), removed, "Cleared table");
        Ok(())
    }

    async fn count(&self, table: &str) -> StorageResult<usize> {
        let table = self.schema.require(table)?;
        Ok(self.live_records(table).await?.len())
    }

    async fn find_by_index(
        &self,
        table: &str,
        field: &str,
        value: &Value,
    ) -> StorageResult<Vec<Value>> {
        let table = self.schema.require(table)?;
        // Indexes are advisory here: a filtered scan.
        let records = self.live_records(table).await?;
        Ok(records
            .into_iter()
            .filter(|record| record.get(field) == Some(value))
            .collect())
    }

    async fn snapshot(&self, tables: &[String]) -> StorageResult<Vec<TableSnapshot>> {
        let mut snapshots = Vec::with_capacity(tables.len());
        for name in tables {
            let table = self.schema.require(name)?;
            snapshots.push(TableSnapshot {
                table: name.clone(),
                records: self.live_records(table).await?,
                revision: None,
            });
        }
        Ok(snapshots)
    }

    async fn commit(
        &self,
        changes: Vec<TableChanges>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        let now = self.clock.now_millis();

        // Encode everything first so a malformed record writes nothing.
        let mut plan = Vec::with_capacity(changes.len());
        for change in changes {
            let table = self.schema.require(&change.table)?;
            let deletes: Vec<String> = change
                .deletes
                .iter()
                .map(|key| self.storage_key(table.name(), key))
                .collect();
            let upserts = change
                .upserts
                .into_iter()
                .map(|record| self.prepare(table, record, ttl, now))
                .collect::<StorageResult<Vec<_>>>()?;
            plan.push((change.table, deletes, upserts));
        }

        for (table, deletes, upserts) in plan {
            debug!(
                table = %table,
                deletes = deletes.len(),
                upserts = upserts.len(),
                "Applying transaction writes"
            );
            for physical_key in deletes {
                self.store.delete(&physical_key).await?;
            }
            for (physical_key, bytes) in upserts {
                self.store.set(&physical_key, bytes).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::expiry::ManualClock;
    use crate::kv::{KvStore, MemoryKvStore};
    use crate::schema::TableDefinition;

    fn make_adapter() -> (FlatAdapter, Arc<MemoryKvStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryKvStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let schema = Arc::new(
            Schema::new([
                ("users", TableDefinition::keyed("id").with_index("age")),
                ("posts", TableDefinition::keyed("slug")),
            ])
            .unwrap(),
        );
        let adapter = FlatAdapter::new(store.clone(), schema, "app", 2, clock.clone());
        (adapter, store, clock)
    }

    #[tokio::test]
    async fn test_physical_key_layout() {
        let (adapter, store, _clock) = make_adapter();
        adapter
            .put("users", json!({ "id": 7, "name": "Ada" }), None)
            .await
            .unwrap();

        let raw = store.get("app:2:users:7").await.unwrap().unwrap();
        let envelope: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(envelope, json!({ "value": { "id": 7, "name": "Ada" } }));
    }

    #[tokio::test]
    async fn test_expiry_written_into_envelope() {
        let (adapter, store, _clock) = make_adapter();
        adapter
            .put("users", json!({ "id": 1 }), Some(Duration::from_millis(500)))
            .await
            .unwrap();

        let raw = store.get("app:2:users:1").await.unwrap().unwrap();
        let envelope: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(envelope["expiresAt"], json!(1_500));
    }

    #[tokio::test]
    async fn test_expired_entry_evicted_on_get() {
        let (adapter, store, clock) = make_adapter();
        adapter
            .put("users", json!({ "id": 1 }), Some(Duration::from_millis(10)))
            .await
            .unwrap();

        clock.advance(Duration::from_millis(10));
        assert!(adapter.get("users", &Key::from(1)).await.unwrap().is_none());
        assert!(store.get("app:2:users:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupted_entry_skipped_and_removed() {
        let (adapter, store, _clock) = make_adapter();
        adapter
            .bulk_put("users", vec![json!({ "id": 1 }), json!({ "id": 2 })], None)
            .await
            .unwrap();
        store
            .set("app:2:users:2", b"{not json".to_vec())
            .await
            .unwrap();

        let all = adapter.get_all("users").await.unwrap();
        assert_eq!(all, vec![json!({ "id": 1 })]);
        assert!(store.get("app:2:users:2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_all_only_reads_table_prefix() {
        let (adapter, store, _clock) = make_adapter();
        adapter.put("users", json!({ "id": 1 }), None).await.unwrap();
        adapter
            .put("posts", json!({ "slug": "hello" }), None)
            .await
            .unwrap();
        // Same table under another version is invisible.
        store
            .set("app:1:users:9", br#"{"value":{"id":9}}"#.to_vec())
            .await
            .unwrap();

        assert_eq!(adapter.get_all("users").await.unwrap(), vec![json!({ "id": 1 })]);
        assert_eq!(adapter.count("posts").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bulk_put_validates_before_writing() {
        let (adapter, store, _clock) = make_adapter();
        let err = adapter
            .bulk_put("users", vec![json!({ "id": 1 }), json!({ "name": "no key" })], None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::MissingKey { .. }));
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_clear_leaves_other_tables() {
        let (adapter, _store, _clock) = make_adapter();
        adapter.put("users", json!({ "id": 1 }), None).await.unwrap();
        adapter.put("posts", json!({ "slug": "a" }), None).await.unwrap();

        adapter.clear("users").await.unwrap();
        assert_eq!(adapter.count("users").await.unwrap(), 0);
        assert_eq!(adapter.count("posts").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_find_by_index_scans() {
        let (adapter, _store, _clock) = make_adapter();
        adapter
            .bulk_put(
                "users",
                vec![
                    json!({ "id": 1, "age": 30 }),
                    json!({ "id": 2, "age": 40 }),
                    json!({ "id": 3, "age": 30 }),
                ],
                None,
            )
            .await
            .unwrap();

        let found = adapter
            .find_by_index("users", "age", &json!(30))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_table() {
        let (adapter, _store, _clock) = make_adapter();
        assert!(matches!(
            adapter.get_all("ghosts").await,
            Err(StorageError::UnknownTable(_))
        ));
    }

    #[test]
    fn test_decode_rejects_non_object_value() {
        let err = FlatAdapter::decode("k", br#"{"value":42}"#).unwrap_err();
        assert!(matches!(err, StorageError::CorruptedRecord { .. }));
    }
}
