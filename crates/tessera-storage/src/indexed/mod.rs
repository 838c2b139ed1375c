//! Indexed backend adapter.
//!
//! Maps every table to an object store of an [`IndexedDatabase`] keyed by the
//! table's key field, with one secondary index per declared index field.
//! Opening at a higher version than the one stored runs a version-change
//! transaction that creates missing stores and indexes and then hands control
//! to an optional [`MigrationFn`].
//!
//! Every multi-record operation runs in a single engine transaction, so it is
//! all-or-nothing. Transaction commits additionally check that no other
//! writer touched the affected stores since the snapshot was taken.

mod engine;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

pub use self::engine::{
    Cursor, IndexedDatabase, ObjectStore, Transaction, TransactionMode, UpgradeTransaction,
};
use crate::adapter::{BackendKind, StorageAdapter, TableChanges, TableSnapshot};
use crate::error::{StorageError, StorageResult};
use crate::expiry::{Clock, with_expiry};
use crate::key::Key;
use crate::schema::Schema;

/// Caller-supplied migration run inside the version-change transaction.
///
/// Receives the transaction, the old version (0 for a new database), the new
/// version, and the schema being opened. Runs after missing stores and
/// indexes have been created. Returning an error aborts the whole upgrade.
pub type MigrationFn =
    Arc<dyn Fn(&mut UpgradeTransaction, u32, u32, &Schema) -> StorageResult<()> + Send + Sync>;

/// [`StorageAdapter`] over an [`IndexedDatabase`].
pub struct IndexedAdapter {
    db: Arc<IndexedDatabase>,
    schema: Arc<Schema>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for IndexedAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexedAdapter")
            .field("database", &self.db.name())
            .field("tables", &self.schema.len())
            .finish_non_exhaustive()
    }
}

impl IndexedAdapter {
    /// Open `db` at `version`, upgrading it to match `schema` when needed.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Version`] if `version` is below the stored version
    /// - [`StorageError::Schema`] if a table has no matching object store
    ///   after opening, or its store is keyed by a different field
    /// - whatever `migration` returns
    ///
    /// Indexes declared on an existing store are only built by an upgrade.
    /// Opening at the stored version with extra indexes logs a warning, and
    /// lookups on those fields fall back to a scan.
    pub async fn open(
        db: Arc<IndexedDatabase>,
        schema: Arc<Schema>,
        version: u32,
        migration: Option<MigrationFn>,
        clock: Arc<dyn Clock>,
    ) -> StorageResult<Self> {
        let upgraded = db
            .upgrade(version, |tx| {
                for table in schema.tables() {
                    if !tx.contains_object_store(table.name()) {
                        tx.create_object_store(table.name(), table.key())?;
                    }
                    for field in table.indexes() {
                        tx.create_index(table.name(), field)?;
                    }
                }
                if let Some(migrate) = &migration {
                    let (old, new) = (tx.old_version(), tx.new_version());
                    migrate(tx, old, new, schema.as_ref())?;
                }
                Ok(())
            })
            .await?;
        if upgraded {
            info!(database = db.name(), version, "Indexed database upgraded");
        }

        for table in schema.tables() {
            match db.key_path(table.name()).await {
                None => {
                    return Err(StorageError::Schema {
                        table: table.name().to_owned(),
                        message: format!(
                            "no object store at version {version}; \
                             open with a higher version to create it"
                        ),
                    });
                },
                Some(key_path) if key_path != table.key() => {
                    return Err(StorageError::Schema {
                        table: table.name().to_owned(),
                        message: format!(
                            "object store is keyed by '{key_path}', schema declares '{}'",
                            table.key()
                        ),
                    });
                },
                Some(_) => {},
            }

            let existing = db.index_names(table.name()).await.unwrap_or_default();
            let missing: Vec<&str> = table
                .indexes()
                .iter()
                .map(String::as_str)
                .filter(|field| !existing.iter().any(|e| e.as_str() == *field))
                .collect();
            if !missing.is_empty() {
                warn!(
                    database = db.name(),
                    table = table.name(),
                    version,
                    missing = ?missing,
                    "Declared indexes are not built; open with a higher version to create them"
                );
            }
        }

        Ok(Self { db, schema, clock })
    }

    /// The underlying database.
    #[must_use]
    pub fn database(&self) -> &Arc<IndexedDatabase> {
        &self.db
    }

    /// Drain the live records of `table`, evicting expired rows on the way.
    fn live_records(tx: &mut Transaction<'_>, table: &str, now: i64) -> StorageResult<Vec<Value>> {
        let mut live = Vec::new();
        let mut expired = Vec::new();
        for (key, entry) in tx.cursor(table)? {
            if entry.is_expired(now) {
                expired.push(key.clone());
            } else {
                live.push(entry.value.clone());
            }
        }
        Self::evict(tx, table, &expired)?;
        Ok(live)
    }

    fn evict(tx: &mut Transaction<'_>, table: &str, keys: &[Key]) -> StorageResult<()> {
        if !keys.is_empty() {
            debug!(table, count = keys.len(), "Evicting expired rows");
        }
        for key in keys {
            tx.evict(table, key)?;
        }
        Ok(())
    }

    async fn write_tx(&self, table: &str) -> StorageResult<Transaction<'_>> {
        let table = self.schema.require(table)?;
        self.db
            .transaction(&[table.name()], TransactionMode::ReadWrite)
            .await
    }
}

#[async_trait]
impl StorageAdapter for IndexedAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Indexed
    }

    async fn get(&self, table: &str, key: &Key) -> StorageResult<Option<Value>> {
        let table = self.schema.require(table)?.name();
        let now = self.clock.now_millis();
        {
            let tx = self
                .db
                .transaction(&[table], TransactionMode::ReadOnly)
                .await?;
            match tx.get(table, key)? {
                None => return Ok(None),
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {},
            }
        }

        // Expired: re-check under the write lock before evicting.
        let mut tx = self
            .db
            .transaction(&[table], TransactionMode::ReadWrite)
            .await?;
        if tx.get(table, key)?.is_some_and(|entry| entry.is_expired(now)) {
            debug!(table, %key, "Evicting expired row");
            tx.evict(table, key)?;
            tx.commit()?;
            return Ok(None);
        }
        Ok(tx.get(table, key)?.map(|entry| entry.value.clone()))
    }

    async fn get_all(&self, table: &str) -> StorageResult<Vec<Value>> {
        let now = self.clock.now_millis();
        let mut tx = self.write_tx(table).await?;
        let records = Self::live_records(&mut tx, table, now)?;
        tx.commit()?;
        Ok(records)
    }

    async fn put(&self, table: &str, record: Value, ttl: Option<Duration>) -> StorageResult<()> {
        let schema = self.schema.require(table)?;
        Key::extract(schema.name(), schema.key(), &record)?;
        let entry = with_expiry(record, ttl, self.clock.now_millis());

        let mut tx = self.write_tx(table).await?;
        let key = tx.put(table, entry)?;
        tx.commit()?;
        debug!(table, %key, "Stored record");
        Ok(())
    }

    async fn bulk_put(
        &self,
        table: &str,
        records: Vec<Value>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        let schema = self.schema.require(table)?;
        for record in &records {
            Key::extract(schema.name(), schema.key(), record)?;
        }
        let now = self.clock.now_millis();
        let count = records.len();

        let mut tx = self.write_tx(table).await?;
        for record in records {
            tx.put(table, with_expiry(record, ttl, now))?;
        }
        tx.commit()?;
        debug!(table, count, "Stored records");
        Ok(())
    }

    async fn delete(&self, table: &str, key: &Key) -> StorageResult<()> {
        let mut tx = self.write_tx(table).await?;
        if tx.delete(table, key)? {
            tx.commit()?;
        }
        Ok(())
    }

    async fn bulk_delete(&self, table: &str, keys: &[Key]) -> StorageResult<()> {
        let mut tx = self.write_tx(table).await?;
        for key in keys {
            tx.delete(table, key)?;
        }
        tx.commit()
    }

    async fn clear(&self, table: &str) -> StorageResult<()> {
        let mut tx = self.write_tx(table).await?;
        let removed = tx.clear(table)?;
        tx.commit()?;
        debug!(table, removed, "Cleared table");
        Ok(())
    }

    async fn count(&self, table: &str) -> StorageResult<usize> {
        Ok(self.get_all(table).await?.len())
    }

    async fn find_by_index(
        &self,
        table: &str,
        field: &str,
        value: &Value,
    ) -> StorageResult<Vec<Value>> {
        let now = self.clock.now_millis();
        let mut tx = self.write_tx(table).await?;

        let Some(keys) = tx.lookup(table, field, value)? else {
            // Not indexed: a filtered scan.
            let records = Self::live_records(&mut tx, table, now)?;
            tx.commit()?;
            return Ok(records
                .into_iter()
                .filter(|record| record.get(field) == Some(value))
                .collect());
        };

        let mut live = Vec::with_capacity(keys.len());
        let mut expired = Vec::new();
        for key in keys {
            match tx.get(table, &key)? {
                Some(entry) if entry.is_expired(now) => expired.push(key),
                Some(entry) => live.push(entry.value.clone()),
                None => {},
            }
        }
        Self::evict(&mut tx, table, &expired)?;
        tx.commit()?;
        Ok(live)
    }

    async fn snapshot(&self, tables: &[String]) -> StorageResult<Vec<TableSnapshot>> {
        for table in tables {
            self.schema.require(table)?;
        }
        let now = self.clock.now_millis();
        let mut tx = self
            .db
            .transaction(tables, TransactionMode::ReadWrite)
            .await?;

        let mut snapshots = Vec::with_capacity(tables.len());
        for table in tables {
            let records = Self::live_records(&mut tx, table, now)?;
            snapshots.push(TableSnapshot {
                table: table.clone(),
                records,
                revision: Some(tx.revision(table)?),
            });
        }
        tx.commit()?;
        Ok(snapshots)
    }

    async fn commit(
        &self,
        changes: Vec<TableChanges>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        let mut tables = Vec::with_capacity(changes.len());
        for change in &changes {
            let schema = self.schema.require(&change.table)?;
            for record in &change.upserts {
                Key::extract(schema.name(), schema.key(), record)?;
            }
            tables.push(change.table.clone());
        }
        let now = self.clock.now_millis();

        let mut tx = self
            .db
            .transaction(&tables, TransactionMode::ReadWrite)
            .await?;
        for change in changes {
            if let Some(expected) = change.expected_revision
                && tx.revision(&change.table)? != expected
            {
                return Err(StorageError::Conflict {
                    table: change.table,
                });
            }
            debug!(
                table = %change.table,
                deletes = change.deletes.len(),
                upserts = change.upserts.len(),
                "Applying transaction writes"
            );
            for key in &change.deletes {
                tx.delete(&change.table, key)?;
            }
            for record in change.upserts {
                tx.put(&change.table, with_expiry(record, ttl, now))?;
            }
        }
        tx.commit()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::expiry::ManualClock;
    use crate::schema::TableDefinition;

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new([
                ("users", TableDefinition::keyed("id").with_index("city")),
                ("posts", TableDefinition::keyed("slug")),
            ])
            .unwrap(),
        )
    }

    async fn make_adapter() -> (IndexedAdapter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let adapter = IndexedAdapter::open(
            IndexedDatabase::memory("app"),
            schema(),
            1,
            None,
            clock.clone(),
        )
        .await
        .unwrap();
        (adapter, clock)
    }

    #[tokio::test]
    async fn test_open_creates_stores_and_indexes() {
        let (adapter, _clock) = make_adapter().await;
        let db = adapter.database();
        assert_eq!(db.object_store_names().await, vec!["posts", "users"]);
        assert_eq!(db.index_names("users").await.unwrap(), vec!["city"]);
        assert_eq!(db.key_path("posts").await.unwrap(), "slug");
    }

    #[tokio::test]
    async fn test_migration_receives_versions() {
        let db = IndexedDatabase::memory("app");
        let seen = Arc::new(std::sync::Mutex::new(None));
        let sink = seen.clone();
        let migration: MigrationFn = Arc::new(
            move |tx: &mut UpgradeTransaction, old: u32, new: u32, schema: &Schema| {
                *sink.lock().unwrap() = Some((old, new, schema.len()));
                tx.put("users", json!({ "id": 1, "city": "Oslo" }))?;
                Ok(())
            },
        );
        let adapter = IndexedAdapter::open(
            db,
            schema(),
            3,
            Some(migration),
            Arc::new(ManualClock::new(0)),
        )
        .await
        .unwrap();

        assert_eq!(*seen.lock().unwrap(), Some((0, 3, 2)));
        assert_eq!(adapter.count("users").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failing_migration_aborts_open() {
        let db = IndexedDatabase::memory("app");
        let migration: MigrationFn = Arc::new(
            |_: &mut UpgradeTransaction, _: u32, _: u32, _: &Schema| {
                Err(StorageError::Internal("nope".into()))
            },
        );
        let err = IndexedAdapter::open(
            db.clone(),
            schema(),
            1,
            Some(migration),
            Arc::new(ManualClock::new(0)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StorageError::Internal(_)));
        assert_eq!(db.version().await, 0);
        assert!(db.object_store_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_lower_version_rejected() {
        let db = IndexedDatabase::memory("app");
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        IndexedAdapter::open(db.clone(), schema(), 2, None, clock.clone())
            .await
            .unwrap();
        let err = IndexedAdapter::open(db, schema(), 1, None, clock)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Version { requested: 1, stored: 2 }));
    }

    #[tokio::test]
    async fn test_new_table_without_version_bump_rejected() {
        let db = IndexedDatabase::memory("app");
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let narrow = Arc::new(Schema::new([("users", TableDefinition::keyed("id"))]).unwrap());
        IndexedAdapter::open(db.clone(), narrow, 1, None, clock.clone())
            .await
            .unwrap();

        let err = IndexedAdapter::open(db.clone(), schema(), 1, None, clock.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Schema { ref table, .. } if table == "posts"));

        IndexedAdapter::open(db, schema(), 2, None, clock)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_new_index_without_version_bump_falls_back_to_scan() {
        let db = IndexedDatabase::memory("app");
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let plain = Arc::new(
            Schema::new([
                ("users", TableDefinition::keyed("id")),
                ("posts", TableDefinition::keyed("slug")),
            ])
            .unwrap(),
        );
        let adapter = IndexedAdapter::open(db.clone(), plain, 1, None, clock.clone())
            .await
            .unwrap();
        adapter
            .put("users", json!({ "id": 1, "city": "Paris" }), None)
            .await
            .unwrap();

        let adapter = IndexedAdapter::open(db.clone(), schema(), 1, None, clock.clone())
            .await
            .unwrap();
        assert!(db.index_names("users").await.unwrap().is_empty());
        let paris = adapter
            .find_by_index("users", "city", &json!("Paris"))
            .await
            .unwrap();
        assert_eq!(paris.len(), 1);

        IndexedAdapter::open(db.clone(), schema(), 2, None, clock)
            .await
            .unwrap();
        assert_eq!(db.index_names("users").await.unwrap(), vec!["city"]);
    }

    #[tokio::test]
    async fn test_expired_rows_are_evicted_on_read() {
        let (adapter, clock) = make_adapter().await;
        adapter
            .put("users", json!({ "id": 1 }), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        adapter.put("users", json!({ "id": 2 }), None).await.unwrap();
        assert_eq!(adapter.count("users").await.unwrap(), 2);

        clock.advance(Duration::from_millis(10));
        assert_eq!(adapter.get("users", &Key::from(1)).await.unwrap(), None);
        assert_eq!(adapter.get_all("users").await.unwrap(), vec![json!({ "id": 2 })]);

        let tx = adapter
            .database()
            .transaction(&["users"], TransactionMode::ReadOnly)
            .await
            .unwrap();
        assert!(tx.get("users", &Key::from(1)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bulk_put_validates_before_writing() {
        let (adapter, _clock) = make_adapter().await;
        let err = adapter
            .bulk_put(
                "users",
                vec![json!({ "id": 1 }), json!({ "name": "no key" })],
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::MissingKey { .. }));
        assert_eq!(adapter.count("users").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_find_by_index_uses_index_and_scan() {
        let (adapter, _clock) = make_adapter().await;
        adapter
            .bulk_put(
                "users",
                vec![
                    json!({ "id": 1, "city": "Paris", "age": 30 }),
                    json!({ "id": 2, "city": "Lyon", "age": 30 }),
                    json!({ "id": 3, "city": "Paris", "age": 41 }),
                ],
                None,
            )
            .await
            .unwrap();

        let paris = adapter
            .find_by_index("users", "city", &json!("Paris"))
            .await
            .unwrap();
        assert_eq!(paris.len(), 2);

        let thirty = adapter
            .find_by_index("users", "age", &json!(30))
            .await
            .unwrap();
        assert_eq!(thirty.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_absent_key_is_ok() {
        let (adapter, _clock) = make_adapter().await;
        adapter.delete("users", &Key::from(99)).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_detects_conflict() {
        let (adapter, _clock) = make_adapter().await;
        let snapshot = adapter.snapshot(&["users".to_owned()]).await.unwrap();
        let revision = snapshot[0].revision;

        adapter.put("users", json!({ "id": 1 }), None).await.unwrap();

        let err = adapter
            .commit(
                vec![TableChanges {
                    table: "users".into(),
                    upserts: vec![json!({ "id": 2 })],
                    deletes: vec![],
                    expected_revision: revision,
                }],
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict { ref table } if table == "users"));
        assert_eq!(adapter.get("users", &Key::from(2)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_commit_spans_tables_atomically() {
        let (adapter, _clock) = make_adapter().await;
        let err = adapter
            .commit(
                vec![
                    TableChanges {
                        table: "users".into(),
                        upserts: vec![json!({ "id": 1 })],
                        ..TableChanges::default()
                    },
                    TableChanges {
                        table: "posts".into(),
                        upserts: vec![json!({ "title": "no slug" })],
                        ..TableChanges::default()
                    },
                ],
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::MissingKey { .. }));
        assert_eq!(adapter.count("users").await.unwrap(), 0);
    }
}
