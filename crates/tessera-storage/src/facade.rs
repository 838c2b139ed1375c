//! The public storage facade.
//!
//! [`Storage`] validates its options, binds exactly one backend adapter, and
//! exposes every record operation plus queries, transactions, and ordered
//! patch batches on top of it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::adapter::{BackendKind, StorageAdapter};
use crate::error::{BoxError, StorageError, StorageResult};
use crate::expiry::{Clock, SystemClock};
use crate::flat::FlatAdapter;
use crate::indexed::{IndexedAdapter, IndexedDatabase, MigrationFn};
use crate::key::Key;
use crate::kv::{KvStore, MemoryKvStore};
use crate::query::Query;
use crate::schema::{Schema, TableDefinition};
use crate::transaction::{TransactionContext, TransactionCoordinator};

/// Everything needed to open a [`Storage`].
#[derive(Clone)]
pub struct StorageOptions {
    /// Which backend to bind.
    pub backend: BackendKind,
    /// Database name; also the first segment of flat keys.
    pub db_name: String,
    /// Schema version, at least 1.
    pub version: u32,
    /// Raw table definitions, validated on open.
    pub schema: BTreeMap<String, TableDefinition>,
    /// Upgrade hook for the indexed backend. The flat backend ignores it.
    pub migration: Option<MigrationFn>,
    /// Time source for expiry.
    pub clock: Arc<dyn Clock>,
    /// Indexed database to open; in-memory when unset.
    pub indexed_database: Option<Arc<IndexedDatabase>>,
    /// Flat store to use; in-memory when unset.
    pub kv_store: Option<Arc<dyn KvStore>>,
}

impl std::fmt::Debug for StorageOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageOptions")
            .field("backend", &self.backend)
            .field("db_name", &self.db_name)
            .field("version", &self.version)
            .field("schema", &self.schema)
            .field("migration", &self.migration.is_some())
            .finish_non_exhaustive()
    }
}

impl StorageOptions {
    /// Options with in-memory backends and the system clock.
    pub fn new<I, S>(
        backend: BackendKind,
        db_name: impl Into<String>,
        version: u32,
        schema: I,
    ) -> Self
    where
        I: IntoIterator<Item = (S, TableDefinition)>,
        S: Into<String>,
    {
        Self {
            backend,
            db_name: db_name.into(),
            version,
            schema: schema.into_iter().map(|(n, d)| (n.into(), d)).collect(),
            migration: None,
            clock: Arc::new(SystemClock),
            indexed_database: None,
            kv_store: None,
        }
    }

    /// Set the indexed upgrade hook.
    #[must_use]
    pub fn with_migration(mut self, migration: MigrationFn) -> Self {
        self.migration = Some(migration);
        self
    }

    /// Set the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use an existing indexed database.
    #[must_use]
    pub fn with_indexed_database(mut self, db: Arc<IndexedDatabase>) -> Self {
        self.indexed_database = Some(db);
        self
    }

    /// Use an existing flat store.
    #[must_use]
    pub fn with_kv_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.kv_store = Some(store);
        self
    }

    /// Check the database name and version.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] for an empty database name, a name
    /// containing `:`, or a version of 0.
    pub fn validate(&self) -> StorageResult<()> {
        if self.db_name.is_empty() {
            return Err(StorageError::Config("db_name must not be empty".into()));
        }
        if self.db_name.contains(':') {
            return Err(StorageError::Config(format!(
                "db_name '{}' must not contain ':'",
                self.db_name
            )));
        }
        if self.version == 0 {
            return Err(StorageError::Config("version must be at least 1".into()));
        }
        Ok(())
    }
}

mod ttl_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub(super) fn serialize<S: Serializer>(
        ttl: &Option<Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match ttl {
            Some(d) => s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// One step of a [`Storage::patch`] batch.
///
/// Serializes as `{ "type": "put", "record": …, "ttlMs": … }`,
/// `{ "type": "delete", "key": … }`, or `{ "type": "clear" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PatchOperation {
    /// Insert or replace a record.
    Put {
        /// The record.
        record: Value,
        /// Optional time-to-live.
        #[serde(
            rename = "ttlMs",
            default,
            with = "ttl_millis",
            skip_serializing_if = "Option::is_none"
        )]
        ttl: Option<Duration>,
    },
    /// Delete a record by key.
    Delete {
        /// The key.
        key: Key,
    },
    /// Remove every record.
    Clear,
}

/// Unified storage over one backend.
#[derive(Debug, Clone)]
pub struct Storage {
    adapter: Arc<dyn StorageAdapter>,
    schema: Arc<Schema>,
    db_name: String,
    version: u32,
}

impl Storage {
    /// Validate `options` and bind the selected backend.
    ///
    /// Name, version, and schema are checked before any backend I/O.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Config`] for a bad name or version
    /// - [`StorageError::Schema`] for a malformed table definition
    /// - any error raised while opening or upgrading the indexed database
    pub async fn open(options: StorageOptions) -> StorageResult<Self> {
        options.validate()?;
        let schema = Arc::new(Schema::new(options.schema)?);

        let adapter: Arc<dyn StorageAdapter> = match options.backend {
            BackendKind::Indexed => {
                let db = options
                    .indexed_database
                    .unwrap_or_else(|| IndexedDatabase::memory(options.db_name.clone()));
                Arc::new(
                    IndexedAdapter::open(
                        db,
                        schema.clone(),
                        options.version,
                        options.migration,
                        options.clock,
                    )
                    .await?,
                )
            },
            BackendKind::Flat => {
                if options.migration.is_some() {
                    debug!(db = %options.db_name, "Flat backend ignores the migration hook");
                }
                let store = options
                    .kv_store
                    .unwrap_or_else(|| Arc::new(MemoryKvStore::new()) as Arc<dyn KvStore>);
                Arc::new(FlatAdapter::new(
                    store,
                    schema.clone(),
                    options.db_name.clone(),
                    options.version,
                    options.clock,
                ))
            },
        };

        info!(
            backend = %options.backend,
            db = %options.db_name,
            version = options.version,
            tables = schema.len(),
            "Storage opened"
        );

        Ok(Self {
            adapter,
            schema,
            db_name: options.db_name,
            version: options.version,
        })
    }

    /// Bound backend.
    #[must_use]
    pub fn backend(&self) -> BackendKind {
        self.adapter.kind()
    }

    /// Validated schema.
    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Database name.
    #[must_use]
    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    /// Schema version.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// The bound adapter.
    #[must_use]
    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.adapter
    }

    /// Get a live record.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownTable`] or a backend error.
    pub async fn get(&self, table: &str, key: impl Into<Key>) -> StorageResult<Option<Value>> {
        self.adapter.get(table, &key.into()).await
    }

    /// Get a live record, or `default` when absent or expired.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownTable`] or a backend error.
    pub async fn get_or(
        &self,
        table: &str,
        key: impl Into<Key>,
        default: Value,
    ) -> StorageResult<Value> {
        Ok(self.get(table, key).await?.unwrap_or(default))
    }

    /// Every live record of `table`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownTable`] or a backend error.
    pub async fn get_all(&self, table: &str) -> StorageResult<Vec<Value>> {
        self.adapter.get_all(table).await
    }

    /// Insert or replace a record, optionally expiring after `ttl`.
    ///
    /// # Errors
    ///
    /// Returns a key error if the record has no valid key, or a backend error.
    pub async fn put(
        &self,
        table: &str,
        record: Value,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        self.adapter.put(table, record, ttl).await
    }

    /// Delete a record; absent keys are fine.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownTable`] or a backend error.
    pub async fn delete(&self, table: &str, key: impl Into<Key>) -> StorageResult<()> {
        self.adapter.delete(table, &key.into()).await
    }

    /// Remove every record of `table`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownTable`] or a backend error.
    pub async fn clear(&self, table: &str) -> StorageResult<()> {
        self.adapter.clear(table).await
    }

    /// Number of live records.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownTable`] or a backend error.
    pub async fn count(&self, table: &str) -> StorageResult<usize> {
        self.adapter.count(table).await
    }

    /// Insert or replace many records.
    ///
    /// Atomic on the indexed backend; best-effort on the flat backend (see
    /// [`FlatAdapter`]).
    ///
    /// # Errors
    ///
    /// Returns a key error before writing anything if any record has no valid
    /// key, or a backend error.
    pub async fn bulk_put(
        &self,
        table: &str,
        records: Vec<Value>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        self.adapter.bulk_put(table, records, ttl).await
    }

    /// Delete many records.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownTable`] or a backend error.
    pub async fn bulk_delete<K: Into<Key>>(
        &self,
        table: &str,
        keys: impl IntoIterator<Item = K>,
    ) -> StorageResult<()> {
        let keys: Vec<Key> = keys.into_iter().map(Into::into).collect();
        self.adapter.bulk_delete(table, &keys).await
    }

    /// Live records whose `field` equals `value`.
    ///
    /// Served from the secondary index on the indexed backend when `field` is
    /// indexed; a filtered scan otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownTable`] or a backend error.
    pub async fn find_by_index(
        &self,
        table: &str,
        field: &str,
        value: impl Into<Value>,
    ) -> StorageResult<Vec<Value>> {
        self.adapter.find_by_index(table, field, &value.into()).await
    }

    /// A fresh query over `table`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownTable`] for undeclared tables.
    pub fn query(&self, table: &str) -> StorageResult<Query> {
        let table = self.schema.require(table)?;
        Ok(Query::new(self.adapter.clone(), table.name()))
    }

    /// Run `f` over mutable mirrors of `tables` and commit what it changed.
    ///
    /// See [`TransactionCoordinator::run`] for the exact semantics and the
    /// per-backend guarantees.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Transaction`] if `f` fails, and
    /// [`StorageError::Conflict`] if an indexed table changed concurrently.
    pub async fn transaction<S, F, E>(
        &self,
        tables: &[S],
        f: F,
        ttl: Option<Duration>,
    ) -> StorageResult<()>
    where
        S: AsRef<str>,
        F: AsyncFnOnce(&mut TransactionContext) -> Result<(), E>,
        E: Into<BoxError>,
    {
        TransactionCoordinator::new(self.adapter.clone(), self.schema.clone())
            .run(tables, f, ttl)
            .await
    }

    /// Apply `operations` to `table` in order, stopping at the first failure.
    ///
    /// Operations before the failing one stay applied.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing operation.
    pub async fn patch(
        &self,
        table: &str,
        operations: impl IntoIterator<Item = PatchOperation>,
    ) -> StorageResult<()> {
        self.schema.require(table)?;
        for (index, operation) in operations.into_iter().enumerate() {
            let result = match operation {
                PatchOperation::Put { record, ttl } => self.put(table, record, ttl).await,
                PatchOperation::Delete { key } => self.delete(table, key).await,
                PatchOperation::Clear => self.clear(table).await,
            };
            if let Err(e) = result {
                debug!(table, index, error = %e, "Patch stopped");
                return Err(e);
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

    fn options(backend: BackendKind) -> StorageOptions {
        StorageOptions::new(
            backend,
            "app",
            1,
            [("users", TableDefinition::keyed("id").with_index("age"))],
        )
        .with_clock(Arc::new(ManualClock::new(0)))
    }

    #[tokio::test]
    async fn test_open_binds_requested_backend() {
        for backend in [BackendKind::Indexed, BackendKind::Flat] {
            let storage = Storage::open(options(backend)).await.unwrap();
            assert_eq!(storage.backend(), backend);
            assert_eq!(storage.db_name(), "app");
            assert_eq!(storage.version(), 1);
        }
    }

    #[tokio::test]
    async fn test_open_rejects_bad_options_before_io() {
        let mut bad = options(BackendKind::Flat);
        bad.version = 0;
        assert!(matches!(Storage::open(bad).await, Err(StorageError::Config(_))));

        let mut bad = options(BackendKind::Flat);
        bad.db_name = "a:b".into();
        assert!(matches!(Storage::open(bad).await, Err(StorageError::Config(_))));

        let mut bad = options(BackendKind::Indexed);
        bad.schema.insert("posts".into(), TableDefinition::default());
        let err = Storage::open(bad).await.unwrap_err();
        assert!(matches!(err, StorageError::Schema { ref table, .. } if table == "posts"));
    }

    #[tokio::test]
    async fn test_get_or_default() {
        let storage = Storage::open(options(BackendKind::Flat)).await.unwrap();
        let fallback = storage.get_or("users", 1, json!({ "id": 0 })).await.unwrap();
        assert_eq!(fallback, json!({ "id": 0 }));
    }

    #[tokio::test]
    async fn test_query_unknown_table() {
        let storage = Storage::open(options(BackendKind::Flat)).await.unwrap();
        assert!(matches!(storage.query("ghosts"), Err(StorageError::UnknownTable(_))));
    }

    #[tokio::test]
    async fn test_patch_short_circuits() {
        for backend in [BackendKind::Indexed, BackendKind::Flat] {
            let storage = Storage::open(options(backend)).await.unwrap();
            let err = storage
                .patch(
                    "users",
                    [
                        PatchOperation::Put {
                            record: json!({ "id": 1 }),
                            ttl: None,
                        },
                        PatchOperation::Put {
                            record: json!({ "name": "no key" }),
                            ttl: None,
                        },
                        PatchOperation::Put {
                            record: json!({ "id": 2 }),
                            ttl: None,
                        },
                    ],
                )
                .await
                .unwrap_err();
            assert!(matches!(err, StorageError::MissingKey { .. }));
            assert_eq!(storage.count("users").await.unwrap(), 1);
            assert!(storage.get("users", 2).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_patch_runs_in_order() {
        let storage = Storage::open(options(BackendKind::Indexed)).await.unwrap();
        storage
            .patch(
                "users",
                [
                    PatchOperation::Put {
                        record: json!({ "id": 1 }),
                        ttl: None,
                    },
                    PatchOperation::Clear,
                    PatchOperation::Put {
                        record: json!({ "id": 2 }),
                        ttl: None,
                    },
                    PatchOperation::Delete { key: Key::from(3) },
                ],
            )
            .await
            .unwrap();
        assert_eq!(storage.get_all("users").await.unwrap(), vec![json!({ "id": 2 })]);
    }

    #[test]
    fn test_patch_operation_serde() {
        let ops: Vec<PatchOperation> = serde_json::from_value(json!([
            { "type": "put", "record": { "id": 1 }, "ttlMs": 1500 },
            { "type": "delete", "key": "abc" },
            { "type": "clear" },
        ]))
        .unwrap();
        assert_eq!(
            ops,
            vec![
                PatchOperation::Put {
                    record: json!({ "id": 1 }),
                    ttl: Some(Duration::from_millis(1500)),
                },
                PatchOperation::Delete { key: Key::from("abc") },
                PatchOperation::Clear,
            ]
        );
        assert_eq!(
            serde_json::to_value(&ops[0]).unwrap(),
            json!({ "type": "put", "record": { "id": 1 }, "ttlMs": 1500 })
        );
    }
}
