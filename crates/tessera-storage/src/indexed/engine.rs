//! Versioned, indexed, transactional object-store engine.
//!
//! An [`IndexedDatabase`] holds named object stores. Each store keeps its
//! rows ordered by primary [`Key`], maintains one secondary index per
//! declared field, and carries a revision counter bumped by every commit that
//! changes its visible contents.
//!
//! # Transactions
//!
//! [`IndexedDatabase::transaction`] opens a [`Transaction`] scoped to a set of
//! stores. Read-only transactions share the database lock; read-write
//! transactions hold it exclusively, so their writes apply to the stores in
//! place and are recorded in an undo log. [`Transaction::commit`] discards the
//! log; dropping a transaction without committing (or a commit whose image
//! write fails) replays it backwards. Either every write of a transaction
//! becomes visible or none does, and a single-row write costs the same
//! whatever the size of the store.
//!
//! # Versioning
//!
//! Structural changes (creating or deleting stores and indexes) are only
//! possible inside an [`UpgradeTransaction`], run by
//! [`IndexedDatabase::upgrade`] when a higher version is requested.
//!
//! # Persistence
//!
//! Databases opened with [`IndexedDatabase::open_file`] write a JSON image of
//! every store at each commit that changed something, through a temporary
//! file in the same directory that is then renamed over the image. In-memory
//! databases keep nothing once dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::expiry::StoredEntry;
use crate::key::Key;

// ---------------------------------------------------------------------------
// Object stores and indexes
// ---------------------------------------------------------------------------

/// Encode an indexable field value. `null` and missing values are not indexed.
fn index_key(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(v) => serde_json::to_string(v).ok(),
    }
}

/// Secondary index: encoded field value → primary keys.
#[derive(Debug, Clone, Default)]
struct Index {
    entries: BTreeMap<String, BTreeSet<Key>>,
}

impl Index {
    fn insert(&mut self, field_value: Option<&Value>, key: &Key) {
        if let Some(ik) = index_key(field_value) {
            self.entries.entry(ik).or_default().insert(key.clone());
        }
    }

    fn remove(&mut self, field_value: Option<&Value>, key: &Key) {
        if let Some(ik) = index_key(field_value)
            && let Some(keys) = self.entries.get_mut(&ik)
        {
            keys.remove(key);
            if keys.is_empty() {
                self.entries.remove(&ik);
            }
        }
    }
}

/// A named collection of rows keyed by one field of each record.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    name: String,
    key_path: String,
    rows: BTreeMap<Key, StoredEntry>,
    indexes: BTreeMap<String, Index>,
    revision: u64,
}

impl ObjectStore {
    fn new(name: &str, key_path: &str) -> Self {
        Self {
            name: name.to_owned(),
            key_path: key_path.to_owned(),
            rows: BTreeMap::new(),
            indexes: BTreeMap::new(),
            revision: 0,
        }
    }

    /// The field rows are keyed by.
    #[must_use]
    pub fn key_path(&self) -> &str {
        &self.key_path
    }

    /// Names of the secondary indexes.
    pub fn index_names(&self) -> impl Iterator<Item = &str> {
        self.indexes.keys().map(String::as_str)
    }

    /// Whether an index exists on `field`.
    #[must_use]
    pub fn has_index(&self, field: &str) -> bool {
        self.indexes.contains_key(field)
    }

    /// Revision counter; moves on every commit that changes the store.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Number of rows, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the store has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn get(&self, key: &Key) -> Option<&StoredEntry> {
        self.rows.get(key)
    }

    /// Insert or replace the row keyed by the entry's key path. Returns the key
    /// and the row it replaced.
    fn put(&mut self, entry: StoredEntry) -> StorageResult<(Key, Option<StoredEntry>)> {
        let key = Key::extract(&self.name, &self.key_path, &entry.value)?;
        let previous = self.replace(key.clone(), Some(entry));
        Ok((key, previous))
    }

    fn delete(&mut self, key: &Key) -> Option<StoredEntry> {
        self.replace(key.clone(), None)
    }

    /// Set the row at `key` to `entry` (or remove it), keeping every index in
    /// step. Returns the previous row.
    fn replace(&mut self, key: Key, entry: Option<StoredEntry>) -> Option<StoredEntry> {
        let previous = self.rows.remove(&key);
        if let Some(old) = &previous {
            self.unindex(&key, old);
        }
        if let Some(entry) = entry {
            for (field, index) in &mut self.indexes {
                index.insert(entry.value.get(field), &key);
            }
            self.rows.insert(key, entry);
        }
        previous
    }

    fn clear(&mut self) -> BTreeMap<Key, StoredEntry> {
        for index in self.indexes.values_mut() {
            index.entries.clear();
        }
        std::mem::take(&mut self.rows)
    }

    fn unindex(&mut self, key: &Key, entry: &StoredEntry) {
        for (field, index) in &mut self.indexes {
            index.remove(entry.value.get(field), key);
        }
    }

    /// Create an index on `field`, back-filled from existing rows.
    fn create_index(&mut self, field: &str) -> bool {
        if self.indexes.contains_key(field) {
            return false;
        }
        let mut index = Index::default();
        for (key, entry) in &self.rows {
            index.insert(entry.value.get(field), key);
        }
        self.indexes.insert(field.to_owned(), index);
        true
    }

    fn delete_index(&mut self, field: &str) -> bool {
        self.indexes.remove(field).is_some()
    }

    fn lookup(&self, field: &str, value: &Value) -> Option<Vec<Key>> {
        let index = self.indexes.get(field)?;
        Some(
            index_key(Some(value))
                .and_then(|ik| index.entries.get(&ik))
                .map(|keys| keys.iter().cloned().collect())
                .unwrap_or_default(),
        )
    }
}

/// Single-pass, key-ordered iteration over the rows of a store.
///
/// Yields expired entries too; callers decide what to do with them.
#[derive(Debug)]
pub struct Cursor<'a> {
    inner: std::collections::btree_map::Iter<'a, Key, StoredEntry>,
}

impl<'a> Iterator for Cursor<'a> {
    type Item = (&'a Key, &'a StoredEntry);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

// ---------------------------------------------------------------------------
// Database state and on-disk image
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct DatabaseState {
    version: u32,
    stores: BTreeMap<String, ObjectStore>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreImage {
    key_path: String,
    indexes: Vec<String>,
    revision: u64,
    rows: Vec<StoredEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DatabaseImage {
    name: String,
    version: u32,
    stores: BTreeMap<String, StoreImage>,
}

impl StoreImage {
    fn capture(store: &ObjectStore) -> Self {
        Self {
            key_path: store.key_path.clone(),
            indexes: store.indexes.keys().cloned().collect(),
            revision: store.revision,
            rows: store.rows.values().cloned().collect(),
        }
    }

    fn restore(self, name: &str) -> StorageResult<ObjectStore> {
        let mut store = ObjectStore::new(name, &self.key_path);
        store.revision = self.revision;
        for field in &self.indexes {
            store.create_index(field);
        }
        for entry in self.rows {
            store.put(entry)?;
        }
        Ok(store)
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// A versioned collection of object stores.
#[derive(Debug)]
pub struct IndexedDatabase {
    name: String,
    path: Option<PathBuf>,
    state: RwLock<DatabaseState>,
}

/// Access mode of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// Reads only; shares the database lock.
    ReadOnly,
    /// Reads and writes; holds the database lock exclusively.
    ReadWrite,
}

impl IndexedDatabase {
    /// Create an empty in-memory database at version 0.
    #[must_use]
    pub fn memory(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            path: None,
            state: RwLock::new(DatabaseState::default()),
        })
    }

    /// Open a file-backed database, loading the image at `path` if present.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Connection`] if the file cannot be read and
    /// [`StorageError::Serialization`] if it is not a valid image.
    pub fn open_file(name: impl Into<String>, path: impl AsRef<Path>) -> StorageResult<Arc<Self>> {
        let name = name.into();
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let bytes =
                std::fs::read(&path).map_err(|e| StorageError::Connection(e.to_string()))?;
            let image: DatabaseImage = serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            let mut stores = BTreeMap::new();
            for (store_name, store) in image.stores {
                let restored = store.restore(&store_name)?;
                stores.insert(store_name, restored);
            }
            debug!(database = %name, version = image.version, "Loaded database image");
            DatabaseState {
                version: image.version,
                stores,
            }
        } else {
            DatabaseState::default()
        };

        Ok(Arc::new(Self {
            name,
            path: Some(path),
            state: RwLock::new(state),
        }))
    }

    /// Database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current stored version (0 for a new database).
    pub async fn version(&self) -> u32 {
        self.state.read().await.version
    }

    /// Names of every object store.
    pub async fn object_store_names(&self) -> Vec<String> {
        self.state.read().await.stores.keys().cloned().collect()
    }

    /// Index names of one store, or `None` if the store does not exist.
    pub async fn index_names(&self, store: &str) -> Option<Vec<String>> {
        let state = self.state.read().await;
        state
            .stores
            .get(store)
            .map(|s| s.index_names().map(str::to_owned).collect())
    }

    /// Key path of one store, or `None` if the store does not exist.
    pub async fn key_path(&self, store: &str) -> Option<String> {
        let state = self.state.read().await;
        state.stores.get(store).map(|s| s.key_path.clone())
    }

    /// Upgrade to `version`, running `step` inside one version-change
    /// transaction.
    ///
    /// Does nothing when `version` equals the stored version. If `step` fails,
    /// the database is left exactly as it was.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Version`] if `version` is lower than the stored
    /// version, or whatever `step` returns.
    pub async fn upgrade<F>(&self, version: u32, step: F) -> StorageResult<bool>
    where
        F: FnOnce(&mut UpgradeTransaction) -> StorageResult<()>,
    {
        let mut state = self.state.write().await;
        if version < state.version {
            return Err(StorageError::Version {
                requested: version,
                stored: state.version,
            });
        }
        if version == state.version {
            return Ok(false);
        }

        let mut upgrade = UpgradeTransaction {
            old_version: state.version,
            new_version: version,
            state: state.clone(),
        };
        step(&mut upgrade)?;

        let mut next = upgrade.state;
        next.version = version;
        self.persist(next.version, next.stores.iter())?;
        debug!(
            database = %self.name,
            from = state.version,
            to = version,
            "Database upgraded"
        );
        *state = next;
        Ok(true)
    }

    /// Begin a transaction over `scope`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownTable`] if a store in `scope` does not
    /// exist.
    pub async fn transaction<S: AsRef<str>>(
        &self,
        scope: &[S],
        mode: TransactionMode,
    ) -> StorageResult<Transaction<'_>> {
        let guard = match mode {
            TransactionMode::ReadOnly => Guard::Read(self.state.read().await),
            TransactionMode::ReadWrite => Guard::Write(self.state.write().await),
        };

        let mut names = BTreeSet::new();
        for name in scope {
            let name = name.as_ref();
            if !guard.state().stores.contains_key(name) {
                return Err(StorageError::UnknownTable(name.to_owned()));
            }
            names.insert(name.to_owned());
        }

        Ok(Transaction {
            db: self,
            guard,
            scope: names,
            undo: Vec::new(),
            modified: BTreeSet::new(),
        })
    }

    /// Write the image of the given stores, when file-backed.
    ///
    /// The image goes to a fresh temporary file next to the target, which is
    /// then renamed over it, so a crash mid-write leaves the old image intact.
    fn persist<'a>(
        &self,
        version: u32,
        stores: impl Iterator<Item = (&'a String, &'a ObjectStore)>,
    ) -> StorageResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let image = DatabaseImage {
            name: self.name.clone(),
            version,
            stores: stores
                .map(|(name, store)| (name.clone(), StoreImage::capture(store)))
                .collect(),
        };
        let bytes =
            serde_json::to_vec(&image).map_err(|e| StorageError::Serialization(e.to_string()))?;

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(|e| StorageError::Internal(e.to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        tmp.write_all(&bytes)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        tmp.persist(path)
            .map_err(|e| StorageError::Internal(format!("{}: {e}", path.display())))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

enum Guard<'a> {
    Read(RwLockReadGuard<'a, DatabaseState>),
    Write(RwLockWriteGuard<'a, DatabaseState>),
}

impl Guard<'_> {
    fn state(&self) -> &DatabaseState {
        match self {
            Self::Read(g) => g,
            Self::Write(g) => g,
        }
    }
}

/// Prior state of one row written by a transaction.
#[derive(Debug)]
struct Undo {
    store: String,
    key: Key,
    previous: Option<StoredEntry>,
}

/// A unit of work over a fixed set of object stores.
pub struct Transaction<'a> {
    db: &'a IndexedDatabase,
    guard: Guard<'a>,
    scope: BTreeSet<String>,
    undo: Vec<Undo>,
    modified: BTreeSet<String>,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("database", &self.db.name)
            .field("scope", &self.scope)
            .field("pending", &self.undo.len())
            .finish_non_exhaustive()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.undo.is_empty() {
            debug!(
                database = %self.db.name,
                rows = self.undo.len(),
                "Rolling back uncommitted transaction"
            );
            self.rollback();
        }
    }
}

impl Transaction<'_> {
    /// Mode this transaction was opened with.
    #[must_use]
    pub fn mode(&self) -> TransactionMode {
        match self.guard {
            Guard::Read(_) => TransactionMode::ReadOnly,
            Guard::Write(_) => TransactionMode::ReadWrite,
        }
    }

    fn check_scope(&self, name: &str) -> StorageResult<()> {
        if self.scope.contains(name) {
            Ok(())
        } else {
            Err(StorageError::Internal(format!(
                "object store '{name}' is outside the transaction scope"
            )))
        }
    }

    fn store(&self, name: &str) -> StorageResult<&ObjectStore> {
        self.check_scope(name)?;
        self.guard
            .state()
            .stores
            .get(name)
            .ok_or_else(|| StorageError::UnknownTable(name.to_owned()))
    }

    fn store_mut(&mut self, name: &str) -> StorageResult<&mut ObjectStore> {
        self.check_scope(name)?;
        let Guard::Write(state) = &mut self.guard else {
            return Err(StorageError::Internal(
                "cannot write in a read-only transaction".into(),
            ));
        };
        state
            .stores
            .get_mut(name)
            .ok_or_else(|| StorageError::UnknownTable(name.to_owned()))
    }

    fn record(&mut self, store: &str, key: Key, previous: Option<StoredEntry>) {
        self.undo.push(Undo {
            store: store.to_owned(),
            key,
            previous,
        });
    }

    /// Undo every write, newest first.
    fn rollback(&mut self) {
        let Guard::Write(state) = &mut self.guard else {
            self.undo.clear();
            return;
        };
        while let Some(undo) = self.undo.pop() {
            if let Some(store) = state.stores.get_mut(&undo.store) {
                store.replace(undo.key, undo.previous);
            }
        }
    }

    /// Get a row by key, expired or not.
    ///
    /// # Errors
    ///
    /// Returns an error if `store` is outside the transaction scope.
    pub fn get(&self, store: &str, key: &Key) -> StorageResult<Option<&StoredEntry>> {
        Ok(self.store(store)?.get(key))
    }

    /// Open a cursor over every row of `store`, in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if `store` is outside the transaction scope.
    pub fn cursor(&self, store: &str) -> StorageResult<Cursor<'_>> {
        Ok(Cursor {
            inner: self.store(store)?.rows.iter(),
        })
    }

    /// Primary keys whose `field` equals `value`, using the store's index.
    ///
    /// Returns `None` when `field` is not indexed.
    ///
    /// # Errors
    ///
    /// Returns an error if `store` is outside the transaction scope.
    pub fn lookup(
        &self,
        store: &str,
        field: &str,
        value: &Value,
    ) -> StorageResult<Option<Vec<Key>>> {
        Ok(self.store(store)?.lookup(field, value))
    }

    /// Whether `store` has an index on `field`.
    ///
    /// # Errors
    ///
    /// Returns an error if `store` is outside the transaction scope.
    pub fn has_index(&self, store: &str, field: &str) -> StorageResult<bool> {
        Ok(self.store(store)?.has_index(field))
    }

    /// Revision of `store` as seen by this transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if `store` is outside the transaction scope.
    pub fn revision(&self, store: &str) -> StorageResult<u64> {
        Ok(self.store(store)?.revision)
    }

    /// Insert or replace a row; the key is read from the store's key path.
    ///
    /// # Errors
    ///
    /// Returns an error for read-only transactions, out-of-scope stores, and
    /// records without a valid key.
    pub fn put(&mut self, store: &str, entry: StoredEntry) -> StorageResult<Key> {
        let (key, previous) = self.store_mut(store)?.put(entry)?;
        self.record(store, key.clone(), previous);
        self.modified.insert(store.to_owned());
        Ok(key)
    }

    /// Delete a row. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error for read-only transactions and out-of-scope stores.
    pub fn delete(&mut self, store: &str, key: &Key) -> StorageResult<bool> {
        let Some(previous) = self.store_mut(store)?.delete(key) else {
            return Ok(false);
        };
        self.record(store, key.clone(), Some(previous));
        self.modified.insert(store.to_owned());
        Ok(true)
    }

    /// Remove an expired row.
    ///
    /// Unlike [`delete`](Self::delete) this does not move the store's
    /// revision: the row was already invisible to readers.
    ///
    /// # Errors
    ///
    /// Returns an error for read-only transactions and out-of-scope stores.
    pub fn evict(&mut self, store: &str, key: &Key) -> StorageResult<()> {
        if let Some(previous) = self.store_mut(store)?.delete(key) {
            self.record(store, key.clone(), Some(previous));
        }
        Ok(())
    }

    /// Remove every row of `store`. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error for read-only transactions and out-of-scope stores.
    pub fn clear(&mut self, store: &str) -> StorageResult<usize> {
        let removed = self.store_mut(store)?.clear();
        let count = removed.len();
        for (key, entry) in removed {
            self.record(store, key, Some(entry));
        }
        if count > 0 {
            self.modified.insert(store.to_owned());
        }
        Ok(count)
    }

    /// Make every write of this transaction visible at once.
    ///
    /// # Errors
    ///
    /// Returns an error if a file-backed database cannot write its image; in
    /// that case every write of the transaction is rolled back.
    pub fn commit(mut self) -> StorageResult<()> {
        if self.undo.is_empty() {
            return Ok(());
        }
        let Guard::Write(state) = &mut self.guard else {
            return Ok(());
        };

        for name in &self.modified {
            if let Some(store) = state.stores.get_mut(name) {
                store.revision = store.revision.saturating_add(1);
            }
        }
        if let Err(e) = self.db.persist(state.version, state.stores.iter()) {
            for name in &self.modified {
                if let Some(store) = state.stores.get_mut(name) {
                    store.revision = store.revision.saturating_sub(1);
                }
            }
            // Dropping `self` replays the undo log.
            return Err(e);
        }

        self.undo.clear();
        Ok(())
    }
}

/// Version-change transaction handed to upgrade steps.
///
/// Acts both as the handle for structural changes (stores and indexes) and as
/// a live read-write transaction for back-filling data. Nothing is visible
/// until the upgrade step returns successfully.
#[derive(Debug)]
pub struct UpgradeTransaction {
    old_version: u32,
    new_version: u32,
    state: DatabaseState,
}

impl UpgradeTransaction {
    /// Version before the upgrade (0 for a new database).
    #[must_use]
    pub fn old_version(&self) -> u32 {
        self.old_version
    }

    /// Version being upgraded to.
    #[must_use]
    pub fn new_version(&self) -> u32 {
        self.new_version
    }

    /// Names of every object store.
    #[must_use]
    pub fn object_store_names(&self) -> Vec<String> {
        self.state.stores.keys().cloned().collect()
    }

    /// Whether a store exists.
    #[must_use]
    pub fn contains_object_store(&self, name: &str) -> bool {
        self.state.stores.contains_key(name)
    }

    /// Inspect a store.
    #[must_use]
    pub fn object_store(&self, name: &str) -> Option<&ObjectStore> {
        self.state.stores.get(name)
    }

    fn existing_mut(&mut self, name: &str) -> StorageResult<&mut ObjectStore> {
        self.state
            .stores
            .get_mut(name)
            .ok_or_else(|| StorageError::UnknownTable(name.to_owned()))
    }

    /// Create a store keyed by `key_path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Schema`] if the store already exists.
    pub fn create_object_store(&mut self, name: &str, key_path: &str) -> StorageResult<()> {
        if self.state.stores.contains_key(name) {
            return Err(StorageError::Schema {
                table: name.to_owned(),
                message: "object store already exists".into(),
            });
        }
        self.state
            .stores
            .insert(name.to_owned(), ObjectStore::new(name, key_path));
        Ok(())
    }

    /// Delete a store and its rows. Returns whether it existed.
    pub fn delete_object_store(&mut self, name: &str) -> bool {
        self.state.stores.remove(name).is_some()
    }

    /// Create an index on `field`, back-filled from existing rows.
    ///
    /// Returns `false` if the index already existed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownTable`] if the store does not exist.
    pub fn create_index(&mut self, store: &str, field: &str) -> StorageResult<bool> {
        Ok(self.existing_mut(store)?.create_index(field))
    }

    /// Delete an index. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownTable`] if the store does not exist.
    pub fn delete_index(&mut self, store: &str, field: &str) -> StorageResult<bool> {
        Ok(self.existing_mut(store)?.delete_index(field))
    }

    /// Every record of `store`, expired ones included.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownTable`] if the store does not exist.
    pub fn get_all(&self, store: &str) -> StorageResult<Vec<Value>> {
        let store = self
            .state
            .stores
            .get(store)
            .ok_or_else(|| StorageError::UnknownTable(store.to_owned()))?;
        Ok(store.rows.values().map(|e| e.value.clone()).collect())
    }

    /// Insert or replace a record without expiry.
    ///
    /// # Errors
    ///
    /// Returns an error if the store does not exist or the record has no
    /// valid key.
    pub fn put(&mut self, store: &str, record: Value) -> StorageResult<Key> {
        let target = self.existing_mut(store)?;
        let (key, _) = target.put(StoredEntry {
            value: record,
            expires_at: None,
        })?;
        target.revision = target.revision.saturating_add(1);
        Ok(key)
    }

    /// Delete a record. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownTable`] if the store does not exist.
    pub fn delete(&mut self, store: &str, key: &Key) -> StorageResult<bool> {
        let target = self.existing_mut(store)?;
        let existed = target.delete(key).is_some();
        if existed {
            target.revision = target.revision.saturating_add(1);
        }
        Ok(existed)
    }
}
