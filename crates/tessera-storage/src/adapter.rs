//! The storage capability shared by every backend.
//!
//! [`StorageAdapter`] is the one seam between the facade and a backend.
//! Implementations:
//!
//! - [`IndexedAdapter`](crate::indexed::IndexedAdapter): versioned, indexed,
//!   transactional object stores
//! - [`FlatAdapter`](crate::flat::FlatAdapter): flat key-value entries under
//!   composite string keys

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StorageError, StorageResult};
use crate::key::Key;

/// Which backend a facade binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BackendKind {
    /// Transactional indexed object stores.
    Indexed,
    /// Flat key-value store.
    Flat,
}

impl BackendKind {
    /// The discriminator string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Indexed => "indexed",
            Self::Flat => "flat",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "indexed" => Ok(Self::Indexed),
            "flat" => Ok(Self::Flat),
            other => Err(StorageError::Adapter(format!(
                "unsupported adapter type '{other}'; expected 'indexed' or 'flat'"
            ))),
        }
    }
}

impl TryFrom<String> for BackendKind {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BackendKind> for String {
    fn from(kind: BackendKind) -> Self {
        kind.as_str().to_owned()
    }
}

/// Live contents of one table captured at transaction start.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSnapshot {
    /// Table name.
    pub table: String,
    /// Live records in key order.
    pub records: Vec<Value>,
    /// Store revision at capture time. `None` when the backend cannot
    /// detect concurrent modification.
    pub revision: Option<u64>,
}

/// Writes to apply to one table when a transaction commits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableChanges {
    /// Table name.
    pub table: String,
    /// Records to insert or replace.
    pub upserts: Vec<Value>,
    /// Keys to remove.
    pub deletes: Vec<Key>,
    /// Revision the table must still be at for the commit to proceed.
    pub expected_revision: Option<u64>,
}

impl TableChanges {
    /// Whether there is nothing to write.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// Storage capability implemented by every backend.
///
/// All reads skip expired entries and may evict them as a side effect.
#[async_trait]
pub trait StorageAdapter: Send + Sync + fmt::Debug {
    /// Which backend this is.
    fn kind(&self) -> BackendKind;

    /// Get a live record by key.
    ///
    /// Returns `None` if the key is absent or its entry has expired.
    async fn get(&self, table: &str, key: &Key) -> StorageResult<Option<Value>>;

    /// Get every live record in the table.
    async fn get_all(&self, table: &str) -> StorageResult<Vec<Value>>;

    /// Insert or replace a record, keyed by its table's key field.
    async fn put(&self, table: &str, record: Value, ttl: Option<Duration>) -> StorageResult<()>;

    /// Insert or replace many records.
    ///
    /// Every record is validated before storage is touched.
    async fn bulk_put(
        &self,
        table: &str,
        records: Vec<Value>,
        ttl: Option<Duration>,
    ) -> StorageResult<()>;

    /// Delete a record. Absent keys are not an error.
    async fn delete(&self, table: &str, key: &Key) -> StorageResult<()>;

    /// Delete many records.
    async fn bulk_delete(&self, table: &str, keys: &[Key]) -> StorageResult<()>;

    /// Remove every record in the table.
    async fn clear(&self, table: &str) -> StorageResult<()>;

    /// Count live records.
    async fn count(&self, table: &str) -> StorageResult<usize>;

    /// Live records whose `field` equals `value`.
    async fn find_by_index(
        &self,
        table: &str,
        field: &str,
        value: &Value,
    ) -> StorageResult<Vec<Value>>;

    /// Capture the live contents of `tables` for a transaction.
    async fn snapshot(&self, tables: &[String]) -> StorageResult<Vec<TableSnapshot>>;

    /// Apply the computed writes of a transaction.
    async fn commit(&self, changes: Vec<TableChanges>, ttl: Option<Duration>)
    -> StorageResult<()>;
}
