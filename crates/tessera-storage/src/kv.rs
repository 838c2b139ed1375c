//! Flat key-value store trait and implementations.
//!
//! The [`KvStore`] trait is the raw surface the flat backend drives: a single
//! keyspace of string keys mapping to byte values, with prefix enumeration.
//! It has no transactions and no batch primitive. Implementations:
//!
//! - **In-memory** (always available): For tests and ephemeral data
//! - **`SurrealKV`** (behind `kv` feature): Persistent, embedded LSM-tree
//!
//! # Key Layout
//!
//! The flat adapter addresses records as `{db}:{version}:{table}:{key}`, so a
//! table is enumerated with the prefix `{db}:{version}:{table}:`.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::{StorageError, StorageResult};

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate that a key is safe for storage.
///
/// Keys must be non-empty and must not contain the null byte.
fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("key must not be empty".into()));
    }
    if key.contains('\0') {
        return Err(StorageError::InvalidKey(
            "key must not contain null bytes".into(),
        ));
    }
    Ok(())
}

/// Exclusive upper bound of the key range sharing `prefix`.
///
/// Increments the last byte that is not `0xFF`, dropping everything after
/// it. `None` means the range is unbounded above.
#[cfg(any(feature = "kv", test))]
fn prefix_range_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last.saturating_add(1));
            return Some(end);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Flat key-value store.
///
/// Writes are individually durable; nothing spans more than one key.
#[async_trait]
pub trait KvStore: Send + Sync + std::fmt::Debug {
    /// Get a value by key.
    ///
    /// Returns `None` if the key does not exist.
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Set a value, overwriting any existing one.
    async fn set(&self, key: &str, value: Vec<u8>) -> StorageResult<()>;

    /// Delete a key.
    ///
    /// Returns `true` if the key existed and was deleted.
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    /// List every key starting with `prefix`, in ascending order.
    async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Delete every key starting with `prefix`.
    ///
    /// Returns the number of keys removed.
    async fn clear_prefix(&self, prefix: &str) -> StorageResult<u64>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

type Entries = BTreeMap<String, Vec<u8>>;

/// Process-local store over a sorted map.
///
/// Used when no persistent store is configured, and by tests that need to
/// reach under the flat adapter.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: std::sync::RwLock<Entries>,
}

fn poisoned<T>(e: &std::sync::PoisonError<T>) -> StorageError {
    StorageError::Internal(format!("memory store lock poisoned: {e}"))
}

/// Keys of `entries` under `prefix`, ascending.
fn keys_with_prefix(entries: &Entries, prefix: &str) -> Vec<String> {
    entries
        .range::<str, _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
        .map(|(key, _)| key)
        .take_while(|key| key.starts_with(prefix))
        .cloned()
        .collect()
}

impl MemoryKvStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StorageResult<std::sync::RwLockReadGuard<'_, Entries>> {
        self.entries.read().map_err(|e| poisoned(&e))
    }

    fn write(&self) -> StorageResult<std::sync::RwLockWriteGuard<'_, Entries>> {
        self.entries.write().map_err(|e| poisoned(&e))
    }

    /// Number of entries across every prefix.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Internal`] if the lock is poisoned.
    pub fn len(&self) -> StorageResult<usize> {
        Ok(self.read()?.len())
    }

    /// Whether the store holds no entries.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Internal`] if the lock is poisoned.
    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.read()?.is_empty())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.read()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        validate_key(key)?;
        self.write()?.insert(key.to_owned(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        Ok(self.write()?.remove(key).is_some())
    }

    async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(keys_with_prefix(&*self.read()?, prefix))
    }

    async fn clear_prefix(&self, prefix: &str) -> StorageResult<u64> {
        let mut entries = self.write()?;
        let mut removed: u64 = 0;
        for key in keys_with_prefix(&entries, prefix) {
            entries.remove(&key);
            removed = removed.saturating_add(1);
        }
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// SurrealKV store (`kv` feature)
// ---------------------------------------------------------------------------

/// Persistent store over a `SurrealKV` LSM tree.
///
/// Every call is its own `SurrealKV` transaction. The flat adapter never
/// groups calls, so its batches stay non-atomic here too.
///
/// # Example
///
/// ```rust,ignore
/// use tessera_storage::kv::SurrealKvStore;
///
/// let store = SurrealKvStore::open("./data/flat")?;
/// store.set("app:1:users:1", br#"{"value":{"id":1}}"#.to_vec()).await?;
/// ```
#[cfg(feature = "kv")]
pub struct SurrealKvStore {
    tree: surrealkv::Tree,
}

#[cfg(feature = "kv")]
impl std::fmt::Debug for SurrealKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurrealKvStore").finish_non_exhaustive()
    }
}

#[cfg(feature = "kv")]
#[allow(clippy::needless_pass_by_value)]
fn kv_err(e: surrealkv::Error) -> StorageError {
    StorageError::Internal(format!("surrealkv: {e}"))
}

#[cfg(feature = "kv")]
impl SurrealKvStore {
    /// Open (or create) a store in `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Connection`] if the tree cannot be built.
    pub fn open(path: impl AsRef<std::path::Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let tree = surrealkv::TreeBuilder::new()
            .with_path(path.to_path_buf())
            .build()
            .map_err(|e| {
                StorageError::Connection(format!("cannot open {}: {e}", path.display()))
            })?;
        Ok(Self { tree })
    }

    /// Flush and close the tree.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Internal`] if the flush fails.
    pub async fn close(&self) -> StorageResult<()> {
        self.tree.close().await.map_err(kv_err)
    }

    /// Raw keys under `prefix`, read in one snapshot.
    fn raw_keys(&self, prefix: &str) -> StorageResult<Vec<Vec<u8>>> {
        let tx = self
            .tree
            .begin_with_mode(surrealkv::Mode::ReadOnly)
            .map_err(kv_err)?;
        let start = prefix.as_bytes().to_vec();
        let end = prefix_range_end(&start)
            .unwrap_or_else(|| vec![u8::MAX; start.len().saturating_add(1)]);

        let mut iter = tx.range(&start, &end).map_err(kv_err)?;
        iter.seek_first().map_err(kv_err)?;
        let mut keys = Vec::new();
        while iter.valid() {
            keys.push(iter.key().to_vec());
            iter.next().map_err(kv_err)?;
        }
        Ok(keys)
    }
}

#[cfg(feature = "kv")]
#[async_trait]
impl KvStore for SurrealKvStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_key(key)?;
        let tx = self
            .tree
            .begin_with_mode(surrealkv::Mode::ReadOnly)
            .map_err(kv_err)?;
        tx.get(key.as_bytes()).map_err(kv_err)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        validate_key(key)?;
        let mut tx = self.tree.begin().map_err(kv_err)?;
        tx.set(key.as_bytes(), &value).map_err(kv_err)?;
        tx.commit().await.map_err(kv_err)
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        let mut tx = self.tree.begin().map_err(kv_err)?;
        if tx.get(key.as_bytes()).map_err(kv_err)?.is_none() {
            return Ok(false);
        }
        tx.delete(key.as_bytes()).map_err(kv_err)?;
        tx.commit().await.map_err(kv_err)?;
        Ok(true)
    }

    async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .raw_keys(prefix)?
            .into_iter()
            .filter_map(|raw| String::from_utf8(raw).ok())
            .collect())
    }

    async fn clear_prefix(&self, prefix: &str) -> StorageResult<u64> {
        let keys = self.raw_keys(prefix)?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut tx = self.tree.begin().map_err(kv_err)?;
        let mut removed: u64 = 0;
        for key in &keys {
            tx.delete(key).map_err(kv_err)?;
            removed = removed.saturating_add(1);
        }
        tx.commit().await.map_err(kv_err)?;
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_get_set() {
        let store = MemoryKvStore::new();
        store.set("db:1:t:1", b"hello".to_vec()).await.unwrap();
        let val = store.get("db:1:t:1").await.unwrap();
        assert_eq!(val, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_memory_get_missing() {
        let store = MemoryKvStore::new();
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_overwrite() {
        let store = MemoryKvStore::new();
        store.set("k", b"v1".to_vec()).await.unwrap();
        store.set("k", b"v2".to_vec()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn test_memory_delete() {
        let store = MemoryKvStore::new();
        store.set("k", b"v".to_vec()).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_list_keys_by_prefix() {
        let store = MemoryKvStore::new();
        store.set("db:1:users:1", b"1".to_vec()).await.unwrap();
        store.set("db:1:users:2", b"2".to_vec()).await.unwrap();
        store.set("db:1:usersx:3", b"3".to_vec()).await.unwrap();
        store.set("db:1:posts:1", b"4".to_vec()).await.unwrap();

        let keys = store.list_keys("db:1:users:").await.unwrap();
        assert_eq!(keys, vec!["db:1:users:1", "db:1:users:2"]);
    }

    #[tokio::test]
    async fn test_memory_clear_prefix() {
        let store = MemoryKvStore::new();
        store.set("a:1", b"1".to_vec()).await.unwrap();
        store.set("a:2", b"2".to_vec()).await.unwrap();
        store.set("b:1", b"3".to_vec()).await.unwrap();

        assert_eq!(store.clear_prefix("a:").await.unwrap(), 2);
        assert!(store.list_keys("a:").await.unwrap().is_empty());
        assert_eq!(store.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_rejects_invalid_keys() {
        let store = MemoryKvStore::new();
        assert!(store.set("", b"v".to_vec()).await.is_err());
        assert!(store.set("k\0bad", b"v".to_vec()).await.is_err());
    }

    #[test]
    fn test_prefix_range_end() {
        assert_eq!(prefix_range_end(b"ab:"), Some(b"ab;".to_vec()));
        assert_eq!(prefix_range_end(&[b'a', u8::MAX]), Some(b"b".to_vec()));
        assert_eq!(prefix_range_end(&[u8::MAX]), None);
    }

    // -- SurrealKvStore tests (behind feature gate) --

    #[cfg(feature = "kv")]
    mod surreal_kv_tests {
        use super::*;

        fn make_store() -> (SurrealKvStore, tempfile::TempDir) {
            let dir = tempfile::tempdir().unwrap();
            let store = SurrealKvStore::open(dir.path()).unwrap();
            (store, dir)
        }

        #[tokio::test]
        async fn test_surreal_get_set_delete() {
            let (store, _dir) = make_store();
            store.set("db:1:t:1", b"hello".to_vec()).await.unwrap();
            assert_eq!(
                store.get("db:1:t:1").await.unwrap(),
                Some(b"hello".to_vec())
            );
            assert!(store.delete("db:1:t:1").await.unwrap());
            assert!(!store.delete("db:1:t:1").await.unwrap());
        }

        #[tokio::test]
        async fn test_surreal_prefix_scan_and_clear() {
            let (store, _dir) = make_store();
            store.set("db:1:users:1", b"1".to_vec()).await.unwrap();
            store.set("db:1:users:2", b"2".to_vec()).await.unwrap();
            store.set("db:1:posts:1", b"3".to_vec()).await.unwrap();

            let keys = store.list_keys("db:1:users:").await.unwrap();
            assert_eq!(keys, vec!["db:1:users:1", "db:1:users:2"]);

            assert_eq!(store.clear_prefix("db:1:users:").await.unwrap(), 2);
            assert_eq!(store.list_keys("db:1:").await.unwrap().len(), 1);
        }
    }
}
