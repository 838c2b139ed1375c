//! Multi-table transactions over any backend.
//!
//! A transaction snapshots the live records of every named table into a
//! mutable mirror, hands the mirrors to a caller-supplied async closure, and,
//! if the closure succeeds, writes back the difference between each mirror
//! and its snapshot:
//!
//! - records that are new or changed are upserted (with the transaction TTL)
//! - keys present in the snapshot but missing from the mirror are deleted
//!
//! If the closure fails, the mirrors are dropped and nothing is written.
//!
//! # Backend guarantees
//!
//! On the indexed backend the diff is applied in one engine transaction: all
//! writes land or none do, and a table modified by someone else since the
//! snapshot fails the commit with [`StorageError::Conflict`].
//!
//! On the flat backend writes are applied one by one, table by table. An I/O
//! error part-way through leaves the earlier writes in place, and concurrent
//! writes between snapshot and commit are overwritten without notice.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Index, IndexMut};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::adapter::{StorageAdapter, TableChanges, TableSnapshot};
use crate::error::{BoxError, StorageError, StorageResult};
use crate::key::Key;
use crate::schema::Schema;

/// Mutable per-table mirrors handed to a transaction closure.
///
/// Index by table name to reach a mirror:
///
/// ```no_run
/// # use serde_json::json;
/// # use tessera_storage::TransactionContext;
/// # fn f(tx: &mut TransactionContext) {
/// tx["users"].push(json!({ "id": 9, "name": "Ivy" }));
/// tx["posts"].retain(|p| p["author"] != 9);
/// # }
/// ```
///
/// Indexing panics for a table outside the transaction. Use
/// [`table`](Self::table) and [`table_mut`](Self::table_mut) when the name is
/// not known to be in scope.
#[derive(Debug, Default)]
pub struct TransactionContext {
    mirrors: BTreeMap<String, Vec<Value>>,
}

impl TransactionContext {
    fn from_snapshots(snapshots: &[TableSnapshot]) -> Self {
        Self {
            mirrors: snapshots
                .iter()
                .map(|s| (s.table.clone(), s.records.clone()))
                .collect(),
        }
    }

    /// The mirror of `table`, if it is part of this transaction.
    #[must_use]
    pub fn table(&self, table: &str) -> Option<&Vec<Value>> {
        self.mirrors.get(table)
    }

    /// Mutable mirror of `table`, if it is part of this transaction.
    pub fn table_mut(&mut self, table: &str) -> Option<&mut Vec<Value>> {
        self.mirrors.get_mut(table)
    }

    /// Names of the tables in this transaction.
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.mirrors.keys().map(String::as_str)
    }
}

impl Index<&str> for TransactionContext {
    type Output = Vec<Value>;

    /// # Panics
    ///
    /// Panics if `table` is not part of this transaction.
    fn index(&self, table: &str) -> &Self::Output {
        match self.mirrors.get(table) {
            Some(mirror) => mirror,
            None => panic!("table '{table}' is not part of this transaction"),
        }
    }
}

impl IndexMut<&str> for TransactionContext {
    /// # Panics
    ///
    /// Panics if `table` is not part of this transaction.
    fn index_mut(&mut self, table: &str) -> &mut Self::Output {
        match self.mirrors.get_mut(table) {
            Some(mirror) => mirror,
            None => panic!("table '{table}' is not part of this transaction"),
        }
    }
}

/// Runs snapshot → closure → diff → commit against one adapter.
#[derive(Debug, Clone)]
pub struct TransactionCoordinator {
    adapter: Arc<dyn StorageAdapter>,
    schema: Arc<Schema>,
}

impl TransactionCoordinator {
    /// Bind a coordinator to an adapter and its schema.
    #[must_use]
    pub fn new(adapter: Arc<dyn StorageAdapter>, schema: Arc<Schema>) -> Self {
        Self { adapter, schema }
    }

    /// Run `f` over mirrors of `tables` and commit what it changed.
    ///
    /// `ttl` applies to every record written by the commit. Duplicate table
    /// names are collapsed.
    ///
    /// # Errors
    ///
    /// - [`StorageError::UnknownTable`] before any I/O for unknown tables
    /// - [`StorageError::Transaction`] wrapping the closure's error; nothing
    ///   is written
    /// - [`StorageError::MissingKey`] / [`StorageError::InvalidKey`] if a
    ///   mirror holds a record without a valid key; nothing is written
    /// - [`StorageError::Conflict`] if an indexed table changed since the
    ///   snapshot
    /// - any adapter error during the snapshot or commit
    pub async fn run<S, F, E>(
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
        let mut names = Vec::with_capacity(tables.len());
        let mut seen = BTreeSet::new();
        for table in tables {
            let table = self.schema.require(table.as_ref())?;
            if seen.insert(table.name()) {
                names.push(table.name().to_owned());
            }
        }

        let snapshots = self.adapter.snapshot(&names).await?;
        let mut ctx = TransactionContext::from_snapshots(&snapshots);

        if let Err(e) = f(&mut ctx).await {
            let source: BoxError = e.into();
            debug!(
                tables = ?names,
                error = %source,
                "Transaction closure failed; discarding mirrors"
            );
            return Err(StorageError::Transaction {
                tables: names,
                source,
            });
        }

        let mut changes = Vec::with_capacity(snapshots.len());
        for snapshot in &snapshots {
            let mirror = ctx.mirrors.remove(&snapshot.table).unwrap_or_default();
            let change = self.diff(snapshot, mirror)?;
            if !change.is_empty() {
                changes.push(change);
            }
        }
        if changes.is_empty() {
            debug!(tables = ?names, "Transaction made no changes");
            return Ok(());
        }

        let upserts: usize = changes.iter().map(|c| c.upserts.len()).sum();
        let deletes: usize = changes.iter().map(|c| c.deletes.len()).sum();
        match self.adapter.commit(changes, ttl).await {
            Ok(()) => {
                debug!(tables = ?names, upserts, deletes, "Transaction committed");
                Ok(())
            },
            Err(e @ StorageError::Conflict { .. }) => {
                warn!(tables = ?names, error = %e, "Transaction commit rejected");
                Err(e)
            },
            Err(e) => Err(e),
        }
    }

    /// Compute the writes that turn `snapshot` into `mirror`.
    fn diff(&self, snapshot: &TableSnapshot, mirror: Vec<Value>) -> StorageResult<TableChanges> {
        let table = self.schema.require(&snapshot.table)?;

        let mut before: BTreeMap<Key, &Value> = BTreeMap::new();
        for record in &snapshot.records {
            before.insert(Key::extract(table.name(), table.key(), record)?, record);
        }

        // Later duplicates of a key win.
        let mut after: BTreeMap<Key, Value> = BTreeMap::new();
        let mut order = Vec::with_capacity(mirror.len());
        for record in mirror {
            let key = Key::extract(table.name(), table.key(), &record)?;
            if after.insert(key.clone(), record).is_none() {
                order.push(key);
            }
        }

        let deletes = before
            .keys()
            .filter(|key| !after.contains_key(*key))
            .cloned()
            .collect();
        let upserts = order
            .into_iter()
            .filter_map(|key| {
                let record = after.remove(&key)?;
                match before.get(&key) {
                    Some(old) if **old == record => None,
                    _ => Some(record),
                }
            })
            .collect();

        Ok(TableChanges {
            table: snapshot.table.clone(),
            upserts,
            deletes,
            expected_revision: snapshot.revision,
        })
    }
}
