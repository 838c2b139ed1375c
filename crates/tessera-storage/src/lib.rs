//! Tessera Storage: one data-access contract over two embedded backends.
//!
//! # Backends
//!
//! | Backend | Kind | Guarantees |
//! |---------|------|------------|
//! | [`IndexedAdapter`] | versioned object stores with secondary indexes | atomic batches and transactions, conflict detection |
//! | [`FlatAdapter`] | flat key-value entries under `{db}:{version}:{table}:{key}` | per-entry writes only |
//!
//! Both sit behind the [`StorageAdapter`] trait, and [`Storage`] binds exactly
//! one of them. Records are JSON objects keyed by the field their table
//! declares in the [`Schema`].
//!
//! # Expiry
//!
//! A write may carry a TTL. Expired records are never returned: every read
//! path checks the expiry and removes the stale entry it finds. Nothing runs
//! in the background.
//!
//! # Queries and transactions
//!
//! [`Storage::query`] returns a [`Query`] pipeline evaluated in memory over
//! the live records of one table. [`Storage::transaction`] runs an async
//! closure over mutable per-table mirrors and commits the diff.
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use tessera_storage::{BackendKind, Direction, Storage, StorageOptions, TableDefinition};
//!
//! # async fn run() -> tessera_storage::StorageResult<()> {
//! let storage = Storage::open(StorageOptions::new(
//!     BackendKind::Indexed,
//!     "app",
//!     1,
//!     [("users", TableDefinition::keyed("id").with_index("age"))],
//! ))
//! .await?;
//!
//! storage.put("users", json!({ "id": 1, "age": 25, "city": "Paris" }), None).await?;
//! let parisians = storage
//!     .query("users")?
//!     .equals("city", "Paris")
//!     .order_by("age", Direction::Desc)
//!     .to_vec()
//!     .await?;
//! # Ok(()) }
//! ```
//!
//! # Feature Flags
//!
//! - **`kv`**: `SurrealKV`-backed persistent flat store ([`SurrealKvStore`])

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod adapter;
pub mod config;
pub mod error;
pub mod expiry;
pub mod facade;
pub mod flat;
pub mod indexed;
pub mod key;
pub mod kv;
pub mod query;
pub mod schema;
pub mod transaction;

pub use adapter::{BackendKind, StorageAdapter, TableChanges, TableSnapshot};
pub use config::StorageConfig;
pub use error::{BoxError, StorageError, StorageResult};
pub use expiry::{Clock, ManualClock, StoredEntry, SystemClock, is_expired, with_expiry};
pub use facade::{PatchOperation, Storage, StorageOptions};
pub use flat::FlatAdapter;
pub use indexed::{IndexedAdapter, IndexedDatabase, MigrationFn, UpgradeTransaction};
pub use key::Key;
pub use kv::{KvStore, MemoryKvStore};
pub use query::{Condition, ConditionType, Direction, Group, Predicate, Query};
pub use schema::{Schema, TableDefinition, TableSchema};
pub use transaction::{TransactionContext, TransactionCoordinator};

#[cfg(feature = "kv")]
pub use kv::SurrealKvStore;
