//! File-based storage configuration.
//!
//! A [`StorageConfig`] is read from TOML:
//!
//! ```toml
//! backend = "indexed"
//! db_name = "app"
//! version = 2
//! path = "./data/app.json"
//!
//! [tables.users]
//! key = "id"
//! indexes = ["age", "city"]
//!
//! [tables.sessions]
//! key = "token"
//! ```
//!
//! Environment variables override file values:
//!
//! | Variable          | Field     |
//! |-------------------|-----------|
//! | `TESSERA_DB_NAME` | `db_name` |
//! | `TESSERA_BACKEND` | `backend` |
//! | `TESSERA_VERSION` | `version` |

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adapter::BackendKind;
use crate::error::{StorageError, StorageResult};
use crate::facade::StorageOptions;
use crate::indexed::IndexedDatabase;
use crate::schema::{Schema, TableDefinition};

/// Maximum accepted config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

fn default_version() -> u32 {
    1
}

/// Storage settings as written in a config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// `"indexed"` or `"flat"`.
    pub backend: BackendKind,
    /// Database name.
    pub db_name: String,
    /// Schema version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Where to persist data.
    ///
    /// For the indexed backend, the JSON image file. For the flat backend,
    /// the `SurrealKV` directory (requires the `kv` feature). In-memory when
    /// unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Table definitions.
    #[serde(default)]
    pub tables: BTreeMap<String, TableDefinition>,
}

impl StorageConfig {
    /// Parse a config from TOML text. Does not validate.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] for malformed TOML or unknown fields,
    /// and [`StorageError::Adapter`] for an unsupported backend name.
    pub fn from_toml_str(content: &str) -> StorageResult<Self> {
        toml::from_str(content).map_err(|e| {
            // Surface unsupported backends as adapter errors.
            let message = e.message().to_owned();
            if message.contains("unsupported adapter type") {
                StorageError::Adapter(message)
            } else {
                StorageError::Config(e.to_string())
            }
        })
    }

    /// Read, parse, and validate a config file, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] if the file cannot be read, is too
    /// large, or fails to parse or validate.
    pub fn load(path: &Path) -> StorageResult<Self> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            StorageError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(StorageError::Config(format!(
                "config file {} is {} bytes, exceeding the {MAX_CONFIG_FILE_SIZE} byte limit",
                path.display(),
                metadata.len()
            )));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            StorageError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        debug!(path = %path.display(), backend = %config.backend, "Loaded storage config");
        Ok(config)
    }

    /// Apply `TESSERA_*` overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if an override holds an invalid value.
    pub fn apply_env_overrides(&mut self) -> StorageResult<()> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        self.apply_env(&vars)
    }

    /// Apply `TESSERA_*` overrides from `vars`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Adapter`] for an unsupported backend and
    /// [`StorageError::Config`] for a non-numeric version.
    pub fn apply_env(&mut self, vars: &HashMap<String, String>) -> StorageResult<()> {
        if let Some(name) = vars.get("TESSERA_DB_NAME") {
            debug!(db_name = %name, "TESSERA_DB_NAME override");
            self.db_name.clone_from(name);
        }
        if let Some(backend) = vars.get("TESSERA_BACKEND") {
            self.backend = backend.parse()?;
        }
        if let Some(version) = vars.get("TESSERA_VERSION") {
            self.version = version.trim().parse().map_err(|_| {
                StorageError::Config(format!("TESSERA_VERSION '{version}' is not a version number"))
            })?;
        }
        Ok(())
    }

    /// Check the name, version, and table definitions.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] for a bad name or version and
    /// [`StorageError::Schema`] for a bad table definition.
    pub fn validate(&self) -> StorageResult<()> {
        self.to_options().validate()?;
        if self.tables.is_empty() {
            return Err(StorageError::Config("no tables declared".into()));
        }
        Schema::new(self.tables.clone())?;
        Ok(())
    }

    fn to_options(&self) -> StorageOptions {
        StorageOptions::new(
            self.backend,
            self.db_name.clone(),
            self.version,
            self.tables.clone(),
        )
    }

    /// Validate and turn into [`StorageOptions`], opening the configured
    /// persistent backend when `path` is set.
    ///
    /// # Errors
    ///
    /// Returns any validation error, or an error opening the backend.
    pub fn into_options(self) -> StorageResult<StorageOptions> {
        self.validate()?;
        let options = self.to_options();
        let Some(path) = self.path else {
            return Ok(options);
        };

        match self.backend {
            BackendKind::Indexed => {
                let db = IndexedDatabase::open_file(self.db_name, &path)?;
                Ok(options.with_indexed_database(db))
            },
            BackendKind::Flat => flat_store(&path).map(|store| options.with_kv_store(store)),
        }
    }
}

#[cfg(feature = "kv")]
fn flat_store(path: &Path) -> StorageResult<Arc<dyn crate::kv::KvStore>> {
    Ok(Arc::new(crate::kv::SurrealKvStore::open(path)?))
}

#[cfg(not(feature = "kv"))]
fn flat_store(path: &Path) -> StorageResult<Arc<dyn crate::kv::KvStore>> {
    Err(StorageError::Config(format!(
        "persistent flat storage at {} requires the `kv` feature",
        path.display()
    )))
}
