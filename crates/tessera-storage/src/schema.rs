//! Table schema declaration and validation.
//!
//! A schema maps table names to a [`TableDefinition`]: the primary key field
//! and an ordered set of indexed fields. Definitions are validated once by
//! [`Schema::new`]; the resulting [`Schema`] is immutable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Raw, unvalidated table definition as supplied by callers or config files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableDefinition {
    /// Primary key field. Required.
    pub key: Option<String>,
    /// Fields to index for secondary lookup.
    pub indexes: Vec<String>,
}

impl TableDefinition {
    /// A definition keyed by `field` with no indexes.
    #[must_use]
    pub fn keyed(field: impl Into<String>) -> Self {
        Self {
            key: Some(field.into()),
            indexes: Vec::new(),
        }
    }

    /// Add an indexed field.
    #[must_use]
    pub fn with_index(mut self, field: impl Into<String>) -> Self {
        self.indexes.push(field.into());
        self
    }
}

/// A validated table: name, key field, and de-duplicated index fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    name: String,
    key: String,
    indexes: Vec<String>,
}

impl TableSchema {
    /// The table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The primary key field.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Indexed fields, in declaration order.
    #[must_use]
    pub fn indexes(&self) -> &[String] {
        &self.indexes
    }

    /// Whether `field` is declared as an index.
    #[must_use]
    pub fn is_indexed(&self, field: &str) -> bool {
        self.indexes.iter().any(|i| i == field)
    }
}

/// Immutable, validated schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    tables: BTreeMap<String, TableSchema>,
}

impl Schema {
    /// Validate a set of table definitions.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Schema`] naming the first offending table when
    /// a table name is empty or contains `:`, when a definition has no key
    /// field, or when an index field name is empty.
    pub fn new<I, S>(definitions: I) -> StorageResult<Self>
    where
        I: IntoIterator<Item = (S, TableDefinition)>,
        S: Into<String>,
    {
        let mut tables = BTreeMap::new();
        for (name, definition) in definitions {
            let name = name.into();
            let table = validate_table(&name, definition)?;
            tables.insert(name, table);
        }
        Ok(Self { tables })
    }

    /// Look up a table.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    /// Look up a table, failing for undeclared names.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownTable`] if the table is not declared.
    pub fn require(&self, name: &str) -> StorageResult<&TableSchema> {
        self.table(name)
            .ok_or_else(|| StorageError::UnknownTable(name.to_owned()))
    }

    /// All tables, ordered by name.
    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }

    /// Number of declared tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether no tables are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

fn validate_table(name: &str, definition: TableDefinition) -> StorageResult<TableSchema> {
    if name.is_empty() {
        return Err(StorageError::Schema {
            table: name.to_owned(),
            message: "table name must not be empty".into(),
        });
    }
    if name.contains(':') {
        return Err(StorageError::Schema {
            table: name.to_owned(),
            message: "table name must not contain ':'".into(),
        });
    }

    let key = match definition.key {
        Some(key) if !key.is_empty() => key,
        _ => return Err(StorageError::missing_key_definition(name)),
    };

    let mut indexes: Vec<String> = Vec::with_capacity(definition.indexes.len());
    for field in definition.indexes {
        if field.is_empty() {
            return Err(StorageError::Schema {
                table: name.to_owned(),
                message: "index field names must not be empty".into(),
            });
        }
        if !indexes.contains(&field) {
            indexes.push(field);
        }
    }

    Ok(TableSchema {
        name: name.to_owned(),
        key,
        indexes,
    })
}
