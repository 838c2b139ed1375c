//! Storage error types.

/// Boxed cause carried by [`StorageError::Transaction`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors from storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A table definition is malformed. Raised at construction time.
    #[error("schema error in table '{table}': {message}")]
    Schema {
        /// The offending table.
        table: String,
        /// What is wrong with it.
        message: String,
    },

    /// The backend discriminator is not one of the supported kinds.
    #[error("adapter error: {0}")]
    Adapter(String),

    /// A transaction closure failed; nothing was written.
    #[error("transaction over [{}] aborted: {source}", .tables.join(", "))]
    Transaction {
        /// Tables named by the transaction.
        tables: Vec<String>,
        /// The error returned by the closure.
        #[source]
        source: BoxError,
    },

    /// A table changed between a transaction's snapshot and its commit.
    #[error("transaction conflict: table '{table}' was modified concurrently")]
    Conflict {
        /// The table whose revision moved.
        table: String,
    },

    /// A persisted entry could not be decoded.
    ///
    /// Reads recover from this locally; it only escapes from explicit
    /// decoding helpers.
    #[error("corrupted record at '{key}': {reason}")]
    CorruptedRecord {
        /// The physical key of the entry.
        key: String,
        /// Why decoding failed.
        reason: String,
    },

    /// A record lacks a value for its table's key field.
    #[error("record for table '{table}' is missing key field '{field}'")]
    MissingKey {
        /// Table being written.
        table: String,
        /// The declared key field.
        field: String,
    },

    /// The key value is not a supported key type, or is malformed.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The record is not a JSON object.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// The table is not declared in the schema.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// The requested database version is older than the stored one.
    #[error("requested version {requested} is lower than stored version {stored}")]
    Version {
        /// Version passed at open.
        requested: u32,
        /// Version found in the database.
        stored: u32,
    },

    /// An aggregate was computed over a non-numeric field.
    #[error("cannot aggregate field '{field}': {reason}")]
    Aggregate {
        /// The aggregated field.
        field: String,
        /// What was found instead of a number.
        reason: String,
    },

    /// A query condition descriptor is malformed.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Configuration could not be parsed or failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Connection to the storage backend failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// A storage operation failed.
    #[error("storage error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Build the error raised for a table definition without a key field.
    pub(crate) fn missing_key_definition(table: &str) -> Self {
        Self::Schema {
            table: table.to_owned(),
            message: "table definition must declare a key field; expected shape \
                      { key, record, indexes? }"
                .to_owned(),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
