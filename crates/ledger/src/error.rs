use thiserror::Error;

/// Errors that can occur when interacting with the ledger store.
///
/// A conditional write that matches no row is not an error: those
/// operations return `false` and the caller treats it as a no-op.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A row with the same identity already exists.
    #[error("Duplicate {entity}: {id}")]
    Duplicate { entity: &'static str, id: String },

    /// A stored row could not be turned back into a domain record.
    #[error("Corrupt {table} row: {reason}")]
    Decode { table: &'static str, reason: String },

    /// A value does not fit the column it is stored in.
    #[error("Value out of range for {column}: {value}")]
    OutOfRange { column: &'static str, value: String },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
