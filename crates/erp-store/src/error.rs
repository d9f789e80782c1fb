use crate::table::{RowId, Table};

/// Errors from ledger store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No row with this id exists in the table.
    #[error("{table} row {id} not found")]
    NotFound { table: Table, id: RowId },

    /// An insert carried an id that is already taken.
    #[error("{table} row {id} already exists")]
    DuplicateId { table: Table, id: RowId },

    /// A row could not be converted to or from its record type.
    #[error("malformed {table} row: {reason}")]
    MalformedRow { table: Table, reason: String },

    /// Serialization or deserialization failure outside a single row.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The backend refused or failed the statement.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// An internal lock was poisoned by a panicking writer.
    #[error("store lock poisoned")]
    Poisoned,
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
