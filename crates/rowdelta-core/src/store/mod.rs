//! Relational store boundary.
//!
//! The merge engine and the rollback controller only need three primitives
//! from the database that holds the target tables:
//!
//! - a bulk point lookup by primary key ([`RelationalStore::fetch_by_keys`])
//! - a batch insert-or-update keyed on an explicit conflict column
//!   ([`RelationalStore::upsert_batch`])
//! - single-row column updates and deletes
//!
//! Each call is one transaction: a batch upsert applies every row or none.
//! Nothing spans calls, so callers chunk large inputs and accept that a
//! failure leaves earlier chunks committed.

mod memory;

pub use memory::InMemoryStore;

use std::collections::HashMap;

use crate::value::Row;

/// Errors from relational store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The table does not exist.
    #[error("table '{0}' not found")]
    TableNotFound(String),

    /// The table already exists.
    #[error("table '{0}' already exists")]
    TableAlreadyExists(String),

    /// The conflict key does not match the table's primary key.
    #[error("table '{table}' is keyed on '{expected}', not '{actual}'")]
    PrimaryKeyMismatch {
        /// Table name.
        table: String,
        /// Declared primary-key column.
        expected: String,
        /// Column the caller used.
        actual: String,
    },

    /// A row handed to the store has no usable primary-key value.
    #[error("table '{table}': row without a value for primary key '{column}'")]
    MissingPrimaryKey {
        /// Table name.
        table: String,
        /// Primary-key column.
        column: String,
    },

    /// The store could not serve a read.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A write was rejected or failed; nothing from the batch was applied.
    #[error("write failed: {0}")]
    WriteFailure(String),
}

/// Transactional access to the target tables.
///
/// Keys are passed as the canonical text rendering of the primary-key value
/// (see [`Value::key_text`](crate::Value::key_text)).
pub trait RelationalStore: Send + Sync {
    /// Fetches the rows whose primary key is in `keys`.
    ///
    /// Returns a map from key to the full stored row. Keys without a stored
    /// row are absent from the map.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TableNotFound`] or [`StoreError::Unavailable`].
    fn fetch_by_keys(
        &self,
        table: &str,
        primary_key: &str,
        keys: &[String],
    ) -> Result<HashMap<String, Row>, StoreError>;

    /// Inserts or updates `rows`, using `primary_key` as the conflict key.
    ///
    /// Columns present in a row overwrite the stored values; columns absent
    /// from it are left untouched. The batch is atomic.
    ///
    /// Returns the number of rows written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WriteFailure`] (or a more specific variant) if
    /// the batch could not be applied; no row of the batch is then visible.
    fn upsert_batch(
        &self,
        table: &str,
        primary_key: &str,
        rows: &[Row],
    ) -> Result<usize, StoreError>;

    /// Overwrites `values` on the row identified by `key`.
    ///
    /// Returns `false` if no such row exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update could not be applied.
    fn update_columns(
        &self,
        table: &str,
        primary_key: &str,
        key: &str,
        values: &Row,
    ) -> Result<bool, StoreError>;

    /// Deletes the row identified by `key`. Returns `true` if it existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the delete could not be applied.
    fn delete_by_key(&self, table: &str, primary_key: &str, key: &str)
        -> Result<bool, StoreError>;

    /// Returns every row of `table`, ordered by primary key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TableNotFound`] or [`StoreError::Unavailable`].
    fn scan(&self, table: &str) -> Result<Vec<Row>, StoreError>;
}
