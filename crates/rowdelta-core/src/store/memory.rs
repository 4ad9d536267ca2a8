//! In-memory relational store.
//!
//! Rows are kept per table in a `BTreeMap` keyed by the canonical primary-key
//! text, so scans come back in key order. A single `RwLock` guards all
//! tables; every trait call takes it once, which makes each call atomic.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use tracing::debug;

use super::{RelationalStore, StoreError};
use crate::value::{column_value, Row};

/// Internal state for a single table.
struct MemTable {
    /// Name of the primary key column.
    primary_key: String,
    /// Rows keyed by stringified primary key.
    rows: BTreeMap<String, Row>,
}

impl MemTable {
    fn check_key(&self, table: &str, primary_key: &str) -> Result<(), StoreError> {
        if self.primary_key == primary_key {
            Ok(())
        } else {
            Err(StoreError::PrimaryKeyMismatch {
                table: table.to_string(),
                expected: self.primary_key.clone(),
                actual: primary_key.to_string(),
            })
        }
    }
}

/// Primary-key-based in-memory table store.
///
/// Tables must be registered with [`InMemoryStore::create_table`] before
/// use; schema provisioning is the caller's job.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<HashMap<String, MemTable>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new table keyed on `primary_key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TableAlreadyExists`] if the name is taken.
    pub fn create_table(&self, name: &str, primary_key: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if tables.contains_key(name) {
            return Err(StoreError::TableAlreadyExists(name.to_string()));
        }
        tables.insert(
            name.to_string(),
            MemTable {
                primary_key: primary_key.to_string(),
                rows: BTreeMap::new(),
            },
        );
        debug!(table = name, primary_key, "table created");
        Ok(())
    }

    /// Returns the number of rows in `table`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TableNotFound`] if the table does not exist.
    pub fn row_count(&self, table: &str) -> Result<usize, StoreError> {
        self.tables
            .read()
            .get(table)
            .map(|t| t.rows.len())
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))
    }

    /// Returns a single row by key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TableNotFound`] if the table does not exist.
    pub fn get(&self, table: &str, key: &str) -> Result<Option<Row>, StoreError> {
        self.tables
            .read()
            .get(table)
            .map(|t| t.rows.get(key).cloned())
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))
    }

    /// Returns the names of all registered tables, sorted.
    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl RelationalStore for InMemoryStore {
    fn fetch_by_keys(
        &self,
        table: &str,
        primary_key: &str,
        keys: &[String],
    ) -> Result<HashMap<String, Row>, StoreError> {
        let tables = self.tables.read();
        let state = tables
            .get(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        state.check_key(table, primary_key)?;
        Ok(keys
            .iter()
            .filter_map(|k| state.rows.get(k).map(|row| (k.clone(), row.clone())))
            .collect())
    }

    fn upsert_batch(
        &self,
        table: &str,
        primary_key: &str,
        rows: &[Row],
    ) -> Result<usize, StoreError> {
        let mut tables = self.tables.write();
        let state = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        state.check_key(table, primary_key)?;

        // Resolve every key before touching the table so the batch is all-or-nothing.
        let keys = rows
            .iter()
            .map(|row| {
                column_value(row, primary_key)
                    .key_text()
                    .ok_or_else(|| StoreError::MissingPrimaryKey {
                        table: table.to_string(),
                        column: primary_key.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        for (key, row) in keys.into_iter().zip(rows) {
            state
                .rows
                .entry(key)
                .and_modify(|stored| stored.extend(row.clone()))
                .or_insert_with(|| row.clone());
        }
        Ok(rows.len())
    }

    fn update_columns(
        &self,
        table: &str,
        primary_key: &str,
        key: &str,
        values: &Row,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write();
        let state = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        state.check_key(table, primary_key)?;
        match state.rows.get_mut(key) {
            Some(stored) => {
                stored.extend(values.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_by_key(
        &self,
        table: &str,
        primary_key: &str,
        key: &str,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write();
        let state = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        state.check_key(table, primary_key)?;
        Ok(state.rows.remove(key).is_some())
    }

    fn scan(&self, table: &str) -> Result<Vec<Row>, StoreError> {
        self.tables
            .read()
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))
    }
}
