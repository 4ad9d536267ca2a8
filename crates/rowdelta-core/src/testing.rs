//! Testing utilities for code built on [`RelationalStore`].
//!
//! [`FlakyStore`] wraps any store and fails selected operations on demand,
//! so error paths (aborted merges, swallowed backfills, partially failed
//! rollbacks) can be exercised without a real database.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::store::{RelationalStore, StoreError};
use crate::value::Row;

#[derive(Debug, Default)]
struct Faults {
    fail_fetch: bool,
    fail_update: bool,
    fail_delete: bool,
    /// Number of upsert batches still allowed to succeed; `None` = unlimited.
    upserts_left: Option<usize>,
    upsert_calls: usize,
}

/// Store wrapper with injectable failures.
///
/// Every fault is off by default, in which case calls pass straight through
/// to the inner store.
pub struct FlakyStore<S> {
    inner: S,
    faults: Mutex<Faults>,
}

impl<S: RelationalStore> FlakyStore<S> {
    /// Wraps `inner` with all faults disabled.
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Returns the wrapped store.
    #[must_use]
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Makes every `fetch_by_keys` call fail with [`StoreError::Unavailable`].
    pub fn fail_fetches(&self, fail: bool) {
        self.faults.lock().fail_fetch = fail;
    }

    /// Makes every `update_columns` call fail with [`StoreError::WriteFailure`].
    pub fn fail_updates(&self, fail: bool) {
        self.faults.lock().fail_update = fail;
    }

    /// Makes every `delete_by_key` call fail with [`StoreError::WriteFailure`].
    pub fn fail_deletes(&self, fail: bool) {
        self.faults.lock().fail_delete = fail;
    }

    /// Lets `n` more upsert batches through, then fails the rest.
    pub fn fail_upserts_after(&self, n: usize) {
        self.faults.lock().upserts_left = Some(n);
    }

    /// Clears every fault.
    pub fn heal(&self) {
        let mut faults = self.faults.lock();
        let calls = faults.upsert_calls;
        *faults = Faults {
            upsert_calls: calls,
            ..Faults::default()
        };
    }

    /// Number of `upsert_batch` calls seen so far, including failed ones.
    #[must_use]
    pub fn upsert_calls(&self) -> usize {
        self.faults.lock().upsert_calls
    }
}

impl<S: RelationalStore> RelationalStore for FlakyStore<S> {
    fn fetch_by_keys(
        &self,
        table: &str,
        primary_key: &str,
        keys: &[String],
    ) -> Result<HashMap<String, Row>, StoreError> {
        if self.faults.lock().fail_fetch {
            return Err(StoreError::Unavailable(format!("injected fetch failure on '{table}'")));
        }
        self.inner.fetch_by_keys(table, primary_key, keys)
    }

    fn upsert_batch(
        &self,
        table: &str,
        primary_key: &str,
        rows: &[Row],
    ) -> Result<usize, StoreError> {
        {
            let mut faults = self.faults.lock();
            faults.upsert_calls += 1;
            if let Some(left) = faults.upserts_left.as_mut() {
                if *left == 0 {
                    return Err(StoreError::WriteFailure(format!(
                        "injected upsert failure on '{table}'"
                    )));
                }
                *left -= 1;
            }
        }
        self.inner.upsert_batch(table, primary_key, rows)
    }

    fn update_columns(
        &self,
        table: &str,
        primary_key: &str,
        key: &str,
        values: &Row,
    ) -> Result<bool, StoreError> {
        if self.faults.lock().fail_update {
            return Err(StoreError::WriteFailure(format!(
                "injected update failure on '{table}' key {key}"
            )));
        }
        self.inner.update_columns(table, primary_key, key, values)
    }

    fn delete_by_key(
        &self,
        table: &str,
        primary_key: &str,
        key: &str,
    ) -> Result<bool, StoreError> {
        if self.faults.lock().fail_delete {
            return Err(StoreError::WriteFailure(format!(
                "injected delete failure on '{table}' key {key}"
            )));
        }
        self.inner.delete_by_key(table, primary_key, key)
    }

    fn scan(&self, table: &str) -> Result<Vec<Row>, StoreError> {
        self.inner.scan(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::value::{row_of, Value};

    fn flaky() -> FlakyStore<InMemoryStore> {
        let inner = InMemoryStore::new();
        inner.create_table("t", "id").unwrap();
        FlakyStore::new(inner)
    }

    #[test]
    fn test_passthrough_by_default() {
        let store = flaky();
        let row = row_of([("id", Value::Int(1))]);
        assert_eq!(store.upsert_batch("t", "id", &[row]).unwrap(), 1);
        assert_eq!(store.fetch_by_keys("t", "id", &["1".into()]).unwrap().len(), 1);
        assert!(store.delete_by_key("t", "id", "1").unwrap());
    }

    #[test]
    fn test_fail_upserts_after() {
        let store = flaky();
        store.fail_upserts_after(1);
        let row = row_of([("id", Value::Int(1))]);
        assert!(store.upsert_batch("t", "id", std::slice::from_ref(&row)).is_ok());
        assert!(matches!(
            store.upsert_batch("t", "id", &[row]),
            Err(StoreError::WriteFailure(_))
        ));
        assert_eq!(store.upsert_calls(), 2);
        assert_eq!(store.inner().row_count("t").unwrap(), 1);
    }

    #[test]
    fn test_heal_clears_faults() {
        let store = flaky();
        store.fail_fetches(true);
        store.fail_deletes(true);
        assert!(store.fetch_by_keys("t", "id", &[]).is_err());
        assert!(store.delete_by_key("t", "id", "1").is_err());
        store.heal();
        assert!(store.fetch_by_keys("t", "id", &[]).is_ok());
        assert!(store.delete_by_key("t", "id", "1").is_ok());
    }
}
