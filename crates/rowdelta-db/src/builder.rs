//! Fluent builder for `RowDelta` construction.

use std::path::PathBuf;
use std::sync::Arc;

use rowdelta_core::RelationalStore;
use rowdelta_storage::{
    ChangeLedger, FileSystemLedger, FileSystemStateStore, InMemoryLedger, InMemoryStateStore,
    StateStore,
};

use crate::config::{MergeOptions, RowDeltaConfig};
use crate::db::RowDelta;
use crate::error::DbError;

/// Fluent builder for constructing a [`RowDelta`] instance.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use rowdelta_core::InMemoryStore;
/// use rowdelta_db::RowDelta;
///
/// let store = Arc::new(InMemoryStore::new());
/// store.create_table("orders", "order_id").unwrap();
/// let db = RowDelta::builder().store(store).build().unwrap();
/// assert!(db.head().unwrap().is_none());
/// ```
pub struct RowDeltaBuilder {
    config: RowDeltaConfig,
    store: Option<Arc<dyn RelationalStore>>,
    ledger: Option<Arc<dyn ChangeLedger>>,
    state: Option<Arc<dyn StateStore>>,
}

impl RowDeltaBuilder {
    /// Create a new builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: RowDeltaConfig::default(),
            store: None,
            ledger: None,
            state: None,
        }
    }

    /// Use `config` as the starting configuration.
    #[must_use]
    pub fn config(mut self, config: RowDeltaConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the storage directory for the ledger and state history.
    #[must_use]
    pub fn storage_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage_dir = Some(path.into());
        self
    }

    /// Set merge engine options.
    #[must_use]
    pub fn merge_options(mut self, options: MergeOptions) -> Self {
        self.config.merge = options;
        self
    }

    /// Set the actor recorded on rollbacks that name none.
    #[must_use]
    pub fn rollback_actor(mut self, actor: impl Into<String>) -> Self {
        self.config.rollback_actor = actor.into();
        self
    }

    /// Set the relational store holding the target tables (required).
    #[must_use]
    pub fn store(mut self, store: Arc<dyn RelationalStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a custom change ledger instead of the configured default.
    #[must_use]
    pub fn ledger(mut self, ledger: Arc<dyn ChangeLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Use a custom state store instead of the configured default.
    #[must_use]
    pub fn state_store(mut self, state: Arc<dyn StateStore>) -> Self {
        self.state = Some(state);
        self
    }

    /// Build the `RowDelta` instance.
    ///
    /// Without an explicit ledger or state store, filesystem-backed ones
    /// are used when a storage directory is set and in-memory ones otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if no store was given or the merge options
    /// are invalid.
    pub fn build(self) -> Result<RowDelta, DbError> {
        let store = self
            .store
            .ok_or_else(|| DbError::Config("no relational store configured".to_string()))?;
        self.config.merge.validate()?;

        let dir = self.config.storage_dir.as_deref();
        let ledger: Arc<dyn ChangeLedger> = match (self.ledger, dir) {
            (Some(ledger), _) => ledger,
            (None, Some(dir)) => Arc::new(FileSystemLedger::new(dir)),
            (None, None) => Arc::new(InMemoryLedger::new()),
        };
        let state: Arc<dyn StateStore> = match (self.state, dir) {
            (Some(state), _) => state,
            (None, Some(dir)) => Arc::new(FileSystemStateStore::new(dir)),
            (None, None) => Arc::new(InMemoryStateStore::new()),
        };
        Ok(RowDelta::from_parts(self.config, store, ledger, state))
    }
}

impl Default for RowDeltaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowdelta_core::InMemoryStore;

    #[test]
    fn test_build_requires_store() {
        assert!(matches!(
            RowDeltaBuilder::new().build(),
            Err(DbError::Config(_))
        ));
    }

    #[test]
    fn test_build_rejects_bad_options() {
        let result = RowDeltaBuilder::new()
            .store(Arc::new(InMemoryStore::new()))
            .merge_options(MergeOptions::default().with_chunk_size(0))
            .build();
        assert!(matches!(result, Err(DbError::Config(_))));
    }

    #[test]
    fn test_storage_dir_selects_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let db = RowDeltaBuilder::new()
            .store(Arc::new(InMemoryStore::new()))
            .storage_dir(dir.path())
            .rollback_actor("ops")
            .build()
            .unwrap();
        assert_eq!(db.config().rollback_actor, "ops");
        db.create_state_image(&rowdelta_storage::ChangeEventId::generate(), None)
            .unwrap();
        assert!(dir.path().join("state").join("HEAD").exists());
    }
}
