//! The `RowDelta` facade.

use std::sync::Arc;

use rowdelta_core::{RelationalStore, Row, TableSpec};
use rowdelta_storage::{ChangeEventId, ChangeLedger, StateImage, StateStore};

use crate::audit::AuditLog;
use crate::builder::RowDeltaBuilder;
use crate::config::RowDeltaConfig;
use crate::error::DbError;
use crate::ingest::{self, IngestReport, IngestRequest};
use crate::merge::{MergeEngine, MergeOutcome, MergeProgress};
use crate::rollback::{RollbackController, RollbackOutcome, RollbackToSummary};

/// Metadata column used to order column diffs.
const SOURCE_ROW_COLUMN: &str = "source_row_num";

/// Change-tracked access to a set of target tables.
///
/// Ties together the relational store, the change ledger and the state
/// history. Each operation is synchronous and assumes it is the only writer
/// of the tables it touches.
pub struct RowDelta {
    config: RowDeltaConfig,
    store: Arc<dyn RelationalStore>,
    ledger: Arc<dyn ChangeLedger>,
    state: Arc<dyn StateStore>,
}

impl RowDelta {
    /// Returns a builder.
    #[must_use]
    pub fn builder() -> RowDeltaBuilder {
        RowDeltaBuilder::new()
    }

    /// Opens an instance over `store` with in-memory ledger and state.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if the default configuration is invalid.
    pub fn open(store: Arc<dyn RelationalStore>) -> Result<Self, DbError> {
        RowDeltaBuilder::new().store(store).build()
    }

    pub(crate) fn from_parts(
        config: RowDeltaConfig,
        store: Arc<dyn RelationalStore>,
        ledger: Arc<dyn ChangeLedger>,
        state: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            config,
            store,
            ledger,
            state,
        }
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &RowDeltaConfig {
        &self.config
    }

    /// Returns the relational store.
    #[must_use]
    pub fn store(&self) -> &dyn RelationalStore {
        self.store.as_ref()
    }

    /// Returns the change ledger.
    #[must_use]
    pub fn ledger(&self) -> &dyn ChangeLedger {
        self.ledger.as_ref()
    }

    /// Returns the state store.
    #[must_use]
    pub fn state_store(&self) -> &dyn StateStore {
        self.state.as_ref()
    }

    fn engine(&self) -> MergeEngine<'_> {
        MergeEngine::new(self.store.as_ref(), self.ledger.as_ref(), &self.config.merge)
    }

    fn controller(&self) -> RollbackController<'_> {
        RollbackController::new(self.store.as_ref(), self.ledger.as_ref(), self.state.as_ref())
    }

    /// Runs an ingestion: one change event, one merge per table, then a
    /// state image for live runs that changed something.
    ///
    /// # Errors
    ///
    /// Returns the first merge error after marking the event `FAILED`.
    pub fn ingest(&self, request: IngestRequest) -> Result<IngestReport, DbError> {
        ingest::run(&self.engine(), self.ledger(), self.state_store(), request)
    }

    /// Like [`ingest`](Self::ingest), reporting merge progress to `progress`.
    ///
    /// # Errors
    ///
    /// See [`ingest`](Self::ingest).
    pub fn ingest_with_progress(
        &self,
        request: IngestRequest,
        progress: &dyn Fn(&MergeProgress<'_>),
    ) -> Result<IngestReport, DbError> {
        let engine = self.engine().with_progress(progress);
        ingest::run(&engine, self.ledger(), self.state_store(), request)
    }

    /// Merges rows into one table under an event the caller manages.
    ///
    /// # Errors
    ///
    /// See [`MergeEngine::merge`].
    pub fn merge(
        &self,
        event: &ChangeEventId,
        table: &TableSpec,
        rows: Vec<Row>,
        dry_run: bool,
    ) -> Result<MergeOutcome, DbError> {
        self.engine().merge(event, table, rows, dry_run)
    }

    /// Creates (or reuses) the state image for an event and moves HEAD to it.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::State`] on persistence failure.
    pub fn create_state_image(
        &self,
        event: &ChangeEventId,
        notes: Option<&str>,
    ) -> Result<StateImage, DbError> {
        Ok(self.state.create_or_reuse(*event, notes)?)
    }

    /// Returns the image HEAD points at.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::State`] if HEAD cannot be resolved.
    pub fn head(&self) -> Result<Option<StateImage>, DbError> {
        Ok(self.state.head()?)
    }

    /// Returns the image chain from HEAD back to the root.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::State`] for a damaged chain.
    pub fn history(&self) -> Result<Vec<StateImage>, DbError> {
        Ok(self.state.history()?)
    }

    /// Returns the images from HEAD down to the image of `event`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::State`] if `event` has no image, is not an
    /// ancestor of HEAD, or the chain is damaged.
    pub fn walk_to(&self, event: &ChangeEventId) -> Result<Vec<StateImage>, DbError> {
        Ok(self.state.walk_to(event)?)
    }

    /// Undoes one change event. `actor` defaults to the configured
    /// rollback actor.
    ///
    /// # Errors
    ///
    /// See [`RollbackController::rollback_one`].
    pub fn rollback_one(
        &self,
        event: &ChangeEventId,
        actor: Option<&str>,
    ) -> Result<RollbackOutcome, DbError> {
        self.controller()
            .rollback_one(event, actor.unwrap_or(&self.config.rollback_actor))
    }

    /// Rolls back every event between HEAD and `event`.
    ///
    /// # Errors
    ///
    /// See [`RollbackController::rollback_to`].
    pub fn rollback_to(
        &self,
        event: &ChangeEventId,
        actor: Option<&str>,
    ) -> Result<RollbackToSummary, DbError> {
        self.controller()
            .rollback_to(event, actor.unwrap_or(&self.config.rollback_actor))
    }

    /// Returns audit queries over the ledger.
    #[must_use]
    pub fn audit(&self) -> AuditLog<'_> {
        AuditLog::new(self.ledger.as_ref(), Some(SOURCE_ROW_COLUMN))
    }
}
