//! Change ledger: the append-only audit trail.
//!
//! Every ingestion or rollback run is a [`ChangeEvent`]. Within a run, each
//! attempted mutation of a target-table row is recorded as a [`RowChange`]
//! carrying before/after images, the changed columns and whether the change
//! was applied or withheld as a conflict.
//!
//! ## Lifecycle
//!
//! ```text
//! begin() ──► RUNNING ──record_all()*──► finish(status) ──► terminal
//!                                            │
//!                                            └── finish() again: last write wins
//! ```
//!
//! Row changes are only accepted while their event is `RUNNING`; once
//! appended they are never rewritten.

mod fs;
mod memory;

pub use fs::FileSystemLedger;
pub use memory::InMemoryLedger;

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rowdelta_core::Row;
use serde::{Deserialize, Serialize};

crate::id::uuid_id!(
    /// Identifier of a [`ChangeEvent`].
    ChangeEventId
);

/// Status of a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    /// The run is in progress.
    Running,
    /// Changes were applied without conflicts.
    Success,
    /// The run classified rows but wrote nothing.
    DryRun,
    /// Changes were applied and at least one row was withheld as a conflict.
    Conflicts,
    /// The run aborted.
    Failed,
    /// Nothing was inserted, updated, conflicted or rejected.
    NoChanges,
}

impl EventStatus {
    /// Returns `true` for every status except [`EventStatus::Running`].
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Returns the persisted name of this status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::DryRun => "DRY_RUN",
            Self::Conflicts => "CONFLICTS",
            Self::Failed => "FAILED",
            Self::NoChanges => "NO_CHANGES",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row counts recorded on a finished event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    /// Rows inserted.
    pub inserted: u64,
    /// Rows updated.
    pub updated: u64,
    /// Rows deleted (rollback of inserts).
    #[serde(default)]
    pub deleted: u64,
    /// Rows left unchanged.
    pub unchanged: u64,
    /// Rows withheld as conflicts.
    pub conflicted: u64,
    /// Rows rejected by validation.
    pub rejected: u64,
}

impl ChangeCounts {
    /// Adds `other` into `self`.
    pub fn add(&mut self, other: &ChangeCounts) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.unchanged += other.unchanged;
        self.conflicted += other.conflicted;
        self.rejected += other.rejected;
    }

    /// Returns `true` if nothing was written, withheld or rejected.
    #[must_use]
    pub fn is_quiet(&self) -> bool {
        self.inserted == 0
            && self.updated == 0
            && self.deleted == 0
            && self.conflicted == 0
            && self.rejected == 0
    }
}

/// Parameters for [`ChangeLedger::begin`].
#[derive(Debug, Clone, Default)]
pub struct BeginEvent {
    /// Who started the run.
    pub actor: String,
    /// Source label (e.g. `ingest`, `rollback`).
    pub source: String,
    /// Input file label.
    pub file_label: Option<String>,
    /// Whether the run is a dry run.
    pub dry_run: bool,
    /// Earliest business date covered by the run.
    pub date_min: Option<NaiveDate>,
    /// Latest business date covered by the run.
    pub date_max: Option<NaiveDate>,
}

impl BeginEvent {
    /// Creates parameters for a live run.
    #[must_use]
    pub fn new(actor: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            source: source.into(),
            ..Self::default()
        }
    }

    /// Sets the input file label.
    #[must_use]
    pub fn with_file_label(mut self, label: impl Into<String>) -> Self {
        self.file_label = Some(label.into());
        self
    }

    /// Marks the run as a dry run.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Sets the business date range covered by the run.
    #[must_use]
    pub fn with_date_bounds(mut self, min: Option<NaiveDate>, max: Option<NaiveDate>) -> Self {
        self.date_min = min;
        self.date_max = max;
        self
    }
}

/// One ingestion or rollback run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Event identifier.
    pub id: ChangeEventId,
    /// Current status.
    pub status: EventStatus,
    /// Who started the run.
    pub actor: String,
    /// Source label.
    pub source: String,
    /// Input file label.
    pub file_label: Option<String>,
    /// Whether the run was a dry run.
    pub dry_run: bool,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run last finished.
    pub finished_at: Option<DateTime<Utc>>,
    /// Final row counts.
    pub counts: ChangeCounts,
    /// Free-text notes.
    pub notes: Option<String>,
    /// Earliest business date covered.
    pub date_min: Option<NaiveDate>,
    /// Latest business date covered.
    pub date_max: Option<NaiveDate>,
}

impl ChangeEvent {
    /// Creates a `RUNNING` event from begin parameters.
    #[must_use]
    pub fn start(params: BeginEvent) -> Self {
        Self {
            id: ChangeEventId::generate(),
            status: EventStatus::Running,
            actor: params.actor,
            source: params.source,
            file_label: params.file_label,
            dry_run: params.dry_run,
            started_at: Utc::now(),
            finished_at: None,
            counts: ChangeCounts::default(),
            notes: None,
            date_min: params.date_min,
            date_max: params.date_max,
        }
    }

    fn apply_finish(&mut self, status: EventStatus, counts: ChangeCounts, notes: Option<String>) {
        self.status = status;
        self.counts = counts;
        self.notes = notes;
        self.finished_at = Some(Utc::now());
    }
}

/// Kind of row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowOp {
    /// A new row.
    Insert,
    /// An existing row changed.
    Update,
    /// A row was removed.
    Delete,
}

impl fmt::Display for RowOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        })
    }
}

/// One audited mutation attempt against one target-table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    /// Position within the event, assigned by the ledger (1-based).
    #[serde(default)]
    pub sequence: u64,
    /// Owning event.
    pub change_event_id: ChangeEventId,
    /// Target table.
    pub table: String,
    /// Primary-key column of the target table.
    pub primary_key: String,
    /// Primary-key value as text.
    pub pk: String,
    /// Operation.
    pub op: RowOp,
    /// Business columns that changed.
    pub changed_columns: Vec<String>,
    /// Protected columns that differed (conflicts only).
    #[serde(default)]
    pub conflict_columns: Vec<String>,
    /// Row image before the change; `None` for inserts.
    pub before: Option<Row>,
    /// Row image after the change; `None` for deletes.
    pub after: Option<Row>,
    /// Whether the change reached the target table.
    pub applied: bool,
    /// Whether the change was withheld as a conflict.
    pub conflict: bool,
    /// Why the change was withheld.
    pub conflict_reason: Option<String>,
    /// When the change was recorded.
    pub created_at: DateTime<Utc>,
}

impl RowChange {
    /// Creates an applied change with no images or changed columns.
    #[must_use]
    pub fn new(
        change_event_id: ChangeEventId,
        table: impl Into<String>,
        primary_key: impl Into<String>,
        pk: impl Into<String>,
        op: RowOp,
    ) -> Self {
        Self {
            sequence: 0,
            change_event_id,
            table: table.into(),
            primary_key: primary_key.into(),
            pk: pk.into(),
            op,
            changed_columns: Vec::new(),
            conflict_columns: Vec::new(),
            before: None,
            after: None,
            applied: true,
            conflict: false,
            conflict_reason: None,
            created_at: Utc::now(),
        }
    }

    /// Sets the changed columns.
    #[must_use]
    pub fn with_changed_columns(mut self, columns: Vec<String>) -> Self {
        self.changed_columns = columns;
        self
    }

    /// Sets the before-image.
    #[must_use]
    pub fn with_before(mut self, before: Row) -> Self {
        self.before = Some(before);
        self
    }

    /// Sets the after-image.
    #[must_use]
    pub fn with_after(mut self, after: Row) -> Self {
        self.after = Some(after);
        self
    }

    /// Turns this change into a withheld conflict on `columns`.
    ///
    /// The reason reads `Protected field mismatch: a, b`.
    #[must_use]
    pub fn into_conflict(mut self, columns: Vec<String>) -> Self {
        self.conflict_reason = Some(format!("Protected field mismatch: {}", columns.join(", ")));
        self.conflict_columns = columns;
        self.applied = false;
        self.conflict = true;
        self
    }
}

/// Errors from change ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// I/O error during ledger persistence.
    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("ledger serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The change event does not exist.
    #[error("change event {0} not found")]
    EventNotFound(ChangeEventId),

    /// Row changes were offered for an event that already finished.
    #[error("change event {0} is already finished")]
    EventFinished(ChangeEventId),

    /// `finish` was called with a non-terminal status.
    #[error("cannot finish a change event with status {0}")]
    InvalidStatus(EventStatus),
}

/// Append-only store of change events and row changes.
///
/// Implementations must keep [`RowChange`] entries immutable once appended
/// and must refuse them for events that are missing or already finished.
pub trait ChangeLedger: Send + Sync {
    /// Opens a new `RUNNING` event.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on persistence failure.
    fn begin(&self, params: BeginEvent) -> Result<ChangeEvent, LedgerError>;

    /// Appends `changes` in order, assigning each its sequence number.
    ///
    /// Either every change is appended or none is. Returns the number of
    /// changes appended.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::EventNotFound`] or [`LedgerError::EventFinished`]
    /// if any change references an unknown or finished event.
    fn record_all(&self, changes: Vec<RowChange>) -> Result<usize, LedgerError>;

    /// Moves an event to a terminal status with its final counts and notes.
    ///
    /// May be called again on a finished event; the last call wins.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidStatus`] for `RUNNING` and
    /// [`LedgerError::EventNotFound`] for unknown events.
    fn finish(
        &self,
        id: &ChangeEventId,
        status: EventStatus,
        counts: ChangeCounts,
        notes: Option<String>,
    ) -> Result<ChangeEvent, LedgerError>;

    /// Loads an event.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on persistence failure.
    fn event(&self, id: &ChangeEventId) -> Result<Option<ChangeEvent>, LedgerError>;

    /// Lists events, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on persistence failure.
    fn list_events(&self, limit: Option<usize>) -> Result<Vec<ChangeEvent>, LedgerError>;

    /// Returns every row change of an event in recording order.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::EventNotFound`] for unknown events.
    fn row_changes(&self, id: &ChangeEventId) -> Result<Vec<RowChange>, LedgerError>;

    /// Appends a single row change.
    ///
    /// # Errors
    ///
    /// See [`ChangeLedger::record_all`].
    fn record(&self, change: RowChange) -> Result<(), LedgerError> {
        self.record_all(vec![change]).map(|_| ())
    }

    /// Returns the conflict entries of an event.
    ///
    /// # Errors
    ///
    /// See [`ChangeLedger::row_changes`].
    fn conflicts(&self, id: &ChangeEventId) -> Result<Vec<RowChange>, LedgerError> {
        Ok(self
            .row_changes(id)?
            .into_iter()
            .filter(|c| c.conflict)
            .collect())
    }

    /// Returns the applied entries of an event.
    ///
    /// # Errors
    ///
    /// See [`ChangeLedger::row_changes`].
    fn applied_changes(&self, id: &ChangeEventId) -> Result<Vec<RowChange>, LedgerError> {
        Ok(self
            .row_changes(id)?
            .into_iter()
            .filter(|c| c.applied)
            .collect())
    }
}

/// Checks that `status` may end an event.
pub(crate) fn check_terminal(status: EventStatus) -> Result<(), LedgerError> {
    if status.is_terminal() {
        Ok(())
    } else {
        Err(LedgerError::InvalidStatus(status))
    }
}

/// Distinct event ids referenced by `changes`, in first-seen order.
pub(crate) fn referenced_events(changes: &[RowChange]) -> Vec<ChangeEventId> {
    let mut ids: Vec<ChangeEventId> = Vec::new();
    for change in changes {
        if !ids.contains(&change.change_event_id) {
            ids.push(change.change_event_id);
        }
    }
    ids
}

/// Validates that `event` exists and still accepts row changes.
pub(crate) fn check_open(
    id: ChangeEventId,
    event: Option<&ChangeEvent>,
) -> Result<(), LedgerError> {
    match event {
        None => Err(LedgerError::EventNotFound(id)),
        Some(e) if e.status.is_terminal() => Err(LedgerError::EventFinished(id)),
        Some(_) => Ok(()),
    }
}
