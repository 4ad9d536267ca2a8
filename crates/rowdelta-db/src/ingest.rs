//! Ingestion runs: one change event spanning the merge of several tables.

use chrono::NaiveDate;
use rowdelta_core::{Row, TableSpec};
use rowdelta_storage::{
    BeginEvent, ChangeCounts, ChangeEvent, ChangeEventId, ChangeLedger, EventStatus, RowOp,
    StateImage, StateStore,
};
use tracing::{info, warn};

use crate::error::DbError;
use crate::merge::{MergeEngine, MergeOutcome};

/// Source label of ingestion events.
pub const INGEST_SOURCE: &str = "ingest";

/// Rows destined for one target table.
#[derive(Debug, Clone)]
pub struct TableBatch {
    /// Target table declaration.
    pub table: TableSpec,
    /// Incoming rows.
    pub rows: Vec<Row>,
}

/// A request to ingest one or more tables under a single change event.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    /// Who runs the ingestion.
    pub actor: String,
    /// Source label recorded on the event.
    pub source: String,
    /// Input file label.
    pub file_label: Option<String>,
    /// Classify only; write nothing.
    pub dry_run: bool,
    /// Tables to merge, in order.
    pub tables: Vec<TableBatch>,
}

impl IngestRequest {
    /// Creates an empty live request.
    #[must_use]
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            source: INGEST_SOURCE.to_string(),
            file_label: None,
            dry_run: false,
            tables: Vec::new(),
        }
    }

    /// Sets the source label.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Sets the input file label.
    #[must_use]
    pub fn with_file_label(mut self, label: impl Into<String>) -> Self {
        self.file_label = Some(label.into());
        self
    }

    /// Marks the request as a dry run.
    #[must_use]
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Adds a table to merge.
    #[must_use]
    pub fn with_table(mut self, table: TableSpec, rows: Vec<Row>) -> Self {
        self.tables.push(TableBatch { table, rows });
        self
    }

    /// Earliest and latest business date over every table's date column.
    ///
    /// Values are read as ISO `YYYY-MM-DD`; anything longer (a timestamp) is
    /// cut to its date prefix, and unparseable values are ignored.
    #[must_use]
    pub fn date_bounds(&self) -> (Option<NaiveDate>, Option<NaiveDate>) {
        let dates = self.tables.iter().flat_map(|batch| {
            let column = batch.table.date_column.as_deref();
            batch
                .rows
                .iter()
                .filter_map(move |row| column.and_then(|c| row.get(c)))
                .filter_map(|value| parse_date(&value.canonical()))
        });
        dates.fold((None, None), |(min, max): (Option<NaiveDate>, Option<NaiveDate>), d| {
            (
                Some(min.map_or(d, |m| m.min(d))),
                Some(max.map_or(d, |m| m.max(d))),
            )
        })
    }
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    let prefix = text.get(..10).unwrap_or(text);
    NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()
}

/// Outcome of one table within a run.
#[derive(Debug, Clone, PartialEq)]
pub struct TableReport {
    /// Table name.
    pub table: String,
    /// Merge result.
    pub outcome: MergeOutcome,
}

/// Outcome of an ingestion run.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    /// The finished change event.
    pub change_event: ChangeEvent,
    /// Per-table results, in request order.
    pub tables: Vec<TableReport>,
    /// Counts summed over all tables.
    pub totals: ChangeCounts,
    /// State image created for the run, if any.
    pub state_image: Option<StateImage>,
}

impl IngestReport {
    /// Terminal status of the run.
    #[must_use]
    pub fn status(&self) -> EventStatus {
        self.change_event.status
    }

    /// Id of the run's change event.
    #[must_use]
    pub fn change_event_id(&self) -> ChangeEventId {
        self.change_event.id
    }

    /// Looks up the report for one table.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&MergeOutcome> {
        self.tables
            .iter()
            .find(|t| t.table == name)
            .map(|t| &t.outcome)
    }
}

/// Terminal status for a run with the given totals.
fn final_status(dry_run: bool, totals: &ChangeCounts) -> EventStatus {
    if dry_run {
        EventStatus::DryRun
    } else if totals.is_quiet() {
        EventStatus::NoChanges
    } else if totals.conflicted > 0 {
        EventStatus::Conflicts
    } else {
        EventStatus::Success
    }
}

/// Counts for a run that stopped part way through a table.
///
/// Written and withheld rows come from the ledger, which also holds the
/// chunks the failing table committed before the error. Unchanged and
/// rejected rows are only known for the tables that completed.
fn recorded_counts(
    ledger: &dyn ChangeLedger,
    event: &ChangeEventId,
    completed: &ChangeCounts,
) -> ChangeCounts {
    let changes = match ledger.row_changes(event) {
        Ok(changes) => changes,
        Err(e) => {
            warn!(change_event_id = %event, error = %e, "could not count recorded changes");
            return *completed;
        }
    };
    let mut counts = ChangeCounts {
        unchanged: completed.unchanged,
        rejected: completed.rejected,
        ..ChangeCounts::default()
    };
    for change in &changes {
        if change.conflict {
            counts.conflicted += 1;
        } else if change.applied {
            match change.op {
                RowOp::Insert => counts.inserted += 1,
                RowOp::Update => counts.updated += 1,
                RowOp::Delete => counts.deleted += 1,
            }
        }
    }
    counts
}

/// Runs a request: begin, merge each table, finish, snapshot.
pub(crate) fn run(
    engine: &MergeEngine<'_>,
    ledger: &dyn ChangeLedger,
    state: &dyn StateStore,
    request: IngestRequest,
) -> Result<IngestReport, DbError> {
    let (date_min, date_max) = request.date_bounds();
    let mut begin = BeginEvent::new(request.actor, request.source)
        .with_dry_run(request.dry_run)
        .with_date_bounds(date_min, date_max);
    begin.file_label = request.file_label;
    let event = ledger.begin(begin)?;
    info!(change_event_id = %event.id, tables = request.tables.len(), dry_run = request.dry_run, "ingestion started");

    let mut totals = ChangeCounts::default();
    let mut tables = Vec::with_capacity(request.tables.len());
    for batch in request.tables {
        match engine.merge(&event.id, &batch.table, batch.rows, request.dry_run) {
            Ok(outcome) => {
                totals.add(&outcome.stats.to_counts());
                tables.push(TableReport {
                    table: batch.table.name,
                    outcome,
                });
            }
            Err(e) => {
                warn!(change_event_id = %event.id, table = %batch.table.name, error = %e, "ingestion failed");
                let counts = recorded_counts(ledger, &event.id, &totals);
                if let Err(finish_err) =
                    ledger.finish(&event.id, EventStatus::Failed, counts, Some(e.to_string()))
                {
                    warn!(change_event_id = %event.id, error = %finish_err, "could not mark ingestion failed");
                }
                return Err(e);
            }
        }
    }

    let status = final_status(request.dry_run, &totals);
    let change_event = ledger.finish(&event.id, status, totals, None)?;

    let state_image = if request.dry_run || status == EventStatus::NoChanges {
        None
    } else {
        match state.create_or_reuse(event.id, Some("ingestion")) {
            Ok(image) => Some(image),
            Err(e) => {
                warn!(change_event_id = %event.id, error = %e, "state image creation after ingestion failed");
                None
            }
        }
    };

    info!(
        change_event_id = %event.id,
        %status,
        inserted = totals.inserted,
        updated = totals.updated,
        conflicted = totals.conflicted,
        "ingestion finished"
    );
    Ok(IngestReport {
        change_event,
        tables,
        totals,
        state_image,
    })
}
