//! Read-only views over the change ledger.

use chrono::{DateTime, Utc};
use rowdelta_core::{column_value, Row, Value};
use rowdelta_storage::{ChangeEvent, ChangeEventId, ChangeLedger, RowChange, RowOp};
use serde::{Deserialize, Serialize};

use crate::error::DbError;

/// A withheld conflict as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Target table.
    pub table: String,
    /// Primary key as text.
    pub pk: String,
    /// Protected columns that differed.
    pub conflict_columns: Vec<String>,
    /// Recorded reason.
    pub conflict_reason: Option<String>,
    /// The stored row at the time.
    pub before: Option<Row>,
    /// The row that was not written.
    pub proposed: Option<Row>,
    /// When the conflict was recorded.
    pub created_at: DateTime<Utc>,
}

impl From<RowChange> for ConflictRecord {
    fn from(change: RowChange) -> Self {
        Self {
            table: change.table,
            pk: change.pk,
            conflict_columns: change.conflict_columns,
            conflict_reason: change.conflict_reason,
            before: change.before,
            proposed: change.after,
            created_at: change.created_at,
        }
    }
}

/// Before/after values of one column on one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDiff {
    /// Primary key as text.
    pub pk: String,
    /// Operation that changed the column.
    pub op: RowOp,
    /// Value before the change.
    pub before: Value,
    /// Value after the change.
    pub after: Value,
    /// Position of the row in its source file, when recorded.
    pub source_row: Option<i64>,
    /// Ledger sequence of the change.
    pub sequence: u64,
}

/// Queries over the audit trail.
pub struct AuditLog<'a> {
    ledger: &'a dyn ChangeLedger,
    order_column: Option<&'a str>,
}

impl<'a> AuditLog<'a> {
    /// Creates a view. `order_column` names a metadata column (such as
    /// `source_row_num`) used to order column diffs.
    #[must_use]
    pub fn new(ledger: &'a dyn ChangeLedger, order_column: Option<&'a str>) -> Self {
        Self {
            ledger,
            order_column,
        }
    }

    /// Lists change events, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Ledger`] if the ledger cannot be read.
    pub fn list_change_events(&self, limit: Option<usize>) -> Result<Vec<ChangeEvent>, DbError> {
        Ok(self.ledger.list_events(limit)?)
    }

    /// Row changes of an event, in recording order.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Ledger`] for an unknown event.
    pub fn row_changes(
        &self,
        event: &ChangeEventId,
        limit: Option<usize>,
    ) -> Result<Vec<RowChange>, DbError> {
        let mut changes = self.ledger.row_changes(event)?;
        changes.truncate(limit.unwrap_or(usize::MAX));
        Ok(changes)
    }

    /// Conflicts withheld by an event.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Ledger`] for an unknown event.
    pub fn conflicts(
        &self,
        event: &ChangeEventId,
        limit: Option<usize>,
    ) -> Result<Vec<ConflictRecord>, DbError> {
        Ok(self
            .ledger
            .conflicts(event)?
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(ConflictRecord::from)
            .collect())
    }

    /// Per-row before/after values of `column` for every change of `event`
    /// on `table` that changed it.
    ///
    /// Rows are ordered by the order column (rows without one last), then by
    /// ledger sequence.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Ledger`] for an unknown event.
    pub fn column_diffs(
        &self,
        event: &ChangeEventId,
        table: &str,
        column: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ColumnDiff>, DbError> {
        let mut diffs: Vec<ColumnDiff> = self
            .ledger
            .row_changes(event)?
            .into_iter()
            .filter(|c| c.table == table && c.changed_columns.iter().any(|col| col == column))
            .map(|c| self.column_diff(&c, column))
            .collect();
        diffs.sort_by(|a, b| {
            match (a.source_row, b.source_row) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
            .then(a.sequence.cmp(&b.sequence))
        });
        diffs.truncate(limit.unwrap_or(usize::MAX));
        Ok(diffs)
    }

    fn column_diff(&self, change: &RowChange, column: &str) -> ColumnDiff {
        let value_in = |image: Option<&Row>| image.map_or(Value::Null, |r| column_value(r, column).clone());
        let source_row = self.order_column.and_then(|order| {
            change
                .after
                .as_ref()
                .or(change.before.as_ref())
                .and_then(|r| column_value(r, order).as_i64())
        });
        ColumnDiff {
            pk: change.pk.clone(),
            op: change.op,
            before: value_in(change.before.as_ref()),
            after: value_in(change.after.as_ref()),
            source_row,
            sequence: change.sequence,
        }
    }
}
