//! Rollback controller.
//!
//! A rollback never edits history. Undoing an event opens a new `rollback`
//! change event, applies the inverse of every applied row change of the
//! target (newest first) and records those inverse writes on the new event:
//!
//! | Undone change | Inverse write                  | Recorded as |
//! |---------------|--------------------------------|-------------|
//! | `INSERT`      | delete by key                  | `DELETE`    |
//! | `UPDATE`      | restore columns from `before`  | `UPDATE`    |
//! | `DELETE`      | re-create the row from `before`| `INSERT`    |
//!
//! Because the inverse writes are ordinary ledger entries, a rollback can
//! itself be rolled back.

use rowdelta_core::{RelationalStore, Row, Value};
use rowdelta_storage::{
    BeginEvent, ChangeCounts, ChangeEvent, ChangeEventId, ChangeLedger, EventStatus, RowChange,
    RowOp, StateImage, StateStore,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::DbError;

/// Source label of rollback events.
pub const ROLLBACK_SOURCE: &str = "rollback";

/// Result of undoing one change event.
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackOutcome {
    /// The finished rollback event.
    pub change_event: ChangeEvent,
    /// The event that was undone.
    pub target: ChangeEventId,
    /// Row changes successfully inverted.
    pub reverted: u64,
    /// Row changes whose inverse write failed or had nothing to act on.
    pub failed: u64,
    /// State image created for the rollback, if that succeeded.
    pub state_image: Option<StateImage>,
}

/// Whether a point-in-time rollback had anything to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RollbackStatus {
    /// HEAD already was the target.
    NoOp,
    /// Every intervening event was rolled back.
    Success,
}

/// Result of rolling back to a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackToSummary {
    /// Outcome.
    pub status: RollbackStatus,
    /// The change event whose state was restored.
    pub target: ChangeEventId,
    /// Number of events rolled back.
    pub rolled_back_count: usize,
    /// The rollback events created, in execution order.
    pub rollback_change_event_ids: Vec<ChangeEventId>,
}

/// Inverts change events against the relational store.
pub struct RollbackController<'a> {
    store: &'a dyn RelationalStore,
    ledger: &'a dyn ChangeLedger,
    state: &'a dyn StateStore,
}

impl<'a> RollbackController<'a> {
    /// Creates a controller.
    #[must_use]
    pub fn new(
        store: &'a dyn RelationalStore,
        ledger: &'a dyn ChangeLedger,
        state: &'a dyn StateStore,
    ) -> Self {
        Self {
            store,
            ledger,
            state,
        }
    }

    /// Undoes the applied row changes of `target` as a new rollback event.
    ///
    /// Individual inverse writes that fail are logged, counted in
    /// [`RollbackOutcome::failed`] and skipped. A failure to create the
    /// post-rollback state image is logged and leaves `state_image` empty.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::EventNotFound`] if `target` is unknown. If the
    /// target's changes cannot be read or the inverse writes cannot be
    /// recorded, the rollback event is finished `FAILED` and the error is
    /// returned.
    pub fn rollback_one(
        &self,
        target: &ChangeEventId,
        actor: &str,
    ) -> Result<RollbackOutcome, DbError> {
        if self.ledger.event(target)?.is_none() {
            return Err(DbError::EventNotFound(*target));
        }
        let rollback = self.ledger.begin(
            BeginEvent::new(actor, ROLLBACK_SOURCE).with_file_label(format!("rollback:{target}")),
        )?;
        info!(change_event_id = %rollback.id, target = %target, "rollback started");

        let (counts, reverted, failed) = match self.undo(&rollback.id, target) {
            Ok(result) => result,
            Err(e) => {
                let notes = format!("rollback of {target} failed: {e}");
                if let Err(finish_err) = self.ledger.finish(
                    &rollback.id,
                    EventStatus::Failed,
                    ChangeCounts::default(),
                    Some(notes),
                ) {
                    warn!(change_event_id = %rollback.id, error = %finish_err, "could not mark rollback failed");
                }
                return Err(e);
            }
        };

        let notes = if failed > 0 {
            format!("rollback of {target}; {failed} row change(s) could not be inverted")
        } else {
            format!("rollback of {target}")
        };
        let change_event =
            self.ledger
                .finish(&rollback.id, EventStatus::Success, counts, Some(notes))?;

        let state_image = match self
            .state
            .create_or_reuse(rollback.id, Some(&format!("rollback of {target}")))
        {
            Ok(image) => Some(image),
            Err(e) => {
                warn!(change_event_id = %rollback.id, error = %e, "state image creation after rollback failed");
                None
            }
        };

        info!(change_event_id = %rollback.id, target = %target, reverted, failed, "rollback complete");
        Ok(RollbackOutcome {
            change_event,
            target: *target,
            reverted,
            failed,
            state_image,
        })
    }

    /// Rolls back every event between HEAD and `target`, newest first.
    ///
    /// The chain is resolved before anything is undone, so an unknown,
    /// unreachable or corrupt target aborts without side effects.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::State`] if the chain cannot be walked, or the
    /// first error of an individual [`rollback_one`](Self::rollback_one).
    pub fn rollback_to(
        &self,
        target: &ChangeEventId,
        actor: &str,
    ) -> Result<RollbackToSummary, DbError> {
        let chain = self.state.walk_to(target)?;
        if chain.len() <= 1 {
            debug!(target = %target, "HEAD already at target, nothing to roll back");
            return Ok(RollbackToSummary {
                status: RollbackStatus::NoOp,
                target: *target,
                rolled_back_count: 0,
                rollback_change_event_ids: Vec::new(),
            });
        }

        let mut ids = Vec::with_capacity(chain.len() - 1);
        for image in &chain[..chain.len() - 1] {
            let outcome = self.rollback_one(&image.change_event_id, actor)?;
            ids.push(outcome.change_event.id);
        }
        info!(target = %target, rolled_back = ids.len(), "point-in-time rollback complete");
        Ok(RollbackToSummary {
            status: RollbackStatus::Success,
            target: *target,
            rolled_back_count: ids.len(),
            rollback_change_event_ids: ids,
        })
    }

    /// Inverts the applied changes of `target`, recording them on `rollback`.
    fn undo(
        &self,
        rollback: &ChangeEventId,
        target: &ChangeEventId,
    ) -> Result<(ChangeCounts, u64, u64), DbError> {
        let mut changes = self.ledger.applied_changes(target)?;
        changes.sort_by(|a, b| b.sequence.cmp(&a.sequence));

        let mut counts = ChangeCounts::default();
        let mut reverted = 0;
        let mut failed = 0;
        for change in &changes {
            match self.invert(rollback, change) {
                Ok(Some(inverse)) => {
                    match inverse.op {
                        RowOp::Insert => counts.inserted += 1,
                        RowOp::Update => counts.updated += 1,
                        RowOp::Delete => counts.deleted += 1,
                    }
                    self.ledger.record(inverse)?;
                    reverted += 1;
                }
                Ok(None) => failed += 1,
                Err(e) => {
                    warn!(
                        table = %change.table,
                        pk = %change.pk,
                        op = %change.op,
                        error = %e,
                        "inverse write failed"
                    );
                    failed += 1;
                }
            }
        }
        Ok((counts, reverted, failed))
    }

    /// Applies the inverse of one change. `Ok(None)` means there was nothing
    /// to act on.
    ///
    /// The recorded `before` is the row as stored right before the inverse
    /// write, so the inverse can itself be inverted.
    fn invert(
        &self,
        rollback: &ChangeEventId,
        change: &RowChange,
    ) -> Result<Option<RowChange>, DbError> {
        let table = change.table.as_str();
        let pk_column = change.primary_key.as_str();
        let pk = change.pk.as_str();
        let inverse = |op: RowOp| {
            RowChange::new(*rollback, table, pk_column, pk, op)
                .with_changed_columns(change.changed_columns.clone())
        };
        let current = self.current_row(table, pk_column, pk)?;

        match change.op {
            RowOp::Insert => {
                let Some(current) = current else {
                    warn!(table, pk, "row to delete is already gone");
                    return Ok(None);
                };
                if !self.store.delete_by_key(table, pk_column, pk)? {
                    warn!(table, pk, "row to delete is already gone");
                    return Ok(None);
                }
                Ok(Some(inverse(RowOp::Delete).with_before(current)))
            }
            RowOp::Update => {
                let Some(before) = &change.before else {
                    warn!(table, pk, "update without a before-image cannot be inverted");
                    return Ok(None);
                };
                if let Some(current) = current {
                    let restore = restore_values(before, Some(&current), pk_column);
                    if self.store.update_columns(table, pk_column, pk, &restore)? {
                        let mut restored = current.clone();
                        restored.extend(restore);
                        return Ok(Some(
                            inverse(RowOp::Update)
                                .with_before(current)
                                .with_after(restored),
                        ));
                    }
                }
                self.store
                    .upsert_batch(table, pk_column, std::slice::from_ref(before))?;
                Ok(Some(inverse(RowOp::Insert).with_after(before.clone())))
            }
            RowOp::Delete => {
                let Some(before) = &change.before else {
                    warn!(table, pk, "delete without a before-image cannot be inverted");
                    return Ok(None);
                };
                self.store
                    .upsert_batch(table, pk_column, std::slice::from_ref(before))?;
                let mut record = inverse(RowOp::Insert).with_after(before.clone());
                record.before = current;
                Ok(Some(record))
            }
        }
    }

    fn current_row(
        &self,
        table: &str,
        pk_column: &str,
        pk: &str,
    ) -> Result<Option<Row>, DbError> {
        Ok(self
            .store
            .fetch_by_keys(table, pk_column, &[pk.to_string()])?
            .remove(pk))
    }
}

/// Column values that put a row back to `before`.
///
/// Columns of the current row that `before` lacks are reset to `Null`. The
/// key column is left out.
fn restore_values(before: &Row, current: Option<&Row>, pk_column: &str) -> Row {
    let mut values: Row = before
        .iter()
        .filter(|(column, _)| column.as_str() != pk_column)
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect();
    if let Some(current) = current {
        for column in current.keys() {
            if column != pk_column && !before.contains_key(column) {
                values.insert(column.clone(), Value::Null);
            }
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowdelta_core::testing::FlakyStore;
    use rowdelta_core::{row_of, InMemoryStore, TableSpec};
    use rowdelta_storage::{InMemoryLedger, InMemoryStateStore};

    use crate::config::MergeOptions;
    use crate::merge::MergeEngine;

    struct Fixture {
        store: FlakyStore<InMemoryStore>,
        ledger: InMemoryLedger,
        state: InMemoryStateStore,
        options: MergeOptions,
    }

    impl Fixture {
        fn new() -> Self {
            let store = InMemoryStore::new();
            store.create_table("orders", "pk").unwrap();
            Self {
                store: FlakyStore::new(store),
                ledger: InMemoryLedger::new(),
                state: InMemoryStateStore::new(),
                options: MergeOptions::default(),
            }
        }

        fn load(&self, rows: Vec<Row>) -> ChangeEventId {
            let event = self.ledger.begin(BeginEvent::new("tester", "ingest")).unwrap();
            let table = TableSpec::new("orders", "pk").with_business_columns(["amt"]);
            MergeEngine::new(&self.store, &self.ledger, &self.options)
                .merge(&event.id, &table, rows, false)
                .unwrap();
            self.ledger
                .finish(&event.id, EventStatus::Success, ChangeCounts::default(), None)
                .unwrap();
            self.state.create_or_reuse(event.id, None).unwrap();
            event.id
        }

        fn controller(&self) -> RollbackController<'_> {
            RollbackController::new(&self.store, &self.ledger, &self.state)
        }

        fn amt(&self, pk: &str) -> Option<Value> {
            self.store
                .inner()
                .get("orders", pk)
                .unwrap()
                .map(|r| r["amt"].clone())
        }
    }

    fn order(pk: i64, amt: i64) -> Row {
        row_of([("pk", Value::Int(pk)), ("amt", Value::Int(amt))])
    }

    #[test]
    fn test_rollback_insert_and_update() {
        let fx = Fixture::new();
        fx.load(vec![order(1, 100)]);
        let second = fx.load(vec![order(1, 150), order(2, 200)]);

        let outcome = fx.controller().rollback_one(&second, "tester").unwrap();
        assert_eq!(outcome.reverted, 2);
        assert_eq!(outcome.failed, 0);
        assert_eq!(outcome.change_event.status, EventStatus::Success);
        assert_eq!(outcome.change_event.source, ROLLBACK_SOURCE);
        assert_eq!(
            outcome.change_event.file_label,
            Some(format!("rollback:{second}"))
        );
        assert_eq!(outcome.change_event.counts.deleted, 1);
        assert_eq!(outcome.change_event.counts.updated, 1);

        assert_eq!(fx.amt("1"), Some(Value::Int(100)));
        assert_eq!(fx.amt("2"), None);

        let image = outcome.state_image.unwrap();
        assert_eq!(fx.state.head().unwrap().unwrap().id, image.id);
        assert_eq!(image.notes, Some(format!("rollback of {second}")));
    }

    #[test]
    fn test_rollback_of_rollback_reapplies() {
        let fx = Fixture::new();
        fx.load(vec![order(1, 100)]);
        let second = fx.load(vec![order(1, 150), order(2, 200)]);
        let undo = fx.controller().rollback_one(&second, "tester").unwrap();
        let redo = fx
            .controller()
            .rollback_one(&undo.change_event.id, "tester")
            .unwrap();
        assert_eq!(redo.reverted, 2);
        assert_eq!(redo.change_event.counts.inserted, 1);
        assert_eq!(fx.amt("1"), Some(Value::Int(150)));
        assert_eq!(fx.amt("2"), Some(Value::Int(200)));
    }

    #[test]
    fn test_rollback_of_rollback_keeps_untouched_columns() {
        let fx = Fixture::new();
        let seed = row_of([
            ("pk", Value::Int(1)),
            ("amt", Value::Int(100)),
            ("legacy", Value::from("keep")),
        ]);
        fx.store.inner().upsert_batch("orders", "pk", &[seed]).unwrap();
        let update = fx.load(vec![order(1, 150)]);
        let merged = fx.store.inner().get("orders", "1").unwrap().unwrap();

        let undo = fx.controller().rollback_one(&update, "tester").unwrap();
        let restored = fx.store.inner().get("orders", "1").unwrap().unwrap();
        assert_eq!(restored["amt"], Value::Int(100));
        assert_eq!(restored["legacy"], Value::from("keep"));

        let recorded = fx.ledger.row_changes(&undo.change_event.id).unwrap();
        assert_eq!(recorded[0].before.as_ref(), Some(&merged));
        assert_eq!(recorded[0].after.as_ref(), Some(&restored));

        fx.controller()
            .rollback_one(&undo.change_event.id, "tester")
            .unwrap();
        assert_eq!(fx.store.inner().get("orders", "1").unwrap(), Some(merged));
    }

    #[test]
    fn test_undone_insert_records_the_deleted_row() {
        let fx = Fixture::new();
        let first = fx.load(vec![order(1, 100)]);
        fx.load(vec![order(1, 150)]);
        let latest = fx.store.inner().get("orders", "1").unwrap().unwrap();

        let undo = fx.controller().rollback_one(&first, "tester").unwrap();
        assert_eq!(fx.amt("1"), None);
        let recorded = fx.ledger.row_changes(&undo.change_event.id).unwrap();
        assert_eq!(recorded[0].op, RowOp::Delete);
        assert_eq!(recorded[0].before.as_ref(), Some(&latest));

        fx.controller()
            .rollback_one(&undo.change_event.id, "tester")
            .unwrap();
        assert_eq!(fx.amt("1"), Some(Value::Int(150)));
    }

    #[test]
    fn test_failed_inverse_writes_are_counted() {
        let fx = Fixture::new();
        fx.load(vec![order(1, 100)]);
        let second = fx.load(vec![order(1, 150), order(2, 200)]);
        fx.store.fail_deletes(true);

        let outcome = fx.controller().rollback_one(&second, "tester").unwrap();
        assert_eq!(outcome.reverted, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(fx.amt("1"), Some(Value::Int(100)));
        assert_eq!(fx.amt("2"), Some(Value::Int(200)));
        assert!(outcome
            .change_event
            .notes
            .unwrap()
            .contains("1 row change(s) could not be inverted"));
        assert_eq!(fx.ledger.row_changes(&outcome.change_event.id).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_target() {
        let fx = Fixture::new();
        let missing = ChangeEventId::generate();
        assert!(matches!(
            fx.controller().rollback_one(&missing, "tester"),
            Err(DbError::EventNotFound(id)) if id == missing
        ));
        assert!(fx.ledger.list_events(None).unwrap().is_empty());
    }

    #[test]
    fn test_rollback_to_walks_back() {
        let fx = Fixture::new();
        let first = fx.load(vec![order(1, 100)]);
        fx.load(vec![order(1, 150)]);
        fx.load(vec![order(1, 175), order(2, 5)]);

        let summary = fx.controller().rollback_to(&first, "tester").unwrap();
        assert_eq!(summary.status, RollbackStatus::Success);
        assert_eq!(summary.rolled_back_count, 2);
        assert_eq!(summary.rollback_change_event_ids.len(), 2);
        assert_eq!(fx.amt("1"), Some(Value::Int(100)));
        assert_eq!(fx.amt("2"), None);
    }

    #[test]
    fn test_rollback_to_head_is_noop() {
        let fx = Fixture::new();
        fx.load(vec![order(1, 100)]);
        let head = fx.load(vec![order(1, 150)]);
        let summary = fx.controller().rollback_to(&head, "tester").unwrap();
        assert_eq!(summary.status, RollbackStatus::NoOp);
        assert_eq!(summary.rolled_back_count, 0);
        assert_eq!(fx.amt("1"), Some(Value::Int(150)));
    }

    #[test]
    fn test_restore_values_nulls_new_columns() {
        let before = row_of([("pk", Value::Int(1)), ("amt", Value::Int(1))]);
        let after = row_of([
            ("pk", Value::Int(1)),
            ("amt", Value::Int(2)),
            ("note", Value::Text("x".into())),
        ]);
        let restore = restore_values(&before, Some(&after), "pk");
        assert_eq!(
            restore,
            row_of([("amt", Value::Int(1)), ("note", Value::Null)])
        );
    }
}
