//! Change-detecting upsert.
//!
//! Rows move through the engine in three passes:
//!
//! 1. **Validate**: drop rows without a usable key, and earlier rows whose
//!    key appears again later in the batch (the last occurrence wins).
//! 2. **Classify**: bulk-fetch the stored rows in chunks, then label each
//!    incoming row UNCHANGED, CONFLICT, INSERT or UPDATE.
//! 3. **Write**: upsert staged rows chunk by chunk and append one ledger
//!    entry per written row right after its chunk commits.
//!
//! A stored fingerprint equal to the incoming one is trusted as UNCHANGED.
//! Any other fingerprint state only triggers the column diff.

use std::collections::HashMap;

use rowdelta_core::{
    column_value, diff_columns, fingerprint, RelationalStore, Row, TableSpec, Value,
};
use rowdelta_storage::{ChangeEventId, ChangeLedger, RowChange, RowOp};
use tracing::{debug, info, warn};

use super::summary::{ConflictRow, MergeOutcome, RejectReason, SummaryBuilder};
use crate::config::MergeOptions;
use crate::error::DbError;

/// Progress report passed to the merge callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeProgress<'a> {
    /// Table being merged.
    pub table: &'a str,
    /// Rows classified so far.
    pub processed: usize,
    /// Rows to classify in total.
    pub total: usize,
}

/// Progress callback type.
pub type ProgressFn<'a> = &'a dyn Fn(&MergeProgress<'_>);

/// Merges incoming rows into one target table.
pub struct MergeEngine<'a> {
    store: &'a dyn RelationalStore,
    ledger: &'a dyn ChangeLedger,
    options: &'a MergeOptions,
    progress: Option<ProgressFn<'a>>,
}

impl<'a> MergeEngine<'a> {
    /// Creates an engine over the given store and ledger.
    #[must_use]
    pub fn new(
        store: &'a dyn RelationalStore,
        ledger: &'a dyn ChangeLedger,
        options: &'a MergeOptions,
    ) -> Self {
        Self {
            store,
            ledger,
            options,
            progress: None,
        }
    }

    /// Sets the progress callback, invoked every `progress_every` rows and
    /// once more after the last row.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressFn<'a>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Merges `rows` into `table` on behalf of change event `event`.
    ///
    /// On a dry run rows are classified and summarized, but neither the
    /// target table nor the ledger is written.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidTable`] or [`DbError::Config`] before any
    /// work is done, and [`DbError::Store`] or [`DbError::Ledger`] if a bulk
    /// fetch, batch write or ledger append fails. Chunks committed before
    /// the failure stay committed, together with their ledger entries.
    pub fn merge(
        &self,
        event: &ChangeEventId,
        table: &TableSpec,
        rows: Vec<Row>,
        dry_run: bool,
    ) -> Result<MergeOutcome, DbError> {
        self.options.validate()?;
        table.validate()?;

        let bookkeeping = self.options.bookkeeping_columns();
        let compare = table.compare_columns(Some(bookkeeping.as_slice()));
        let mut summary = SummaryBuilder::new(&table.name, self.options.sample_size);

        let accepted = Self::accept_rows(table, rows, &mut summary);
        if accepted.is_empty() {
            debug!(table = %table.name, "no rows to merge");
            return Ok(summary.finish(Vec::new()));
        }

        let keys: Vec<String> = accepted.iter().map(|(k, _)| k.clone()).collect();
        let existing = self.fetch_existing(table, &keys)?;

        let total = accepted.len();
        let mut conflicts = Vec::new();
        let mut conflict_log = Vec::new();
        let mut staged_rows = Vec::new();
        let mut staged_log = Vec::new();

        for (idx, (pk, incoming)) in accepted.into_iter().enumerate() {
            let prior = existing.get(&pk);
            let fp = fingerprint(&incoming, &compare);

            if self.fingerprint_matches(prior, &fp) {
                summary.unchanged();
                self.report(table, idx + 1, total);
                continue;
            }

            let changed = diff_columns(prior, &incoming, &compare);
            let written = self.project(table, &incoming, &fp, event);

            match prior {
                Some(_) if changed.is_empty() => {
                    summary.unchanged();
                    if !dry_run && self.backfill(table, &pk, &fp, event) {
                        summary.backfilled();
                    }
                }
                Some(before) => {
                    let conflict_columns: Vec<String> = table
                        .protected_columns
                        .iter()
                        .filter(|c| changed.contains(*c))
                        .cloned()
                        .collect();

                    let change = RowChange::new(
                        *event,
                        table.name.as_str(),
                        table.primary_key.as_str(),
                        pk.as_str(),
                        RowOp::Update,
                    )
                    .with_changed_columns(changed.clone())
                    .with_before(before.clone())
                    .with_after(written.clone());

                    if conflict_columns.is_empty() {
                        summary.updated(&pk, &changed);
                        if !dry_run {
                            staged_rows.push(written);
                            staged_log.push(change);
                        }
                    } else {
                        summary.conflicted(&pk);
                        if !dry_run {
                            conflict_log.push(change.into_conflict(conflict_columns.clone()));
                        }
                        conflicts.push(ConflictRow {
                            pk,
                            conflict_columns,
                            before: before.clone(),
                            proposed: written,
                        });
                    }
                }
                None => {
                    summary.inserted(&pk);
                    if !dry_run {
                        staged_log.push(
                            RowChange::new(
                                *event,
                                table.name.as_str(),
                                table.primary_key.as_str(),
                                pk.as_str(),
                                RowOp::Insert,
                            )
                            .with_changed_columns(changed)
                            .with_after(written.clone()),
                        );
                        staged_rows.push(written);
                    }
                }
            }
            self.report(table, idx + 1, total);
        }

        if !conflict_log.is_empty() {
            self.ledger.record_all(conflict_log)?;
        }
        self.write_staged(table, &staged_rows, staged_log)?;

        let stats = summary.stats();
        info!(
            table = %table.name,
            change_event_id = %event,
            dry_run,
            inserted = stats.inserted,
            updated = stats.updated,
            unchanged = stats.unchanged,
            conflicted = stats.conflicted,
            rejected = stats.rejected,
            "merge complete"
        );
        Ok(summary.finish(conflicts))
    }

    /// Splits off rows with unusable keys, and every occurrence of a
    /// repeated key except the last, which is the one a batch upsert would
    /// leave behind.
    fn accept_rows(
        table: &TableSpec,
        rows: Vec<Row>,
        summary: &mut SummaryBuilder,
    ) -> Vec<(String, Row)> {
        let keyed: Vec<(Option<String>, Row)> = rows
            .into_iter()
            .map(|row| (column_value(&row, &table.primary_key).key_text(), row))
            .collect();
        let last_seen: HashMap<&str, usize> = keyed
            .iter()
            .enumerate()
            .filter_map(|(index, (pk, _))| pk.as_deref().map(|pk| (pk, index)))
            .collect();
        let keep: Vec<bool> = keyed
            .iter()
            .enumerate()
            .map(|(index, (pk, _))| {
                pk.as_deref()
                    .is_some_and(|pk| last_seen.get(pk) == Some(&index))
            })
            .collect();

        let mut accepted = Vec::with_capacity(keyed.len());
        for (index, ((pk, row), keep)) in keyed.into_iter().zip(keep).enumerate() {
            match pk {
                None => summary.rejected(index, RejectReason::BlankKey, None),
                Some(pk) if !keep => {
                    warn!(table = %table.name, pk = %pk, index, "key repeated later in batch, row superseded");
                    summary.rejected(index, RejectReason::DuplicateKey, Some(pk));
                }
                Some(pk) => accepted.push((pk, row)),
            }
        }
        accepted
    }

    fn fetch_existing(
        &self,
        table: &TableSpec,
        keys: &[String],
    ) -> Result<HashMap<String, Row>, DbError> {
        let mut existing = HashMap::with_capacity(keys.len());
        for chunk in keys.chunks(self.options.fetch_chunk_size) {
            existing.extend(
                self.store
                    .fetch_by_keys(&table.name, &table.primary_key, chunk)?,
            );
        }
        debug!(table = %table.name, requested = keys.len(), found = existing.len(), "existing rows fetched");
        Ok(existing)
    }

    fn fingerprint_matches(&self, prior: Option<&Row>, fp: &str) -> bool {
        match (prior, &self.options.fingerprint_column) {
            (Some(row), Some(column)) => column_value(row, column).as_text() == Some(fp),
            _ => false,
        }
    }

    /// Builds the row image written to the target table.
    fn project(&self, table: &TableSpec, incoming: &Row, fp: &str, event: &ChangeEventId) -> Row {
        let mut row = Row::new();
        for column in std::iter::once(&table.primary_key)
            .chain(&table.business_columns)
            .chain(&table.metadata_columns)
        {
            row.insert(column.clone(), column_value(incoming, column).clone());
        }
        if let Some(column) = &self.options.fingerprint_column {
            row.insert(column.clone(), Value::Text(fp.to_string()));
        }
        if let Some(column) = &self.options.change_event_column {
            row.insert(column.clone(), Value::Text(event.to_string()));
        }
        row
    }

    /// Rewrites a stale fingerprint on an unchanged row. Failures are logged
    /// and otherwise ignored.
    fn backfill(&self, table: &TableSpec, pk: &str, fp: &str, event: &ChangeEventId) -> bool {
        if !self.options.backfill_fingerprint {
            return false;
        }
        let Some(fp_column) = &self.options.fingerprint_column else {
            return false;
        };
        let mut values = Row::new();
        values.insert(fp_column.clone(), Value::Text(fp.to_string()));
        if let Some(column) = &self.options.change_event_column {
            values.insert(column.clone(), Value::Text(event.to_string()));
        }
        match self
            .store
            .update_columns(&table.name, &table.primary_key, pk, &values)
        {
            Ok(found) => found,
            Err(e) => {
                warn!(table = %table.name, pk = %pk, error = %e, "fingerprint backfill failed");
                false
            }
        }
    }

    fn write_staged(
        &self,
        table: &TableSpec,
        rows: &[Row],
        log: Vec<RowChange>,
    ) -> Result<(), DbError> {
        let chunk_size = self.options.write_chunk_size;
        let mut log = log.into_iter();
        for (n, chunk) in rows.chunks(chunk_size).enumerate() {
            self.store
                .upsert_batch(&table.name, &table.primary_key, chunk)?;
            let entries: Vec<RowChange> = log.by_ref().take(chunk.len()).collect();
            self.ledger.record_all(entries)?;
            debug!(table = %table.name, chunk = n, rows = chunk.len(), "batch written");
        }
        Ok(())
    }

    fn report(&self, table: &TableSpec, processed: usize, total: usize) {
        let Some(progress) = self.progress else {
            return;
        };
        let every = self.options.progress_every;
        if processed == total || (every > 0 && processed % every == 0) {
            progress(&MergeProgress {
                table: &table.name,
                processed,
                total,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use rowdelta_core::testing::FlakyStore;
    use rowdelta_core::{row_of, InMemoryStore, StoreError, FINGERPRINT_HEX_LEN};
    use rowdelta_storage::{BeginEvent, InMemoryLedger};

    fn spec() -> TableSpec {
        TableSpec::new("orders", "pk").with_business_columns(["amt"])
    }

    fn order(pk: i64, amt: i64) -> Row {
        row_of([("pk", Value::Int(pk)), ("amt", Value::Int(amt))])
    }

    fn setup() -> (InMemoryStore, InMemoryLedger) {
        let store = InMemoryStore::new();
        store.create_table("orders", "pk").unwrap();
        (store, InMemoryLedger::new())
    }

    fn begin(ledger: &InMemoryLedger) -> ChangeEventId {
        ledger.begin(BeginEvent::new("tester", "ingest")).unwrap().id
    }

    #[test]
    fn test_insert_then_unchanged() {
        let (store, ledger) = setup();
        let options = MergeOptions::default();
        let engine = MergeEngine::new(&store, &ledger, &options);

        let first = begin(&ledger);
        let out = engine
            .merge(&first, &spec(), vec![order(1, 100), order(2, 200)], false)
            .unwrap();
        assert_eq!(out.stats.inserted, 2);
        assert_eq!(ledger.row_changes(&first).unwrap().len(), 2);

        let stored = store.get("orders", "1").unwrap().unwrap();
        assert_eq!(stored["row_hash"].as_text().unwrap().len(), FINGERPRINT_HEX_LEN);
        assert_eq!(stored["last_change_event_id"], Value::Text(first.to_string()));

        let second = begin(&ledger);
        let out = engine
            .merge(&second, &spec(), vec![order(1, 100), order(2, 200)], false)
            .unwrap();
        assert_eq!(out.stats.unchanged, 2);
        assert_eq!(out.stats.inserted + out.stats.updated, 0);
        assert!(ledger.row_changes(&second).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_blank_and_duplicate_keys() {
        let (store, ledger) = setup();
        let options = MergeOptions::default();
        let engine = MergeEngine::new(&store, &ledger, &options);
        let rows = vec![
            row_of([("pk", Value::Null), ("amt", Value::Int(1))]),
            row_of([("pk", Value::Text("nan".into())), ("amt", Value::Int(1))]),
            order(1, 100),
            order(1, 999),
        ];
        let out = engine.merge(&begin(&ledger), &spec(), rows, false).unwrap();
        assert_eq!(out.stats.rejected, 3);
        assert_eq!(out.stats.inserted, 1);
        assert_eq!(out.summary.rejected_rows_sample[2].reason, RejectReason::DuplicateKey);
        assert_eq!(out.summary.rejected_rows_sample[2].index, 2);
        assert_eq!(store.get("orders", "1").unwrap().unwrap()["amt"], Value::Int(999));
    }

    #[test]
    fn test_last_duplicate_wins_against_stored_row() {
        let (store, ledger) = setup();
        let options = MergeOptions::default();
        let engine = MergeEngine::new(&store, &ledger, &options);
        engine
            .merge(&begin(&ledger), &spec(), vec![order(1, 100), order(2, 200)], false)
            .unwrap();

        let event = begin(&ledger);
        let rows = vec![order(1, 150), order(2, 200), order(1, 175), order(1, 180)];
        let out = engine.merge(&event, &spec(), rows, false).unwrap();
        assert_eq!(out.stats.rejected, 2);
        assert_eq!(out.stats.updated, 1);
        assert_eq!(out.stats.unchanged, 1);
        let superseded: Vec<usize> = out
            .summary
            .rejected_rows_sample
            .iter()
            .map(|r| r.index)
            .collect();
        assert_eq!(superseded, vec![0, 2]);
        assert_eq!(store.get("orders", "1").unwrap().unwrap()["amt"], Value::Int(180));

        let changes = ledger.row_changes(&event).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].before.as_ref().unwrap()["amt"], Value::Int(100));
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let (store, ledger) = setup();
        let options = MergeOptions::default();
        let engine = MergeEngine::new(&store, &ledger, &options);
        let event = begin(&ledger);
        let out = engine.merge(&event, &spec(), vec![order(1, 100)], true).unwrap();
        assert_eq!(out.stats.inserted, 1);
        assert_eq!(out.summary.inserted_pks_sample, vec!["1"]);
        assert_eq!(store.row_count("orders").unwrap(), 0);
        assert!(ledger.row_changes(&event).unwrap().is_empty());
    }

    #[test]
    fn test_metadata_drift_is_not_an_update() {
        let (store, ledger) = setup();
        let options = MergeOptions::default();
        let engine = MergeEngine::new(&store, &ledger, &options);
        let table = spec().with_metadata_columns(["source_row_num"]);

        let mut row = order(1, 100);
        row.insert("source_row_num".into(), Value::Int(3));
        engine.merge(&begin(&ledger), &table, vec![row.clone()], false).unwrap();

        row.insert("source_row_num".into(), Value::Int(40));
        let out = engine.merge(&begin(&ledger), &table, vec![row], false).unwrap();
        assert_eq!(out.stats.unchanged, 1);
        assert_eq!(out.stats.updated, 0);
    }

    #[test]
    fn test_stale_fingerprint_is_backfilled() {
        let (store, ledger) = setup();
        store
            .upsert_batch(
                "orders",
                "pk",
                &[row_of([
                    ("pk", Value::Int(1)),
                    ("amt", Value::Int(100)),
                    ("row_hash", Value::Text("legacy".into())),
                ])],
            )
            .unwrap();
        let options = MergeOptions::default();
        let engine = MergeEngine::new(&store, &ledger, &options);
        let event = begin(&ledger);
        let out = engine.merge(&event, &spec(), vec![order(1, 100)], false).unwrap();
        assert_eq!(out.stats.unchanged, 1);
        assert_eq!(out.summary.hash_backfilled_count, 1);
        let stored = store.get("orders", "1").unwrap().unwrap();
        assert_eq!(
            stored["row_hash"],
            Value::Text(fingerprint(&order(1, 100), &["amt"]))
        );
        assert!(ledger.row_changes(&event).unwrap().is_empty());
    }

    #[test]
    fn test_backfill_failure_is_swallowed() {
        let (inner, ledger) = setup();
        inner
            .upsert_batch("orders", "pk", &[order(1, 100)])
            .unwrap();
        let store = FlakyStore::new(inner);
        store.fail_updates(true);
        let options = MergeOptions::default();
        let engine = MergeEngine::new(&store, &ledger, &options);
        let out = engine
            .merge(&begin(&ledger), &spec(), vec![order(1, 100)], false)
            .unwrap();
        assert_eq!(out.stats.unchanged, 1);
        assert_eq!(out.summary.hash_backfilled_count, 0);
    }

    #[test]
    fn test_conflict_reports_all_protected_columns() {
        let (store, ledger) = setup();
        let table = TableSpec::new("orders", "pk")
            .with_business_columns(["order_date", "amt", "region"])
            .with_protected_columns(["order_date", "amt"]);
        let options = MergeOptions::default();
        let engine = MergeEngine::new(&store, &ledger, &options);

        let original = row_of([
            ("pk", Value::Int(1)),
            ("order_date", Value::Text("2024-01-01".into())),
            ("amt", Value::Int(100)),
            ("region", Value::Text("EU".into())),
        ]);
        engine.merge(&begin(&ledger), &table, vec![original.clone()], false).unwrap();

        let mut proposed = original.clone();
        proposed.insert("order_date".into(), Value::Text("2024-02-01".into()));
        proposed.insert("amt".into(), Value::Int(175));
        proposed.insert("region".into(), Value::Text("US".into()));
        let event = begin(&ledger);
        let out = engine.merge(&event, &table, vec![proposed], false).unwrap();

        assert_eq!(out.stats.conflicted, 1);
        assert_eq!(out.conflicts[0].conflict_columns, vec!["order_date", "amt"]);
        assert_eq!(out.conflicts[0].before["amt"], Value::Int(100));
        assert_eq!(out.conflicts[0].proposed["amt"], Value::Int(175));
        assert_eq!(store.get("orders", "1").unwrap().unwrap()["region"], Value::Text("EU".into()));

        let logged = ledger.conflicts(&event).unwrap();
        assert_eq!(logged.len(), 1);
        assert!(!logged[0].applied);
        assert_eq!(
            logged[0].conflict_reason.as_deref(),
            Some("Protected field mismatch: order_date, amt")
        );
    }

    #[test]
    fn test_fetch_failure_aborts() {
        let (inner, ledger) = setup();
        let store = FlakyStore::new(inner);
        store.fail_fetches(true);
        let options = MergeOptions::default();
        let engine = MergeEngine::new(&store, &ledger, &options);
        let err = engine
            .merge(&begin(&ledger), &spec(), vec![order(1, 100)], false)
            .unwrap_err();
        assert!(matches!(err, DbError::Store(StoreError::Unavailable(_))));
    }

    #[test]
    fn test_write_failure_keeps_committed_chunks() {
        let (inner, ledger) = setup();
        let store = FlakyStore::new(inner);
        store.fail_upserts_after(1);
        let options = MergeOptions::default().with_chunk_size(2);
        let engine = MergeEngine::new(&store, &ledger, &options);
        let event = begin(&ledger);
        let rows = (1..=5).map(|i| order(i, i * 10)).collect();
        let err = engine.merge(&event, &spec(), rows, false).unwrap_err();
        assert!(matches!(err, DbError::Store(StoreError::WriteFailure(_))));
        assert_eq!(store.inner().row_count("orders").unwrap(), 2);
        assert_eq!(ledger.row_changes(&event).unwrap().len(), 2);
    }

    #[test]
    fn test_progress_cadence() {
        let (store, ledger) = setup();
        let options = MergeOptions::default().with_progress_every(2);
        let seen = RefCell::new(Vec::new());
        let callback = |p: &MergeProgress<'_>| seen.borrow_mut().push((p.processed, p.total));
        let engine = MergeEngine::new(&store, &ledger, &options).with_progress(&callback);
        let rows = (1..=5).map(|i| order(i, i)).collect();
        engine.merge(&begin(&ledger), &spec(), rows, false).unwrap();
        assert_eq!(seen.into_inner(), vec![(2, 5), (4, 5), (5, 5)]);
    }

    #[test]
    fn test_zero_cadence_reports_only_completion() {
        let (store, ledger) = setup();
        let options = MergeOptions::default().with_progress_every(0);
        let seen = RefCell::new(Vec::new());
        let callback = |p: &MergeProgress<'_>| seen.borrow_mut().push((p.processed, p.total));
        let engine = MergeEngine::new(&store, &ledger, &options).with_progress(&callback);
        let rows = (1..=3).map(|i| order(i, i)).collect();
        engine.merge(&begin(&ledger), &spec(), rows, false).unwrap();
        assert_eq!(seen.into_inner(), vec![(3, 3)]);
    }

    #[test]
    fn test_invalid_table_rejected_up_front() {
        let (store, ledger) = setup();
        let options = MergeOptions::default();
        let engine = MergeEngine::new(&store, &ledger, &options);
        let table = spec().with_protected_columns(["nope"]);
        assert!(matches!(
            engine.merge(&begin(&ledger), &table, vec![order(1, 1)], false),
            Err(DbError::InvalidTable(_))
        ));
    }
}
