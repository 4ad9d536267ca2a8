//! Merge results: counts, withheld conflicts and the diff summary.

use std::collections::BTreeMap;

use rowdelta_core::Row;
use rowdelta_storage::ChangeCounts;
use serde::{Deserialize, Serialize};

/// Per-classification row counts of one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    /// New rows written.
    pub inserted: u64,
    /// Existing rows rewritten.
    pub updated: u64,
    /// Rows whose business columns already matched.
    pub unchanged: u64,
    /// Rows withheld because a protected column differed.
    pub conflicted: u64,
    /// Rows dropped by key validation.
    pub rejected: u64,
}

impl MergeStats {
    /// Converts to ledger counts.
    #[must_use]
    pub fn to_counts(&self) -> ChangeCounts {
        ChangeCounts {
            inserted: self.inserted,
            updated: self.updated,
            deleted: 0,
            unchanged: self.unchanged,
            conflicted: self.conflicted,
            rejected: self.rejected,
        }
    }
}

/// An update withheld because it would overwrite protected columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRow {
    /// Primary key as text.
    pub pk: String,
    /// Every protected column that differed, in declared order.
    pub conflict_columns: Vec<String>,
    /// The stored row.
    pub before: Row,
    /// The row that would have been written.
    pub proposed: Row,
}

/// Why an incoming row was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Null, blank or a "no value" spelling.
    BlankKey,
    /// The key appears again later in the same batch, which supersedes it.
    DuplicateKey,
}

/// A rejected input row, by position in the incoming batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRow {
    /// Zero-based position in the incoming rows.
    pub index: usize,
    /// Why it was rejected.
    pub reason: RejectReason,
    /// The offending key, when there was one.
    pub pk: Option<String>,
}

/// Updated rows grouped by one changed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnChangeSummary {
    /// Business column.
    pub column: String,
    /// Updated rows in which it changed.
    pub count: u64,
    /// Capped sample of their keys.
    pub pks_sample: Vec<String>,
}

/// Human-inspectable summary of what a merge changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffSummary {
    /// Target table.
    pub table: String,
    /// Rows inserted (or that would be, on a dry run).
    pub inserted_count: u64,
    /// Rows updated.
    pub updated_count: u64,
    /// Rows unchanged.
    pub unchanged_count: u64,
    /// Rows withheld as conflicts.
    pub conflicted_count: u64,
    /// Rows rejected.
    pub rejected_count: u64,
    /// Unchanged rows whose stale fingerprint was rewritten.
    pub hash_backfilled_count: u64,
    /// Capped sample of inserted keys.
    pub inserted_pks_sample: Vec<String>,
    /// Capped sample of updated keys.
    pub updated_pks_sample: Vec<String>,
    /// Capped sample of conflicted keys.
    pub conflicted_pks_sample: Vec<String>,
    /// Capped sample of rejected rows.
    pub rejected_rows_sample: Vec<RejectedRow>,
    /// Updated rows per changed column, by descending count then name.
    pub updated_by_column: Vec<ColumnChangeSummary>,
}

impl DiffSummary {
    /// Looks up the entry for one changed column.
    #[must_use]
    pub fn column(&self, column: &str) -> Option<&ColumnChangeSummary> {
        self.updated_by_column.iter().find(|c| c.column == column)
    }
}

/// Everything a merge reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeOutcome {
    /// Row counts.
    pub stats: MergeStats,
    /// Withheld conflicts, in input order.
    pub conflicts: Vec<ConflictRow>,
    /// Diff summary.
    pub summary: DiffSummary,
}

/// Accumulates stats and capped samples while rows are classified.
pub(crate) struct SummaryBuilder {
    cap: usize,
    stats: MergeStats,
    summary: DiffSummary,
    by_column: BTreeMap<String, ColumnChangeSummary>,
}

fn push_capped<T>(sample: &mut Vec<T>, value: T, cap: usize) {
    if sample.len() < cap {
        sample.push(value);
    }
}

impl SummaryBuilder {
    pub(crate) fn new(table: &str, cap: usize) -> Self {
        Self {
            cap,
            stats: MergeStats::default(),
            summary: DiffSummary {
                table: table.to_string(),
                ..DiffSummary::default()
            },
            by_column: BTreeMap::new(),
        }
    }

    pub(crate) fn rejected(&mut self, index: usize, reason: RejectReason, pk: Option<String>) {
        self.stats.rejected += 1;
        push_capped(
            &mut self.summary.rejected_rows_sample,
            RejectedRow { index, reason, pk },
            self.cap,
        );
    }

    pub(crate) fn unchanged(&mut self) {
        self.stats.unchanged += 1;
    }

    pub(crate) fn backfilled(&mut self) {
        self.summary.hash_backfilled_count += 1;
    }

    pub(crate) fn conflicted(&mut self, pk: &str) {
        self.stats.conflicted += 1;
        push_capped(&mut self.summary.conflicted_pks_sample, pk.to_string(), self.cap);
    }

    pub(crate) fn inserted(&mut self, pk: &str) {
        self.stats.inserted += 1;
        push_capped(&mut self.summary.inserted_pks_sample, pk.to_string(), self.cap);
    }

    pub(crate) fn updated(&mut self, pk: &str, changed: &[String]) {
        self.stats.updated += 1;
        push_capped(&mut self.summary.updated_pks_sample, pk.to_string(), self.cap);
        for column in changed {
            let entry = self
                .by_column
                .entry(column.clone())
                .or_insert_with(|| ColumnChangeSummary {
                    column: column.clone(),
                    count: 0,
                    pks_sample: Vec::new(),
                });
            entry.count += 1;
            push_capped(&mut entry.pks_sample, pk.to_string(), self.cap);
        }
    }

    pub(crate) fn stats(&self) -> MergeStats {
        self.stats
    }

    pub(crate) fn finish(mut self, conflicts: Vec<ConflictRow>) -> MergeOutcome {
        let mut columns: Vec<ColumnChangeSummary> = self.by_column.into_values().collect();
        columns.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.column.cmp(&b.column)));

        self.summary.inserted_count = self.stats.inserted;
        self.summary.updated_count = self.stats.updated;
        self.summary.unchanged_count = self.stats.unchanged;
        self.summary.conflicted_count = self.stats.conflicted;
        self.summary.rejected_count = self.stats.rejected;
        self.summary.updated_by_column = columns;

        MergeOutcome {
            stats: self.stats,
            conflicts,
            summary: self.summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_are_capped() {
        let mut builder = SummaryBuilder::new("orders", 2);
        for pk in ["1", "2", "3"] {
            builder.inserted(pk);
        }
        let outcome = builder.finish(Vec::new());
        assert_eq!(outcome.stats.inserted, 3);
        assert_eq!(outcome.summary.inserted_count, 3);
        assert_eq!(outcome.summary.inserted_pks_sample, vec!["1", "2"]);
    }

    #[test]
    fn test_columns_sorted_by_count_then_name() {
        let mut builder = SummaryBuilder::new("orders", 25);
        builder.updated("1", &["region".into(), "amt".into()]);
        builder.updated("2", &["region".into()]);
        builder.updated("3", &["qty".into()]);
        let outcome = builder.finish(Vec::new());
        let order: Vec<&str> = outcome
            .summary
            .updated_by_column
            .iter()
            .map(|c| c.column.as_str())
            .collect();
        assert_eq!(order, vec!["region", "amt", "qty"]);
        assert_eq!(outcome.summary.column("region").unwrap().pks_sample, vec!["1", "2"]);
    }

    #[test]
    fn test_stats_to_counts() {
        let stats = MergeStats {
            inserted: 1,
            updated: 2,
            unchanged: 3,
            conflicted: 4,
            rejected: 5,
        };
        let counts = stats.to_counts();
        assert_eq!(counts.updated, 2);
        assert_eq!(counts.deleted, 0);
        assert_eq!(counts.rejected, 5);
    }
}
