//! Configuration for `RowDelta`.

use std::path::PathBuf;

use crate::error::DbError;

/// Tuning knobs for the merge engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOptions {
    /// Column holding the stored row fingerprint (`None` disables the hash
    /// short-circuit and fingerprint writes).
    pub fingerprint_column: Option<String>,
    /// Column holding the id of the last change event that wrote the row
    /// (`None` = not written).
    pub change_event_column: Option<String>,
    /// Cap on every primary-key sample in the diff summary.
    pub sample_size: usize,
    /// Keys per bulk fetch.
    pub fetch_chunk_size: usize,
    /// Rows per batch write.
    pub write_chunk_size: usize,
    /// Rows between progress callbacks; 0 reports only after the last row.
    pub progress_every: usize,
    /// Rewrite stale fingerprints on unchanged rows.
    pub backfill_fingerprint: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            fingerprint_column: Some("row_hash".to_string()),
            change_event_column: Some("last_change_event_id".to_string()),
            sample_size: 25,
            fetch_chunk_size: 2000,
            write_chunk_size: 2000,
            progress_every: 2000,
            backfill_fingerprint: true,
        }
    }
}

impl MergeOptions {
    /// Sets the fingerprint column.
    #[must_use]
    pub fn with_fingerprint_column(mut self, column: Option<&str>) -> Self {
        self.fingerprint_column = column.map(str::to_string);
        self
    }

    /// Sets the change-event reference column.
    #[must_use]
    pub fn with_change_event_column(mut self, column: Option<&str>) -> Self {
        self.change_event_column = column.map(str::to_string);
        self
    }

    /// Sets the sample cap.
    #[must_use]
    pub fn with_sample_size(mut self, n: usize) -> Self {
        self.sample_size = n;
        self
    }

    /// Sets both the fetch and the write chunk size.
    #[must_use]
    pub fn with_chunk_size(mut self, n: usize) -> Self {
        self.fetch_chunk_size = n;
        self.write_chunk_size = n;
        self
    }

    /// Sets the progress cadence. The callback always fires once more after
    /// the last row, so 0 leaves only that final report.
    #[must_use]
    pub fn with_progress_every(mut self, n: usize) -> Self {
        self.progress_every = n;
        self
    }

    /// Enables or disables fingerprint backfill.
    #[must_use]
    pub fn with_backfill(mut self, enabled: bool) -> Self {
        self.backfill_fingerprint = enabled;
        self
    }

    /// Columns the engine maintains itself and never diffs.
    pub(crate) fn bookkeeping_columns(&self) -> Vec<&str> {
        self.fingerprint_column
            .iter()
            .chain(&self.change_event_column)
            .map(String::as_str)
            .collect()
    }

    /// Rejects settings the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] for zero chunk sizes or colliding
    /// bookkeeping columns.
    pub fn validate(&self) -> Result<(), DbError> {
        if self.fetch_chunk_size == 0 || self.write_chunk_size == 0 {
            return Err(DbError::Config("chunk sizes must be positive".to_string()));
        }
        if let (Some(fp), Some(ev)) = (&self.fingerprint_column, &self.change_event_column) {
            if fp == ev {
                return Err(DbError::Config(format!(
                    "fingerprint and change-event columns are both '{fp}'"
                )));
            }
        }
        Ok(())
    }
}

/// Configuration for a `RowDelta` instance.
#[derive(Debug, Clone)]
pub struct RowDeltaConfig {
    /// Directory for the ledger and state history (`None` = in-memory only).
    pub storage_dir: Option<PathBuf>,
    /// Merge engine settings.
    pub merge: MergeOptions,
    /// Actor recorded on rollback events when the caller gives none.
    pub rollback_actor: String,
}

impl Default for RowDeltaConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            merge: MergeOptions::default(),
            rollback_actor: "rollback".to_string(),
        }
    }
}
