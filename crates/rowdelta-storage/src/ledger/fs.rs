//! Filesystem-backed change ledger.
//!
//! ## Disk Layout
//!
//! ```text
//! {base_dir}/ledger/
//!   events.log             # one event id per line, in begin order
//!   events/{id}.json       # ChangeEvent, replaced atomically on finish
//!   changes/{id}.jsonl     # RowChange per line, append-only
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{
    check_open, check_terminal, referenced_events, BeginEvent, ChangeCounts, ChangeEvent,
    ChangeEventId, ChangeLedger, EventStatus, LedgerError, RowChange,
};
use crate::io::{append_lines, read_lines, read_optional, write_atomic};

/// Change ledger persisted as JSON documents and JSON-lines logs.
///
/// A single process is expected to write a given directory; the internal
/// lock serializes writers within that process.
pub struct FileSystemLedger {
    base_dir: PathBuf,
    /// Next sequence number per event, filled lazily from disk.
    sequences: Mutex<HashMap<ChangeEventId, u64>>,
}

impl FileSystemLedger {
    /// Creates a ledger rooted at `{base_dir}/ledger/`.
    ///
    /// Directories are created lazily on first write.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            sequences: Mutex::new(HashMap::new()),
        }
    }

    fn ledger_dir(&self) -> PathBuf {
        self.base_dir.join("ledger")
    }

    fn event_log_path(&self) -> PathBuf {
        self.ledger_dir().join("events.log")
    }

    fn event_path(&self, id: &ChangeEventId) -> PathBuf {
        self.ledger_dir().join("events").join(format!("{id}.json"))
    }

    fn changes_path(&self, id: &ChangeEventId) -> PathBuf {
        self.ledger_dir().join("changes").join(format!("{id}.jsonl"))
    }

    fn save_event(&self, event: &ChangeEvent) -> Result<(), LedgerError> {
        let json = serde_json::to_vec_pretty(event)?;
        write_atomic(&self.event_path(&event.id), &json)?;
        Ok(())
    }

    fn load_event(&self, id: &ChangeEventId) -> Result<Option<ChangeEvent>, LedgerError> {
        match read_optional(&self.event_path(id))? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn load_changes(path: &Path) -> Result<Vec<RowChange>, LedgerError> {
        read_lines(path)?
            .iter()
            .map(|line| serde_json::from_str(line).map_err(LedgerError::from))
            .collect()
    }
}

impl ChangeLedger for FileSystemLedger {
    fn begin(&self, params: BeginEvent) -> Result<ChangeEvent, LedgerError> {
        let event = ChangeEvent::start(params);
        let mut sequences = self.sequences.lock();
        self.save_event(&event)?;
        append_lines(&self.event_log_path(), [event.id.to_string()])?;
        sequences.insert(event.id, 1);
        debug!(change_event_id = %event.id, source = %event.source, "change event started");
        Ok(event)
    }

    fn record_all(&self, changes: Vec<RowChange>) -> Result<usize, LedgerError> {
        if changes.is_empty() {
            return Ok(0);
        }
        let mut sequences = self.sequences.lock();
        let mut next: HashMap<ChangeEventId, u64> = HashMap::new();
        for id in referenced_events(&changes) {
            check_open(id, self.load_event(&id)?.as_ref())?;
            let start = match sequences.get(&id) {
                Some(n) => *n,
                None => read_lines(&self.changes_path(&id))?.len() as u64 + 1,
            };
            next.insert(id, start);
        }

        // Serialize everything before touching disk so a bad entry appends nothing.
        let mut grouped: Vec<(ChangeEventId, Vec<String>)> = Vec::new();
        let count = changes.len();
        for mut change in changes {
            let seq = next.entry(change.change_event_id).or_insert(1);
            change.sequence = *seq;
            *seq += 1;
            let line = serde_json::to_string(&change)?;
            match grouped.iter_mut().find(|(id, _)| *id == change.change_event_id) {
                Some((_, lines)) => lines.push(line),
                None => grouped.push((change.change_event_id, vec![line])),
            }
        }

        for (id, lines) in &grouped {
            if let Err(e) = append_lines(&self.changes_path(id), lines) {
                // Re-read the logs on next use instead of trusting the cache.
                for (id, _) in &grouped {
                    sequences.remove(id);
                }
                return Err(e.into());
            }
        }
        sequences.extend(next);
        Ok(count)
    }

    fn finish(
        &self,
        id: &ChangeEventId,
        status: EventStatus,
        counts: ChangeCounts,
        notes: Option<String>,
    ) -> Result<ChangeEvent, LedgerError> {
        check_terminal(status)?;
        let _guard = self.sequences.lock();
        let mut event = self.load_event(id)?.ok_or(LedgerError::EventNotFound(*id))?;
        if event.status.is_terminal() {
            warn!(change_event_id = %id, previous = %event.status, %status, "change event finished again");
        }
        event.apply_finish(status, counts, notes);
        self.save_event(&event)?;
        debug!(change_event_id = %id, %status, "change event finished");
        Ok(event)
    }

    fn event(&self, id: &ChangeEventId) -> Result<Option<ChangeEvent>, LedgerError> {
        self.load_event(id)
    }

    fn list_events(&self, limit: Option<usize>) -> Result<Vec<ChangeEvent>, LedgerError> {
        let mut events = Vec::new();
        for line in read_lines(&self.event_log_path())?.iter().rev() {
            if events.len() >= limit.unwrap_or(usize::MAX) {
                break;
            }
            let Ok(id) = line.parse::<ChangeEventId>() else {
                warn!(line = %line, "skipping malformed event log entry");
                continue;
            };
            if let Some(event) = self.load_event(&id)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn row_changes(&self, id: &ChangeEventId) -> Result<Vec<RowChange>, LedgerError> {
        if !self.event_path(id).exists() {
            return Err(LedgerError::EventNotFound(*id));
        }
        Self::load_changes(&self.changes_path(id))
    }
}
