//! In-memory change ledger.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use super::{
    check_open, check_terminal, referenced_events, BeginEvent, ChangeCounts, ChangeEvent,
    ChangeEventId, ChangeLedger, EventStatus, LedgerError, RowChange,
};

#[derive(Default)]
struct Inner {
    /// Events in `begin` order.
    events: Vec<ChangeEvent>,
    index: HashMap<ChangeEventId, usize>,
    changes: HashMap<ChangeEventId, Vec<RowChange>>,
}

impl Inner {
    fn get(&self, id: &ChangeEventId) -> Option<&ChangeEvent> {
        self.index.get(id).map(|&i| &self.events[i])
    }
}

/// Change ledger held entirely in memory.
///
/// Suitable for tests and for embedding where the audit trail does not need
/// to outlive the process.
#[derive(Default)]
pub struct InMemoryLedger {
    inner: RwLock<Inner>,
}

impl InMemoryLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChangeLedger for InMemoryLedger {
    fn begin(&self, params: BeginEvent) -> Result<ChangeEvent, LedgerError> {
        let event = ChangeEvent::start(params);
        let mut inner = self.inner.write();
        let pos = inner.events.len();
        inner.index.insert(event.id, pos);
        inner.events.push(event.clone());
        debug!(change_event_id = %event.id, source = %event.source, "change event started");
        Ok(event)
    }

    fn record_all(&self, changes: Vec<RowChange>) -> Result<usize, LedgerError> {
        let mut inner = self.inner.write();
        for id in referenced_events(&changes) {
            check_open(id, inner.get(&id))?;
        }
        let count = changes.len();
        for mut change in changes {
            let log = inner.changes.entry(change.change_event_id).or_default();
            change.sequence = log.len() as u64 + 1;
            log.push(change);
        }
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
        let mut inner = self.inner.write();
        let pos = *inner.index.get(id).ok_or(LedgerError::EventNotFound(*id))?;
        let event = &mut inner.events[pos];
        event.apply_finish(status, counts, notes);
        debug!(change_event_id = %id, %status, "change event finished");
        Ok(event.clone())
    }

    fn event(&self, id: &ChangeEventId) -> Result<Option<ChangeEvent>, LedgerError> {
        Ok(self.inner.read().get(id).cloned())
    }

    fn list_events(&self, limit: Option<usize>) -> Result<Vec<ChangeEvent>, LedgerError> {
        let inner = self.inner.read();
        Ok(inner
            .events
            .iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    fn row_changes(&self, id: &ChangeEventId) -> Result<Vec<RowChange>, LedgerError> {
        let inner = self.inner.read();
        if inner.get(id).is_none() {
            return Err(LedgerError::EventNotFound(*id));
        }
        Ok(inner.changes.get(id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::RowOp;
    use rowdelta_core::{row_of, Value};

    fn change(id: ChangeEventId, pk: &str) -> RowChange {
        RowChange::new(id, "orders", "order_id", pk, RowOp::Insert)
            .with_changed_columns(vec!["amt".into()])
            .with_after(row_of([("order_id", Value::from(pk)), ("amt", Value::Int(1))]))
    }

    #[test]
    fn test_begin_record_finish() {
        let ledger = InMemoryLedger::new();
        let event = ledger.begin(BeginEvent::new("tester", "ingest")).unwrap();
        assert_eq!(event.status, EventStatus::Running);

        assert_eq!(
            ledger
                .record_all(vec![change(event.id, "1"), change(event.id, "2")])
                .unwrap(),
            2
        );
        ledger.record(change(event.id, "3")).unwrap();

        let counts = ChangeCounts {
            inserted: 3,
            ..ChangeCounts::default()
        };
        let done = ledger
            .finish(&event.id, EventStatus::Success, counts, None)
            .unwrap();
        assert_eq!(done.status, EventStatus::Success);
        assert!(done.finished_at.is_some());

        let changes = ledger.row_changes(&event.id).unwrap();
        let seqs: Vec<u64> = changes.iter().map(|c| c.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(changes[2].pk, "3");
    }

    #[test]
    fn test_record_after_finish_is_refused() {
        let ledger = InMemoryLedger::new();
        let event = ledger.begin(BeginEvent::new("tester", "ingest")).unwrap();
        ledger
            .finish(&event.id, EventStatus::Success, ChangeCounts::default(), None)
            .unwrap();
        assert!(matches!(
            ledger.record(change(event.id, "1")),
            Err(LedgerError::EventFinished(_))
        ));
        assert!(ledger.row_changes(&event.id).unwrap().is_empty());
    }

    #[test]
    fn test_record_all_is_all_or_nothing() {
        let ledger = InMemoryLedger::new();
        let event = ledger.begin(BeginEvent::new("tester", "ingest")).unwrap();
        let unknown = ChangeEventId::generate();
        assert!(matches!(
            ledger.record_all(vec![change(event.id, "1"), change(unknown, "2")]),
            Err(LedgerError::EventNotFound(id)) if id == unknown
        ));
        assert!(ledger.row_changes(&event.id).unwrap().is_empty());
    }

    #[test]
    fn test_finish_twice_last_write_wins() {
        let ledger = InMemoryLedger::new();
        let event = ledger.begin(BeginEvent::new("tester", "ingest")).unwrap();
        ledger
            .finish(&event.id, EventStatus::Success, ChangeCounts::default(), Some("first".into()))
            .unwrap();
        let counts = ChangeCounts {
            updated: 7,
            ..ChangeCounts::default()
        };
        ledger
            .finish(&event.id, EventStatus::Failed, counts, Some("second".into()))
            .unwrap();
        let stored = ledger.event(&event.id).unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Failed);
        assert_eq!(stored.counts.updated, 7);
        assert_eq!(stored.notes.as_deref(), Some("second"));
    }

    #[test]
    fn test_finish_running_rejected() {
        let ledger = InMemoryLedger::new();
        let event = ledger.begin(BeginEvent::new("tester", "ingest")).unwrap();
        assert!(matches!(
            ledger.finish(&event.id, EventStatus::Running, ChangeCounts::default(), None),
            Err(LedgerError::InvalidStatus(EventStatus::Running))
        ));
        assert!(matches!(
            ledger.finish(
                &ChangeEventId::generate(),
                EventStatus::Success,
                ChangeCounts::default(),
                None
            ),
            Err(LedgerError::EventNotFound(_))
        ));
    }

    #[test]
    fn test_list_events_newest_first() {
        let ledger = InMemoryLedger::new();
        let a = ledger.begin(BeginEvent::new("t", "ingest")).unwrap();
        let b = ledger.begin(BeginEvent::new("t", "ingest")).unwrap();
        let c = ledger.begin(BeginEvent::new("t", "rollback")).unwrap();
        let ids: Vec<_> = ledger.list_events(None).unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![c.id, b.id, a.id]);
        assert_eq!(ledger.list_events(Some(1)).unwrap()[0].id, c.id);
    }

    #[test]
    fn test_conflict_and_applied_views() {
        let ledger = InMemoryLedger::new();
        let event = ledger.begin(BeginEvent::new("t", "ingest")).unwrap();
        let conflict = RowChange::new(event.id, "orders", "order_id", "9", RowOp::Update)
            .into_conflict(vec!["amt".into()]);
        ledger
            .record_all(vec![change(event.id, "1"), conflict])
            .unwrap();
        assert_eq!(ledger.conflicts(&event.id).unwrap().len(), 1);
        assert_eq!(ledger.applied_changes(&event.id).unwrap()[0].pk, "1");
    }
}
