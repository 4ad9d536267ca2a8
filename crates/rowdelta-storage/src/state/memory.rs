//! In-memory state store.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use super::{HeadPointer, StateError, StateImage, StateImageId, StateStore};
use crate::ledger::ChangeEventId;

#[derive(Default)]
struct Inner {
    /// Images in creation order.
    images: Vec<StateImage>,
    by_id: HashMap<StateImageId, usize>,
    by_event: HashMap<ChangeEventId, usize>,
    head: Option<HeadPointer>,
}

impl Inner {
    fn push(&mut self, image: StateImage) {
        let pos = self.images.len();
        self.by_id.insert(image.id, pos);
        self.by_event.insert(image.change_event_id, pos);
        self.images.push(image);
    }
}

/// State store held entirely in memory.
///
/// Image creation and the HEAD move happen under one lock, so HEAD is never
/// observed pointing at an image that is not stored.
#[derive(Default)]
pub struct InMemoryStateStore {
    inner: Mutex<Inner>,
}

impl InMemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn insert_raw(&self, image: StateImage) {
        self.inner.lock().push(image);
    }

    #[cfg(test)]
    fn set_head_raw(&self, id: StateImageId) {
        self.inner.lock().head = Some(HeadPointer::to(id));
    }
}

impl StateStore for InMemoryStateStore {
    fn create_or_reuse(
        &self,
        change_event_id: ChangeEventId,
        notes: Option<&str>,
    ) -> Result<StateImage, StateError> {
        let mut inner = self.inner.lock();
        let existing = inner.by_event.get(&change_event_id).copied();
        if let Some(pos) = existing {
            let image = &mut inner.images[pos];
            image.backfill_notes(notes);
            let image = image.clone();
            inner.head = Some(HeadPointer::to(image.id));
            debug!(state_image_id = %image.id, %change_event_id, "state image reused");
            return Ok(image);
        }

        let parent = inner.head.map(|h| h.state_image_id);
        let image = StateImage::new(change_event_id, parent, notes);
        inner.push(image.clone());
        inner.head = Some(HeadPointer::to(image.id));
        debug!(state_image_id = %image.id, %change_event_id, "state image created");
        Ok(image)
    }

    fn head_pointer(&self) -> Result<Option<HeadPointer>, StateError> {
        Ok(self.inner.lock().head)
    }

    fn load(&self, id: &StateImageId) -> Result<Option<StateImage>, StateError> {
        let inner = self.inner.lock();
        Ok(inner.by_id.get(id).map(|&pos| inner.images[pos].clone()))
    }

    fn find_by_change_event(
        &self,
        change_event_id: &ChangeEventId,
    ) -> Result<Option<StateImage>, StateError> {
        let inner = self.inner.lock();
        Ok(inner
            .by_event
            .get(change_event_id)
            .map(|&pos| inner.images[pos].clone()))
    }

    fn list(&self) -> Result<Vec<StateImage>, StateError> {
        Ok(self.inner.lock().images.clone())
    }
}
