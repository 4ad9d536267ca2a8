//! Versioned state history.
//!
//! A [`StateImage`] marks the database state reached after one change event.
//! Images form a single linked chain through their parent ids, and a single
//! [`HeadPointer`] names the image considered current.
//!
//! ```text
//!   root ◄── img(e1) ◄── img(e2) ◄── img(e3)
//!                                      ▲
//!                                     HEAD
//! ```
//!
//! Images are immutable apart from a one-time notes backfill. HEAD only ever
//! references an image that has already been persisted.

mod fs;
mod memory;

pub use fs::FileSystemStateStore;
pub use memory::InMemoryStateStore;

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::ChangeEventId;

crate::id::uuid_id!(
    /// Identifier of a [`StateImage`].
    StateImageId
);

/// Immutable snapshot marker for one change event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateImage {
    /// Image identifier.
    pub id: StateImageId,
    /// The change event this image records (one image per event).
    pub change_event_id: ChangeEventId,
    /// Previous image in the chain; `None` for the root.
    pub parent_id: Option<StateImageId>,
    /// Free-text notes.
    pub notes: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl StateImage {
    fn new(
        change_event_id: ChangeEventId,
        parent_id: Option<StateImageId>,
        notes: Option<&str>,
    ) -> Self {
        Self {
            id: StateImageId::generate(),
            change_event_id,
            parent_id,
            notes: notes.filter(|n| !n.is_empty()).map(str::to_string),
            created_at: Utc::now(),
        }
    }

    /// Fills empty notes from `notes`. Returns `true` if anything changed.
    fn backfill_notes(&mut self, notes: Option<&str>) -> bool {
        let empty = self.notes.as_deref().map_or(true, str::is_empty);
        match notes {
            Some(n) if empty && !n.is_empty() => {
                self.notes = Some(n.to_string());
                true
            }
            _ => false,
        }
    }
}

/// The single reference to the current image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadPointer {
    /// Image HEAD points at.
    pub state_image_id: StateImageId,
    /// When HEAD last moved.
    pub updated_at: DateTime<Utc>,
}

impl HeadPointer {
    fn to(state_image_id: StateImageId) -> Self {
        Self {
            state_image_id,
            updated_at: Utc::now(),
        }
    }
}

/// Errors from state store operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// I/O error during state persistence.
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("state serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The change event has no state image.
    #[error("no state image for change event {0}")]
    NotFound(ChangeEventId),

    /// The target image is not an ancestor of HEAD.
    #[error("state image for change event {target} is not reachable from HEAD")]
    Unreachable {
        /// Change event that was looked for.
        target: ChangeEventId,
    },

    /// A parent id reappeared while walking the chain.
    #[error("state chain is corrupt: image {0} visited twice")]
    CorruptChain(StateImageId),

    /// A referenced image does not exist.
    #[error("state image {0} is referenced but missing")]
    MissingImage(StateImageId),

    /// No image has been created yet.
    #[error("no HEAD state image")]
    NoHead,
}

/// Persistence for state images and the HEAD pointer.
pub trait StateStore: Send + Sync {
    /// Returns the image for `change_event_id`, creating it if needed, and
    /// moves HEAD to it.
    ///
    /// A new image's parent is the current HEAD (none for the first image).
    /// An existing image is returned as-is, except that empty notes are
    /// backfilled from `notes`. HEAD moves only after the image is durable.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on persistence failure.
    fn create_or_reuse(
        &self,
        change_event_id: ChangeEventId,
        notes: Option<&str>,
    ) -> Result<StateImage, StateError>;

    /// Returns the HEAD pointer, if any image exists.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on persistence failure.
    fn head_pointer(&self) -> Result<Option<HeadPointer>, StateError>;

    /// Loads an image by id.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on persistence failure.
    fn load(&self, id: &StateImageId) -> Result<Option<StateImage>, StateError>;

    /// Finds the image recorded for a change event.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on persistence failure.
    fn find_by_change_event(
        &self,
        change_event_id: &ChangeEventId,
    ) -> Result<Option<StateImage>, StateError>;

    /// Lists every image in creation order.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on persistence failure.
    fn list(&self) -> Result<Vec<StateImage>, StateError>;

    /// Returns the image HEAD points at.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::MissingImage`] if HEAD dangles.
    fn head(&self) -> Result<Option<StateImage>, StateError> {
        match self.head_pointer()? {
            None => Ok(None),
            Some(head) => self
                .load(&head.state_image_id)?
                .map(Some)
                .ok_or(StateError::MissingImage(head.state_image_id)),
        }
    }

    /// Walks parent links from HEAD down to the image of `target`.
    ///
    /// Returns `[HEAD, ..., target]`, both ends inclusive.
    ///
    /// # Errors
    ///
    /// - [`StateError::NotFound`] if `target` has no image
    /// - [`StateError::NoHead`] if no image exists
    /// - [`StateError::Unreachable`] if the walk reaches the root first
    /// - [`StateError::CorruptChain`] if an image is visited twice
    /// - [`StateError::MissingImage`] if a parent link dangles
    fn walk_to(&self, target: &ChangeEventId) -> Result<Vec<StateImage>, StateError> {
        let target_image = self
            .find_by_change_event(target)?
            .ok_or(StateError::NotFound(*target))?;
        let mut current = self.head()?.ok_or(StateError::NoHead)?;

        let mut seen = HashSet::new();
        let mut chain = Vec::new();
        loop {
            if !seen.insert(current.id) {
                return Err(StateError::CorruptChain(current.id));
            }
            let parent = current.parent_id;
            let reached = current.id == target_image.id;
            chain.push(current);
            if reached {
                return Ok(chain);
            }
            let Some(parent) = parent else {
                return Err(StateError::Unreachable { target: *target });
            };
            current = self.load(&parent)?.ok_or(StateError::MissingImage(parent))?;
        }
    }

    /// Returns the chain from HEAD to the root; empty if there is no HEAD.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::CorruptChain`] or [`StateError::MissingImage`]
    /// for a damaged chain.
    fn history(&self) -> Result<Vec<StateImage>, StateError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = self.head()?;
        while let Some(image) = next {
            if !seen.insert(image.id) {
                return Err(StateError::CorruptChain(image.id));
            }
            next = match image.parent_id {
                Some(parent) => Some(self.load(&parent)?.ok_or(StateError::MissingImage(parent))?),
                None => None,
            };
            chain.push(image);
        }
        Ok(chain)
    }
}
