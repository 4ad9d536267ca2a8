//! Filesystem-backed state store.
//!
//! ## Disk Layout
//!
//! ```text
//! {base_dir}/state/
//!   images/{image_id}.json        # StateImage
//!   events/{change_event_id}.txt  # image id recorded for the event
//!   images.log                    # image ids in creation order
//!   HEAD                          # HeadPointer as JSON, written last
//! ```
//!
//! Every file is replaced through write-temp, fsync, rename. HEAD is
//! rewritten only after the image and its indexes are durable, so a crash
//! leaves at worst a stale HEAD, which the next `create_or_reuse` for the
//! same event repairs.

use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{HeadPointer, StateError, StateImage, StateImageId, StateStore};
use crate::io::{append_lines, read_lines, read_optional, write_atomic};
use crate::ledger::ChangeEventId;

/// State store persisted as JSON files.
pub struct FileSystemStateStore {
    base_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSystemStateStore {
    /// Creates a store rooted at `{base_dir}/state/`.
    ///
    /// Directories are created lazily on first write.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn state_dir(&self) -> PathBuf {
        self.base_dir.join("state")
    }

    fn image_path(&self, id: &StateImageId) -> PathBuf {
        self.state_dir().join("images").join(format!("{id}.json"))
    }

    fn event_index_path(&self, id: &ChangeEventId) -> PathBuf {
        self.state_dir().join("events").join(format!("{id}.txt"))
    }

    fn image_log_path(&self) -> PathBuf {
        self.state_dir().join("images.log")
    }

    fn head_path(&self) -> PathBuf {
        self.state_dir().join("HEAD")
    }

    fn save_image(&self, image: &StateImage) -> Result<(), StateError> {
        let json = serde_json::to_vec_pretty(image)?;
        write_atomic(&self.image_path(&image.id), &json)?;
        Ok(())
    }

    fn save_head(&self, id: StateImageId) -> Result<(), StateError> {
        let json = serde_json::to_vec_pretty(&HeadPointer::to(id))?;
        write_atomic(&self.head_path(), &json)?;
        Ok(())
    }
}

impl StateStore for FileSystemStateStore {
    fn create_or_reuse(
        &self,
        change_event_id: ChangeEventId,
        notes: Option<&str>,
    ) -> Result<StateImage, StateError> {
        let _guard = self.write_lock.lock();

        if let Some(mut image) = self.find_by_change_event(&change_event_id)? {
            if image.backfill_notes(notes) {
                self.save_image(&image)?;
            }
            let id = image.id.to_string();
            if !read_lines(&self.image_log_path())?.contains(&id) {
                warn!(state_image_id = %image.id, "image missing from images.log, re-appending");
                append_lines(&self.image_log_path(), [id])?;
            }
            self.save_head(image.id)?;
            debug!(state_image_id = %image.id, %change_event_id, "state image reused");
            return Ok(image);
        }

        let parent = self.head_pointer()?.map(|h| h.state_image_id);
        let image = StateImage::new(change_event_id, parent, notes);
        self.save_image(&image)?;
        write_atomic(
            &self.event_index_path(&change_event_id),
            image.id.to_string().as_bytes(),
        )?;
        append_lines(&self.image_log_path(), [image.id.to_string()])?;
        self.save_head(image.id)?;
        debug!(state_image_id = %image.id, %change_event_id, "state image created");
        Ok(image)
    }

    fn head_pointer(&self) -> Result<Option<HeadPointer>, StateError> {
        match read_optional(&self.head_path())? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn load(&self, id: &StateImageId) -> Result<Option<StateImage>, StateError> {
        match read_optional(&self.image_path(id))? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn find_by_change_event(
        &self,
        change_event_id: &ChangeEventId,
    ) -> Result<Option<StateImage>, StateError> {
        let Some(text) = read_optional(&self.event_index_path(change_event_id))? else {
            return Ok(None);
        };
        let Ok(id) = text.parse::<StateImageId>() else {
            warn!(%change_event_id, "malformed state event index entry");
            return Ok(None);
        };
        self.load(&id)?.map(Some).ok_or(StateError::MissingImage(id))
    }

    fn list(&self) -> Result<Vec<StateImage>, StateError> {
        let mut images = Vec::new();
        for line in read_lines(&self.image_log_path())? {
            let Ok(id) = line.parse::<StateImageId>() else {
                warn!(line = %line, "skipping malformed image log entry");
                continue;
            };
            if let Some(image) = self.load(&id)? {
                images.push(image);
            }
        }
        Ok(images)
    }
}
