//! Crash recovery
//!
//! Validates the task document and quarantines it when it is not valid UTF-8
//! JSON, so the store reopens onto a valid document. A document that merely
//! cannot be read right now is never moved.

use std::fs;
use std::io;
use std::path::PathBuf;

use tracing::{debug, error, info, warn};

use super::document::{DocumentFile, StoreError, TaskMap};

/// What recovery found and did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records in the document after recovery
    pub tasks_loaded: usize,
    /// Records still processing (their waits must be re-armed)
    pub processing: usize,
    /// Where the unreadable document was moved to
    pub quarantined_to: Option<PathBuf>,
    /// The unreadable document could not be moved and was deleted
    pub deleted_corrupt: bool,
}

impl RecoveryReport {
    /// True if the document had to be discarded
    pub fn discarded(&self) -> bool {
        self.quarantined_to.is_some() || self.deleted_corrupt
    }
}

impl std::fmt::Display for RecoveryReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tasks: {}, processing: {}", self.tasks_loaded, self.processing)?;
        if let Some(path) = &self.quarantined_to {
            write!(f, ", quarantined to {}", path.display())?;
        }
        if self.deleted_corrupt {
            write!(f, ", corrupt document deleted")?;
        }
        Ok(())
    }
}

/// Load the document, replacing it with an empty one if it is corrupt
///
/// I/O failures leave the document alone and are returned, as is a failure
/// to write the empty replacement.
pub fn recover(doc: &DocumentFile) -> Result<(TaskMap, RecoveryReport), StoreError> {
    debug!(path = %doc.path().display(), "recover: called");
    let mut report = RecoveryReport::default();

    let tasks = match doc.load() {
        Ok(tasks) => tasks,
        Err(e) if !e.is_corrupt() => {
            error!(path = %doc.path().display(), error = %e, "Task document is unreadable, leaving it in place");
            return Err(e);
        }
        Err(e) => {
            warn!(path = %doc.path().display(), error = %e, "Task document is corrupt");
            match quarantine(doc) {
                Some(backup) => report.quarantined_to = Some(backup),
                None => report.deleted_corrupt = true,
            }
            doc.reset()?;
            info!(path = %doc.path().display(), "Reinitialized empty task document");
            TaskMap::new()
        }
    };

    report.tasks_loaded = tasks.len();
    report.processing = tasks.values().filter(|r| !r.is_terminal()).count();
    debug!(%report, "recover: done");
    Ok((tasks, report))
}

/// Move the document aside; delete it if it cannot be moved
///
/// Returns the backup path, or None if the document was deleted instead.
fn quarantine(doc: &DocumentFile) -> Option<PathBuf> {
    let backup = doc.backup_path();

    // rename() will not replace an existing target on every platform
    if let Err(e) = fs::remove_file(&backup)
        && e.kind() != io::ErrorKind::NotFound
    {
        debug!(backup = %backup.display(), error = %e, "quarantine: could not clear previous backup");
    }

    match fs::rename(doc.path(), &backup) {
        Ok(()) => {
            warn!(backup = %backup.display(), "Corrupted task document backed up");
            Some(backup)
        }
        Err(e) => {
            error!(backup = %backup.display(), error = %e, "Failed to back up corrupted task document, deleting it");
            if let Err(e) = fs::remove_file(doc.path())
                && e.kind() != io::ErrorKind::NotFound
            {
                error!(path = %doc.path().display(), error = %e, "Failed to delete corrupted task document");
            }
            None
        }
    }
}
