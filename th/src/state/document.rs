//! On-disk task document
//!
//! One JSON object per store mapping task id to record. Writes go to a
//! sibling `.tmp` file which is fsynced and renamed over the document.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::TaskRecord;

/// In-memory form of the whole document
pub type TaskMap = BTreeMap<String, TaskRecord>;

/// Suffix for a quarantined corrupt document
pub const BACKUP_SUFFIX: &str = ".bak";

const TMP_SUFFIX: &str = ".tmp";

/// Storage-level failures; never surfaced past the state manager
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Corrupt task document: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Task document is not valid UTF-8")]
    Encoding,
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Parse and encoding failures mean the document must be quarantined
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt(_) | Self::Encoding)
    }
}

/// Handle to the document file
#[derive(Debug, Clone)]
pub struct DocumentFile {
    path: PathBuf,
}

impl DocumentFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where a corrupt document is moved to
    pub fn backup_path(&self) -> PathBuf {
        with_suffix(&self.path, BACKUP_SUFFIX)
    }

    fn tmp_path(&self) -> PathBuf {
        with_suffix(&self.path, TMP_SUFFIX)
    }

    /// Read and parse the whole document
    ///
    /// A missing file is created empty. Only a document that is not UTF-8 or
    /// not a JSON object fails as corrupt; individual records are decoded
    /// leniently and entries that are not objects are dropped.
    pub fn load(&self) -> Result<TaskMap, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "load: document missing, creating empty");
                self.reset()?;
                return Ok(TaskMap::new());
            }
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        let text = String::from_utf8(bytes).map_err(|_| StoreError::Encoding)?;
        let entries: Map<String, Value> = serde_json::from_str(&text)?;

        let mut tasks = TaskMap::new();
        for (id, value) in entries {
            match TaskRecord::from_stored(&id, value) {
                Some(record) => {
                    tasks.insert(id, record);
                }
                None => warn!(%id, "Dropping task entry that is not a JSON object"),
            }
        }
        debug!(path = %self.path.display(), count = tasks.len(), "load: parsed document");
        Ok(tasks)
    }

    /// Atomically replace the document
    pub fn write(&self, tasks: &TaskMap) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(tasks)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let tmp_path = self.tmp_path();
        let mut file = fs::File::create(&tmp_path).map_err(|e| StoreError::io(&tmp_path, e))?;
        file.write_all(content.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| StoreError::io(&tmp_path, e))?;
        drop(file);

        fs::rename(&tmp_path, &self.path).map_err(|e| StoreError::io(&self.path, e))?;
        debug!(path = %self.path.display(), count = tasks.len(), "write: document replaced");
        Ok(())
    }

    /// Replace the document with an empty one
    pub fn reset(&self) -> Result<(), StoreError> {
        self.write(&TaskMap::new())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
