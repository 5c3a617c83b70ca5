//! TaskRecord domain type
//!
//! The durable state of one background job, plus the partial update that
//! producers send to move it forward.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Field names owned by [`TaskRecord`] that extra fields may not shadow
pub const RESERVED_FIELDS: &[&str] = &[
    "id",
    "status",
    "message",
    "error",
    "progress",
    "created_at",
    "updated_at",
    "completed_at",
    "error_at",
];

/// Current time as an RFC 3339 UTC timestamp
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a persisted timestamp
///
/// Accepts RFC 3339, and falls back to a naive ISO-8601 timestamp which is
/// read as UTC (older documents were written without an offset).
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Job is still running
    #[default]
    Processing,
    /// Job finished successfully
    Completed,
    /// Job failed
    Error,
}

impl TaskStatus {
    /// Completed and Error are terminal; nothing leaves them
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// Durable state of one background job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique identifier (the document key, not stored inside the record)
    #[serde(skip)]
    pub id: String,

    /// Current status
    pub status: TaskStatus,

    /// Human-readable progress message
    #[serde(default)]
    pub message: Option<String>,

    /// Error description for failed jobs
    #[serde(default)]
    pub error: Option<String>,

    /// Percent complete (0-100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,

    /// Creation timestamp (RFC 3339); kept as text so bad values survive a load
    #[serde(default)]
    pub created_at: String,

    /// Last write timestamp (RFC 3339)
    #[serde(default)]
    pub updated_at: String,

    /// Set when the job transitions to completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,

    /// Set when the job transitions to error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_at: Option<String>,

    /// Producer-supplied fields such as `output_path` or `input_files`
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskRecord {
    /// Create a fresh processing record
    pub fn new(id: impl Into<String>) -> Self {
        Self::new_at(id, &now_rfc3339())
    }

    /// Create a fresh processing record stamped with `now`
    pub fn new_at(id: impl Into<String>, now: &str) -> Self {
        Self {
            id: id.into(),
            status: TaskStatus::Processing,
            message: None,
            error: None,
            progress: None,
            created_at: now.to_string(),
            updated_at: now.to_string(),
            completed_at: None,
            error_at: None,
            extra: Map::new(),
        }
    }

    /// Decode one persisted record, tolerating fields of the wrong type
    ///
    /// An unknown or missing status reads as processing. Text fields holding
    /// other JSON are kept as their JSON text. A `progress`, `completed_at` or
    /// `error_at` of the wrong type stays in `extra` untouched. Returns None
    /// when the entry is not a JSON object.
    pub fn from_stored(id: &str, value: Value) -> Option<Self> {
        let Value::Object(mut fields) = value else {
            return None;
        };
        fields.remove("id");

        let status = match fields.remove("status") {
            Some(Value::String(s)) => s.parse().unwrap_or_else(|_| {
                warn!(%id, status = %s, "Unknown task status, reading it as processing");
                TaskStatus::Processing
            }),
            other => {
                warn!(%id, status = ?other, "Task has no usable status, reading it as processing");
                TaskStatus::Processing
            }
        };

        Some(Self {
            id: id.to_string(),
            status,
            message: take_text(id, &mut fields, "message"),
            error: take_text(id, &mut fields, "error"),
            progress: take_typed(id, &mut fields, "progress"),
            created_at: take_text(id, &mut fields, "created_at").unwrap_or_default(),
            updated_at: take_text(id, &mut fields, "updated_at").unwrap_or_default(),
            completed_at: take_typed(id, &mut fields, "completed_at"),
            error_at: take_typed(id, &mut fields, "error_at"),
            extra: fields,
        })
    }

    /// Check if the record reached a terminal status
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Parsed creation time, None if missing or unparsable
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.created_at)
    }

    /// Merge a partial update into this record
    ///
    /// Once the record is terminal only the message and extra fields merge;
    /// status, error and progress are frozen. Returns true when this update
    /// moved the record into a terminal status.
    pub fn apply(&mut self, update: &TaskUpdate, now: &str) -> bool {
        let was_terminal = self.status.is_terminal();

        if let Some(status) = update.status {
            if !was_terminal {
                self.status = status;
            } else if status != self.status {
                warn!(id = %self.id, current = %self.status, requested = %status, "Ignoring status change on terminal task");
            }
        }
        if let Some(message) = &update.message {
            self.message = Some(message.clone());
        }
        if let Some(error) = &update.error {
            if !was_terminal {
                self.error = Some(error.clone());
            } else if self.error.as_ref() != Some(error) {
                warn!(id = %self.id, status = %self.status, %error, "Ignoring error text on terminal task");
            }
        }
        if let Some(progress) = update.progress {
            if !was_terminal {
                self.progress = Some(progress.min(100));
                self.extra.remove("progress");
            } else {
                warn!(id = %self.id, status = %self.status, progress, "Ignoring progress on terminal task");
            }
        }
        for (key, value) in &update.extra {
            if RESERVED_FIELDS.contains(&key.as_str()) {
                warn!(id = %self.id, %key, "Dropping extra field that shadows a record field");
                continue;
            }
            self.extra.insert(key.clone(), value.clone());
        }

        if self.created_at.is_empty() {
            self.created_at = now.to_string();
        }
        self.updated_at = now.to_string();

        let became_terminal = !was_terminal && self.status.is_terminal();
        if became_terminal {
            let stamp = match self.status {
                TaskStatus::Completed => Some(("completed_at", &mut self.completed_at)),
                TaskStatus::Error => Some(("error_at", &mut self.error_at)),
                TaskStatus::Processing => None,
            };
            if let Some((key, slot)) = stamp {
                *slot = Some(now.to_string());
                self.extra.remove(key);
            }
        }
        became_terminal
    }
}

/// Remove a text field; non-string JSON is kept as its JSON text
fn take_text(id: &str, fields: &mut Map<String, Value>, key: &str) -> Option<String> {
    match fields.remove(key)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => {
            warn!(%id, %key, value = %other, "Task field is not text, keeping its JSON form");
            Some(other.to_string())
        }
    }
}

/// Remove a typed field if it decodes; otherwise leave it in place as an extra field
fn take_typed<T: DeserializeOwned>(id: &str, fields: &mut Map<String, Value>, key: &str) -> Option<T> {
    let value = fields.get(key)?;
    if value.is_null() {
        fields.remove(key);
        return None;
    }
    match T::deserialize(value) {
        Ok(typed) => {
            fields.remove(key);
            Some(typed)
        }
        Err(e) => {
            warn!(%id, %key, value = %value, error = %e, "Task field has an unexpected type, keeping it as an extra field");
            None
        }
    }
}

/// Partial update sent by a producer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub progress: Option<u8>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl TaskUpdate {
    /// Create an empty update
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an update that sets the status
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Builder method to set the status
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Builder method to set the message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Builder method to set the error
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Builder method to set progress
    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Builder method to add one extra field
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    const LATER: &str = "2030-01-01T00:00:00.000000Z";

    #[test]
    fn test_new_record_is_processing() {
        let record = TaskRecord::new("t1");
        assert_eq!(record.status, TaskStatus::Processing);
        assert!(!record.is_terminal());
        assert_eq!(record.created_at, record.updated_at);
        assert!(record.created_at_utc().is_some());
    }

    #[test]
    fn test_apply_completes_and_stamps() {
        let mut record = TaskRecord::new("t1");
        let update = TaskUpdate::status(TaskStatus::Completed).with_extra("output_path", "/out/x.mp4");

        assert!(record.apply(&update, LATER));
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.completed_at.as_deref(), Some(LATER));
        assert_eq!(record.error_at, None);
        assert_eq!(record.updated_at, LATER);
        assert_eq!(record.extra["output_path"], json!("/out/x.mp4"));
    }

    #[test]
    fn test_apply_error_stamps_error_at() {
        let mut record = TaskRecord::new("t1");
        assert!(record.apply(&TaskUpdate::status(TaskStatus::Error).with_error("ffmpeg exited 1"), LATER));
        assert_eq!(record.error.as_deref(), Some("ffmpeg exited 1"));
        assert_eq!(record.error_at.as_deref(), Some(LATER));
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let mut record = TaskRecord::new("t1");
        record.apply(&TaskUpdate::status(TaskStatus::Completed), LATER);

        let changed = record.apply(
            &TaskUpdate::status(TaskStatus::Processing).with_message("late progress"),
            LATER,
        );
        assert!(!changed);
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.message.as_deref(), Some("late progress"));

        // Re-affirming the same terminal status is not a new transition
        assert!(!record.apply(&TaskUpdate::status(TaskStatus::Completed), LATER));
    }

    #[test]
    fn test_extra_merges_and_never_removes() {
        let mut record = TaskRecord::new("t1");
        record.apply(&TaskUpdate::new().with_extra("a", 1), LATER);
        record.apply(&TaskUpdate::new().with_extra("b", 2), LATER);
        record.apply(&TaskUpdate::new().with_extra("a", 3), LATER);

        assert_eq!(record.extra.len(), 2);
        assert_eq!(record.extra["a"], json!(3));
        assert_eq!(record.extra["b"], json!(2));
    }

    #[test]
    fn test_reserved_extra_keys_are_dropped() {
        let mut record = TaskRecord::new("t1");
        record.apply(&TaskUpdate::new().with_extra("status", "completed"), LATER);
        assert_eq!(record.status, TaskStatus::Processing);
        assert!(record.extra.is_empty());
    }

    #[test]
    fn test_progress_is_clamped() {
        let mut record = TaskRecord::new("t1");
        record.apply(&TaskUpdate::new().with_progress(250), LATER);
        assert_eq!(record.progress, Some(100));
    }

    #[test]
    fn test_missing_created_at_is_filled() {
        let mut record: TaskRecord = serde_json::from_value(json!({"status": "processing"})).unwrap();
        record.apply(&TaskUpdate::new(), LATER);
        assert_eq!(record.created_at, LATER);
    }

    #[test]
    fn test_serialized_layout_flattens_extra() {
        let mut record = TaskRecord::new("t1");
        record.apply(
            &TaskUpdate::new()
                .with_extra("output_path", "/out/x.mp4")
                .with_extra("input_files", json!({"audio": "a.mp3"})),
            LATER,
        );

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"], "processing");
        assert_eq!(value["output_path"], "/out/x.mp4");
        assert_eq!(value["input_files"]["audio"], "a.mp3");
        assert!(value.get("id").is_none());
        assert!(value.get("extra").is_none());
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2024-05-01T10:00:00+07:00").is_some());
        assert!(parse_timestamp("2024-05-01T10:00:00.123456").is_some());
        assert!(parse_timestamp("not a date").is_none());
        assert!(parse_timestamp("").is_none());
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!("Completed".parse::<TaskStatus>().unwrap(), TaskStatus::Completed);
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_terminal_record_keeps_error_and_progress() {
        let mut record = TaskRecord::new("t1");
        record.apply(&TaskUpdate::status(TaskStatus::Completed).with_progress(100), LATER);

        record.apply(
            &TaskUpdate::new()
                .with_error("late failure")
                .with_progress(10)
                .with_message("post-processing note"),
            LATER,
        );
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.error, None);
        assert_eq!(record.progress, Some(100));
        assert_eq!(record.message.as_deref(), Some("post-processing note"));
    }

    #[test]
    fn test_error_on_failing_transition_is_kept() {
        let mut record = TaskRecord::new("t1");
        record.apply(&TaskUpdate::status(TaskStatus::Error).with_error("boom"), LATER);
        record.apply(&TaskUpdate::status(TaskStatus::Error).with_error("boom"), LATER);
        assert_eq!(record.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_from_stored_well_formed() {
        let record = TaskRecord::from_stored(
            "t1",
            json!({
                "id": "stale",
                "status": "completed",
                "message": "done",
                "error": null,
                "progress": 100,
                "created_at": "2024-05-01T10:00:00Z",
                "updated_at": "2024-05-01T10:05:00Z",
                "completed_at": "2024-05-01T10:05:00Z",
                "output_path": "/out/x.mp4"
            }),
        )
        .unwrap();

        assert_eq!(record.id, "t1");
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.message.as_deref(), Some("done"));
        assert_eq!(record.error, None);
        assert_eq!(record.progress, Some(100));
        assert_eq!(record.completed_at.as_deref(), Some("2024-05-01T10:05:00Z"));
        assert_eq!(record.extra.len(), 1);
        assert_eq!(record.extra["output_path"], json!("/out/x.mp4"));
    }

    #[test]
    fn test_from_stored_keeps_mistyped_progress_as_extra() {
        let mut record = TaskRecord::from_stored(
            "legacy",
            json!({"status": "processing", "progress": 12.5, "created_at": "2024-05-01T10:00:00"}),
        )
        .unwrap();
        assert_eq!(record.progress, None);
        assert_eq!(record.extra["progress"], json!(12.5));

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["progress"], json!(12.5));

        record.apply(&TaskUpdate::new().with_progress(40), LATER);
        assert!(record.extra.get("progress").is_none());
        let text = serde_json::to_string(&record).unwrap();
        assert_eq!(text.matches("\"progress\"").count(), 1);
        assert_eq!(serde_json::to_value(&record).unwrap()["progress"], json!(40));
    }

    #[test]
    fn test_from_stored_unknown_status_reads_as_processing() {
        let record = TaskRecord::from_stored("t1", json!({"status": "queued", "message": 42})).unwrap();
        assert_eq!(record.status, TaskStatus::Processing);
        assert_eq!(record.message.as_deref(), Some("42"));
        assert!(record.extra.is_empty());

        let missing = TaskRecord::from_stored("t2", json!({"created_at": "2024-05-01T10:00:00Z"})).unwrap();
        assert_eq!(missing.status, TaskStatus::Processing);
        assert_eq!(missing.created_at, "2024-05-01T10:00:00Z");
    }

    #[test]
    fn test_from_stored_rejects_non_objects() {
        assert!(TaskRecord::from_stored("t1", json!("completed")).is_none());
        assert!(TaskRecord::from_stored("t1", json!([1, 2])).is_none());
    }

    #[test]
    fn test_stamp_replaces_mistyped_completed_at() {
        let mut record =
            TaskRecord::from_stored("t1", json!({"status": "processing", "completed_at": 1714557600})).unwrap();
        assert_eq!(record.extra["completed_at"], json!(1714557600));

        assert!(record.apply(&TaskUpdate::status(TaskStatus::Completed), LATER));
        assert_eq!(record.completed_at.as_deref(), Some(LATER));
        assert!(record.extra.get("completed_at").is_none());
    }

    fn any_status() -> impl Strategy<Value = TaskStatus> {
        prop_oneof![
            Just(TaskStatus::Processing),
            Just(TaskStatus::Completed),
            Just(TaskStatus::Error),
        ]
    }

    proptest! {
        #[test]
        fn prop_terminal_status_never_changes(
            first in any_status(),
            rest in proptest::collection::vec(proptest::option::of(any_status()), 0..8),
        ) {
            let mut record = TaskRecord::new("p");
            record.apply(&TaskUpdate::status(first), LATER);
            let settled = record.status;

            let mut transitions = usize::from(settled.is_terminal());
            for status in rest {
                let update = TaskUpdate { status, ..TaskUpdate::default() };
                let before = record.status;
                if record.apply(&update, LATER) {
                    transitions += 1;
                }
                if before.is_terminal() {
                    prop_assert_eq!(record.status, before);
                }
            }
            prop_assert!(transitions <= 1);
        }
    }
}
