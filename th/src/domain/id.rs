//! Task ID generation
//!
//! IDs are UUIDv7 strings, so they sort by creation time.

/// Generate a fresh task ID
pub fn generate_task_id() -> String {
    uuid::Uuid::now_v7().to_string()
}
