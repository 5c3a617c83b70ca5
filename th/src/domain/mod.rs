//! Domain types for taskhistory
//!
//! TaskRecord is the persisted state of one job; TaskUpdate is the partial
//! update producers send to it.

mod id;
mod record;

pub use id::generate_task_id;
pub use record::{RESERVED_FIELDS, TaskRecord, TaskStatus, TaskUpdate, now_rfc3339, parse_timestamp};
