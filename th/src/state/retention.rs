//! Retention sweep
//!
//! Deletes records older than the retention window, whatever their status.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use super::document::TaskMap;

/// Remove expired records, returning their ids
///
/// Age is measured from `created_at`. Records whose `created_at` is missing
/// or unparsable are kept.
pub fn sweep(tasks: &mut TaskMap, retention: Duration, now: DateTime<Utc>) -> Vec<String> {
    let mut expired = Vec::new();

    for (id, record) in tasks.iter() {
        if record.created_at.is_empty() {
            debug!(%id, "sweep: no created_at, keeping");
            continue;
        }
        match record.created_at_utc() {
            Some(created_at) if now - created_at > retention => expired.push(id.clone()),
            Some(_) => {}
            None => {
                warn!(%id, created_at = %record.created_at, "Invalid date format for task, keeping it");
            }
        }
    }

    for id in &expired {
        tasks.remove(id);
    }
    if !expired.is_empty() {
        info!(count = expired.len(), "Swept expired tasks");
    }
    expired
}
