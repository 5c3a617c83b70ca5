//! TaskHistory - persistent status store for background jobs
//!
//! Producers record the progress of long-running jobs in a single JSON
//! document; consumers poll a task or block until it finishes.
//!
//! # Architecture
//!
//! ```text
//! task_history.json          # { "<task id>": { "status": ..., ... }, ... }
//! task_history.json.bak      # last quarantined unreadable document
//! ```
//!
//! # Example
//!
//! ```ignore
//! use taskhistory::{StateManager, TaskStatus, TaskUpdate};
//!
//! let store = StateManager::open("task_history.json")?;
//! let id = store.create_task(TaskUpdate::new().with_message("Starting")).await?;
//! store.update_task(&id, TaskUpdate::status(TaskStatus::Completed)).await?;
//! let done = store.wait_for_task(&id, 60).await?;
//! ```
//!
//! # Modules
//!
//! - [`domain`] - Task records, statuses, and updates
//! - [`state`] - Document store actor, recovery, retention, and notifier
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod domain;
pub mod state;

pub use config::{Config, StoreConfig, WaitConfig};
pub use domain::{TaskRecord, TaskStatus, TaskUpdate, generate_task_id};
pub use state::{StateError, StateManager, StateResponse};

/// Default retention window for task records (days)
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Default bound for completion waits (30 minutes)
pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 30 * 60;

/// File name of the task document
pub const HISTORY_FILE_NAME: &str = "task_history.json";
