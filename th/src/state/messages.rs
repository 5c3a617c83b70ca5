//! State manager messages
//!
//! Commands and responses for the actor pattern.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::{TaskRecord, TaskStatus, TaskUpdate};

/// Errors from state operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Task already exists: {0}")]
    AlreadyExists(String),

    #[error("Task {id} timeout after {} seconds", timeout.as_secs_f64())]
    Timeout { id: String, timeout: Duration },

    #[error("Channel error")]
    ChannelError,
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

/// Commands sent to the StateManager actor
#[derive(Debug)]
pub enum StateCommand {
    Create {
        id: String,
        initial: TaskUpdate,
        reply: oneshot::Sender<StateResponse<TaskRecord>>,
    },
    /// Merge into a record, creating it if absent
    Save {
        id: String,
        update: TaskUpdate,
        reply: oneshot::Sender<StateResponse<Option<TaskRecord>>>,
    },
    /// Merge into an existing record only
    Update {
        id: String,
        update: TaskUpdate,
        reply: oneshot::Sender<StateResponse<Option<TaskRecord>>>,
    },
    Get {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<TaskRecord>>>,
    },
    List {
        status_filter: Option<TaskStatus>,
        limit: Option<usize>,
        reply: oneshot::Sender<StateResponse<Vec<TaskRecord>>>,
    },
    Prune {
        reply: oneshot::Sender<StateResponse<usize>>,
    },
    Shutdown,
}
