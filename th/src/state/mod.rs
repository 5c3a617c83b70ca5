//! State management with actor pattern
//!
//! StateManager owns the task document and processes commands via channels.
//! Completion waits go through the shared Notifier so a blocked waiter never
//! holds up producers.

mod document;
mod manager;
mod messages;
mod notifier;
mod recovery;
mod retention;

pub use document::{BACKUP_SUFFIX, DocumentFile, StoreError, TaskMap};
pub use manager::StateManager;
pub use messages::{StateCommand, StateError, StateResponse};
pub use notifier::Notifier;
pub use recovery::{RecoveryReport, recover};
pub use retention::sweep;
