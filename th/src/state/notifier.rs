//! Per-task completion notifier
//!
//! Each task that can still finish owns a `watch` channel. Waiters hold a
//! receiver; signaling flips the value to `true` and wakes all of them at once.
//! Dropping the sender without a signal (sweep, recovery, shutdown) closes the
//! channel, which waiters read as "task gone".
//!
//! Dropping a receiver is the deregistration, so cancelled or timed-out waits
//! leave nothing behind.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::debug;

type Registry = HashMap<String, watch::Sender<bool>>;

/// Registry of wait handles, shared by the store actor and waiters
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    inner: Arc<Mutex<Registry>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // Entries are plain senders; a panic elsewhere cannot leave them half-updated
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a wait handle for `id` unless one exists
    pub fn register(&self, id: &str) -> bool {
        let mut registry = self.registry();
        if registry.contains_key(id) {
            return false;
        }
        let (tx, _) = watch::channel(false);
        registry.insert(id.to_string(), tx);
        debug!(%id, "register: wait handle created");
        true
    }

    /// Get a receiver for `id`, if it is registered
    pub fn subscribe(&self, id: &str) -> Option<watch::Receiver<bool>> {
        self.registry().get(id).map(|tx| tx.subscribe())
    }

    /// Release every waiter on `id` and retire the handle
    ///
    /// Returns the number of waiters that were woken.
    pub fn signal(&self, id: &str) -> usize {
        let Some(tx) = self.registry().remove(id) else {
            return 0;
        };
        let waiters = tx.receiver_count();
        tx.send_replace(true);
        debug!(%id, waiters, "signal: released waiters");
        waiters
    }

    /// Drop the handle for `id` without signaling
    pub fn remove(&self, id: &str) -> bool {
        self.registry().remove(id).is_some()
    }

    /// Keep only handles whose id passes `keep`
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) -> usize {
        let mut registry = self.registry();
        let before = registry.len();
        registry.retain(|id, _| keep(id));
        before - registry.len()
    }

    /// Drop every handle; pending waiters see their channel close
    pub fn drain(&self) -> usize {
        let drained: Vec<_> = self.registry().drain().collect();
        debug!(count = drained.len(), "drain: dropped all wait handles");
        drained.len()
    }

    /// Number of registered handles
    pub fn len(&self) -> usize {
        self.registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry().is_empty()
    }

    /// Number of live waiters on `id`
    pub fn waiter_count(&self, id: &str) -> usize {
        self.registry().get(id).map(|tx| tx.receiver_count()).unwrap_or(0)
    }
}
