//! StateManager - actor that owns the task document
//!
//! Every read-modify-write of the document runs inside the actor, one command
//! at a time, so concurrent producers never clobber each other. Waits run in
//! the caller's task against the shared [`Notifier`] and never occupy the actor.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use eyre::Context;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::domain::{TaskRecord, TaskStatus, TaskUpdate, generate_task_id, now_rfc3339, parse_timestamp};

use super::document::{DocumentFile, StoreError, TaskMap};
use super::messages::{StateCommand, StateError, StateResponse};
use super::notifier::Notifier;
use super::recovery::RecoveryReport;
use super::{recovery, retention};

/// Handle to send commands to the StateManager
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
    notifier: Notifier,
    startup: RecoveryReport,
}

impl StateManager {
    /// Spawn a new StateManager actor
    ///
    /// Recovers the document first, then re-arms a wait handle for every task
    /// that is still processing. Fails if the document exists but cannot be
    /// read; it is never discarded for that.
    pub fn spawn(config: &StoreConfig) -> eyre::Result<Self> {
        debug!(path = %config.path.display(), "spawn: called");
        let doc = DocumentFile::new(&config.path);
        let (tasks, report) = recovery::recover(&doc)
            .context(format!("Failed to open task document {}", config.path.display()))?;
        if report.discarded() {
            warn!(%report, "Task document was corrupt and has been reinitialized");
        }

        let notifier = Notifier::new();
        for record in tasks.values().filter(|r| !r.is_terminal()) {
            notifier.register(&record.id);
        }

        let store = TaskStore {
            doc,
            retention: config.retention(),
            notifier: notifier.clone(),
        };

        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        tokio::spawn(actor_loop(store, rx));

        info!(%report, "StateManager spawned");
        Ok(Self {
            tx,
            notifier,
            startup: report,
        })
    }

    /// Spawn with default settings and the document at `path`
    pub fn open(path: impl AsRef<Path>) -> eyre::Result<Self> {
        Self::spawn(&StoreConfig::at(path.as_ref()))
    }

    async fn request<T>(&self, cmd: StateCommand, reply_rx: oneshot::Receiver<StateResponse<T>>) -> StateResponse<T> {
        self.tx.send(cmd).await.map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    // === Producer operations ===

    /// Create a task with a caller-chosen id
    ///
    /// The task always starts out processing.
    pub async fn create(&self, id: &str, initial: TaskUpdate) -> StateResponse<TaskRecord> {
        debug!(%id, "create: called");
        let (reply, reply_rx) = oneshot::channel();
        let cmd = StateCommand::Create {
            id: id.to_string(),
            initial,
            reply,
        };
        self.request(cmd, reply_rx).await
    }

    /// Create a task with a fresh id and return the id
    pub async fn create_task(&self, initial: TaskUpdate) -> StateResponse<String> {
        let id = generate_task_id();
        debug!(%id, "create_task: called");
        self.create(&id, initial).await.map(|record| record.id)
    }

    /// Merge an update into a task, creating the task if absent
    ///
    /// Returns None when the update could not be persisted, or when the task
    /// was swept by the same write.
    pub async fn save(&self, id: &str, update: TaskUpdate) -> StateResponse<Option<TaskRecord>> {
        debug!(%id, status = ?update.status, "save: called");
        let (reply, reply_rx) = oneshot::channel();
        let cmd = StateCommand::Save {
            id: id.to_string(),
            update,
            reply,
        };
        self.request(cmd, reply_rx).await
    }

    /// Merge an update into an existing task
    ///
    /// Unknown ids are logged and ignored.
    pub async fn update_task(&self, id: &str, update: TaskUpdate) -> StateResponse<Option<TaskRecord>> {
        debug!(%id, status = ?update.status, "update_task: called");
        let (reply, reply_rx) = oneshot::channel();
        let cmd = StateCommand::Update {
            id: id.to_string(),
            update,
            reply,
        };
        self.request(cmd, reply_rx).await
    }

    // === Query operations ===

    /// Get a task by id
    pub async fn get(&self, id: &str) -> StateResponse<Option<TaskRecord>> {
        debug!(%id, "get: called");
        let (reply, reply_rx) = oneshot::channel();
        let cmd = StateCommand::Get {
            id: id.to_string(),
            reply,
        };
        self.request(cmd, reply_rx).await
    }

    /// Get a task by id, returning NotFound if absent
    pub async fn get_task(&self, id: &str) -> StateResponse<TaskRecord> {
        debug!(%id, "get_task: called");
        self.get(id).await?.ok_or_else(|| StateError::NotFound(id.to_string()))
    }

    /// List tasks newest first
    pub async fn list(&self, status_filter: Option<TaskStatus>, limit: Option<usize>) -> StateResponse<Vec<TaskRecord>> {
        debug!(?status_filter, ?limit, "list: called");
        let (reply, reply_rx) = oneshot::channel();
        let cmd = StateCommand::List {
            status_filter,
            limit,
            reply,
        };
        self.request(cmd, reply_rx).await
    }

    /// Run the retention sweep now, returning how many tasks were removed
    pub async fn prune(&self) -> StateResponse<usize> {
        debug!("prune: called");
        let (reply, reply_rx) = oneshot::channel();
        self.request(StateCommand::Prune { reply }, reply_rx).await
    }

    /// Block until the task is terminal or `timeout` elapses
    ///
    /// Returns at once if the task is already terminal. A task that is swept,
    /// lost to recovery, or drained at shutdown while waited on yields NotFound.
    pub async fn wait(&self, id: &str, timeout: Duration) -> StateResponse<TaskRecord> {
        debug!(%id, ?timeout, "wait: called");

        // Subscribe before reading so a signal between the two is not missed.
        // A processing task with no handle yet was registered by the command
        // that our read queued behind, so one resubscribe finds it.
        let mut handle = None;
        for _ in 0..2 {
            let subscribed = self.notifier.subscribe(id);
            let record = self.get_task(id).await?;
            if record.is_terminal() {
                debug!(%id, status = %record.status, "wait: already terminal");
                return Ok(record);
            }
            if subscribed.is_some() {
                handle = subscribed;
                break;
            }
            debug!(%id, "wait: no handle yet, resubscribing");
        }
        let Some(mut rx) = handle else {
            debug!(%id, "wait: task has no wait handle");
            return Err(StateError::NotFound(id.to_string()));
        };

        let outcome = tokio::time::timeout(timeout, rx.wait_for(|done| *done))
            .await
            .map(|result| result.is_ok());
        let signaled = match outcome {
            Ok(signaled) => signaled,
            Err(_) => {
                debug!(%id, ?timeout, "wait: timed out");
                return Err(StateError::Timeout {
                    id: id.to_string(),
                    timeout,
                });
            }
        };
        drop(rx);

        if !signaled {
            debug!(%id, "wait: handle dropped without signal");
            return Err(StateError::NotFound(id.to_string()));
        }
        match self.get(id).await? {
            Some(record) if record.is_terminal() => Ok(record),
            _ => Err(StateError::NotFound(id.to_string())),
        }
    }

    /// Wait with the timeout given in seconds
    pub async fn wait_for_task(&self, id: &str, timeout_secs: u64) -> StateResponse<TaskRecord> {
        self.wait(id, Duration::from_secs(timeout_secs)).await
    }

    /// What recovery found when this store was opened
    pub fn startup_report(&self) -> &RecoveryReport {
        &self.startup
    }

    /// Number of waiters currently blocked on `id`
    pub fn waiter_count(&self, id: &str) -> usize {
        self.notifier.waiter_count(id)
    }

    /// Number of tasks with a live wait handle
    pub fn wait_handles(&self) -> usize {
        self.notifier.len()
    }

    /// Shutdown the StateManager
    ///
    /// Pending waits resolve to NotFound.
    pub async fn shutdown(&self) -> Result<(), StateError> {
        debug!("shutdown: called");
        self.tx
            .send(StateCommand::Shutdown)
            .await
            .map_err(|_| StateError::ChannelError)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveMode {
    Create,
    Upsert,
    Existing,
}

/// Outcome of one read-modify-write cycle
#[derive(Debug)]
enum Commit {
    Written { record: TaskRecord, became_terminal: bool },
    /// The saved task was older than the retention window and was swept
    Expired,
    /// Create on an id that is present
    Exists,
    /// Update on an id that is absent
    Missing,
    /// Write failed twice; the update is lost
    Dropped,
}

/// State owned by the actor
struct TaskStore {
    doc: DocumentFile,
    retention: chrono::Duration,
    notifier: Notifier,
}

impl TaskStore {
    /// Read the document, quarantining it if it is corrupt
    ///
    /// The flag is true when the document was discarded. I/O failures leave
    /// the document in place and are returned.
    fn load(&self, keep: Option<&str>) -> Result<(TaskMap, bool), StoreError> {
        match self.doc.load() {
            Ok(tasks) => Ok((tasks, false)),
            Err(e) => {
                warn!(error = %e, "Failed to read task document, recovering");
                self.recover(keep)
            }
        }
    }

    /// Re-run recovery; handles for tasks lost with the document are dropped
    fn recover(&self, keep: Option<&str>) -> Result<(TaskMap, bool), StoreError> {
        let (tasks, report) = recovery::recover(&self.doc)?;
        let discarded = report.discarded();
        if discarded {
            let dropped = self.notifier.retain(|id| Some(id) == keep);
            warn!(%report, dropped_waits = dropped, "Task store reinitialized");
        }
        Ok((tasks, discarded))
    }

    /// Read, merge, write, sweep; retried once after recovery; signals on a
    /// terminal transition once the write is on disk
    fn commit(&self, id: &str, update: &TaskUpdate, mode: SaveMode) -> Commit {
        let mut mode = mode;
        let mut attempt = |loaded: Result<(TaskMap, bool), StoreError>| -> Result<Commit, StoreError> {
            let (tasks, discarded) = loaded?;
            // The record may have been lost with a discarded document; keep the update
            if discarded && mode == SaveMode::Existing {
                mode = SaveMode::Upsert;
            }
            self.merge_and_write(tasks, id, update, mode)
        };

        let commit = match attempt(self.load(Some(id))) {
            Ok(commit) => commit,
            Err(e) => {
                warn!(%id, error = %e, "Task write failed, recovering and retrying once");
                match attempt(self.recover(Some(id))) {
                    Ok(commit) => {
                        info!(%id, "Task saved after recovery");
                        commit
                    }
                    Err(e) => {
                        error!(%id, error = %e, ?update, "Failed to recover and save task, dropping update");
                        Commit::Dropped
                    }
                }
            }
        };

        if let Commit::Written {
            record,
            became_terminal: true,
        } = &commit
        {
            let waiters = self.notifier.signal(id);
            info!(%id, status = %record.status, waiters, "Task reached terminal status");
        }
        commit
    }

    fn merge_and_write(&self, mut tasks: TaskMap, id: &str, update: &TaskUpdate, mode: SaveMode) -> Result<Commit, StoreError> {
        match (mode, tasks.contains_key(id)) {
            (SaveMode::Create, true) => return Ok(Commit::Exists),
            (SaveMode::Existing, false) => return Ok(Commit::Missing),
            _ => {}
        }

        let now = now_rfc3339();
        let record = tasks
            .entry(id.to_string())
            .or_insert_with(|| TaskRecord::new_at(id, &now));
        let became_terminal = record.apply(update, &now);
        let record = record.clone();

        self.doc.write(&tasks)?;
        debug!(%id, status = %record.status, "merge_and_write: committed");
        if !record.is_terminal() {
            self.notifier.register(id);
        }

        let swept = retention::sweep(&mut tasks, self.retention, Utc::now());
        if !swept.is_empty() {
            for expired in &swept {
                self.notifier.remove(expired);
            }
            if let Err(e) = self.doc.write(&tasks) {
                warn!(error = %e, "Failed to persist retention sweep; it will rerun on the next save");
            }
            if swept.iter().any(|expired| expired == id) {
                debug!(%id, "merge_and_write: saved task was past retention");
                return Ok(Commit::Expired);
            }
        }

        Ok(Commit::Written {
            record,
            became_terminal,
        })
    }

    fn create(&self, id: &str, initial: TaskUpdate) -> StateResponse<TaskRecord> {
        if initial.status.is_some_and(|s| s != TaskStatus::Processing) {
            warn!(%id, status = ?initial.status, "New tasks start processing; ignoring initial status");
        }
        let initial = TaskUpdate {
            status: Some(TaskStatus::Processing),
            ..initial
        };

        match self.commit(id, &initial, SaveMode::Create) {
            Commit::Written { record, .. } => {
                info!(%id, "Created task");
                Ok(record)
            }
            Commit::Exists => Err(StateError::AlreadyExists(id.to_string())),
            Commit::Dropped | Commit::Expired | Commit::Missing => {
                // Not persisted; hand back what would have been stored
                let now = now_rfc3339();
                let mut record = TaskRecord::new_at(id, &now);
                record.apply(&initial, &now);
                Ok(record)
            }
        }
    }

    fn save(&self, id: &str, update: &TaskUpdate, mode: SaveMode) -> Option<TaskRecord> {
        match self.commit(id, update, mode) {
            Commit::Written { record, .. } => Some(record),
            Commit::Missing => {
                error!(%id, "Cannot update non-existent task");
                None
            }
            Commit::Expired | Commit::Dropped | Commit::Exists => None,
        }
    }

    /// Document for a read-only query; empty if it cannot be read right now
    fn snapshot(&self) -> TaskMap {
        match self.load(None) {
            Ok((tasks, _)) => tasks,
            Err(e) => {
                warn!(error = %e, "Task document unavailable, answering from an empty view");
                TaskMap::new()
            }
        }
    }

    fn get(&self, id: &str) -> Option<TaskRecord> {
        self.snapshot().remove(id)
    }

    fn list(&self, status_filter: Option<TaskStatus>, limit: Option<usize>) -> Vec<TaskRecord> {
        let tasks = self.snapshot();
        let mut records: Vec<TaskRecord> = tasks
            .into_values()
            .filter(|r| status_filter.is_none_or(|s| r.status == s))
            .collect();
        records.sort_by_key(|r| std::cmp::Reverse(parse_timestamp(&r.created_at)));
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        records
    }

    fn prune(&self) -> usize {
        let (mut tasks, _) = match self.load(None) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(error = %e, "Task document unavailable, skipping prune");
                return 0;
            }
        };
        let swept = retention::sweep(&mut tasks, self.retention, Utc::now());
        if swept.is_empty() {
            return 0;
        }
        for expired in &swept {
            self.notifier.remove(expired);
        }
        if let Err(e) = self.doc.write(&tasks) {
            warn!(error = %e, "Failed to persist retention sweep");
            return 0;
        }
        swept.len()
    }
}

/// The actor loop that owns the document and processes commands
async fn actor_loop(store: TaskStore, mut rx: mpsc::Receiver<StateCommand>) {
    debug!("StateManager actor started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StateCommand::Create { id, initial, reply } => {
                debug!(%id, "actor_loop: Create command");
                let _ = reply.send(store.create(&id, initial));
            }

            StateCommand::Save { id, update, reply } => {
                debug!(%id, "actor_loop: Save command");
                let _ = reply.send(Ok(store.save(&id, &update, SaveMode::Upsert)));
            }

            StateCommand::Update { id, update, reply } => {
                debug!(%id, "actor_loop: Update command");
                let _ = reply.send(Ok(store.save(&id, &update, SaveMode::Existing)));
            }

            StateCommand::Get { id, reply } => {
                debug!(%id, "actor_loop: Get command");
                let _ = reply.send(Ok(store.get(&id)));
            }

            StateCommand::List {
                status_filter,
                limit,
                reply,
            } => {
                debug!(?status_filter, ?limit, "actor_loop: List command");
                let _ = reply.send(Ok(store.list(status_filter, limit)));
            }

            StateCommand::Prune { reply } => {
                debug!("actor_loop: Prune command");
                let _ = reply.send(Ok(store.prune()));
            }

            StateCommand::Shutdown => {
                debug!("actor_loop: Shutdown command");
                break;
            }
        }
    }

    let drained = store.notifier.drain();
    info!(drained_waits = drained, "StateManager actor stopped");
}
