use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::mpsc;

use super::runtime::{BgTask, ListenerKey, TaskEvent, TaskOutcome};
use crate::error::ErrorKind;

/// What a task does to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Sync a channel; the entity is a channel id
    Update,
    /// Fetch an enclosure; the entity is an item id
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub entity: i64,
    pub action: Action,
}

impl TaskKey {
    pub fn update(channel_id: i64) -> Self {
        Self {
            entity: channel_id,
            action: Action::Update,
        }
    }

    pub fn download(item_id: i64) -> Self {
        Self {
            entity: item_id,
            action: Action::Download,
        }
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.action {
            Action::Update => write!(f, "update:{}", self.entity),
            Action::Download => write!(f, "download:{}", self.entity),
        }
    }
}

/// State of a key as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running,
    Cancelling,
    Failed(ErrorKind),
}

/// Why a new task was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("A task for this key is already running")]
    Busy,
    #[error("The previous task for this key failed ({0}) and has not been consumed")]
    Unconsumed(ErrorKind),
    #[error("Too many tasks running (limit {0})")]
    AtCapacity(usize),
}

/// At most one task per [`TaskKey`], with a global cap on live tasks.
///
/// Finished entries stay until observed so a failure is never lost:
/// [`TaskRegistry::state`] reports it once and frees the key.
pub struct TaskRegistry {
    tasks: Mutex<HashMap<TaskKey, Arc<BgTask>>>,
    max_live: usize,
}

impl TaskRegistry {
    pub fn new(max_live: usize) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            max_live: max_live.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskKey, Arc<BgTask>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, key: TaskKey, task: Arc<BgTask>) -> bool {
        self.try_register(key, task).is_ok()
    }

    /// Admit `task` under `key`. The caller starts it afterwards.
    pub fn try_register(&self, key: TaskKey, task: Arc<BgTask>) -> Result<(), AdmissionError> {
        let mut tasks = self.lock();

        if let Some(existing) = tasks.get(&key) {
            match existing.outcome() {
                None => return Err(AdmissionError::Busy),
                Some(TaskOutcome::Failed(kind)) if !existing.is_consumed() => {
                    return Err(AdmissionError::Unconsumed(kind));
                }
                // Success, user cancel, or a consumed failure: replace.
                Some(_) => {}
            }
        }

        let live = tasks
            .iter()
            .filter(|(k, t)| **k != key && t.is_alive())
            .count();
        if live >= self.max_live {
            return Err(AdmissionError::AtCapacity(self.max_live));
        }

        tracing::debug!(key = %key, task = %task.name(), "Task registered");
        tasks.insert(key, task);
        Ok(())
    }

    /// Attach a listener to the task under `key`.
    pub fn bind(
        &self,
        key: TaskKey,
        listener: ListenerKey,
    ) -> Option<(Arc<BgTask>, mpsc::UnboundedReceiver<TaskEvent>)> {
        let task = self.get(key)?;
        let rx = task.subscribe(listener);
        Some((task, rx))
    }

    pub fn get(&self, key: TaskKey) -> Option<Arc<BgTask>> {
        self.lock().get(&key).cloned()
    }

    /// Current state of `key`.
    ///
    /// Reading a finished entry unregisters it: a failure is reported once
    /// as `Failed`, after which the key reads `Idle`.
    pub fn state(&self, key: TaskKey) -> TaskState {
        let mut tasks = self.lock();
        let Some(task) = tasks.get(&key) else {
            return TaskState::Idle;
        };

        match task.outcome() {
            None if task.is_cancel_requested() => TaskState::Cancelling,
            None => TaskState::Running,
            Some(outcome) => {
                tasks.remove(&key);
                match outcome {
                    TaskOutcome::Failed(kind) => TaskState::Failed(kind),
                    TaskOutcome::Success | TaskOutcome::Cancelled => TaskState::Idle,
                }
            }
        }
    }

    /// Remove a finished entry. Returns `false` if absent or still alive.
    pub fn unregister(&self, key: TaskKey) -> bool {
        let mut tasks = self.lock();
        match tasks.get(&key) {
            Some(task) if !task.is_alive() => {
                tasks.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&self, key: TaskKey) -> bool {
        match self.get(key) {
            Some(task) => task.cancel(),
            None => false,
        }
    }

    /// Acknowledge a finished task's outcome and free its key.
    pub fn consume(&self, key: TaskKey) -> bool {
        let mut tasks = self.lock();
        match tasks.get(&key) {
            Some(task) if task.consume() => {
                tasks.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn live_count(&self) -> usize {
        self.lock().values().filter(|t| t.is_alive()).count()
    }

    /// Cancel every live task.
    pub fn cancel_all(&self) {
        for task in self.lock().values() {
            task.cancel();
        }
    }

    /// Live tasks, for shutdown.
    pub fn live_tasks(&self) -> Vec<Arc<BgTask>> {
        self.lock()
            .values()
            .filter(|t| t.is_alive())
            .cloned()
            .collect()
    }
}
