//! Scheduler errors

use std::fmt;
use std::sync::Arc;

use crate::store::TaskId;

/// Scheduler error
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Task store is full ({capacity} live tasks)")]
    CapacityExceeded { capacity: usize },

    #[error("Unknown or removed task {0}")]
    UnknownTask(TaskId),

    #[error("Task lists parent {parent} more than once")]
    DuplicateParent { parent: TaskId },

    #[error("Task would have {count} parents (limit {limit})")]
    TooManyParents { count: usize, limit: usize },

    #[error("Task {parent} would have more than {limit} children")]
    TooManyChildren { parent: TaskId, limit: usize },

    #[error("Thread affinity {affinity} names no worker (pool size {pool_size})")]
    InvalidAffinity { affinity: usize, pool_size: usize },

    #[error("Task {0} is still scheduled")]
    TaskInFlight(TaskId),

    #[error("Task {0} is already scheduled")]
    AlreadyScheduled(TaskId),

    #[error("Task {task} depends on {parent}, which is not part of the batch")]
    UnscheduledParent { task: TaskId, parent: TaskId },

    #[error("Dependency cycle through task {0}")]
    Cycle(TaskId),

    #[error("External worker capacity ({capacity}) reached")]
    ExternalWorkerCapacity { capacity: usize },

    #[error("{operation} called from a worker thread of the same pool")]
    CalledFromWorker { operation: &'static str },

    #[error("Thread pool has shut down")]
    PoolShutDown,

    #[error("Task failed: {0}")]
    TaskFailed(TaskFailure),

    #[error(
        "{count} task(s) failed, {skipped} dependent task(s) skipped; first: {first}",
        count = failures.len(),
        first = first_failure(failures)
    )]
    TasksFailed {
        failures: Vec<TaskFailure>,
        skipped: usize,
    },
}

fn first_failure(failures: &[TaskFailure]) -> String {
    failures
        .first()
        .map(ToString::to_string)
        .unwrap_or_default()
}

/// A task whose callable returned an error or panicked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// Store id the task ran under
    pub task: TaskId,
    /// Label given when the task was built
    pub label: Option<Arc<str>>,
    /// Error message or panic payload
    pub reason: String,
}

impl TaskFailure {
    pub(crate) fn new(task: TaskId, label: Option<Arc<str>>, reason: impl Into<String>) -> Self {
        Self {
            task,
            label,
            reason: reason.into(),
        }
    }

    /// Describe a panic payload caught from a callable
    pub(crate) fn from_panic(
        task: TaskId,
        label: Option<Arc<str>>,
        payload: &(dyn std::any::Any + Send),
    ) -> Self {
        let reason = if let Some(message) = payload.downcast_ref::<&str>() {
            format!("panicked: {message}")
        } else if let Some(message) = payload.downcast_ref::<String>() {
            format!("panicked: {message}")
        } else {
            "panicked".to_string()
        };
        Self::new(task, label, reason)
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "task {} ({}) {}", self.task, label, self.reason),
            None => write!(f, "task {} {}", self.task, self.reason),
        }
    }
}
