//! Pool Configuration

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Thread pool configuration options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of internal worker threads
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Maximum number of live entries in the dependency store
    #[serde(default = "default_task_capacity")]
    pub task_capacity: usize,

    /// Maximum parents recorded for a single task
    #[serde(default = "default_max_links")]
    pub max_parents_per_task: usize,

    /// Maximum children recorded for a single task
    #[serde(default = "default_max_links")]
    pub max_children_per_task: usize,

    /// Caller threads that may join the pool at once
    #[serde(default = "default_external_worker_capacity")]
    pub external_worker_capacity: usize,

    /// Worker threads are named `{prefix}-{index}`
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

/// Hardware concurrency minus the thread that drives the pool.
fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

fn default_task_capacity() -> usize {
    50_000
}

fn default_max_links() -> usize {
    100
}

fn default_external_worker_capacity() -> usize {
    1
}

fn default_thread_name_prefix() -> String {
    "dagpool-worker".to_string()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            task_capacity: default_task_capacity(),
            max_parents_per_task: default_max_links(),
            max_children_per_task: default_max_links(),
            external_worker_capacity: default_external_worker_capacity(),
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

impl PoolConfig {
    /// Create with a specific number of worker threads
    pub fn with_pool_size(pool_size: usize) -> Self {
        Self {
            pool_size,
            ..Self::default()
        }
    }

    /// Check that every option is usable.
    ///
    /// Link limits below two would leave lowering unable to build relay
    /// trees, so they are rejected along with zero sizes.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        let invalid = |reason: &str| Err(SchedulerError::InvalidConfig(reason.to_string()));

        if self.pool_size == 0 {
            return invalid("pool_size must be at least 1");
        }
        if self.task_capacity == 0 {
            return invalid("task_capacity must be at least 1");
        }
        if self.task_capacity > u32::MAX as usize {
            return invalid("task_capacity does not fit a task id");
        }
        if self.max_parents_per_task < 2 {
            return invalid("max_parents_per_task must be at least 2");
        }
        if self.max_children_per_task < 2 {
            return invalid("max_children_per_task must be at least 2");
        }
        Ok(())
    }
}
