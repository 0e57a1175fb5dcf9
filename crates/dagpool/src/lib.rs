//! dagpool
//!
//! A thread pool that runs tasks in dependency order.
//!
//! # Features
//! - Tree tasks composed with `|` (parallel) and `>>` (succession)
//! - Flat dependency store with generational task ids
//! - Least-loaded dispatch, optional thread affinity and task weights
//! - Caller threads can lend themselves to the pool
//! - Panics and errors are collected and reported by `join`
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicI32, Ordering};
//! use dagpool::{Task, ThreadPool};
//!
//! let pool = ThreadPool::new()?;
//! let value = Arc::new(AtomicI32::new(0));
//!
//! let (a, b) = (Arc::clone(&value), Arc::clone(&value));
//! let first = Task::new(move || {
//!     a.fetch_add(1, Ordering::SeqCst);
//! });
//! let second = Task::new(move || {
//!     b.fetch_add(1, Ordering::SeqCst);
//! });
//! let task = first >> second;
//!
//! pool.schedule(&task)?;
//! pool.join()?;
//! assert_eq!(value.load(Ordering::SeqCst), 2);
//! # Ok::<(), dagpool::SchedulerError>(())
//! ```

pub mod config;
pub mod error;
mod lower;
pub mod store;
pub mod task;
pub mod thread;

pub use config::PoolConfig;
pub use error::{SchedulerError, TaskFailure};
pub use store::{Ownership, TaskId, TaskState, TaskStore, WorkItem, DEFAULT_WEIGHT};
pub use task::Task;
pub use thread::{PoolHandle, PoolStats, ThreadPool, WorkerStats};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
