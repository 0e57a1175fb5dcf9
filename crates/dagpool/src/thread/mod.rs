//! Threading Model
//!
//! Thread pool running dependency-ordered tasks on OS threads.
//! - One lock-free ready queue per worker
//! - Least-loaded dispatch with optional thread affinity
//! - Caller threads may join in as external workers

mod pool;
mod worker;

pub use pool::*;
