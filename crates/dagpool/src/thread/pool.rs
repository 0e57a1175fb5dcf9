//! Thread Pool
//!
//! Fixed set of worker threads executing dependency-ordered tasks from a
//! shared store. Completing a task readies its children and hands them to
//! the least-loaded worker.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;

use super::worker::Worker;
use crate::config::PoolConfig;
use crate::error::{SchedulerError, TaskFailure};
use crate::lower::lower;
use crate::store::{Armed, Ownership, ReadyTask, TaskId, TaskState, TaskStore, WorkItem};
use crate::task::Task;

/// Pool id counter
static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Id of the pool whose worker loop runs on this thread, 0 for none
    static CURRENT_POOL: Cell<usize> = const { Cell::new(0) };
}

/// State shared by the pool, its threads and its handles
struct Shared {
    id: usize,
    config: PoolConfig,
    store: RwLock<TaskStore>,
    /// Internal workers, one per thread
    workers: Vec<Arc<Worker>>,
    /// Caller threads inside `employ_current_thread`
    external: RwLock<Vec<Arc<Worker>>>,
    /// Armed entries not yet completed
    scheduled: AtomicUsize,
    join_lock: Mutex<()>,
    all_processed: Condvar,
    /// Failures since the last `join`
    failures: Mutex<Vec<TaskFailure>>,
    /// Poisoned tasks skipped since the last `join`
    skipped: AtomicUsize,
    /// Set under the store write lock once the pool is being dropped
    closing: AtomicBool,
}

impl Shared {
    fn on_worker_thread(&self) -> bool {
        CURRENT_POOL.with(Cell::get) == self.id
    }

    fn check_open(&self) -> Result<(), SchedulerError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(SchedulerError::PoolShutDown);
        }
        Ok(())
    }

    fn schedule(&self, task: &Task) -> Result<(), SchedulerError> {
        let armed = {
            let mut store = self.store.write();
            self.check_open()?;
            let ids = lower(&mut store, task)?;
            if ids.is_empty() {
                return Ok(());
            }
            let armed = store.arm_unchecked(&ids);
            self.scheduled.fetch_add(armed.count, Ordering::AcqRel);
            armed
        };
        tracing::debug!(pool = self.id, tasks = armed.count, "Scheduled task tree");
        self.release(armed);
        Ok(())
    }

    fn schedule_ids(&self, ids: &[TaskId]) -> Result<(), SchedulerError> {
        let armed = {
            let mut store = self.store.write();
            self.check_open()?;
            let armed = store.arm(ids)?;
            self.scheduled.fetch_add(armed.count, Ordering::AcqRel);
            armed
        };
        tracing::debug!(pool = self.id, tasks = armed.count, "Scheduled task batch");
        self.release(armed);
        Ok(())
    }

    fn create(&self, item: WorkItem, parents: &[TaskId]) -> Result<TaskId, SchedulerError> {
        let mut store = self.store.write();
        self.check_open()?;
        store.create(item, parents)
    }

    fn remove(&self, id: TaskId) -> Result<(), SchedulerError> {
        let mut store = self.store.write();
        if store.ownership(id) == Some(Ownership::OwnedByPool) {
            return Err(SchedulerError::UnknownTask(id));
        }
        store.remove(id)
    }

    fn release(&self, armed: Armed) {
        for task in armed.ready {
            if task.relay {
                self.processed_task(task.id, false);
            } else {
                self.add(task);
            }
        }
    }

    /// Queue on the pinned worker, else on the least-loaded one
    fn add(&self, task: ReadyTask) {
        if let Some(worker) = task.affinity.and_then(|i| self.workers.get(i)) {
            worker.add_task(task);
            return;
        }

        // Held while pushing so a deregistering external worker drains it.
        let external = self.external.read();
        let target = self
            .workers
            .iter()
            .chain(external.iter())
            .min_by_key(|worker| worker.weight());
        if let Some(worker) = target {
            worker.add_task(task);
        }
    }

    fn execute(&self, task: ReadyTask) {
        let failed = self.run_task(task.id);
        self.processed_task(task.id, failed);
    }

    /// Run a task's callable, returning whether it failed
    fn run_task(&self, id: TaskId) -> bool {
        let Some(started) = self.store.read().start(id) else {
            return false;
        };
        if started.poisoned {
            tracing::trace!(pool = self.id, task = %id, "Skipping task after failed dependency");
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let Some(job) = started.job else {
            return false;
        };

        tracing::trace!(pool = self.id, task = %id, "Running task");
        let failure = match panic::catch_unwind(AssertUnwindSafe(|| job.call())) {
            Ok(Ok(())) => return false,
            Ok(Err(error)) => TaskFailure::new(id, started.label, format!("{error:#}")),
            Err(payload) => TaskFailure::from_panic(id, started.label, payload.as_ref()),
        };
        tracing::warn!(pool = self.id, "Task failed: {failure}");
        self.failures.lock().push(failure);
        true
    }

    /// Complete a task and everything it unblocks that has no callable
    fn processed_task(&self, id: TaskId, failed: bool) {
        let mut pending = vec![(id, failed)];
        while let Some((id, failed)) = pending.pop() {
            let completion = self.store.read().complete(id, failed);
            if completion.pool_owned {
                let removed = self.store.write().remove(id);
                debug_assert!(removed.is_ok(), "completed pool task {id} not removable");
            }
            for task in completion.ready {
                if task.relay {
                    pending.push((task.id, false));
                } else {
                    self.add(task);
                }
            }
            self.finish_one();
        }
    }

    fn finish_one(&self) {
        if self.scheduled.fetch_sub(1, Ordering::AcqRel) == 1 {
            for worker in self.external.read().iter() {
                worker.stop();
            }
            let _guard = self.join_lock.lock();
            self.all_processed.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut guard = self.join_lock.lock();
        while self.scheduled.load(Ordering::Acquire) > 0 {
            self.all_processed.wait(&mut guard);
        }
    }

    fn join(&self) -> Result<(), SchedulerError> {
        if self.on_worker_thread() {
            return Err(SchedulerError::CalledFromWorker { operation: "join" });
        }
        self.wait_idle();

        let failures = std::mem::take(&mut *self.failures.lock());
        let skipped = self.skipped.swap(0, Ordering::Relaxed);
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SchedulerError::TasksFailed { failures, skipped })
        }
    }

    fn employ_current_thread(&self) -> Result<(), SchedulerError> {
        if self.on_worker_thread() {
            return Err(SchedulerError::CalledFromWorker {
                operation: "employ_current_thread",
            });
        }

        let worker = {
            let mut external = self.external.write();
            let capacity = self.config.external_worker_capacity;
            if external.len() >= capacity {
                return Err(SchedulerError::ExternalWorkerCapacity { capacity });
            }
            let name = format!("{}-external-{}", self.config.thread_name_prefix, external.len());
            let worker = Arc::new(Worker::new(name));
            external.push(Arc::clone(&worker));
            worker
        };
        // Registered first, so a pool finishing after this check stops us.
        if self.scheduled.load(Ordering::Acquire) == 0 {
            worker.stop();
        }

        tracing::debug!(pool = self.id, worker = worker.name(), "External worker joined");
        let previous = CURRENT_POOL.with(|current| current.replace(self.id));
        worker.run(|task| self.execute(task));
        CURRENT_POOL.with(|current| current.set(previous));

        self.external
            .write()
            .retain(|other| !Arc::ptr_eq(other, &worker));
        for task in worker.drain() {
            self.add(task);
        }
        tracing::debug!(pool = self.id, worker = worker.name(), "External worker left");
        Ok(())
    }

    fn stats(&self) -> PoolStats {
        let external = self.external.read();
        PoolStats {
            pool_size: self.workers.len(),
            live_tasks: self.store.read().len(),
            scheduled: self.scheduled.load(Ordering::Acquire),
            workers: self.workers.iter().map(|w| WorkerStats::of(w)).collect(),
            external_workers: external.iter().map(|w| WorkerStats::of(w)).collect(),
        }
    }
}

/// Snapshot of one worker's queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Thread name
    pub name: String,
    /// Tasks waiting in the queue
    pub queued: usize,
    /// Sum of queued and running weights
    pub weight: u64,
    /// Tasks executed so far
    pub executed: usize,
}

impl WorkerStats {
    fn of(worker: &Worker) -> Self {
        Self {
            name: worker.name().to_string(),
            queued: worker.queued(),
            weight: worker.weight(),
            executed: worker.executed(),
        }
    }
}

/// Snapshot of a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Internal worker threads
    pub pool_size: usize,
    /// Entries in the dependency store
    pub live_tasks: usize,
    /// Scheduled entries not yet completed
    pub scheduled: usize,
    pub workers: Vec<WorkerStats>,
    pub external_workers: Vec<WorkerStats>,
}

/// Thread pool executing dependency-ordered tasks
pub struct ThreadPool {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("id", &self.shared.id)
            .field("workers", &self.shared.workers)
            .field("scheduled", &self.shared.scheduled.load(Ordering::Relaxed))
            .finish()
    }
}

impl ThreadPool {
    /// Create with default configuration
    pub fn new() -> Result<Self, SchedulerError> {
        Self::with_config(PoolConfig::default())
    }

    /// Create with a specific number of worker threads
    pub fn with_pool_size(pool_size: usize) -> Result<Self, SchedulerError> {
        Self::with_config(PoolConfig::with_pool_size(pool_size))
    }

    /// Create from a configuration, spawning every worker thread
    pub fn with_config(config: PoolConfig) -> Result<Self, SchedulerError> {
        config.validate()?;

        let workers = (0..config.pool_size)
            .map(|i| Arc::new(Worker::new(format!("{}-{}", config.thread_name_prefix, i))))
            .collect();
        let shared = Arc::new(Shared {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            store: RwLock::new(TaskStore::for_pool(&config)),
            config,
            workers,
            external: RwLock::new(Vec::new()),
            scheduled: AtomicUsize::new(0),
            join_lock: Mutex::new(()),
            all_processed: Condvar::new(),
            failures: Mutex::new(Vec::new()),
            skipped: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
        });

        let mut pool = Self {
            threads: Vec::with_capacity(shared.workers.len()),
            shared,
        };
        for worker in &pool.shared.workers {
            let shared = Arc::clone(&pool.shared);
            let worker = Arc::clone(worker);
            let thread = thread::Builder::new()
                .name(worker.name().to_string())
                .spawn(move || {
                    CURRENT_POOL.with(|current| current.set(shared.id));
                    worker.run(|task| shared.execute(task));
                })?;
            pool.threads.push(thread);
        }

        tracing::info!(
            pool = pool.shared.id,
            workers = pool.threads.len(),
            capacity = pool.shared.config.task_capacity,
            "Thread pool started"
        );
        Ok(pool)
    }

    /// Lower a task tree into the store and start everything it can.
    ///
    /// The same tree may be scheduled any number of times; each call runs
    /// every callable once more.
    pub fn schedule(&self, task: &Task) -> Result<(), SchedulerError> {
        self.shared.schedule(task)
    }

    /// Register a work item that runs after every task in `parents`
    pub fn create(&self, item: WorkItem, parents: &[TaskId]) -> Result<TaskId, SchedulerError> {
        self.shared.create(item, parents)
    }

    /// Schedule previously created tasks.
    ///
    /// Every task depending on a member is scheduled with it, and every
    /// parent of the resulting set must be part of it. Completed tasks may be
    /// scheduled again once nothing depending on them is still in flight.
    pub fn schedule_ids(&self, ids: &[TaskId]) -> Result<(), SchedulerError> {
        self.shared.schedule_ids(ids)
    }

    /// Remove a created task that is not in flight
    pub fn remove(&self, id: TaskId) -> Result<(), SchedulerError> {
        self.shared.remove(id)
    }

    /// State of a created task
    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.shared.store.read().state(id)
    }

    /// Block until every scheduled task has completed.
    ///
    /// Reports and clears the failures collected since the previous call.
    pub fn join(&self) -> Result<(), SchedulerError> {
        self.shared.join()
    }

    /// Run tasks on the calling thread until the pool is idle
    pub fn employ_current_thread(&self) -> Result<(), SchedulerError> {
        self.shared.employ_current_thread()
    }

    /// Handle usable from inside tasks
    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Number of internal worker threads
    pub fn pool_size(&self) -> usize {
        self.shared.workers.len()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.wait_idle();
        {
            // Anything scheduled before this point is counted and awaited
            // below; handles see `PoolShutDown` from here on.
            let _store = self.shared.store.write();
            self.shared.closing.store(true, Ordering::Release);
        }
        self.shared.wait_idle();

        let failures = std::mem::take(&mut *self.shared.failures.lock());
        if let Some(first) = failures.first() {
            tracing::warn!(
                pool = self.shared.id,
                failed = failures.len(),
                "Dropping pool with unreported task failures; first: {first}"
            );
        }

        for worker in &self.shared.workers {
            worker.stop();
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        tracing::info!(pool = self.shared.id, "Thread pool stopped");
    }
}

/// Weak reference to a pool, for scheduling from inside tasks
#[derive(Debug, Clone)]
pub struct PoolHandle {
    shared: Weak<Shared>,
}

impl PoolHandle {
    fn shared(&self) -> Result<Arc<Shared>, SchedulerError> {
        self.shared.upgrade().ok_or(SchedulerError::PoolShutDown)
    }

    /// See [`ThreadPool::schedule`]
    pub fn schedule(&self, task: &Task) -> Result<(), SchedulerError> {
        self.shared()?.schedule(task)
    }

    /// See [`ThreadPool::create`]
    pub fn create(&self, item: WorkItem, parents: &[TaskId]) -> Result<TaskId, SchedulerError> {
        self.shared()?.create(item, parents)
    }

    /// See [`ThreadPool::schedule_ids`]
    pub fn schedule_ids(&self, ids: &[TaskId]) -> Result<(), SchedulerError> {
        self.shared()?.schedule_ids(ids)
    }

    /// See [`ThreadPool::remove`]
    pub fn remove(&self, id: TaskId) -> Result<(), SchedulerError> {
        self.shared()?.remove(id)
    }

    /// See [`ThreadPool::join`]
    pub fn join(&self) -> Result<(), SchedulerError> {
        self.shared()?.join()
    }

    pub fn is_alive(&self) -> bool {
        self.shared.strong_count() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    fn counter_task(counter: &Arc<AtomicI32>) -> Task {
        let counter = Arc::clone(counter);
        Task::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_schedule_and_join() {
        let pool = ThreadPool::with_pool_size(2).unwrap();
        let counter = Arc::new(AtomicI32::new(0));
        let task = counter_task(&counter) | counter_task(&counter) | counter_task(&counter);

        pool.schedule(&task).unwrap();
        pool.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(pool.stats().live_tasks, 0);
        assert_eq!(pool.stats().scheduled, 0);
    }

    #[test]
    fn test_join_without_work() {
        let pool = ThreadPool::with_pool_size(1).unwrap();
        pool.join().unwrap();
        pool.schedule(&Task::empty()).unwrap();
        pool.join().unwrap();
    }

    #[test]
    fn test_rejects_zero_workers() {
        assert!(matches!(
            ThreadPool::with_pool_size(0),
            Err(SchedulerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_threads_are_named() {
        let mut config = PoolConfig::with_pool_size(1);
        config.thread_name_prefix = "named".to_string();
        let pool = ThreadPool::with_config(config).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let tx = Mutex::new(tx);

        pool.schedule(&Task::new(move || {
            let name = thread::current().name().map(str::to_string);
            let _ = tx.lock().send(name);
        }))
        .unwrap();
        pool.join().unwrap();
        assert_eq!(rx.recv().unwrap().as_deref(), Some("named-0"));
    }

    #[test]
    fn test_remove_rejects_in_flight() {
        let pool = ThreadPool::with_pool_size(1).unwrap();
        let gate = Arc::new(std::sync::Barrier::new(2));
        let inside = Arc::clone(&gate);
        let id = pool
            .create(
                WorkItem::new(move || {
                    inside.wait();
                }),
                &[],
            )
            .unwrap();

        pool.schedule_ids(&[id]).unwrap();
        assert!(matches!(pool.remove(id), Err(SchedulerError::TaskInFlight(_))));
        gate.wait();
        pool.join().unwrap();

        assert_eq!(pool.state(id), Some(TaskState::Completed));
        pool.remove(id).unwrap();
        assert_eq!(pool.state(id), None);
    }

    #[test]
    fn test_closing_pool_rejects_new_work() {
        let pool = ThreadPool::with_pool_size(1).unwrap();
        let handle = pool.handle();
        let id = pool.create(WorkItem::new(|| {}), &[]).unwrap();

        pool.shared.closing.store(true, Ordering::Release);
        assert!(handle.is_alive());
        assert!(matches!(
            handle.schedule(&Task::new(|| {})),
            Err(SchedulerError::PoolShutDown)
        ));
        assert!(matches!(handle.schedule_ids(&[id]), Err(SchedulerError::PoolShutDown)));
        assert!(matches!(
            handle.create(WorkItem::new(|| {}), &[]),
            Err(SchedulerError::PoolShutDown)
        ));
        assert_eq!(pool.state(id), Some(TaskState::Unscheduled));
        assert_eq!(pool.stats().scheduled, 0);
    }

    #[test]
    fn test_handle_outlived_by_pool() {
        let handle = {
            let pool = ThreadPool::with_pool_size(1).unwrap();
            pool.handle()
        };
        assert!(!handle.is_alive());
        assert!(matches!(
            handle.schedule(&Task::new(|| {})),
            Err(SchedulerError::PoolShutDown)
        ));
    }
}
