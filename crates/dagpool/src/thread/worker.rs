//! Worker
//!
//! One ready queue plus the park/wake machinery of the thread that drains
//! it. Producers push without locking; the mutex is only taken to sleep or
//! to wake a sleeper.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering, fence};

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};

use crate::store::ReadyTask;

/// Ready queue of one internal or external worker
pub(crate) struct Worker {
    /// Tasks whose parents have all completed
    tasks: SegQueue<ReadyTask>,
    /// Sum of queued and running weights, for load balancing
    weight: AtomicU64,
    /// Tasks executed since creation
    executed: AtomicUsize,
    /// Cleared by `stop`
    running: AtomicBool,
    /// Set while the worker is about to sleep or sleeping
    about_to_wait: AtomicBool,
    waiting: Mutex<()>,
    work_to_do: Condvar,
    name: String,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("queued", &self.queued())
            .field("weight", &self.weight())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl Worker {
    /// Create new worker
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            tasks: SegQueue::new(),
            weight: AtomicU64::new(0),
            executed: AtomicUsize::new(0),
            running: AtomicBool::new(true),
            about_to_wait: AtomicBool::new(false),
            waiting: Mutex::new(()),
            work_to_do: Condvar::new(),
            name: name.into(),
        }
    }

    /// Queue a ready task, waking the worker if it is parked
    pub(crate) fn add_task(&self, task: ReadyTask) {
        self.weight.fetch_add(u64::from(task.weight), Ordering::Relaxed);
        self.tasks.push(task);

        // Pairs with the fence in `run`: either the worker sees the task
        // before sleeping, or we see `about_to_wait` and wake it.
        fence(Ordering::SeqCst);
        if self.about_to_wait.load(Ordering::SeqCst) {
            let _guard = self.waiting.lock();
            self.work_to_do.notify_one();
        }
    }

    fn release_weight(&self, task: &ReadyTask) {
        self.weight.fetch_sub(u64::from(task.weight), Ordering::Relaxed);
    }

    /// Drain the queue until `stop` is called, parking when it is empty
    pub(crate) fn run(&self, mut execute: impl FnMut(ReadyTask)) {
        tracing::debug!(worker = %self.name, "Worker started");
        while self.running.load(Ordering::Acquire) {
            if let Some(task) = self.tasks.pop() {
                self.executed.fetch_add(1, Ordering::Relaxed);
                execute(task);
                self.release_weight(&task);
                continue;
            }

            let mut guard = self.waiting.lock();
            self.about_to_wait.store(true, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            if self.tasks.is_empty() && self.running.load(Ordering::SeqCst) {
                self.work_to_do.wait(&mut guard);
            }
            self.about_to_wait.store(false, Ordering::SeqCst);
        }
        tracing::debug!(worker = %self.name, "Worker stopped");
    }

    /// Make `run` return once the current task finishes
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _guard = self.waiting.lock();
        self.work_to_do.notify_all();
    }

    /// Take every task still queued
    pub(crate) fn drain(&self) -> Vec<ReadyTask> {
        std::iter::from_fn(|| self.tasks.pop())
            .inspect(|task| self.release_weight(task))
            .collect()
    }

    pub(crate) fn queued(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn weight(&self) -> u64 {
        self.weight.load(Ordering::Relaxed)
    }

    pub(crate) fn executed(&self) -> usize {
        self.executed.load(Ordering::Relaxed)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TaskId;
    use std::sync::Arc;
    use std::thread;

    fn ready(index: u32, weight: u32) -> ReadyTask {
        ReadyTask {
            id: TaskId::new(index, 0),
            weight,
            affinity: None,
            relay: false,
        }
    }

    #[test]
    fn test_weight_tracks_queue() {
        let worker = Worker::new("w");
        worker.add_task(ready(0, 3));
        worker.add_task(ready(1, 4));

        assert_eq!(worker.queued(), 2);
        assert_eq!(worker.weight(), 7);

        let drained = worker.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id, TaskId::new(0, 0));
        assert_eq!(worker.weight(), 0);
    }

    #[test]
    fn test_run_wakes_and_stops() {
        let worker = Arc::new(Worker::new("w"));
        let (tx, rx) = std::sync::mpsc::channel();

        let runner = {
            let worker = Arc::clone(&worker);
            thread::spawn(move || worker.run(|task| tx.send(task.id).unwrap()))
        };

        for i in 0..100 {
            worker.add_task(ready(i, 1));
        }
        for i in 0..100 {
            assert_eq!(rx.recv().unwrap(), TaskId::new(i, 0));
        }

        worker.stop();
        runner.join().unwrap();
        assert_eq!(worker.executed(), 100);
    }

    #[test]
    fn test_stop_before_run_returns() {
        let worker = Worker::new("w");
        worker.stop();
        worker.run(|_| panic!("nothing queued"));
    }
}
