//! Dependency Store
//!
//! Flat, index-addressed table of task metadata and parent/child links.
//! Ids are generational handles recycled through a free list, so a removed
//! id never resolves to the task that later reuses its slot.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crate::config::PoolConfig;
use crate::error::{SchedulerError, TaskFailure};

/// Weight given to tasks that do not set one
pub const DEFAULT_WEIGHT: u32 = 1;

/// Generational task handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    index: u32,
    generation: u32,
}

impl TaskId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index inside the store
    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// Number of times the slot was recycled before this id was issued
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

/// Who removes an entry from the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Created through `create`; the caller removes it
    OwnedByCaller,
    /// Lowered from a `Task`; removed as soon as it completes
    OwnedByPool,
}

/// Lifecycle of a store entry within one scheduling round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Created, never scheduled
    Unscheduled = 0,
    /// Scheduled, waiting on parents
    Pending = 1,
    /// Queued on a worker
    Ready = 2,
    /// Callable executing
    Running = 3,
    /// Finished this round
    Completed = 4,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Pending,
            2 => Self::Ready,
            3 => Self::Running,
            4 => Self::Completed,
            _ => Self::Unscheduled,
        }
    }

    /// Pending, ready or running
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Pending | Self::Ready | Self::Running)
    }
}

/// Shared zero-argument callable
#[derive(Clone)]
pub(crate) struct Job(Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync + 'static>);

impl Job {
    pub(crate) fn infallible<F>(f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self(Arc::new(move || {
            f();
            Ok(())
        }))
    }

    pub(crate) fn fallible<F>(f: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub(crate) fn call(&self) -> anyhow::Result<()> {
        (self.0)()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Job")
    }
}

/// Scheduling metadata shared by tree nodes and store entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Meta {
    pub(crate) label: Option<Arc<str>>,
    pub(crate) affinity: Option<usize>,
    pub(crate) weight: u32,
}

impl Meta {
    /// Metadata for callable-less entries inserted by lowering
    pub(crate) fn relay() -> Self {
        Self {
            label: None,
            affinity: None,
            weight: 0,
        }
    }
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            label: None,
            affinity: None,
            weight: DEFAULT_WEIGHT,
        }
    }
}

/// A callable plus scheduling hints, registered with `TaskStore::create`
#[derive(Debug, Clone)]
pub struct WorkItem {
    job: Job,
    meta: Meta,
}

impl WorkItem {
    /// Work item from an infallible callable
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            job: Job::infallible(f),
            meta: Meta::default(),
        }
    }

    /// Work item whose callable may report an error
    pub fn fallible<F>(f: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            job: Job::fallible(f),
            meta: Meta::default(),
        }
    }

    /// Scheduling cost used for load balancing
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.meta.weight = weight;
        self
    }

    /// Pin to one internal worker
    pub fn with_affinity(mut self, worker: usize) -> Self {
        self.meta.affinity = Some(worker);
        self
    }

    /// Name reported in logs and failures
    pub fn with_label(mut self, label: &str) -> Self {
        self.meta.label = Some(Arc::from(label));
        self
    }
}

/// A task handed to a worker queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadyTask {
    pub(crate) id: TaskId,
    pub(crate) weight: u32,
    pub(crate) affinity: Option<usize>,
    /// No callable; resolved inline by whoever readied it
    pub(crate) relay: bool,
}

/// Result of arming a batch
#[derive(Debug, Default)]
pub(crate) struct Armed {
    /// Entries now pending or ready
    pub(crate) count: usize,
    /// Entries with no parents, ready to queue
    pub(crate) ready: Vec<ReadyTask>,
}

/// What a worker needs to execute an entry
#[derive(Debug)]
pub(crate) struct Started {
    pub(crate) job: Option<Job>,
    pub(crate) label: Option<Arc<str>>,
    pub(crate) poisoned: bool,
}

/// Outcome of finishing an entry
#[derive(Debug, Default)]
pub(crate) struct Completion {
    /// Children whose last parent just finished
    pub(crate) ready: Vec<ReadyTask>,
    /// The entry should be removed now
    pub(crate) pool_owned: bool,
}

#[derive(Debug)]
struct Entry {
    job: Option<Job>,
    meta: Meta,
    ownership: Ownership,
    parents: Vec<TaskId>,
    children: Vec<TaskId>,
    state: AtomicU8,
    remaining: AtomicUsize,
    poisoned: AtomicBool,
}

impl Entry {
    fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Reset counters for a new round and report whether it can run now
    fn arm(&self) -> bool {
        self.remaining.store(self.parents.len(), Ordering::Release);
        self.poisoned.store(false, Ordering::Release);
        let ready = self.parents.is_empty();
        self.set_state(if ready { TaskState::Ready } else { TaskState::Pending });
        ready
    }

    fn ready(&self, id: TaskId) -> ReadyTask {
        ReadyTask {
            id,
            weight: self.meta.weight,
            affinity: self.meta.affinity,
            relay: self.job.is_none(),
        }
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Dependency store
#[derive(Debug)]
pub struct TaskStore {
    slots: Vec<Slot>,
    /// Recycled slot indices, stack discipline
    ids: Vec<u32>,
    live: usize,
    capacity: usize,
    max_parents: usize,
    max_children: usize,
    /// Internal worker count, for affinity checks
    workers: Option<usize>,
}

impl TaskStore {
    /// Create a store holding at most `capacity` live tasks
    pub fn new(capacity: usize) -> Self {
        let defaults = PoolConfig::default();
        Self::with_limits(
            capacity,
            defaults.max_parents_per_task,
            defaults.max_children_per_task,
        )
    }

    /// Create with explicit per-task link limits
    pub fn with_limits(capacity: usize, max_parents: usize, max_children: usize) -> Self {
        Self {
            slots: Vec::new(),
            ids: Vec::new(),
            live: 0,
            capacity,
            max_parents,
            max_children,
            workers: None,
        }
    }

    pub(crate) fn for_pool(config: &PoolConfig) -> Self {
        let mut store = Self::with_limits(
            config.task_capacity,
            config.max_parents_per_task,
            config.max_children_per_task,
        );
        store.workers = Some(config.pool_size);
        store
    }

    /// Register a work item that runs after every task in `parents`
    pub fn create(&mut self, item: WorkItem, parents: &[TaskId]) -> Result<TaskId, SchedulerError> {
        self.insert(Some(item.job), item.meta, Ownership::OwnedByCaller, parents)
    }

    pub(crate) fn insert(
        &mut self,
        job: Option<Job>,
        meta: Meta,
        ownership: Ownership,
        parents: &[TaskId],
    ) -> Result<TaskId, SchedulerError> {
        if self.live >= self.capacity {
            return Err(SchedulerError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        if parents.len() > self.max_parents {
            return Err(SchedulerError::TooManyParents {
                count: parents.len(),
                limit: self.max_parents,
            });
        }
        if let (Some(affinity), Some(pool_size)) = (meta.affinity, self.workers) {
            if affinity >= pool_size {
                return Err(SchedulerError::InvalidAffinity { affinity, pool_size });
            }
        }
        for (i, &parent) in parents.iter().enumerate() {
            let entry = self.entry(parent)?;
            if entry.ownership != ownership {
                return Err(SchedulerError::UnknownTask(parent));
            }
            if parents[..i].contains(&parent) {
                return Err(SchedulerError::DuplicateParent { parent });
            }
            if entry.children.len() >= self.max_children {
                return Err(SchedulerError::TooManyChildren {
                    parent,
                    limit: self.max_children,
                });
            }
        }

        let index = match self.ids.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let id = TaskId::new(index, slot.generation);
        slot.entry = Some(Entry {
            job,
            meta,
            ownership,
            parents: parents.to_vec(),
            children: Vec::new(),
            state: AtomicU8::new(TaskState::Unscheduled as u8),
            remaining: AtomicUsize::new(parents.len()),
            poisoned: AtomicBool::new(false),
        });
        self.live += 1;

        for &parent in parents {
            if let Some(entry) = self.entry_mut(parent) {
                entry.children.push(id);
            }
        }
        Ok(id)
    }

    /// Add an edge between two unscheduled entries
    pub(crate) fn link(&mut self, parent: TaskId, child: TaskId) -> Result<(), SchedulerError> {
        let max_children = self.max_children;
        let max_parents = self.max_parents;

        let child_entry = self.entry(child)?;
        if child_entry.parents.len() >= max_parents {
            return Err(SchedulerError::TooManyParents {
                count: child_entry.parents.len() + 1,
                limit: max_parents,
            });
        }
        if self.entry(parent)?.children.len() >= max_children {
            return Err(SchedulerError::TooManyChildren {
                parent,
                limit: max_children,
            });
        }

        if let Some(entry) = self.entry_mut(parent) {
            entry.children.push(child);
        }
        if let Some(entry) = self.entry_mut(child) {
            entry.parents.push(parent);
            entry.remaining.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Return a task's id to the free list
    pub fn remove(&mut self, id: TaskId) -> Result<(), SchedulerError> {
        let state = self.entry(id)?.state();
        if state.is_in_flight() {
            return Err(SchedulerError::TaskInFlight(id));
        }

        let slot = &mut self.slots[id.index()];
        let Some(entry) = slot.entry.take() else {
            return Err(SchedulerError::UnknownTask(id));
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.ids.push(id.index);
        self.live -= 1;

        for parent in entry.parents {
            if let Some(parent) = self.entry_mut(parent) {
                parent.children.retain(|&child| child != id);
            }
        }
        for child in entry.children {
            if let Some(child) = self.entry_mut(child) {
                child.parents.retain(|&parent| parent != id);
            }
        }
        Ok(())
    }

    /// Invoke a task's callable.
    ///
    /// Performs no dependency checks; the caller must already know that
    /// every parent has completed.
    pub fn run(&self, id: TaskId) -> Result<(), SchedulerError> {
        let entry = self.entry(id)?;
        match &entry.job {
            Some(job) => job.call().map_err(|error| {
                SchedulerError::TaskFailed(TaskFailure::new(
                    id,
                    entry.meta.label.clone(),
                    format!("{error:#}"),
                ))
            }),
            None => Ok(()),
        }
    }

    /// Check whether an id still names a live task
    pub fn contains(&self, id: TaskId) -> bool {
        self.get(id).is_some()
    }

    /// Lifecycle state of a live task
    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.get(id).map(Entry::state)
    }

    /// Parents recorded at creation
    pub fn parents(&self, id: TaskId) -> Option<&[TaskId]> {
        self.get(id).map(|entry| entry.parents.as_slice())
    }

    /// Tasks that list `id` as a parent
    pub fn children(&self, id: TaskId) -> Option<&[TaskId]> {
        self.get(id).map(|entry| entry.children.as_slice())
    }

    /// Who removes the task
    pub fn ownership(&self, id: TaskId) -> Option<Ownership> {
        self.get(id).map(|entry| entry.ownership)
    }

    /// Number of live tasks
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Maximum number of live tasks
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn max_parents(&self) -> usize {
        self.max_parents
    }

    pub(crate) fn max_children(&self) -> usize {
        self.max_children
    }

    /// Validate a caller batch and reset its counters for a new round.
    ///
    /// The round covers the batch plus every task transitively depending on
    /// it, so no dependent is left behind. Every parent of a round member
    /// must itself be a member, and no member may still be in flight from an
    /// earlier round. Repeated ids count once.
    pub(crate) fn arm(&mut self, batch: &[TaskId]) -> Result<Armed, SchedulerError> {
        let mut members: Vec<TaskId> = Vec::with_capacity(batch.len());
        let mut position: HashMap<TaskId, usize> = HashMap::with_capacity(batch.len());
        for &id in batch {
            if !position.contains_key(&id) {
                position.insert(id, members.len());
                members.push(id);
            }
        }
        let mut next = 0;
        while next < members.len() {
            let id = members[next];
            next += 1;
            let entry = self.entry(id)?;
            if entry.ownership != Ownership::OwnedByCaller {
                return Err(SchedulerError::UnknownTask(id));
            }
            if entry.state().is_in_flight() {
                return Err(SchedulerError::AlreadyScheduled(id));
            }
            for &child in &entry.children {
                if !position.contains_key(&child) {
                    position.insert(child, members.len());
                    members.push(child);
                }
            }
        }

        // Kahn's algorithm over the round; anything left over sits on a cycle.
        let mut indegree = vec![0_usize; members.len()];
        for (i, &id) in members.iter().enumerate() {
            let entry = self.entry(id)?;
            for &parent in &entry.parents {
                if !position.contains_key(&parent) {
                    return Err(SchedulerError::UnscheduledParent { task: id, parent });
                }
            }
            indegree[i] = entry.parents.len();
        }
        let mut queue: VecDeque<usize> = (0..members.len()).filter(|&i| indegree[i] == 0).collect();
        let mut visited = 0;
        while let Some(i) = queue.pop_front() {
            visited += 1;
            for child in &self.entry(members[i])?.children {
                if let Some(&j) = position.get(child) {
                    indegree[j] -= 1;
                    if indegree[j] == 0 {
                        queue.push_back(j);
                    }
                }
            }
        }
        if visited < members.len() {
            let stuck = (0..members.len()).find(|&i| indegree[i] > 0).unwrap_or(0);
            return Err(SchedulerError::Cycle(members[stuck]));
        }

        Ok(self.arm_unchecked(&members))
    }

    /// Reset counters for entries that are closed and acyclic by construction
    pub(crate) fn arm_unchecked(&self, batch: &[TaskId]) -> Armed {
        let mut armed = Armed::default();
        for &id in batch {
            let Some(entry) = self.get(id) else {
                continue;
            };
            armed.count += 1;
            if entry.arm() {
                armed.ready.push(entry.ready(id));
            }
        }
        armed
    }

    /// Mark an entry running and hand out its callable
    pub(crate) fn start(&self, id: TaskId) -> Option<Started> {
        let entry = self.get(id)?;
        entry.set_state(TaskState::Running);
        Some(Started {
            job: entry.job.clone(),
            label: entry.meta.label.clone(),
            poisoned: entry.poisoned.load(Ordering::Acquire),
        })
    }

    /// Finish an entry and collect the children it unblocked.
    ///
    /// A failed or poisoned entry poisons its children so they are skipped.
    pub(crate) fn complete(&self, id: TaskId, failed: bool) -> Completion {
        let Some(entry) = self.get(id) else {
            return Completion::default();
        };
        let poisoned = failed || entry.poisoned.load(Ordering::Acquire);

        let mut ready = Vec::new();
        for &child in &entry.children {
            let Some(child_entry) = self.get(child) else {
                continue;
            };
            if child_entry.state() != TaskState::Pending {
                continue;
            }
            if poisoned {
                child_entry.poisoned.store(true, Ordering::Release);
            }
            if child_entry.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                child_entry.set_state(TaskState::Ready);
                ready.push(child_entry.ready(child));
            }
        }
        entry.set_state(TaskState::Completed);

        Completion {
            ready,
            pool_owned: entry.ownership == Ownership::OwnedByPool,
        }
    }

    fn get(&self, id: TaskId) -> Option<&Entry> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    fn entry(&self, id: TaskId) -> Result<&Entry, SchedulerError> {
        self.get(id).ok_or(SchedulerError::UnknownTask(id))
    }

    fn entry_mut(&mut self, id: TaskId) -> Option<&mut Entry> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    fn noop() -> WorkItem {
        WorkItem::new(|| {})
    }

    #[test]
    fn test_create_links_parents_and_children() {
        let mut store = TaskStore::new(16);
        let a = store.create(noop(), &[]).unwrap();
        let b = store.create(noop(), &[]).unwrap();
        let c = store.create(noop(), &[a, b]).unwrap();

        assert_eq!(store.parents(c), Some(&[a, b][..]));
        assert_eq!(store.children(a), Some(&[c][..]));
        assert_eq!(store.children(b), Some(&[c][..]));
        assert_eq!(store.state(c), Some(TaskState::Unscheduled));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_ids_are_recycled_with_new_generation() {
        let mut store = TaskStore::new(4);
        let a = store.create(noop(), &[]).unwrap();
        store.remove(a).unwrap();

        let b = store.create(noop(), &[]).unwrap();
        assert_eq!(a.index(), b.index());
        assert_ne!(a.generation(), b.generation());
        assert!(!store.contains(a));
        assert!(matches!(store.remove(a), Err(SchedulerError::UnknownTask(_))));
        assert!(matches!(store.create(noop(), &[a]), Err(SchedulerError::UnknownTask(_))));
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut store = TaskStore::new(2);
        store.create(noop(), &[]).unwrap();
        store.create(noop(), &[]).unwrap();

        assert!(matches!(
            store.create(noop(), &[]),
            Err(SchedulerError::CapacityExceeded { capacity: 2 })
        ));
    }

    #[test]
    fn test_link_limits() {
        let mut store = TaskStore::with_limits(16, 2, 2);
        let a = store.create(noop(), &[]).unwrap();
        let b = store.create(noop(), &[]).unwrap();
        let c = store.create(noop(), &[]).unwrap();

        assert!(matches!(
            store.create(noop(), &[a, b, c]),
            Err(SchedulerError::TooManyParents { count: 3, limit: 2 })
        ));
        assert!(matches!(
            store.create(noop(), &[a, a]),
            Err(SchedulerError::DuplicateParent { .. })
        ));

        store.create(noop(), &[a]).unwrap();
        store.create(noop(), &[a]).unwrap();
        assert!(matches!(
            store.create(noop(), &[a]),
            Err(SchedulerError::TooManyChildren { limit: 2, .. })
        ));
    }

    #[test]
    fn test_remove_detaches_links() {
        let mut store = TaskStore::new(8);
        let a = store.create(noop(), &[]).unwrap();
        let b = store.create(noop(), &[a]).unwrap();

        store.remove(b).unwrap();
        assert_eq!(store.children(a), Some(&[][..]));

        let c = store.create(noop(), &[a]).unwrap();
        store.remove(a).unwrap();
        assert_eq!(store.parents(c), Some(&[][..]));
    }

    #[test]
    fn test_run_invokes_callable() {
        let counter = Arc::new(AtomicI32::new(0));
        let mut store = TaskStore::new(4);
        let seen = Arc::clone(&counter);
        let id = store
            .create(
                WorkItem::new(move || {
                    seen.fetch_add(2, Ordering::SeqCst);
                }),
                &[],
            )
            .unwrap();

        store.run(id).unwrap();
        store.run(id).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_run_reports_failure() {
        let mut store = TaskStore::new(4);
        let id = store
            .create(
                WorkItem::fallible(|| anyhow::bail!("no data")).with_label("load"),
                &[],
            )
            .unwrap();

        match store.run(id) {
            Err(SchedulerError::TaskFailed(failure)) => {
                assert_eq!(failure.task, id);
                assert_eq!(failure.reason, "no data");
                assert_eq!(failure.label.as_deref(), Some("load"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_arm_rejects_missing_parent() {
        let mut store = TaskStore::new(8);
        let a = store.create(noop(), &[]).unwrap();
        let b = store.create(noop(), &[a]).unwrap();

        assert!(matches!(
            store.arm(&[b]),
            Err(SchedulerError::UnscheduledParent { task, parent }) if task == b && parent == a
        ));
    }

    #[test]
    fn test_arm_pulls_in_dependents() {
        let mut store = TaskStore::new(8);
        let root = store.create(noop(), &[]).unwrap();
        let left = store.create(noop(), &[root]).unwrap();
        let right = store.create(noop(), &[root]).unwrap();
        let last = store.create(noop(), &[left, right]).unwrap();

        let armed = store.arm(&[root]).unwrap();
        assert_eq!(armed.count, 4);
        assert_eq!(armed.ready.len(), 1);
        assert_eq!(armed.ready[0].id, root);
        for id in [left, right, last] {
            assert_eq!(store.state(id), Some(TaskState::Pending));
        }
    }

    #[test]
    fn test_arm_rejects_dependent_with_outside_parent() {
        let mut store = TaskStore::new(8);
        let a = store.create(noop(), &[]).unwrap();
        let b = store.create(noop(), &[]).unwrap();
        let c = store.create(noop(), &[a, b]).unwrap();

        assert!(matches!(
            store.arm(&[a]),
            Err(SchedulerError::UnscheduledParent { task, parent }) if task == c && parent == b
        ));
        assert_eq!(store.state(a), Some(TaskState::Unscheduled));
        assert_eq!(store.state(c), Some(TaskState::Unscheduled));
    }

    #[test]
    fn test_rearm_with_pending_dependent_rejected() {
        let mut store = TaskStore::new(8);
        let a = store.create(noop(), &[]).unwrap();
        let b = store.create(noop(), &[]).unwrap();
        let c = store.create(noop(), &[a, b]).unwrap();

        store.arm(&[a, b, c]).unwrap();
        store.start(a).unwrap();
        assert!(store.complete(a, false).ready.is_empty());
        store.start(b).unwrap();

        // `a` is done but its dependent is still waiting on `b`.
        assert!(matches!(
            store.arm(&[a]),
            Err(SchedulerError::AlreadyScheduled(id)) if id == c
        ));
        assert_eq!(store.state(a), Some(TaskState::Completed));

        let completion = store.complete(b, false);
        assert_eq!(completion.ready.len(), 1);
        assert_eq!(completion.ready[0].id, c);
    }

    #[test]
    fn test_create_rejects_pool_owned_parent() {
        let mut store = TaskStore::new(8);
        let owned = store
            .insert(None, Meta::default(), Ownership::OwnedByPool, &[])
            .unwrap();

        assert!(matches!(
            store.create(noop(), &[owned]),
            Err(SchedulerError::UnknownTask(id)) if id == owned
        ));
        assert!(store.children(owned).is_some_and(|children| children.is_empty()));
    }

    #[test]
    fn test_arm_detects_cycle() {
        let mut store = TaskStore::new(8);
        let a = store.create(noop(), &[]).unwrap();
        let b = store.create(noop(), &[a]).unwrap();
        store.link(b, a).unwrap();

        assert!(matches!(store.arm(&[a, b]), Err(SchedulerError::Cycle(_))));
    }

    #[test]
    fn test_round_trip_through_states() {
        let mut store = TaskStore::new(8);
        let a = store.create(noop(), &[]).unwrap();
        let b = store.create(noop(), &[a]).unwrap();

        let armed = store.arm(&[a, b, a]).unwrap();
        assert_eq!(armed.count, 2);
        assert_eq!(armed.ready.len(), 1);
        assert_eq!(armed.ready[0].id, a);
        assert_eq!(store.state(b), Some(TaskState::Pending));
        assert!(matches!(store.arm(&[a, b]), Err(SchedulerError::AlreadyScheduled(_))));
        assert!(matches!(store.remove(a), Err(SchedulerError::TaskInFlight(_))));

        store.start(a).unwrap();
        let completion = store.complete(a, false);
        assert_eq!(completion.ready.len(), 1);
        assert_eq!(completion.ready[0].id, b);
        assert!(!completion.pool_owned);

        store.start(b).unwrap();
        assert!(store.complete(b, false).ready.is_empty());
        assert_eq!(store.state(b), Some(TaskState::Completed));

        // Completed tasks can be armed again.
        assert_eq!(store.arm(&[a, b]).unwrap().ready.len(), 1);
    }

    #[test]
    fn test_failure_poisons_children() {
        let mut store = TaskStore::new(8);
        let a = store.create(noop(), &[]).unwrap();
        let b = store.create(noop(), &[a]).unwrap();
        store.arm(&[a, b]).unwrap();

        store.start(a).unwrap();
        store.complete(a, true);
        assert!(store.start(b).unwrap().poisoned);
    }

    #[test]
    fn test_affinity_checked_against_pool() {
        let mut store = TaskStore::for_pool(&PoolConfig::with_pool_size(2));

        assert!(store.create(noop().with_affinity(1), &[]).is_ok());
        assert!(matches!(
            store.create(noop().with_affinity(2), &[]),
            Err(SchedulerError::InvalidAffinity { affinity: 2, pool_size: 2 })
        ));
    }
}
