//! Tree Lowering
//!
//! Turns a `Task` tree into pool-owned store entries. Every callable becomes
//! one entry; successor edges become parent links from the exits of one
//! stage to the entries of the next. When a stage boundary would exceed the
//! per-task link limits, callable-less relay entries are inserted as a
//! fan-in or fan-out tree so that every entry stays within bounds.

use crate::error::SchedulerError;
use crate::store::{Job, Meta, Ownership, TaskId, TaskStore};
use crate::task::{NodeIndex, Task};

/// Entries with no parents inside a lowered subtree, and entries with no
/// children inside it.
#[derive(Debug, Default)]
struct Frontier {
    entries: Vec<TaskId>,
    exits: Vec<TaskId>,
}

struct Lowering<'a> {
    store: &'a mut TaskStore,
    created: Vec<TaskId>,
}

/// Lower a task into the store.
///
/// All or nothing: on error every entry created so far is removed again.
/// Returns the created ids; they are acyclic and closed under parents.
pub(crate) fn lower(store: &mut TaskStore, task: &Task) -> Result<Vec<TaskId>, SchedulerError> {
    let mut lowering = Lowering {
        store,
        created: Vec::new(),
    };
    match lowering.chain(task, task.root()) {
        Ok(_) => Ok(lowering.created),
        Err(error) => {
            lowering.rollback();
            Err(error)
        }
    }
}

impl Lowering<'_> {
    /// Lower a node and its successor chain
    fn chain(&mut self, task: &Task, start: NodeIndex) -> Result<Frontier, SchedulerError> {
        let mut frontier = self.stage(task, start)?;
        let mut index = start;
        while let Some(next) = task.node(index).successor {
            let stage = self.stage(task, next)?;
            if frontier.exits.is_empty() {
                // Nothing ran before this stage.
                frontier.entries.extend(stage.entries);
                frontier.exits = stage.exits;
            } else if !stage.entries.is_empty() {
                self.connect(&frontier.exits, &stage.entries)?;
                frontier.exits = stage.exits;
            }
            index = next;
        }
        Ok(frontier)
    }

    /// Lower a node without its successor
    fn stage(&mut self, task: &Task, index: NodeIndex) -> Result<Frontier, SchedulerError> {
        let node = task.node(index);
        if node.is_group() {
            let mut frontier = Frontier::default();
            for &sub in &node.sub_tasks {
                let lowered = self.chain(task, sub)?;
                frontier.entries.extend(lowered.entries);
                frontier.exits.extend(lowered.exits);
            }
            return Ok(frontier);
        }

        match &node.job {
            Some(job) => {
                let id = self.insert(Some(job.clone()), node.meta.clone(), &[])?;
                Ok(Frontier {
                    entries: vec![id],
                    exits: vec![id],
                })
            }
            None => Ok(Frontier::default()),
        }
    }

    /// Make every `entries` task wait for every `exits` task
    fn connect(&mut self, exits: &[TaskId], entries: &[TaskId]) -> Result<(), SchedulerError> {
        if let [entry] = entries {
            if exits.len() <= self.store.max_parents() {
                for &exit in exits {
                    self.store.link(exit, *entry)?;
                }
                return Ok(());
            }
        }
        let source = self.fan_in(exits.to_vec())?;
        self.fan_out(source, entries)
    }

    /// Reduce `exits` to a single entry that completes after all of them
    fn fan_in(&mut self, mut exits: Vec<TaskId>) -> Result<TaskId, SchedulerError> {
        debug_assert!(!exits.is_empty());
        let limit = self.store.max_parents();
        while exits.len() > 1 {
            exits = exits
                .chunks(limit)
                .map(|chunk| match chunk {
                    [single] => Ok(*single),
                    parents => self.relay(parents),
                })
                .collect::<Result<_, _>>()?;
        }
        Ok(exits[0])
    }

    /// Link `source` to every target, through relays when there are more
    /// targets than one entry may have children
    fn fan_out(&mut self, source: TaskId, targets: &[TaskId]) -> Result<(), SchedulerError> {
        let limit = self.store.max_children();
        if targets.len() <= limit {
            for &target in targets {
                self.store.link(source, target)?;
            }
            return Ok(());
        }

        let chunk = targets.len().div_ceil(limit);
        for part in targets.chunks(chunk) {
            let relay = self.relay(&[source])?;
            self.fan_out(relay, part)?;
        }
        Ok(())
    }

    fn relay(&mut self, parents: &[TaskId]) -> Result<TaskId, SchedulerError> {
        self.insert(None, Meta::relay(), parents)
    }

    fn insert(
        &mut self,
        job: Option<Job>,
        meta: Meta,
        parents: &[TaskId],
    ) -> Result<TaskId, SchedulerError> {
        let id = self.store.insert(job, meta, Ownership::OwnedByPool, parents)?;
        self.created.push(id);
        Ok(id)
    }

    fn rollback(&mut self) {
        for &id in self.created.iter().rev() {
            let removed = self.store.remove(id);
            debug_assert!(removed.is_ok(), "rollback of {id} failed");
        }
        self.created.clear();
    }
}
