//! Task Composition
//!
//! Tree tasks built from callables with `|` (run in parallel) and `>>`
//! (run in succession). A `Task` is only a description: nodes live in one
//! arena and point at each other by index, and scheduling lowers the tree
//! into the dependency store without touching the tree itself.

use std::fmt;
use std::ops::{BitOr, BitOrAssign, Shr, ShrAssign};
use std::sync::Arc;

use crate::store::{Job, Meta};

/// Index of a node inside a task's arena
pub(crate) type NodeIndex = usize;

/// One node of a task tree.
///
/// A node with sub-tasks is a group; a node without is a leaf. Either kind
/// may have a successor that runs after the node and everything below it.
#[derive(Debug, Clone, Default)]
pub(crate) struct Node {
    pub(crate) job: Option<Job>,
    pub(crate) meta: Meta,
    pub(crate) sub_tasks: Vec<NodeIndex>,
    pub(crate) successor: Option<NodeIndex>,
}

impl Node {
    fn group(sub_tasks: Vec<NodeIndex>) -> Self {
        Self {
            sub_tasks,
            ..Self::default()
        }
    }

    pub(crate) fn is_group(&self) -> bool {
        !self.sub_tasks.is_empty()
    }
}

/// Composable unit of work
#[derive(Clone)]
pub struct Task {
    nodes: Vec<Node>,
    root: NodeIndex,
}

impl Task {
    /// Leaf task from an infallible callable
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::from_job(Job::infallible(f))
    }

    /// Leaf task whose callable may fail.
    ///
    /// An error is reported by `join` and skips everything that depends on
    /// this task.
    pub fn fallible<F>(f: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::from_job(Job::fallible(f))
    }

    /// Task with no callable, sub-tasks or successor
    pub fn empty() -> Self {
        Self {
            nodes: vec![Node::default()],
            root: 0,
        }
    }

    fn from_job(job: Job) -> Self {
        Self {
            nodes: vec![Node {
                job: Some(job),
                ..Node::default()
            }],
            root: 0,
        }
    }

    /// Set the load-balancing weight of every callable in the tree
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.callables_mut().for_each(|meta| meta.weight = weight);
        self
    }

    /// Pin every callable in the tree to one internal worker
    pub fn with_affinity(mut self, worker: usize) -> Self {
        self.callables_mut().for_each(|meta| meta.affinity = Some(worker));
        self
    }

    /// Label every callable in the tree for logs and failure reports
    pub fn with_label(mut self, label: &str) -> Self {
        let label: Arc<str> = Arc::from(label);
        self.callables_mut()
            .for_each(|meta| meta.label = Some(Arc::clone(&label)));
        self
    }

    fn callables_mut(&mut self) -> impl Iterator<Item = &mut Meta> {
        self.nodes
            .iter_mut()
            .filter(|node| node.job.is_some())
            .map(|node| &mut node.meta)
    }

    /// Combine two tasks so that both may run concurrently.
    ///
    /// A group without a successor is spliced rather than nested, so
    /// `(a | b) | c` has three sub-tasks.
    pub fn in_parallel(self, rhs: Task) -> Task {
        if self.is_empty() {
            return rhs;
        }
        if rhs.is_empty() {
            return self;
        }

        let mut result = if self.is_splicable() {
            self
        } else {
            self.into_group()
        };
        if rhs.is_splicable() {
            let subs = result.adopt_sub_tasks(rhs);
            result.nodes[result.root].sub_tasks.extend(subs);
        } else {
            let sub = result.adopt(rhs);
            result.nodes[result.root].sub_tasks.push(sub);
        }
        result
    }

    /// Combine two tasks so that `rhs` starts only after all of `self`
    /// has completed.
    ///
    /// `rhs` becomes the successor at the end of `self`'s successor chain;
    /// a leaf at the end of the chain is first turned into a group holding
    /// its callable.
    pub fn in_succession(self, rhs: Task) -> Task {
        if self.is_empty() {
            return rhs;
        }
        if rhs.is_empty() {
            return self;
        }

        let mut result = self;
        let end = result.last_successor();
        if !result.nodes[end].is_group() {
            let leaf = Node {
                job: result.nodes[end].job.take(),
                meta: std::mem::take(&mut result.nodes[end].meta),
                ..Node::default()
            };
            let leaf = result.push(leaf);
            result.nodes[end].sub_tasks.push(leaf);
        }
        let next = result.adopt(rhs);
        result.nodes[end].successor = Some(next);
        result
    }

    /// Whether the root has sub-tasks
    pub fn is_group_task(&self) -> bool {
        self.nodes[self.root].is_group()
    }

    /// Whether the root has a successor
    pub fn has_successor(&self) -> bool {
        self.nodes[self.root].successor.is_some()
    }

    /// Number of direct sub-tasks of the root
    pub fn sub_task_count(&self) -> usize {
        self.nodes[self.root].sub_tasks.len()
    }

    /// Number of stages along the root's successor chain, root included
    pub fn stage_count(&self) -> usize {
        std::iter::successors(Some(self.root), |&i| self.nodes[i].successor).count()
    }

    /// Number of callables anywhere in the tree
    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.job.is_some()).count()
    }

    /// Whether the tree has nothing to run or compose
    pub fn is_empty(&self) -> bool {
        let root = &self.nodes[self.root];
        root.job.is_none() && !root.is_group() && root.successor.is_none()
    }

    pub(crate) fn root(&self) -> NodeIndex {
        self.root
    }

    pub(crate) fn node(&self, index: NodeIndex) -> &Node {
        &self.nodes[index]
    }

    fn is_splicable(&self) -> bool {
        self.is_group_task() && !self.has_successor()
    }

    fn last_successor(&self) -> NodeIndex {
        let mut index = self.root;
        while let Some(next) = self.nodes[index].successor {
            index = next;
        }
        index
    }

    fn push(&mut self, node: Node) -> NodeIndex {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Wrap this tree as the only sub-task of a new group root
    fn into_group(self) -> Task {
        let mut nodes = self.nodes;
        nodes.push(Node::group(vec![self.root]));
        let root = nodes.len() - 1;
        Task { nodes, root }
    }

    /// Move another tree's nodes into this arena, returning its root
    fn adopt(&mut self, other: Task) -> NodeIndex {
        let base = self.nodes.len();
        self.nodes.extend(other.nodes.into_iter().map(|mut node| {
            node.sub_tasks.iter_mut().for_each(|i| *i += base);
            if let Some(next) = node.successor.as_mut() {
                *next += base;
            }
            node
        }));
        base + other.root
    }

    /// Move every node except the root into this arena, returning the
    /// root's sub-tasks
    fn adopt_sub_tasks(&mut self, other: Task) -> Vec<NodeIndex> {
        let base = self.nodes.len();
        let root = other.root;
        let remap = |i: NodeIndex| base + if i > root { i - 1 } else { i };

        let mut subs = Vec::new();
        for (i, mut node) in other.nodes.into_iter().enumerate() {
            if i == root {
                subs = node.sub_tasks.into_iter().map(remap).collect();
                continue;
            }
            node.sub_tasks.iter_mut().for_each(|i| *i = remap(*i));
            node.successor = node.successor.map(remap);
            self.nodes.push(node);
        }
        subs
    }
}

impl Default for Task {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("group", &self.is_group_task())
            .field("sub_tasks", &self.sub_task_count())
            .field("stages", &self.stage_count())
            .field("leaves", &self.leaf_count())
            .finish()
    }
}

impl BitOr for Task {
    type Output = Task;

    fn bitor(self, rhs: Task) -> Task {
        self.in_parallel(rhs)
    }
}

impl Shr for Task {
    type Output = Task;

    fn shr(self, rhs: Task) -> Task {
        self.in_succession(rhs)
    }
}

impl BitOrAssign for Task {
    fn bitor_assign(&mut self, rhs: Task) {
        *self = std::mem::take(self).in_parallel(rhs);
    }
}

impl ShrAssign for Task {
    fn shr_assign(&mut self, rhs: Task) {
        *self = std::mem::take(self).in_succession(rhs);
    }
}
