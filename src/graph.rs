//! In-memory index of tasks by fingerprint.
//!
//! Nodes live in a petgraph graph; an edge `child → parent` means the parent
//! waits on the child. The graph is populated monotonically over a session's
//! lifetime and discarded at session exit; durable state lives in the cache.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::graph::NodeIndex;
use petgraph::{Direction, Graph};

use crate::future::State;
use crate::hash::Hash;
use crate::task::Task;
use crate::value::Value;

/// Lightweight handle to a task future, usable as a dependency or a demand.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Fut {
    pub(crate) index: NodeIndex,
    pub(crate) hash: Hash,
}

impl Fut {
    pub fn fingerprint(&self) -> Hash {
        self.hash
    }
}

impl From<Fut> for Value {
    fn from(fut: Fut) -> Self {
        Value::Ref(fut.hash)
    }
}

impl std::fmt::Debug for Fut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fut(@{})", self.hash.tag())
    }
}

/// Why a parent waits on a child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Dep {
    /// The child is embedded in the parent's input composite.
    Input,
    /// The child is embedded in the value the parent's body returned.
    Result,
}

pub(crate) struct TaskGraph {
    nodes: Graph<Task, Dep>,
    index: HashMap<Hash, NodeIndex>,
    ready: VecDeque<NodeIndex>,
    running: HashSet<NodeIndex>,
}

impl TaskGraph {
    pub fn new() -> Self {
        TaskGraph {
            nodes: Graph::new(),
            index: HashMap::new(),
            ready: VecDeque::new(),
            running: HashSet::new(),
        }
    }

    pub fn get(&self, hash: &Hash) -> Option<NodeIndex> {
        self.index.get(hash).copied()
    }

    /// Return the existing node for the fingerprint, or insert a fresh task.
    /// The inserted node starts Pending with no children wired.
    pub fn get_or_insert(
        &mut self,
        hash: Hash,
        factory: impl FnOnce() -> Task,
    ) -> (NodeIndex, bool) {
        if let Some(&index) = self.index.get(&hash) {
            return (index, false);
        }
        let index = self.nodes.add_node(factory());
        self.index.insert(hash, index);
        (index, true)
    }

    pub fn task(&self, index: NodeIndex) -> &Task {
        &self.nodes[index]
    }

    pub fn task_mut(&mut self, index: NodeIndex) -> &mut Task {
        &mut self.nodes[index]
    }

    /// Register a dependency edge. Idempotent; a child that is already done
    /// leaves no edge and no pending count behind.
    pub fn add_dependency(&mut self, parent: NodeIndex, child: NodeIndex, kind: Dep) {
        if self.nodes[child].future.is_done() {
            return;
        }
        if self.nodes.find_edge(child, parent).is_some() {
            return;
        }
        self.nodes.add_edge(child, parent, kind);
        self.nodes[parent].future.add_pending_child();
    }

    /// Move a Pending node with no unresolved children into the ready queue.
    /// Returns true when the node transitioned.
    pub fn settle(&mut self, index: NodeIndex) -> bool {
        let task = &mut self.nodes[index];
        if task.future.state() == State::Pending && task.future.unresolved() == 0 {
            task.future.mark_ready();
            self.ready.push_back(index);
            return true;
        }
        false
    }

    /// Pop the next ready task, FIFO for determinism of observable events.
    pub fn pop_ready(&mut self) -> Option<NodeIndex> {
        while let Some(index) = self.ready.pop_front() {
            let task = &self.nodes[index];
            if task.future.state() == State::Ready
                && !task.has_run
                && !self.running.contains(&index)
            {
                return Some(index);
            }
        }
        None
    }

    pub fn requeue(&mut self, index: NodeIndex) {
        self.ready.push_back(index);
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn mark_running(&mut self, index: NodeIndex) {
        self.running.insert(index);
    }

    pub fn mark_done(&mut self, index: NodeIndex) {
        self.running.remove(&index);
    }

    pub fn parents(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.nodes.neighbors_directed(index, Direction::Outgoing).collect()
    }

    pub fn children(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.nodes.neighbors_directed(index, Direction::Incoming).collect()
    }

    pub fn node_indices(&self) -> Vec<NodeIndex> {
        self.nodes.node_indices().collect()
    }

    pub fn task_count(&self) -> usize {
        self.nodes.node_count()
    }

    /// Tasks not yet in a terminal state.
    pub fn pending_count(&self) -> usize {
        self.nodes
            .node_indices()
            .filter(|&ix| !self.nodes[ix].future.state().is_terminal())
            .count()
    }

    /// Resolve an embedded reference against a completed task's result.
    pub fn resolve_ref(&self, hash: &Hash) -> Option<Value> {
        let index = self.get(hash)?;
        self.nodes[index].future.result().cloned()
    }
}
