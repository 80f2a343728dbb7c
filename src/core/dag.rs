//! Step graph for a work group.
//!
//! A `StepGraph` is an in-memory snapshot of one work group: its steps as
//! nodes and their `blocks` edges, pointing from the blocker to the step it
//! gates. Readiness is evaluated against this snapshot, and formula
//! templates are validated with it before anything is written to the store.

use crate::core::item::{ItemStatus, WorkItem};
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// A node in the step graph.
#[derive(Debug, Clone, PartialEq)]
pub struct StepNode {
    pub id: String,
    pub title: String,
    /// `None` for blockers that live outside the group.
    pub status: Option<ItemStatus>,
}

impl StepNode {
    pub fn new(id: &str, title: &str, status: ItemStatus) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            status: Some(status),
        }
    }

    fn external(id: &str) -> Self {
        Self {
            id: id.to_string(),
            title: String::new(),
            status: None,
        }
    }

    pub fn is_member(&self) -> bool {
        self.status.is_some()
    }

    /// Tombstoned steps are superseded and count as done for gating.
    pub fn is_done(&self) -> bool {
        matches!(
            self.status,
            Some(ItemStatus::Closed) | Some(ItemStatus::Tombstone)
        )
    }
}

/// The dependency graph of one work group.
pub struct StepGraph {
    graph: DiGraph<StepNode, ()>,
    index: HashMap<String, NodeIndex>,
}

impl StepGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Build a graph from fully fetched group members.
    ///
    /// Only `blocks` edges are added. A blocker that is not a member becomes
    /// an external node with unknown status and never counts as done.
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a WorkItem>) -> Self {
        let items: Vec<&WorkItem> = items.into_iter().collect();
        let mut graph = Self::new();
        for item in &items {
            graph.add_step(StepNode::new(&item.id, &item.title, item.status));
        }
        for item in &items {
            for dep in item.blocking_deps() {
                if !graph.contains(&dep.id) {
                    graph.add_step(StepNode::external(&dep.id));
                }
                // Members and externals are both present, so this cannot fail
                // on lookup; a cycle from store data is left in place.
                let _ = graph.link(&dep.id, &item.id);
            }
        }
        graph
    }

    /// Add a step. Returns the existing index if the id is already present.
    pub fn add_step(&mut self, node: StepNode) -> NodeIndex {
        if let Some(&index) = self.index.get(&node.id) {
            return index;
        }
        let id = node.id.clone();
        let index = self.graph.add_node(node);
        self.index.insert(id, index);
        index
    }

    fn link(&mut self, blocker: &str, step: &str) -> Result<petgraph::graph::EdgeIndex> {
        let from = self.node(blocker)?;
        let to = self.node(step)?;
        Ok(self.graph.update_edge(from, to, ()))
    }

    fn node(&self, id: &str) -> Result<NodeIndex> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| Error::Validation(format!("Step {} not found in graph", id)))
    }

    /// Record that `blocker` must close before `step` can start.
    ///
    /// # Errors
    /// Returns an error if either step is missing or the edge would close a
    /// cycle; the graph is left unchanged in both cases.
    pub fn add_blocker(&mut self, blocker: &str, step: &str) -> Result<()> {
        let edge = self.link(blocker, step)?;
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::Validation(format!(
                "Step {} blocking {} would create a cycle",
                blocker, step
            )));
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&StepNode> {
        self.index.get(id).and_then(|&i| self.graph.node_weight(i))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn step_count(&self) -> usize {
        self.members().count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.step_count() == 0
    }

    pub fn members(&self) -> impl Iterator<Item = &StepNode> {
        self.graph.node_weights().filter(|n| n.is_member())
    }

    /// Steps that gate `id`.
    pub fn blockers(&self, id: &str) -> Vec<&StepNode> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Steps gated by `id`.
    pub fn dependents(&self, id: &str) -> Vec<&StepNode> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &str, dir: Direction) -> Vec<&StepNode> {
        match self.index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, dir)
                .filter_map(|n| self.graph.node_weight(n))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Ids of members that are done.
    pub fn closed_set(&self) -> HashSet<&str> {
        self.members()
            .filter(|n| n.is_done())
            .map(|n| n.id.as_str())
            .collect()
    }

    /// True when the group has no members or every member is done.
    pub fn all_complete(&self) -> bool {
        self.members().all(StepNode::is_done)
    }

    /// Open members whose blockers are all done, in insertion order.
    pub fn ready_steps(&self) -> Vec<&StepNode> {
        let closed = self.closed_set();
        self.graph
            .node_indices()
            .filter_map(|index| {
                let node = self.graph.node_weight(index)?;
                if node.status != Some(ItemStatus::Open) {
                    return None;
                }
                let unblocked = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .filter_map(|b| self.graph.node_weight(b))
                    .all(|b| closed.contains(b.id.as_str()));
                unblocked.then_some(node)
            })
            .collect()
    }

    /// Members in dependency order.
    ///
    /// # Errors
    /// Returns an error if the graph contains a cycle.
    pub fn topological_order(&self) -> Result<Vec<&StepNode>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = self
                .graph
                .node_weight(cycle.node_id())
                .map(|n| n.id.as_str())
                .unwrap_or("unknown");
            Error::Validation(format!("Cycle detected at step: {}", id))
        })?;
        Ok(sorted
            .into_iter()
            .filter_map(|i| self.graph.node_weight(i))
            .filter(|n| n.is_member())
            .collect())
    }
}

impl Default for StepGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StepGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepGraph")
            .field("steps", &self.step_count())
            .field("edges", &self.edge_count())
            .finish()
    }
}
