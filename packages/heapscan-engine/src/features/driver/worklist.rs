//! Intraprocedural worklist
//!
//! A priority set of CFG nodes plus the differential todo/visited path-set
//! maps. Default priority: fewer visits first, then shorter distance to
//! exit, then higher node id; alternative modes order purely by id or by
//! distance.

use super::path::PathSet;
use crate::config::WorklistMode;
use crate::shared::models::NodeId;
use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Debug, Clone, PartialEq, Eq)]
struct WorkUnit {
    node: NodeId,
    visit_count: u32,
    dist_to_exit: u32,
    mode: WorklistMode,
}

impl Ord for WorkUnit {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the maximum, so "better" compares greater.
        match self.mode {
            WorklistMode::VisitCount => other
                .visit_count
                .cmp(&self.visit_count)
                .then(other.dist_to_exit.cmp(&self.dist_to_exit))
                .then(self.node.cmp(&other.node)),
            WorklistMode::NodeId => self.node.cmp(&other.node),
            WorklistMode::DistToExit => other
                .dist_to_exit
                .cmp(&self.dist_to_exit)
                .then(self.node.cmp(&other.node)),
        }
    }
}

impl PartialOrd for WorkUnit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority worklist over CFG nodes.
#[derive(Debug)]
pub struct Worklist {
    mode: WorklistMode,
    heap: BinaryHeap<WorkUnit>,
    queued: FxHashSet<NodeId>,
    visits: FxHashMap<NodeId, u32>,
    dist_to_exit: FxHashMap<NodeId, u32>,
}

impl Worklist {
    pub fn new(mode: WorklistMode) -> Self {
        Self {
            mode,
            heap: BinaryHeap::new(),
            queued: FxHashSet::default(),
            visits: FxHashMap::default(),
            dist_to_exit: FxHashMap::default(),
        }
    }

    /// Record the node's distance to exit (from the CFG preprocessing).
    pub fn set_dist_to_exit(&mut self, node: NodeId, dist: u32) {
        self.dist_to_exit.insert(node, dist);
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Enqueue a node (no-op while it is already queued).
    pub fn add(&mut self, node: NodeId) {
        if !self.queued.insert(node) {
            return;
        }
        let visit_count = *self.visits.get(&node).unwrap_or(&0);
        let dist_to_exit = *self.dist_to_exit.get(&node).unwrap_or(&u32::MAX);
        self.heap.push(WorkUnit {
            node,
            visit_count,
            dist_to_exit,
            mode: self.mode,
        });
    }

    /// Pop the highest-priority node, bumping its visit count.
    pub fn pop(&mut self) -> Option<NodeId> {
        let unit = self.heap.pop()?;
        self.queued.remove(&unit.node);
        *self.visits.entry(unit.node).or_insert(0) += 1;
        Some(unit.node)
    }

    pub fn visit_count(&self, node: NodeId) -> u32 {
        *self.visits.get(&node).unwrap_or(&0)
    }
}

/// Per-node todo/visited path sets with differential updates.
#[derive(Debug, Default)]
pub struct PathSetTable {
    todo: FxHashMap<NodeId, PathSet>,
    visited: FxHashMap<NodeId, PathSet>,
}

impl PathSetTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `d \ visited[node]` to `todo[node]`. Returns true iff the todo
    /// set strictly grew (the caller re-enqueues the node only then).
    pub fn put_todo(&mut self, node: NodeId, d: &PathSet) -> bool {
        let visited = self.visited.entry(node).or_default();
        let fresh = d.diff(visited);
        if fresh.is_empty() {
            return false;
        }
        self.todo.entry(node).or_default().union(&fresh)
    }

    /// Move `todo[node]` into `visited[node]` and return it.
    pub fn checkout(&mut self, node: NodeId) -> PathSet {
        let todo = self.todo.remove(&node).unwrap_or_default();
        self.visited.entry(node).or_default().union(&todo);
        todo
    }

    pub fn todo(&self, node: NodeId) -> Option<&PathSet> {
        self.todo.get(&node)
    }

    pub fn visited(&self, node: NodeId) -> Option<&PathSet> {
        self.visited.get(&node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::driver::path::Path;
    use crate::features::prop::Prop;
    use crate::shared::models::{Exp, IdentGenerator, IdentKind};

    #[test]
    fn test_priority_prefers_fewer_visits_then_distance() {
        let mut wl = Worklist::new(WorklistMode::VisitCount);
        wl.set_dist_to_exit(1, 5);
        wl.set_dist_to_exit(2, 1);

        wl.add(1);
        wl.add(2);
        // Equal visit counts: the node closer to the exit wins.
        assert_eq!(wl.pop(), Some(2));
        assert_eq!(wl.pop(), Some(1));

        // Node 2 now has one visit; a fresh node 3 wins over it.
        wl.set_dist_to_exit(3, 9);
        wl.add(2);
        wl.add(3);
        assert_eq!(wl.pop(), Some(3));
    }

    #[test]
    fn test_ties_broken_by_higher_id() {
        let mut wl = Worklist::new(WorklistMode::VisitCount);
        wl.set_dist_to_exit(1, 2);
        wl.set_dist_to_exit(7, 2);
        wl.add(1);
        wl.add(7);
        assert_eq!(wl.pop(), Some(7));
    }

    #[test]
    fn test_mode_node_id() {
        let mut wl = Worklist::new(WorklistMode::NodeId);
        wl.add(1);
        wl.add(9);
        wl.add(4);
        assert_eq!(wl.pop(), Some(9));
        assert_eq!(wl.pop(), Some(4));
        assert_eq!(wl.pop(), Some(1));
    }

    #[test]
    fn test_differential_put_todo() {
        let mut gen = IdentGenerator::new();
        let x = Exp::var(gen.fresh(IdentKind::Footprint));

        let mut table = PathSetTable::new();
        let p1 = Prop::emp();
        let p2 = Prop::emp().conjoin_neq(x, Exp::zero());

        let mut d = PathSet::new();
        d.add(p1.clone(), Path::start(0));
        assert!(table.put_todo(3, &d), "first delivery grows todo");

        // Checkout moves todo into visited.
        let checked = table.checkout(3);
        assert_eq!(checked.len(), 1);

        // Re-delivering the same prop is a no-op: already visited.
        assert!(!table.put_todo(3, &d));

        // A genuinely new prop grows todo again.
        let mut d2 = PathSet::new();
        d2.add(p2, Path::start(0));
        assert!(table.put_todo(3, &d2));
        assert!(table.visited(3).unwrap().contains(&p1));
    }
}
