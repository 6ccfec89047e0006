//! Execution paths and path sets
//!
//! A path is a tree-shaped provenance trace: which nodes a proposition
//! went through, which calls it crossed, and which joins merged it.
//! Sharing is by `Arc`, so extending a path is O(1) and join nodes do not
//! duplicate histories.

use crate::features::prop::Prop;
use crate::shared::models::{Loc, NodeId, ProcName};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One event on a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathEvent {
    Node { node: NodeId, exn: bool, session: u64 },
    Call { callee: ProcName, loc: Loc },
}

#[derive(Debug, Serialize, Deserialize)]
enum PathNode {
    Start {
        node: NodeId,
    },
    Extend {
        node: NodeId,
        exn: bool,
        session: u64,
        len: usize,
        parent: Path,
    },
    Call {
        callee: ProcName,
        loc: Loc,
        len: usize,
        parent: Path,
    },
    Join {
        len: usize,
        left: Path,
        right: Path,
    },
}

/// A provenance path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Path(Arc<PathNode>);

impl Path {
    pub fn start(node: NodeId) -> Path {
        Path(Arc::new(PathNode::Start { node }))
    }

    pub fn len(&self) -> usize {
        match &*self.0 {
            PathNode::Start { .. } => 1,
            PathNode::Extend { len, .. }
            | PathNode::Call { len, .. }
            | PathNode::Join { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Extend with one node visit.
    pub fn extend(&self, node: NodeId, exn: bool, session: u64) -> Path {
        Path(Arc::new(PathNode::Extend {
            node,
            exn,
            session,
            len: self.len() + 1,
            parent: self.clone(),
        }))
    }

    /// Record a call crossed at `loc`.
    pub fn add_call(&self, callee: impl Into<ProcName>, loc: Loc) -> Path {
        Path(Arc::new(PathNode::Call {
            callee: callee.into(),
            loc,
            len: self.len() + 1,
            parent: self.clone(),
        }))
    }

    /// Join two paths (at a CFG join point).
    pub fn join(left: &Path, right: &Path) -> Path {
        let len = left.len().max(right.len()) + 1;
        Path(Arc::new(PathNode::Join {
            len,
            left: left.clone(),
            right: right.clone(),
        }))
    }

    /// Visit the longest linear sequence through the path tree, in
    /// chronological order. At joins, the longer branch wins.
    pub fn iter_longest_sequence(&self, f: &mut impl FnMut(&PathEvent)) {
        match &*self.0 {
            PathNode::Start { node } => f(&PathEvent::Node {
                node: *node,
                exn: false,
                session: 0,
            }),
            PathNode::Extend {
                node,
                exn,
                session,
                parent,
                ..
            } => {
                parent.iter_longest_sequence(f);
                f(&PathEvent::Node {
                    node: *node,
                    exn: *exn,
                    session: *session,
                });
            }
            PathNode::Call {
                callee,
                loc,
                parent,
                ..
            } => {
                parent.iter_longest_sequence(f);
                f(&PathEvent::Call {
                    callee: callee.clone(),
                    loc: loc.clone(),
                });
            }
            PathNode::Join { left, right, .. } => {
                if left.len() >= right.len() {
                    left.iter_longest_sequence(f);
                } else {
                    right.iter_longest_sequence(f);
                }
            }
        }
    }

    /// The longest sequence as a vector.
    pub fn longest_sequence(&self) -> Vec<PathEvent> {
        let mut out = Vec::new();
        self.iter_longest_sequence(&mut |e| out.push(e.clone()));
        out
    }
}

/// A set of propositions with their paths, keyed by proposition: adding a
/// proposition already present keeps the first path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathSet {
    entries: Vec<(Prop, Path)>,
}

impl PathSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn singleton(prop: Prop, path: Path) -> Self {
        Self {
            entries: vec![(prop, path)],
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, prop: &Prop) -> bool {
        self.entries.iter().any(|(p, _)| p == prop)
    }

    /// Add one element; false if the proposition was already present.
    pub fn add(&mut self, prop: Prop, path: Path) -> bool {
        if self.contains(&prop) {
            return false;
        }
        self.entries.push((prop, path));
        true
    }

    /// Union in place; true iff this set grew.
    pub fn union(&mut self, other: &PathSet) -> bool {
        let mut changed = false;
        for (prop, path) in &other.entries {
            changed |= self.add(prop.clone(), path.clone());
        }
        changed
    }

    /// Elements of `self` not present in `other`.
    pub fn diff(&self, other: &PathSet) -> PathSet {
        PathSet {
            entries: self
                .entries
                .iter()
                .filter(|(p, _)| !other.contains(p))
                .cloned()
                .collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Prop, Path)> {
        self.entries.iter()
    }

    pub fn into_entries(self) -> Vec<(Prop, Path)> {
        self.entries
    }

    pub fn entries(&self) -> &[(Prop, Path)] {
        &self.entries
    }

    /// Keep only the entries whose proposition satisfies `pred`.
    pub fn filter(&self, mut pred: impl FnMut(&Prop) -> bool) -> PathSet {
        PathSet {
            entries: self
                .entries
                .iter()
                .filter(|(p, _)| pred(p))
                .cloned()
                .collect(),
        }
    }

    /// Map every proposition (dropping entries mapped to `None`).
    pub fn filter_map_props(&self, mut f: impl FnMut(&Prop) -> Option<Prop>) -> PathSet {
        let mut out = PathSet::new();
        for (p, path) in &self.entries {
            if let Some(q) = f(p) {
                out.add(q, path.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_and_longest_sequence() {
        let p = Path::start(0).extend(1, false, 7).extend(2, false, 7);
        let events = p.longest_sequence();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], PathEvent::Node { node: 0, .. }));
        assert!(matches!(events[2], PathEvent::Node { node: 2, .. }));
    }

    #[test]
    fn test_join_prefers_longer_branch() {
        let left = Path::start(0).extend(1, false, 0).extend(2, false, 0);
        let right = Path::start(0).extend(3, false, 0);
        let joined = Path::join(&left, &right);
        let events = joined.longest_sequence();
        assert!(events
            .iter()
            .any(|e| matches!(e, PathEvent::Node { node: 2, .. })));
    }

    #[test]
    fn test_pathset_dedups_by_prop() {
        let mut ps = PathSet::new();
        let p = Prop::emp();
        assert!(ps.add(p.clone(), Path::start(0)));
        assert!(!ps.add(p, Path::start(1)));
        assert_eq!(ps.len(), 1);
    }

    #[test]
    fn test_pathset_diff() {
        use crate::shared::models::{Exp, IdentGenerator, IdentKind};
        let mut gen = IdentGenerator::new();
        let x = Exp::var(gen.fresh(IdentKind::Footprint));

        let mut a = PathSet::new();
        let mut b = PathSet::new();
        let p1 = Prop::emp();
        let p2 = Prop::emp().conjoin_neq(x, Exp::zero());
        a.add(p1.clone(), Path::start(0));
        a.add(p2.clone(), Path::start(0));
        b.add(p1, Path::start(0));
        let d = a.diff(&b);
        assert_eq!(d.len(), 1);
    }
}
