//! Per-procedure control-flow graphs (front-end contract)
//!
//! The engine does not build CFGs; it consumes them. `CfgProgram` bundles
//! the procedures of one capture together with the type environment and is
//! what the CLI deserializes from `<results-dir>/capture/*.json`.

use super::instr::Instr;
use super::loc::Loc;
use super::typ::{Tenv, Typ};
use super::ProcName;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Node identifier, unique within one procedure.
pub type NodeId = usize;

/// CFG node kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Start,
    Exit,
    Stmt,
    /// Prune node for the given branch polarity.
    Prune(bool),
    Join,
    Skip,
}

/// One CFG node: ordered instructions plus normal and exceptional
/// successors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CfgNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub instrs: Vec<Instr>,
    pub succs: Vec<NodeId>,
    pub exn_succs: Vec<NodeId>,
    pub loc: Loc,
    /// Shortest distance to the exit node, filled by
    /// [`ProcCfg::compute_dist_to_exit`]; drives worklist priority.
    #[serde(default)]
    pub dist_to_exit: Option<u32>,
}

/// Procedure access level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    Default,
    Public,
    Private,
    Protected,
}

/// Source language of a procedure; drives buckets and heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Language {
    C,
    Cpp,
    ObjC,
    Java,
}

/// Procedure attributes from the front-end attribute table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcAttributes {
    pub name: ProcName,
    pub formals: Vec<(String, Typ)>,
    /// Declared locals; array-typed ones get their storage seeded at
    /// entry so bounds are known.
    #[serde(default)]
    pub locals: Vec<(String, Typ)>,
    pub ret_type: Typ,
    pub access: Access,
    pub loc: Loc,
    pub language: Language,
    pub is_defined: bool,
    pub captured: Vec<(String, Typ)>,
}

impl ProcAttributes {
    pub fn new(name: impl Into<ProcName>, language: Language) -> Self {
        Self {
            name: name.into(),
            formals: Vec::new(),
            locals: Vec::new(),
            ret_type: Typ::Void,
            access: Access::Default,
            loc: Loc::dummy(),
            language,
            is_defined: true,
            captured: Vec::new(),
        }
    }
}

/// One procedure: attributes plus its CFG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcCfg {
    pub attrs: ProcAttributes,
    pub nodes: Vec<CfgNode>,
    pub start: NodeId,
    pub exit: NodeId,
}

impl ProcCfg {
    pub fn name(&self) -> &ProcName {
        &self.attrs.name
    }

    pub fn node(&self, id: NodeId) -> Option<&CfgNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Node ids in declaration order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id).collect()
    }

    /// Names of procedures called (via constant function expressions).
    pub fn static_callees(&self) -> Vec<ProcName> {
        use super::exp::{Const, Exp};
        let mut out = Vec::new();
        for node in &self.nodes {
            for instr in &node.instrs {
                if let Instr::Call { fexp, .. } = instr {
                    if let Exp::Const(Const::Fun(name)) = fexp {
                        if !out.contains(name) {
                            out.push(name.clone());
                        }
                    }
                }
            }
        }
        out
    }

    /// Fill `dist_to_exit` with a reverse BFS from the exit node.
    pub fn compute_dist_to_exit(&mut self) {
        let mut preds: Vec<Vec<NodeId>> = Vec::new();
        let max_id = self.nodes.iter().map(|n| n.id).max().unwrap_or(0);
        preds.resize(max_id + 1, Vec::new());
        for node in &self.nodes {
            for succ in node.succs.iter().chain(node.exn_succs.iter()) {
                if *succ <= max_id {
                    preds[*succ].push(node.id);
                }
            }
        }

        let mut dist: Vec<Option<u32>> = vec![None; max_id + 1];
        let mut queue = VecDeque::new();
        if self.exit <= max_id {
            dist[self.exit] = Some(0);
            queue.push_back(self.exit);
        }
        while let Some(id) = queue.pop_front() {
            let d = dist[id].unwrap_or(0);
            for &p in &preds[id] {
                if dist[p].is_none() {
                    dist[p] = Some(d + 1);
                    queue.push_back(p);
                }
            }
        }

        for node in &mut self.nodes {
            node.dist_to_exit = dist[node.id];
        }
    }
}

/// A captured program: procedures plus the type environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CfgProgram {
    pub procs: Vec<ProcCfg>,
    pub tenv: Tenv,
}

impl CfgProgram {
    pub fn proc(&self, name: &str) -> Option<&ProcCfg> {
        self.procs.iter().find(|p| p.attrs.name == name)
    }

    /// Prepare all procedures for analysis.
    pub fn prepare(&mut self) {
        for proc in &mut self.procs {
            proc.compute_dist_to_exit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> ProcCfg {
        // 0 -> 1 -> 3, 0 -> 2 -> 3
        let node = |id, succs: Vec<NodeId>, kind| CfgNode {
            id,
            kind,
            instrs: vec![],
            succs,
            exn_succs: vec![],
            loc: Loc::dummy(),
            dist_to_exit: None,
        };
        ProcCfg {
            attrs: ProcAttributes::new("f", Language::C),
            nodes: vec![
                node(0, vec![1, 2], NodeKind::Start),
                node(1, vec![3], NodeKind::Stmt),
                node(2, vec![3], NodeKind::Stmt),
                node(3, vec![], NodeKind::Exit),
            ],
            start: 0,
            exit: 3,
        }
    }

    #[test]
    fn test_dist_to_exit() {
        let mut cfg = diamond();
        cfg.compute_dist_to_exit();
        assert_eq!(cfg.node(3).unwrap().dist_to_exit, Some(0));
        assert_eq!(cfg.node(1).unwrap().dist_to_exit, Some(1));
        assert_eq!(cfg.node(0).unwrap().dist_to_exit, Some(2));
    }
}
