//! Interprocedural orchestration
//!
//! Builds the call graph, schedules strongly-connected components
//! bottom-up (callees first, via Tarjan), fans out independent components
//! to rayon workers, and drives recursive components to a fixpoint under
//! the timestamp cap. Summaries are merged into the spec table in
//! completion order; the error log is the only other shared sink.

use crate::config::AnalysisConfig;
use crate::errors::Errlog;
use crate::features::callbacks::CallbackRegistry;
use crate::features::driver;
use crate::shared::models::{CfgProgram, ProcName};
use crate::features::summaries::SpecTable;
use dashmap::DashMap;
use parking_lot::Mutex;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Execution environment shared by every worker.
#[derive(Clone)]
pub struct ExeEnv {
    pub program: Arc<CfgProgram>,
    pub spec_table: Arc<SpecTable>,
    pub config: AnalysisConfig,
    /// Procedures currently being analyzed (on-demand cycle breaker).
    pub active: Arc<DashMap<ProcName, ()>>,
    errlog: Arc<Mutex<Errlog>>,
}

impl ExeEnv {
    pub fn new(program: CfgProgram, spec_table: SpecTable, config: AnalysisConfig) -> Self {
        Self {
            program: Arc::new(program),
            spec_table: Arc::new(spec_table),
            config,
            active: Arc::new(DashMap::new()),
            errlog: Arc::new(Mutex::new(Errlog::new())),
        }
    }

    /// Merge a per-procedure error log into the global one.
    pub fn merge_errlog(&self, log: Errlog) {
        self.errlog.lock().merge(log);
    }

    /// Snapshot of the global error log.
    pub fn errlog_snapshot(&self) -> Errlog {
        self.errlog.lock().clone()
    }
}

/// Whole-run statistics.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub procs_analyzed: usize,
    pub issues: usize,
    pub elapsed_ms: f64,
}

/// Analyze every defined procedure of the program bottom-up.
pub fn analyze_program(env: &ExeEnv, callbacks: &CallbackRegistry) -> RunStats {
    let start = std::time::Instant::now();

    // Call graph over defined procedures.
    let mut graph: DiGraph<ProcName, ()> = DiGraph::new();
    let mut index_of: FxHashMap<ProcName, NodeIndex> = FxHashMap::default();
    for proc in &env.program.procs {
        if proc.attrs.is_defined {
            let idx = graph.add_node(proc.attrs.name.clone());
            index_of.insert(proc.attrs.name.clone(), idx);
        }
    }
    for proc in &env.program.procs {
        let Some(&from) = index_of.get(&proc.attrs.name) else { continue };
        for callee in proc.static_callees() {
            if let Some(&to) = index_of.get(&callee) {
                // Self-edges stay in: they mark recursive components.
                graph.add_edge(from, to, ());
            }
        }
    }

    // Tarjan emits components callees-first.
    let sccs = tarjan_scc(&graph);

    // Height of each SCC in the condensation decides the parallel levels:
    // components at the same height are independent.
    let mut scc_of: FxHashMap<NodeIndex, usize> = FxHashMap::default();
    for (i, scc) in sccs.iter().enumerate() {
        for &n in scc {
            scc_of.insert(n, i);
        }
    }
    let mut height: Vec<usize> = vec![0; sccs.len()];
    for (i, scc) in sccs.iter().enumerate() {
        for &n in scc {
            for callee in graph.neighbors(n) {
                let j = scc_of[&callee];
                if j != i {
                    height[i] = height[i].max(height[j] + 1);
                }
            }
        }
    }
    let max_height = height.iter().copied().max().unwrap_or(0);
    let mut levels: Vec<Vec<usize>> = vec![Vec::new(); max_height + 1];
    for (i, h) in height.iter().enumerate() {
        levels[*h].push(i);
    }

    info!(
        procs = graph.node_count(),
        sccs = sccs.len(),
        levels = levels.len(),
        "starting interprocedural analysis"
    );

    for level in &levels {
        level.par_iter().for_each(|&scc_idx| {
            let names: Vec<ProcName> =
                sccs[scc_idx].iter().map(|&n| graph[n].clone()).collect();
            analyze_scc(env, callbacks, &names);
        });
    }

    let errors = env.errlog_snapshot().len();
    RunStats {
        procs_analyzed: graph.node_count(),
        issues: errors,
        elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
    }
}

/// Analyze one strongly-connected component. Singleton components run
/// once; recursive ones iterate until their summaries stop changing or
/// the timestamp cap is reached.
fn analyze_scc(env: &ExeEnv, callbacks: &CallbackRegistry, names: &[ProcName]) {
    let recursive = names.len() > 1 || {
        // Single member: recursive iff it calls itself.
        env.program
            .proc(&names[0])
            .map(|p| p.static_callees().contains(&names[0]))
            .unwrap_or(false)
    };

    let rounds = if recursive {
        env.config.max_recursion.max(1)
    } else {
        1
    };

    for round in 0..rounds {
        let mut changed = false;
        for name in names {
            let Some(proc) = env.program.proc(name) else { continue };
            if env.spec_table.timestamp(name) >= env.config.max_timestamp {
                debug!(proc = %name, "timestamp cap reached");
                continue;
            }
            if env.config.only_nospecs
                && env.spec_table.get(name).is_some_and(|s| s.has_specs())
            {
                continue;
            }
            env.active.insert(name.clone(), ());
            let (summary, errlog) = driver::analyze_procedure(env, proc, 0);
            env.active.remove(name);

            let before = env
                .spec_table
                .get(name)
                .and_then(|s| rmp_serde::to_vec(&s.payload).ok());
            let after = rmp_serde::to_vec(&summary.payload).ok();
            changed |= before != after;

            let summary = env.spec_table.put(summary);
            let mut cb_errlog = Errlog::new();
            callbacks.run(env, &summary, &mut cb_errlog);
            env.merge_errlog(errlog);
            env.merge_errlog(cb_errlog);
        }
        if !changed && round > 0 {
            break;
        }
        if !recursive {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::summaries::SpecTable;
    use crate::shared::models::{
        CfgNode, Instr, Language, Loc, NodeKind, ProcAttributes, ProcCfg,
    };

    fn leaf_proc(name: &str) -> ProcCfg {
        let mut cfg = ProcCfg {
            attrs: ProcAttributes::new(name, Language::C),
            nodes: vec![
                CfgNode {
                    id: 0,
                    kind: NodeKind::Start,
                    instrs: vec![],
                    succs: vec![1],
                    exn_succs: vec![],
                    loc: Loc::new("a.c", 1, 0),
                    dist_to_exit: None,
                },
                CfgNode {
                    id: 1,
                    kind: NodeKind::Exit,
                    instrs: vec![],
                    succs: vec![],
                    exn_succs: vec![],
                    loc: Loc::new("a.c", 2, 0),
                    dist_to_exit: None,
                },
            ],
            start: 0,
            exit: 1,
        };
        cfg.compute_dist_to_exit();
        cfg
    }

    fn caller_proc(name: &str, callee: &str) -> ProcCfg {
        let mut cfg = leaf_proc(name);
        cfg.nodes[0].instrs.push(Instr::Call {
            rets: vec![],
            fexp: crate::shared::models::Exp::fun(callee),
            args: vec![],
            loc: Loc::new("a.c", 1, 0),
            flags: Default::default(),
        });
        cfg
    }

    #[test]
    fn test_analyze_program_bottom_up() {
        let mut program = CfgProgram {
            procs: vec![caller_proc("f", "g"), leaf_proc("g")],
            tenv: Default::default(),
        };
        program.prepare();

        let env = ExeEnv::new(program, SpecTable::in_memory(), AnalysisConfig::default());
        let stats = analyze_program(&env, &CallbackRegistry::new());

        assert_eq!(stats.procs_analyzed, 2);
        // Both procedures end with summaries; the leaf has at least one
        // trivial spec.
        assert!(env.spec_table.contains("f"));
        assert!(env.spec_table.contains("g"));
        assert!(env.spec_table.get("g").unwrap().has_specs());
    }
}
