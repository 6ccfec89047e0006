//! Per-procedure driver
//!
//! Two phases. *Footprint* starts from the empty heap with seeded formals
//! and synthesizes preconditions while executing the CFG to a fixpoint.
//! *Re-execution* replays the procedure once per inferred precondition; a
//! spec survives only if no fatal fault surfaces. The worklist loop is the
//! per-path fault boundary: recoverable faults are logged and the path
//! dies, everything else aborts the phase.

pub mod path;
pub mod worklist;

use crate::config::{AnalysisContext, Phase};
use crate::errors::{AnalysisFault, ErrKind, ErrorDesc, Errlog, Result};
use crate::features::abstraction::{self, join};
use crate::features::orchestration::ExeEnv;
use crate::features::prop::{Hpred, Inst, Prop, Strexp};
use crate::features::summaries::{JProp, Spec, Summary};
use crate::features::symexec::Executor;
use crate::shared::models::{
    Exp, IdentKind, Loc, NodeId, NodeKind, ProcCfg, Pvar, PvarKind, Typ,
};
use self::path::{Path, PathSet};
use self::worklist::{PathSetTable, Worklist};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use tracing::debug;

/// Analyze one procedure: footprint synthesis, then re-execution of each
/// inferred precondition. `depth` counts on-demand nesting and is bounded
/// by `max_recursion`.
pub fn analyze_procedure(env: &ExeEnv, proc: &ProcCfg, depth: u32) -> (Summary, Errlog) {
    let config = env.config.clone();
    let mut errlog = Errlog::new();
    let mut summary = Summary::empty(proc.attrs.clone(), proc.node_ids());
    summary.stats.started_at = Some(chrono::Utc::now());
    let start = std::time::Instant::now();

    if depth > config.max_recursion {
        summary.stats.timeout = true;
        errlog.log(
            ErrorDesc::new(
                ErrKind::Timeout,
                format!("recursion bound exceeded while analyzing {}", proc.name()),
                proc.attrs.loc.clone(),
                proc.name().clone(),
            ),
            Phase::Footprint.as_str(),
        );
        return (summary, errlog);
    }

    let mut ctx = AnalysisContext::new(config.clone());

    // ── Phase: footprint ─────────────────────────────────────────────
    let footprint_specs = ctx.with_phase(Phase::Footprint, |ctx| {
        let init = initial_prop(ctx, proc);
        let init_ps = PathSet::singleton(init, Path::start(proc.start));
        match run_worklist(env, ctx, &mut errlog, proc, init_ps) {
            Ok((exit_ps, visited)) => {
                collect_analysis_result(env, ctx, &mut errlog, proc, &exit_ps, &visited)
            }
            Err(AnalysisFault::Timeout(kind)) => {
                summary.stats.timeout = true;
                errlog.log(
                    ErrorDesc::new(
                        ErrKind::Timeout,
                        format!("analysis of {} timed out ({:?})", proc.name(), kind),
                        proc.attrs.loc.clone(),
                        proc.name().clone(),
                    ),
                    Phase::Footprint.as_str(),
                );
                Vec::new()
            }
            Err(fault) => {
                errlog.log(
                    ErrorDesc::new(
                        ErrKind::InternalError,
                        format!("footprint phase of {} failed: {}", proc.name(), fault),
                        proc.attrs.loc.clone(),
                        proc.name().clone(),
                    ),
                    Phase::Footprint.as_str(),
                );
                Vec::new()
            }
        }
    });

    debug!(
        proc = %proc.name(),
        specs = footprint_specs.len(),
        "footprint phase done"
    );
    summary.phase = Phase::ReExecution;

    // ── Phase: re-execution ──────────────────────────────────────────
    let final_specs = if config.only_footprint {
        footprint_specs
    } else {
        let mut valid = Vec::new();
        for spec in &footprint_specs {
            if let Some(spec) =
                ctx.with_phase(Phase::ReExecution, |ctx| {
                    reexecute_spec(env, ctx, &mut errlog, proc, spec)
                })
            {
                valid.push(spec);
            }
        }
        valid
    };

    debug!(proc = %proc.name(), specs = final_specs.len(), "re-execution done");

    summary.set_specs(renumber(final_specs));
    for callee in proc.static_callees() {
        summary.bump_call_stat(&callee);
        summary
            .dependency_map
            .insert(callee.clone(), env.spec_table.timestamp(&callee));
    }
    summary.stats.symops = ctx.symops_used();
    summary.stats.errors = errlog.len() as u32;
    summary.stats.elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    (summary, errlog)
}

fn renumber(specs: Vec<Spec>) -> Vec<Spec> {
    specs
        .into_iter()
        .enumerate()
        .map(|(i, mut spec)| {
            spec.pre = JProp::Prop(i as u32, spec.pre.to_prop().clone());
            spec
        })
        .collect()
}

/// Initial proposition of the footprint phase: each formal's stack cell
/// holds a fresh footprint variable, mirrored into the footprint, plus a
/// seed copy preserving the entry value for blame. Array-typed locals get
/// their storage up front (their bounds come from the declaration, not
/// from accesses); everything else materializes lazily.
fn initial_prop(ctx: &mut AnalysisContext, proc: &ProcCfg) -> Prop {
    let pname = proc.name().clone();
    let mut p = Prop::emp();
    for (name, typ) in &proc.attrs.formals {
        let value = Exp::var(ctx.idgen.fresh(IdentKind::Footprint));
        let cell = Hpred::Hpointsto(
            Exp::Lvar(Pvar::local(name.clone(), pname.clone())),
            Strexp::Eexp(value.clone(), Inst::Initial),
            Exp::sizeof(typ.clone()),
        );
        let seed = Hpred::Hpointsto(
            Exp::Lvar(Pvar::seed(name.clone(), pname.clone())),
            Strexp::Eexp(value, Inst::Initial),
            Exp::sizeof(typ.clone()),
        );
        p.sigma.push(cell.clone());
        p.sigma.push(seed);
        p.sigma_fp.push(cell);
    }
    for (name, typ) in &proc.attrs.locals {
        if let Typ::Array(_, Some(len)) = typ {
            let cell = Hpred::Hpointsto(
                Exp::Lvar(Pvar::local(name.clone(), pname.clone())),
                Strexp::Earray(Exp::int(*len), Vec::new(), Inst::Alloc),
                Exp::sizeof(typ.clone()),
            );
            p.sigma.push(cell);
        }
    }
    p.normalize()
}

/// The worklist loop (see spec of the module).
fn run_worklist(
    env: &ExeEnv,
    ctx: &mut AnalysisContext,
    errlog: &mut Errlog,
    proc: &ProcCfg,
    init: PathSet,
) -> Result<(PathSet, BTreeSet<(NodeId, Vec<u32>)>)> {
    let pname = proc.name().clone();
    let session = ctx.session.as_u128() as u64;

    let mut wl = Worklist::new(ctx.config.worklist_mode);
    for node in &proc.nodes {
        if let Some(d) = node.dist_to_exit {
            wl.set_dist_to_exit(node.id, d);
        }
    }
    let mut table = PathSetTable::new();
    let mut join_table: FxHashMap<NodeId, PathSet> = FxHashMap::default();
    let mut visited_nodes: BTreeSet<(NodeId, Vec<u32>)> = BTreeSet::new();

    table.put_todo(proc.start, &init);
    wl.add(proc.start);

    while let Some(n) = wl.pop() {
        let d = table.checkout(n);
        if d.is_empty() {
            continue;
        }
        let Some(node) = proc.node(n) else { continue };
        let lines: Vec<u32> = node.instrs.iter().map(|i| i.loc().line).collect();
        visited_nodes.insert((n, lines));

        let out = if node.kind == NodeKind::Join && !ctx.config.undo_join {
            // Join node: merge into the accumulator, propagate only the
            // genuinely new piece.
            let acc = join_table.entry(n).or_default().clone();
            let joined = join::pathset_join(&acc, &d);
            let piece = joined.diff(&acc);
            join_table.insert(n, joined);
            piece
        } else {
            let mut out = PathSet::new();
            for (prop, path) in d.iter() {
                let path = path.extend(n, false, session);
                let mut states = vec![(prop.clone(), path)];
                let mut exe = Executor {
                    env,
                    ctx: &mut *ctx,
                    errlog: &mut *errlog,
                    pname: pname.clone(),
                };
                for instr in &node.instrs {
                    let mut next = Vec::new();
                    for (p, pth) in &states {
                        match exe.exec_instr(instr, p, pth) {
                            Ok(results) => next.extend(results),
                            Err(fault) => {
                                handle_path_fault(&mut exe, fault, p, instr.loc())?
                            }
                        }
                    }
                    states = next;
                    if states.is_empty() {
                        break;
                    }
                }
                for (p, pth) in states {
                    out.add(p, pth);
                }
            }
            out
        };

        if ctx.config.developer_mode {
            ctx.delayed
                .push(format!("node {}: {} outgoing states", n, out.len()));
        }
        ctx.delayed.flush();

        if out.is_empty() {
            continue;
        }
        for &succ in &node.succs {
            if table.put_todo(succ, &out) {
                wl.add(succ);
            }
        }
        for &succ in &node.exn_succs {
            if table.put_todo(succ, &out) {
                wl.add(succ);
            }
        }
    }

    let exit_ps = table.visited(proc.exit).cloned().unwrap_or_default();
    Ok((exit_ps, visited_nodes))
}

/// The per-path fault boundary: recoverable faults in footprint phase are
/// logged (with a leak sweep over the dying state) and the path is
/// dropped; everything else propagates.
fn handle_path_fault(
    exe: &mut Executor,
    fault: AnalysisFault,
    prop: &Prop,
    loc: &Loc,
) -> Result<()> {
    let recoverable = fault.is_recoverable() && exe.ctx.phase == Phase::Footprint;
    match fault {
        AnalysisFault::Report(desc) if recoverable => {
            exe.errlog.log(*desc, exe.ctx.phase.as_str());
            // The path dies here; resources it held alone would leak
            // silently, so sweep for them now.
            let res = abstraction::abstract_no_symop(exe.ctx, prop);
            exe.report_leaks(&res.leaked, prop, loc);
            Ok(())
        }
        AnalysisFault::MissingFld(fld) if recoverable => {
            exe.errlog.log(
                ErrorDesc::new(
                    ErrKind::BadFootprint,
                    format!("field {} missing from the symbolic heap", fld),
                    loc.clone(),
                    exe.pname.clone(),
                ),
                exe.ctx.phase.as_str(),
            );
            Ok(())
        }
        AnalysisFault::BadFootprint(msg) if recoverable => {
            exe.errlog.log(
                ErrorDesc::new(ErrKind::BadFootprint, msg, loc.clone(), exe.pname.clone()),
                exe.ctx.phase.as_str(),
            );
            Ok(())
        }
        AnalysisFault::PreconditionNotFound(callee) if recoverable => {
            exe.errlog.log(
                ErrorDesc::new(
                    ErrKind::PreconditionNotMet,
                    format!("no usable precondition for {}", callee),
                    loc.clone(),
                    exe.pname.clone(),
                ),
                exe.ctx.phase.as_str(),
            );
            Ok(())
        }
        // Re-execution faults and fatal faults abort the phase; the
        // reported defect still lands in the log.
        AnalysisFault::ReExeError(desc) => {
            exe.errlog.log((*desc).clone(), exe.ctx.phase.as_str());
            Err(AnalysisFault::ReExeError(desc))
        }
        AnalysisFault::Report(desc) => {
            exe.errlog.log((*desc).clone(), exe.ctx.phase.as_str());
            Err(AnalysisFault::Report(desc))
        }
        other => Err(other),
    }
}

/// Extract specs from the exit states of the footprint phase.
fn collect_analysis_result(
    env: &ExeEnv,
    ctx: &mut AnalysisContext,
    errlog: &mut Errlog,
    proc: &ProcCfg,
    exit_ps: &PathSet,
    visited: &BTreeSet<(NodeId, Vec<u32>)>,
) -> Vec<Spec> {
    let pname = proc.name().clone();
    let exit_loc = proc
        .node(proc.exit)
        .map(|n| n.loc.clone())
        .unwrap_or_default();

    // pre (canonical) -> posts
    let mut groups: Vec<(Prop, PathSet)> = Vec::new();

    for (prop, path) in exit_ps.iter() {
        check_stack_escape(errlog, ctx, proc, prop);

        // Remove stack cells from the post; the return slot and globals
        // survive.
        let mut post = prop.without_footprint();
        post.sigma.retain(|hp| !is_dead_stack_root(proc, hp.root()));
        let post = post.normalize();

        // Instruction temporaries are existential at exit.
        let normals: Vec<_> = post
            .fav()
            .into_iter()
            .filter(|id| id.is_normal())
            .collect();
        let post = post.exist_quantify(&mut ctx.idgen, &normals);

        // Abstract, reporting what leaks at the exit.
        let mut exe = Executor {
            env,
            ctx: &mut *ctx,
            errlog: &mut *errlog,
            pname: pname.clone(),
        };
        let res = abstraction::abstract_no_symop(exe.ctx, &post);
        exe.report_leaks(&res.leaked, &post, &exit_loc);
        let post = res.prop;

        // The precondition is the committed footprint, minus cells the
        // caller cannot see (locals, the return slot, seeds), plus the
        // path's pure facts over footprint variables — without those,
        // re-execution could not replay the branch that produced this
        // group.
        let mut pre = prop.extract_footprint();
        pre.sigma
            .retain(|hp| !is_caller_invisible_fp_root(proc, hp.root()));
        pre.pi.extend(prop.pi.iter().filter(|a| {
            !a.is_attribute() && {
                let mut fv = std::collections::BTreeSet::new();
                a.fv_into(&mut fv);
                !fv.is_empty() && fv.iter().all(|id| id.is_footprint())
            }
        }).cloned());
        let pre = pre.normalize();

        match groups.iter_mut().find(|(g, _)| *g == pre) {
            Some((_, posts)) => {
                posts.add(post, path.clone());
            }
            None => {
                groups.push((pre, PathSet::singleton(post, path.clone())));
            }
        }
    }

    groups
        .into_iter()
        .enumerate()
        .map(|(i, (pre, posts))| {
            let posts = join::posts_collapse(&posts);
            Spec {
                pre: JProp::Prop(i as u32, pre),
                posts: posts.into_entries(),
                visited: visited.clone(),
            }
        })
        .collect()
}

/// Stack cells that must not survive into a post: locals, formals, seeds
/// and callee-suffixed variables of this procedure. The return slot
/// survives.
fn is_dead_stack_root(proc: &ProcCfg, root: &Exp) -> bool {
    match root {
        Exp::Lvar(pv) => match &pv.kind {
            PvarKind::Ret | PvarKind::Global => false,
            PvarKind::Callee(_) => true,
            PvarKind::Local | PvarKind::Seed | PvarKind::Abducted => {
                pv.proc == *proc.name()
            }
        },
        _ => false,
    }
}

/// Footprint cells the caller cannot provide: non-formal locals, the
/// return slot, and seed copies.
fn is_caller_invisible_fp_root(proc: &ProcCfg, root: &Exp) -> bool {
    match root {
        Exp::Lvar(pv) => match pv.kind {
            PvarKind::Ret | PvarKind::Seed => pv.proc == *proc.name(),
            PvarKind::Local => {
                let is_formal = proc.attrs.formals.iter().any(|(n, _)| *n == pv.name);
                pv.proc == *proc.name() && !is_formal
            }
            _ => false,
        },
        _ => false,
    }
}

/// Report returns of addresses of locals.
fn check_stack_escape(
    errlog: &mut Errlog,
    ctx: &AnalysisContext,
    proc: &ProcCfg,
    prop: &Prop,
) {
    let escapes = |e: &Exp| -> bool {
        matches!(e, Exp::Lvar(pv) if pv.is_local() && pv.proc == *proc.name())
    };
    for hp in &prop.sigma {
        let Hpred::Hpointsto(root, se, _) = hp else { continue };
        let keep = match root {
            Exp::Lvar(pv) => pv.is_ret() || pv.is_global(),
            _ => true,
        };
        if !keep {
            continue;
        }
        let mut leaves = Vec::new();
        collect_leaves(se, &mut leaves);
        for leaf in leaves {
            if escapes(&leaf) {
                errlog.log(
                    ErrorDesc::new(
                        ErrKind::StackVariableAddressEscape,
                        format!("address of stack variable {} escapes {}", leaf, proc.name()),
                        proc.attrs.loc.clone(),
                        proc.name().clone(),
                    ),
                    ctx.phase.as_str(),
                );
            }
        }
    }
}

fn collect_leaves(se: &Strexp, out: &mut Vec<Exp>) {
    match se {
        Strexp::Eexp(e, _) => out.push(e.clone()),
        Strexp::Estruct(fields, _) => {
            for (_, sub) in fields {
                collect_leaves(sub, out);
            }
        }
        Strexp::Earray(_, elems, _) => {
            for (_, sub) in elems {
                collect_leaves(sub, out);
            }
        }
    }
}

/// Re-execute one inferred spec; `None` when a fatal fault invalidates it.
fn reexecute_spec(
    env: &ExeEnv,
    ctx: &mut AnalysisContext,
    errlog: &mut Errlog,
    proc: &ProcCfg,
    spec: &Spec,
) -> Option<Spec> {
    // Fresh footprint identifiers for this run; the footprint is pinned to
    // the precondition so nothing new may be abduced.
    let pre = spec.pre.to_prop().rename_all_fresh(&mut ctx.idgen);
    let init = Prop {
        sub: Default::default(),
        pi: pre.pi.clone(),
        sigma: pre.sigma.clone(),
        pi_fp: pre.pi.clone(),
        sigma_fp: pre.sigma.clone(),
    }
    .normalize();

    let init_ps = PathSet::singleton(init, Path::start(proc.start));
    match run_worklist(env, ctx, errlog, proc, init_ps) {
        Ok((exit_ps, visited)) => {
            if exit_ps.is_empty() {
                return None;
            }
            let mut posts = PathSet::new();
            for (prop, path) in exit_ps.iter() {
                let mut post = prop.without_footprint();
                post.sigma.retain(|hp| !is_dead_stack_root(proc, hp.root()));
                let post = post.normalize();
                let normals: Vec<_> = post
                    .fav()
                    .into_iter()
                    .filter(|id| id.is_normal())
                    .collect();
                let post = post.exist_quantify(&mut ctx.idgen, &normals);
                posts.add(post, path.clone());
            }
            let posts = join::posts_collapse(&posts);
            Some(Spec {
                pre: spec.pre.clone(),
                posts: posts.into_entries(),
                visited,
            })
        }
        Err(fault) => {
            debug!(proc = %proc.name(), %fault, "re-execution rejected a precondition");
            None
        }
    }
}
