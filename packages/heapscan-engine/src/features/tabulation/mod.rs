//! Tabulation: interprocedural calls through callee specs
//!
//! For every spec of the callee: freshen its variables, star the actual
//! arguments onto the caller state, run the bi-abductive implication,
//! rewrite what is still missing, and combine each callee post with the
//! inferred frame. Post-processing selects a minimum pure cover of the
//! surviving results, maps dereference failures back to caller
//! expressions, and rejects footprint growth during re-execution.

use crate::config::Phase;
use crate::errors::{AnalysisFault, Bucket, ErrKind, ErrorDesc, Result};
use crate::features::driver::path::Path;
use crate::features::prop::{Atom, Hpred, Prop, Strexp, Subst};
use crate::features::prover::{self, Check, ImplOk, ImplResult};
use crate::features::summaries::{Spec, Summary};
use crate::features::symexec::Executor;
use crate::shared::models::{
    Attribute, CallSite, Exp, Ident, IdentKind, Loc, ProcName, Pvar, PvarKind, ResState, Typ,
};
use std::collections::BTreeSet;

/// Names treated as taint sinks when taint checking is enabled.
const TAINT_SINKS: &[&str] = &["system", "exec", "execv", "popen", "query"];

/// One candidate result from applying one spec.
struct CallResult {
    prop: Prop,
    path: Path,
    missing_pi: Vec<Atom>,
    missing_sigma_count: usize,
    missing_fld_count: usize,
}

/// Execute a call through the callee's summary specs.
pub fn exe_function_call(
    exe: &mut Executor,
    summary: &Summary,
    rets: &[Ident],
    args: &[(Exp, Typ)],
    loc: &Loc,
    prop: &Prop,
    path: &Path,
) -> Result<Vec<(Prop, Path)>> {
    let callee = summary.proc_name.clone();
    let env = exe.env;
    let tenv = &env.program.tenv;

    // Actual argument expressions, normalized in the caller state.
    let actuals: Vec<Exp> = args
        .iter()
        .map(|(e, _)| prop.sub.apply_exp(e).fold_const())
        .collect();

    // Step 2 (shared by all specs): star formal bindings onto the caller.
    let bindings: Vec<Hpred> = summary
        .formals
        .iter()
        .zip(actuals.iter())
        .map(|((name, typ), actual)| {
            Hpred::Hpointsto(
                Exp::Lvar(Pvar::callee(name.clone(), callee.clone())),
                Strexp::exp(actual.clone()),
                Exp::sizeof(typ.clone()),
            )
        })
        .collect();
    let actual_pre = prop.sigma_star(bindings);

    let mut results: Vec<CallResult> = Vec::new();
    let mut deref_errors: Vec<ErrorDesc> = Vec::new();
    let mut impl_failures = 0usize;

    for spec in summary.specs() {
        // Step 1: freshen the spec and suffix its program variables.
        let (spec_pre, spec_posts) = spec_rename_vars(exe, spec, &callee);

        // Step 3: bi-abductive implication.
        let ok = match prover::check_implication_for_footprint(
            &mut exe.ctx.idgen,
            tenv,
            &actual_pre,
            &spec_pre,
        ) {
            ImplResult::Ok(ok) => ok,
            ImplResult::Fail(_) => {
                impl_failures += 1;
                continue;
            }
        };

        // Step 4: rewrite missing parts so leftover spec variables become
        // footprint (or primed, in re-execution) variables.
        let sub_final = process_splitting(exe, &actual_pre, &ok);

        // Step 5: dereference check of the spec pre under the
        // substitution, mapped back to caller expressions.
        if let Some(desc) =
            spec_deref_check(exe, &spec_pre, &sub_final, &actual_pre, &actuals, loc, &callee)
        {
            deref_errors.push(desc);
            continue;
        }

        // Deferred obligations: bounds first, then casts.
        for check in &ok.checks {
            discharge_check(exe, check, &actual_pre, loc);
        }

        // Step 6: combine each post with the frame.
        let missing_pi_inst: Vec<Atom> = ok
            .missing_pi
            .iter()
            .map(|a| a.apply_sub(&sub_final).normalize())
            .collect();
        let missing_sigma_inst: Vec<Hpred> = ok
            .missing_sigma
            .iter()
            .map(|hp| hp.apply_sub(&sub_final))
            .collect();
        let missing_fld_inst: Vec<Hpred> = ok
            .missing_fld
            .iter()
            .map(|hp| hp.apply_sub(&sub_final))
            .collect();

        for (post, _post_path) in &spec_posts {
            let combined = combine_post(
                exe,
                &actual_pre,
                &ok,
                &sub_final,
                post,
                &missing_pi_inst,
                &missing_sigma_inst,
                &missing_fld_inst,
                rets,
                &callee,
                summary,
                loc,
            );
            let Some(combined) = combined else { continue };
            if prover::check_inconsistency(&combined) {
                // Diverging state: not propagated, but any resource it
                // holds uniquely would be lost silently otherwise.
                continue;
            }
            results.push(CallResult {
                prop: combined,
                path: path.clone(),
                missing_pi: missing_pi_inst.clone(),
                missing_sigma_count: missing_sigma_inst.len(),
                missing_fld_count: missing_fld_inst.len(),
            });
        }
    }

    // Step 8: post-process.
    exe_call_postprocess(
        exe,
        results,
        deref_errors,
        impl_failures,
        &callee,
        &actuals,
        loc,
    )
}

/// Freshen all identifiers of a spec (one renaming shared by pre and
/// posts) and mark its program variables with the callee suffix.
fn spec_rename_vars(
    exe: &mut Executor,
    spec: &Spec,
    callee: &ProcName,
) -> (Prop, Vec<(Prop, Path)>) {
    let pre = spec.pre.to_prop();

    let mut all_ids: BTreeSet<Ident> = pre.fav_all();
    for (post, _) in &spec.posts {
        all_ids.extend(post.fav_all());
    }
    let ren = Subst::from_pairs(
        all_ids
            .into_iter()
            .map(|id| {
                let fresh = exe.ctx.idgen.fresh_like(&id);
                (id, Exp::var(fresh))
            })
            .collect(),
    );

    let pre = add_callee_suffix(&pre.rename_with(&ren), callee);
    let posts = spec
        .posts
        .iter()
        .map(|(post, path)| {
            (
                add_callee_suffix(&post.rename_with(&ren), callee),
                path.clone(),
            )
        })
        .collect();
    (pre, posts)
}

/// Map the callee's local program variables to callee-suffixed ones so
/// they cannot collide with the caller's.
fn add_callee_suffix(prop: &Prop, callee: &ProcName) -> Prop {
    let map = |pv: &Pvar| -> Pvar {
        match pv.kind {
            PvarKind::Local | PvarKind::Seed => Pvar::callee(pv.name.clone(), callee.clone()),
            _ => pv.clone(),
        }
    };
    let mut p = prop.clone();
    p.pi = p.pi.iter().map(|a| map_atom_pvars(a, &map)).collect();
    p.sigma = p.sigma.iter().map(|hp| map_hpred_pvars(hp, &map)).collect();
    p.pi_fp = p.pi_fp.iter().map(|a| map_atom_pvars(a, &map)).collect();
    p.sigma_fp = p
        .sigma_fp
        .iter()
        .map(|hp| map_hpred_pvars(hp, &map))
        .collect();
    p.normalize()
}

fn map_exp_pvars(e: &Exp, f: &impl Fn(&Pvar) -> Pvar) -> Exp {
    match e {
        Exp::Lvar(pv) => Exp::Lvar(f(pv)),
        Exp::Var(_) | Exp::Const(_) | Exp::Sizeof(_, _) => e.clone(),
        Exp::UnOp(op, a) => Exp::UnOp(*op, Box::new(map_exp_pvars(a, f))),
        Exp::BinOp(op, a, b) => Exp::BinOp(
            *op,
            Box::new(map_exp_pvars(a, f)),
            Box::new(map_exp_pvars(b, f)),
        ),
        Exp::Cast(t, a) => Exp::Cast(t.clone(), Box::new(map_exp_pvars(a, f))),
        Exp::Lfield(a, fld, t) => {
            Exp::Lfield(Box::new(map_exp_pvars(a, f)), fld.clone(), t.clone())
        }
        Exp::Lindex(a, i) => Exp::Lindex(
            Box::new(map_exp_pvars(a, f)),
            Box::new(map_exp_pvars(i, f)),
        ),
    }
}

fn map_strexp_pvars(se: &Strexp, f: &impl Fn(&Pvar) -> Pvar) -> Strexp {
    match se {
        Strexp::Eexp(e, i) => Strexp::Eexp(map_exp_pvars(e, f), i.clone()),
        Strexp::Estruct(fields, i) => Strexp::Estruct(
            fields
                .iter()
                .map(|(fld, s)| (fld.clone(), map_strexp_pvars(s, f)))
                .collect(),
            i.clone(),
        ),
        Strexp::Earray(size, elems, i) => Strexp::Earray(
            map_exp_pvars(size, f),
            elems
                .iter()
                .map(|(idx, s)| (map_exp_pvars(idx, f), map_strexp_pvars(s, f)))
                .collect(),
            i.clone(),
        ),
    }
}

fn map_atom_pvars(a: &Atom, f: &impl Fn(&Pvar) -> Pvar) -> Atom {
    match a {
        Atom::Eq(x, y) => Atom::Eq(map_exp_pvars(x, f), map_exp_pvars(y, f)),
        Atom::Neq(x, y) => Atom::Neq(map_exp_pvars(x, f), map_exp_pvars(y, f)),
    }
}

fn map_hpred_pvars(hp: &Hpred, f: &impl Fn(&Pvar) -> Pvar) -> Hpred {
    match hp {
        Hpred::Hpointsto(root, se, texp) => Hpred::Hpointsto(
            map_exp_pvars(root, f),
            map_strexp_pvars(se, f),
            map_exp_pvars(texp, f),
        ),
        Hpred::Hlseg(k, para, a, b, shared) => Hpred::Hlseg(
            *k,
            para.clone(),
            map_exp_pvars(a, f),
            map_exp_pvars(b, f),
            shared.iter().map(|e| map_exp_pvars(e, f)).collect(),
        ),
        Hpred::Hdllseg(k, para, a, b, c, d, shared) => Hpred::Hdllseg(
            *k,
            para.clone(),
            map_exp_pvars(a, f),
            map_exp_pvars(b, f),
            map_exp_pvars(c, f),
            map_exp_pvars(d, f),
            shared.iter().map(|e| map_exp_pvars(e, f)).collect(),
        ),
    }
}

/// Step 4: extend `sub2` so every spec variable still free in the missing
/// parts maps to a fresh footprint variable (footprint phase) or primed
/// variable (re-execution).
fn process_splitting(exe: &mut Executor, actual_pre: &Prop, ok: &ImplOk) -> Subst {
    let caller_ids = actual_pre.fav_all();

    let mut leftover: BTreeSet<Ident> = BTreeSet::new();
    for a in &ok.missing_pi {
        a.apply_sub(&ok.sub2).fv_into(&mut leftover);
    }
    for hp in &ok.missing_sigma {
        hp.apply_sub(&ok.sub2).fv_into(&mut leftover);
    }
    for hp in &ok.missing_fld {
        hp.apply_sub(&ok.sub2).fv_into(&mut leftover);
    }

    let fresh_kind = if exe.ctx.in_footprint() {
        IdentKind::Footprint
    } else {
        IdentKind::Primed
    };

    let mut sub = ok.sub2.clone();
    for id in leftover {
        if caller_ids.contains(&id) || sub.lookup(&id).is_some() {
            continue;
        }
        let fresh = exe.ctx.idgen.fresh(fresh_kind);
        sub = sub.extend(id, Exp::var(fresh));
    }
    sub
}

/// Step 5: dereference check of the spec pre under the substitution,
/// explained in terms of the caller's actual expressions.
fn spec_deref_check(
    exe: &mut Executor,
    spec_pre: &Prop,
    sub: &Subst,
    actual_pre: &Prop,
    actuals: &[Exp],
    loc: &Loc,
    callee: &ProcName,
) -> Option<ErrorDesc> {
    for hp in &spec_pre.sigma {
        if !hp.is_pointsto() {
            continue;
        }
        let root = sub.apply_exp(hp.root()).fold_const();
        // Formal-binding cells are addresses of callee pvars, never null.
        if matches!(root, Exp::Lvar(_)) {
            continue;
        }
        if prover::check_zero(actual_pre, &root) {
            let culprit = explain_dereference_as_caller_expression(actual_pre, actuals, &root);
            let mut desc = ErrorDesc::new(
                ErrKind::NullDereference,
                format!(
                    "{} requires {} to be allocated, but it is null",
                    callee, culprit
                ),
                loc.clone(),
                exe.pname.clone(),
            )
            .with_bucket(Bucket::B2);
            desc.push_trace(loc.clone(), format!("during the call to {}", callee));
            return Some(desc);
        }
        for attr in actual_pre.get_attributes(&root) {
            if let Attribute::Resource {
                state: ResState::Release,
                site,
                ..
            } = attr
            {
                let culprit =
                    explain_dereference_as_caller_expression(actual_pre, actuals, &root);
                return Some(ErrorDesc::new(
                    ErrKind::UseAfterFree,
                    format!(
                        "{} reads {} which was released by {}",
                        callee, culprit, site.pname
                    ),
                    loc.clone(),
                    exe.pname.clone(),
                ));
            }
        }
    }
    None
}

/// Resolve the culprit of a callee-side fault back to the caller's actual
/// parameter (by index) or to the expression itself.
fn explain_dereference_as_caller_expression(
    actual_pre: &Prop,
    actuals: &[Exp],
    root: &Exp,
) -> String {
    for (i, actual) in actuals.iter().enumerate() {
        if prover::check_equal(actual_pre, actual, root) {
            return format!("parameter {} ({})", i + 1, actual);
        }
    }
    format!("{}", root)
}

/// Discharge a deferred obligation from the implication; unproven bounds
/// become precondition-not-met warnings.
fn discharge_check(exe: &mut Executor, check: &Check, actual_pre: &Prop, loc: &Loc) {
    match check {
        Check::Bounds { size, index } => {
            let lower = prover::check_le(actual_pre, &Exp::zero(), index);
            let upper = prover::check_lt(actual_pre, index, size);
            if !(lower && upper) {
                exe.errlog.log(
                    ErrorDesc::new(
                        ErrKind::PreconditionNotMet,
                        format!(
                            "bounds of index {} in array of size {} cannot be proven",
                            index, size
                        ),
                        loc.clone(),
                        exe.pname.clone(),
                    ),
                    exe.ctx.phase.as_str(),
                );
            }
        }
        Check::ClassCast { e, from, to } => {
            exe.errlog.log(
                ErrorDesc::new(
                    ErrKind::ClassCastException,
                    format!("{} of type {} cannot be cast to {}", e, from, to),
                    loc.clone(),
                    exe.pname.clone(),
                ),
                exe.ctx.phase.as_str(),
            );
        }
        Check::Pure(_) => {}
    }
}

/// Step 6: combine one callee post with the frame and the missing parts.
#[allow(clippy::too_many_arguments)]
fn combine_post(
    exe: &mut Executor,
    actual_pre: &Prop,
    ok: &ImplOk,
    sub_final: &Subst,
    post: &Prop,
    missing_pi: &[Atom],
    missing_sigma: &[Hpred],
    missing_fld: &[Hpred],
    rets: &[Ident],
    callee: &ProcName,
    summary: &Summary,
    loc: &Loc,
) -> Option<Prop> {
    // Caller view after sub1, restricted to the frame.
    let caller = actual_pre.rename_with(&ok.sub1);
    let mut result = caller.with_sigma(ok.frame.clone());

    // Instantiate the post with the final substitution.
    let mut post = post.rename_with(sub_final);

    // Return value: the callee's return slot binds the caller's ret id.
    let ret_pvar_root = |hp: &Hpred| -> bool {
        matches!(hp.root(), Exp::Lvar(pv) if pv.is_ret() && pv.proc == *callee)
    };
    let ret_value = post.sigma.iter().find_map(|hp| match hp {
        Hpred::Hpointsto(_, se, _) if ret_pvar_root(hp) => se.as_exp().cloned(),
        _ => None,
    });
    post.sigma.retain(|hp| !ret_pvar_root(hp));
    let post = post.normalize();

    // Star post heap onto the frame, merging field-splitting deltas.
    result.sigma.extend(post.sigma.iter().cloned());
    star_fld(&mut result.sigma, &ok.frame_fld);

    // Pure part: caller facts, post facts, missing assumptions.
    result.pi.extend(post.pi.iter().cloned());
    result.pi.extend(missing_pi.iter().cloned());

    // Footprint gains what the spec assumed beyond the caller's
    // knowledge — restricted to assumptions expressible over footprint
    // variables (facts about locally-computed values hold on this path
    // but are not a caller obligation).
    let footprint_only = |ids: std::collections::BTreeSet<Ident>| {
        ids.iter().all(|id| id.is_footprint())
    };
    result.pi_fp.extend(missing_pi.iter().filter(|a| {
        let mut fv = BTreeSet::new();
        a.fv_into(&mut fv);
        footprint_only(fv)
    }).cloned());
    result.sigma_fp.extend(
        missing_sigma
            .iter()
            .filter(|hp| footprint_only(hp.fv()))
            .cloned(),
    );
    let missing_fld_fp: Vec<Hpred> = missing_fld
        .iter()
        .filter(|hp| footprint_only(hp.fv()))
        .cloned()
        .collect();
    star_fld(&mut result.sigma_fp, &missing_fld_fp);

    // Type refinements.
    for (root, texp) in ok.frame_typ.iter().chain(ok.missing_typ.iter()) {
        for hp in result.sigma.iter_mut() {
            if let Hpred::Hpointsto(r, _, t) = hp {
                if r == root {
                    *t = texp.clone();
                }
            }
        }
    }

    // Attribute allocations crossing the call to the callee frame.
    let call_site = CallSite::new(callee.clone(), loc.clone());
    let mut result = result.normalize().map_resource_attributes(|_, attr| {
        if let Attribute::Resource {
            state: ResState::Acquire,
            kind,
            site,
        } = attr
        {
            if post_owns_site(&post, site) {
                return Some(Attribute::Resource {
                    state: ResState::Acquire,
                    kind: *kind,
                    site: call_site.clone(),
                });
            }
        }
        None
    });

    // Bind the caller's return identifier. The returned value is tagged
    // with its producer; for likely getters the tag additionally lets
    // repeated calls be treated as idempotent.
    if let Some(ret_id) = rets.first() {
        result = result.forget_ident(&mut exe.ctx.idgen, ret_id);
        match ret_value {
            Some(v) => {
                result = result.conjoin_eq(Exp::var(ret_id.clone()), v.clone());
                result = result.add_attribute(v, Attribute::Retval(callee.clone()));
            }
            None => {
                let fresh = Exp::var(exe.ctx.idgen.fresh(IdentKind::Primed));
                result = result.conjoin_eq(Exp::var(ret_id.clone()), fresh.clone());
                if is_likely_getter(summary) {
                    result = result.add_attribute(fresh, Attribute::Retval(callee.clone()));
                }
            }
        }
    }

    Some(result.normalize())
}

/// Did this acquire attribute arrive with the callee post (as opposed to
/// being a caller-side fact)?
fn post_owns_site(post: &Prop, site: &CallSite) -> bool {
    post.pi.iter().any(|a| match a.as_attribute() {
        Some((_, Attribute::Resource { site: s, .. })) => s == site,
        _ => false,
    })
}

/// Zero-argument Java procedures are treated as getters: their return
/// value is tagged so repeated calls can be reasoned about as idempotent.
fn is_likely_getter(summary: &Summary) -> bool {
    use crate::shared::models::Language;
    summary.attributes.language == Language::Java && summary.formals.is_empty()
}

/// Merge field-splitting hpreds into an existing sigma: fields join the
/// cell with the same root, whole cells are appended.
fn star_fld(sigma: &mut Vec<Hpred>, deltas: &[Hpred]) {
    for delta in deltas {
        let Hpred::Hpointsto(root, Strexp::Estruct(extra, _), _) = delta else {
            sigma.push(delta.clone());
            continue;
        };
        let mut merged = false;
        for hp in sigma.iter_mut() {
            if let Hpred::Hpointsto(r, Strexp::Estruct(fields, _), _) = hp {
                if r == root {
                    for (fld, se) in extra {
                        if !fields.iter().any(|(f, _)| f == fld) {
                            fields.push((fld.clone(), se.clone()));
                        }
                    }
                    fields.sort_by(|a, b| a.0.cmp(&b.0));
                    merged = true;
                    break;
                }
            }
        }
        if !merged {
            sigma.push(delta.clone());
        }
    }
}

/// Step 8: classify the surviving results, or raise the most informative
/// failure.
fn exe_call_postprocess(
    exe: &mut Executor,
    results: Vec<CallResult>,
    deref_errors: Vec<ErrorDesc>,
    impl_failures: usize,
    callee: &ProcName,
    actuals: &[Exp],
    loc: &Loc,
) -> Result<Vec<(Prop, Path)>> {
    // Taint check on the augmented call state.
    if exe.ctx.config.taint_analysis {
        taint_check(exe, callee, actuals, loc, &results);
    }

    // Re-execution must not grow the footprint.
    let results: Vec<CallResult> = if exe.ctx.phase == Phase::ReExecution {
        results
            .into_iter()
            .filter(|r| r.missing_sigma_count == 0 && r.missing_fld_count == 0)
            .collect()
    } else {
        results
    };

    if results.is_empty() {
        // Prefer a null dereference over other explanations.
        let best = deref_errors
            .iter()
            .find(|d| d.kind == ErrKind::NullDereference)
            .or_else(|| deref_errors.first())
            .cloned();
        let desc = match best {
            Some(desc) => desc,
            None => ErrorDesc::new(
                ErrKind::PreconditionNotMet,
                format!(
                    "no spec of {} applies at this call ({} failed)",
                    callee,
                    impl_failures.max(1)
                ),
                loc.clone(),
                exe.pname.clone(),
            ),
        };
        return if exe.ctx.phase == Phase::ReExecution {
            Err(AnalysisFault::ReExeError(Box::new(desc)))
        } else {
            Err(AnalysisFault::report(desc))
        };
    }

    // Minimum pure cover: results demanding a superset of another
    // result's pure assumptions add nothing.
    let covered = min_pure_cover(results);

    Ok(covered.into_iter().map(|r| (r.prop, r.path)).collect())
}

fn min_pure_cover(results: Vec<CallResult>) -> Vec<CallResult> {
    if results.iter().any(|r| r.missing_pi.is_empty()) {
        return results
            .into_iter()
            .filter(|r| r.missing_pi.is_empty())
            .collect();
    }
    let sets: Vec<BTreeSet<Atom>> = results
        .iter()
        .map(|r| r.missing_pi.iter().cloned().collect())
        .collect();
    let mut keep: Vec<bool> = vec![true; results.len()];
    for i in 0..results.len() {
        for j in 0..results.len() {
            if i != j && keep[i] && keep[j] && sets[j].is_subset(&sets[i]) && sets[j] != sets[i]
            {
                keep[i] = false;
            }
        }
    }
    results
        .into_iter()
        .zip(keep)
        .filter(|(_, k)| *k)
        .map(|(r, _)| r)
        .collect()
}

/// Report tainted values reaching a sensitive callee.
fn taint_check(
    exe: &mut Executor,
    callee: &ProcName,
    actuals: &[Exp],
    loc: &Loc,
    results: &[CallResult],
) {
    if !TAINT_SINKS.iter().any(|s| callee == s || callee.ends_with(&format!("::{}", s))) {
        return;
    }
    for r in results {
        for (i, actual) in actuals.iter().enumerate() {
            let tainted = r.prop.get_attributes(actual).into_iter().any(|a| {
                matches!(a, Attribute::Taint { .. })
            });
            if tainted {
                exe.errlog.log(
                    ErrorDesc::new(
                        ErrKind::TaintedValueReachingSensitiveFunction,
                        format!(
                            "tainted value in parameter {} reaches sensitive function {}",
                            i + 1,
                            callee
                        ),
                        loc.clone(),
                        exe.pname.clone(),
                    ),
                    exe.ctx.phase.as_str(),
                );
            }
        }
    }
}
