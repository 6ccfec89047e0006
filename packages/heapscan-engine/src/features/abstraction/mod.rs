//! Abstraction
//!
//! Canonicalizes the heap of a proposition: folds points-to chains into
//! list segments, garbage-collects cells no longer reachable from
//! caller-visible roots, and (at higher abstraction levels) runs extra
//! collapse passes. Dropped cells are returned to the caller — the
//! executor turns acquired-resource garbage into leak reports.

pub mod join;

use crate::config::AnalysisContext;
use crate::errors::Result;
use crate::features::prop::{Atom, HparaBody, Hpred, Inst, LsegKind, Prop, Strexp};
use crate::shared::models::{Exp, Ident, IdentKind};
use std::collections::BTreeSet;

/// Result of abstracting one proposition.
#[derive(Debug, Clone)]
pub struct AbstractionResult {
    pub prop: Prop,
    /// Cells dropped because nothing caller-visible reaches them.
    pub leaked: Vec<Hpred>,
}

/// Abstract a proposition (consumes one symop).
pub fn abstract_prop(ctx: &mut AnalysisContext, prop: &Prop) -> Result<AbstractionResult> {
    ctx.consume_symop()?;
    Ok(abstract_prop_inner(ctx, prop))
}

/// Abstraction variant used while reporting errors: does not touch the
/// symop budget.
pub fn abstract_no_symop(ctx: &mut AnalysisContext, prop: &Prop) -> AbstractionResult {
    ctx.without_symops(|ctx| abstract_prop_inner(ctx, prop))
}

fn abstract_prop_inner(ctx: &mut AnalysisContext, prop: &Prop) -> AbstractionResult {
    let mut p = prop.clone().normalize();

    let passes = 1 + ctx.config.spec_abs_level.min(2);
    for _ in 0..passes {
        while fold_one_chain(ctx, &mut p) {}
    }

    let (p, leaked) = collect_garbage(p);
    AbstractionResult { prop: p, leaked }
}

/// How often an identifier occurs across the proposition (current parts).
fn occurrence_sets(p: &Prop) -> Vec<BTreeSet<Ident>> {
    let mut sets = Vec::new();
    for hp in &p.sigma {
        sets.push(hp.fv());
    }
    let mut pi_fv = BTreeSet::new();
    for a in &p.pi {
        if !a.is_attribute() {
            a.fv_into(&mut pi_fv);
        }
    }
    sets.push(pi_fv);
    sets
}

/// One folding step: a points-to chained to another points-to (or to an
/// existing segment) through a primed link variable with no other uses
/// becomes a non-empty list segment. Returns true if anything folded.
fn fold_one_chain(ctx: &mut AnalysisContext, p: &mut Prop) -> bool {
    let occ = occurrence_sets(p);
    let use_count = |id: &Ident| occ.iter().filter(|set| set.contains(id)).count();

    let mut fp_fv = BTreeSet::new();
    for hp in &p.sigma_fp {
        hp.fv_into(&mut fp_fv);
    }

    let mut fold: Option<(usize, usize, Hpred)> = None;
    'scan: for (i, hp_a) in p.sigma.iter().enumerate() {
        let Hpred::Hpointsto(root_a, Strexp::Estruct(fields_a, _), texp_a) = hp_a else {
            continue;
        };
        for (fld, se) in fields_a {
            let link = match se.as_exp() {
                Some(Exp::Var(id)) if id.is_primed() => id.clone(),
                _ => continue,
            };
            // The link variable must connect exactly the two cells being
            // folded, and must not be pinned by the footprint.
            if use_count(&link) != 2 || fp_fv.contains(&link) {
                continue;
            }
            let link_exp = Exp::var(link);

            for (j, hp_b) in p.sigma.iter().enumerate() {
                if i == j {
                    continue;
                }
                match hp_b {
                    // ptsto . ptsto -> lseg
                    Hpred::Hpointsto(root_b, Strexp::Estruct(fields_b, _), texp_b)
                        if *root_b == link_exp && texp_a == texp_b =>
                    {
                        let Some(next_b) = fields_b
                            .iter()
                            .find(|(f, _)| f == fld)
                            .and_then(|(_, s)| s.as_exp().cloned())
                        else {
                            continue;
                        };
                        let para = mk_para(ctx, fld, fields_b, texp_b);
                        fold = Some((
                            i,
                            j,
                            Hpred::Hlseg(LsegKind::NE, para, root_a.clone(), next_b, vec![]),
                        ));
                        break 'scan;
                    }
                    // ptsto . lseg -> lseg
                    Hpred::Hlseg(_, para_b, e_from, e_to, shared)
                        if *e_from == link_exp
                            && para_link_field(para_b).as_deref() == Some(fld) =>
                    {
                        fold = Some((
                            i,
                            j,
                            Hpred::Hlseg(
                                LsegKind::NE,
                                para_b.clone(),
                                root_a.clone(),
                                e_to.clone(),
                                shared.clone(),
                            ),
                        ));
                        break 'scan;
                    }
                    _ => {}
                }
            }
        }
    }

    match fold {
        Some((i, j, folded)) => {
            replace_two(p, i, j, folded);
            true
        }
        None => false,
    }
}

/// The field a segment's body links through.
fn para_link_field(para: &HparaBody) -> Option<String> {
    for hp in &para.body {
        if let Hpred::Hpointsto(_, Strexp::Estruct(fields, _), _) = hp {
            for (fld, se) in fields {
                if se.as_exp() == Some(&Exp::var(para.next.clone())) {
                    return Some(fld.clone());
                }
            }
        }
    }
    None
}

/// Build a segment body template from a representative cell: the link
/// field maps to the template's `next`, every other field to a fresh
/// existential.
fn mk_para(
    ctx: &mut AnalysisContext,
    link_fld: &str,
    fields: &[(String, Strexp)],
    texp: &Exp,
) -> HparaBody {
    let root = ctx.idgen.fresh(IdentKind::Primed);
    let next = ctx.idgen.fresh(IdentKind::Primed);
    let mut evars = Vec::new();
    let mut body_fields = Vec::new();
    for (fld, _) in fields {
        if fld == link_fld {
            body_fields.push((
                fld.clone(),
                Strexp::Eexp(Exp::var(next.clone()), Inst::None),
            ));
        } else {
            let ev = ctx.idgen.fresh(IdentKind::Primed);
            body_fields.push((fld.clone(), Strexp::Eexp(Exp::var(ev.clone()), Inst::None)));
            evars.push(ev);
        }
    }
    body_fields.sort_by(|a, b| a.0.cmp(&b.0));
    let body = vec![Hpred::Hpointsto(
        Exp::var(root.clone()),
        Strexp::Estruct(body_fields, Inst::None),
        texp.clone(),
    )];
    HparaBody {
        root,
        next,
        svars: vec![],
        evars,
        body,
    }
}

fn replace_two(p: &mut Prop, i: usize, j: usize, folded: Hpred) {
    let (hi, lo) = if i > j { (i, j) } else { (j, i) };
    p.sigma.remove(hi);
    p.sigma.remove(lo);
    p.sigma.push(folded);
    *p = p.clone().normalize();
}

/// Remove heap cells unreachable from caller-visible roots. Returns the
/// pruned proposition and the dropped cells. Attributes carried by dropped
/// roots are dropped with them (the caller inspects the original
/// proposition to classify leaks).
pub fn collect_garbage(p: Prop) -> (Prop, Vec<Hpred>) {
    let n = p.sigma.len();
    let mut reachable = vec![false; n];
    let mut reachable_vars: BTreeSet<Ident> = BTreeSet::new();
    let mut frontier_exps: Vec<Exp> = Vec::new();

    let anchored = |hp: &Hpred| hp.root().fv().iter().all(|id| !id.is_primed());

    // Pure facts can alias a primed root with something caller-visible.
    for atom in &p.pi {
        if let Atom::Eq(a, b) = atom {
            let a_vis = a.fv().iter().all(|id| !id.is_primed());
            let b_vis = b.fv().iter().all(|id| !id.is_primed());
            if a_vis {
                b.fv_into(&mut reachable_vars);
            }
            if b_vis {
                a.fv_into(&mut reachable_vars);
            }
        }
    }

    let mut changed = true;
    while changed {
        changed = false;
        for (i, hp) in p.sigma.iter().enumerate() {
            if reachable[i] {
                continue;
            }
            let root = hp.root();
            let hit = anchored(hp)
                || frontier_exps.iter().any(|e| e == root)
                || root.fv().iter().any(|id| reachable_vars.contains(id));
            if !hit {
                continue;
            }
            reachable[i] = true;
            changed = true;
            // Everything stored in a reachable cell is reachable.
            let mut fv = BTreeSet::new();
            hp.fv_into(&mut fv);
            reachable_vars.extend(fv);
            match hp {
                Hpred::Hpointsto(_, se, _) => collect_leaf_exps(se, &mut frontier_exps),
                Hpred::Hlseg(_, _, _, e_to, shared) => {
                    frontier_exps.push(e_to.clone());
                    frontier_exps.extend(shared.iter().cloned());
                }
                Hpred::Hdllseg(_, _, _, o_b, o_f, i_b, shared) => {
                    frontier_exps.push(o_b.clone());
                    frontier_exps.push(o_f.clone());
                    frontier_exps.push(i_b.clone());
                    frontier_exps.extend(shared.iter().cloned());
                }
            }
        }
    }

    let mut kept = Vec::new();
    let mut leaked = Vec::new();
    for (i, hp) in p.sigma.into_iter().enumerate() {
        if reachable[i] {
            kept.push(hp);
        } else {
            leaked.push(hp);
        }
    }

    // Drop attributes whose carrier died with the leaked cells.
    let dead_roots: Vec<Exp> = leaked.iter().map(|hp| hp.root().clone()).collect();
    let mut pruned = Prop {
        sub: p.sub,
        pi: p.pi,
        sigma: kept,
        pi_fp: p.pi_fp,
        sigma_fp: p.sigma_fp,
    };
    pruned.pi.retain(|a| match a.as_attribute() {
        Some((carrier, _)) => !dead_roots.contains(carrier),
        None => true,
    });
    (pruned.normalize(), leaked)
}

fn collect_leaf_exps(se: &Strexp, out: &mut Vec<Exp>) {
    match se {
        Strexp::Eexp(e, _) => out.push(e.clone()),
        Strexp::Estruct(fields, _) => {
            for (_, sub) in fields {
                collect_leaf_exps(sub, out);
            }
        }
        Strexp::Earray(_, elems, _) => {
            for (_, sub) in elems {
                collect_leaf_exps(sub, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalysisConfig;
    use crate::features::prover;
    use crate::shared::models::{IdentGenerator, Pvar, Typ};

    fn ctx() -> AnalysisContext {
        AnalysisContext::new(AnalysisConfig::default())
    }

    fn node_cell(root: Exp, next: Exp) -> Hpred {
        Hpred::Hpointsto(
            root,
            Strexp::Estruct(
                vec![("next".to_string(), Strexp::Eexp(next, Inst::None))],
                Inst::None,
            ),
            Exp::sizeof(Typ::Struct("node".to_string())),
        )
    }

    #[test]
    fn test_chain_folds_to_lseg() {
        let mut ctx = ctx();
        let mut gen = IdentGenerator::new();
        let x = Exp::Lvar(Pvar::local("x", "f"));
        let y = Exp::var(gen.fresh(IdentKind::Primed));

        let p = Prop::emp().sigma_star(vec![
            node_cell(x.clone(), y.clone()),
            node_cell(y.clone(), Exp::zero()),
        ]);

        let res = abstract_prop(&mut ctx, &p).unwrap();
        assert_eq!(res.prop.sigma.len(), 1);
        match &res.prop.sigma[0] {
            Hpred::Hlseg(LsegKind::NE, _, from, to, _) => {
                assert_eq!(from, &x);
                assert_eq!(to, &Exp::zero());
            }
            other => panic!("expected folded lseg, got {}", other),
        }
        assert!(res.leaked.is_empty());
    }

    #[test]
    fn test_garbage_cell_is_leaked() {
        let mut ctx = ctx();
        let mut gen = IdentGenerator::new();
        let dead = Exp::var(gen.fresh(IdentKind::Primed));

        let p = Prop::emp().sigma_star(vec![Hpred::Hpointsto(
            dead,
            Strexp::exp(Exp::zero()),
            Exp::sizeof(Typ::Int),
        )]);

        let res = abstract_prop(&mut ctx, &p).unwrap();
        assert!(res.prop.sigma.is_empty());
        assert_eq!(res.leaked.len(), 1);
    }

    #[test]
    fn test_reachable_cell_survives() {
        let mut ctx = ctx();
        let mut gen = IdentGenerator::new();
        let x = Exp::Lvar(Pvar::local("x", "f"));
        let v = Exp::var(gen.fresh(IdentKind::Primed));

        // x |-> v * v |-> 0 : the second cell is reachable through x.
        let p = Prop::emp().sigma_star(vec![
            Hpred::Hpointsto(x, Strexp::exp(v.clone()), Exp::sizeof(Typ::ptr_to(Typ::Int))),
            Hpred::Hpointsto(v, Strexp::exp(Exp::zero()), Exp::sizeof(Typ::Int)),
        ]);

        let res = abstract_prop(&mut ctx, &p).unwrap();
        assert_eq!(res.prop.sigma.len(), 2);
        assert!(res.leaked.is_empty());
    }

    #[test]
    fn test_abstraction_is_monotone_weakening() {
        // After folding, the segment endpoints keep their pure facts: the
        // abstracted prop must not become inconsistent.
        let mut ctx = ctx();
        let mut gen = IdentGenerator::new();
        let x = Exp::Lvar(Pvar::local("x", "f"));
        let y = Exp::var(gen.fresh(IdentKind::Primed));

        let p = Prop::emp()
            .sigma_star(vec![
                node_cell(x.clone(), y.clone()),
                node_cell(y, Exp::zero()),
            ])
            .conjoin_neq(x.clone(), Exp::zero());

        let res = abstract_prop(&mut ctx, &p).unwrap();
        assert!(!prover::check_inconsistency(&res.prop));
        assert!(prover::check_disequal(&res.prop, &x, &Exp::zero()));
    }
}
