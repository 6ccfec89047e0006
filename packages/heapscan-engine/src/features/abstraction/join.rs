//! Proposition and path-set join
//!
//! The join is a semantic widening used at CFG join points and when posts
//! are grouped under a precondition: two propositions whose heaps agree
//! (up to canonical renaming of existentials) merge into one whose pure
//! part keeps only the facts both sides had. `p1 |= join(p1, p2)` and
//! `p2 |= join(p1, p2)` hold by construction.

use super::collect_garbage;
use crate::features::driver::path::{Path, PathSet};
use crate::features::prop::{Prop, Subst};
use crate::shared::models::{Exp, Ident, IdentKind};

/// Rename primed identifiers to a canonical numbering so alpha-equivalent
/// propositions compare equal.
pub fn canonical_rename_primed(p: &Prop) -> Prop {
    let primed: Vec<Ident> = p
        .fav_all()
        .into_iter()
        .filter(|id| id.is_primed())
        .collect();
    let pairs = primed
        .into_iter()
        .enumerate()
        .map(|(i, id)| {
            (
                id,
                Exp::var(Ident::new(IdentKind::Primed, "p", i as u64)),
            )
        })
        .collect();
    p.rename_with(&Subst::from_pairs(pairs))
}

/// Join two propositions, or `None` when their heaps disagree.
pub fn prop_partial_join(p1: &Prop, p2: &Prop) -> Option<Prop> {
    let c1 = canonical_rename_primed(p1);
    let c2 = canonical_rename_primed(p2);

    if c1.sigma != c2.sigma || c1.sigma_fp != c2.sigma_fp || c1.pi_fp != c2.pi_fp {
        return None;
    }

    let pi = c1
        .pi
        .iter()
        .filter(|a| c2.pi.contains(a))
        .cloned()
        .collect();

    Some(
        Prop {
            sub: Subst::empty(),
            pi,
            sigma: c1.sigma,
            pi_fp: c1.pi_fp,
            sigma_fp: c1.sigma_fp,
        }
        .normalize(),
    )
}

/// Join an incoming path set into an accumulated one: each incoming
/// proposition merges with the first joinable partner, or is appended as a
/// new disjunct.
pub fn pathset_join(acc: &PathSet, incoming: &PathSet) -> PathSet {
    let mut entries: Vec<(Prop, Path)> = acc.entries().to_vec();

    for (prop, path) in incoming.iter() {
        let mut joined = false;
        for (existing, existing_path) in entries.iter_mut() {
            if let Some(merged) = prop_partial_join(existing, prop) {
                *existing = merged;
                *existing_path = Path::join(existing_path, path);
                joined = true;
                break;
            }
        }
        if !joined {
            entries.push((prop.clone(), path.clone()));
        }
    }

    let mut out = PathSet::new();
    for (prop, path) in entries {
        out.add(prop, path);
    }
    out
}

/// Drop disjuncts subsumed by a weaker one already present: same heap,
/// strictly fewer pure facts.
pub fn pathset_collapse(ps: &PathSet) -> PathSet {
    let entries: Vec<(Prop, Path)> = ps.entries().to_vec();
    let canon: Vec<Prop> = entries
        .iter()
        .map(|(p, _)| canonical_rename_primed(p))
        .collect();

    let mut keep = vec![true; entries.len()];
    for i in 0..entries.len() {
        if !keep[i] {
            continue;
        }
        for j in 0..entries.len() {
            if i == j || !keep[j] {
                continue;
            }
            // j subsumes i when the heaps agree and j's pure facts are a
            // subset of i's.
            let (ci, cj) = (&canon[i], &canon[j]);
            if ci.sigma == cj.sigma
                && ci.sigma_fp == cj.sigma_fp
                && ci.pi_fp == cj.pi_fp
                && cj.pi.iter().all(|a| ci.pi.contains(a))
                && cj.pi.len() < ci.pi.len()
            {
                keep[i] = false;
                break;
            }
        }
    }

    let mut out = PathSet::new();
    for (i, (prop, path)) in entries.into_iter().enumerate() {
        if keep[i] {
            out.add(prop, path);
        }
    }
    out
}

/// Collapse a set of postconditions under one precondition: join what can
/// be joined, garbage-collect the rest.
pub fn posts_collapse(posts: &PathSet) -> PathSet {
    let joined = pathset_join(&PathSet::new(), posts);
    let collapsed = pathset_collapse(&joined);
    collapsed.filter_map_props(|p| {
        let (q, _) = collect_garbage(p.clone());
        Some(q)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::prop::{Hpred, Strexp};
    use crate::features::prover;
    use crate::shared::models::{IdentGenerator, Pvar, Typ};

    fn cell(root: Exp, v: Exp) -> Hpred {
        Hpred::Hpointsto(root, Strexp::exp(v), Exp::sizeof(Typ::Int))
    }

    #[test]
    fn test_join_drops_disagreeing_pure_facts() {
        let x = Exp::Lvar(Pvar::local("x", "f"));
        let mut gen = IdentGenerator::new();
        let v = Exp::var(gen.fresh(IdentKind::Footprint));

        let base = Prop::emp().sigma_star(vec![cell(x, v.clone())]);
        let p1 = base.conjoin_eq(v.clone(), Exp::int(1));
        let p2 = base.conjoin_eq(v.clone(), Exp::int(2));

        let j = prop_partial_join(&p1, &p2).expect("same heap must join");
        // Neither v=1 nor v=2 survives.
        assert!(!prover::check_equal(&j, &v, &Exp::int(1)));
        assert!(!prover::check_equal(&j, &v, &Exp::int(2)));
        // Both inputs entail the join.
        assert!(j.pi.iter().all(|a| p1.pi.contains(a)));
        assert!(j.pi.iter().all(|a| p2.pi.contains(a)));
    }

    #[test]
    fn test_join_refuses_different_heaps() {
        let x = Exp::Lvar(Pvar::local("x", "f"));
        let y = Exp::Lvar(Pvar::local("y", "f"));
        let p1 = Prop::emp().sigma_star(vec![cell(x, Exp::zero())]);
        let p2 = Prop::emp().sigma_star(vec![cell(y, Exp::zero())]);
        assert!(prop_partial_join(&p1, &p2).is_none());
    }

    #[test]
    fn test_join_identifies_alpha_equivalent_heaps() {
        let x = Exp::Lvar(Pvar::local("x", "f"));
        let mut gen = IdentGenerator::new();
        // Same shape, differently-stamped existentials.
        let v1 = Exp::var(gen.fresh(IdentKind::Primed));
        let _skip = gen.fresh(IdentKind::Primed);
        let v2 = Exp::var(gen.fresh(IdentKind::Primed));

        let p1 = Prop::emp().sigma_star(vec![cell(x.clone(), v1)]);
        let p2 = Prop::emp().sigma_star(vec![cell(x, v2)]);
        let j = prop_partial_join(&p1, &p2);
        assert!(j.is_some());
    }

    #[test]
    fn test_pathset_join_merges_and_appends() {
        let x = Exp::Lvar(Pvar::local("x", "f"));
        let y = Exp::Lvar(Pvar::local("y", "f"));
        let mut gen = IdentGenerator::new();
        let v = Exp::var(gen.fresh(IdentKind::Footprint));

        let base = Prop::emp().sigma_star(vec![cell(x, v.clone())]);
        let other = Prop::emp().sigma_star(vec![cell(y, Exp::zero())]);

        let mut acc = PathSet::new();
        acc.add(base.conjoin_eq(v.clone(), Exp::int(1)), Path::start(0));

        let mut incoming = PathSet::new();
        incoming.add(base.conjoin_eq(v.clone(), Exp::int(2)), Path::start(1));
        incoming.add(other, Path::start(2));

        let joined = pathset_join(&acc, &incoming);
        // First two merge, the third stays separate.
        assert_eq!(joined.len(), 2);
    }

    #[test]
    fn test_pathset_collapse_removes_subsumed() {
        let x = Exp::Lvar(Pvar::local("x", "f"));
        let mut gen = IdentGenerator::new();
        let v = Exp::var(gen.fresh(IdentKind::Footprint));

        let weak = Prop::emp().sigma_star(vec![cell(x, v.clone())]);
        let strong = weak.conjoin_eq(v, Exp::int(1));

        let mut ps = PathSet::new();
        ps.add(strong, Path::start(0));
        ps.add(weak.clone(), Path::start(1));

        let collapsed = pathset_collapse(&ps);
        assert_eq!(collapsed.len(), 1);
        assert!(collapsed.contains(&weak));
    }
}
