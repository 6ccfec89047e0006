//! Propositions: symbolic states
//!
//! Normal-form invariants maintained by [`Prop::normalize`]:
//! - the substitution is idempotent and already applied (`sub(p) = p`),
//! - atoms and hpreds are constant-folded, sorted and deduplicated,
//! - no primed identifier occurs free in the footprint,
//! - at most one attribute per category is attached to an expression.
//!
//! Construction is builder-style: every rewriting step returns a new
//! proposition.

use super::hpred::Hpred;
use super::strexp::Strexp;
use super::sub::Subst;
use crate::shared::models::{
    Attribute, AttributeCategory, Const, Exp, Ident, IdentGenerator, IdentKind,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A pure fact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Atom {
    Eq(Exp, Exp),
    Neq(Exp, Exp),
}

impl Atom {
    pub fn eq(a: Exp, b: Exp) -> Self {
        Atom::Eq(a, b)
    }

    pub fn neq(a: Exp, b: Exp) -> Self {
        Atom::Neq(a, b)
    }

    pub fn apply_sub(&self, sub: &Subst) -> Atom {
        match self {
            Atom::Eq(a, b) => Atom::Eq(sub.apply_exp(a), sub.apply_exp(b)),
            Atom::Neq(a, b) => Atom::Neq(sub.apply_exp(a), sub.apply_exp(b)),
        }
    }

    pub fn fv_into(&self, acc: &mut BTreeSet<Ident>) {
        match self {
            Atom::Eq(a, b) | Atom::Neq(a, b) => {
                a.fv_into(acc);
                b.fv_into(acc);
            }
        }
    }

    /// Fold constants and orient so the smaller side comes first.
    pub fn normalize(self) -> Atom {
        match self {
            Atom::Eq(a, b) => {
                let (a, b) = (a.fold_const(), b.fold_const());
                if a <= b {
                    Atom::Eq(a, b)
                } else {
                    Atom::Eq(b, a)
                }
            }
            Atom::Neq(a, b) => {
                let (a, b) = (a.fold_const(), b.fold_const());
                // Attribute atoms keep the carrier on the left.
                if matches!(b, Exp::Const(Const::Attr(_))) || a <= b {
                    Atom::Neq(a, b)
                } else {
                    Atom::Neq(b, a)
                }
            }
        }
    }

    /// `e != ATTR(a)` encodes attribute `a` on `e`.
    pub fn as_attribute(&self) -> Option<(&Exp, &Attribute)> {
        match self {
            Atom::Neq(e, Exp::Const(Const::Attr(a))) => Some((e, a)),
            _ => None,
        }
    }

    pub fn is_attribute(&self) -> bool {
        self.as_attribute().is_some()
    }

    /// Trivially true after folding (e.g. `0 != 1`, `x = x`).
    pub fn is_trivially_true(&self) -> bool {
        match self {
            Atom::Eq(a, b) => a == b,
            Atom::Neq(a, b) => match (a.as_int(), b.as_int()) {
                (Some(x), Some(y)) => x != y,
                _ => false,
            },
        }
    }

    /// Self-contradictory after folding (e.g. `0 = 1`, `x != x`).
    pub fn is_trivially_false(&self) -> bool {
        match self {
            Atom::Eq(a, b) => match (a.as_int(), b.as_int()) {
                (Some(x), Some(y)) => x != y,
                _ => false,
            },
            Atom::Neq(a, b) => !self.is_attribute() && a == b,
        }
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atom::Eq(a, b) => write!(f, "{} = {}", a, b),
            Atom::Neq(a, b) => write!(f, "{} != {}", a, b),
        }
    }
}

/// A proposition: the symbolic state of one path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Prop {
    pub sub: Subst,
    pub pi: Vec<Atom>,
    pub sigma: Vec<Hpred>,
    pub pi_fp: Vec<Atom>,
    pub sigma_fp: Vec<Hpred>,
}

impl Prop {
    /// `emp`: empty heap, no facts.
    pub fn emp() -> Self {
        Self::default()
    }

    /// Establish the normal form.
    pub fn normalize(mut self) -> Prop {
        loop {
            // Apply the substitution everywhere.
            self.pi = self
                .pi
                .iter()
                .map(|a| a.apply_sub(&self.sub).normalize())
                .collect();
            self.sigma = self
                .sigma
                .iter()
                .map(|hp| hp.apply_sub(&self.sub).normalize())
                .collect();
            self.pi_fp = self
                .pi_fp
                .iter()
                .map(|a| a.apply_sub(&self.sub).normalize())
                .collect();
            self.sigma_fp = self
                .sigma_fp
                .iter()
                .map(|hp| hp.apply_sub(&self.sub).normalize())
                .collect();

            // Promote variable equalities into the substitution.
            let mut promoted = None;
            for (i, atom) in self.pi.iter().enumerate() {
                if let Atom::Eq(a, b) = atom {
                    if let Some((id, exp)) = Self::orient_eq(a, b) {
                        promoted = Some((i, id, exp));
                        break;
                    }
                }
            }
            match promoted {
                Some((i, id, exp)) => {
                    self.pi.remove(i);
                    self.sub = self.sub.extend(id, exp);
                }
                None => break,
            }
        }

        self.pi.retain(|a| !a.is_trivially_true());
        self.pi.sort();
        self.pi.dedup();
        self.sigma.sort();
        self.sigma.dedup();
        self.pi_fp.retain(|a| !a.is_trivially_true());
        self.pi_fp.sort();
        self.pi_fp.dedup();
        self.sigma_fp.sort();
        self.sigma_fp.dedup();
        self
    }

    /// Which side of `a = b` can be bound in the substitution. Footprint
    /// identifiers stay in `pi` so the footprint keeps only
    /// footprint-kind variables.
    fn orient_eq(a: &Exp, b: &Exp) -> Option<(Ident, Exp)> {
        let bindable = |id: &Ident| matches!(id.kind, IdentKind::Normal | IdentKind::Primed);
        match (a, b) {
            (Exp::Var(x), Exp::Var(y)) if bindable(x) && bindable(y) => {
                // Deterministic direction: larger ident rewritten to smaller.
                if x > y {
                    Some((x.clone(), Exp::var(y.clone())))
                } else {
                    Some((y.clone(), Exp::var(x.clone())))
                }
            }
            (Exp::Var(x), e) if bindable(x) && !e.fv().contains(x) => {
                Some((x.clone(), e.clone()))
            }
            (e, Exp::Var(x)) if bindable(x) && !e.fv().contains(x) => {
                Some((x.clone(), e.clone()))
            }
            _ => None,
        }
    }

    /// Conjoin one atom.
    pub fn atom_and(&self, atom: Atom) -> Prop {
        let mut p = self.clone();
        p.pi.push(atom);
        p.normalize()
    }

    pub fn conjoin_eq(&self, a: Exp, b: Exp) -> Prop {
        self.atom_and(Atom::Eq(a, b))
    }

    pub fn conjoin_neq(&self, a: Exp, b: Exp) -> Prop {
        self.atom_and(Atom::Neq(a, b))
    }

    /// Star extra hpreds onto the current heap.
    pub fn sigma_star(&self, hpreds: Vec<Hpred>) -> Prop {
        let mut p = self.clone();
        p.sigma.extend(hpreds);
        p.normalize()
    }

    /// Star extra assumptions onto the footprint.
    pub fn footprint_star(&self, pi: Vec<Atom>, sigma: Vec<Hpred>) -> Prop {
        let mut p = self.clone();
        p.pi_fp.extend(pi);
        p.sigma_fp.extend(sigma);
        p.normalize()
    }

    /// Replace the current heap.
    pub fn with_sigma(&self, sigma: Vec<Hpred>) -> Prop {
        let mut p = self.clone();
        p.sigma = sigma;
        p.normalize()
    }

    /// A proposition whose current parts are this one's footprint.
    pub fn extract_footprint(&self) -> Prop {
        Prop {
            sub: Subst::empty(),
            pi: self.pi_fp.clone(),
            sigma: self.sigma_fp.clone(),
            pi_fp: Vec::new(),
            sigma_fp: Vec::new(),
        }
        .normalize()
    }

    /// Drop the footprint parts.
    pub fn without_footprint(&self) -> Prop {
        Prop {
            sub: self.sub.clone(),
            pi: self.pi.clone(),
            sigma: self.sigma.clone(),
            pi_fp: Vec::new(),
            sigma_fp: Vec::new(),
        }
        .normalize()
    }

    /// Free identifiers of the current parts.
    pub fn fav(&self) -> BTreeSet<Ident> {
        let mut acc = BTreeSet::new();
        for a in &self.pi {
            a.fv_into(&mut acc);
        }
        for hp in &self.sigma {
            hp.fv_into(&mut acc);
        }
        acc.extend(self.sub.range_fv());
        acc
    }

    /// Free identifiers of the footprint parts.
    pub fn fav_footprint(&self) -> BTreeSet<Ident> {
        let mut acc = BTreeSet::new();
        for a in &self.pi_fp {
            a.fv_into(&mut acc);
        }
        for hp in &self.sigma_fp {
            hp.fv_into(&mut acc);
        }
        acc
    }

    /// All free identifiers.
    pub fn fav_all(&self) -> BTreeSet<Ident> {
        let mut acc = self.fav();
        acc.extend(self.fav_footprint());
        acc
    }

    /// Check the footprint discipline: every footprint free variable is of
    /// footprint kind.
    pub fn footprint_vars_ok(&self) -> bool {
        self.fav_footprint().iter().all(|id| id.is_footprint())
    }

    // ── Attributes ────────────────────────────────────────────────────

    /// All attributes attached to `e`.
    pub fn get_attributes(&self, e: &Exp) -> Vec<&Attribute> {
        self.pi
            .iter()
            .filter_map(|a| a.as_attribute())
            .filter(|(carrier, _)| *carrier == e)
            .map(|(_, attr)| attr)
            .collect()
    }

    pub fn has_attribute(&self, e: &Exp, pred: impl Fn(&Attribute) -> bool) -> bool {
        self.get_attributes(e).into_iter().any(pred)
    }

    /// Attach `attr` to `e`, replacing any attribute of the same category.
    pub fn add_attribute(&self, e: Exp, attr: Attribute) -> Prop {
        let category = attr.category();
        let mut p = self.remove_attribute_category(&e, category);
        p.pi
            .push(Atom::Neq(e, Exp::Const(Const::Attr(attr))));
        p.normalize()
    }

    /// Remove any attribute of `category` from `e`.
    pub fn remove_attribute_category(&self, e: &Exp, category: AttributeCategory) -> Prop {
        let mut p = self.clone();
        p.pi.retain(|a| match a.as_attribute() {
            Some((carrier, attr)) => !(carrier == e && attr.category() == category),
            None => true,
        });
        p
    }

    /// Replace every resource attribute whose carrier satisfies `pred`.
    pub fn map_resource_attributes(
        &self,
        mut f: impl FnMut(&Exp, &Attribute) -> Option<Attribute>,
    ) -> Prop {
        let mut p = self.clone();
        for atom in p.pi.iter_mut() {
            if let Atom::Neq(e, Exp::Const(Const::Attr(attr))) = atom {
                if let Some(new_attr) = f(e, attr) {
                    *atom = Atom::Neq(e.clone(), Exp::Const(Const::Attr(new_attr)));
                }
            }
        }
        p.normalize()
    }

    // ── Renaming ──────────────────────────────────────────────────────

    /// Rename the given identifiers to fresh primed variables (existential
    /// quantification of locals leaving scope).
    pub fn exist_quantify(&self, idgen: &mut IdentGenerator, ids: &[Ident]) -> Prop {
        let pairs = ids
            .iter()
            .map(|id| (id.clone(), Exp::var(idgen.fresh(IdentKind::Primed))))
            .collect();
        self.rename_with(&Subst::from_pairs(pairs))
    }

    /// Forget everything known about `id`: its substitution binding is
    /// dropped and remaining free occurrences become a fresh existential.
    /// Used before re-binding an instruction temporary (loop bodies
    /// execute the same load more than once).
    pub fn forget_ident(&self, idgen: &mut IdentGenerator, id: &Ident) -> Prop {
        let mut p = self.clone();
        p.sub = Subst::from_pairs(
            p.sub
                .pairs()
                .iter()
                .filter(|(k, _)| k != id)
                .cloned()
                .collect(),
        );
        let p = p.normalize();
        if p.fav_all().contains(id) {
            p.exist_quantify(idgen, &[id.clone()])
        } else {
            p
        }
    }

    /// Apply a renaming substitution to every part, footprint included.
    pub fn rename_with(&self, ren: &Subst) -> Prop {
        Prop {
            sub: Subst::from_pairs(
                self.sub
                    .pairs()
                    .iter()
                    .map(|(id, e)| (id.clone(), ren.apply_exp(e)))
                    .collect(),
            ),
            pi: self.pi.iter().map(|a| a.apply_sub(ren)).collect(),
            sigma: self.sigma.iter().map(|hp| hp.apply_sub(ren)).collect(),
            pi_fp: self.pi_fp.iter().map(|a| a.apply_sub(ren)).collect(),
            sigma_fp: self.sigma_fp.iter().map(|hp| hp.apply_sub(ren)).collect(),
        }
        .normalize()
    }

    /// Rename every free identifier to a fresh one of the same kind;
    /// returns the renamed proposition. Used when a callee spec is
    /// instantiated at a call site. The recorded substitution is dropped:
    /// in normal form it is already applied, and its stale domain would
    /// otherwise survive the renaming.
    pub fn rename_all_fresh(&self, idgen: &mut IdentGenerator) -> Prop {
        let pairs = self
            .fav_all()
            .into_iter()
            .map(|id| {
                let fresh = idgen.fresh_like(&id);
                (id, Exp::var(fresh))
            })
            .collect();
        let mut renamed = self.rename_with(&Subst::from_pairs(pairs));
        renamed.sub = Subst::empty();
        renamed.normalize()
    }

    /// Find the points-to for `root` in the current heap.
    pub fn find_pointsto(&self, root: &Exp) -> Option<(usize, &Strexp, &Exp)> {
        self.sigma.iter().enumerate().find_map(|(i, hp)| match hp {
            Hpred::Hpointsto(e, se, texp) if e == root => Some((i, se, texp)),
            _ => None,
        })
    }
}

impl fmt::Display for Prop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for a in &self.pi {
            if !first {
                write!(f, " && ")?;
            }
            write!(f, "{}", a)?;
            first = false;
        }
        if !self.sigma.is_empty() {
            if !first {
                write!(f, " && ")?;
            }
            for (i, hp) in self.sigma.iter().enumerate() {
                if i > 0 {
                    write!(f, " * ")?;
                }
                write!(f, "{}", hp)?;
            }
            first = false;
        }
        if first {
            write!(f, "emp")?;
        }
        if !self.pi_fp.is_empty() || !self.sigma_fp.is_empty() {
            write!(f, " [fp:")?;
            for a in &self.pi_fp {
                write!(f, " {}", a)?;
            }
            for hp in &self.sigma_fp {
                write!(f, " {}", hp)?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::prop::strexp::Inst;
    use crate::shared::models::{CallSite, Loc, ResourceKind, Typ};

    fn gen() -> IdentGenerator {
        IdentGenerator::new()
    }

    #[test]
    fn test_normalize_applies_sub_everywhere() {
        let mut g = gen();
        let x = g.fresh(IdentKind::Normal);
        let y = g.fresh(IdentKind::Normal);
        let p = Prop::emp()
            .sigma_star(vec![Hpred::Hpointsto(
                Exp::var(x.clone()),
                Strexp::Eexp(Exp::var(y.clone()), Inst::None),
                Exp::sizeof(Typ::Int),
            )])
            .conjoin_eq(Exp::var(y.clone()), Exp::int(5));

        // y = 5 must be folded into the heap.
        assert!(p.pi.is_empty());
        match &p.sigma[0] {
            Hpred::Hpointsto(_, se, _) => assert_eq!(se.as_exp(), Some(&Exp::int(5))),
            _ => panic!("expected points-to"),
        }
    }

    #[test]
    fn test_normal_form_idempotent() {
        let mut g = gen();
        let x = g.fresh(IdentKind::Normal);
        let p = Prop::emp()
            .conjoin_eq(Exp::var(x.clone()), Exp::int(1))
            .conjoin_neq(Exp::var(x), Exp::int(2));
        let q = p.clone().normalize();
        assert_eq!(p, q, "normalize must be idempotent");
    }

    #[test]
    fn test_footprint_equalities_stay_in_pi() {
        let mut g = gen();
        let f = g.fresh(IdentKind::Footprint);
        let p = Prop::emp().conjoin_eq(Exp::var(f.clone()), Exp::int(3));
        // Footprint ids are not moved into the substitution.
        assert!(p.sub.is_empty());
        assert_eq!(p.pi.len(), 1);
    }

    #[test]
    fn test_attribute_single_instance_per_category() {
        let mut g = gen();
        let x = Exp::var(g.fresh(IdentKind::Normal));
        let acq = Attribute::resource_acquire(
            ResourceKind::Memory,
            CallSite::new("malloc", Loc::dummy()),
        );
        let rel = Attribute::resource_release(
            ResourceKind::Memory,
            CallSite::new("free", Loc::dummy()),
        );
        let p = Prop::emp()
            .add_attribute(x.clone(), acq)
            .add_attribute(x.clone(), rel.clone());

        let attrs = p.get_attributes(&x);
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0], &rel);
    }

    #[test]
    fn test_exist_quantify_renames_to_primed() {
        let mut g = gen();
        let x = g.fresh(IdentKind::Normal);
        let p = Prop::emp().sigma_star(vec![Hpred::Hpointsto(
            Exp::var(x.clone()),
            Strexp::exp(Exp::int(1)),
            Exp::sizeof(Typ::Int),
        )]);
        let q = p.exist_quantify(&mut g, &[x.clone()]);
        let fav = q.fav();
        assert!(!fav.contains(&x));
        assert!(fav.iter().all(|id| id.is_primed()));
    }

    #[test]
    fn test_footprint_discipline_check() {
        let mut g = gen();
        let f = g.fresh(IdentKind::Footprint);
        let p = Prop {
            sigma_fp: vec![Hpred::Hpointsto(
                Exp::var(f),
                Strexp::exp(Exp::zero()),
                Exp::sizeof(Typ::Int),
            )],
            ..Prop::emp()
        };
        assert!(p.footprint_vars_ok());

        let n = g.fresh(IdentKind::Normal);
        let bad = Prop {
            sigma_fp: vec![Hpred::Hpointsto(
                Exp::var(n),
                Strexp::exp(Exp::zero()),
                Exp::sizeof(Typ::Int),
            )],
            ..Prop::emp()
        };
        assert!(!bad.footprint_vars_ok());
    }
}
