//! Idempotent substitutions over identifiers

use crate::shared::models::{Exp, Ident};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A substitution `Ident -> Exp`, kept sorted by identifier and idempotent
/// (no identifier in the domain occurs free in any range expression).
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Subst {
    pairs: Vec<(Ident, Exp)>,
}

impl Subst {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a substitution from arbitrary pairs: later duplicates lose,
    /// ranges are rewritten until the result is idempotent, identity pairs
    /// are dropped.
    pub fn from_pairs(pairs: Vec<(Ident, Exp)>) -> Self {
        let mut sub = Subst { pairs };
        sub.pairs.sort_by(|a, b| a.0.cmp(&b.0));
        sub.pairs.dedup_by(|a, b| a.0 == b.0);
        sub.make_idempotent();
        sub
    }

    fn make_idempotent(&mut self) {
        // Each round rewrites ranges with the current pairs; the number of
        // rounds is bounded by the domain size (cyclic bindings stabilize
        // because a pair rewriting to itself is dropped).
        for _ in 0..=self.pairs.len() {
            let snapshot = self.clone();
            let mut changed = false;
            for (id, exp) in self.pairs.iter_mut() {
                let rewritten = snapshot.apply_exp_skipping(exp, id);
                if rewritten != *exp {
                    *exp = rewritten;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        self.pairs.retain(|(id, exp)| !matches!(exp, Exp::Var(v) if v == id));
    }

    /// Apply, treating `skip` as unbound (prevents self-rewriting loops).
    fn apply_exp_skipping(&self, exp: &Exp, skip: &Ident) -> Exp {
        match exp {
            Exp::Var(id) if id != skip => match self.lookup(id) {
                Some(e) => e.clone(),
                None => exp.clone(),
            },
            Exp::Var(_) | Exp::Const(_) | Exp::Lvar(_) | Exp::Sizeof(_, _) => exp.clone(),
            Exp::UnOp(op, e) => Exp::UnOp(*op, Box::new(self.apply_exp_skipping(e, skip))),
            Exp::BinOp(op, a, b) => Exp::BinOp(
                *op,
                Box::new(self.apply_exp_skipping(a, skip)),
                Box::new(self.apply_exp_skipping(b, skip)),
            ),
            Exp::Cast(t, e) => Exp::Cast(t.clone(), Box::new(self.apply_exp_skipping(e, skip))),
            Exp::Lfield(base, f, t) => Exp::Lfield(
                Box::new(self.apply_exp_skipping(base, skip)),
                f.clone(),
                t.clone(),
            ),
            Exp::Lindex(base, idx) => Exp::Lindex(
                Box::new(self.apply_exp_skipping(base, skip)),
                Box::new(self.apply_exp_skipping(idx, skip)),
            ),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn lookup(&self, id: &Ident) -> Option<&Exp> {
        self.pairs
            .binary_search_by(|(k, _)| k.cmp(id))
            .ok()
            .map(|i| &self.pairs[i].1)
    }

    pub fn domain(&self) -> impl Iterator<Item = &Ident> {
        self.pairs.iter().map(|(id, _)| id)
    }

    pub fn pairs(&self) -> &[(Ident, Exp)] {
        &self.pairs
    }

    /// Add one binding, re-establishing idempotency.
    pub fn extend(&self, id: Ident, exp: Exp) -> Subst {
        let mut pairs = self.pairs.clone();
        pairs.retain(|(k, _)| *k != id);
        pairs.push((id, exp));
        Subst::from_pairs(pairs)
    }

    /// Left-biased union of two substitutions.
    pub fn join(&self, other: &Subst) -> Subst {
        let mut pairs = self.pairs.clone();
        for (id, exp) in &other.pairs {
            if self.lookup(id).is_none() {
                pairs.push((id.clone(), exp.clone()));
            }
        }
        Subst::from_pairs(pairs)
    }

    /// Apply this substitution to an expression.
    pub fn apply_exp(&self, exp: &Exp) -> Exp {
        if self.pairs.is_empty() {
            return exp.clone();
        }
        match exp {
            Exp::Var(id) => match self.lookup(id) {
                Some(e) => e.clone(),
                None => exp.clone(),
            },
            Exp::Const(_) | Exp::Lvar(_) | Exp::Sizeof(_, _) => exp.clone(),
            Exp::UnOp(op, e) => Exp::UnOp(*op, Box::new(self.apply_exp(e))),
            Exp::BinOp(op, a, b) => {
                Exp::BinOp(*op, Box::new(self.apply_exp(a)), Box::new(self.apply_exp(b)))
            }
            Exp::Cast(t, e) => Exp::Cast(t.clone(), Box::new(self.apply_exp(e))),
            Exp::Lfield(base, f, t) => {
                Exp::Lfield(Box::new(self.apply_exp(base)), f.clone(), t.clone())
            }
            Exp::Lindex(base, idx) => {
                Exp::Lindex(Box::new(self.apply_exp(base)), Box::new(self.apply_exp(idx)))
            }
        }
    }

    /// Free identifiers of all range expressions.
    pub fn range_fv(&self) -> BTreeSet<Ident> {
        let mut acc = BTreeSet::new();
        for (_, exp) in &self.pairs {
            exp.fv_into(&mut acc);
        }
        acc
    }
}

impl fmt::Display for Subst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (id, exp)) in self.pairs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} -> {}", id, exp)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::{IdentGenerator, IdentKind};

    #[test]
    fn test_idempotent_chain() {
        let mut gen = IdentGenerator::new();
        let a = gen.fresh(IdentKind::Normal);
        let b = gen.fresh(IdentKind::Normal);
        // a -> b, b -> 7 must collapse to a -> 7, b -> 7.
        let sub = Subst::from_pairs(vec![
            (a.clone(), Exp::var(b.clone())),
            (b.clone(), Exp::int(7)),
        ]);
        assert_eq!(sub.apply_exp(&Exp::var(a)), Exp::int(7));
        assert_eq!(sub.apply_exp(&Exp::var(b)), Exp::int(7));
    }

    #[test]
    fn test_identity_pairs_dropped() {
        let mut gen = IdentGenerator::new();
        let a = gen.fresh(IdentKind::Normal);
        let sub = Subst::from_pairs(vec![(a.clone(), Exp::var(a))]);
        assert!(sub.is_empty());
    }

    #[test]
    fn test_extend_rewrites_existing_ranges() {
        let mut gen = IdentGenerator::new();
        let a = gen.fresh(IdentKind::Normal);
        let b = gen.fresh(IdentKind::Normal);
        let sub = Subst::from_pairs(vec![(a.clone(), Exp::var(b.clone()))]);
        let sub = sub.extend(b.clone(), Exp::int(3));
        assert_eq!(sub.apply_exp(&Exp::var(a)), Exp::int(3));
    }

    #[test]
    fn test_apply_descends_into_offsets() {
        let mut gen = IdentGenerator::new();
        let a = gen.fresh(IdentKind::Normal);
        let sub = Subst::from_pairs(vec![(a.clone(), Exp::int(2))]);
        let e = Exp::index(Exp::var(a.clone()), Exp::var(a));
        assert_eq!(sub.apply_exp(&e), Exp::index(Exp::int(2), Exp::int(2)));
    }
}
