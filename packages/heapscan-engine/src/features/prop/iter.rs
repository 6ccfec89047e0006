//! Proposition iterator
//!
//! Focuses one hpred of `sigma` while carrying the rest of the state.
//! Rearrangement works exclusively through iterators: it finds the hpred
//! rooted at an access path, reshapes it in place, and rebuilds the
//! proposition.

use super::hpred::Hpred;
use super::prop::{Atom, Prop};
use super::sub::Subst;
use crate::shared::models::{Exp, FieldName, Typ};
use serde::{Deserialize, Serialize};

/// One step of an access path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Offset {
    Fld(FieldName, Typ),
    Index(Exp),
}

impl Offset {
    /// Decompose an lvalue expression into its root and offset list.
    pub fn path_of(lexp: &Exp) -> (Exp, Vec<Offset>) {
        let mut offsets = Vec::new();
        let mut cur = lexp;
        loop {
            match cur {
                Exp::Lfield(base, f, t) => {
                    offsets.push(Offset::Fld(f.clone(), t.clone()));
                    cur = base;
                }
                Exp::Lindex(base, idx) => {
                    offsets.push(Offset::Index((**idx).clone()));
                    cur = base;
                }
                Exp::Cast(_, e) => cur = e,
                _ => break,
            }
        }
        offsets.reverse();
        (cur.clone(), offsets)
    }
}

/// A proposition with one focused hpred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropIter {
    pub before: Vec<Hpred>,
    pub curr: Hpred,
    pub after: Vec<Hpred>,
    pub pi: Vec<Atom>,
    pub sub: Subst,
    pub pi_fp: Vec<Atom>,
    pub sigma_fp: Vec<Hpred>,
    /// Offset path that led rearrangement to the focused hpred.
    pub state: Vec<Offset>,
}

impl PropIter {
    /// Focus the `idx`-th hpred of `prop.sigma`.
    pub fn from_prop(prop: &Prop, idx: usize) -> Option<PropIter> {
        if idx >= prop.sigma.len() {
            return None;
        }
        let mut sigma = prop.sigma.clone();
        let after = sigma.split_off(idx + 1);
        let curr = sigma.pop().expect("idx < len");
        Some(PropIter {
            before: sigma,
            curr,
            after,
            pi: prop.pi.clone(),
            sub: prop.sub.clone(),
            pi_fp: prop.pi_fp.clone(),
            sigma_fp: prop.sigma_fp.clone(),
            state: Vec::new(),
        })
    }

    /// Focus the first hpred satisfying `pred`.
    pub fn find(prop: &Prop, mut pred: impl FnMut(&Hpred) -> bool) -> Option<PropIter> {
        let idx = prop.sigma.iter().position(|hp| pred(hp))?;
        Self::from_prop(prop, idx)
    }

    /// Rebuild the proposition.
    pub fn to_prop(&self) -> Prop {
        let mut sigma = self.before.clone();
        sigma.push(self.curr.clone());
        sigma.extend(self.after.iter().cloned());
        Prop {
            sub: self.sub.clone(),
            pi: self.pi.clone(),
            sigma,
            pi_fp: self.pi_fp.clone(),
            sigma_fp: self.sigma_fp.clone(),
        }
        .normalize()
    }

    /// Replace the focused hpred.
    pub fn update_current(&mut self, hpred: Hpred) {
        self.curr = hpred;
    }

    /// Insert an hpred just before the focus (the focus is unchanged).
    pub fn prev_then_insert(&mut self, hpred: Hpred) {
        self.before.push(hpred);
    }

    /// Drop the focused hpred and rebuild the proposition.
    pub fn remove_curr_then_to_prop(self) -> Prop {
        let mut sigma = self.before;
        sigma.extend(self.after);
        Prop {
            sub: self.sub,
            pi: self.pi,
            sigma,
            pi_fp: self.pi_fp,
            sigma_fp: self.sigma_fp,
        }
        .normalize()
    }

    /// Conjoin a pure atom to the carried state.
    pub fn add_atom(&mut self, atom: Atom) {
        self.pi.push(atom);
    }

    /// Extend the footprint carried by the iterator.
    pub fn add_footprint(&mut self, pi: Vec<Atom>, sigma: Vec<Hpred>) {
        self.pi_fp.extend(pi);
        self.sigma_fp.extend(sigma);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::prop::strexp::Strexp;
    use crate::shared::models::{IdentGenerator, IdentKind, Pvar};

    fn two_cell_prop(gen: &mut IdentGenerator) -> Prop {
        let x = Exp::Lvar(Pvar::local("x", "f"));
        let y = Exp::Lvar(Pvar::local("y", "f"));
        Prop::emp().sigma_star(vec![
            Hpred::Hpointsto(x, Strexp::exp(Exp::int(1)), Exp::sizeof(Typ::Int)),
            Hpred::Hpointsto(y, Strexp::exp(Exp::var(gen.fresh(IdentKind::Primed))), Exp::sizeof(Typ::Int)),
        ])
    }

    #[test]
    fn test_find_and_rebuild_preserves_prop() {
        let mut gen = IdentGenerator::new();
        let p = two_cell_prop(&mut gen);
        let iter = PropIter::find(&p, |hp| {
            matches!(hp.root(), Exp::Lvar(pv) if pv.name == "y")
        })
        .unwrap();
        assert_eq!(iter.to_prop(), p);
    }

    #[test]
    fn test_remove_curr() {
        let mut gen = IdentGenerator::new();
        let p = two_cell_prop(&mut gen);
        let iter = PropIter::find(&p, |hp| {
            matches!(hp.root(), Exp::Lvar(pv) if pv.name == "x")
        })
        .unwrap();
        let q = iter.remove_curr_then_to_prop();
        assert_eq!(q.sigma.len(), 1);
    }

    #[test]
    fn test_offset_path_decomposition() {
        let base = Exp::Lvar(Pvar::local("p", "f"));
        let lexp = Exp::index(
            Exp::field(base.clone(), "data", Typ::Int),
            Exp::int(3),
        );
        let (root, offsets) = Offset::path_of(&lexp);
        assert_eq!(root, base);
        assert_eq!(offsets.len(), 2);
        assert!(matches!(&offsets[0], Offset::Fld(f, _) if f == "data"));
        assert!(matches!(&offsets[1], Offset::Index(e) if *e == Exp::int(3)));
    }
}
