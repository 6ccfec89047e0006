//! Decision procedures over propositions
//!
//! All checks are pure functions of their arguments: they never mutate the
//! proposition and are deterministic on identical inputs. Equality
//! reasoning is a congruence closure over the pure part; disequality
//! additionally uses separation (distinct cells in `sigma` occupy disjoint
//! memory, and an allocated cell is never null).
//!
//! Comparisons are encoded as pure atoms over comparison expressions:
//! `a <= b` is the atom `(a <= b) = 1`, which keeps the atom language to
//! equalities and disequalities.

pub mod implication;

pub use implication::{check_implication_for_footprint, Check, ImplOk, ImplResult};

use crate::features::prop::{Atom, Hpred, LsegKind, Prop};
use crate::shared::models::{BinOp, Exp, Tenv, Typ};
use rustc_hash::FxHashMap;

/// Union-find over expressions, seeded from the equalities of a
/// proposition's pure part.
///
/// Integer constants are preferred as class representatives; merging two
/// classes represented by distinct integers records a contradiction.
struct EqClosure {
    parent: FxHashMap<Exp, Exp>,
    contradictory: bool,
}

impl EqClosure {
    fn build(prop: &Prop) -> Self {
        let mut closure = EqClosure {
            parent: FxHashMap::default(),
            contradictory: false,
        };
        for atom in &prop.pi {
            if let Atom::Eq(a, b) = atom {
                closure.union(a.clone(), b.clone());
            }
        }
        closure
    }

    fn find(&mut self, e: &Exp) -> Exp {
        match self.parent.get(e) {
            None => e.clone(),
            Some(p) => {
                let p = p.clone();
                let root = self.find(&p);
                self.parent.insert(e.clone(), root.clone());
                root
            }
        }
    }

    fn union(&mut self, a: Exp, b: Exp) {
        let ra = self.find(&a);
        let rb = self.find(&b);
        if ra == rb {
            return;
        }
        let (keep, drop) = match (ra.as_int(), rb.as_int()) {
            (Some(x), Some(y)) => {
                if x != y {
                    self.contradictory = true;
                }
                (ra, rb)
            }
            (Some(_), None) => (ra, rb),
            (None, Some(_)) => (rb, ra),
            // Deterministic representative: smaller expression wins.
            (None, None) => {
                if ra < rb {
                    (ra, rb)
                } else {
                    (rb, ra)
                }
            }
        };
        self.parent.insert(drop, keep);
    }

    fn same(&mut self, a: &Exp, b: &Exp) -> bool {
        self.find(a) == self.find(b)
    }
}

fn norm(prop: &Prop, e: &Exp) -> Exp {
    prop.sub.apply_exp(e).fold_const()
}

/// Decide `a = b` from the pure part.
pub fn check_equal(prop: &Prop, a: &Exp, b: &Exp) -> bool {
    let a = norm(prop, a);
    let b = norm(prop, b);
    if a == b {
        return true;
    }
    let mut closure = EqClosure::build(prop);
    let ra = closure.find(&a);
    let rb = closure.find(&b);
    if ra == rb {
        return true;
    }
    matches!((ra.as_int(), rb.as_int()), (Some(x), Some(y)) if x == y)
}

/// Decide `a != b` from the pure part plus separation facts.
pub fn check_disequal(prop: &Prop, a: &Exp, b: &Exp) -> bool {
    let a = norm(prop, a);
    let b = norm(prop, b);
    let mut closure = EqClosure::build(prop);
    let ra = closure.find(&a);
    let rb = closure.find(&b);

    if let (Some(x), Some(y)) = (ra.as_int(), rb.as_int()) {
        return x != y;
    }

    // Explicit disequalities (attribute atoms are not disequalities).
    for atom in &prop.pi {
        if let Atom::Neq(x, y) = atom {
            if atom.is_attribute() {
                continue;
            }
            let rx = closure.find(x);
            let ry = closure.find(y);
            if (rx == ra && ry == rb) || (rx == rb && ry == ra) {
                return true;
            }
        }
    }

    // Separation: an allocated root is non-null, and two distinct cells
    // have distinct roots.
    let a_alloc = allocated_root_index(prop, &mut closure, &ra);
    let b_alloc = allocated_root_index(prop, &mut closure, &rb);
    if a_alloc.is_some() && rb.is_zero() {
        return true;
    }
    if b_alloc.is_some() && ra.is_zero() {
        return true;
    }
    if let (Some(i), Some(j)) = (a_alloc, b_alloc) {
        if i != j {
            return true;
        }
    }
    false
}

/// Index of the hpred whose root is `e`, if `e` is provably allocated.
/// Possibly-empty segments do not guarantee allocation.
fn allocated_root_index(prop: &Prop, closure: &mut EqClosure, e: &Exp) -> Option<usize> {
    prop.sigma.iter().position(|hp| match hp {
        Hpred::Hpointsto(root, _, _) => closure.same(root, e),
        Hpred::Hlseg(LsegKind::NE, _, e_from, _, _) => closure.same(e_from, e),
        Hpred::Hdllseg(LsegKind::NE, _, i_f, _, _, _, _) => closure.same(i_f, e),
        _ => false,
    })
}

/// Decide `e = 0`.
pub fn check_zero(prop: &Prop, e: &Exp) -> bool {
    check_equal(prop, e, &Exp::zero())
}

/// Decide `e != 0`.
pub fn check_nonzero(prop: &Prop, e: &Exp) -> bool {
    check_disequal(prop, e, &Exp::zero())
}

/// Is `e` the root of an allocated cell in the current heap?
pub fn check_allocatedness(prop: &Prop, e: &Exp) -> bool {
    let e = norm(prop, e);
    let mut closure = EqClosure::build(prop);
    let re = closure.find(&e);
    allocated_root_index(prop, &mut closure, &re).is_some()
}

/// Decide a single atom.
pub fn check_atom(prop: &Prop, atom: &Atom) -> bool {
    if atom.is_attribute() {
        // Attribute atoms hold iff present verbatim.
        let normalized = atom.apply_sub(&prop.sub).normalize();
        return prop.pi.contains(&normalized);
    }
    match atom {
        Atom::Eq(a, b) => check_equal(prop, a, b),
        Atom::Neq(a, b) => check_disequal(prop, a, b),
    }
}

/// Decide `a <= b`: constants, or the comparison atom is in `pi`.
pub fn check_le(prop: &Prop, a: &Exp, b: &Exp) -> bool {
    let a = norm(prop, a);
    let b = norm(prop, b);
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        return x <= y;
    }
    let le = Atom::Eq(Exp::bin(BinOp::Le, a.clone(), b.clone()), Exp::one()).normalize();
    let lt = Atom::Eq(Exp::bin(BinOp::Lt, a, b), Exp::one()).normalize();
    check_atom(prop, &le) || check_atom(prop, &lt)
}

/// Decide `a < b`.
pub fn check_lt(prop: &Prop, a: &Exp, b: &Exp) -> bool {
    let a = norm(prop, a);
    let b = norm(prop, b);
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        return x < y;
    }
    let lt = Atom::Eq(Exp::bin(BinOp::Lt, a, b), Exp::one()).normalize();
    check_atom(prop, &lt)
}

/// `size(t1) <= size(t2)` where both sizes are known.
pub fn check_type_size_leq(tenv: &Tenv, t1: &Typ, t2: &Typ) -> bool {
    match (t1.size(tenv), t2.size(tenv)) {
        (Some(a), Some(b)) => a <= b,
        _ => false,
    }
}

/// Does the proposition have no model?
pub fn check_inconsistency(prop: &Prop) -> bool {
    // Trivial contradictions survive normalization only when genuinely
    // contradictory.
    if prop.pi.iter().any(|a| a.is_trivially_false()) {
        return true;
    }

    let mut closure = EqClosure::build(prop);

    // An equality class containing two distinct integers.
    if closure.contradictory {
        return true;
    }

    // A disequality collapsed by the closure.
    for atom in &prop.pi {
        if let Atom::Neq(a, b) = atom {
            if !atom.is_attribute() && closure.same(a, b) {
                return true;
            }
        }
    }

    // An allocated cell with a null root, or two separated cells whose
    // roots are forced equal.
    let mut seen_roots: Vec<Exp> = Vec::new();
    for hp in &prop.sigma {
        let guaranteed = match hp {
            Hpred::Hpointsto(root, _, _) => Some(root),
            Hpred::Hlseg(LsegKind::NE, _, e_from, _, _) => Some(e_from),
            Hpred::Hdllseg(LsegKind::NE, _, i_f, _, _, _, _) => Some(i_f),
            _ => None,
        };
        if let Some(root) = guaranteed {
            let r = closure.find(root);
            if r.is_zero() {
                return true;
            }
            if seen_roots.iter().any(|other| closure.same(other, &r)) {
                return true;
            }
            seen_roots.push(r);
        }
    }

    false
}

/// Normalize pointer arithmetic inside an hpred: a points-to rooted at a
/// field or index path is re-expressed as a points-to of the base with a
/// nested structured value.
pub fn expand_hpred_pointer(hpred: Hpred) -> Hpred {
    use crate::features::prop::{Inst, Strexp};
    match hpred {
        Hpred::Hpointsto(Exp::Lfield(base, fld, fld_typ), se, _texp) => {
            let se = Strexp::Estruct(vec![(fld, se)], Inst::None);
            let texp = Exp::sizeof(fld_typ);
            expand_hpred_pointer(Hpred::Hpointsto(*base, se, texp))
        }
        Hpred::Hpointsto(Exp::Lindex(base, idx), se, texp) => {
            let elem_typ = match &texp {
                Exp::Sizeof(t, _) => t.clone(),
                _ => Typ::Int,
            };
            // Unknown array size: the sizeof of an unsized array stands in.
            let size = Exp::sizeof(Typ::array_of(elem_typ.clone(), None));
            let se = Strexp::Earray(size, vec![((*idx).clone(), se)], Inst::None);
            expand_hpred_pointer(Hpred::Hpointsto(
                *base,
                se,
                Exp::sizeof(Typ::array_of(elem_typ, None)),
            ))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::prop::Strexp;
    use crate::shared::models::{IdentGenerator, IdentKind, Pvar};

    fn gen() -> IdentGenerator {
        IdentGenerator::new()
    }

    #[test]
    fn test_check_equal_through_closure() {
        let mut g = gen();
        let a = Exp::var(g.fresh(IdentKind::Footprint));
        let b = Exp::var(g.fresh(IdentKind::Footprint));
        let p = Prop::emp()
            .conjoin_eq(a.clone(), b.clone())
            .conjoin_eq(b.clone(), Exp::int(4));
        assert!(check_equal(&p, &a, &Exp::int(4)));
        assert!(!check_disequal(&p, &a, &Exp::int(4)));
    }

    #[test]
    fn test_allocated_root_is_nonnull() {
        let x = Exp::Lvar(Pvar::local("x", "f"));
        let p = Prop::emp().sigma_star(vec![Hpred::Hpointsto(
            x.clone(),
            Strexp::exp(Exp::int(0)),
            Exp::sizeof(Typ::Int),
        )]);
        assert!(check_disequal(&p, &x, &Exp::zero()));
        assert!(check_allocatedness(&p, &x));
    }

    #[test]
    fn test_separation_makes_roots_disequal() {
        let x = Exp::Lvar(Pvar::local("x", "f"));
        let y = Exp::Lvar(Pvar::local("y", "f"));
        let p = Prop::emp().sigma_star(vec![
            Hpred::Hpointsto(x.clone(), Strexp::exp(Exp::zero()), Exp::sizeof(Typ::Int)),
            Hpred::Hpointsto(y.clone(), Strexp::exp(Exp::zero()), Exp::sizeof(Typ::Int)),
        ]);
        assert!(check_disequal(&p, &x, &y));
    }

    #[test]
    fn test_inconsistency_eq_and_neq() {
        let mut g = gen();
        let a = Exp::var(g.fresh(IdentKind::Footprint));
        let p = Prop::emp()
            .conjoin_eq(a.clone(), Exp::int(1))
            .conjoin_neq(a.clone(), Exp::int(1));
        assert!(check_inconsistency(&p));
    }

    #[test]
    fn test_inconsistency_null_root() {
        let mut g = gen();
        let a = Exp::var(g.fresh(IdentKind::Footprint));
        let p = Prop::emp()
            .sigma_star(vec![Hpred::Hpointsto(
                a.clone(),
                Strexp::exp(Exp::zero()),
                Exp::sizeof(Typ::Int),
            )])
            .conjoin_eq(a, Exp::zero());
        assert!(check_inconsistency(&p));
    }

    #[test]
    fn test_consistent_prop() {
        let mut g = gen();
        let a = Exp::var(g.fresh(IdentKind::Footprint));
        let p = Prop::emp().conjoin_neq(a, Exp::zero());
        assert!(!check_inconsistency(&p));
    }

    #[test]
    fn test_comparison_atoms() {
        let mut g = gen();
        let i = Exp::var(g.fresh(IdentKind::Footprint));
        let p = Prop::emp().atom_and(Atom::Eq(
            Exp::bin(BinOp::Lt, i.clone(), Exp::int(10)),
            Exp::one(),
        ));
        assert!(check_lt(&p, &i, &Exp::int(10)));
        assert!(check_le(&p, &i, &Exp::int(10)));
        assert!(!check_lt(&p, &i, &Exp::int(11)));
    }

    #[test]
    fn test_prover_determinism() {
        let mut g = gen();
        let a = Exp::var(g.fresh(IdentKind::Footprint));
        let b = Exp::var(g.fresh(IdentKind::Footprint));
        let p = Prop::emp()
            .conjoin_eq(a.clone(), b.clone())
            .conjoin_neq(b.clone(), Exp::zero());
        let before = p.clone();
        let r1 = check_disequal(&p, &a, &Exp::zero());
        let r2 = check_disequal(&p, &a, &Exp::zero());
        assert_eq!(r1, r2);
        assert_eq!(p, before, "prover must not mutate its arguments");
    }

    #[test]
    fn test_expand_hpred_pointer_field() {
        let base = Exp::Lvar(Pvar::local("p", "f"));
        let hp = Hpred::Hpointsto(
            Exp::field(base.clone(), "next", Typ::ptr_to(Typ::Int)),
            Strexp::exp(Exp::zero()),
            Exp::sizeof(Typ::ptr_to(Typ::Int)),
        );
        match expand_hpred_pointer(hp) {
            Hpred::Hpointsto(root, se, _) => {
                assert_eq!(root, base);
                assert!(se.field("next").is_some());
            }
            _ => panic!("expected points-to"),
        }
    }
}
