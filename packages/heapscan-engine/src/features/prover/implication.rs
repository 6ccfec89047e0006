//! Implication with abduction
//!
//! `check_implication_for_footprint(A, B)` decides `A * ?missing |- B * ?frame`:
//! the spec precondition `B` is matched cell-by-cell against the actual
//! precondition `A`; spec variables are instantiated with caller
//! expressions (`sub2`), unconsumed caller heap becomes the frame, and
//! spec requirements the caller cannot yet justify become the missing
//! parts. Field-splitting and type-refinement deltas are reported
//! separately so tabulation can star them back in the right place.
//!
//! Matching order is canonical (the spec heap is normalized, hence
//! sorted), which makes results reproducible for identical inputs.

use super::{check_atom, check_disequal, check_equal, check_inconsistency, check_zero};
use crate::features::prop::{Atom, Hpred, LsegKind, Prop, Strexp, Subst};
use crate::shared::models::{Exp, Ident, IdentGenerator, IdentKind, Tenv, Typ};
use std::collections::BTreeSet;

/// A deferred obligation the caller must discharge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    /// `0 <= index < size` for an array cell consumed by the spec.
    Bounds { size: Exp, index: Exp },
    /// Dynamic type of `e` must refine `from` down to `to`.
    ClassCast { e: Exp, from: Typ, to: Typ },
    /// A pure obligation that failed outright.
    Pure(Atom),
}

/// Successful implication: renamings, frame and missing parts.
#[derive(Debug, Clone, PartialEq)]
pub struct ImplOk {
    pub checks: Vec<Check>,
    /// Renames primed variables of the actual precondition.
    pub sub1: Subst,
    /// Instantiates spec variables with caller expressions.
    pub sub2: Subst,
    /// Caller heap not consumed by the spec.
    pub frame: Vec<Hpred>,
    pub missing_pi: Vec<Atom>,
    pub missing_sigma: Vec<Hpred>,
    /// Caller-side fields the spec did not mention (field splitting).
    pub frame_fld: Vec<Hpred>,
    /// Spec-side fields the caller did not have.
    pub missing_fld: Vec<Hpred>,
    /// Type refinements the caller already has (root, type expression).
    pub frame_typ: Vec<(Exp, Exp)>,
    /// Type refinements the spec assumes beyond the caller's knowledge.
    pub missing_typ: Vec<(Exp, Exp)>,
}

/// Result of the bi-abductive implication.
#[derive(Debug, Clone, PartialEq)]
pub enum ImplResult {
    Ok(Box<ImplOk>),
    Fail(Vec<Check>),
}

struct ImplState<'a> {
    actual: Prop,
    tenv: &'a Tenv,
    spec_ids: BTreeSet<Ident>,
    sub2: Subst,
    consumed: Vec<bool>,
    checks: Vec<Check>,
    missing_pi: Vec<Atom>,
    missing_sigma: Vec<Hpred>,
    frame_fld: Vec<Hpred>,
    missing_fld: Vec<Hpred>,
    frame_typ: Vec<(Exp, Exp)>,
    missing_typ: Vec<(Exp, Exp)>,
}

/// Hard failure inside unification: the spec cannot be satisfied by this
/// actual state at all.
struct UnifyFail(Check);

impl<'a> ImplState<'a> {
    fn apply2(&self, e: &Exp) -> Exp {
        self.sub2.apply_exp(e).fold_const()
    }

    fn bind(&mut self, id: Ident, e: Exp) {
        self.sub2 = self.sub2.extend(id, e);
    }

    fn is_unbound_spec_var(&self, e: &Exp) -> Option<Ident> {
        match e {
            Exp::Var(id)
                if self.spec_ids.contains(id) && self.sub2.lookup(id).is_none() =>
            {
                Some(id.clone())
            }
            _ => None,
        }
    }

    fn has_unbound_spec_vars(&self, e: &Exp) -> bool {
        e.fv()
            .iter()
            .any(|id| self.spec_ids.contains(id) && self.sub2.lookup(id).is_none())
    }

    /// Index of an unconsumed actual hpred rooted at `root`.
    fn find_actual(&self, root: &Exp) -> Option<usize> {
        self.actual.sigma.iter().enumerate().position(|(i, hp)| {
            !self.consumed[i] && check_equal(&self.actual, hp.root(), root)
        })
    }

    fn unify_exp(&mut self, spec_e: &Exp, actual_e: &Exp) -> Result<(), UnifyFail> {
        let se = self.apply2(spec_e);
        if let Some(id) = self.is_unbound_spec_var(&se) {
            self.bind(id, actual_e.clone());
            return Ok(());
        }
        if check_equal(&self.actual, &se, actual_e) {
            return Ok(());
        }
        let obligation = Atom::Eq(se.clone(), actual_e.clone()).normalize();
        if check_disequal(&self.actual, &se, actual_e) {
            return Err(UnifyFail(Check::Pure(obligation)));
        }
        self.missing_pi.push(obligation);
        Ok(())
    }

    fn unify_strexp(
        &mut self,
        root: &Exp,
        spec_se: &Strexp,
        actual_se: &Strexp,
        spec_texp: &Exp,
        actual_texp: &Exp,
    ) -> Result<(), UnifyFail> {
        match (spec_se, actual_se) {
            (Strexp::Eexp(se, _), Strexp::Eexp(ae, _)) => self.unify_exp(se, ae),
            (Strexp::Estruct(sfs, _), Strexp::Estruct(afs, si)) => {
                let mut missing_fields = Vec::new();
                for (fld, s_sub) in sfs {
                    match afs.iter().find(|(f, _)| f == fld) {
                        Some((_, a_sub)) => {
                            self.unify_strexp(root, s_sub, a_sub, spec_texp, actual_texp)?
                        }
                        None => missing_fields
                            .push((fld.clone(), s_sub.apply_sub(&self.sub2))),
                    }
                }
                let frame_fields: Vec<_> = afs
                    .iter()
                    .filter(|(f, _)| !sfs.iter().any(|(sf, _)| sf == f))
                    .cloned()
                    .collect();
                if !frame_fields.is_empty() {
                    self.frame_fld.push(Hpred::Hpointsto(
                        root.clone(),
                        Strexp::Estruct(frame_fields, si.clone()),
                        actual_texp.clone(),
                    ));
                }
                if !missing_fields.is_empty() {
                    self.missing_fld.push(Hpred::Hpointsto(
                        root.clone(),
                        Strexp::Estruct(missing_fields, si.clone()),
                        spec_texp.clone(),
                    ));
                }
                Ok(())
            }
            (Strexp::Earray(s_size, s_elems, _), Strexp::Earray(a_size, a_elems, ai)) => {
                self.unify_exp(s_size, a_size)?;
                let mut missing_elems = Vec::new();
                for (s_idx, s_sub) in s_elems {
                    let s_idx_inst = self.apply2(s_idx);
                    match a_elems
                        .iter()
                        .find(|(a_idx, _)| check_equal(&self.actual, &s_idx_inst, a_idx))
                    {
                        Some((_, a_sub)) => {
                            self.checks.push(Check::Bounds {
                                size: a_size.clone(),
                                index: s_idx_inst,
                            });
                            self.unify_strexp(root, s_sub, a_sub, spec_texp, actual_texp)?
                        }
                        None => missing_elems
                            .push((s_idx_inst, s_sub.apply_sub(&self.sub2))),
                    }
                }
                let frame_elems: Vec<_> = a_elems
                    .iter()
                    .filter(|(a_idx, _)| {
                        !s_elems.iter().any(|(s_idx, _)| {
                            check_equal(&self.actual, &self.apply2(s_idx), a_idx)
                        })
                    })
                    .cloned()
                    .collect();
                if !frame_elems.is_empty() {
                    self.frame_fld.push(Hpred::Hpointsto(
                        root.clone(),
                        Strexp::Earray(a_size.clone(), frame_elems, ai.clone()),
                        actual_texp.clone(),
                    ));
                }
                if !missing_elems.is_empty() {
                    self.missing_fld.push(Hpred::Hpointsto(
                        root.clone(),
                        Strexp::Earray(a_size.clone(), missing_elems, ai.clone()),
                        spec_texp.clone(),
                    ));
                }
                Ok(())
            }
            // A spec leaf against a caller struct (or vice versa) has no
            // value-level witness; the implication fails as a whole.
            _ => Err(UnifyFail(Check::Pure(
                Atom::Neq(root.clone(), root.clone()).normalize(),
            ))),
        }
    }

    fn unify_texp(
        &mut self,
        root: &Exp,
        spec_texp: &Exp,
        actual_texp: &Exp,
    ) -> Result<(), UnifyFail> {
        match (spec_texp, actual_texp) {
            (Exp::Sizeof(ts, _), Exp::Sizeof(ta, _)) if ts == ta => Ok(()),
            (Exp::Sizeof(Typ::Struct(ts), _), Exp::Sizeof(Typ::Struct(ta), _)) => {
                if self.tenv.is_subtype(ta, ts) {
                    // Caller's knowledge is more precise than the spec's.
                    self.frame_typ.push((root.clone(), actual_texp.clone()));
                    Ok(())
                } else if self.tenv.is_subtype(ts, ta) {
                    // Spec assumes a refinement the caller must justify.
                    self.missing_typ.push((root.clone(), spec_texp.clone()));
                    self.checks.push(Check::ClassCast {
                        e: root.clone(),
                        from: Typ::Struct(ta.clone()),
                        to: Typ::Struct(ts.clone()),
                    });
                    Ok(())
                } else {
                    Err(UnifyFail(Check::ClassCast {
                        e: root.clone(),
                        from: Typ::Struct(ta.clone()),
                        to: Typ::Struct(ts.clone()),
                    }))
                }
            }
            _ => Ok(()),
        }
    }

    fn unify_hpred(&mut self, spec_hp: &Hpred, actual_idx: usize) -> Result<(), UnifyFail> {
        let actual_hp = self.actual.sigma[actual_idx].clone();
        match (spec_hp, &actual_hp) {
            (Hpred::Hpointsto(s_root, s_se, s_texp), Hpred::Hpointsto(_, a_se, a_texp)) => {
                let root = self.apply2(s_root);
                self.unify_strexp(&root, s_se, a_se, s_texp, a_texp)?;
                self.unify_texp(&root, s_texp, a_texp)
            }
            (
                Hpred::Hlseg(s_kind, _, _, s_to, s_shared),
                Hpred::Hlseg(a_kind, _, _, a_to, a_shared),
            ) if s_kind == a_kind || *s_kind == LsegKind::PE => {
                self.unify_exp(s_to, a_to)?;
                for (s, a) in s_shared.iter().zip(a_shared.iter()) {
                    self.unify_exp(s, a)?;
                }
                Ok(())
            }
            (
                Hpred::Hdllseg(s_kind, _, _, s_ob, s_of, s_ib, s_shared),
                Hpred::Hdllseg(a_kind, _, _, a_ob, a_of, a_ib, a_shared),
            ) if s_kind == a_kind || *s_kind == LsegKind::PE => {
                self.unify_exp(s_ob, a_ob)?;
                self.unify_exp(s_of, a_of)?;
                self.unify_exp(s_ib, a_ib)?;
                for (s, a) in s_shared.iter().zip(a_shared.iter()) {
                    self.unify_exp(s, a)?;
                }
                Ok(())
            }
            // Shape mismatch at the same root: abduce the spec cell and
            // leave the actual one in the frame; the consistency check
            // below rejects the combination if it is contradictory.
            _ => {
                self.missing_sigma.push(spec_hp.apply_sub(&self.sub2));
                Ok(())
            }
        }
    }
}

/// The bi-abductive implication (see module docs).
///
/// `actual_pre` and `spec_pre` must not share free identifiers; tabulation
/// guarantees this by freshening the spec before calling in.
pub fn check_implication_for_footprint(
    idgen: &mut IdentGenerator,
    tenv: &Tenv,
    actual_pre: &Prop,
    spec_pre: &Prop,
) -> ImplResult {
    // sub1: primed variables of the actual state become fresh normal ones,
    // so the spec's existentials can never capture them.
    let sub1 = Subst::from_pairs(
        actual_pre
            .fav_all()
            .into_iter()
            .filter(|id| id.is_primed())
            .map(|id| (id, Exp::var(idgen.fresh(IdentKind::Normal))))
            .collect(),
    );
    let actual = actual_pre.rename_with(&sub1);

    let mut st = ImplState {
        spec_ids: spec_pre.fav_all(),
        consumed: vec![false; actual.sigma.len()],
        actual,
        tenv,
        sub2: Subst::empty(),
        checks: Vec::new(),
        missing_pi: Vec::new(),
        missing_sigma: Vec::new(),
        frame_fld: Vec::new(),
        missing_fld: Vec::new(),
        frame_typ: Vec::new(),
        missing_typ: Vec::new(),
    };

    // Match spec hpreds, deferring the ones whose roots are not yet
    // instantiated; when no pass makes progress the leftovers are abduced
    // wholesale.
    let mut pending: Vec<Hpred> = spec_pre.sigma.clone();
    loop {
        let mut next_pending = Vec::new();
        let mut progress = false;
        for spec_hp in pending {
            let root = st.apply2(spec_hp.root());
            if st.has_unbound_spec_vars(&root) {
                next_pending.push(spec_hp);
                continue;
            }
            progress = true;
            match st.find_actual(&root) {
                Some(idx) => {
                    st.consumed[idx] = true;
                    if let Err(UnifyFail(check)) = st.unify_hpred(&spec_hp, idx) {
                        return ImplResult::Fail(vec![check]);
                    }
                }
                None => {
                    // Possibly-empty segment with equal endpoints is
                    // satisfied by the empty heap.
                    if let Hpred::Hlseg(LsegKind::PE, _, e_from, e_to, _) = &spec_hp {
                        let from = st.apply2(e_from);
                        let to = st.apply2(e_to);
                        if check_equal(&st.actual, &from, &to) {
                            continue;
                        }
                    }
                    // Abducing allocation of a provably-null root can
                    // never be met.
                    if spec_hp.is_pointsto() && check_zero(&st.actual, &root) {
                        return ImplResult::Fail(vec![Check::Pure(
                            Atom::Neq(root.clone(), Exp::zero()).normalize(),
                        )]);
                    }
                    st.missing_sigma.push(spec_hp.apply_sub(&st.sub2));
                }
            }
        }
        if next_pending.is_empty() {
            break;
        }
        if !progress {
            for spec_hp in next_pending {
                st.missing_sigma.push(spec_hp.apply_sub(&st.sub2));
            }
            break;
        }
        pending = next_pending;
    }

    // Pure part of the spec.
    for atom in &spec_pre.pi {
        let inst = atom.apply_sub(&st.sub2).normalize();
        if check_atom(&st.actual, &inst) {
            continue;
        }
        let contradicted = match &inst {
            Atom::Eq(a, b) => check_disequal(&st.actual, a, b),
            Atom::Neq(a, b) => !inst.is_attribute() && check_equal(&st.actual, a, b),
        };
        if contradicted {
            return ImplResult::Fail(vec![Check::Pure(inst)]);
        }
        st.missing_pi.push(inst);
    }

    // The actual state extended with everything abduced must stay
    // consistent.
    let mut combined = st.actual.clone();
    combined.pi.extend(st.missing_pi.iter().cloned());
    combined.sigma.extend(st.missing_sigma.iter().cloned());
    let combined = combined.normalize();
    if check_inconsistency(&combined) {
        return ImplResult::Fail(st.checks);
    }

    let frame = st
        .actual
        .sigma
        .iter()
        .enumerate()
        .filter(|(i, _)| !st.consumed[*i])
        .map(|(_, hp)| hp.clone())
        .collect();

    st.missing_pi.sort();
    st.missing_pi.dedup();
    st.missing_sigma.sort();
    st.missing_sigma.dedup();

    ImplResult::Ok(Box::new(ImplOk {
        checks: st.checks,
        sub1,
        sub2: st.sub2,
        frame,
        missing_pi: st.missing_pi,
        missing_sigma: st.missing_sigma,
        frame_fld: st.frame_fld,
        missing_fld: st.missing_fld,
        frame_typ: st.frame_typ,
        missing_typ: st.missing_typ,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::prop::{Inst, Strexp};
    use crate::shared::models::Pvar;

    fn ptsto(root: Exp, value: Exp) -> Hpred {
        Hpred::Hpointsto(root, Strexp::Eexp(value, Inst::None), Exp::sizeof(Typ::Int))
    }

    fn setup() -> (IdentGenerator, Tenv) {
        (IdentGenerator::new(), Tenv::new())
    }

    #[test]
    fn test_exact_match_empty_frame_and_missing() {
        let (mut gen, tenv) = setup();
        let q = Exp::Lvar(Pvar::callee("p", "g"));
        let v = gen.fresh(IdentKind::Footprint);

        let actual = Prop::emp().sigma_star(vec![ptsto(q.clone(), Exp::int(3))]);
        let spec = Prop::emp().sigma_star(vec![ptsto(q.clone(), Exp::var(v.clone()))]);

        match check_implication_for_footprint(&mut gen, &tenv, &actual, &spec) {
            ImplResult::Ok(ok) => {
                assert!(ok.frame.is_empty());
                assert!(ok.missing_sigma.is_empty());
                assert!(ok.missing_pi.is_empty());
                assert_eq!(ok.sub2.apply_exp(&Exp::var(v)), Exp::int(3));
            }
            ImplResult::Fail(cs) => panic!("implication failed: {:?}", cs),
        }
    }

    #[test]
    fn test_frame_inference() {
        let (mut gen, tenv) = setup();
        let q = Exp::Lvar(Pvar::callee("p", "g"));
        let r = Exp::Lvar(Pvar::local("r", "f"));
        let v = gen.fresh(IdentKind::Footprint);

        let actual = Prop::emp().sigma_star(vec![
            ptsto(q.clone(), Exp::int(3)),
            ptsto(r.clone(), Exp::int(9)),
        ]);
        let spec = Prop::emp().sigma_star(vec![ptsto(q, Exp::var(v))]);

        match check_implication_for_footprint(&mut gen, &tenv, &actual, &spec) {
            ImplResult::Ok(ok) => {
                assert_eq!(ok.frame.len(), 1);
                assert_eq!(ok.frame[0].root(), &r);
            }
            ImplResult::Fail(cs) => panic!("implication failed: {:?}", cs),
        }
    }

    #[test]
    fn test_missing_abduction() {
        let (mut gen, tenv) = setup();
        let q = Exp::Lvar(Pvar::callee("p", "g"));
        let v = gen.fresh(IdentKind::Footprint);

        let actual = Prop::emp();
        let spec = Prop::emp().sigma_star(vec![ptsto(q.clone(), Exp::var(v))]);

        match check_implication_for_footprint(&mut gen, &tenv, &actual, &spec) {
            ImplResult::Ok(ok) => {
                assert_eq!(ok.missing_sigma.len(), 1);
                assert_eq!(ok.missing_sigma[0].root(), &q);
            }
            ImplResult::Fail(cs) => panic!("implication failed: {:?}", cs),
        }
    }

    #[test]
    fn test_missing_pure() {
        let (mut gen, tenv) = setup();
        let q = Exp::Lvar(Pvar::callee("p", "g"));
        let v = gen.fresh(IdentKind::Footprint);

        let actual = Prop::emp().sigma_star(vec![ptsto(q.clone(), Exp::var(
            gen.fresh(IdentKind::Normal),
        ))]);
        let spec = Prop::emp()
            .sigma_star(vec![ptsto(q.clone(), Exp::var(v.clone()))])
            .conjoin_neq(Exp::var(v), Exp::zero());

        match check_implication_for_footprint(&mut gen, &tenv, &actual, &spec) {
            ImplResult::Ok(ok) => {
                assert_eq!(ok.missing_pi.len(), 1);
            }
            ImplResult::Fail(cs) => panic!("implication failed: {:?}", cs),
        }
    }

    #[test]
    fn test_contradicted_pure_fails() {
        let (mut gen, tenv) = setup();
        let q = Exp::Lvar(Pvar::callee("p", "g"));
        let v = gen.fresh(IdentKind::Footprint);

        // Caller knows the stored value is 0; the spec demands non-zero.
        let actual = Prop::emp().sigma_star(vec![ptsto(q.clone(), Exp::zero())]);
        let spec = Prop::emp()
            .sigma_star(vec![ptsto(q.clone(), Exp::var(v.clone()))])
            .conjoin_neq(Exp::var(v), Exp::zero());

        match check_implication_for_footprint(&mut gen, &tenv, &actual, &spec) {
            ImplResult::Fail(checks) => assert!(!checks.is_empty()),
            ImplResult::Ok(ok) => panic!("expected failure, got {:?}", ok),
        }
    }

    #[test]
    fn test_null_root_cannot_be_abduced() {
        let (mut gen, tenv) = setup();
        let q = Exp::Lvar(Pvar::callee("p", "g"));
        let n = gen.fresh(IdentKind::Normal);

        let actual = Prop::emp()
            .conjoin_eq(Exp::var(n.clone()), Exp::zero())
            .conjoin_eq(Exp::var(n.clone()), q.clone());
        let spec = Prop::emp().sigma_star(vec![ptsto(
            q,
            Exp::var(gen.fresh(IdentKind::Footprint)),
        )]);

        match check_implication_for_footprint(&mut gen, &tenv, &actual, &spec) {
            ImplResult::Fail(_) => {}
            ImplResult::Ok(ok) => panic!("expected failure, got {:?}", ok),
        }
    }

    #[test]
    fn test_field_splitting_deltas() {
        let (mut gen, tenv) = setup();
        let q = Exp::Lvar(Pvar::callee("p", "g"));
        let v = gen.fresh(IdentKind::Footprint);
        let texp = Exp::sizeof(Typ::Struct("pair".to_string()));

        let actual = Prop::emp().sigma_star(vec![Hpred::Hpointsto(
            q.clone(),
            Strexp::Estruct(
                vec![
                    ("fst".to_string(), Strexp::exp(Exp::int(1))),
                    ("snd".to_string(), Strexp::exp(Exp::int(2))),
                ],
                Inst::None,
            ),
            texp.clone(),
        )]);
        // Spec only needs fst, plus a field the caller lacks.
        let spec = Prop::emp().sigma_star(vec![Hpred::Hpointsto(
            q.clone(),
            Strexp::Estruct(
                vec![
                    ("fst".to_string(), Strexp::Eexp(Exp::var(v), Inst::None)),
                    (
                        "thd".to_string(),
                        Strexp::Eexp(
                            Exp::var(gen.fresh(IdentKind::Footprint)),
                            Inst::None,
                        ),
                    ),
                ],
                Inst::None,
            ),
            texp,
        )]);

        match check_implication_for_footprint(&mut gen, &tenv, &actual, &spec) {
            ImplResult::Ok(ok) => {
                assert_eq!(ok.frame_fld.len(), 1, "snd is frame");
                assert_eq!(ok.missing_fld.len(), 1, "thd is missing");
            }
            ImplResult::Fail(cs) => panic!("implication failed: {:?}", cs),
        }
    }

    #[test]
    fn test_deterministic() {
        let (mut gen, tenv) = setup();
        let q = Exp::Lvar(Pvar::callee("p", "g"));
        let v = gen.fresh(IdentKind::Footprint);
        let actual = Prop::emp().sigma_star(vec![ptsto(q.clone(), Exp::int(3))]);
        let spec = Prop::emp().sigma_star(vec![ptsto(q, Exp::var(v))]);

        let mut gen1 = IdentGenerator::new();
        let mut gen2 = IdentGenerator::new();
        let r1 = check_implication_for_footprint(&mut gen1, &tenv, &actual, &spec);
        let r2 = check_implication_for_footprint(&mut gen2, &tenv, &actual, &spec);
        assert_eq!(r1, r2);
    }
}
