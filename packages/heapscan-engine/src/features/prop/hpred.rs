//! Heap predicates
//!
//! Three shapes: points-to, singly-linked list segments, doubly-linked
//! list segments. Segment bodies are templates (`hpara`) instantiated at
//! unfold time; the cyclic structure of a dll lives in the predicate, not
//! in the ownership graph.

use super::strexp::Strexp;
use super::sub::Subst;
use crate::shared::models::{Exp, Ident, IdentGenerator};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Segment kind: non-empty or possibly-empty.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum LsegKind {
    NE,
    PE,
}

impl fmt::Display for LsegKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LsegKind::NE => write!(f, "ne"),
            LsegKind::PE => write!(f, "pe"),
        }
    }
}

/// Body template of a singly-linked segment: one cell rooted at `root`
/// linking to `next`, with shared variables `svars` and existentials
/// `evars`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HparaBody {
    pub root: Ident,
    pub next: Ident,
    pub svars: Vec<Ident>,
    pub evars: Vec<Ident>,
    pub body: Vec<Hpred>,
}

/// Body template of a doubly-linked segment cell with forward and backward
/// links.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HparaDll {
    pub cell: Ident,
    pub blink: Ident,
    pub flink: Ident,
    pub svars: Vec<Ident>,
    pub evars: Vec<Ident>,
    pub body: Vec<Hpred>,
}

/// One heap predicate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Hpred {
    /// `lhs |-> strexp : texp` — texp is a `Sizeof` describing the cell.
    Hpointsto(Exp, Strexp, Exp),
    /// `lseg(kind, para, e_from, e_to, shared)`
    Hlseg(LsegKind, HparaBody, Exp, Exp, Vec<Exp>),
    /// `dllseg(kind, para, iF, oB, oF, iB, shared)` — four endpoints:
    /// inside-front, outside-back, outside-front, inside-back.
    Hdllseg(LsegKind, HparaDll, Exp, Exp, Exp, Exp, Vec<Exp>),
}

impl Hpred {
    /// Root expression for points-to; segments answer their from/iF
    /// endpoint.
    pub fn root(&self) -> &Exp {
        match self {
            Hpred::Hpointsto(e, _, _) => e,
            Hpred::Hlseg(_, _, e_from, _, _) => e_from,
            Hpred::Hdllseg(_, _, i_f, _, _, _, _) => i_f,
        }
    }

    pub fn is_pointsto(&self) -> bool {
        matches!(self, Hpred::Hpointsto(..))
    }

    /// Collect free identifiers.
    pub fn fv_into(&self, acc: &mut BTreeSet<Ident>) {
        match self {
            Hpred::Hpointsto(e, se, texp) => {
                e.fv_into(acc);
                se.fv_into(acc);
                texp.fv_into(acc);
            }
            Hpred::Hlseg(_, para, e_from, e_to, shared) => {
                e_from.fv_into(acc);
                e_to.fv_into(acc);
                for e in shared {
                    e.fv_into(acc);
                }
                // Body variables are bound by the template.
                let mut body_fv = BTreeSet::new();
                for hp in &para.body {
                    hp.fv_into(&mut body_fv);
                }
                for id in body_fv {
                    if id != para.root
                        && id != para.next
                        && !para.svars.contains(&id)
                        && !para.evars.contains(&id)
                    {
                        acc.insert(id);
                    }
                }
            }
            Hpred::Hdllseg(_, para, i_f, o_b, o_f, i_b, shared) => {
                i_f.fv_into(acc);
                o_b.fv_into(acc);
                o_f.fv_into(acc);
                i_b.fv_into(acc);
                for e in shared {
                    e.fv_into(acc);
                }
                let mut body_fv = BTreeSet::new();
                for hp in &para.body {
                    hp.fv_into(&mut body_fv);
                }
                for id in body_fv {
                    if id != para.cell
                        && id != para.blink
                        && id != para.flink
                        && !para.svars.contains(&id)
                        && !para.evars.contains(&id)
                    {
                        acc.insert(id);
                    }
                }
            }
        }
    }

    pub fn fv(&self) -> BTreeSet<Ident> {
        let mut acc = BTreeSet::new();
        self.fv_into(&mut acc);
        acc
    }

    /// Apply a substitution throughout (template-bound variables are not
    /// touched).
    pub fn apply_sub(&self, sub: &Subst) -> Hpred {
        match self {
            Hpred::Hpointsto(e, se, texp) => Hpred::Hpointsto(
                sub.apply_exp(e),
                se.apply_sub(sub),
                sub.apply_exp(texp),
            ),
            Hpred::Hlseg(kind, para, e_from, e_to, shared) => Hpred::Hlseg(
                *kind,
                para.clone(),
                sub.apply_exp(e_from),
                sub.apply_exp(e_to),
                shared.iter().map(|e| sub.apply_exp(e)).collect(),
            ),
            Hpred::Hdllseg(kind, para, i_f, o_b, o_f, i_b, shared) => Hpred::Hdllseg(
                *kind,
                para.clone(),
                sub.apply_exp(i_f),
                sub.apply_exp(o_b),
                sub.apply_exp(o_f),
                sub.apply_exp(i_b),
                shared.iter().map(|e| sub.apply_exp(e)).collect(),
            ),
        }
    }

    /// Canonicalize contained values.
    pub fn normalize(self) -> Hpred {
        match self {
            Hpred::Hpointsto(e, se, texp) => {
                Hpred::Hpointsto(e.fold_const(), se.normalize(), texp)
            }
            Hpred::Hlseg(kind, para, e_from, e_to, shared) => Hpred::Hlseg(
                kind,
                para,
                e_from.fold_const(),
                e_to.fold_const(),
                shared.into_iter().map(Exp::fold_const).collect(),
            ),
            Hpred::Hdllseg(kind, para, i_f, o_b, o_f, i_b, shared) => Hpred::Hdllseg(
                kind,
                para,
                i_f.fold_const(),
                o_b.fold_const(),
                o_f.fold_const(),
                i_b.fold_const(),
                shared.into_iter().map(Exp::fold_const).collect(),
            ),
        }
    }
}

impl HparaBody {
    /// Instantiate the body for a concrete cell `e_root` linking to
    /// `e_next`; existentials become fresh primed variables.
    pub fn instantiate(
        &self,
        idgen: &mut IdentGenerator,
        e_root: &Exp,
        e_next: &Exp,
        shared: &[Exp],
    ) -> Vec<Hpred> {
        let mut pairs = vec![
            (self.root.clone(), e_root.clone()),
            (self.next.clone(), e_next.clone()),
        ];
        for (svar, arg) in self.svars.iter().zip(shared.iter()) {
            pairs.push((svar.clone(), arg.clone()));
        }
        for evar in &self.evars {
            pairs.push((evar.clone(), Exp::var(idgen.fresh_like(evar))));
        }
        let sub = Subst::from_pairs(pairs);
        self.body.iter().map(|hp| hp.apply_sub(&sub)).collect()
    }
}

impl HparaDll {
    /// Instantiate one dll cell with concrete links.
    pub fn instantiate(
        &self,
        idgen: &mut IdentGenerator,
        e_cell: &Exp,
        e_blink: &Exp,
        e_flink: &Exp,
        shared: &[Exp],
    ) -> Vec<Hpred> {
        let mut pairs = vec![
            (self.cell.clone(), e_cell.clone()),
            (self.blink.clone(), e_blink.clone()),
            (self.flink.clone(), e_flink.clone()),
        ];
        for (svar, arg) in self.svars.iter().zip(shared.iter()) {
            pairs.push((svar.clone(), arg.clone()));
        }
        for evar in &self.evars {
            pairs.push((evar.clone(), Exp::var(idgen.fresh_like(evar))));
        }
        let sub = Subst::from_pairs(pairs);
        self.body.iter().map(|hp| hp.apply_sub(&sub)).collect()
    }
}

impl fmt::Display for Hpred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hpred::Hpointsto(e, se, texp) => write!(f, "{} |-> {} : {}", e, se, texp),
            Hpred::Hlseg(kind, _, e_from, e_to, _) => {
                write!(f, "lseg_{}({}, {})", kind, e_from, e_to)
            }
            Hpred::Hdllseg(kind, _, i_f, o_b, o_f, i_b, _) => {
                write!(f, "dllseg_{}({}, {}, {}, {})", kind, i_f, o_b, o_f, i_b)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::{IdentKind, Typ};
    use crate::features::prop::strexp::Inst;

    fn next_para(gen: &mut IdentGenerator) -> HparaBody {
        let root = gen.fresh(IdentKind::Primed);
        let next = gen.fresh(IdentKind::Primed);
        let body = vec![Hpred::Hpointsto(
            Exp::var(root.clone()),
            Strexp::Estruct(
                vec![("next".to_string(), Strexp::Eexp(Exp::var(next.clone()), Inst::None))],
                Inst::None,
            ),
            Exp::sizeof(Typ::Struct("node".to_string())),
        )];
        HparaBody {
            root,
            next,
            svars: vec![],
            evars: vec![],
            body,
        }
    }

    #[test]
    fn test_instantiate_binds_root_and_next() {
        let mut gen = IdentGenerator::new();
        let para = next_para(&mut gen);
        let x = Exp::var(gen.fresh(IdentKind::Normal));
        let y = Exp::var(gen.fresh(IdentKind::Normal));

        let insts = para.instantiate(&mut gen, &x, &y, &[]);
        assert_eq!(insts.len(), 1);
        match &insts[0] {
            Hpred::Hpointsto(root, se, _) => {
                assert_eq!(root, &x);
                assert_eq!(se.field("next").unwrap().as_exp(), Some(&y));
            }
            _ => panic!("expected points-to"),
        }
    }

    #[test]
    fn test_lseg_fv_excludes_template_vars() {
        let mut gen = IdentGenerator::new();
        let para = next_para(&mut gen);
        let x = gen.fresh(IdentKind::Normal);
        let hp = Hpred::Hlseg(
            LsegKind::NE,
            para,
            Exp::var(x.clone()),
            Exp::zero(),
            vec![],
        );
        let fv = hp.fv();
        assert!(fv.contains(&x));
        assert_eq!(fv.len(), 1, "template-bound vars must not leak: {:?}", fv);
    }
}
