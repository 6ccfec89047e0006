//! Symbolic executor
//!
//! Per-instruction transfer functions over `(Prop, Path)` pairs. A heap
//! access goes through rearrangement first; calls dispatch to builtin
//! models or to tabulation; `Abstract` runs abstraction and turns
//! acquired-resource garbage into leak reports.

pub mod builtins;

use crate::config::AnalysisContext;
use crate::errors::{AnalysisFault, Bucket, ErrKind, ErrorDesc, Errlog, Result};
use crate::features::abstraction;
use crate::features::driver::path::Path;
use crate::features::ondemand;
use crate::features::orchestration::ExeEnv;
use crate::features::prop::{Atom, Hpred, Inst, Offset, Prop, Strexp};
use crate::features::prover;
use crate::features::rearrange;
use crate::features::tabulation;
use crate::shared::models::{
    Attribute, BinOp, CallFlags, Const, Exp, Ident, IdentKind, Instr, Loc, ProcName,
    ResState, ResourceKind, Typ, UnOp,
};

/// One executor, scoped to a procedure being analyzed.
pub struct Executor<'a> {
    pub env: &'a ExeEnv,
    pub ctx: &'a mut AnalysisContext,
    pub errlog: &'a mut Errlog,
    pub pname: ProcName,
}

impl Executor<'_> {
    fn norm(&self, prop: &Prop, e: &Exp) -> Exp {
        prop.sub.apply_exp(e).fold_const()
    }

    /// Report divisions whose divisor is provably zero in `prop`.
    fn check_division_by_zero(&self, prop: &Prop, e: &Exp, loc: &Loc) -> Result<()> {
        match e {
            Exp::BinOp(op, a, b) => {
                self.check_division_by_zero(prop, a, loc)?;
                self.check_division_by_zero(prop, b, loc)?;
                if matches!(op, BinOp::Div | BinOp::Mod) && prover::check_zero(prop, b) {
                    let desc = ErrorDesc::new(
                        ErrKind::DivideByZero,
                        format!("divisor {} is zero", b),
                        loc.clone(),
                        self.pname.clone(),
                    );
                    return Err(AnalysisFault::report(desc));
                }
                Ok(())
            }
            Exp::UnOp(_, a) | Exp::Cast(_, a) => self.check_division_by_zero(prop, a, loc),
            Exp::Lfield(a, _, _) => self.check_division_by_zero(prop, a, loc),
            Exp::Lindex(a, i) => {
                self.check_division_by_zero(prop, a, loc)?;
                self.check_division_by_zero(prop, i, loc)
            }
            _ => Ok(()),
        }
    }

    /// Execute one instruction on one state; returns the successor states.
    pub fn exec_instr(
        &mut self,
        instr: &Instr,
        prop: &Prop,
        path: &Path,
    ) -> Result<Vec<(Prop, Path)>> {
        self.ctx.consume_symop()?;
        match instr {
            Instr::Store { rhs, loc, .. } => {
                self.check_division_by_zero(prop, &self.norm(prop, rhs), loc)?
            }
            Instr::Prune { cond, loc, .. } => {
                self.check_division_by_zero(prop, &self.norm(prop, cond), loc)?
            }
            Instr::Call { args, loc, .. } => {
                for (arg, _) in args {
                    self.check_division_by_zero(prop, &self.norm(prop, arg), loc)?;
                }
            }
            _ => {}
        }
        match instr {
            Instr::Load { id, lexp, typ, loc } => self.exec_load(id, lexp, typ, loc, prop, path),
            Instr::Store {
                lexp, typ, rhs, loc,
            } => self.exec_store(lexp, typ, rhs, loc, prop, path),
            Instr::Prune {
                cond, true_branch, ..
            } => Ok(self
                .exec_prune(cond, *true_branch, prop)
                .into_iter()
                .map(|p| (p, path.clone()))
                .collect()),
            Instr::Call {
                rets,
                fexp,
                args,
                loc,
                flags,
            } => self.exec_call(rets, fexp, args, loc, flags, prop, path),
            Instr::Nullify { pvar, .. } => {
                let root = Exp::Lvar(pvar.clone());
                let mut p = prop.clone();
                p.sigma
                    .retain(|hp| !matches!(hp, Hpred::Hpointsto(r, _, _) if *r == root));
                Ok(vec![(p.normalize(), path.clone())])
            }
            Instr::Abstract { loc } => self.exec_abstract(loc, prop, path),
            Instr::Goto { .. } => Ok(vec![(prop.clone(), path.clone())]),
        }
    }

    fn exec_load(
        &mut self,
        id: &Ident,
        lexp: &Exp,
        typ: &Typ,
        loc: &Loc,
        prop: &Prop,
        path: &Path,
    ) -> Result<Vec<(Prop, Path)>> {
        let env = self.env;
        let tenv = &env.program.tenv;
        let iters = rearrange::rearrange(
            self.ctx, tenv, self.errlog, &self.pname, prop, lexp, typ, loc,
        )?;
        let mut out = Vec::new();
        for iter in iters {
            let p = iter.to_prop();
            let value = match &iter.curr {
                Hpred::Hpointsto(_, se, _) => strexp_read(&p, se, &iter.state),
                _ => None,
            };
            let value = match value {
                Some(v) => v,
                // Aggregate or unmaterialized value: havoc.
                None => Exp::var(self.ctx.idgen.fresh(IdentKind::Primed)),
            };
            // Loop bodies re-execute the same load; the previous binding
            // of the temporary must not survive.
            let p = p.forget_ident(&mut self.ctx.idgen, id);
            let p = p.conjoin_eq(Exp::var(id.clone()), value);
            if !prover::check_inconsistency(&p) {
                out.push((p, path.clone()));
            }
        }
        Ok(out)
    }

    fn exec_store(
        &mut self,
        lexp: &Exp,
        typ: &Typ,
        rhs: &Exp,
        loc: &Loc,
        prop: &Prop,
        path: &Path,
    ) -> Result<Vec<(Prop, Path)>> {
        let env = self.env;
        let tenv = &env.program.tenv;
        let rhs_n = self.norm(prop, rhs);
        let iters = rearrange::rearrange(
            self.ctx, tenv, self.errlog, &self.pname, prop, lexp, typ, loc,
        )?;
        let mut out = Vec::new();
        for mut iter in iters {
            let p = iter.to_prop();
            if let Hpred::Hpointsto(root, se, texp) = iter.curr.clone() {
                let new_se = strexp_write(
                    &p,
                    se,
                    &iter.state,
                    Strexp::Eexp(rhs_n.clone(), Inst::Update { loc: loc.clone() }),
                );
                iter.update_current(Hpred::Hpointsto(root, new_se, texp));
            }
            let p = iter.to_prop();
            if !prover::check_inconsistency(&p) {
                out.push((p, path.clone()));
            }
        }
        Ok(out)
    }

    /// Prune one condition; may split on `&&`/`||`, drops infeasible
    /// refinements, flags conditions decided before pruning.
    fn exec_prune(&mut self, cond: &Exp, polarity: bool, prop: &Prop) -> Vec<Prop> {
        let cond_n = self.norm(prop, cond);
        if let Some(v) = cond_n.as_int() {
            let taken = (v != 0) == polarity;
            let kind = if v != 0 {
                ErrKind::ConditionAlwaysTrue
            } else {
                ErrKind::ConditionAlwaysFalse
            };
            self.errlog.log(
                ErrorDesc::new(
                    kind,
                    format!("condition is always {}", v != 0),
                    Loc::dummy(),
                    self.pname.clone(),
                ),
                self.ctx.phase.as_str(),
            );
            return if taken { vec![prop.clone()] } else { vec![] };
        }
        prune_prop(prop, &cond_n, polarity)
            .into_iter()
            .filter(|p| !prover::check_inconsistency(p))
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn exec_call(
        &mut self,
        rets: &[Ident],
        fexp: &Exp,
        args: &[(Exp, Typ)],
        loc: &Loc,
        flags: &CallFlags,
        prop: &Prop,
        path: &Path,
    ) -> Result<Vec<(Prop, Path)>> {
        let fexp_n = self.norm(prop, fexp);
        let callee = match &fexp_n {
            Exp::Const(Const::Fun(name)) => name.clone(),
            other => {
                // Indirect call: a provably-null function value is a
                // dereference of null at the call.
                if !flags.captured_block && prover::check_zero(prop, other) {
                    let desc = ErrorDesc::new(
                        ErrKind::NullDereference,
                        format!("function pointer {} is null at the call", other),
                        loc.clone(),
                        self.pname.clone(),
                    )
                    .with_bucket(Bucket::B1);
                    return Err(AnalysisFault::report(desc));
                }
                return Ok(vec![(
                    self.havoc_rets(rets, prop, None, loc),
                    path.clone(),
                )]);
            }
        };

        if let Some(builtin) = builtins::lookup(&callee) {
            return builtin(
                self,
                &builtins::BuiltinCall {
                    name: callee.clone(),
                    rets,
                    args,
                    loc,
                    prop,
                    path,
                },
            );
        }

        let caller = self.pname.clone();
        let summary = match self.env.spec_table.get(&callee) {
            Some(s) => Some(s),
            None => ondemand::analyze_proc_if_needed(self.env, self.ctx, &caller, &callee),
        };

        match summary {
            Some(summary) if summary.has_specs() => {
                if summary.formals.len() != args.len() {
                    let desc = ErrorDesc::new(
                        ErrKind::WrongArgumentNumber,
                        format!(
                            "{} called with {} arguments, expects {}",
                            callee,
                            args.len(),
                            summary.formals.len()
                        ),
                        loc.clone(),
                        self.pname.clone(),
                    );
                    return Err(AnalysisFault::report(desc));
                }
                let path = path.add_call(callee.clone(), loc.clone());
                tabulation::exe_function_call(
                    self, &summary, rets, args, loc, prop, &path,
                )
            }
            _ => {
                // No model and no specs: havoc the return, marking it as
                // coming from a skipped function.
                Ok(vec![(
                    self.havoc_rets(rets, prop, Some(&callee), loc),
                    path.clone(),
                )])
            }
        }
    }

    /// Bind return identifiers to fresh unknowns; `skipped` marks them as
    /// produced by a function without a summary.
    fn havoc_rets(
        &mut self,
        rets: &[Ident],
        prop: &Prop,
        skipped: Option<&ProcName>,
        loc: &Loc,
    ) -> Prop {
        let mut p = prop.clone();
        for ret in rets {
            let fresh = Exp::var(self.ctx.idgen.fresh(IdentKind::Primed));
            p = p.forget_ident(&mut self.ctx.idgen, ret);
            p = p.conjoin_eq(Exp::var(ret.clone()), fresh.clone());
            if let Some(callee) = skipped {
                p = p.add_attribute(
                    fresh,
                    Attribute::Undef {
                        callee: callee.clone(),
                        loc: loc.clone(),
                    },
                );
            }
        }
        p
    }

    fn exec_abstract(
        &mut self,
        loc: &Loc,
        prop: &Prop,
        path: &Path,
    ) -> Result<Vec<(Prop, Path)>> {
        let res = abstraction::abstract_prop(self.ctx, prop)?;
        self.report_leaks(&res.leaked, prop, loc);
        Ok(vec![(res.prop, path.clone())])
    }

    /// Turn acquired-resource garbage into leak reports. The original
    /// proposition still carries the attributes of the dropped roots.
    pub fn report_leaks(&mut self, leaked: &[Hpred], original: &Prop, loc: &Loc) {
        for hp in leaked {
            let root = hp.root();
            for attr in original.get_attributes(root) {
                if let Attribute::Resource {
                    state: ResState::Acquire,
                    kind,
                    site,
                } = attr
                {
                    let (err_kind, what) = match kind {
                        ResourceKind::Memory => (ErrKind::MemoryLeak, "memory"),
                        ResourceKind::File => (ErrKind::ResourceLeak, "file"),
                        ResourceKind::Lock => (ErrKind::ResourceLeak, "lock"),
                    };
                    let mut desc = ErrorDesc::new(
                        err_kind,
                        format!(
                            "{} acquired by {} at line {} is not released",
                            what, site.pname, site.loc.line
                        ),
                        loc.clone(),
                        self.pname.clone(),
                    )
                    .with_bucket(Bucket::Leak(*kind));
                    desc.push_trace(
                        site.loc.clone(),
                        format!("{} acquired by {}", what, site.pname),
                    );
                    desc.push_trace(loc.clone(), format!("{} becomes unreachable", what));
                    self.errlog.log(desc, self.ctx.phase.as_str());
                }
            }
        }
    }
}

/// Read the leaf value at an offset path (indices matched up to provable
/// equality).
pub fn strexp_read(prop: &Prop, se: &Strexp, offsets: &[Offset]) -> Option<Exp> {
    match offsets.first() {
        None => se.as_exp().cloned(),
        Some(Offset::Fld(fld, _)) => match se {
            Strexp::Estruct(fields, _) => {
                let (_, sub) = fields.iter().find(|(f, _)| f == fld)?;
                strexp_read(prop, sub, &offsets[1..])
            }
            _ => None,
        },
        Some(Offset::Index(idx)) => match se {
            Strexp::Earray(_, elems, _) => {
                let idx_n = prop.sub.apply_exp(idx).fold_const();
                let (_, sub) = elems
                    .iter()
                    .find(|(i, _)| prover::check_equal(prop, i, &idx_n))?;
                strexp_read(prop, sub, &offsets[1..])
            }
            _ => None,
        },
    }
}

/// Write `new` at an offset path, leaving siblings untouched.
pub fn strexp_write(prop: &Prop, se: Strexp, offsets: &[Offset], new: Strexp) -> Strexp {
    match offsets.first() {
        None => new,
        Some(Offset::Fld(fld, _)) => match se {
            Strexp::Estruct(mut fields, inst) => {
                for (f, sub) in fields.iter_mut() {
                    if f == fld {
                        let taken = std::mem::replace(sub, Strexp::exp(Exp::zero()));
                        *sub = strexp_write(prop, taken, &offsets[1..], new);
                        return Strexp::Estruct(fields, inst);
                    }
                }
                Strexp::Estruct(fields, inst)
            }
            other => other,
        },
        Some(Offset::Index(idx)) => match se {
            Strexp::Earray(size, mut elems, inst) => {
                let idx_n = prop.sub.apply_exp(idx).fold_const();
                for (i, sub) in elems.iter_mut() {
                    if prover::check_equal(prop, i, &idx_n) {
                        let taken = std::mem::replace(sub, Strexp::exp(Exp::zero()));
                        *sub = strexp_write(prop, taken, &offsets[1..], new);
                        return Strexp::Earray(size, elems, inst);
                    }
                }
                Strexp::Earray(size, elems, inst)
            }
            other => other,
        },
    }
}

/// Decompose a condition into pure refinements of `prop`.
fn prune_prop(prop: &Prop, cond: &Exp, polarity: bool) -> Vec<Prop> {
    match cond {
        Exp::UnOp(UnOp::LNot, inner) => prune_prop(prop, inner, !polarity),
        Exp::BinOp(BinOp::LAnd, a, b) => {
            if polarity {
                prune_prop(prop, a, true)
                    .iter()
                    .flat_map(|p| prune_prop(p, b, true))
                    .collect()
            } else {
                let mut out = prune_prop(prop, a, false);
                for p in prune_prop(prop, a, true) {
                    out.extend(prune_prop(&p, b, false));
                }
                out
            }
        }
        Exp::BinOp(BinOp::LOr, a, b) => {
            if polarity {
                let mut out = prune_prop(prop, a, true);
                for p in prune_prop(prop, a, false) {
                    out.extend(prune_prop(&p, b, true));
                }
                out
            } else {
                prune_prop(prop, a, false)
                    .iter()
                    .flat_map(|p| prune_prop(p, b, false))
                    .collect()
            }
        }
        Exp::BinOp(op, a, b) if op.is_comparison() => {
            let op = if polarity {
                *op
            } else {
                negate_comparison(*op)
            };
            let atom = match op {
                BinOp::Eq => return vec![prop.conjoin_eq((**a).clone(), (**b).clone())],
                BinOp::Ne => return vec![prop.conjoin_neq((**a).clone(), (**b).clone())],
                cmp => Atom::Eq(
                    Exp::bin(cmp, (**a).clone(), (**b).clone()),
                    Exp::one(),
                ),
            };
            vec![prop.atom_and(atom)]
        }
        e => {
            if polarity {
                vec![prop.conjoin_neq(e.clone(), Exp::zero())]
            } else {
                vec![prop.conjoin_eq(e.clone(), Exp::zero())]
            }
        }
    }
}

fn negate_comparison(op: BinOp) -> BinOp {
    match op {
        BinOp::Eq => BinOp::Ne,
        BinOp::Ne => BinOp::Eq,
        BinOp::Lt => BinOp::Ge,
        BinOp::Ge => BinOp::Lt,
        BinOp::Le => BinOp::Gt,
        BinOp::Gt => BinOp::Le,
        other => other,
    }
}
