//! Rearrangement
//!
//! Materializes `root(lexp) |-> strexp : t` in the current proposition:
//! walks the offset path of the access, extends structs with fresh values
//! for untouched fields, case-splits array indices, unrolls list segments,
//! and — in footprint phase — synthesizes missing cells into both the
//! current heap and the footprint. Each result is a proposition iterator
//! focused on the materialized cell; an empty result list means every
//! refinement of the current path is infeasible.

use crate::config::AnalysisContext;
use crate::errors::{AnalysisFault, Bucket, ErrKind, ErrorDesc, Errlog, Result};
use crate::features::prop::{
    Atom, Hpred, Inst, LsegKind, Offset, Prop, PropIter, Strexp,
};
use crate::features::prover;
use crate::shared::models::{
    Exp, IdentKind, Loc, ProcName, ResState, Tenv, Typ,
};

/// Materialize the cell for `lexp` (typed `typ`) in `prop`.
///
/// Returns one iterator per surviving case; inconsistent refinements are
/// dropped. In re-execution phase a missing cell is a fatal fault: the
/// candidate precondition failed to cover this access.
pub fn rearrange(
    ctx: &mut AnalysisContext,
    tenv: &Tenv,
    errlog: &mut Errlog,
    pname: &ProcName,
    prop: &Prop,
    lexp: &Exp,
    typ: &Typ,
    loc: &Loc,
) -> Result<Vec<PropIter>> {
    ctx.consume_symop()?;

    let lexp_n = prop.sub.apply_exp(lexp).fold_const();
    let (root, offsets) = Offset::path_of(&lexp_n);

    check_dereference_error(ctx, tenv, errlog, pname, prop, &root, loc)?;

    // A dllseg is focused from either end; everything else by its root.
    let focus = |hp: &Hpred| match hp {
        Hpred::Hdllseg(_, _, i_f, _, _, i_b, _) => {
            prover::check_equal(prop, i_f, &root) || prover::check_equal(prop, i_b, &root)
        }
        _ => prover::check_equal(prop, hp.root(), &root),
    };
    match PropIter::find(prop, focus) {
        Some(mut iter) => {
            iter.state = offsets.clone();
            match iter.curr.clone() {
                Hpred::Hpointsto(_, _, _) => {
                    ptsto_rearrange(ctx, tenv, errlog, pname, iter, &offsets, typ, loc)
                }
                Hpred::Hlseg(kind, para, e_from, e_to, shared) => {
                    let mut out = Vec::new();
                    for case in
                        lseg_unfold_cases(ctx, &iter, kind, &para, &e_from, &e_to, &shared)
                    {
                        if prover::check_inconsistency(&case) {
                            continue;
                        }
                        out.extend(rearrange(
                            ctx, tenv, errlog, pname, &case, lexp, typ, loc,
                        )?);
                    }
                    Ok(out)
                }
                Hpred::Hdllseg(kind, para, i_f, o_b, o_f, i_b, shared) => {
                    let mut out = Vec::new();
                    for case in dllseg_unfold_cases(
                        ctx, prop, &iter, kind, &para, &root, &i_f, &o_b, &o_f, &i_b,
                        &shared,
                    ) {
                        if prover::check_inconsistency(&case) {
                            continue;
                        }
                        out.extend(rearrange(
                            ctx, tenv, errlog, pname, &case, lexp, typ, loc,
                        )?);
                    }
                    Ok(out)
                }
            }
        }
        None => {
            // Stack storage of the procedure itself (locals, the return
            // slot, seeds) is callee-owned: it materializes in either
            // phase and never becomes a precondition assumption.
            let stack_local = is_own_stack_root(pname, &root);
            let may_synthesize = ctx.in_footprint() && ctx.config.footprint;
            if may_synthesize || stack_local {
                let iter =
                    mk_ptsto_exp_footprint(ctx, prop, &root, &offsets, typ, stack_local);
                Ok(vec![iter])
            } else if ctx.in_footprint() {
                // Footprint synthesis disabled: the path is dropped, not
                // the whole candidate.
                Err(AnalysisFault::BadFootprint(format!(
                    "no heap cell for access to {}",
                    lexp_n
                )))
            } else {
                let desc = ErrorDesc::new(
                    ErrKind::BadFootprint,
                    format!("no heap cell for access to {}", lexp_n),
                    loc.clone(),
                    pname.clone(),
                );
                Err(AnalysisFault::ReExeError(Box::new(desc)))
            }
        }
    }
}

/// Dereference checks on the access root (see the defect table in the
/// module docs of `errors`): fatal defects abort the path; advisory ones
/// are logged and execution continues.
pub fn check_dereference_error(
    ctx: &mut AnalysisContext,
    tenv: &Tenv,
    errlog: &mut Errlog,
    pname: &ProcName,
    prop: &Prop,
    root: &Exp,
    loc: &Loc,
) -> Result<()> {
    // Provably null.
    if prover::check_zero(prop, root) {
        let mut desc = ErrorDesc::new(
            ErrKind::NullDereference,
            format!("pointer {} is dereferenced but is null", root),
            loc.clone(),
            pname.clone(),
        )
        .with_bucket(Bucket::B1);
        for attr in prop.get_attributes(root) {
            if let crate::shared::models::Attribute::Retval(callee) = attr {
                desc.push_trace(loc.clone(), format!("returned from {}", callee));
                desc.bucket = Some(Bucket::B2);
            }
        }
        desc.push_trace(loc.clone(), format!("pointer {} could be null", root));
        desc.push_trace(loc.clone(), "dereference".to_string());
        return Err(AnalysisFault::report(desc));
    }

    // Attributes on the root.
    for attr in prop.get_attributes(root) {
        use crate::shared::models::Attribute;
        match attr {
            Attribute::Resource {
                state: ResState::Release,
                site,
                ..
            } => {
                let mut desc = ErrorDesc::new(
                    ErrKind::UseAfterFree,
                    format!(
                        "pointer {} was released by {} and is dereferenced",
                        root, site.pname
                    ),
                    loc.clone(),
                    pname.clone(),
                );
                desc.push_trace(
                    site.loc.clone(),
                    format!("released by {}", site.pname),
                );
                desc.push_trace(loc.clone(), "use after release".to_string());
                return Err(AnalysisFault::report(desc));
            }
            Attribute::Dangling => {
                let desc = ErrorDesc::new(
                    ErrKind::DanglingPointerDereference,
                    format!("pointer {} is dangling and is dereferenced", root),
                    loc.clone(),
                    pname.clone(),
                );
                return Err(AnalysisFault::report(desc));
            }
            Attribute::Undef { callee, .. } => {
                // Advisory: the value came from a skipped function.
                errlog.log(
                    ErrorDesc::new(
                        ErrKind::SkipPointerDereference,
                        format!(
                            "pointer {} returned by skipped function {} is dereferenced",
                            root, callee
                        ),
                        loc.clone(),
                        pname.clone(),
                    ),
                    ctx.phase.as_str(),
                );
            }
            _ => {}
        }
    }

    // Provably -1 (failed allocation idiom).
    if prover::check_equal(prop, root, &Exp::minus_one()) {
        let desc = ErrorDesc::new(
            ErrKind::DanglingPointerDereference,
            format!("pointer {} has value -1 and is dereferenced", root),
            loc.clone(),
            pname.clone(),
        );
        return Err(AnalysisFault::report(desc));
    }

    // Value of a @Nullable field, not yet null-checked.
    if ctx.config.report_nullable_inconsistency && !prover::check_nonzero(prop, root) {
        if let Some(field) = nullable_field_source(tenv, prop, root) {
            errlog.log(
                ErrorDesc::new(
                    ErrKind::NullDereference,
                    format!(
                        "pointer {} from nullable field {} is dereferenced without a null check",
                        root, field
                    ),
                    loc.clone(),
                    pname.clone(),
                )
                .with_bucket(Bucket::B2),
                ctx.phase.as_str(),
            );
        }
    }

    Ok(())
}

/// Is `root` the stored value of some `@Nullable`-annotated field?
fn nullable_field_source(tenv: &Tenv, prop: &Prop, root: &Exp) -> Option<String> {
    for hp in &prop.sigma {
        if let Hpred::Hpointsto(_, Strexp::Estruct(fields, _), texp) = hp {
            let sname = match texp {
                Exp::Sizeof(Typ::Struct(s), _) => s,
                _ => continue,
            };
            for (fld, se) in fields {
                if let Some(decl) = tenv.field_of(sname, fld) {
                    if decl.is_nullable() && se.as_exp() == Some(root) {
                        return Some(format!("{}.{}", sname, fld));
                    }
                }
            }
        }
    }
    None
}

/// Bounds classification for one array access.
///
/// L1 (provably out of bounds) is fatal; L2 (constant size, inclusion not
/// provable) and L3 (unknown bounds) are logged as warnings.
pub fn check_bounds(
    ctx: &mut AnalysisContext,
    errlog: &mut Errlog,
    pname: &ProcName,
    prop: &Prop,
    size: &Exp,
    index: &Exp,
    loc: &Loc,
) -> Result<()> {
    let in_lower = prover::check_le(prop, &Exp::zero(), index);
    let in_upper = prover::check_lt(prop, index, size);
    if in_lower && in_upper {
        return Ok(());
    }

    let provably_out =
        prover::check_le(prop, size, index) || prover::check_lt(prop, index, &Exp::zero());
    if provably_out {
        let desc = ErrorDesc::new(
            ErrKind::ArrayOutOfBoundsL1,
            format!("index {} is out of bounds for array of size {}", index, size),
            loc.clone(),
            pname.clone(),
        );
        return Err(AnalysisFault::report(desc));
    }

    let kind = if size.as_int().is_some() {
        ErrKind::ArrayOutOfBoundsL2
    } else {
        ErrKind::ArrayOutOfBoundsL3
    };
    errlog.log(
        ErrorDesc::new(
            kind,
            format!(
                "index {} may be out of bounds for array of size {}",
                index, size
            ),
            loc.clone(),
            pname.clone(),
        ),
        ctx.phase.as_str(),
    );
    Ok(())
}

/// Rearrange within a points-to: walk the offsets, extending the stored
/// value where the access needs structure it does not have yet.
#[allow(clippy::too_many_arguments)]
fn ptsto_rearrange(
    ctx: &mut AnalysisContext,
    tenv: &Tenv,
    errlog: &mut Errlog,
    pname: &ProcName,
    iter: PropIter,
    offsets: &[Offset],
    typ: &Typ,
    loc: &Loc,
) -> Result<Vec<PropIter>> {
    let (root, se, texp) = match &iter.curr {
        Hpred::Hpointsto(root, se, texp) => (root.clone(), se.clone(), texp.clone()),
        _ => return Err(AnalysisFault::Internal("ptsto_rearrange on non-ptsto".into())),
    };

    // Pointer-size check on leaf accesses.
    if offsets.is_empty() {
        if let Exp::Sizeof(stored_t, _) = &texp {
            if !prover::check_type_size_leq(tenv, typ, stored_t) {
                errlog.log(
                    ErrorDesc::new(
                        ErrKind::PointerSizeMismatch,
                        format!(
                            "access of type {} to cell of type {}",
                            typ, stored_t
                        ),
                        loc.clone(),
                        pname.clone(),
                    ),
                    ctx.phase.as_str(),
                );
            }
        }
    }

    let base_prop = iter.to_prop();
    let footprint_root = iter
        .sigma_fp
        .iter()
        .any(|hp| matches!(hp, Hpred::Hpointsto(r, _, _) if *r == root));

    let variants = extend_strexp(ctx, &base_prop, se, offsets, footprint_root)?;

    let mut out = Vec::new();
    for variant in variants {
        let mut it = iter.clone();
        it.curr = Hpred::Hpointsto(root.clone(), variant.se, texp.clone());
        for atom in variant.new_pi {
            it.add_atom(atom);
        }
        if footprint_root {
            // Mirror the extension into the footprint cell so the inferred
            // precondition requires what this access touched.
            for hp in it.sigma_fp.iter_mut() {
                if let Hpred::Hpointsto(r, fp_se, _) = hp {
                    if *r == root {
                        *fp_se = merge_footprint_strexp(fp_se.clone(), &it.curr);
                    }
                }
            }
        }
        for (size, index) in &variant.bounds {
            check_bounds(ctx, errlog, pname, &base_prop, size, index, loc)?;
        }
        let prop = it.to_prop();
        if prover::check_inconsistency(&prop) {
            continue;
        }
        out.push(it);
    }
    Ok(out)
}

/// The footprint cell keeps the extended shape of the current cell.
fn merge_footprint_strexp(fp_se: Strexp, curr: &Hpred) -> Strexp {
    match curr {
        Hpred::Hpointsto(_, se, _) => match (&fp_se, se) {
            // Same shape family: adopt the extended one.
            (Strexp::Eexp(_, _), _) => se.clone(),
            (Strexp::Estruct(_, _), Strexp::Estruct(_, _)) => se.clone(),
            (Strexp::Earray(_, _, _), Strexp::Earray(_, _, _)) => se.clone(),
            _ => fp_se,
        },
        _ => fp_se,
    }
}

struct ExtVariant {
    se: Strexp,
    new_pi: Vec<Atom>,
    bounds: Vec<(Exp, Exp)>,
}

/// Extend a structured value so the offset path exists; array indices may
/// case-split into several variants.
fn extend_strexp(
    ctx: &mut AnalysisContext,
    prop: &Prop,
    se: Strexp,
    offsets: &[Offset],
    footprint_cell: bool,
) -> Result<Vec<ExtVariant>> {
    let Some(first) = offsets.first() else {
        return Ok(vec![ExtVariant {
            se,
            new_pi: Vec::new(),
            bounds: Vec::new(),
        }]);
    };

    let fresh_kind = if ctx.in_footprint() && footprint_cell {
        IdentKind::Footprint
    } else {
        IdentKind::Primed
    };

    match first {
        Offset::Fld(fld, _) => {
            let (mut fields, inst) = match se {
                Strexp::Estruct(fields, inst) => (fields, inst),
                // A leaf being refined into a struct: the stored scalar is
                // forgotten in favor of the structured view.
                Strexp::Eexp(_, inst) => (Vec::new(), inst),
                Strexp::Earray(_, _, _) => {
                    return Err(AnalysisFault::MissingFld(fld.clone()))
                }
            };
            let sub_se = match fields.iter().position(|(f, _)| f == fld) {
                Some(pos) => fields.remove(pos).1,
                None => {
                    if !ctx.in_footprint() {
                        return Err(AnalysisFault::MissingFld(fld.clone()));
                    }
                    Strexp::Eexp(Exp::var(ctx.idgen.fresh(fresh_kind)), Inst::None)
                }
            };
            let variants = extend_strexp(ctx, prop, sub_se, &offsets[1..], footprint_cell)?;
            Ok(variants
                .into_iter()
                .map(|v| {
                    let mut fields = fields.clone();
                    fields.push((fld.clone(), v.se));
                    fields.sort_by(|a, b| a.0.cmp(&b.0));
                    ExtVariant {
                        se: Strexp::Estruct(fields, inst.clone()),
                        new_pi: v.new_pi,
                        bounds: v.bounds,
                    }
                })
                .collect())
        }
        Offset::Index(idx) => {
            let idx = prop.sub.apply_exp(idx).fold_const();
            let (size, elems, inst) = match se {
                Strexp::Earray(size, elems, inst) => (size, elems, inst),
                // A scalar cell indexed as an array of one element.
                Strexp::Eexp(e, inst) => (
                    Exp::one(),
                    vec![(Exp::zero(), Strexp::Eexp(e, Inst::None))],
                    inst,
                ),
                Strexp::Estruct(_, _) => {
                    return Err(AnalysisFault::Internal(
                        "array access into struct value".into(),
                    ))
                }
            };

            let mut variants = Vec::new();

            // Case: the index aliases an element already present.
            let mut provably_present = false;
            for (j, (e_idx, e_se)) in elems.iter().enumerate() {
                if prover::check_disequal(prop, &idx, e_idx) {
                    continue;
                }
                let equal = prover::check_equal(prop, &idx, e_idx);
                provably_present |= equal;
                let subs = extend_strexp(
                    ctx,
                    prop,
                    e_se.clone(),
                    &offsets[1..],
                    footprint_cell,
                )?;
                for v in subs {
                    let mut new_elems = elems.clone();
                    new_elems[j].1 = v.se;
                    let mut new_pi = v.new_pi;
                    if !equal {
                        new_pi.push(Atom::Eq(idx.clone(), e_idx.clone()));
                    }
                    let mut bounds = v.bounds;
                    bounds.push((size.clone(), idx.clone()));
                    variants.push(ExtVariant {
                        se: Strexp::Earray(size.clone(), new_elems, inst.clone()),
                        new_pi,
                        bounds,
                    });
                }
                if equal {
                    break;
                }
            }

            // Case: the index denotes a fresh element.
            if !provably_present {
                let fresh_leaf =
                    Strexp::Eexp(Exp::var(ctx.idgen.fresh(fresh_kind)), Inst::None);
                let subs =
                    extend_strexp(ctx, prop, fresh_leaf, &offsets[1..], footprint_cell)?;
                for v in subs {
                    let mut new_elems = elems.clone();
                    new_elems.push((idx.clone(), v.se));
                    let mut new_pi = v.new_pi;
                    for (e_idx, _) in &elems {
                        new_pi.push(Atom::Neq(idx.clone(), e_idx.clone()));
                    }
                    let mut bounds = v.bounds;
                    bounds.push((size.clone(), idx.clone()));
                    variants.push(ExtVariant {
                        se: Strexp::Earray(size.clone(), new_elems, inst.clone()),
                        new_pi,
                        bounds,
                    });
                }
            }

            Ok(variants)
        }
    }
}

/// Is `root` the stack slot of a local, the return slot, or a seed of the
/// procedure currently being analyzed?
fn is_own_stack_root(pname: &ProcName, root: &Exp) -> bool {
    use crate::shared::models::PvarKind;
    matches!(
        root,
        Exp::Lvar(pv) if pv.proc == *pname
            && matches!(pv.kind, PvarKind::Local | PvarKind::Ret | PvarKind::Seed)
    )
}

/// Synthesize a fresh cell for `root` in the current heap and — when the
/// root is caller-visible — in the footprint (footprint phase only). A
/// root mentioning primed existentials, or naming the procedure's own
/// stack storage, is invisible to callers: no precondition assumption is
/// recorded for it.
fn mk_ptsto_exp_footprint(
    ctx: &mut AnalysisContext,
    prop: &Prop,
    root: &Exp,
    offsets: &[Offset],
    typ: &Typ,
    own_stack: bool,
) -> PropIter {
    let caller_visible =
        !own_stack && root.fv().iter().all(|id| !id.is_primed()) && ctx.in_footprint();
    let leaf_kind = if caller_visible {
        IdentKind::Footprint
    } else {
        IdentKind::Primed
    };
    let se = strexp_of_offsets(ctx, offsets, leaf_kind);
    let texp = match offsets.first() {
        None => Exp::sizeof(typ.clone()),
        Some(Offset::Fld(_, owner)) => Exp::sizeof(owner.clone()),
        Some(Offset::Index(_)) => Exp::sizeof(Typ::array_of(typ.clone(), None)),
    };
    let cell = Hpred::Hpointsto(root.clone(), se, texp);

    let mut p = prop.clone();
    p.sigma.push(cell.clone());
    if caller_visible {
        p.sigma_fp.push(cell);
    }
    let p = p.normalize();

    let mut iter = PropIter::find(&p, |hp| {
        matches!(hp, Hpred::Hpointsto(r, _, _) if r == root)
    })
    .expect("cell was just inserted");
    iter.state = offsets.to_vec();
    iter
}

/// Build the skeleton strexp for an offset path, every leaf a fresh
/// variable of the requested kind.
fn strexp_of_offsets(
    ctx: &mut AnalysisContext,
    offsets: &[Offset],
    leaf_kind: IdentKind,
) -> Strexp {
    match offsets.first() {
        None => Strexp::Eexp(Exp::var(ctx.idgen.fresh(leaf_kind)), Inst::None),
        Some(Offset::Fld(fld, _)) => Strexp::Estruct(
            vec![(fld.clone(), strexp_of_offsets(ctx, &offsets[1..], leaf_kind))],
            Inst::None,
        ),
        Some(Offset::Index(idx)) => Strexp::Earray(
            Exp::var(ctx.idgen.fresh(leaf_kind)),
            vec![(idx.clone(), strexp_of_offsets(ctx, &offsets[1..], leaf_kind))],
            Inst::None,
        ),
    }
}

/// Unfold cases for a singly-linked segment focused by `iter`.
fn lseg_unfold_cases(
    ctx: &mut AnalysisContext,
    iter: &PropIter,
    kind: LsegKind,
    para: &crate::features::prop::HparaBody,
    e_from: &Exp,
    e_to: &Exp,
    shared: &[Exp],
) -> Vec<Prop> {
    let mut cases = Vec::new();

    // Segment of exactly one cell.
    {
        let mut it = iter.clone();
        let body = para.instantiate(&mut ctx.idgen, e_from, e_to, shared);
        replace_curr_with(&mut it, body);
        cases.push(it.to_prop());
    }

    // Cell plus a non-empty tail.
    {
        let mut it = iter.clone();
        let fresh_next = Exp::var(ctx.idgen.fresh(IdentKind::Primed));
        let mut body = para.instantiate(&mut ctx.idgen, e_from, &fresh_next, shared);
        body.push(Hpred::Hlseg(
            LsegKind::NE,
            para.clone(),
            fresh_next,
            e_to.clone(),
            shared.to_vec(),
        ));
        replace_curr_with(&mut it, body);
        cases.push(it.to_prop());
    }

    // Possibly-empty: the segment may be gone entirely.
    if kind == LsegKind::PE {
        let it = iter.clone();
        let p = it
            .remove_curr_then_to_prop()
            .conjoin_eq(e_from.clone(), e_to.clone());
        cases.push(p);
    }

    cases
}

/// Unfold cases for a doubly-linked segment; which endpoint matched the
/// access root decides the direction.
#[allow(clippy::too_many_arguments)]
fn dllseg_unfold_cases(
    ctx: &mut AnalysisContext,
    prop: &Prop,
    iter: &PropIter,
    kind: LsegKind,
    para: &crate::features::prop::HparaDll,
    root: &Exp,
    i_f: &Exp,
    o_b: &Exp,
    o_f: &Exp,
    i_b: &Exp,
    shared: &[Exp],
) -> Vec<Prop> {
    let mut cases = Vec::new();
    let from_front = prover::check_equal(prop, root, i_f);

    // Segment of exactly one cell (front and back coincide).
    {
        let mut it = iter.clone();
        let body = para.instantiate(&mut ctx.idgen, i_f, o_b, o_f, shared);
        replace_curr_with(&mut it, body);
        cases.push(it.to_prop().conjoin_eq(i_f.clone(), i_b.clone()));
    }

    if from_front {
        // Front cell plus a non-empty rest.
        let mut it = iter.clone();
        let fresh_next = Exp::var(ctx.idgen.fresh(IdentKind::Primed));
        let mut body = para.instantiate(&mut ctx.idgen, i_f, o_b, &fresh_next, shared);
        body.push(Hpred::Hdllseg(
            LsegKind::NE,
            para.clone(),
            fresh_next.clone(),
            i_f.clone(),
            o_f.clone(),
            i_b.clone(),
            shared.to_vec(),
        ));
        replace_curr_with(&mut it, body);
        cases.push(it.to_prop());
    } else {
        // Back cell plus a non-empty front part.
        let mut it = iter.clone();
        let fresh_prev = Exp::var(ctx.idgen.fresh(IdentKind::Primed));
        let mut body = para.instantiate(&mut ctx.idgen, i_b, &fresh_prev, o_f, shared);
        body.push(Hpred::Hdllseg(
            LsegKind::NE,
            para.clone(),
            i_f.clone(),
            o_b.clone(),
            i_b.clone(),
            fresh_prev,
            shared.to_vec(),
        ));
        replace_curr_with(&mut it, body);
        cases.push(it.to_prop());
    }

    // Possibly-empty: both ends collapse.
    if kind == LsegKind::PE {
        let it = iter.clone();
        let p = it
            .remove_curr_then_to_prop()
            .conjoin_eq(i_f.clone(), o_f.clone())
            .conjoin_eq(i_b.clone(), o_b.clone());
        cases.push(p);
    }

    cases
}

fn replace_curr_with(iter: &mut PropIter, mut hpreds: Vec<Hpred>) {
    match hpreds.pop() {
        Some(last) => {
            iter.before.extend(hpreds);
            iter.curr = last;
        }
        None => {
            // Empty body template: the focus degrades to an empty cell.
            iter.curr = Hpred::Hpointsto(
                Exp::zero(),
                Strexp::exp(Exp::zero()),
                Exp::sizeof(Typ::Void),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnalysisConfig, Phase};
    use crate::features::prop::HparaBody;
    use crate::shared::models::{Ident, Pvar};

    fn ctx() -> AnalysisContext {
        AnalysisContext::new(AnalysisConfig::default())
    }

    fn base_args() -> (Tenv, Errlog, ProcName, Loc) {
        (Tenv::new(), Errlog::new(), "f".to_string(), Loc::new("a.c", 3, 1))
    }

    #[test]
    fn test_footprint_synthesis_on_missing_cell() {
        let mut ctx = ctx();
        let (tenv, mut errlog, pname, loc) = base_args();
        let mut idg = crate::shared::models::IdentGenerator::new();
        // A caller-visible root: the value of some formal.
        let v = Exp::var(idg.fresh(IdentKind::Footprint));
        let prop = Prop::emp().conjoin_neq(v.clone(), Exp::zero());

        let iters = rearrange(
            &mut ctx, &tenv, &mut errlog, &pname, &prop, &v, &Typ::Int, &loc,
        )
        .unwrap();
        assert_eq!(iters.len(), 1);
        let prop = iters[0].to_prop();
        assert_eq!(prop.sigma.len(), 1);
        assert_eq!(prop.sigma_fp.len(), 1, "footprint must record the assumption");
        assert!(prop.footprint_vars_ok());
    }

    #[test]
    fn test_local_storage_never_enters_footprint() {
        let mut ctx = ctx();
        let (tenv, mut errlog, pname, loc) = base_args();
        let p = Exp::Lvar(Pvar::local("p", "f"));

        let iters = rearrange(
            &mut ctx, &tenv, &mut errlog, &pname, &Prop::emp(), &p, &Typ::Int, &loc,
        )
        .unwrap();
        assert_eq!(iters.len(), 1);
        let prop = iters[0].to_prop();
        assert_eq!(prop.sigma.len(), 1);
        assert!(prop.sigma_fp.is_empty(), "local storage is callee-owned");
    }

    #[test]
    fn test_reexecution_rejects_missing_heap_cell() {
        let mut ctx = ctx();
        let (tenv, mut errlog, pname, loc) = base_args();
        let mut idg = crate::shared::models::IdentGenerator::new();
        let v = Exp::var(idg.fresh(IdentKind::Footprint));
        let prop = Prop::emp().conjoin_neq(v.clone(), Exp::zero());

        let r = ctx.with_phase(Phase::ReExecution, |ctx| {
            rearrange(ctx, &tenv, &mut errlog, &pname, &prop, &v, &Typ::Int, &loc)
        });
        assert!(matches!(r, Err(AnalysisFault::ReExeError(_))));
    }

    #[test]
    fn test_reexecution_still_materializes_local_storage() {
        let mut ctx = ctx();
        let (tenv, mut errlog, pname, loc) = base_args();
        let p = Exp::Lvar(Pvar::local("p", "f"));

        let r = ctx.with_phase(Phase::ReExecution, |ctx| {
            rearrange(ctx, &tenv, &mut errlog, &pname, &Prop::emp(), &p, &Typ::Int, &loc)
        });
        assert_eq!(r.unwrap().len(), 1);
    }

    #[test]
    fn test_null_root_is_fatal() {
        let mut ctx = ctx();
        let (tenv, mut errlog, pname, loc) = base_args();
        let mut idg = crate::shared::models::IdentGenerator::new();
        let n = idg.fresh(IdentKind::Normal);
        let prop = Prop::emp().conjoin_eq(Exp::var(n.clone()), Exp::zero());

        let r = rearrange(
            &mut ctx,
            &tenv,
            &mut errlog,
            &pname,
            &prop,
            &Exp::var(n),
            &Typ::Int,
            &loc,
        );
        match r {
            Err(AnalysisFault::Report(desc)) => {
                assert_eq!(desc.kind, ErrKind::NullDereference)
            }
            other => panic!("expected null dereference, got {:?}", other),
        }
    }

    #[test]
    fn test_struct_field_extension() {
        let mut ctx = ctx();
        let (tenv, mut errlog, pname, loc) = base_args();
        let p = Exp::Lvar(Pvar::local("p", "f"));
        let owner = Typ::Struct("node".to_string());
        let lexp = Exp::field(p.clone(), "next", owner);

        let iters = rearrange(
            &mut ctx,
            &tenv,
            &mut errlog,
            &pname,
            &Prop::emp(),
            &lexp,
            &Typ::ptr_to(Typ::Int),
            &loc,
        )
        .unwrap();
        assert_eq!(iters.len(), 1);
        match &iters[0].curr {
            Hpred::Hpointsto(_, se, _) => assert!(se.field("next").is_some()),
            _ => panic!("expected points-to"),
        }
    }

    #[test]
    fn test_array_out_of_bounds_l1() {
        let mut ctx = ctx();
        let (tenv, mut errlog, pname, loc) = base_args();
        let a = Exp::Lvar(Pvar::local("a", "f"));
        let cell = Hpred::Hpointsto(
            a.clone(),
            Strexp::Earray(Exp::int(4), vec![], Inst::None),
            Exp::sizeof(Typ::array_of(Typ::Int, Some(4))),
        );
        let prop = Prop::emp().sigma_star(vec![cell]);
        let lexp = Exp::index(a, Exp::int(5));

        let r = rearrange(
            &mut ctx, &tenv, &mut errlog, &pname, &prop, &lexp, &Typ::Int, &loc,
        );
        match r {
            Err(AnalysisFault::Report(desc)) => {
                assert_eq!(desc.kind, ErrKind::ArrayOutOfBoundsL1)
            }
            other => panic!("expected L1 bounds error, got {:?}", other),
        }
    }

    #[test]
    fn test_array_in_bounds_access() {
        let mut ctx = ctx();
        let (tenv, mut errlog, pname, loc) = base_args();
        let a = Exp::Lvar(Pvar::local("a", "f"));
        let cell = Hpred::Hpointsto(
            a.clone(),
            Strexp::Earray(Exp::int(4), vec![], Inst::None),
            Exp::sizeof(Typ::array_of(Typ::Int, Some(4))),
        );
        let prop = Prop::emp().sigma_star(vec![cell]);
        let lexp = Exp::index(a, Exp::int(2));

        let iters = rearrange(
            &mut ctx, &tenv, &mut errlog, &pname, &prop, &lexp, &Typ::Int, &loc,
        )
        .unwrap();
        assert_eq!(iters.len(), 1);
        assert!(errlog.is_empty());
    }

    #[test]
    fn test_lseg_ne_unfold_materializes_cell() {
        let mut ctx = ctx();
        let (tenv, mut errlog, pname, loc) = base_args();

        let root_id = Ident::new(IdentKind::Primed, "p", 100);
        let next_id = Ident::new(IdentKind::Primed, "p", 101);
        let node_t = Typ::Struct("node".to_string());
        let para = HparaBody {
            root: root_id.clone(),
            next: next_id.clone(),
            svars: vec![],
            evars: vec![],
            body: vec![Hpred::Hpointsto(
                Exp::var(root_id),
                Strexp::Estruct(
                    vec![("next".to_string(), Strexp::Eexp(Exp::var(next_id), Inst::None))],
                    Inst::None,
                ),
                Exp::sizeof(node_t.clone()),
            )],
        };

        let x = Exp::Lvar(Pvar::local("x", "f"));
        let prop = Prop::emp().sigma_star(vec![Hpred::Hlseg(
            LsegKind::NE,
            para,
            x.clone(),
            Exp::zero(),
            vec![],
        )]);

        let lexp = Exp::field(x, "next", node_t);
        let iters = rearrange(
            &mut ctx,
            &tenv,
            &mut errlog,
            &pname,
            &prop,
            &lexp,
            &Typ::ptr_to(Typ::Int),
            &loc,
        )
        .unwrap();

        // One iterator per unfold case, each focused on a real cell.
        assert_eq!(iters.len(), 2);
        for it in &iters {
            assert!(it.curr.is_pointsto());
        }
    }
}
