//! Builtin models
//!
//! Library functions the analysis understands natively, keyed by name.
//! Allocation-family builtins attach acquire attributes; release-family
//! builtins consume them, reporting use-after-free and deallocation
//! mismatches.

use super::Executor;
use crate::errors::{AnalysisFault, ErrKind, ErrorDesc, Result};
use crate::features::driver::path::Path;
use crate::features::prop::{Hpred, Inst, Prop, Strexp};
use crate::features::prover;
use crate::shared::models::{
    Attribute, CallSite, Exp, Ident, IdentKind, Loc, ProcName, ResState, ResourceKind, Typ,
};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;

/// One builtin invocation.
pub struct BuiltinCall<'a> {
    pub name: ProcName,
    pub rets: &'a [Ident],
    pub args: &'a [(Exp, Typ)],
    pub loc: &'a Loc,
    pub prop: &'a Prop,
    pub path: &'a Path,
}

/// A builtin transfer function.
pub type BuiltinFn = fn(&mut Executor, &BuiltinCall) -> Result<Vec<(Prop, Path)>>;

static REGISTRY: Lazy<BTreeMap<&'static str, BuiltinFn>> = Lazy::new(|| {
    let mut map: BTreeMap<&'static str, BuiltinFn> = BTreeMap::new();
    map.insert("malloc", exec_alloc_memory);
    map.insert("calloc", exec_alloc_memory);
    map.insert("free", exec_free);
    map.insert("fopen", exec_fopen);
    map.insert("fclose", exec_fclose);
    map.insert("exit", exec_diverge);
    map.insert("abort", exec_diverge);
    map
});

/// Look up a builtin model by procedure name.
pub fn lookup(name: &str) -> Option<BuiltinFn> {
    REGISTRY.get(name).copied()
}

/// All builtin names, for `--print-builtins`.
pub fn names() -> Vec<&'static str> {
    REGISTRY.keys().copied().collect()
}

/// Allocate a fresh cell and acquire the resource; the allocation may also
/// fail, returning null.
fn exec_resource_alloc(
    exe: &mut Executor,
    call: &BuiltinCall,
    kind: ResourceKind,
    cell_typ: Typ,
) -> Result<Vec<(Prop, Path)>> {
    let Some(ret) = call.rets.first() else {
        return Ok(vec![(call.prop.clone(), call.path.clone())]);
    };
    let site = CallSite::new(call.name.clone(), call.loc.clone());

    // Success: a fresh non-null cell, acquire attribute on the address.
    let addr = Exp::var(exe.ctx.idgen.fresh(IdentKind::Primed));
    let contents = Exp::var(exe.ctx.idgen.fresh(IdentKind::Primed));
    let success = call
        .prop
        .sigma_star(vec![Hpred::Hpointsto(
            addr.clone(),
            Strexp::Eexp(contents, Inst::Alloc),
            Exp::sizeof(cell_typ),
        )])
        .conjoin_neq(addr.clone(), Exp::zero())
        .add_attribute(addr.clone(), Attribute::resource_acquire(kind, site))
        .conjoin_eq(Exp::var(ret.clone()), addr);

    // Failure: null return, nothing acquired.
    let failure = call
        .prop
        .conjoin_eq(Exp::var(ret.clone()), Exp::zero());

    Ok(vec![
        (success, call.path.clone()),
        (failure, call.path.clone()),
    ])
}

fn exec_alloc_memory(exe: &mut Executor, call: &BuiltinCall) -> Result<Vec<(Prop, Path)>> {
    // The allocated type comes from a sizeof argument when present.
    let cell_typ = call
        .args
        .first()
        .and_then(|(e, _)| match e {
            Exp::Sizeof(t, _) => Some(t.clone()),
            Exp::BinOp(_, a, _) => match a.as_ref() {
                Exp::Sizeof(t, _) => Some(t.clone()),
                _ => None,
            },
            _ => None,
        })
        .unwrap_or(Typ::Int);
    exec_resource_alloc(exe, call, ResourceKind::Memory, cell_typ)
}

fn exec_fopen(exe: &mut Executor, call: &BuiltinCall) -> Result<Vec<(Prop, Path)>> {
    exec_resource_alloc(exe, call, ResourceKind::File, Typ::Struct("FILE".to_string()))
}

/// Release a resource of the expected kind: removes the cell, flips the
/// attribute to Release, reports double release and kind mismatches.
fn exec_resource_release(
    exe: &mut Executor,
    call: &BuiltinCall,
    expected: ResourceKind,
) -> Result<Vec<(Prop, Path)>> {
    let Some((arg, _)) = call.args.first() else {
        return Ok(vec![(call.prop.clone(), call.path.clone())]);
    };
    let prop = call.prop.clone();
    let arg_n = prop.sub.apply_exp(arg).fold_const();

    // Releasing null is a no-op.
    if prover::check_zero(&prop, &arg_n) {
        return Ok(vec![(prop, call.path.clone())]);
    }

    // Attribute checks before touching the heap.
    for attr in prop.get_attributes(&arg_n) {
        match attr {
            Attribute::Resource {
                state: ResState::Release,
                site,
                ..
            } => {
                let mut desc = ErrorDesc::new(
                    ErrKind::UseAfterFree,
                    format!(
                        "pointer {} was already released by {} at line {}",
                        arg_n, site.pname, site.loc.line
                    ),
                    call.loc.clone(),
                    exe.pname.clone(),
                );
                desc.push_trace(
                    site.loc.clone(),
                    format!("first released by {}", site.pname),
                );
                desc.push_trace(call.loc.clone(), "released again".to_string());
                return Err(AnalysisFault::report(desc));
            }
            Attribute::Resource {
                state: ResState::Acquire,
                kind,
                site,
            } if *kind != expected => {
                let desc = ErrorDesc::new(
                    ErrKind::DeallocationMismatch,
                    format!(
                        "{} resource acquired by {} is released as {}",
                        kind, site.pname, expected
                    ),
                    call.loc.clone(),
                    exe.pname.clone(),
                );
                return Err(AnalysisFault::report(desc));
            }
            _ => {}
        }
    }

    // Materialize the cell (abducing allocation in footprint phase), then
    // consume it.
    let env = exe.env;
    let tenv = &env.program.tenv;
    let pname = exe.pname.clone();
    let iters = crate::features::rearrange::rearrange(
        exe.ctx,
        tenv,
        exe.errlog,
        &pname,
        &prop,
        &arg_n,
        &Typ::Int,
        call.loc,
    )?;

    let site = CallSite::new(call.name.clone(), call.loc.clone());
    let mut out = Vec::new();
    for iter in iters {
        let p = iter.remove_curr_then_to_prop();
        let p = p.add_attribute(
            arg_n.clone(),
            Attribute::resource_release(expected, site.clone()),
        );
        if !prover::check_inconsistency(&p) {
            out.push((p, call.path.clone()));
        }
    }
    Ok(out)
}

fn exec_free(exe: &mut Executor, call: &BuiltinCall) -> Result<Vec<(Prop, Path)>> {
    exec_resource_release(exe, call, ResourceKind::Memory)
}

fn exec_fclose(exe: &mut Executor, call: &BuiltinCall) -> Result<Vec<(Prop, Path)>> {
    exec_resource_release(exe, call, ResourceKind::File)
}

/// `exit`/`abort`: the path ends here.
fn exec_diverge(_exe: &mut Executor, _call: &BuiltinCall) -> Result<Vec<(Prop, Path)>> {
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_contains_allocation_family() {
        assert!(lookup("malloc").is_some());
        assert!(lookup("free").is_some());
        assert!(lookup("fopen").is_some());
        assert!(lookup("not_a_builtin").is_none());
    }

    #[test]
    fn test_names_sorted() {
        let names = names();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
