//! Expressions and program variables

use super::attribute::Attribute;
use super::ident::Ident;
use super::typ::{FieldName, Subtype, Typ};
use super::ProcName;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Program-variable kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PvarKind {
    /// Local of the owning procedure.
    Local,
    /// Global variable.
    Global,
    /// Formal of a callee, seeded into the caller during tabulation.
    Callee(ProcName),
    /// Seed copy of a formal/global, anchoring the footprint.
    Seed,
    /// Variable abduced during bi-abduction.
    Abducted,
    /// Return slot of the owning procedure.
    Ret,
}

/// A program variable, scoped to a procedure.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pvar {
    pub name: String,
    pub proc: ProcName,
    pub kind: PvarKind,
}

impl Pvar {
    pub fn local(name: impl Into<String>, proc: impl Into<ProcName>) -> Self {
        Self {
            name: name.into(),
            proc: proc.into(),
            kind: PvarKind::Local,
        }
    }

    pub fn global(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            proc: ProcName::new(),
            kind: PvarKind::Global,
        }
    }

    pub fn callee(name: impl Into<String>, callee: impl Into<ProcName>) -> Self {
        let callee = callee.into();
        Self {
            name: name.into(),
            proc: callee.clone(),
            kind: PvarKind::Callee(callee),
        }
    }

    pub fn seed(name: impl Into<String>, proc: impl Into<ProcName>) -> Self {
        Self {
            name: name.into(),
            proc: proc.into(),
            kind: PvarKind::Seed,
        }
    }

    /// The return slot of `proc`.
    pub fn ret_var(proc: impl Into<ProcName>) -> Self {
        Self {
            name: "return".to_string(),
            proc: proc.into(),
            kind: PvarKind::Ret,
        }
    }

    pub fn is_global(&self) -> bool {
        self.kind == PvarKind::Global
    }

    pub fn is_local(&self) -> bool {
        self.kind == PvarKind::Local
    }

    pub fn is_ret(&self) -> bool {
        self.kind == PvarKind::Ret
    }

    pub fn is_callee(&self) -> bool {
        matches!(self.kind, PvarKind::Callee(_))
    }

    pub fn is_seed(&self) -> bool {
        self.kind == PvarKind::Seed
    }

    /// Seed copy of this variable.
    pub fn to_seed(&self) -> Pvar {
        Pvar {
            name: self.name.clone(),
            proc: self.proc.clone(),
            kind: PvarKind::Seed,
        }
    }
}

impl fmt::Display for Pvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            PvarKind::Global => write!(f, "#GB${}", self.name),
            PvarKind::Callee(callee) => write!(f, "{}|{}", self.name, callee),
            PvarKind::Seed => write!(f, "old_{}", self.name),
            _ => write!(f, "{}", self.name),
        }
    }
}

/// Unary operators.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum UnOp {
    Neg,
    BNot,
    LNot,
}

/// Binary operators.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum BinOp {
    Plus,
    Minus,
    Mult,
    Div,
    Mod,
    ShiftL,
    ShiftR,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    BAnd,
    BXor,
    BOr,
    LAnd,
    LOr,
}

impl BinOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge | BinOp::Eq | BinOp::Ne
        )
    }
}

/// Constants.
///
/// Equality, ordering and hashing are manual because of the float payload
/// (compared by bit pattern so that `Exp` stays `Eq + Ord + Hash`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Const {
    Int(i64),
    Float(f64),
    Str(String),
    Fun(ProcName),
    Class(String),
    /// Attribute constant; only appears inside attribute atoms.
    Attr(Attribute),
}

impl Const {
    fn rank(&self) -> u8 {
        match self {
            Const::Int(_) => 0,
            Const::Float(_) => 1,
            Const::Str(_) => 2,
            Const::Fun(_) => 3,
            Const::Class(_) => 4,
            Const::Attr(_) => 5,
        }
    }
}

impl PartialEq for Const {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Const::Int(a), Const::Int(b)) => a == b,
            (Const::Float(a), Const::Float(b)) => a.to_bits() == b.to_bits(),
            (Const::Str(a), Const::Str(b)) => a == b,
            (Const::Fun(a), Const::Fun(b)) => a == b,
            (Const::Class(a), Const::Class(b)) => a == b,
            (Const::Attr(a), Const::Attr(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Const {}

impl PartialOrd for Const {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Const {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Const::Int(a), Const::Int(b)) => a.cmp(b),
            (Const::Float(a), Const::Float(b)) => a.total_cmp(b),
            (Const::Str(a), Const::Str(b)) => a.cmp(b),
            (Const::Fun(a), Const::Fun(b)) => a.cmp(b),
            (Const::Class(a), Const::Class(b)) => a.cmp(b),
            (Const::Attr(a), Const::Attr(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for Const {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Const::Int(v) => v.hash(state),
            Const::Float(v) => v.to_bits().hash(state),
            Const::Str(v) => v.hash(state),
            Const::Fun(v) => v.hash(state),
            Const::Class(v) => v.hash(state),
            Const::Attr(v) => v.hash(state),
        }
    }
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::Int(v) => write!(f, "{}", v),
            Const::Float(v) => write!(f, "{}", v),
            Const::Str(v) => write!(f, "\"{}\"", v),
            Const::Fun(v) => write!(f, "_fun_{}", v),
            Const::Class(v) => write!(f, "class {}", v),
            Const::Attr(a) => write!(f, "ATTR({})", a),
        }
    }
}

/// Expressions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Exp {
    Var(Ident),
    Const(Const),
    UnOp(UnOp, Box<Exp>),
    BinOp(BinOp, Box<Exp>, Box<Exp>),
    Cast(Typ, Box<Exp>),
    Lvar(Pvar),
    Lfield(Box<Exp>, FieldName, Typ),
    Lindex(Box<Exp>, Box<Exp>),
    Sizeof(Typ, Subtype),
}

impl Exp {
    pub fn int(v: i64) -> Self {
        Exp::Const(Const::Int(v))
    }

    pub fn zero() -> Self {
        Exp::int(0)
    }

    pub fn one() -> Self {
        Exp::int(1)
    }

    pub fn minus_one() -> Self {
        Exp::int(-1)
    }

    /// The null pointer.
    pub fn null() -> Self {
        Exp::zero()
    }

    pub fn var(id: Ident) -> Self {
        Exp::Var(id)
    }

    pub fn fun(name: impl Into<ProcName>) -> Self {
        Exp::Const(Const::Fun(name.into()))
    }

    pub fn bin(op: BinOp, a: Exp, b: Exp) -> Self {
        Exp::BinOp(op, Box::new(a), Box::new(b))
    }

    pub fn field(base: Exp, fld: impl Into<FieldName>, typ: Typ) -> Self {
        Exp::Lfield(Box::new(base), fld.into(), typ)
    }

    pub fn index(base: Exp, idx: Exp) -> Self {
        Exp::Lindex(Box::new(base), Box::new(idx))
    }

    pub fn sizeof(typ: Typ) -> Self {
        Exp::Sizeof(typ, Subtype::Exact)
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Exp::Const(Const::Int(0)))
    }

    pub fn is_null_literal(&self) -> bool {
        self.is_zero()
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Exp::Const(Const::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// The root of an lvalue path: strips field and index offsets.
    pub fn root(&self) -> &Exp {
        match self {
            Exp::Lfield(base, _, _) => base.root(),
            Exp::Lindex(base, _) => base.root(),
            Exp::Cast(_, e) => e.root(),
            _ => self,
        }
    }

    /// Collect free identifiers into `acc` (deterministic order).
    pub fn fv_into(&self, acc: &mut BTreeSet<Ident>) {
        match self {
            Exp::Var(id) => {
                acc.insert(id.clone());
            }
            Exp::Const(_) | Exp::Lvar(_) | Exp::Sizeof(_, _) => {}
            Exp::UnOp(_, e) | Exp::Cast(_, e) => e.fv_into(acc),
            Exp::BinOp(_, a, b) => {
                a.fv_into(acc);
                b.fv_into(acc);
            }
            Exp::Lfield(base, _, _) => base.fv_into(acc),
            Exp::Lindex(base, idx) => {
                base.fv_into(acc);
                idx.fv_into(acc);
            }
        }
    }

    /// Free identifiers of this expression.
    pub fn fv(&self) -> BTreeSet<Ident> {
        let mut acc = BTreeSet::new();
        self.fv_into(&mut acc);
        acc
    }

    /// Constant folding for integer arithmetic and comparisons. Returns
    /// the input unchanged when no rule applies.
    pub fn fold_const(self) -> Exp {
        match self {
            Exp::UnOp(op, e) => {
                let e = e.fold_const();
                match (&op, e.as_int()) {
                    (UnOp::Neg, Some(v)) => Exp::int(v.wrapping_neg()),
                    (UnOp::BNot, Some(v)) => Exp::int(!v),
                    (UnOp::LNot, Some(v)) => Exp::int((v == 0) as i64),
                    _ => Exp::UnOp(op, Box::new(e)),
                }
            }
            Exp::BinOp(op, a, b) => {
                let a = a.fold_const();
                let b = b.fold_const();
                match (a.as_int(), b.as_int()) {
                    (Some(x), Some(y)) => match op {
                        BinOp::Plus => Exp::int(x.wrapping_add(y)),
                        BinOp::Minus => Exp::int(x.wrapping_sub(y)),
                        BinOp::Mult => Exp::int(x.wrapping_mul(y)),
                        BinOp::Div if y != 0 => Exp::int(x.wrapping_div(y)),
                        BinOp::Mod if y != 0 => Exp::int(x.wrapping_rem(y)),
                        BinOp::Lt => Exp::int((x < y) as i64),
                        BinOp::Gt => Exp::int((x > y) as i64),
                        BinOp::Le => Exp::int((x <= y) as i64),
                        BinOp::Ge => Exp::int((x >= y) as i64),
                        BinOp::Eq => Exp::int((x == y) as i64),
                        BinOp::Ne => Exp::int((x != y) as i64),
                        BinOp::BAnd => Exp::int(x & y),
                        BinOp::BXor => Exp::int(x ^ y),
                        BinOp::BOr => Exp::int(x | y),
                        BinOp::LAnd => Exp::int(((x != 0) && (y != 0)) as i64),
                        BinOp::LOr => Exp::int(((x != 0) || (y != 0)) as i64),
                        _ => Exp::BinOp(op, Box::new(a), Box::new(b)),
                    },
                    // Additive identities keep offsets canonical.
                    (_, Some(0)) if matches!(op, BinOp::Plus | BinOp::Minus) => a,
                    (Some(0), _) if matches!(op, BinOp::Plus) => b,
                    _ => Exp::BinOp(op, Box::new(a), Box::new(b)),
                }
            }
            Exp::Cast(t, e) => Exp::Cast(t, Box::new(e.fold_const())),
            Exp::Lfield(base, f, t) => Exp::Lfield(Box::new(base.fold_const()), f, t),
            Exp::Lindex(base, idx) => {
                Exp::Lindex(Box::new(base.fold_const()), Box::new(idx.fold_const()))
            }
            other => other,
        }
    }
}

impl fmt::Display for Exp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exp::Var(id) => write!(f, "{}", id),
            Exp::Const(c) => write!(f, "{}", c),
            Exp::UnOp(op, e) => {
                let sym = match op {
                    UnOp::Neg => "-",
                    UnOp::BNot => "~",
                    UnOp::LNot => "!",
                };
                write!(f, "{}{}", sym, e)
            }
            Exp::BinOp(op, a, b) => {
                let sym = match op {
                    BinOp::Plus => "+",
                    BinOp::Minus => "-",
                    BinOp::Mult => "*",
                    BinOp::Div => "/",
                    BinOp::Mod => "%",
                    BinOp::ShiftL => "<<",
                    BinOp::ShiftR => ">>",
                    BinOp::Lt => "<",
                    BinOp::Gt => ">",
                    BinOp::Le => "<=",
                    BinOp::Ge => ">=",
                    BinOp::Eq => "==",
                    BinOp::Ne => "!=",
                    BinOp::BAnd => "&",
                    BinOp::BXor => "^",
                    BinOp::BOr => "|",
                    BinOp::LAnd => "&&",
                    BinOp::LOr => "||",
                };
                write!(f, "({} {} {})", a, sym, b)
            }
            Exp::Cast(t, e) => write!(f, "({}){}", t, e),
            Exp::Lvar(pv) => write!(f, "&{}", pv),
            Exp::Lfield(base, fld, _) => write!(f, "{}.{}", base, fld),
            Exp::Lindex(base, idx) => write!(f, "{}[{}]", base, idx),
            Exp::Sizeof(t, sub) => write!(f, "sizeof({}, {})", t, sub),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::ident::{IdentGenerator, IdentKind};

    #[test]
    fn test_fold_const_arith() {
        let e = Exp::bin(BinOp::Plus, Exp::int(2), Exp::int(3)).fold_const();
        assert_eq!(e, Exp::int(5));

        let e = Exp::bin(BinOp::Lt, Exp::int(5), Exp::int(4)).fold_const();
        assert_eq!(e, Exp::int(0));
    }

    #[test]
    fn test_fold_const_keeps_symbolic() {
        let mut gen = IdentGenerator::new();
        let x = Exp::var(gen.fresh(IdentKind::Normal));
        let e = Exp::bin(BinOp::Plus, x.clone(), Exp::int(0)).fold_const();
        assert_eq!(e, x);
    }

    #[test]
    fn test_root_strips_offsets() {
        let base = Exp::Lvar(Pvar::local("p", "f"));
        let e = Exp::index(Exp::field(base.clone(), "data", Typ::Int), Exp::int(2));
        assert_eq!(e.root(), &base);
    }

    #[test]
    fn test_float_const_total_order() {
        let a = Const::Float(1.0);
        let b = Const::Float(2.0);
        assert!(a < b);
        assert_eq!(a, Const::Float(1.0));
    }
}
