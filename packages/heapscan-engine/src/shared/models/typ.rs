//! Types and the type environment
//!
//! The front-end contract delivers a type environment mapping struct names
//! to their fields (with annotations), super types and methods. The engine
//! consults it during rearrangement (field synthesis), subtype checks and
//! type-size comparisons.

use super::ProcName;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Struct names as delivered by the front-end.
pub type StructName = String;

/// Field names.
pub type FieldName = String;

/// Field or parameter annotations relevant to the analysis.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Annotation {
    /// `@Nullable` on a field or parameter; drives the nullable bucket of
    /// null-dereference reports.
    Nullable,
    /// Any other annotation, kept verbatim for checkers.
    Other(String),
}

/// Types.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Typ {
    Int,
    Float,
    Void,
    Fun,
    Ptr(Box<Typ>),
    Struct(StructName),
    /// Element type and statically-known length, if any.
    Array(Box<Typ>, Option<i64>),
}

impl Typ {
    pub fn ptr_to(t: Typ) -> Self {
        Typ::Ptr(Box::new(t))
    }

    pub fn array_of(t: Typ, len: Option<i64>) -> Self {
        Typ::Array(Box::new(t), len)
    }

    pub fn is_ptr(&self) -> bool {
        matches!(self, Typ::Ptr(_))
    }

    /// Pointed-to type, if this is a pointer.
    pub fn strip_ptr(&self) -> Option<&Typ> {
        match self {
            Typ::Ptr(t) => Some(t),
            _ => None,
        }
    }

    /// Size in abstract units; structs are the sum of their field sizes.
    /// Used for pointer-size-mismatch and type-size comparisons, not for
    /// layout.
    pub fn size(&self, tenv: &Tenv) -> Option<i64> {
        match self {
            Typ::Int | Typ::Float | Typ::Ptr(_) | Typ::Fun => Some(1),
            Typ::Void => Some(0),
            Typ::Array(elem, Some(n)) => elem.size(tenv).map(|s| s * n),
            Typ::Array(_, None) => None,
            Typ::Struct(name) => {
                let st = tenv.lookup(name)?;
                let mut total = 0i64;
                for field in &st.fields {
                    total += field.typ.size(tenv)?;
                }
                Some(total)
            }
        }
    }
}

impl fmt::Display for Typ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Typ::Int => write!(f, "int"),
            Typ::Float => write!(f, "float"),
            Typ::Void => write!(f, "void"),
            Typ::Fun => write!(f, "_fn_"),
            Typ::Ptr(t) => write!(f, "{}*", t),
            Typ::Struct(name) => write!(f, "struct {}", name),
            Typ::Array(t, Some(n)) => write!(f, "{}[{}]", t, n),
            Typ::Array(t, None) => write!(f, "{}[]", t),
        }
    }
}

/// Subtyping information attached to `Sizeof` expressions.
///
/// `Exact` demands the dynamic type be exactly the static one; `Subtypes`
/// admits any subtype. Type refinement across calls moves between the two.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Subtype {
    Exact,
    Subtypes,
}

impl fmt::Display for Subtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subtype::Exact => write!(f, "exact"),
            Subtype::Subtypes => write!(f, "sub"),
        }
    }
}

/// One declared struct field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StructField {
    pub name: FieldName,
    pub typ: Typ,
    pub annotations: Vec<Annotation>,
}

impl StructField {
    pub fn new(name: impl Into<FieldName>, typ: Typ) -> Self {
        Self {
            name: name.into(),
            typ,
            annotations: Vec::new(),
        }
    }

    pub fn nullable(mut self) -> Self {
        self.annotations.push(Annotation::Nullable);
        self
    }

    pub fn is_nullable(&self) -> bool {
        self.annotations.contains(&Annotation::Nullable)
    }
}

/// A struct declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructTyp {
    pub fields: Vec<StructField>,
    pub supers: Vec<StructName>,
    pub methods: Vec<ProcName>,
}

impl StructTyp {
    pub fn field(&self, name: &str) -> Option<&StructField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Type environment: struct name -> declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tenv {
    structs: FxHashMap<StructName, StructTyp>,
}

impl Tenv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<StructName>, st: StructTyp) {
        self.structs.insert(name.into(), st);
    }

    pub fn lookup(&self, name: &str) -> Option<&StructTyp> {
        self.structs.get(name)
    }

    /// Field declaration for `struct_name.field`, walking super types.
    pub fn field_of(&self, struct_name: &str, field: &str) -> Option<&StructField> {
        let st = self.lookup(struct_name)?;
        if let Some(f) = st.field(field) {
            return Some(f);
        }
        for sup in &st.supers {
            if let Some(f) = self.field_of(sup, field) {
                return Some(f);
            }
        }
        None
    }

    /// Is `sub` a (reflexive, transitive) subtype of `sup`?
    pub fn is_subtype(&self, sub: &str, sup: &str) -> bool {
        if sub == sup {
            return true;
        }
        match self.lookup(sub) {
            Some(st) => st.supers.iter().any(|s| self.is_subtype(s, sup)),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenv_with_hierarchy() -> Tenv {
        let mut tenv = Tenv::new();
        tenv.add(
            "A",
            StructTyp {
                fields: vec![StructField::new("x", Typ::Int)],
                supers: vec![],
                methods: vec![],
            },
        );
        tenv.add(
            "B",
            StructTyp {
                fields: vec![StructField::new("y", Typ::Int).nullable()],
                supers: vec!["A".to_string()],
                methods: vec![],
            },
        );
        tenv
    }

    #[test]
    fn test_subtype_walks_supers() {
        let tenv = tenv_with_hierarchy();
        assert!(tenv.is_subtype("B", "A"));
        assert!(tenv.is_subtype("A", "A"));
        assert!(!tenv.is_subtype("A", "B"));
    }

    #[test]
    fn test_field_lookup_inherited() {
        let tenv = tenv_with_hierarchy();
        assert!(tenv.field_of("B", "x").is_some());
        assert!(tenv.field_of("B", "y").unwrap().is_nullable());
        assert!(tenv.field_of("A", "y").is_none());
    }

    #[test]
    fn test_struct_size() {
        let tenv = tenv_with_hierarchy();
        assert_eq!(Typ::Struct("A".to_string()).size(&tenv), Some(1));
        assert_eq!(Typ::array_of(Typ::Int, Some(4)).size(&tenv), Some(4));
        assert_eq!(Typ::array_of(Typ::Int, None).size(&tenv), None);
    }
}
