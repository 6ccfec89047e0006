//! Structured values stored at heap locations

use super::sub::Subst;
use crate::shared::models::{Exp, FieldName, Ident, Loc, ProcName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Provenance of a stored value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Inst {
    /// Part of the initial (seeded) state.
    Initial,
    /// Written by an allocation.
    Alloc,
    /// Written by a store at `loc`.
    Update { loc: Loc },
    /// Materialized by rearrangement; `null_case` marks the branch where a
    /// possibly-empty segment collapsed.
    Rearrange { null_case: bool, loc: Loc },
    /// Returned from a call to `proc` at `loc`.
    Returned { proc: ProcName, loc: Loc },
    /// Cleared at end of scope.
    Nullify,
    /// No provenance recorded.
    None,
}

impl Inst {
    /// Re-stamp a rearrangement/return instant at a new location, keeping
    /// other provenance untouched.
    pub fn relocate(&self, loc: &Loc) -> Inst {
        match self {
            Inst::Rearrange { null_case, .. } => Inst::Rearrange {
                null_case: *null_case,
                loc: loc.clone(),
            },
            Inst::Returned { proc, .. } => Inst::Returned {
                proc: proc.clone(),
                loc: loc.clone(),
            },
            other => other.clone(),
        }
    }
}

/// A structured value: a leaf expression, a struct of fields, or an array
/// of indexed elements with a symbolic size.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Strexp {
    Eexp(Exp, Inst),
    Estruct(Vec<(FieldName, Strexp)>, Inst),
    Earray(Exp, Vec<(Exp, Strexp)>, Inst),
}

impl Strexp {
    pub fn exp(e: Exp) -> Self {
        Strexp::Eexp(e, Inst::None)
    }

    pub fn inst(&self) -> &Inst {
        match self {
            Strexp::Eexp(_, i) | Strexp::Estruct(_, i) | Strexp::Earray(_, _, i) => i,
        }
    }

    /// Leaf expression, if this is a leaf.
    pub fn as_exp(&self) -> Option<&Exp> {
        match self {
            Strexp::Eexp(e, _) => Some(e),
            _ => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Strexp> {
        match self {
            Strexp::Estruct(fields, _) => {
                fields.iter().find(|(f, _)| f == name).map(|(_, se)| se)
            }
            _ => None,
        }
    }

    /// Collect free identifiers.
    pub fn fv_into(&self, acc: &mut BTreeSet<Ident>) {
        match self {
            Strexp::Eexp(e, _) => e.fv_into(acc),
            Strexp::Estruct(fields, _) => {
                for (_, se) in fields {
                    se.fv_into(acc);
                }
            }
            Strexp::Earray(size, elems, _) => {
                size.fv_into(acc);
                for (idx, se) in elems {
                    idx.fv_into(acc);
                    se.fv_into(acc);
                }
            }
        }
    }

    /// Apply a substitution throughout.
    pub fn apply_sub(&self, sub: &Subst) -> Strexp {
        match self {
            Strexp::Eexp(e, i) => Strexp::Eexp(sub.apply_exp(e), i.clone()),
            Strexp::Estruct(fields, i) => Strexp::Estruct(
                fields
                    .iter()
                    .map(|(f, se)| (f.clone(), se.apply_sub(sub)))
                    .collect(),
                i.clone(),
            ),
            Strexp::Earray(size, elems, i) => Strexp::Earray(
                sub.apply_exp(size),
                elems
                    .iter()
                    .map(|(idx, se)| (sub.apply_exp(idx), se.apply_sub(sub)))
                    .collect(),
                i.clone(),
            ),
        }
    }

    /// Canonicalize: fold constants, sort struct fields by name and array
    /// elements by index.
    pub fn normalize(self) -> Strexp {
        match self {
            Strexp::Eexp(e, i) => Strexp::Eexp(e.fold_const(), i),
            Strexp::Estruct(mut fields, i) => {
                for (_, se) in fields.iter_mut() {
                    let taken = std::mem::replace(se, Strexp::exp(Exp::zero()));
                    *se = taken.normalize();
                }
                fields.sort_by(|a, b| a.0.cmp(&b.0));
                Strexp::Estruct(fields, i)
            }
            Strexp::Earray(size, mut elems, i) => {
                for (idx, se) in elems.iter_mut() {
                    let folded = idx.clone().fold_const();
                    *idx = folded;
                    let taken = std::mem::replace(se, Strexp::exp(Exp::zero()));
                    *se = taken.normalize();
                }
                elems.sort_by(|a, b| a.0.cmp(&b.0));
                Strexp::Earray(size.fold_const(), elems, i)
            }
        }
    }
}

impl fmt::Display for Strexp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strexp::Eexp(e, _) => write!(f, "{}", e),
            Strexp::Estruct(fields, _) => {
                write!(f, "{{")?;
                for (i, (name, se)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", name, se)?;
                }
                write!(f, "}}")
            }
            Strexp::Earray(size, elems, _) => {
                write!(f, "array<{}>[", size)?;
                for (i, (idx, se)) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", idx, se)?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::BinOp;

    #[test]
    fn test_normalize_sorts_fields() {
        let se = Strexp::Estruct(
            vec![
                ("z".to_string(), Strexp::exp(Exp::int(1))),
                ("a".to_string(), Strexp::exp(Exp::int(2))),
            ],
            Inst::None,
        )
        .normalize();
        match se {
            Strexp::Estruct(fields, _) => {
                assert_eq!(fields[0].0, "a");
                assert_eq!(fields[1].0, "z");
            }
            _ => panic!("expected struct"),
        }
    }

    #[test]
    fn test_normalize_folds_indices() {
        let idx = Exp::bin(BinOp::Plus, Exp::int(1), Exp::int(1));
        let se = Strexp::Earray(
            Exp::int(4),
            vec![(idx, Strexp::exp(Exp::int(9)))],
            Inst::None,
        )
        .normalize();
        match se {
            Strexp::Earray(_, elems, _) => assert_eq!(elems[0].0, Exp::int(2)),
            _ => panic!("expected array"),
        }
    }
}
