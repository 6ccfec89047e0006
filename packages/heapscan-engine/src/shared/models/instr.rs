//! Instructions
//!
//! The executable payload of CFG nodes. The front-end lowers source
//! statements into these; the symbolic executor interprets them.

use super::exp::{Exp, Pvar};
use super::ident::Ident;
use super::loc::Loc;
use super::typ::Typ;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Flags attached to call instructions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFlags {
    /// Call through a function pointer.
    pub ptr_call: bool,
    /// Virtual dispatch.
    pub virt: bool,
    /// The called value is a captured block variable (cannot be a null
    /// function literal from the caller's point of view).
    pub captured_block: bool,
}

/// One instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instr {
    /// `id = *lexp`
    Load {
        id: Ident,
        lexp: Exp,
        typ: Typ,
        loc: Loc,
    },
    /// `*lexp = rhs`
    Store {
        lexp: Exp,
        typ: Typ,
        rhs: Exp,
        loc: Loc,
    },
    /// Filter paths by `cond`; `true_branch` tells which side of the
    /// conditional this node models.
    Prune {
        cond: Exp,
        true_branch: bool,
        loc: Loc,
    },
    /// `rets = fexp(args)`
    Call {
        rets: Vec<Ident>,
        fexp: Exp,
        args: Vec<(Exp, Typ)>,
        loc: Loc,
        flags: CallFlags,
    },
    /// Remove the points-to for `pvar`; marks end-of-scope for leak blame.
    Nullify { pvar: Pvar, loc: Loc },
    /// Run abstraction (and leak detection) at this point.
    Abstract { loc: Loc },
    /// Successor-selection annotation.
    Goto { node: usize, loc: Loc },
}

impl Instr {
    pub fn loc(&self) -> &Loc {
        match self {
            Instr::Load { loc, .. }
            | Instr::Store { loc, .. }
            | Instr::Prune { loc, .. }
            | Instr::Call { loc, .. }
            | Instr::Nullify { loc, .. }
            | Instr::Abstract { loc }
            | Instr::Goto { loc, .. } => loc,
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Load { id, lexp, .. } => write!(f, "{} = *{}", id, lexp),
            Instr::Store { lexp, rhs, .. } => write!(f, "*{} = {}", lexp, rhs),
            Instr::Prune {
                cond, true_branch, ..
            } => write!(f, "prune({}, {})", cond, true_branch),
            Instr::Call { rets, fexp, args, .. } => {
                if let Some(ret) = rets.first() {
                    write!(f, "{} = ", ret)?;
                }
                write!(f, "{}(", fexp)?;
                for (i, (arg, _)) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Instr::Nullify { pvar, .. } => write!(f, "nullify({})", pvar),
            Instr::Abstract { .. } => write!(f, "abstract"),
            Instr::Goto { node, .. } => write!(f, "goto {}", node),
        }
    }
}
