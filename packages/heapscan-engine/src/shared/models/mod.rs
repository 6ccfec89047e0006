//! Shared term-layer models
//!
//! These types are used by every feature (propositions, prover,
//! rearrangement, executor, tabulation), so they live in shared/models to
//! avoid circular dependencies between features.

pub mod attribute;
pub mod cfg;
pub mod exp;
pub mod ident;
pub mod instr;
pub mod loc;
pub mod typ;

pub use attribute::{Attribute, AttributeCategory, CallSite, ResState, ResourceKind};
pub use cfg::{
    Access, CfgNode, CfgProgram, Language, NodeId, NodeKind, ProcAttributes, ProcCfg,
};
pub use exp::{BinOp, Const, Exp, Pvar, PvarKind, UnOp};
pub use ident::{Ident, IdentGenerator, IdentKind, IdentSnapshot};
pub use instr::{CallFlags, Instr};
pub use loc::Loc;
pub use typ::{Annotation, FieldName, StructField, StructName, StructTyp, Subtype, Tenv, Typ};

/// Procedure names are plain strings (mangled by the front-end).
pub type ProcName = String;
