//! Separation-logic propositions
//!
//! A proposition is the symbolic state of one path: the current heap
//! `sigma`, the pure facts `pi`, their footprint counterparts (assumptions
//! committed to during bi-abduction), and an idempotent substitution over
//! identifiers.

pub mod hpred;
pub mod iter;
pub mod prop;
pub mod strexp;
pub mod sub;

pub use hpred::{HparaBody, HparaDll, Hpred, LsegKind};
pub use iter::{Offset, PropIter};
pub use prop::{Atom, Prop};
pub use strexp::{Inst, Strexp};
pub use sub::Subst;
