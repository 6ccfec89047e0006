//! Expression attributes
//!
//! Non-shape facts attached to expressions: resource state, taint,
//! dangling/undefined markers, provenance of return values. An attribute
//! `a` on expression `e` is encoded in the pure part as the atom
//! `e != Const::Attr(a)`, so attributes travel through substitution and
//! normalization like any other pure fact.

use super::loc::Loc;
use super::ProcName;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Resource lifecycle state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ResState {
    Acquire,
    Release,
}

/// Resource family, used to bucket leak and mismatch reports.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ResourceKind {
    Memory,
    File,
    Lock,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Memory => write!(f, "memory"),
            ResourceKind::File => write!(f, "file"),
            ResourceKind::Lock => write!(f, "lock"),
        }
    }
}

/// Where a resource changed state: which procedure, at which location.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CallSite {
    pub pname: ProcName,
    pub loc: Loc,
}

impl CallSite {
    pub fn new(pname: impl Into<ProcName>, loc: Loc) -> Self {
        Self {
            pname: pname.into(),
            loc,
        }
    }
}

/// An attribute attached to an expression.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Attribute {
    /// Resource acquired or released, with the site responsible.
    Resource {
        state: ResState,
        kind: ResourceKind,
        site: CallSite,
    },
    /// Points into deallocated stack space.
    Dangling,
    /// Value returned by a procedure with no summary (skipped function).
    Undef { callee: ProcName, loc: Loc },
    /// Tainted by the named source.
    Taint { source: ProcName },
    /// Explicitly untainted (sanitized).
    Untaint,
    /// Return value of the named procedure (getter idempotence).
    Retval(ProcName),
    /// Denominator that may be zero.
    Div0,
    /// Nil in an Objective-C message-send position.
    ObjcNull,
}

/// Attribute category: at most one attribute per category per expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AttributeCategory {
    Resource,
    Dangling,
    Undef,
    Taint,
    Retval,
    Div0,
    ObjcNull,
}

impl Attribute {
    pub fn category(&self) -> AttributeCategory {
        match self {
            Attribute::Resource { .. } => AttributeCategory::Resource,
            Attribute::Dangling => AttributeCategory::Dangling,
            Attribute::Undef { .. } => AttributeCategory::Undef,
            Attribute::Taint { .. } | Attribute::Untaint => AttributeCategory::Taint,
            Attribute::Retval(_) => AttributeCategory::Retval,
            Attribute::Div0 => AttributeCategory::Div0,
            Attribute::ObjcNull => AttributeCategory::ObjcNull,
        }
    }

    pub fn resource_acquire(kind: ResourceKind, site: CallSite) -> Self {
        Attribute::Resource {
            state: ResState::Acquire,
            kind,
            site,
        }
    }

    pub fn resource_release(kind: ResourceKind, site: CallSite) -> Self {
        Attribute::Resource {
            state: ResState::Release,
            kind,
            site,
        }
    }

    pub fn is_released_resource(&self) -> bool {
        matches!(
            self,
            Attribute::Resource {
                state: ResState::Release,
                ..
            }
        )
    }

    pub fn is_acquired_resource(&self) -> bool {
        matches!(
            self,
            Attribute::Resource {
                state: ResState::Acquire,
                ..
            }
        )
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribute::Resource { state, kind, site } => {
                let verb = match state {
                    ResState::Acquire => "acquire",
                    ResState::Release => "release",
                };
                write!(f, "{}({}, {})", verb, kind, site.pname)
            }
            Attribute::Dangling => write!(f, "dangling"),
            Attribute::Undef { callee, .. } => write!(f, "undef({})", callee),
            Attribute::Taint { source } => write!(f, "taint({})", source),
            Attribute::Untaint => write!(f, "untaint"),
            Attribute::Retval(p) => write!(f, "retval({})", p),
            Attribute::Div0 => write!(f, "div0"),
            Attribute::ObjcNull => write!(f, "objc_null"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taint_and_untaint_share_category() {
        let t = Attribute::Taint {
            source: "read".to_string(),
        };
        assert_eq!(t.category(), Attribute::Untaint.category());
    }

    #[test]
    fn test_resource_predicates() {
        let site = CallSite::new("malloc", Loc::dummy());
        let acq = Attribute::resource_acquire(ResourceKind::Memory, site.clone());
        let rel = Attribute::resource_release(ResourceKind::Memory, site);
        assert!(acq.is_acquired_resource());
        assert!(rel.is_released_resource());
        assert_eq!(acq.category(), rel.category());
    }
}
