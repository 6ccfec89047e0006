//! Identifiers
//!
//! Four kinds of identifiers flow through the symbolic state:
//! - *normal* ids are program-originated temporaries,
//! - *primed* ids are local existentials,
//! - *footprint* ids are universals over the unknown pre-state,
//! - *path* ids are provenance markers minted during rearrangement.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier kind.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum IdentKind {
    Normal,
    Primed,
    Footprint,
    Path,
}

impl IdentKind {
    /// Default name stem for fresh identifiers of this kind.
    pub fn default_name(&self) -> &'static str {
        match self {
            IdentKind::Normal => "n",
            IdentKind::Primed => "p",
            IdentKind::Footprint => "f",
            IdentKind::Path => "r",
        }
    }
}

/// An identifier: kind, name stem and stamp.
///
/// Two identifiers are the same variable iff all three components match.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Ident {
    pub kind: IdentKind,
    pub name: String,
    pub stamp: u64,
}

impl Ident {
    pub fn new(kind: IdentKind, name: impl Into<String>, stamp: u64) -> Self {
        Self {
            kind,
            name: name.into(),
            stamp,
        }
    }

    pub fn is_normal(&self) -> bool {
        self.kind == IdentKind::Normal
    }

    pub fn is_primed(&self) -> bool {
        self.kind == IdentKind::Primed
    }

    pub fn is_footprint(&self) -> bool {
        self.kind == IdentKind::Footprint
    }

    pub fn is_path(&self) -> bool {
        self.kind == IdentKind::Path
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}${}", self.name, self.stamp)
    }
}

/// Saved generator state, restored around on-demand re-entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentSnapshot {
    counters: [u64; 4],
}

/// Process-local fresh-identifier generator.
///
/// One counter per kind keeps printed names short and makes the stream of
/// fresh variables deterministic for a given instruction sequence.
#[derive(Debug, Clone, Default)]
pub struct IdentGenerator {
    counters: [u64; 4],
}

impl IdentGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(kind: IdentKind) -> usize {
        match kind {
            IdentKind::Normal => 0,
            IdentKind::Primed => 1,
            IdentKind::Footprint => 2,
            IdentKind::Path => 3,
        }
    }

    /// Mint a fresh identifier of the given kind.
    pub fn fresh(&mut self, kind: IdentKind) -> Ident {
        let slot = Self::slot(kind);
        let stamp = self.counters[slot];
        self.counters[slot] += 1;
        Ident::new(kind, kind.default_name(), stamp)
    }

    /// Mint a fresh identifier with the same kind and name stem as `id`.
    pub fn fresh_like(&mut self, id: &Ident) -> Ident {
        let slot = Self::slot(id.kind);
        let stamp = self.counters[slot];
        self.counters[slot] += 1;
        Ident::new(id.kind, id.name.clone(), stamp)
    }

    /// Snapshot the counters; paired with [`IdentGenerator::restore`].
    pub fn snapshot(&self) -> IdentSnapshot {
        IdentSnapshot {
            counters: self.counters,
        }
    }

    /// Restore a previously captured snapshot.
    pub fn restore(&mut self, snap: IdentSnapshot) {
        self.counters = snap.counters;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_is_monotone_per_kind() {
        let mut gen = IdentGenerator::new();
        let a = gen.fresh(IdentKind::Normal);
        let b = gen.fresh(IdentKind::Normal);
        let c = gen.fresh(IdentKind::Primed);

        assert_eq!(a.stamp, 0);
        assert_eq!(b.stamp, 1);
        assert_eq!(c.stamp, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut gen = IdentGenerator::new();
        gen.fresh(IdentKind::Footprint);
        let snap = gen.snapshot();
        let x = gen.fresh(IdentKind::Footprint);
        gen.restore(snap);
        let y = gen.fresh(IdentKind::Footprint);

        assert_eq!(x, y, "restore must replay the same stream");
    }

    #[test]
    fn test_display() {
        let id = Ident::new(IdentKind::Normal, "n", 3);
        assert_eq!(id.to_string(), "n$3");
    }
}
