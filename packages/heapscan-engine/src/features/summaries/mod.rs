//! Procedure specifications and summaries
//!
//! A spec is one `(pre, posts, visited)` triple; a summary is the full
//! per-procedure record (specs plus phase, status, timestamps, stats and
//! dependency bookkeeping). The spec table is the only durable shared
//! resource of the analysis: an in-memory `DashMap` owned by the
//! orchestrator, written through to the store, with an LRU read cache in
//! front of the disk for callees analyzed by other runs.

use crate::config::Phase;
use crate::features::driver::path::Path;
use crate::features::prop::Prop;
use crate::shared::models::{NodeId, ProcAttributes, ProcName, Typ};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use heapscan_store::{SpecStore, StoreKey};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;

/// Store key for persisted summaries. Bump the version whenever the
/// serialized shape changes; stale entries then read as absent.
pub const SUMMARY_KEY: StoreKey = StoreKey::new("summary", 1);

/// A precondition, possibly remembering the join that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JProp {
    Prop(u32, Prop),
    Joined(u32, Prop, Box<JProp>, Box<JProp>),
}

impl JProp {
    pub fn to_prop(&self) -> &Prop {
        match self {
            JProp::Prop(_, p) => p,
            JProp::Joined(_, p, _, _) => p,
        }
    }

    pub fn number(&self) -> u32 {
        match self {
            JProp::Prop(n, _) => *n,
            JProp::Joined(n, _, _, _) => *n,
        }
    }
}

/// One specification: precondition, postconditions with their paths, and
/// the nodes (with line lists) visited while deriving it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spec {
    pub pre: JProp,
    pub posts: Vec<(Prop, Path)>,
    pub visited: BTreeSet<(NodeId, Vec<u32>)>,
}

impl Spec {
    pub fn new(pre: JProp) -> Self {
        Self {
            pre,
            posts: Vec::new(),
            visited: BTreeSet::new(),
        }
    }
}

/// Summary lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Active,
    Inactive,
}

/// Per-procedure analysis statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub symops: u64,
    pub timeout: bool,
    pub errors: u32,
    pub elapsed_ms: f64,
    pub started_at: Option<DateTime<Utc>>,
}

/// Summary payload: biabduction specs, or an opaque typestate for plugin
/// checkers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Specs(Vec<Spec>),
    TypeState(serde_json::Value),
}

/// The per-procedure summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub proc_name: ProcName,
    pub ret_type: Typ,
    pub formals: Vec<(String, Typ)>,
    pub attributes: ProcAttributes,
    pub nodes: Vec<NodeId>,
    pub phase: Phase,
    pub status: Status,
    /// Strictly increases on any observable change; 0 means "never
    /// analyzed".
    pub timestamp: u64,
    pub dependency_map: BTreeMap<ProcName, u64>,
    pub stats: Stats,
    pub payload: Payload,
    pub call_stats: BTreeMap<ProcName, u32>,
}

impl Summary {
    /// Fresh empty summary for a procedure (timestamp 0).
    pub fn empty(attributes: ProcAttributes, nodes: Vec<NodeId>) -> Self {
        Self {
            proc_name: attributes.name.clone(),
            ret_type: attributes.ret_type.clone(),
            formals: attributes.formals.clone(),
            attributes,
            nodes,
            phase: Phase::Footprint,
            status: Status::Inactive,
            timestamp: 0,
            dependency_map: BTreeMap::new(),
            stats: Stats::default(),
            payload: Payload::Specs(Vec::new()),
            call_stats: BTreeMap::new(),
        }
    }

    pub fn specs(&self) -> &[Spec] {
        match &self.payload {
            Payload::Specs(specs) => specs,
            Payload::TypeState(_) => &[],
        }
    }

    pub fn has_specs(&self) -> bool {
        !self.specs().is_empty()
    }

    pub fn set_specs(&mut self, specs: Vec<Spec>) {
        self.payload = Payload::Specs(specs);
    }

    pub fn bump_call_stat(&mut self, callee: &str) {
        *self.call_stats.entry(callee.to_string()).or_insert(0) += 1;
    }
}

/// Concurrent spec table with write-through persistence.
pub struct SpecTable {
    mem: DashMap<ProcName, Summary>,
    store: Option<SpecStore>,
    /// Read cache for summaries deserialized from disk.
    disk_cache: Mutex<LruCache<ProcName, Summary>>,
}

impl SpecTable {
    pub fn in_memory() -> Self {
        Self::with_store(None)
    }

    pub fn with_store(store: Option<SpecStore>) -> Self {
        Self {
            mem: DashMap::new(),
            store,
            disk_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(1024).expect("nonzero cache size"),
            )),
        }
    }

    /// Look up a summary: memory first, then the disk cache, then the
    /// store.
    pub fn get(&self, proc: &str) -> Option<Summary> {
        if let Some(s) = self.mem.get(proc) {
            return Some(s.clone());
        }
        {
            let mut cache = self.disk_cache.lock();
            if let Some(s) = cache.get(proc) {
                return Some(s.clone());
            }
        }
        let store = self.store.as_ref()?;
        match store.load::<Summary>(proc) {
            Ok(Some(summary)) => {
                self.disk_cache
                    .lock()
                    .put(proc.to_string(), summary.clone());
                Some(summary)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(proc, error = %e, "failed to load summary");
                None
            }
        }
    }

    /// Install a summary, bumping its timestamp and persisting it.
    pub fn put(&self, mut summary: Summary) -> Summary {
        summary.timestamp += 1;
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&summary.proc_name, &summary) {
                tracing::warn!(proc = %summary.proc_name, error = %e, "failed to persist summary");
            }
        }
        self.disk_cache.lock().pop(&summary.proc_name);
        self.mem.insert(summary.proc_name.clone(), summary.clone());
        summary
    }

    pub fn contains(&self, proc: &str) -> bool {
        self.get(proc).is_some()
    }

    /// Timestamp of a procedure's summary (0 when absent).
    pub fn timestamp(&self, proc: &str) -> u64 {
        self.get(proc).map(|s| s.timestamp).unwrap_or(0)
    }

    pub fn names_in_memory(&self) -> Vec<ProcName> {
        let mut names: Vec<_> = self.mem.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::Language;

    fn attrs(name: &str) -> ProcAttributes {
        ProcAttributes::new(name, Language::C)
    }

    #[test]
    fn test_put_bumps_timestamp() {
        let table = SpecTable::in_memory();
        let s = Summary::empty(attrs("f"), vec![0, 1]);
        assert_eq!(s.timestamp, 0);
        let s = table.put(s);
        assert_eq!(s.timestamp, 1);
        let s = table.put(s);
        assert_eq!(s.timestamp, 2);
        assert_eq!(table.timestamp("f"), 2);
    }

    #[test]
    fn test_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SpecStore::open(dir.path(), "specs", SUMMARY_KEY).unwrap();
        let table = SpecTable::with_store(Some(store.clone()));

        let mut s = Summary::empty(attrs("g"), vec![0]);
        s.set_specs(vec![Spec::new(JProp::Prop(0, Prop::emp()))]);
        table.put(s);

        // A second table sharing the store sees the persisted summary.
        let table2 = SpecTable::with_store(Some(store));
        let loaded = table2.get("g").expect("summary persisted");
        assert_eq!(loaded.specs().len(), 1);
        assert_eq!(loaded.timestamp, 1);
    }

    #[test]
    fn test_absent_is_timestamp_zero() {
        let table = SpecTable::in_memory();
        assert_eq!(table.timestamp("nope"), 0);
        assert!(!table.contains("nope"));
    }
}
