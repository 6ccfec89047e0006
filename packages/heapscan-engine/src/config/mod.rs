//! Analysis configuration and per-procedure context
//!
//! Everything the original design kept in global mutable state lives here
//! instead: the configuration record built from the CLI, and the
//! `AnalysisContext` threaded through the core (identifier generator,
//! symbolic-operation budget, scoped phase flag, delayed prints).

use crate::errors::{AnalysisFault, TimeoutKind};
use crate::shared::models::IdentGenerator;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Worklist scheduling mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorklistMode {
    /// Lower visit count, then shorter distance to exit, then higher id.
    #[default]
    VisitCount,
    /// Highest node id first.
    NodeId,
    /// Shortest distance to exit first.
    DistToExit,
}

impl WorklistMode {
    pub fn from_flag(v: u32) -> Self {
        match v {
            1 => WorklistMode::NodeId,
            2 => WorklistMode::DistToExit,
            _ => WorklistMode::VisitCount,
        }
    }
}

/// Analysis phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Footprint,
    ReExecution,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Footprint => "footprint",
            Phase::ReExecution => "re_execution",
        }
    }
}

/// Analysis configuration (CLI surface).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub results_dir: PathBuf,
    pub cluster: Option<String>,
    pub compilation_db_files: Vec<PathBuf>,
    pub developer_mode: bool,
    pub only_footprint: bool,
    pub only_nospecs: bool,
    pub only_skips: bool,
    pub num_cores: usize,
    pub max_num_proc: usize,
    pub max_recursion: u32,
    pub worklist_mode: WorklistMode,
    pub reactive: bool,
    pub footprint: bool,
    pub ondemand: bool,
    pub write_html: bool,
    pub spec_abs_level: u32,
    pub undo_join: bool,
    pub meet_level: u32,
    pub show_buckets: bool,
    pub report_nullable_inconsistency: bool,
    pub filtering: bool,
    pub taint_analysis: bool,
    /// Symbolic-operation budget per procedure (0 = unlimited).
    pub iterations: u64,
    /// Cap on summary timestamps during the interprocedural fixpoint.
    pub max_timestamp: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("heapscan-out"),
            cluster: None,
            compilation_db_files: Vec::new(),
            developer_mode: false,
            only_footprint: false,
            only_nospecs: false,
            only_skips: false,
            num_cores: num_cpus::get(),
            max_num_proc: 0,
            max_recursion: 5,
            worklist_mode: WorklistMode::VisitCount,
            reactive: false,
            footprint: true,
            ondemand: false,
            write_html: false,
            spec_abs_level: 1,
            undo_join: false,
            meet_level: 1,
            show_buckets: false,
            report_nullable_inconsistency: false,
            filtering: true,
            taint_analysis: false,
            iterations: 200_000,
            max_timestamp: 64,
        }
    }
}

/// Buffered diagnostics, flushed at safe points instead of printed
/// mid-rewrite.
#[derive(Debug, Clone, Default)]
pub struct DelayedPrints {
    lines: Vec<String>,
}

impl DelayedPrints {
    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    /// Drain the buffer, handing every line to the tracing sink.
    pub fn flush(&mut self) {
        for line in self.lines.drain(..) {
            tracing::debug!(target: "heapscan::delayed", "{}", line);
        }
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

/// Per-procedure analysis context.
///
/// Owned by one analyzer invocation; on-demand re-entry snapshots and
/// restores the identifier generator around the nested call.
#[derive(Debug)]
pub struct AnalysisContext {
    pub config: AnalysisConfig,
    pub idgen: IdentGenerator,
    pub phase: Phase,
    pub session: Uuid,
    pub delayed: DelayedPrints,
    symops_used: u64,
    /// Budget accounting can be paused (error-reporting paths run
    /// abstraction without consuming symops).
    symops_paused: u32,
}

impl AnalysisContext {
    pub fn new(config: AnalysisConfig) -> Self {
        Self {
            config,
            idgen: IdentGenerator::new(),
            phase: Phase::Footprint,
            session: Uuid::new_v4(),
            delayed: DelayedPrints::default(),
            symops_used: 0,
            symops_paused: 0,
        }
    }

    /// Account one symbolic operation against the budget.
    pub fn consume_symop(&mut self) -> Result<(), AnalysisFault> {
        if self.symops_paused > 0 {
            return Ok(());
        }
        self.symops_used += 1;
        if self.config.iterations > 0 && self.symops_used > self.config.iterations {
            return Err(AnalysisFault::Timeout(TimeoutKind::SymOp));
        }
        Ok(())
    }

    pub fn symops_used(&self) -> u64 {
        self.symops_used
    }

    pub fn reset_symops(&mut self) {
        self.symops_used = 0;
    }

    /// Run `f` with symop accounting paused; used by abstraction during
    /// error reporting.
    pub fn without_symops<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.symops_paused += 1;
        let out = f(self);
        self.symops_paused -= 1;
        out
    }

    /// Run `f` under `phase`, restoring the previous phase on every exit.
    ///
    /// Faults propagate as `Err` values, so the restore below covers fault
    /// paths as well as normal returns.
    pub fn with_phase<R>(&mut self, phase: Phase, f: impl FnOnce(&mut Self) -> R) -> R {
        let saved = self.phase;
        self.phase = phase;
        let out = f(self);
        self.phase = saved;
        out
    }

    pub fn in_footprint(&self) -> bool {
        self.phase == Phase::Footprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symop_budget() {
        let config = AnalysisConfig {
            iterations: 2,
            ..Default::default()
        };
        let mut ctx = AnalysisContext::new(config);
        assert!(ctx.consume_symop().is_ok());
        assert!(ctx.consume_symop().is_ok());
        assert!(matches!(
            ctx.consume_symop(),
            Err(AnalysisFault::Timeout(TimeoutKind::SymOp))
        ));
    }

    #[test]
    fn test_without_symops_does_not_consume() {
        let config = AnalysisConfig {
            iterations: 1,
            ..Default::default()
        };
        let mut ctx = AnalysisContext::new(config);
        ctx.without_symops(|ctx| {
            for _ in 0..10 {
                ctx.consume_symop().unwrap();
            }
        });
        assert_eq!(ctx.symops_used(), 0);
    }

    #[test]
    fn test_with_phase_restores_on_error_path() {
        let mut ctx = AnalysisContext::new(AnalysisConfig::default());
        assert_eq!(ctx.phase, Phase::Footprint);
        let r: Result<(), AnalysisFault> = ctx.with_phase(Phase::ReExecution, |ctx| {
            assert_eq!(ctx.phase, Phase::ReExecution);
            Err(AnalysisFault::Internal("boom".to_string()))
        });
        assert!(r.is_err());
        assert_eq!(ctx.phase, Phase::Footprint);
    }

    #[test]
    fn test_worklist_mode_flag() {
        assert_eq!(WorklistMode::from_flag(0), WorklistMode::VisitCount);
        assert_eq!(WorklistMode::from_flag(1), WorklistMode::NodeId);
        assert_eq!(WorklistMode::from_flag(2), WorklistMode::DistToExit);
    }
}
