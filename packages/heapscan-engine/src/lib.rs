/*
 * heapscan - interprocedural symbolic execution over separation logic
 *
 * Feature-first layout:
 * - shared/   : term-layer models (idents, exps, types, instrs, CFGs)
 * - features/ : analysis stages (prop -> prover -> rearrange -> symexec
 *               -> tabulation -> driver -> orchestration), plus
 *               abstraction/join, summaries, on-demand, callbacks and
 *               reporting
 * - config/   : the explicit analysis configuration and context
 * - errors/   : defect taxonomy, error log, analysis fault sum
 *
 * The engine consumes per-procedure CFGs (a front-end contract, loaded
 * from JSON captures) and produces per-procedure summaries - sets of
 * (precondition, postcondition) spec pairs inferred by bi-abduction -
 * plus a JSON stream of memory-safety issues.
 */

#![allow(clippy::too_many_arguments)] // analysis transfer functions carry wide state
#![allow(clippy::type_complexity)]

/// Configuration record and per-procedure analysis context
pub mod config;

/// Defect taxonomy, error log, analysis faults
pub mod errors;

/// Analysis feature modules
pub mod features;

/// Shared term-layer models
pub mod shared;

pub use config::{AnalysisConfig, AnalysisContext, Phase, WorklistMode};
pub use errors::{AnalysisFault, ErrKind, Errlog, ErrorDesc, Severity};
pub use features::orchestration::{analyze_program, ExeEnv, RunStats};
pub use features::summaries::{Spec, SpecTable, Summary, SUMMARY_KEY};
