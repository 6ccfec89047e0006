//! On-demand analysis of callees
//!
//! When a call hits a procedure without a summary, the executor may run a
//! nested analysis right there. Guards: the callee has a body, is not
//! already being analyzed (cycle breaker), has no summary yet (timestamp
//! 0), and the cross-file policy allows it. The identifier generator and
//! the current phase are saved and restored around the nested run.
//!
//! Environment knobs: `TRACE_ONDEMAND` enables tracing of decisions;
//! `ONDEMAND_FILE` restricts on-demand analysis to source files whose
//! path contains one of the listed (colon-separated) directories.

use crate::config::AnalysisContext;
use crate::features::driver;
use crate::features::orchestration::ExeEnv;
use crate::features::summaries::Summary;
use crate::shared::models::ProcName;
use tracing::debug;

fn trace_enabled() -> bool {
    std::env::var("TRACE_ONDEMAND").is_ok()
}

/// The cross-file policy: analysis within one file is always allowed;
/// across files it is allowed unless `ONDEMAND_FILE` restricts the callee
/// to the listed directories.
fn file_policy_allows(caller_file: &str, callee_file: &str) -> bool {
    if caller_file == callee_file {
        return true;
    }
    match std::env::var("ONDEMAND_FILE") {
        Ok(dirs) => dirs
            .split(':')
            .filter(|d| !d.is_empty())
            .any(|d| callee_file.contains(d)),
        Err(_) => true,
    }
}

/// Should the callee be analyzed on demand right now?
fn procedure_should_be_analyzed(env: &ExeEnv, caller_file: &str, callee: &ProcName) -> bool {
    if !env.config.ondemand {
        return false;
    }
    let Some(proc) = env.program.proc(callee) else {
        return false;
    };
    if !proc.attrs.is_defined {
        return false;
    }
    if env.active.contains_key(callee) {
        // Cycle breaker: the callee is on the current analysis stack.
        return false;
    }
    // Only procedures never analyzed (a summary with timestamp > 0 is
    // authoritative; recomputation after transitions belongs to the
    // orchestrator, not here).
    if env.spec_table.timestamp(callee) > 0 {
        return false;
    }
    file_policy_allows(caller_file, &proc.attrs.loc.file)
}

/// Analyze `callee` on demand if the guards allow it; returns whatever
/// summary exists afterwards.
pub fn analyze_proc_if_needed(
    env: &ExeEnv,
    ctx: &mut AnalysisContext,
    caller: &ProcName,
    callee: &ProcName,
) -> Option<Summary> {
    let caller_file = env
        .program
        .proc(caller)
        .map(|p| p.attrs.loc.file.clone())
        .unwrap_or_default();

    if !procedure_should_be_analyzed(env, &caller_file, callee) {
        if trace_enabled() {
            debug!(target: "heapscan::ondemand", %callee, "skipped");
        }
        return env.spec_table.get(callee);
    }

    let proc = env.program.proc(callee)?.clone();
    if trace_enabled() {
        debug!(target: "heapscan::ondemand", %callee, "nested analysis");
    }

    // Save analyzer state around the nested run.
    let snapshot = ctx.idgen.snapshot();
    let saved_phase = ctx.phase;
    env.active.insert(callee.clone(), ());

    let depth = env.active.len() as u32;
    let (summary, errlog) = driver::analyze_procedure(env, &proc, depth);
    env.merge_errlog(errlog);
    let summary = env.spec_table.put(summary);

    env.active.remove(callee);
    ctx.idgen.restore(snapshot);
    ctx.phase = saved_phase;

    Some(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_policy_unrestricted_without_env() {
        // Without ONDEMAND_FILE any pair of files is allowed.
        if std::env::var("ONDEMAND_FILE").is_err() {
            assert!(file_policy_allows("a.c", "b.c"));
            assert!(file_policy_allows("a.c", "a.c"));
        }
    }
}
