//! Error taxonomy, the error log, and the analysis fault sum
//!
//! Two layers of "error" coexist:
//! - [`ErrKind`]/[`ErrorDesc`]/[`Errlog`] describe *defects in the analyzed
//!   program* (null dereference, leak, ...); these become JSON issues.
//! - [`AnalysisFault`] describes *events inside the analyzer* (a defect to
//!   report, a timeout, an internal error); each path boundary catches it
//!   and decides recover/log/abort.

use crate::shared::models::{FieldName, Loc, ProcName, ResourceKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Issue severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Severity {
    Info,
    Advice,
    Warning,
    Error,
    Like,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "Info",
            Severity::Advice => "Advice",
            Severity::Warning => "Warning",
            Severity::Error => "Error",
            Severity::Like => "Like",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Evidence bucket attached to some reports.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Bucket {
    /// Strongest evidence (direct null test or literal).
    B1,
    /// Value produced by a callee.
    B2,
    /// Weakest evidence.
    B5,
    /// Leak blamed on the named resource family.
    Leak(ResourceKind),
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bucket::B1 => write!(f, "B1"),
            Bucket::B2 => write!(f, "B2"),
            Bucket::B5 => write!(f, "B5"),
            Bucket::Leak(kind) => write!(f, "L_{}", kind),
        }
    }
}

/// User-facing defect kinds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ErrKind {
    NullDereference,
    ParameterNotNullChecked,
    FieldNotNullChecked,
    UseAfterFree,
    DanglingPointerDereference,
    SkipPointerDereference,
    MemoryLeak,
    ResourceLeak,
    DeallocationMismatch,
    DivideByZero,
    ArrayOutOfBoundsL1,
    ArrayOutOfBoundsL2,
    ArrayOutOfBoundsL3,
    ClassCastException,
    PreconditionNotMet,
    StackVariableAddressEscape,
    RetainCycle,
    TaintedValueReachingSensitiveFunction,
    PointerSizeMismatch,
    AssertionFailure,
    WrongArgumentNumber,
    BadFootprint,
    InternalError,
    Timeout,
    ConditionAlwaysTrue,
    ConditionAlwaysFalse,
}

impl ErrKind {
    /// Stable bug-type string used in issue records and keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrKind::NullDereference => "NULL_DEREFERENCE",
            ErrKind::ParameterNotNullChecked => "PARAMETER_NOT_NULL_CHECKED",
            ErrKind::FieldNotNullChecked => "FIELD_NOT_NULL_CHECKED",
            ErrKind::UseAfterFree => "USE_AFTER_FREE",
            ErrKind::DanglingPointerDereference => "DANGLING_POINTER_DEREFERENCE",
            ErrKind::SkipPointerDereference => "SKIP_POINTER_DEREFERENCE",
            ErrKind::MemoryLeak => "MEMORY_LEAK",
            ErrKind::ResourceLeak => "RESOURCE_LEAK",
            ErrKind::DeallocationMismatch => "DEALLOCATION_MISMATCH",
            ErrKind::DivideByZero => "DIVIDE_BY_ZERO",
            ErrKind::ArrayOutOfBoundsL1 => "BUFFER_OVERRUN_L1",
            ErrKind::ArrayOutOfBoundsL2 => "BUFFER_OVERRUN_L2",
            ErrKind::ArrayOutOfBoundsL3 => "BUFFER_OVERRUN_L3",
            ErrKind::ClassCastException => "CLASS_CAST_EXCEPTION",
            ErrKind::PreconditionNotMet => "PRECONDITION_NOT_MET",
            ErrKind::StackVariableAddressEscape => "STACK_VARIABLE_ADDRESS_ESCAPE",
            ErrKind::RetainCycle => "RETAIN_CYCLE",
            ErrKind::TaintedValueReachingSensitiveFunction => {
                "TAINTED_VALUE_REACHING_SENSITIVE_FUNCTION"
            }
            ErrKind::PointerSizeMismatch => "POINTER_SIZE_MISMATCH",
            ErrKind::AssertionFailure => "ASSERTION_FAILURE",
            ErrKind::WrongArgumentNumber => "WRONG_ARGUMENT_NUMBER",
            ErrKind::BadFootprint => "BAD_FOOTPRINT",
            ErrKind::InternalError => "INTERNAL_ERROR",
            ErrKind::Timeout => "TIMEOUT",
            ErrKind::ConditionAlwaysTrue => "CONDITION_ALWAYS_TRUE",
            ErrKind::ConditionAlwaysFalse => "CONDITION_ALWAYS_FALSE",
        }
    }

    /// Default severity for this kind.
    pub fn default_severity(&self) -> Severity {
        match self {
            ErrKind::NullDereference
            | ErrKind::UseAfterFree
            | ErrKind::DanglingPointerDereference
            | ErrKind::MemoryLeak
            | ErrKind::DeallocationMismatch
            | ErrKind::DivideByZero
            | ErrKind::ArrayOutOfBoundsL1
            | ErrKind::ClassCastException
            | ErrKind::StackVariableAddressEscape
            | ErrKind::RetainCycle
            | ErrKind::TaintedValueReachingSensitiveFunction
            | ErrKind::AssertionFailure
            | ErrKind::InternalError => Severity::Error,
            ErrKind::ParameterNotNullChecked
            | ErrKind::FieldNotNullChecked
            | ErrKind::SkipPointerDereference
            | ErrKind::ResourceLeak
            | ErrKind::ArrayOutOfBoundsL2
            | ErrKind::ArrayOutOfBoundsL3
            | ErrKind::PreconditionNotMet
            | ErrKind::PointerSizeMismatch
            | ErrKind::WrongArgumentNumber
            | ErrKind::BadFootprint
            | ErrKind::Timeout => Severity::Warning,
            ErrKind::ConditionAlwaysTrue | ErrKind::ConditionAlwaysFalse => Severity::Info,
        }
    }
}

impl fmt::Display for ErrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One step of an issue trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceElem {
    pub level: usize,
    pub loc: Loc,
    pub description: String,
}

impl TraceElem {
    pub fn new(level: usize, loc: Loc, description: impl Into<String>) -> Self {
        Self {
            level,
            loc,
            description: description.into(),
        }
    }
}

/// Full description of a defect found on some path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDesc {
    pub kind: ErrKind,
    pub qualifier: String,
    pub loc: Loc,
    pub proc: ProcName,
    pub severity: Severity,
    pub bucket: Option<Bucket>,
    pub trace: Vec<TraceElem>,
    pub node_key: Option<String>,
}

impl ErrorDesc {
    pub fn new(
        kind: ErrKind,
        qualifier: impl Into<String>,
        loc: Loc,
        proc: impl Into<ProcName>,
    ) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            qualifier: qualifier.into(),
            loc,
            proc: proc.into(),
            bucket: None,
            trace: Vec::new(),
            node_key: None,
        }
    }

    pub fn with_bucket(mut self, bucket: Bucket) -> Self {
        self.bucket = Some(bucket);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_trace(mut self, trace: Vec<TraceElem>) -> Self {
        self.trace = trace;
        self
    }

    pub fn push_trace(&mut self, loc: Loc, description: impl Into<String>) {
        let level = self.trace.last().map(|t| t.level).unwrap_or(0);
        self.trace.push(TraceElem::new(level, loc, description));
    }
}

/// Key identifying one logged issue: one report per (kind, proc, line,
/// qualifier).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ErrKey {
    pub kind: ErrKind,
    pub proc: ProcName,
    pub line: u32,
    pub qualifier: String,
}

/// Data stored per logged issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrData {
    pub desc: ErrorDesc,
    /// Analysis phase name at report time ("footprint" / "re_execution").
    pub phase: String,
    /// How many times the same key was hit.
    pub occurrences: u32,
}

/// Per-procedure error log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Errlog {
    entries: BTreeMap<ErrKey, ErrData>,
}

impl Errlog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log a defect; repeated reports of the same key only bump a counter.
    pub fn log(&mut self, desc: ErrorDesc, phase: &str) {
        let key = ErrKey {
            kind: desc.kind,
            proc: desc.proc.clone(),
            line: desc.loc.line,
            qualifier: desc.qualifier.clone(),
        };
        self.entries
            .entry(key)
            .and_modify(|d| d.occurrences += 1)
            .or_insert_with(|| ErrData {
                desc,
                phase: phase.to_string(),
                occurrences: 1,
            });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ErrKey, &ErrData)> {
        self.entries.iter()
    }

    pub fn contains_kind(&self, kind: ErrKind) -> bool {
        self.entries.keys().any(|k| k.kind == kind)
    }

    /// Merge another log into this one.
    pub fn merge(&mut self, other: Errlog) {
        for (key, data) in other.entries {
            self.entries
                .entry(key)
                .and_modify(|d| d.occurrences += data.occurrences)
                .or_insert(data);
        }
    }
}

/// What timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutKind {
    /// Symbolic-operation budget exceeded.
    SymOp,
    /// Recursion bound exceeded.
    Recursion,
    /// Wallclock limit exceeded.
    Wallclock,
}

/// Faults raised inside the analyzer.
///
/// Every per-path boundary catches this and decides what to do: `Report`
/// is logged and the path continues elsewhere; `ReExeError` discards the
/// candidate precondition; `Timeout` aborts the procedure; `Internal`
/// aborts the worker.
#[derive(Debug, Clone, Error)]
pub enum AnalysisFault {
    /// A defect to report, found on the current path.
    #[error("{}: {}", .0.kind, .0.qualifier)]
    Report(Box<ErrorDesc>),

    /// Fatal memory fault during re-execution (the candidate precondition
    /// does not protect this path).
    #[error("re-execution: {}: {}", .0.kind, .0.qualifier)]
    ReExeError(Box<ErrorDesc>),

    /// A struct field expected by the program is missing from the store.
    #[error("missing field {0}")]
    MissingFld(FieldName),

    /// The footprint lost an assumption it needed.
    #[error("bad footprint: {0}")]
    BadFootprint(String),

    /// No usable precondition for a callee.
    #[error("precondition not found for {0}")]
    PreconditionNotFound(ProcName),

    /// Budget or bound exceeded.
    #[error("timeout ({0:?})")]
    Timeout(TimeoutKind),

    /// Invariant violation inside the analyzer.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AnalysisFault {
    pub fn report(desc: ErrorDesc) -> Self {
        AnalysisFault::Report(Box::new(desc))
    }

    /// Recoverable faults are logged at the path boundary; analysis of
    /// other paths continues.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AnalysisFault::Report(_)
                | AnalysisFault::MissingFld(_)
                | AnalysisFault::BadFootprint(_)
                | AnalysisFault::PreconditionNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AnalysisFault>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errlog_dedups_by_key() {
        let mut log = Errlog::new();
        let desc = ErrorDesc::new(
            ErrKind::NullDereference,
            "pointer p could be null",
            Loc::new("a.c", 3, 1),
            "f",
        );
        log.log(desc.clone(), "footprint");
        log.log(desc, "footprint");

        assert_eq!(log.len(), 1);
        let (_, data) = log.iter().next().unwrap();
        assert_eq!(data.occurrences, 2);
    }

    #[test]
    fn test_fault_recoverability() {
        let desc = ErrorDesc::new(ErrKind::MemoryLeak, "leak", Loc::dummy(), "f");
        assert!(AnalysisFault::report(desc.clone()).is_recoverable());
        assert!(!AnalysisFault::ReExeError(Box::new(desc)).is_recoverable());
        assert!(!AnalysisFault::Timeout(TimeoutKind::SymOp).is_recoverable());
    }

    #[test]
    fn test_bug_type_strings() {
        assert_eq!(ErrKind::NullDereference.as_str(), "NULL_DEREFERENCE");
        assert_eq!(ErrKind::ArrayOutOfBoundsL1.as_str(), "BUFFER_OVERRUN_L1");
        assert_eq!(
            ErrKind::ArrayOutOfBoundsL1.default_severity(),
            Severity::Error
        );
        assert_eq!(
            ErrKind::ArrayOutOfBoundsL2.default_severity(),
            Severity::Warning
        );
    }
}
