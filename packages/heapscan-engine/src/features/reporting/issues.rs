//! JSON issue records
//!
//! One record per logged defect. The `hash` field is stable across
//! re-runs and cosmetic edits: it ignores line/column renumbering,
//! `n$N` temporaries, `$N` parameter indices and anonymous-class ordinal
//! markers in qualifiers, so the same defect keeps the same identity when
//! the file shifts.

use crate::errors::{Errlog, Severity};
use crate::features::summaries::Summary;
use crate::shared::models::ProcName;
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;

/// One step of a reported trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BugTraceElem {
    pub level: usize,
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub description: String,
}

/// One reported issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub bug_type: String,
    pub qualifier: String,
    pub severity: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub procedure: String,
    pub procedure_start_line: u32,
    pub bug_trace: Vec<BugTraceElem>,
    pub key: String,
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dotty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub censored_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extras: Option<serde_json::Value>,
}

/// Per-procedure cost record (parallel stream to the issues).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub hash: String,
    pub loc: u32,
    pub procedure_name: String,
    pub procedure_id: String,
    pub is_on_ui_thread: bool,
    pub exec_cost: ExecCost,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecCost {
    pub polynomial_version: u32,
    /// Opaque polynomial payload.
    pub polynomial: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degree: Option<u32>,
    pub hum: HumanizedCost,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanizedCost {
    pub hum_polynomial: String,
    pub hum_degree: String,
    pub big_o: String,
}

/// One censor rule: a polarity pair of regexes over (bug_type, filename).
///
/// Polarity `true` means "must match", `false` means "must not match".
/// An empty pattern is inert: with positive polarity the member never
/// holds — so an all-empty rule censors nothing — and with negative
/// polarity it always holds. Rules are conjunctive across their two
/// members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CensorRule {
    pub bug_type_pattern: String,
    pub bug_type_polarity: bool,
    pub filename_pattern: String,
    pub filename_polarity: bool,
    pub reason: String,
}

impl CensorRule {
    fn member_matches(pattern: &str, polarity: bool, input: &str) -> bool {
        if pattern.is_empty() {
            return !polarity;
        }
        let matched = Regex::new(pattern)
            .map(|re| re.is_match(input))
            .unwrap_or(false);
        matched == polarity
    }

    pub fn applies(&self, bug_type: &str, filename: &str) -> bool {
        Self::member_matches(&self.bug_type_pattern, self.bug_type_polarity, bug_type)
            && Self::member_matches(&self.filename_pattern, self.filename_polarity, filename)
    }
}

/// Report generation options.
#[derive(Debug, Clone, Default)]
pub struct ReportConfig {
    pub filtering: bool,
    pub show_buckets: bool,
    pub censor_rules: Vec<CensorRule>,
}

static RE_TEMP: Lazy<Regex> = Lazy::new(|| Regex::new(r"n\$\d+").expect("static regex"));
static RE_PARAM: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\d+").expect("static regex"));
static RE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(line|column)\s+\d+").expect("static regex"));
static RE_POS: Lazy<Regex> = Lazy::new(|| Regex::new(r":\d+(:\d+)?").expect("static regex"));

/// Strip volatile parts of a qualifier before hashing.
pub fn normalize_qualifier(qualifier: &str) -> String {
    let s = RE_TEMP.replace_all(qualifier, "n$$_");
    let s = RE_PARAM.replace_all(&s, "$$_");
    let s = RE_LINE.replace_all(&s, "$1 _");
    RE_POS.replace_all(&s, ":_").into_owned()
}

/// Strip anonymous-class ordinals from a procedure name.
fn normalize_proc(proc: &str) -> String {
    RE_PARAM.replace_all(proc, "$$_").into_owned()
}

/// `basename|procedure|bug_type`.
pub fn compute_key(basename: &str, proc: &str, bug_type: &str) -> String {
    format!("{}|{}|{}", basename, proc, bug_type)
}

/// Stable issue hash over (severity, bug_type, normalized procedure,
/// basename, normalized qualifier).
pub fn compute_hash(
    severity: &str,
    bug_type: &str,
    proc: &str,
    basename: &str,
    qualifier: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(severity.as_bytes());
    hasher.update(b"|");
    hasher.update(bug_type.as_bytes());
    hasher.update(b"|");
    hasher.update(normalize_proc(proc).as_bytes());
    hasher.update(b"|");
    hasher.update(basename.as_bytes());
    hasher.update(b"|");
    hasher.update(normalize_qualifier(qualifier).as_bytes());
    let digest = hasher.finalize();
    // 16 hex chars are plenty for issue identity.
    digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}

/// Convert the error log into issue records.
pub fn issues_of_errlog(
    errlog: &Errlog,
    proc_start_lines: &FxHashMap<ProcName, u32>,
    config: &ReportConfig,
) -> Vec<IssueRecord> {
    let mut out = Vec::new();
    for (_, data) in errlog.iter() {
        let desc = &data.desc;
        let severity = desc.severity;

        if config.filtering && matches!(severity, Severity::Info | Severity::Advice) {
            continue;
        }

        let qualifier = match (&desc.bucket, config.show_buckets) {
            (Some(bucket), true) => format!("[{}] {}", bucket, desc.qualifier),
            _ => desc.qualifier.clone(),
        };

        let bug_type = desc.kind.as_str().to_string();
        let basename = desc.loc.basename().to_string();
        let censored_reason = config
            .censor_rules
            .iter()
            .find(|rule| rule.applies(&bug_type, &desc.loc.file))
            .map(|rule| rule.reason.clone());
        if config.filtering && censored_reason.is_some() {
            continue;
        }

        let bug_trace = desc
            .trace
            .iter()
            .map(|t| BugTraceElem {
                level: t.level,
                file: t.loc.file.clone(),
                line: t.loc.line,
                column: t.loc.col,
                description: t.description.clone(),
            })
            .collect();

        out.push(IssueRecord {
            hash: compute_hash(
                severity.as_str(),
                &bug_type,
                &desc.proc,
                &basename,
                &desc.qualifier,
            ),
            key: compute_key(&basename, &desc.proc, &bug_type),
            bug_type,
            qualifier,
            severity: severity.as_str().to_string(),
            file: desc.loc.file.clone(),
            line: desc.loc.line,
            column: desc.loc.col,
            procedure: desc.proc.clone(),
            procedure_start_line: proc_start_lines.get(&desc.proc).copied().unwrap_or(0),
            bug_trace,
            node_key: desc.node_key.clone(),
            dotty: None,
            censored_reason,
            access: None,
            extras: None,
        });
    }
    out
}

/// Write the issues report as a JSON array.
pub fn write_report(path: &Path, issues: &[IssueRecord]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(&mut file, issues)?;
    file.write_all(b"\n")
}

/// Write the per-procedure cost stream (symop counts as constant
/// polynomials).
pub fn write_costs_report(path: &Path, summaries: &[Summary]) -> std::io::Result<()> {
    let records: Vec<CostRecord> = summaries
        .iter()
        .map(|s| CostRecord {
            hash: compute_hash("Info", "EXECUTION_COST", &s.proc_name, "", ""),
            loc: s.attributes.loc.line,
            procedure_name: s.proc_name.clone(),
            procedure_id: s.proc_name.clone(),
            is_on_ui_thread: false,
            exec_cost: ExecCost {
                polynomial_version: 1,
                polynomial: format!("{}", s.stats.symops),
                degree: Some(0),
                hum: HumanizedCost {
                    hum_polynomial: format!("{}", s.stats.symops),
                    hum_degree: "0".to_string(),
                    big_o: "O(1)".to_string(),
                },
            },
        })
        .collect();
    let mut file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(&mut file, &records)?;
    file.write_all(b"\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ErrKind, ErrorDesc};
    use crate::shared::models::Loc;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_hash_stable_under_renumbering() {
        let a = compute_hash(
            "Error",
            "NULL_DEREFERENCE",
            "f",
            "a.c",
            "pointer n$3 last assigned on line 12 could be null",
        );
        let b = compute_hash(
            "Error",
            "NULL_DEREFERENCE",
            "f",
            "a.c",
            "pointer n$7 last assigned on line 99 could be null",
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_stable_under_param_index_and_position() {
        let a = compute_hash("Error", "PRECONDITION_NOT_MET", "g$1", "b.c", "at b.c:10:2");
        let b = compute_hash("Error", "PRECONDITION_NOT_MET", "g$2", "b.c", "at b.c:44:7");
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_differs_across_bug_types() {
        let a = compute_hash("Error", "NULL_DEREFERENCE", "f", "a.c", "q");
        let b = compute_hash("Error", "USE_AFTER_FREE", "f", "a.c", "q");
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_format() {
        assert_eq!(
            compute_key("a.c", "f", "NULL_DEREFERENCE"),
            "a.c|f|NULL_DEREFERENCE"
        );
    }

    #[test]
    fn test_censor_rule_polarity() {
        let positive = CensorRule {
            bug_type_pattern: "NULL.*".to_string(),
            bug_type_polarity: true,
            filename_pattern: "generated/".to_string(),
            filename_polarity: true,
            reason: "generated code".to_string(),
        };
        assert!(positive.applies("NULL_DEREFERENCE", "generated/x.c"));
        assert!(!positive.applies("NULL_DEREFERENCE", "src/x.c"));

        let negative = CensorRule {
            bug_type_pattern: ".*".to_string(),
            bug_type_polarity: true,
            filename_pattern: "tests/".to_string(),
            filename_polarity: false,
            reason: "only outside tests".to_string(),
        };
        assert!(negative.applies("ANY", "src/x.c"));
        assert!(!negative.applies("ANY", "tests/x.c"));
    }

    #[test]
    fn test_all_empty_rule_censors_nothing() {
        let rule = CensorRule {
            bug_type_pattern: String::new(),
            bug_type_polarity: true,
            filename_pattern: String::new(),
            filename_polarity: true,
            reason: "inert".to_string(),
        };
        assert!(!rule.applies("NULL_DEREFERENCE", "a.c"));
    }

    #[test]
    fn test_filtering_drops_informational() {
        let mut errlog = Errlog::new();
        errlog.log(
            ErrorDesc::new(
                ErrKind::ConditionAlwaysTrue,
                "always true",
                Loc::new("a.c", 1, 0),
                "f",
            ),
            "footprint",
        );
        errlog.log(
            ErrorDesc::new(
                ErrKind::NullDereference,
                "null",
                Loc::new("a.c", 2, 0),
                "f",
            ),
            "footprint",
        );

        let filtered = issues_of_errlog(
            &errlog,
            &FxHashMap::default(),
            &ReportConfig {
                filtering: true,
                ..Default::default()
            },
        );
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].bug_type, "NULL_DEREFERENCE");

        let unfiltered =
            issues_of_errlog(&errlog, &FxHashMap::default(), &ReportConfig::default());
        assert_eq!(unfiltered.len(), 2);
    }
}
