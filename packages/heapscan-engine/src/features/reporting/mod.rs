//! Issue reporting
//!
//! Turns the error log into the JSON issue stream, with stable hashes,
//! severity filtering and censor rules.

pub mod issues;

pub use issues::{
    compute_hash, compute_key, issues_of_errlog, normalize_qualifier, write_costs_report,
    write_report, BugTraceElem, CensorRule, CostRecord, IssueRecord, ReportConfig,
};
