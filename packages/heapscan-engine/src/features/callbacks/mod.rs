//! Checker callbacks
//!
//! Plugin checkers register per language; after a procedure's summary is
//! computed, every callback registered for its language runs with a
//! closed capability record (the procedures of the file, the summary, and
//! the execution environment). The registry is explicit — no ambient
//! global state.

use crate::errors::Errlog;
use crate::features::orchestration::ExeEnv;
use crate::features::summaries::Summary;
use crate::shared::models::{Language, ProcName};

/// What a checker callback is allowed to see.
pub struct CheckerContext<'a> {
    /// Names of procedures defined in the same source file.
    pub procs_in_file: Vec<ProcName>,
    /// The summary just computed.
    pub summary: &'a Summary,
    /// Execution environment (program, spec table, config).
    pub exe_env: &'a ExeEnv,
}

/// A checker callback: inspects a summary, may log further issues.
pub type CheckerCallback = fn(&CheckerContext, &mut Errlog);

struct Registration {
    language: Language,
    name: &'static str,
    callback: CheckerCallback,
}

/// Registry of checker callbacks keyed by language.
#[derive(Default)]
pub struct CallbackRegistry {
    registrations: Vec<Registration>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        language: Language,
        name: &'static str,
        callback: CheckerCallback,
    ) {
        self.registrations.push(Registration {
            language,
            name,
            callback,
        });
    }

    pub fn names_for(&self, language: Language) -> Vec<&'static str> {
        self.registrations
            .iter()
            .filter(|r| r.language == language)
            .map(|r| r.name)
            .collect()
    }

    /// Run every callback registered for the summary's language.
    pub fn run(&self, env: &ExeEnv, summary: &Summary, errlog: &mut Errlog) {
        let language = summary.attributes.language;
        let file = &summary.attributes.loc.file;
        let procs_in_file: Vec<ProcName> = env
            .program
            .procs
            .iter()
            .filter(|p| p.attrs.loc.file == *file)
            .map(|p| p.attrs.name.clone())
            .collect();

        for reg in self
            .registrations
            .iter()
            .filter(|r| r.language == language)
        {
            let ctx = CheckerContext {
                procs_in_file: procs_in_file.clone(),
                summary,
                exe_env: env,
            };
            (reg.callback)(&ctx, errlog);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ErrKind, ErrorDesc};
    use crate::shared::models::Loc;

    fn dummy_checker(ctx: &CheckerContext, errlog: &mut Errlog) {
        if ctx.summary.specs().is_empty() {
            errlog.log(
                ErrorDesc::new(
                    ErrKind::AssertionFailure,
                    "no specs",
                    Loc::dummy(),
                    ctx.summary.proc_name.clone(),
                ),
                "footprint",
            );
        }
    }

    #[test]
    fn test_registry_filters_by_language() {
        let mut reg = CallbackRegistry::new();
        reg.register(Language::Java, "nullable-consistency", dummy_checker);
        reg.register(Language::C, "memory-pairing", dummy_checker);

        assert_eq!(reg.names_for(Language::Java), vec!["nullable-consistency"]);
        assert_eq!(reg.names_for(Language::C), vec!["memory-pairing"]);
        assert!(reg.names_for(Language::ObjC).is_empty());
    }
}
