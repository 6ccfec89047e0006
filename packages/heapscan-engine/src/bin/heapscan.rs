//! heapscan driver CLI
//!
//! Loads captured CFG programs from `<results-dir>/capture/*.json`, runs
//! the interprocedural analysis, and writes `report.json`,
//! `costs-report.json` and the specs directory under the results dir.

use clap::Parser;
use heapscan_engine::features::callbacks::CallbackRegistry;
use heapscan_engine::features::reporting::{
    issues_of_errlog, write_costs_report, write_report, ReportConfig,
};
use heapscan_engine::features::summaries::{SpecTable, SUMMARY_KEY};
use heapscan_engine::features::symexec::builtins;
use heapscan_engine::shared::models::CfgProgram;
use heapscan_engine::{analyze_program, AnalysisConfig, ExeEnv, WorklistMode};
use heapscan_store::SpecStore;
use rustc_hash::FxHashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "heapscan")]
#[command(about = "Interprocedural memory-safety analysis via bi-abduction", long_about = None)]
struct Cli {
    /// Directory for captures, summaries and reports
    #[arg(long)]
    results_dir: PathBuf,

    /// Sub-job tag for cluster runs
    #[arg(long)]
    cluster: Option<String>,

    /// Compilation database files (recorded, consumed by the capture step)
    #[arg(long)]
    compilation_db_files: Vec<PathBuf>,

    /// Record backtraces and verbose logs
    #[arg(long)]
    developer_mode: bool,

    /// Stop after the footprint phase
    #[arg(long)]
    only_footprint: bool,

    /// Only analyze procedures without specs
    #[arg(long)]
    only_nospecs: bool,

    /// Only analyze procedures previously skipped
    #[arg(long)]
    only_skips: bool,

    /// Worker parallelism
    #[arg(long)]
    num_cores: Option<usize>,

    /// Cap on concurrently analyzed procedures (0 = unlimited)
    #[arg(long, default_value = "0")]
    max_num_proc: usize,

    /// Recursion bound for cyclic call graphs and on-demand nesting
    #[arg(long, default_value = "5")]
    max_recursion: u32,

    /// Worklist scheduling mode (0 = visit count, 1 = node id, 2 = distance)
    #[arg(long, default_value = "0")]
    worklist_mode: u32,

    /// Re-analyze only what changed
    #[arg(long)]
    reactive: bool,

    /// Enable or disable footprint synthesis ("on" / "off")
    #[arg(long, default_value = "on")]
    footprint: String,

    /// Analyze callees on demand
    #[arg(long)]
    ondemand: bool,

    /// Print the builtin model registry and exit
    #[arg(long)]
    print_builtins: bool,

    /// Emit HTML traces
    #[arg(long)]
    write_html: bool,

    /// Abstraction level applied when collecting specs
    #[arg(long, default_value = "1")]
    spec_abs_level: u32,

    /// Disable joining at join nodes
    #[arg(long)]
    undo_join: bool,

    /// Meet operator level
    #[arg(long, default_value = "1")]
    meet_level: u32,

    /// Prefix qualifiers with evidence buckets
    #[arg(long)]
    show_buckets: bool,

    /// Report inconsistent use of @Nullable annotations
    #[arg(long)]
    report_nullable_inconsistency: bool,

    /// Apply severity filtering and censor rules ("on" / "off")
    #[arg(long, default_value = "on")]
    filtering: String,
}

fn parse_on_off(s: &str) -> Result<bool, String> {
    match s {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(format!("expected 'on' or 'off', got '{}'", other)),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.developer_mode { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if cli.print_builtins {
        for name in builtins::names() {
            println!("{}", name);
        }
        return ExitCode::SUCCESS;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("heapscan: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), String> {
    if !cli.results_dir.exists() {
        return Err(format!(
            "results dir {} does not exist",
            cli.results_dir.display()
        ));
    }

    let config = AnalysisConfig {
        results_dir: cli.results_dir.clone(),
        cluster: cli.cluster,
        compilation_db_files: cli.compilation_db_files,
        developer_mode: cli.developer_mode,
        only_footprint: cli.only_footprint,
        only_nospecs: cli.only_nospecs,
        only_skips: cli.only_skips,
        num_cores: cli.num_cores.unwrap_or_else(num_cpus::get),
        max_num_proc: cli.max_num_proc,
        max_recursion: cli.max_recursion,
        worklist_mode: WorklistMode::from_flag(cli.worklist_mode),
        reactive: cli.reactive,
        footprint: parse_on_off(&cli.footprint)?,
        ondemand: cli.ondemand,
        write_html: cli.write_html,
        spec_abs_level: cli.spec_abs_level,
        undo_join: cli.undo_join,
        meet_level: cli.meet_level,
        show_buckets: cli.show_buckets,
        report_nullable_inconsistency: cli.report_nullable_inconsistency,
        filtering: parse_on_off(&cli.filtering)?,
        ..Default::default()
    };

    if let Some(cores) = cli.num_cores {
        rayon::ThreadPoolBuilder::new()
            .num_threads(cores)
            .build_global()
            .map_err(|e| format!("thread pool setup failed: {}", e))?;
    }

    // Capture files: one CfgProgram per JSON file under capture/.
    let capture_dir = config.results_dir.join("capture");
    let mut program = CfgProgram::default();
    let entries = std::fs::read_dir(&capture_dir)
        .map_err(|e| format!("cannot read {}: {}", capture_dir.display(), e))?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(format!("no capture files in {}", capture_dir.display()));
    }
    for file in &files {
        let data = std::fs::read_to_string(file)
            .map_err(|e| format!("cannot read {}: {}", file.display(), e))?;
        let mut part: CfgProgram = serde_json::from_str(&data)
            .map_err(|e| format!("corrupt capture {}: {}", file.display(), e))?;
        program.procs.append(&mut part.procs);
        // Last capture wins for colliding struct names.
        program.tenv = part.tenv;
    }
    program.prepare();

    let store = SpecStore::open(&config.results_dir, "specs", SUMMARY_KEY)
        .map_err(|e| format!("summary store unusable: {}", e))?;
    let spec_table = SpecTable::with_store(Some(store));

    let env = ExeEnv::new(program, spec_table, config.clone());
    let callbacks = CallbackRegistry::new();
    let stats = analyze_program(&env, &callbacks);

    eprintln!(
        "heapscan: analyzed {} procedures in {:.1} ms, {} issues",
        stats.procs_analyzed, stats.elapsed_ms, stats.issues
    );

    // Reports.
    let proc_start_lines: FxHashMap<String, u32> = env
        .program
        .procs
        .iter()
        .map(|p| (p.attrs.name.clone(), p.attrs.loc.line))
        .collect();
    let errlog = env.errlog_snapshot();
    let report_config = ReportConfig {
        filtering: config.filtering,
        show_buckets: config.show_buckets,
        censor_rules: Vec::new(),
    };
    let issues = issues_of_errlog(&errlog, &proc_start_lines, &report_config);
    write_report(&config.results_dir.join("report.json"), &issues)
        .map_err(|e| format!("cannot write report: {}", e))?;

    let summaries: Vec<_> = env
        .spec_table
        .names_in_memory()
        .iter()
        .filter_map(|name| env.spec_table.get(name))
        .collect();
    write_costs_report(&config.results_dir.join("costs-report.json"), &summaries)
        .map_err(|e| format!("cannot write costs report: {}", e))?;

    Ok(())
}
