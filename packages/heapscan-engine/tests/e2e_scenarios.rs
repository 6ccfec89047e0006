//! End-to-end analysis scenarios
//!
//! Each test hand-builds the CFG a front-end would produce for a small C
//! program, runs the full interprocedural analysis, and checks the issue
//! stream and summaries.

use heapscan_engine::features::callbacks::CallbackRegistry;
use heapscan_engine::features::prop::Hpred;
use heapscan_engine::features::prover;
use heapscan_engine::features::reporting::{issues_of_errlog, IssueRecord, ReportConfig};
use heapscan_engine::features::summaries::SpecTable;
use heapscan_engine::shared::models::{
    CfgNode, CfgProgram, Exp, Ident, IdentKind, Instr, Language, Loc, NodeKind,
    ProcAttributes, ProcCfg, Pvar, Typ,
};
use heapscan_engine::{analyze_program, AnalysisConfig, ExeEnv};
use rustc_hash::FxHashMap;

fn temp(stamp: u64) -> Ident {
    // High stamps keep test temporaries clear of generator output.
    Ident::new(IdentKind::Normal, "n", 1000 + stamp)
}

fn node(id: usize, kind: NodeKind, instrs: Vec<Instr>, succs: Vec<usize>, line: u32) -> CfgNode {
    node_in(id, kind, instrs, succs, line, "a.c")
}

fn node_in(
    id: usize,
    kind: NodeKind,
    instrs: Vec<Instr>,
    succs: Vec<usize>,
    line: u32,
    file: &str,
) -> CfgNode {
    CfgNode {
        id,
        kind,
        instrs,
        succs,
        exn_succs: vec![],
        loc: Loc::new(file, line, 0),
        dist_to_exit: None,
    }
}

fn straight_line(attrs: ProcAttributes, instrs: Vec<Instr>) -> ProcCfg {
    let line = attrs.loc.line;
    let file = attrs.loc.file.clone();
    ProcCfg {
        attrs,
        nodes: vec![
            node_in(0, NodeKind::Start, vec![], vec![1], line, &file),
            node_in(1, NodeKind::Stmt, instrs, vec![2], line, &file),
            node_in(2, NodeKind::Exit, vec![], vec![], line + 10, &file),
        ],
        start: 0,
        exit: 2,
    }
}

fn run(procs: Vec<ProcCfg>) -> ExeEnv {
    run_with(procs, AnalysisConfig::default())
}

fn run_with(procs: Vec<ProcCfg>, config: AnalysisConfig) -> ExeEnv {
    let mut program = CfgProgram {
        procs,
        tenv: Default::default(),
    };
    program.prepare();
    let env = ExeEnv::new(program, SpecTable::in_memory(), config);
    analyze_program(&env, &CallbackRegistry::new());
    env
}

fn report(env: &ExeEnv) -> Vec<IssueRecord> {
    let proc_start_lines: FxHashMap<String, u32> = env
        .program
        .procs
        .iter()
        .map(|p| (p.attrs.name.clone(), p.attrs.loc.line))
        .collect();
    issues_of_errlog(
        &env.errlog_snapshot(),
        &proc_start_lines,
        &ReportConfig {
            filtering: true,
            ..Default::default()
        },
    )
}

/// `void f() { int *p = 0; *p = 1; }`
#[test]
fn test_direct_null_dereference() {
    let p = Pvar::local("p", "f");
    let ptr_int = Typ::ptr_to(Typ::Int);
    let mut attrs = ProcAttributes::new("f", Language::C);
    attrs.loc = Loc::new("a.c", 1, 0);

    let f = straight_line(
        attrs,
        vec![
            Instr::Store {
                lexp: Exp::Lvar(p.clone()),
                typ: ptr_int.clone(),
                rhs: Exp::zero(),
                loc: Loc::new("a.c", 2, 0),
            },
            Instr::Load {
                id: temp(0),
                lexp: Exp::Lvar(p),
                typ: ptr_int,
                loc: Loc::new("a.c", 3, 0),
            },
            Instr::Store {
                lexp: Exp::var(temp(0)),
                typ: Typ::Int,
                rhs: Exp::one(),
                loc: Loc::new("a.c", 3, 0),
            },
        ],
    );

    let env = run(vec![f]);
    let issues = report(&env);

    assert_eq!(issues.len(), 1, "issues: {:?}", issues);
    let issue = &issues[0];
    assert_eq!(issue.bug_type, "NULL_DEREFERENCE");
    assert_eq!(issue.severity, "Error");
    assert_eq!(issue.line, 3);
    assert!(issue.bug_trace.len() >= 2);

    // The fatal path reached no exit: no specs.
    let summary = env.spec_table.get("f").expect("summary exists");
    assert!(!summary.has_specs());
}

/// `int* g(); void h() { int *p = g(); *p = 1; }` with g returning null.
#[test]
fn test_null_propagated_through_callee() {
    let ptr_int = Typ::ptr_to(Typ::Int);

    let mut g_attrs = ProcAttributes::new("g", Language::C);
    g_attrs.ret_type = ptr_int.clone();
    g_attrs.loc = Loc::new("a.c", 10, 0);
    let g = straight_line(
        g_attrs,
        vec![Instr::Store {
            lexp: Exp::Lvar(Pvar::ret_var("g")),
            typ: ptr_int.clone(),
            rhs: Exp::zero(),
            loc: Loc::new("a.c", 11, 0),
        }],
    );

    let mut h_attrs = ProcAttributes::new("h", Language::C);
    h_attrs.loc = Loc::new("a.c", 20, 0);
    let h = straight_line(
        h_attrs,
        vec![
            Instr::Call {
                rets: vec![temp(0)],
                fexp: Exp::fun("g"),
                args: vec![],
                loc: Loc::new("a.c", 21, 0),
                flags: Default::default(),
            },
            Instr::Store {
                lexp: Exp::var(temp(0)),
                typ: Typ::Int,
                rhs: Exp::one(),
                loc: Loc::new("a.c", 22, 0),
            },
        ],
    );

    let env = run(vec![h, g]);

    // The callee got a spec whose post returns null.
    assert!(env.spec_table.get("g").unwrap().has_specs());

    let issues = report(&env);
    let null_in_h: Vec<_> = issues
        .iter()
        .filter(|i| i.bug_type == "NULL_DEREFERENCE" && i.procedure == "h")
        .collect();
    assert_eq!(null_in_h.len(), 1, "issues: {:?}", issues);
    assert_eq!(null_in_h[0].line, 22);
    assert!(
        null_in_h[0]
            .bug_trace
            .iter()
            .any(|t| t.description.contains("returned from g")),
        "trace: {:?}",
        null_in_h[0].bug_trace
    );
}

/// `void f(int *p) { free(p); free(p); }`
#[test]
fn test_double_free() {
    fn build(file: &str) -> ProcCfg {
        let ptr_int = Typ::ptr_to(Typ::Int);
        let mut attrs = ProcAttributes::new("f", Language::C);
        attrs.formals = vec![("p".to_string(), ptr_int.clone())];
        attrs.loc = Loc::new(file, 1, 0);
        straight_line(
            attrs,
            vec![
                Instr::Load {
                    id: temp(0),
                    lexp: Exp::Lvar(Pvar::local("p", "f")),
                    typ: ptr_int.clone(),
                    loc: Loc::new(file, 2, 0),
                },
                Instr::Call {
                    rets: vec![],
                    fexp: Exp::fun("free"),
                    args: vec![(Exp::var(temp(0)), ptr_int.clone())],
                    loc: Loc::new(file, 2, 0),
                    flags: Default::default(),
                },
                Instr::Load {
                    id: temp(1),
                    lexp: Exp::Lvar(Pvar::local("p", "f")),
                    typ: ptr_int.clone(),
                    loc: Loc::new(file, 3, 0),
                },
                Instr::Call {
                    rets: vec![],
                    fexp: Exp::fun("free"),
                    args: vec![(Exp::var(temp(1)), ptr_int)],
                    loc: Loc::new(file, 3, 0),
                    flags: Default::default(),
                },
            ],
        )
    }

    let env = run(vec![build("x/a.c")]);
    let issues = report(&env);
    let uaf: Vec<_> = issues
        .iter()
        .filter(|i| i.bug_type == "USE_AFTER_FREE")
        .collect();
    assert_eq!(uaf.len(), 1, "issues: {:?}", issues);
    assert_eq!(uaf[0].line, 3, "reported at the second free");

    // The hash must not depend on the directory holding the file.
    let env2 = run(vec![build("y/deeper/a.c")]);
    let issues2 = report(&env2);
    let uaf2: Vec<_> = issues2
        .iter()
        .filter(|i| i.bug_type == "USE_AFTER_FREE")
        .collect();
    assert_eq!(uaf[0].hash, uaf2[0].hash);
}

/// `void f() { int a[4]; a[5] = 0; }`
#[test]
fn test_array_bounds_l1() {
    let mut attrs = ProcAttributes::new("f", Language::C);
    attrs.locals = vec![("a".to_string(), Typ::array_of(Typ::Int, Some(4)))];
    attrs.loc = Loc::new("a.c", 1, 0);

    let f = straight_line(
        attrs,
        vec![Instr::Store {
            lexp: Exp::index(Exp::Lvar(Pvar::local("a", "f")), Exp::int(5)),
            typ: Typ::Int,
            rhs: Exp::zero(),
            loc: Loc::new("a.c", 3, 0),
        }],
    );

    let env = run(vec![f]);
    let issues = report(&env);
    let oob: Vec<_> = issues
        .iter()
        .filter(|i| i.bug_type == "BUFFER_OVERRUN_L1")
        .collect();
    assert_eq!(oob.len(), 1, "issues: {:?}", issues);
    assert_eq!(oob[0].severity, "Error");
    assert_eq!(oob[0].line, 3);
}

/// `void f() { int *p = (int*)malloc(4); }`
#[test]
fn test_memory_leak_at_exit() {
    let ptr_int = Typ::ptr_to(Typ::Int);
    let mut attrs = ProcAttributes::new("f", Language::C);
    attrs.loc = Loc::new("a.c", 1, 0);

    let f = straight_line(
        attrs,
        vec![
            Instr::Call {
                rets: vec![temp(0)],
                fexp: Exp::fun("malloc"),
                args: vec![(Exp::sizeof(Typ::Int), Typ::Int)],
                loc: Loc::new("a.c", 2, 0),
                flags: Default::default(),
            },
            Instr::Store {
                lexp: Exp::Lvar(Pvar::local("p", "f")),
                typ: ptr_int,
                rhs: Exp::var(temp(0)),
                loc: Loc::new("a.c", 2, 0),
            },
            Instr::Nullify {
                pvar: Pvar::local("p", "f"),
                loc: Loc::new("a.c", 3, 0),
            },
            Instr::Abstract {
                loc: Loc::new("a.c", 3, 0),
            },
        ],
    );

    let env = run(vec![f]);
    let issues = report(&env);
    let leaks: Vec<_> = issues
        .iter()
        .filter(|i| i.bug_type == "MEMORY_LEAK")
        .collect();
    assert_eq!(leaks.len(), 1, "issues: {:?}", issues);
    assert!(
        leaks[0].qualifier.contains("malloc"),
        "leak blamed on the allocator: {}",
        leaks[0].qualifier
    );
    assert!(leaks[0].bug_trace.len() >= 2);
}

/// Callee `void g(int *p) { *p = 1; }`; caller `void f(int *q) { g(q); }`.
/// The caller's inferred precondition must require `q` allocated (hence
/// non-null); a caller passing a provably-null argument gets
/// PRECONDITION_NOT_MET.
#[test]
fn test_callee_precondition_propagates() {
    let ptr_int = Typ::ptr_to(Typ::Int);

    let mut g_attrs = ProcAttributes::new("g", Language::C);
    g_attrs.formals = vec![("p".to_string(), ptr_int.clone())];
    g_attrs.loc = Loc::new("a.c", 1, 0);
    let g = straight_line(
        g_attrs,
        vec![
            Instr::Load {
                id: temp(0),
                lexp: Exp::Lvar(Pvar::local("p", "g")),
                typ: ptr_int.clone(),
                loc: Loc::new("a.c", 2, 0),
            },
            Instr::Store {
                lexp: Exp::var(temp(0)),
                typ: Typ::Int,
                rhs: Exp::one(),
                loc: Loc::new("a.c", 2, 0),
            },
        ],
    );

    let mut f_attrs = ProcAttributes::new("f", Language::C);
    f_attrs.formals = vec![("q".to_string(), ptr_int.clone())];
    f_attrs.loc = Loc::new("a.c", 10, 0);
    let f = straight_line(
        f_attrs,
        vec![
            Instr::Load {
                id: temp(1),
                lexp: Exp::Lvar(Pvar::local("q", "f")),
                typ: ptr_int.clone(),
                loc: Loc::new("a.c", 11, 0),
            },
            Instr::Call {
                rets: vec![],
                fexp: Exp::fun("g"),
                args: vec![(Exp::var(temp(1)), ptr_int.clone())],
                loc: Loc::new("a.c", 11, 0),
                flags: Default::default(),
            },
        ],
    );

    let mut h_attrs = ProcAttributes::new("h", Language::C);
    h_attrs.loc = Loc::new("a.c", 20, 0);
    let h = straight_line(
        h_attrs,
        vec![Instr::Call {
            rets: vec![],
            fexp: Exp::fun("g"),
            args: vec![(Exp::zero(), ptr_int)],
            loc: Loc::new("a.c", 21, 0),
            flags: Default::default(),
        }],
    );

    let env = run(vec![f, h, g]);

    // f's summary: the precondition contains q's stack cell and a cell
    // for the pointed-to value; allocatedness makes the value non-null.
    let f_summary = env.spec_table.get("f").expect("summary for f");
    assert!(f_summary.has_specs(), "f must get a spec");
    let pre = f_summary.specs()[0].pre.to_prop().clone();
    let q_value = pre
        .sigma
        .iter()
        .find_map(|hp| match hp {
            Hpred::Hpointsto(Exp::Lvar(pv), se, _) if pv.name == "q" => {
                se.as_exp().cloned()
            }
            _ => None,
        })
        .expect("precondition binds the formal q");
    assert!(
        pre.sigma
            .iter()
            .any(|hp| prover::check_equal(&pre, hp.root(), &q_value)),
        "precondition requires q's target allocated: {}",
        pre
    );
    assert!(
        prover::check_disequal(&pre, &q_value, &Exp::zero()),
        "the precondition implies q != 0"
    );

    // The null-passing caller trips the precondition.
    let issues = report(&env);
    assert!(
        issues
            .iter()
            .any(|i| i.procedure == "h"
                && (i.bug_type == "PRECONDITION_NOT_MET"
                    || i.bug_type == "NULL_DEREFERENCE")),
        "issues: {:?}",
        issues
    );
}

/// Calling through a null function pointer is a dereference of null.
#[test]
fn test_null_function_pointer_call() {
    let mut attrs = ProcAttributes::new("f", Language::C);
    attrs.loc = Loc::new("a.c", 1, 0);
    let f = straight_line(
        attrs,
        vec![
            Instr::Load {
                id: temp(0),
                lexp: Exp::Lvar(Pvar::local("fp", "f")),
                typ: Typ::ptr_to(Typ::Fun),
                loc: Loc::new("a.c", 2, 0),
            },
            Instr::Prune {
                cond: Exp::bin(
                    heapscan_engine::shared::models::BinOp::Eq,
                    Exp::var(temp(0)),
                    Exp::zero(),
                ),
                true_branch: true,
                loc: Loc::new("a.c", 3, 0),
            },
            Instr::Call {
                rets: vec![],
                fexp: Exp::var(temp(0)),
                args: vec![],
                loc: Loc::new("a.c", 4, 0),
                flags: Default::default(),
            },
        ],
    );

    let env = run(vec![f]);
    let issues = report(&env);
    assert!(
        issues
            .iter()
            .any(|i| i.bug_type == "NULL_DEREFERENCE" && i.line == 4),
        "issues: {:?}",
        issues
    );
}

/// Branching control flow produces one spec per surviving path group and
/// re-execution keeps them.
#[test]
fn test_branching_produces_specs() {
    let ptr_int = Typ::ptr_to(Typ::Int);
    let mut attrs = ProcAttributes::new("f", Language::C);
    attrs.formals = vec![("p".to_string(), ptr_int.clone())];
    attrs.loc = Loc::new("a.c", 1, 0);

    // if (p) *p = 1;
    let f = ProcCfg {
        attrs,
        nodes: vec![
            node(
                0,
                NodeKind::Start,
                vec![Instr::Load {
                    id: temp(0),
                    lexp: Exp::Lvar(Pvar::local("p", "f")),
                    typ: ptr_int.clone(),
                    loc: Loc::new("a.c", 2, 0),
                }],
                vec![1, 2],
                1,
            ),
            node(
                1,
                NodeKind::Prune(true),
                vec![
                    Instr::Prune {
                        cond: Exp::var(temp(0)),
                        true_branch: true,
                        loc: Loc::new("a.c", 2, 0),
                    },
                    Instr::Store {
                        lexp: Exp::var(temp(0)),
                        typ: Typ::Int,
                        rhs: Exp::one(),
                        loc: Loc::new("a.c", 2, 0),
                    },
                ],
                vec![3],
                2,
            ),
            node(
                2,
                NodeKind::Prune(false),
                vec![Instr::Prune {
                    cond: Exp::var(temp(0)),
                    true_branch: false,
                    loc: Loc::new("a.c", 2, 0),
                }],
                vec![3],
                2,
            ),
            node(3, NodeKind::Exit, vec![], vec![], 3),
        ],
        start: 0,
        exit: 3,
    };

    let env = run(vec![f]);
    let summary = env.spec_table.get("f").expect("summary");
    assert!(summary.has_specs());
    // Two pre groups: one where p's target is materialized (then branch),
    // one where p = 0 (else branch).
    assert!(
        summary.specs().len() >= 2,
        "expected one spec per branch, got {}",
        summary.specs().len()
    );
}
