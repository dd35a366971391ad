use crate::config::EngineConfig;
use crate::config::{DetectorKind, SolverKind};
use crate::detectors::{Finding, FindingKind, detectors_for, run_detectors};
use crate::emulator::WasmEmulator;
use crate::engine::{Automatic, ExplorationContext, ExplorationResult, explore};
use crate::error::AnalysisError;
use crate::ir::{ControlFlowGraph, ModuleSpec};
use crate::solver::new_solver;
use crate::symbolic::{HazardKind, StateStatus, SymbolicState, TrapKind};

struct Run {
    result: ExplorationResult,
    findings: Vec<Finding>,
    pruned: usize,
}

impl Run {
    fn states(&self) -> &[SymbolicState] {
        &self.result.functions[0].states
    }

    fn returns(&self) -> Vec<Option<u64>> {
        self.states()
            .iter()
            .map(|s| s.return_value.as_ref().and_then(|v| v.as_const()))
            .collect()
    }
}

fn module(wat: &str) -> ModuleSpec {
    ModuleSpec::parse("test.wat", &wat::parse_str(wat).unwrap()).unwrap()
}

fn try_run(wat: &str, entry: &str, config: EngineConfig) -> Result<Run, AnalysisError> {
    let module = module(wat);
    let cfg = ControlFlowGraph::from_module(&module)?;
    let emulator = WasmEmulator::new(&module, &config);
    let ctx = ExplorationContext {
        cfg: &cfg,
        emulator: &emulator,
        config: &config,
    };
    let mut policy = Automatic::new(new_solver(&config)?);
    let result = explore(&ctx, &mut policy, &[entry.to_owned()])?;
    let states = result
        .functions
        .iter()
        .flat_map(|f| f.states.iter().map(move |s| (f.function.as_str(), s)));
    let findings = run_detectors(&detectors_for(&config.detectors), states, policy.solver());
    Ok(Run {
        pruned: policy.pruned(),
        result,
        findings,
    })
}

fn run(wat: &str, entry: &str) -> Run {
    try_run(wat, entry, EngineConfig::default()).unwrap()
}

#[test]
fn concrete_counter_loop_runs_to_completion() {
    let run = run(
        r#"(module
            (func (export "count") (result i32) (local i32)
                i32.const 0
                local.set 0
                (loop $l
                    local.get 0
                    i32.const 1
                    i32.add
                    local.tee 0
                    i32.const 3
                    i32.lt_u
                    br_if $l)
                local.get 0))"#,
        "count",
    );
    assert_eq!(run.states().len(), 1);
    assert_eq!(run.states()[0].status, StateStatus::Returned);
    assert_eq!(run.returns(), [Some(3)]);
    assert!(run.findings.is_empty());
    let stats = run.result.functions[0].stats;
    assert_eq!(stats.cycle_headers, 1);
    assert!(stats.unrolled_loops >= 1);
}

#[test]
fn symbolic_loop_is_cut_at_the_bound() {
    let config = EngineConfig {
        loop_bound: 2,
        ..EngineConfig::default()
    };
    let run = try_run(
        r#"(module
            (func (export "spin") (param i32) (result i32)
                i32.const 0
                drop
                (loop $l
                    local.get 0
                    i32.const 1
                    i32.sub
                    local.tee 0
                    br_if $l)
                local.get 0))"#,
        "spin",
        config,
    )
    .unwrap();
    // the loop is only left once the bound is used up
    assert_eq!(run.states().len(), 1);
    assert!(run.states().iter().all(|s| s.status == StateStatus::Returned));
    // two rounds taken, then the exit
    assert_eq!(run.states()[0].constraints.len(), 3);
}

#[test]
fn contradicting_branch_is_pruned() {
    let run = run(
        r#"(module
            (func (export "check") (param i32) (result i32)
                local.get 0
                i32.const 10
                i32.eq
                (if (result i32)
                    (then
                        local.get 0
                        i32.const 10
                        i32.ne
                        (if (result i32)
                            (then unreachable)
                            (else i32.const 1)))
                    (else i32.const 0))))"#,
        "check",
    );
    assert_eq!(run.pruned, 1);
    assert_eq!(run.returns(), [Some(1), Some(0)]);
    assert!(run.findings.is_empty());
}

#[test]
fn reachable_unreachable_is_reported_with_inputs() {
    let run = run(
        r#"(module
            (func (export "guard") (param i32)
                local.get 0
                i32.const 42
                i32.eq
                (if (then unreachable))))"#,
        "guard",
    );
    assert_eq!(run.states().len(), 2);
    assert_eq!(run.states()[0].status, StateStatus::Trapped(TrapKind::Unreachable));
    assert_eq!(run.findings.len(), 1);
    let finding = &run.findings[0];
    assert_eq!(finding.kind, FindingKind::Trap(TrapKind::Unreachable));
    assert_eq!(finding.instruction, "unreachable");
    let model = finding.model.as_ref().unwrap();
    assert_eq!(model.get("param_0_guard"), Some(42));
}

#[test]
fn symbolic_divisor_is_a_hazard() {
    let run = run(
        r#"(module
            (func (export "div") (param i32) (result i32)
                i32.const 100
                local.get 0
                i32.div_u))"#,
        "div",
    );
    assert_eq!(run.states().len(), 1);
    assert_eq!(run.states()[0].status, StateStatus::Returned);
    assert_eq!(run.findings.len(), 1);
    assert_eq!(run.findings[0].kind, FindingKind::Hazard(HazardKind::DivisionByZero));
    let model = run.findings[0].model.as_ref().unwrap();
    assert_eq!(model.get("param_0_div"), Some(0));
}

#[test]
fn guarded_division_is_quiet() {
    let run = run(
        r#"(module
            (func (export "safe") (param i32) (result i32)
                local.get 0
                i32.const 4
                i32.eq
                (if (result i32)
                    (then i32.const 100 local.get 0 i32.div_u)
                    (else i32.const 0))))"#,
        "safe",
    );
    assert_eq!(run.states().len(), 2);
    assert!(run.findings.is_empty());
}

#[test]
fn br_table_forks_per_case() {
    let run = run(
        r#"(module
            (func (export "dispatch") (param i32) (result i32)
                (block
                    (block
                        (block
                            local.get 0
                            br_table 0 1 2)
                        i32.const 10
                        return)
                    i32.const 20
                    return)
                i32.const 30))"#,
        "dispatch",
    );
    assert_eq!(run.returns(), [Some(10), Some(20), Some(30)]);
    let rendered: Vec<Vec<String>> = run
        .states()
        .iter()
        .map(|s| s.constraints.iter().map(|c| c.to_string()).collect())
        .collect();
    assert_eq!(rendered[0], ["(param_0_dispatch == 0)"]);
    assert_eq!(rendered[1], ["(param_0_dispatch != 0)", "(param_0_dispatch == 1)"]);
    assert_eq!(rendered[2], ["(param_0_dispatch != 0)", "(param_0_dispatch != 1)"]);
}

#[test]
fn data_segments_and_globals_seed_the_entry_state() {
    let wat = r#"(module
        (memory 1)
        (data (i32.const 16) "\2a")
        (global $g (mut i32) (i32.const 7))
        (func (export "peek") (result i32)
            i32.const 16
            i32.load8_u
            global.get $g
            i32.add))"#;
    let concrete = EngineConfig {
        concrete_globals: true,
        ..EngineConfig::default()
    };
    assert_eq!(try_run(wat, "peek", concrete).unwrap().returns(), [Some(49)]);

    let run = run(wat, "peek");
    let ret = run.states()[0].return_value.as_ref().unwrap();
    assert_eq!(ret.to_string(), "(42 + global_0)");
}

#[test]
fn failing_path_does_not_stop_the_others() {
    let run = run(
        r#"(module
            (func (export "mixed") (param i32) (result i32)
                local.get 0
                (if (then f32.const 1 drop))
                i32.const 5))"#,
        "mixed",
    );
    assert_eq!(run.returns(), [Some(5)]);
}

#[test]
fn float_signatures_are_fatal() {
    let err = try_run(
        r#"(module (func (export "f") (param f32)))"#,
        "f",
        EngineConfig::default(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, AnalysisError::UnsupportedSignature { .. }));
}

#[test]
fn exit_status_reaches_the_report() {
    let run = run(
        r#"(module
            (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
            (func (export "main")
                i32.const 3
                call $exit
                unreachable))"#,
        "main",
    );
    assert_eq!(run.states().len(), 1);
    assert_eq!(run.states()[0].status, StateStatus::Exited(Some(3)));
    assert!(run.findings.is_empty());
}

const RANGE_CHECK: &str = r#"(module
    (func (export "range") (param i32) (result i32)
        local.get 0
        i32.const 5
        i32.lt_u
        (if (result i32)
            (then
                local.get 0
                i32.const 10
                i32.gt_u
                (if (result i32)
                    (then unreachable)
                    (else i32.const 1)))
            (else i32.const 0))))"#;

#[test]
fn range_contradiction_is_pruned() {
    let run = run(RANGE_CHECK, "range");
    assert_eq!(run.pruned, 1);
    assert_eq!(run.returns(), [Some(1), Some(0)]);
    assert!(run.findings.is_empty());
}

#[test]
fn builtin_solver_refutes_range_contradictions() {
    let config = EngineConfig {
        solver: SolverKind::Builtin,
        ..EngineConfig::default()
    };
    let run = try_run(RANGE_CHECK, "range", config).unwrap();
    assert_eq!(run.pruned, 1);
    assert!(
        run.states()
            .iter()
            .all(|s| s.status == StateStatus::Returned)
    );
    assert!(run.findings.is_empty());
}

#[test]
fn wrapping_add_is_reported_when_requested() {
    let wat = r#"(module
        (func (export "bump") (param i32) (result i32)
            local.get 0
            i32.const -1
            i32.eq
            (if (result i32)
                (then local.get 0 i32.const 1 i32.add)
                (else i32.const 0))))"#;
    assert!(run(wat, "bump").findings.is_empty());

    let config = EngineConfig {
        detectors: vec![DetectorKind::Trap, DetectorKind::Overflow],
        ..EngineConfig::default()
    };
    let run = try_run(wat, "bump", config).unwrap();
    assert_eq!(run.findings.len(), 1);
    let finding = &run.findings[0];
    assert_eq!(finding.kind, FindingKind::Hazard(HazardKind::IntegerOverflow));
    assert_eq!(finding.instruction, "i32.add");
    let model = finding.model.as_ref().unwrap();
    assert_eq!(model.get("param_0_bump"), Some(u32::MAX as u64));
}
