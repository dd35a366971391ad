//! Detectors inspect the terminal states of an exploration and report findings.

use std::fmt;

use crate::config::DetectorKind;
use crate::solver::{Model, SatSolver};
use crate::symbolic::{HazardKind, StateStatus, SymbolicState, TrapKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "kind")]
pub(crate) enum FindingKind {
    Trap(TrapKind),
    // the path may trap for some inputs
    Hazard(HazardKind),
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FindingKind::Trap(kind) => write!(f, "trap: {kind}"),
            FindingKind::Hazard(HazardKind::DivisionByZero) => {
                f.write_str("possible integer division by zero")
            }
            FindingKind::Hazard(HazardKind::IntegerOverflow) => {
                f.write_str("possible integer overflow")
            }
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub(crate) struct Finding {
    pub function: String,
    pub kind: FindingKind,
    pub instruction: String,
    pub offset: usize,
    // inputs reaching the finding, if the solver produced one
    pub model: Option<Model>,
}

pub(crate) trait Detector {
    fn name(&self) -> &'static str;

    fn inspect(
        &self,
        function: &str,
        state: &SymbolicState,
        solver: &mut dyn SatSolver,
    ) -> Vec<Finding>;
}

/// Trapped terminal states whose path isn't refuted.
pub(crate) struct TrapDetector;

impl Detector for TrapDetector {
    fn name(&self) -> &'static str {
        "trap"
    }

    fn inspect(
        &self,
        function: &str,
        state: &SymbolicState,
        solver: &mut dyn SatSolver,
    ) -> Vec<Finding> {
        let StateStatus::Trapped(kind) = state.status else {
            return Vec::new();
        };
        if !solver.check(&state.constraints).is_feasible() {
            tracing::debug!(function, %kind, "trap on an infeasible path");
            return Vec::new();
        }
        let (offset, instruction) = state.last_instruction.clone().unwrap_or_default();
        vec![Finding {
            function: function.to_owned(),
            kind: FindingKind::Trap(kind),
            instruction,
            offset,
            model: solver.model(&state.constraints),
        }]
    }
}

// Hazards of `kind` satisfiable under the constraints in force where they were recorded.
fn reachable_hazards(
    kind: HazardKind,
    function: &str,
    state: &SymbolicState,
    solver: &mut dyn SatSolver,
) -> Vec<Finding> {
    let mut findings = Vec::new();
    for hazard in state.hazards.iter().filter(|h| h.kind == kind) {
        let len = hazard.constraints_len.min(state.constraints.len());
        let mut query = state.constraints[..len].to_vec();
        query.push(hazard.condition.clone());
        if !solver.check(&query).is_feasible() {
            continue;
        }
        findings.push(Finding {
            function: function.to_owned(),
            kind: FindingKind::Hazard(hazard.kind),
            instruction: hazard.instruction.clone(),
            offset: hazard.offset,
            model: solver.model(&query),
        });
    }
    findings
}

/// Divisions by a symbolic divisor that can be zero on their path.
pub(crate) struct DivisionByZeroDetector;

impl Detector for DivisionByZeroDetector {
    fn name(&self) -> &'static str {
        "div-by-zero"
    }

    fn inspect(
        &self,
        function: &str,
        state: &SymbolicState,
        solver: &mut dyn SatSolver,
    ) -> Vec<Finding> {
        reachable_hazards(HazardKind::DivisionByZero, function, state, solver)
    }
}

/// `add`, `sub` and `mul` that can wrap around on their path.
pub(crate) struct OverflowDetector;

impl Detector for OverflowDetector {
    fn name(&self) -> &'static str {
        "overflow"
    }

    fn inspect(
        &self,
        function: &str,
        state: &SymbolicState,
        solver: &mut dyn SatSolver,
    ) -> Vec<Finding> {
        reachable_hazards(HazardKind::IntegerOverflow, function, state, solver)
    }
}

pub(crate) fn detectors_for(kinds: &[DetectorKind]) -> Vec<Box<dyn Detector>> {
    let mut detectors: Vec<Box<dyn Detector>> = Vec::new();
    for kind in [DetectorKind::Trap, DetectorKind::DivZero, DetectorKind::Overflow] {
        if !kinds.contains(&kind) {
            continue;
        }
        detectors.push(match kind {
            DetectorKind::Trap => Box::new(TrapDetector),
            DetectorKind::DivZero => Box::new(DivisionByZeroDetector),
            DetectorKind::Overflow => Box::new(OverflowDetector),
        });
    }
    detectors
}

/// Run every detector over every terminal state, in state order.
pub(crate) fn run_detectors<'s>(
    detectors: &[Box<dyn Detector>],
    states: impl IntoIterator<Item = (&'s str, &'s SymbolicState)>,
    solver: &mut dyn SatSolver,
) -> Vec<Finding> {
    let mut findings = Vec::new();
    for (function, state) in states {
        for detector in detectors {
            let found = detector.inspect(function, state, solver);
            if !found.is_empty() {
                tracing::info!(detector = detector.name(), function, count = found.len(), "findings");
            }
            findings.extend(found);
        }
    }
    // a hazard recorded before a fork shows up once per descendant path
    findings.dedup_by(|a, b| a.function == b.function && a.kind == b.kind && a.offset == b.offset);
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::FoldingSolver;
    use crate::symbolic::{BinaryOp, Hazard, SymVal};

    fn x() -> crate::symbolic::SymExpr {
        SymVal::symbol("x", 32)
    }

    fn eq(k: u64) -> crate::symbolic::SymExpr {
        SymVal::binary(BinaryOp::Eq, x(), SymVal::constant(k, 32))
    }

    #[test]
    fn trap_on_feasible_path_is_reported() {
        let mut state = SymbolicState::blank("f");
        state.add_constraint(eq(7));
        state.last_instruction = Some((0x2a, "unreachable".into()));
        state.trap(TrapKind::Unreachable);
        let mut solver = FoldingSolver::new();
        let findings = TrapDetector.inspect("f", &state, &mut solver);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::Trap(TrapKind::Unreachable));
        assert_eq!(findings[0].offset, 0x2a);
        assert_eq!(findings[0].model.as_ref().and_then(|m| m.get("x")), Some(7));
    }

    #[test]
    fn returned_and_refuted_states_are_quiet() {
        let mut solver = FoldingSolver::new();
        let mut returned = SymbolicState::blank("f");
        returned.finish_return(false);
        assert!(TrapDetector.inspect("f", &returned, &mut solver).is_empty());

        let mut refuted = SymbolicState::blank("f");
        refuted.add_constraint(eq(1));
        refuted.add_constraint(eq(2));
        refuted.trap(TrapKind::MemoryOutOfBounds);
        assert!(TrapDetector.inspect("f", &refuted, &mut solver).is_empty());
    }

    #[test]
    fn division_hazard_uses_constraints_at_the_division() {
        let mut state = SymbolicState::blank("f");
        state.add_constraint(eq(0));
        let hazard = |constraints_len| Hazard {
            kind: HazardKind::DivisionByZero,
            condition: SymVal::binary(BinaryOp::Eq, x(), SymVal::constant(0, 32)),
            constraints_len,
            instruction: "i32.div_u".into(),
            offset: 4,
        };
        // recorded after `x == 0` was known: reachable
        state.hazards.push(hazard(1));
        let mut solver = FoldingSolver::new();
        let findings = DivisionByZeroDetector.inspect("f", &state, &mut solver);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].model.as_ref().and_then(|m| m.get("x")), Some(0));

        // a later `x == 3` constraint doesn't refute a division that came before it
        let mut later = SymbolicState::blank("f");
        later.hazards.push(hazard(0));
        later.add_constraint(eq(3));
        assert_eq!(DivisionByZeroDetector.inspect("f", &later, &mut solver).len(), 1);

        let mut guarded = SymbolicState::blank("f");
        guarded.add_constraint(eq(3));
        guarded.hazards.push(hazard(1));
        assert!(DivisionByZeroDetector.inspect("f", &guarded, &mut solver).is_empty());
    }

    #[test]
    fn duplicate_hazards_from_forks_are_merged() {
        let mut state = SymbolicState::blank("f");
        state.hazards.push(Hazard {
            kind: HazardKind::DivisionByZero,
            condition: SymVal::binary(BinaryOp::Eq, x(), SymVal::constant(0, 32)),
            constraints_len: 0,
            instruction: "i32.rem_s".into(),
            offset: 9,
        });
        let forked = state.clone();
        let mut solver = FoldingSolver::new();
        let findings = run_detectors(
            &detectors_for(&crate::config::DEFAULT_DETECTORS),
            [("f", &state), ("f", &forked)],
            &mut solver,
        );
        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn detectors_follow_the_selection() {
        let names = |kinds: &[DetectorKind]| -> Vec<&'static str> {
            detectors_for(kinds).iter().map(|d| d.name()).collect()
        };
        assert_eq!(names(&crate::config::DEFAULT_DETECTORS), ["trap", "div-by-zero"]);
        assert_eq!(
            names(&[DetectorKind::Overflow, DetectorKind::Trap]),
            ["trap", "overflow"]
        );
        assert!(names(&[]).is_empty());
    }

    #[test]
    fn overflow_hazards_are_checked_like_divisions() {
        let mut state = SymbolicState::blank("f");
        let sum = SymVal::binary(BinaryOp::Add, x(), SymVal::constant(1, 32));
        state.add_constraint(eq(u32::MAX as u64));
        state.hazards.push(Hazard {
            kind: HazardKind::IntegerOverflow,
            condition: SymVal::binary(BinaryOp::LtU, sum, x()),
            constraints_len: 1,
            instruction: "i32.add".into(),
            offset: 3,
        });
        let mut solver = FoldingSolver::new();
        assert!(DivisionByZeroDetector.inspect("f", &state, &mut solver).is_empty());
        let findings = OverflowDetector.inspect("f", &state, &mut solver);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind.to_string(), "possible integer overflow");
        assert_eq!(
            findings[0].model.as_ref().and_then(|m| m.get("x")),
            Some(u32::MAX as u64)
        );
    }
}
