use crate::ir::{ControlFlowGraph, EdgeType};
use crate::solver::SatSolver;
use crate::symbolic::SymbolicState;

/// Successors of one live state at the end of a block, in structural edge order.
#[derive(Debug)]
pub(crate) struct StateOptions {
    pub successors: Vec<(EdgeType, SymbolicState)>,
    // successors were forked by a conditional instruction and carry a new constraint
    pub forked: bool,
}

impl StateOptions {
    /// Constraints every successor shares, i.e. those in force before the branch.
    pub(crate) fn shared_constraints(&self) -> usize {
        self.successors
            .iter()
            .map(|(_, state)| state.constraints.len())
            .min()
            .unwrap_or(0)
    }
}

/// Decides which successors the traversal follows out of a block.
pub(crate) trait ExplorationPolicy {
    /// Guided exploration follows the operator: no re-entrance guard, no loop unrolling.
    fn is_guided(&self) -> bool;

    fn select(
        &mut self,
        cfg: &ControlFlowGraph,
        block: &str,
        options: Vec<StateOptions>,
    ) -> Vec<(EdgeType, SymbolicState)>;
}

/// Follows every state down every branch the solver doesn't refute.
pub(crate) struct Automatic {
    solver: Box<dyn SatSolver>,
    queries: usize,
    pruned: usize,
}

impl Automatic {
    pub(crate) fn new(solver: Box<dyn SatSolver>) -> Self {
        Self {
            solver,
            queries: 0,
            pruned: 0,
        }
    }

    pub(crate) fn solver_name(&self) -> &'static str {
        self.solver.name()
    }

    pub(crate) fn queries(&self) -> usize {
        self.queries
    }

    pub(crate) fn pruned(&self) -> usize {
        self.pruned
    }

    #[cfg(test)]
    pub(crate) fn solver(&mut self) -> &mut dyn SatSolver {
        self.solver.as_mut()
    }
}

impl ExplorationPolicy for Automatic {
    fn is_guided(&self) -> bool {
        false
    }

    fn select(
        &mut self,
        _cfg: &ControlFlowGraph,
        block: &str,
        options: Vec<StateOptions>,
    ) -> Vec<(EdgeType, SymbolicState)> {
        let mut selected = Vec::new();
        for option in options {
            for (edge, state) in option.successors {
                if option.forked && edge.is_conditional() {
                    self.queries += 1;
                    let res = self.solver.check(&state.constraints);
                    if !res.is_feasible() {
                        self.pruned += 1;
                        tracing::debug!(block, %edge, constraints = state.constraints.len(), "infeasible branch pruned");
                        continue;
                    }
                }
                selected.push((edge, state));
            }
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::FoldingSolver;
    use crate::symbolic::{BinaryOp, SymVal};

    #[test]
    fn only_forked_conditionals_are_checked() {
        let x = SymVal::symbol("x", 32);
        let mut state = SymbolicState::blank("f");
        state.add_constraint(SymVal::binary(BinaryOp::Eq, x.clone(), SymVal::constant(1, 32)));
        let mut refuted = state.clone();
        refuted.add_constraint(SymVal::binary(BinaryOp::Eq, x, SymVal::constant(2, 32)));

        let mut policy = Automatic::new(Box::new(FoldingSolver::new()));
        let cfg = ControlFlowGraph::default();
        let options = vec![
            StateOptions {
                successors: vec![(EdgeType::ConditionalTrue, refuted.clone())],
                forked: true,
            },
            // same constraints, but nothing was forked here
            StateOptions {
                successors: vec![(EdgeType::ConditionalTrue, refuted)],
                forked: false,
            },
            StateOptions {
                successors: vec![(EdgeType::Unconditional, state)],
                forked: true,
            },
        ];
        let selected = policy.select(&cfg, "b0", options);
        assert_eq!(selected.len(), 2);
        assert_eq!(policy.queries(), 1);
        assert_eq!(policy.pruned(), 1);
    }
}
