use std::collections::BTreeMap;

use crate::config::{EngineConfig, SolverKind};
use crate::error::AnalysisError;
use crate::symbolic::SymExpr;

mod folding;
pub(crate) use folding::FoldingSolver;

#[cfg(feature = "solver_z3")]
mod z3_backend;
#[cfg(feature = "solver_z3")]
pub(crate) use z3_backend::Z3Solver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SatResult {
    Sat,
    Unsat,
    Unknown,
}

impl SatResult {
    /// Solver uncertainty never prunes a branch.
    pub(crate) fn is_feasible(self) -> bool {
        !matches!(self, SatResult::Unsat)
    }
}

/// Symbol assignment satisfying a constraint list.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(transparent)]
pub(crate) struct Model(BTreeMap<String, u64>);

impl Model {
    pub(crate) fn insert(&mut self, symbol: String, value: u64) {
        self.0.insert(symbol, value);
    }

    #[cfg(test)]
    pub(crate) fn get(&self, symbol: &str) -> Option<u64> {
        self.0.get(symbol).copied()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Each constraint is asserted to be non-zero.
pub(crate) trait SatSolver {
    fn name(&self) -> &'static str;
    fn check(&mut self, constraints: &[SymExpr]) -> SatResult;
    fn model(&mut self, constraints: &[SymExpr]) -> Option<Model>;
}

pub(crate) fn new_solver(config: &EngineConfig) -> Result<Box<dyn SatSolver>, AnalysisError> {
    match config.solver {
        SolverKind::Builtin => Ok(Box::new(FoldingSolver::new())),
        #[cfg(feature = "solver_z3")]
        SolverKind::Z3 => Ok(Box::new(Z3Solver::new(
            config.solver_timeout.map(|t| *t),
        ))),
        #[cfg(not(feature = "solver_z3"))]
        SolverKind::Z3 => Err(AnalysisError::SolverUnavailable("z3".into())),
    }
}
