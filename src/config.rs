use clap::{Parser, ValueEnum};
use humantime::Duration;

/// Default number of times a detected loop body is unrolled along one path.
pub(crate) const DEFAULT_LOOP_BOUND: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum SolverKind {
    /// Constant folding with equality and unsigned range facts, always available.
    Builtin,
    /// Z3 (requires the `solver_z3` feature).
    Z3,
}

impl SolverKind {
    pub(crate) const fn preferred() -> Self {
        if cfg!(feature = "solver_z3") {
            SolverKind::Z3
        } else {
            SolverKind::Builtin
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum DetectorKind {
    /// Reachable traps (`unreachable`, out-of-bounds accesses, ...).
    Trap,
    /// Divisions whose symbolic divisor can be zero.
    DivZero,
    /// `add`/`sub`/`mul` that can wrap around.
    Overflow,
}

pub(crate) const DEFAULT_DETECTORS: [DetectorKind; 2] = [DetectorKind::Trap, DetectorKind::DivZero];

// Engine knobs. Fixed before traversal starts and never mutated during it.
#[derive(Debug, Clone, Parser)]
pub(crate) struct EngineConfig {
    // Unroll detected loops at most this many times before forcing the exit edge
    #[clap(long, env = "WASMSE_LOOP_BOUND", default_value = "5")]
    pub loop_bound: usize,
    // Let the operator pick states and branches interactively
    #[clap(long)]
    pub guided: bool,
    // Seed mutable globals with their initializers instead of symbols
    #[clap(long)]
    pub concrete_globals: bool,
    #[clap(long, value_enum, env = "WASMSE_SOLVER", default_value_t = SolverKind::preferred())]
    pub solver: SolverKind,
    // Per-query timeout for solvers that support one
    #[clap(long)]
    pub solver_timeout: Option<Duration>,
    // Detectors to run over the terminal states (comma separated)
    #[clap(long = "detector", value_enum, value_delimiter = ',', default_values_t = DEFAULT_DETECTORS)]
    pub detectors: Vec<DetectorKind>,
}

impl EngineConfig {
    pub(crate) fn detects(&self, kind: DetectorKind) -> bool {
        self.detectors.contains(&kind)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            loop_bound: DEFAULT_LOOP_BOUND,
            guided: false,
            concrete_globals: false,
            solver: SolverKind::preferred(),
            solver_timeout: None,
            detectors: DEFAULT_DETECTORS.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_match_default_impl() {
        let parsed = EngineConfig::parse_from(["wasmse"]);
        let default = EngineConfig::default();
        assert_eq!(parsed.loop_bound, default.loop_bound);
        assert_eq!(parsed.guided, default.guided);
        assert_eq!(parsed.concrete_globals, default.concrete_globals);
        assert_eq!(parsed.solver, default.solver);
        assert_eq!(parsed.detectors, default.detectors);
    }

    #[test]
    fn loop_bound_flag() {
        let parsed = EngineConfig::parse_from(["wasmse", "--loop-bound", "3", "--guided"]);
        assert_eq!(parsed.loop_bound, 3);
        assert!(parsed.guided);
    }

    #[test]
    fn detector_selection() {
        let parsed = EngineConfig::parse_from(["wasmse", "--detector", "overflow,trap"]);
        assert!(parsed.detects(DetectorKind::Overflow));
        assert!(parsed.detects(DetectorKind::Trap));
        assert!(!parsed.detects(DetectorKind::DivZero));
        assert!(!EngineConfig::default().detects(DetectorKind::Overflow));
    }

    #[test]
    fn solver_flag_overrides_the_preferred_backend() {
        let parsed = EngineConfig::parse_from(["wasmse", "--solver", "builtin"]);
        assert_eq!(parsed.solver, SolverKind::Builtin);
        if cfg!(feature = "solver_z3") {
            assert_eq!(EngineConfig::default().solver, SolverKind::Z3);
        }
    }
}
