//! Exploration engine: walks a function's block graph from its entry block, drives
//! the emulator over every block, forks at branches and bounds detected loops.
//!
//! One [`Traversal`] runs per entry function, with its own visit counters and cycle
//! headers. Which successors are followed is up to the [`ExplorationPolicy`]:
//! [`Automatic`] follows everything the solver doesn't refute, [`Guided`] asks an
//! operator.

mod guided;
mod policy;

#[cfg(test)]
pub(crate) use guided::ScriptedPrompt;
pub(crate) use guided::{Guided, StdinPrompt};
use policy::StateOptions;
pub(crate) use policy::{Automatic, ExplorationPolicy};

use std::time::{Duration, Instant};

use crate::HashMap;
use crate::config::EngineConfig;
use crate::emulator::{Emulation, Emulator, Successors};
use crate::error::AnalysisError;
use crate::ir::cycles::LoopEdges;
use crate::ir::{ControlFlowGraph, CycleHeaders, EdgeType, Edges, detect_cycles};
use crate::symbolic::SymbolicState;

/// Everything a run needs, built once and shared by reference.
pub(crate) struct ExplorationContext<'a> {
    pub cfg: &'a ControlFlowGraph,
    pub emulator: &'a dyn Emulator,
    pub config: &'a EngineConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TraversalStats {
    pub emulated_blocks: usize,
    pub reentries: usize,
    pub unrolled_loops: usize,
    pub cycle_headers: usize,
}

#[derive(Debug)]
pub(crate) struct FunctionResult {
    pub function: String,
    pub states: Vec<SymbolicState>,
    pub stats: TraversalStats,
    pub elapsed: Duration,
}

/// Terminal states per entry function, in request order.
#[derive(Debug, Default)]
pub(crate) struct ExplorationResult {
    pub functions: Vec<FunctionResult>,
}

impl ExplorationResult {
    pub(crate) fn num_states(&self) -> usize {
        self.functions.iter().map(|res| res.states.len()).sum()
    }
}

struct Traversal<'a, 'p> {
    cfg: &'a ControlFlowGraph,
    emulator: &'a dyn Emulator,
    policy: &'p mut dyn ExplorationPolicy,
    loop_bound: usize,
    has_ret: bool,
    // entries on the current path, per block
    visits: HashMap<&'a str, u32>,
    cycles: CycleHeaders,
    stats: TraversalStats,
}

impl<'a> Traversal<'a, '_> {
    fn options(successors: Successors, edges: &Edges, forced: Option<EdgeType>) -> Vec<StateOptions> {
        let allowed = |ty: &EdgeType| forced.is_none_or(|f| f == *ty);
        match successors {
            Successors::Flat(states) => states
                .into_iter()
                .map(|state| StateOptions {
                    successors: edges
                        .types()
                        .filter(allowed)
                        .map(|ty| (ty, state.clone()))
                        .collect(),
                    forked: false,
                })
                .collect(),
            Successors::Branching(forks) => forks
                .into_iter()
                .map(|mut fork| StateOptions {
                    successors: edges
                        .types()
                        .filter(allowed)
                        .filter_map(|ty| fork.remove(&ty).map(|state| (ty, state)))
                        .collect(),
                    forked: true,
                })
                .collect(),
        }
    }

    fn visit(
        &mut self,
        states: Vec<SymbolicState>,
        block: &'a str,
        forced: Option<EdgeType>,
    ) -> Vec<SymbolicState> {
        let guided = self.policy.is_guided();
        if !guided && self.visits.get(block).is_some_and(|n| *n > 0) {
            tracing::trace!(block, states = states.len(), "block already on the current path");
            self.stats.reentries += 1;
            return states;
        }

        let cfg = self.cfg;
        self.stats.emulated_blocks += 1;
        let Emulation {
            halted,
            successors,
            mut finished,
        } = self
            .emulator
            .emulate(states.clone(), self.has_ret, cfg.instructions_of(block));
        if halted {
            tracing::trace!(block, finished = finished.len(), "halted");
            return finished;
        }
        let edges = cfg.edges_of(block);
        if edges.is_empty() {
            let returned = match successors {
                Successors::Flat(states) => states,
                Successors::Branching(forks) => forks.into_iter().flat_map(|f| f.into_values()).collect(),
            };
            for mut state in returned {
                state.finish_return(self.has_ret);
                finished.push(state);
            }
            return finished;
        }

        *self.visits.entry(block).or_default() += 1;
        let options = Self::options(successors, edges, forced);
        let selected = self.policy.select(cfg, block, options);
        let mut outputs = Vec::new();
        for (edge, state) in selected {
            let Some(dest) = edges.get(edge) else {
                continue;
            };
            match self.cycles.loop_edges(dest).filter(|_| !guided) {
                Some(loop_edges) => outputs.extend(self.unroll(state, dest, loop_edges)),
                None => outputs.extend(self.visit(vec![state], dest, None)),
            }
        }
        if let Some(n) = self.visits.get_mut(block) {
            *n -= 1;
        }

        if outputs.is_empty() && finished.is_empty() {
            // every successor was dropped, keep what came in
            return states;
        }
        finished.extend(outputs);
        finished
    }

    // Continue around the loop `loop_bound` times, then force the exit edge.
    fn unroll(
        &mut self,
        state: SymbolicState,
        header: &'a str,
        loop_edges: LoopEdges,
    ) -> Vec<SymbolicState> {
        self.stats.unrolled_loops += 1;
        let mut done = Vec::new();
        let mut live = vec![state];
        for round in 0..self.loop_bound {
            if live.is_empty() {
                break;
            }
            let out = self.visit(live, header, Some(loop_edges.continuation));
            let (running, finished): (Vec<_>, Vec<_>) =
                out.into_iter().partition(|state| state.status.is_running());
            done.extend(finished);
            live = running;
            tracing::trace!(header, round, live = live.len(), "loop round");
        }
        if !live.is_empty() {
            done.extend(self.visit(live, header, Some(loop_edges.exit)));
        }
        done
    }
}

/// Traverse every function in `entries`, in order.
pub(crate) fn explore(
    ctx: &ExplorationContext<'_>,
    policy: &mut dyn ExplorationPolicy,
    entries: &[String],
) -> Result<ExplorationResult, AnalysisError> {
    let mut result = ExplorationResult::default();
    for function in entries {
        let entry = ctx.cfg.entry_block(function)?;
        let (state, has_ret) = ctx.emulator.init_state(function)?;
        let cycles = detect_cycles(ctx.cfg, entry);
        tracing::info!(function = %function, entry, cycle_headers = cycles.len(), "exploring");

        let start = Instant::now();
        let mut traversal = Traversal {
            cfg: ctx.cfg,
            emulator: ctx.emulator,
            policy: &mut *policy,
            loop_bound: ctx.config.loop_bound,
            has_ret,
            visits: HashMap::default(),
            stats: TraversalStats {
                cycle_headers: cycles.len(),
                ..TraversalStats::default()
            },
            cycles,
        };
        let states = traversal.visit(vec![state], entry, None);
        let stats = traversal.stats;
        tracing::info!(
            function = %function,
            states = states.len(),
            blocks = stats.emulated_blocks,
            "exploration finished"
        );
        result.functions.push(FunctionResult {
            function: function.clone(),
            states,
            stats,
            elapsed: start.elapsed(),
        });
    }
    Ok(result)
}
