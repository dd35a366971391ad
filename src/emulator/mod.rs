//! Symbolic interpretation of integer WebAssembly, one basic block at a time.
//!
//! The engine hands every live state of a block to [`Emulator::emulate`] and only looks
//! at the shape of the result: a flat list of successors, or per-state successors
//! keyed by the conditional edge they belong to.

mod control;
mod memory;
mod numeric;

use std::collections::BTreeMap;
use std::rc::Rc;

use wasmparser::ValType;

use crate::config::{DetectorKind, EngineConfig};
use crate::error::{AnalysisError, PathError};
use crate::ir::{
    EdgeType, Instruction, ModuleSpec, ParametricInstruction, Value, VariableInstruction,
    WFOperator,
};
use crate::symbolic::{Memory, SymVal, SymbolicState};

/// Successors of one input state at a branching block.
pub(crate) type BranchStates = BTreeMap<EdgeType, SymbolicState>;

#[derive(Debug)]
pub(crate) enum Successors {
    Flat(Vec<SymbolicState>),
    Branching(Vec<BranchStates>),
}

impl Successors {
    pub(crate) fn is_empty(&self) -> bool {
        match self {
            Successors::Flat(states) => states.is_empty(),
            Successors::Branching(forks) => forks.is_empty(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Emulation {
    /// No state is still running after the block.
    pub halted: bool,
    pub successors: Successors,
    // returned, trapped or exited inside the block
    pub finished: Vec<SymbolicState>,
}

impl Emulation {
    pub(crate) fn new(successors: Successors, finished: Vec<SymbolicState>) -> Self {
        Self {
            halted: successors.is_empty(),
            successors,
            finished,
        }
    }
}

pub(crate) trait Emulator {
    /// Entry state of `function` and whether the function has a return slot.
    fn init_state(&self, function: &str) -> Result<(SymbolicState, bool), AnalysisError>;

    fn emulate(
        &self,
        states: Vec<SymbolicState>,
        has_ret: bool,
        instructions: &[Instruction],
    ) -> Emulation;
}

// Effect of one instruction on one state.
pub(super) enum Step {
    Next,
    Fork(BranchStates),
    Finished,
}

pub(crate) fn value_width(ty: &ValType) -> Option<u32> {
    match ty {
        ValType::I32 => Some(32),
        ValType::I64 => Some(64),
        _ => None,
    }
}

pub(crate) struct WasmEmulator<'m> {
    module: &'m ModuleSpec,
    // active data segments, shared by every state
    image: Rc<BTreeMap<u32, u8>>,
    concrete_globals: bool,
    // record wrap-around hazards for the overflow detector
    track_overflow: bool,
}

impl<'m> WasmEmulator<'m> {
    pub(crate) fn new(module: &'m ModuleSpec, config: &EngineConfig) -> Self {
        let mut image = BTreeMap::new();
        for (data, offset) in &module.memory_initializers {
            for (i, byte) in data.iter().enumerate() {
                image.insert((offset + i) as u32, *byte);
            }
        }
        Self {
            module,
            image: Rc::new(image),
            concrete_globals: config.concrete_globals,
            track_overflow: config.detects(DetectorKind::Overflow),
        }
    }

    fn step(
        &self,
        state: &mut SymbolicState,
        has_ret: bool,
        insn: &Instruction,
    ) -> Result<Step, PathError> {
        match &insn.op {
            WFOperator::Numeric(op) => {
                numeric::emulate_numeric(op, state, insn, self.track_overflow)
            }
            WFOperator::Variable(op) => {
                self.emulate_variable(op, state, &insn.text)?;
                Ok(Step::Next)
            }
            WFOperator::Parametric(op) => {
                emulate_parametric(op, state, &insn.text)?;
                Ok(Step::Next)
            }
            WFOperator::Memory(op) => memory::emulate_memory(op, state, insn),
            WFOperator::Control(op) => {
                control::emulate_control(self.module, op, state, has_ret, &insn.text)
            }
            WFOperator::Unsupported(name) => Err(PathError::UnsupportedInstruction(name.clone())),
        }
    }

    fn emulate_variable(
        &self,
        op: &VariableInstruction,
        state: &mut SymbolicState,
        at: &str,
    ) -> Result<(), PathError> {
        match *op {
            VariableInstruction::LocalGet(idx) => {
                let val = state.local(idx)?;
                state.push(val);
            }
            VariableInstruction::LocalSet(idx) => {
                let val = state.pop(at)?;
                state.set_local(idx, val)?;
            }
            VariableInstruction::LocalTee(idx) => {
                let val = state.peek(at)?.clone();
                state.set_local(idx, val)?;
            }
            VariableInstruction::GlobalGet(idx) => {
                self.check_global_type(idx)?;
                let val = state.global(idx)?;
                state.push(val);
            }
            VariableInstruction::GlobalSet(idx) => {
                self.check_global_type(idx)?;
                let val = state.pop(at)?;
                state.set_global(idx, val)?;
            }
        }
        Ok(())
    }

    fn check_global_type(&self, idx: u32) -> Result<(), PathError> {
        match self.module.globals.get(idx as usize) {
            Some(global) if value_width(&global.ty).is_none() => {
                Err(PathError::UnsupportedType(format!("{:?}", global.ty)))
            }
            _ => Ok(()),
        }
    }

    fn initial_global(&self, idx: usize) -> Option<crate::symbolic::SymExpr> {
        let global = &self.module.globals[idx];
        let width = value_width(&global.ty)?;
        match global.init {
            Some(init) if self.concrete_globals || !global.mutable => {
                Some(SymVal::constant(init.as_bits(), width))
            }
            // mutable globals are inputs unless asked otherwise
            _ => Some(SymVal::symbol(format!("global_{idx}"), width)),
        }
    }
}

fn emulate_parametric(
    op: &ParametricInstruction,
    state: &mut SymbolicState,
    at: &str,
) -> Result<(), PathError> {
    match op {
        ParametricInstruction::Drop => {
            state.pop(at)?;
        }
        ParametricInstruction::Select => {
            let condition = state.pop(at)?;
            let b = state.pop(at)?;
            let a = state.pop(at)?;
            state.push(SymVal::select(condition, a, b));
        }
    }
    Ok(())
}

impl Emulator for WasmEmulator<'_> {
    fn init_state(&self, function: &str) -> Result<(SymbolicState, bool), AnalysisError> {
        let func = self
            .module
            .function_by_symbol(function)
            .filter(|func| !func.is_import())
            .ok_or_else(|| AnalysisError::UnknownFunction(function.to_owned()))?;
        let unsupported = |ty: &ValType| AnalysisError::UnsupportedSignature {
            func: function.to_owned(),
            ty: format!("{ty:?}"),
        };

        let memory = Memory::new(self.image.clone(), self.module.initial_mem_pages as u32);
        let mut state = SymbolicState::new(function, memory);
        for (i, ty) in func.ty.params().iter().enumerate() {
            let width = value_width(ty).ok_or_else(|| unsupported(ty))?;
            state
                .locals
                .push(Some(SymVal::symbol(format!("param_{i}_{function}"), width)));
        }
        for ty in &func.locals {
            // float locals stay unset, reading one ends the path
            let init = Value::default_for_ty(ty)
                .zip(value_width(ty))
                .map(|(val, width)| SymVal::constant(val.as_bits(), width));
            state.locals.push(init);
        }
        for idx in 0..self.module.globals.len() {
            state.globals.push(self.initial_global(idx));
        }
        if let Some(ty) = func.ty.results().iter().find(|ty| value_width(ty).is_none()) {
            return Err(unsupported(ty));
        }
        let has_ret = !func.ty.results().is_empty();
        tracing::debug!(
            function,
            params = func.ty.params().len(),
            locals = func.locals.len(),
            globals = state.globals.len(),
            "initialized entry state"
        );
        Ok((state, has_ret))
    }

    fn emulate(
        &self,
        states: Vec<SymbolicState>,
        has_ret: bool,
        instructions: &[Instruction],
    ) -> Emulation {
        let mut flat = Vec::new();
        let mut branching = Vec::new();
        let mut finished = Vec::new();

        'states: for mut state in states {
            if !state.status.is_running() {
                finished.push(state);
                continue;
            }
            for (i, insn) in instructions.iter().enumerate() {
                state.last_instruction = Some((insn.offset, insn.text.clone()));
                let step = match self.step(&mut state, has_ret, insn) {
                    Ok(Step::Fork(_)) if i + 1 != instructions.len() => Err(
                        PathError::UnsupportedInstruction(format!("{} inside a block", insn.text)),
                    ),
                    step => step,
                };
                match step {
                    Ok(Step::Next) => {}
                    Ok(Step::Fork(forks)) => {
                        branching.push(forks);
                        continue 'states;
                    }
                    Ok(Step::Finished) => {
                        tracing::debug!(function = %state.current_func, status = %state.status, offset = insn.offset);
                        finished.push(state);
                        continue 'states;
                    }
                    Err(err) => {
                        tracing::warn!(
                            function = %state.current_func,
                            offset = insn.offset,
                            instruction = %insn.text,
                            "path dropped: {err}"
                        );
                        continue 'states;
                    }
                }
            }
            flat.push(state);
        }

        // every state runs the same instructions, so they either all fork or none does
        let successors = if branching.is_empty() {
            Successors::Flat(flat)
        } else {
            Successors::Branching(branching)
        };
        Emulation::new(successors, finished)
    }
}
