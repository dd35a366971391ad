use wasmparser::MemArg;

use super::Step;
use crate::error::PathError;
use crate::ir::{Instruction, MemoryInstruction};
use crate::symbolic::{SymExpr, SymVal, SymbolicState, TrapKind};

enum Address {
    Concrete(u64),
    Symbolic,
}

fn pop_address(state: &mut SymbolicState, imm: &MemArg, at: &str) -> Result<Address, PathError> {
    if imm.memory != 0 {
        return Err(PathError::MalformedMemoryAccess(format!(
            "memory index {} at `{at}`",
            imm.memory
        )));
    }
    let addr = state.pop(at)?;
    Ok(match addr.as_const() {
        // an overflowing effective address is out of bounds
        Some(base) => Address::Concrete(base.saturating_add(imm.offset)),
        None => Address::Symbolic,
    })
}

fn out_of_bounds(state: &mut SymbolicState) -> Result<Step, PathError> {
    state.trap(TrapKind::MemoryOutOfBounds);
    Ok(Step::Finished)
}

fn emulate_load(
    imm: &MemArg,
    (width, is_i64, signed): (u32, bool, bool),
    state: &mut SymbolicState,
    insn: &Instruction,
) -> Result<Step, PathError> {
    let result_width = if is_i64 { 64 } else { 32 };
    let addr = match pop_address(state, imm, &insn.text)? {
        Address::Concrete(addr) => addr,
        Address::Symbolic => {
            tracing::debug!(offset = insn.offset, "load from symbolic address is unconstrained");
            let val = state.fresh_symbol("load", result_width);
            state.push(val);
            return Ok(Step::Next);
        }
    };
    let Some(bytes) = state.memory.load(addr, width) else {
        return out_of_bounds(state);
    };
    let val = SymVal::extend(SymVal::combine_bytes(bytes), result_width, signed);
    state.push(val);
    Ok(Step::Next)
}

fn emulate_store(
    imm: &MemArg,
    width: u32,
    state: &mut SymbolicState,
    insn: &Instruction,
) -> Result<Step, PathError> {
    let val = state.pop(&insn.text)?;
    let addr = match pop_address(state, imm, &insn.text)? {
        Address::Concrete(addr) => addr,
        Address::Symbolic => {
            tracing::debug!(offset = insn.offset, "store to symbolic address dropped");
            return Ok(Step::Next);
        }
    };
    let bytes = (0..width)
        .map(|i| SymVal::extract_byte(val.clone(), i))
        .collect();
    if !state.memory.store(addr, bytes) {
        return out_of_bounds(state);
    }
    Ok(Step::Next)
}

// `len`, `val` and `dest` operands of the bulk memory instructions, top of stack first.
fn pop_bulk_operands(
    state: &mut SymbolicState,
    at: &str,
) -> Result<(Option<u64>, SymExpr, Option<u64>), PathError> {
    let len = state.pop(at)?;
    let val = state.pop(at)?;
    let dest = state.pop(at)?;
    Ok((dest.as_const(), val, len.as_const()))
}

pub(super) fn emulate_memory(
    op: &MemoryInstruction,
    state: &mut SymbolicState,
    insn: &Instruction,
) -> Result<Step, PathError> {
    if let (Some(shape), Some(imm)) = (op.load_shape(), op.memarg()) {
        return emulate_load(imm, shape, state, insn);
    }
    if let (Some(width), Some(imm)) = (op.store_width(), op.memarg()) {
        return emulate_store(imm, width, state, insn);
    }
    let at = insn.text.as_str();
    match op {
        MemoryInstruction::MemorySize => {
            let pages = state.memory.pages();
            state.push(SymVal::constant(pages as u64, 32));
        }
        MemoryInstruction::MemoryGrow => {
            let delta = state.pop(at)?;
            let res = match delta.as_const() {
                Some(delta) => {
                    let old = state.memory.grow(delta as u32);
                    SymVal::constant(old.map_or(u32::MAX as u64, |p| p as u64), 32)
                }
                None => {
                    tracing::debug!(offset = insn.offset, "memory.grow by a symbolic delta");
                    state.fresh_symbol("memory_grow", 32)
                }
            };
            state.push(res);
        }
        MemoryInstruction::MemoryFill => {
            let (Some(dest), val, Some(len)) = pop_bulk_operands(state, at)? else {
                tracing::debug!(offset = insn.offset, "memory.fill with symbolic bounds skipped");
                return Ok(Step::Next);
            };
            if dest.saturating_add(len) > state.memory.size_bytes() {
                return out_of_bounds(state);
            }
            let bytes = vec![SymVal::extract_byte(val, 0); len as usize];
            if !state.memory.store(dest, bytes) {
                return out_of_bounds(state);
            }
        }
        MemoryInstruction::MemoryCopy => {
            let (Some(dest), src, Some(len)) = pop_bulk_operands(state, at)? else {
                tracing::debug!(offset = insn.offset, "memory.copy with symbolic bounds skipped");
                return Ok(Step::Next);
            };
            let Some(src) = src.as_const() else {
                tracing::debug!(offset = insn.offset, "memory.copy from a symbolic source skipped");
                return Ok(Step::Next);
            };
            let Some(bytes) = state.memory.load(src, len as u32) else {
                return out_of_bounds(state);
            };
            if !state.memory.store(dest, bytes) {
                return out_of_bounds(state);
            }
        }
        _ => {
            return Err(PathError::MalformedMemoryAccess(format!(
                "`{at}` without a memory argument"
            )));
        }
    }
    Ok(Step::Next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::WFOperator;
    use crate::symbolic::{Memory, StateStatus};
    use std::rc::Rc;

    fn memarg(offset: u64) -> MemArg {
        MemArg {
            align: 0,
            max_align: 0,
            offset,
            memory: 0,
        }
    }

    fn run(state: &mut SymbolicState, op: MemoryInstruction) -> Step {
        let insn = Instruction::new(0, WFOperator::Memory(op.clone()), "test");
        emulate_memory(&op, state, &insn).unwrap()
    }

    fn state() -> SymbolicState {
        SymbolicState::new("f", Memory::new(Rc::default(), 1))
    }

    #[test]
    fn sign_extending_load() {
        let mut s = state();
        s.push(SymVal::constant(4, 32));
        s.push(SymVal::constant(0xff, 32));
        run(&mut s, MemoryInstruction::I32Store8(memarg(0)));
        s.push(SymVal::constant(0, 32));
        run(&mut s, MemoryInstruction::I64Load8S(memarg(4)));
        assert_eq!(s.stack[0].as_const(), Some(u64::MAX));
    }

    #[test]
    fn symbolic_addresses() {
        let mut s = state();
        s.push(SymVal::symbol("p", 32));
        s.push(SymVal::constant(1, 32));
        run(&mut s, MemoryInstruction::I32Store(memarg(0)));
        assert_eq!(s.memory.written().count(), 0);
        s.push(SymVal::symbol("p", 32));
        run(&mut s, MemoryInstruction::I32Load(memarg(0)));
        assert_eq!(s.stack[0].to_string(), "load_0");
    }

    #[test]
    fn fill_copy_and_grow() {
        let mut s = state();
        for v in [8, 0x41, 4] {
            s.push(SymVal::constant(v, 32));
        }
        run(&mut s, MemoryInstruction::MemoryFill);
        for v in [100, 8, 4] {
            s.push(SymVal::constant(v, 32));
        }
        run(&mut s, MemoryInstruction::MemoryCopy);
        let bytes = s.memory.load(100, 4).unwrap();
        assert_eq!(SymVal::combine_bytes(bytes).as_const(), Some(0x4141_4141));

        s.push(SymVal::constant(1, 32));
        run(&mut s, MemoryInstruction::MemoryGrow);
        run(&mut s, MemoryInstruction::MemorySize);
        assert_eq!(s.stack.iter().map(|v| v.as_const()).collect::<Vec<_>>(), vec![Some(1), Some(2)]);

        s.push(SymVal::constant(2 * 0x10000 - 1, 32));
        s.push(SymVal::constant(0, 32));
        s.push(SymVal::constant(2, 32));
        assert!(matches!(run(&mut s, MemoryInstruction::MemoryFill), Step::Finished));
        assert_eq!(s.status, StateStatus::Trapped(TrapKind::MemoryOutOfBounds));
    }
}
