use super::Step;
use crate::error::PathError;
use crate::ir::{Instruction, NumericInstruction, Value};
use crate::symbolic::{
    BinaryOp, Hazard, HazardKind, SymExpr, SymVal, SymbolicState, TrapKind, UnaryOp, apply_binary,
};

fn emulate_unop(op: UnaryOp, state: &mut SymbolicState, at: &str) -> Result<(), PathError> {
    let val = state.pop(at)?;
    state.push(SymVal::unary(op, val));
    Ok(())
}

// Holds when `result = a op b` wrapped around in unsigned arithmetic.
fn wraps(op: BinaryOp, a: &SymExpr, b: &SymExpr, result: &SymExpr) -> Option<SymExpr> {
    let condition = match op {
        BinaryOp::Add => SymVal::binary(BinaryOp::LtU, result.clone(), a.clone()),
        BinaryOp::Sub => SymVal::binary(BinaryOp::LtU, a.clone(), b.clone()),
        BinaryOp::Mul => {
            let zero = SymVal::constant(0, a.width());
            let quotient = SymVal::binary(BinaryOp::DivU, result.clone(), a.clone());
            SymVal::binary(
                BinaryOp::And,
                SymVal::binary(BinaryOp::Ne, a.clone(), zero),
                SymVal::binary(BinaryOp::Ne, quotient, b.clone()),
            )
        }
        _ => return None,
    };
    // concrete arithmetic is the program's business
    condition.as_const().is_none().then_some(condition)
}

fn emulate_binop(
    op: BinaryOp,
    state: &mut SymbolicState,
    insn: &Instruction,
    track_overflow: bool,
) -> Result<Step, PathError> {
    let b = state.pop(&insn.text)?;
    let a = state.pop(&insn.text)?;
    if op.is_division() {
        match (a.as_const(), b.as_const()) {
            (_, Some(0)) => {
                state.trap(TrapKind::DivisionByZero);
                return Ok(Step::Finished);
            }
            (Some(x), Some(y)) if apply_binary(op, x, y, a.width()).is_none() => {
                state.trap(TrapKind::IntegerOverflow);
                return Ok(Step::Finished);
            }
            (_, None) => {
                let zero = SymVal::constant(0, b.width());
                state.hazards.push(Hazard {
                    kind: HazardKind::DivisionByZero,
                    condition: SymVal::binary(BinaryOp::Eq, b.clone(), zero),
                    constraints_len: state.constraints.len(),
                    instruction: insn.text.clone(),
                    offset: insn.offset,
                });
            }
            _ => {}
        }
    }
    let result = SymVal::binary(op, a.clone(), b.clone());
    if track_overflow {
        if let Some(condition) = wraps(op, &a, &b, &result) {
            state.hazards.push(Hazard {
                kind: HazardKind::IntegerOverflow,
                condition,
                constraints_len: state.constraints.len(),
                instruction: insn.text.clone(),
                offset: insn.offset,
            });
        }
    }
    state.push(result);
    Ok(Step::Next)
}

pub(super) fn emulate_numeric(
    op: &NumericInstruction,
    state: &mut SymbolicState,
    insn: &Instruction,
    track_overflow: bool,
) -> Result<Step, PathError> {
    use NumericInstruction as NumIns;
    let at = insn.text.as_str();
    match op {
        NumIns::Const(val) => {
            let width = match val {
                Value::I32(_) => 32,
                Value::I64(_) => 64,
            };
            state.push(SymVal::constant(val.as_bits(), width));
        }
        NumIns::I32UnOp(unop) | NumIns::I64UnOp(unop) => emulate_unop(unop.into(), state, at)?,
        NumIns::I32TestOp(testop) | NumIns::I64TestOp(testop) => {
            emulate_unop(testop.into(), state, at)?
        }
        NumIns::ConversionOp(convop) => emulate_unop(convop.into(), state, at)?,
        NumIns::I32BinOp(binop) | NumIns::I64BinOp(binop) => {
            return emulate_binop(binop.into(), state, insn, track_overflow);
        }
        NumIns::I32RelOp(relop) | NumIns::I64RelOp(relop) => {
            let b = state.pop(at)?;
            let a = state.pop(at)?;
            state.push(SymVal::binary(relop.into(), a, b));
        }
    }
    Ok(Step::Next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IBinaryOp, IRelOp, WFOperator};

    fn insn(op: NumericInstruction, text: &str) -> Instruction {
        Instruction::new(0, WFOperator::Numeric(op.clone()), text)
    }

    fn run(state: &mut SymbolicState, op: NumericInstruction) -> Step {
        let insn = insn(op.clone(), "test");
        emulate_numeric(&op, state, &insn, true).unwrap()
    }

    #[test]
    fn signed_overflow_traps() {
        let mut state = SymbolicState::blank("f");
        run(&mut state, NumericInstruction::Const(Value::I32(i32::MIN)));
        run(&mut state, NumericInstruction::Const(Value::I32(-1)));
        let step = run(&mut state, NumericInstruction::I32BinOp(IBinaryOp::DivS));
        assert!(matches!(step, Step::Finished));
        assert_eq!(
            state.status,
            crate::symbolic::StateStatus::Trapped(TrapKind::IntegerOverflow)
        );
    }

    #[test]
    fn comparisons_are_boolean_terms() {
        let mut state = SymbolicState::blank("f");
        state.push(SymVal::symbol("x", 64));
        run(&mut state, NumericInstruction::Const(Value::I64(4)));
        run(&mut state, NumericInstruction::I64RelOp(IRelOp::LtU));
        assert_eq!(state.stack.len(), 1);
        assert_eq!(state.stack[0].width(), 32);
        assert_eq!(state.stack[0].to_string(), "(x <u 4)");
    }

    #[test]
    fn underflow_is_a_path_error() {
        let mut state = SymbolicState::blank("f");
        let op = NumericInstruction::I32BinOp(IBinaryOp::Add);
        let err = emulate_numeric(&op, &mut state, &insn(op.clone(), "i32.add"), false).err();
        assert_eq!(err, Some(PathError::StackUnderflow("i32.add".into())));
    }

    #[test]
    fn wrapping_arithmetic_records_overflow_hazards() {
        let mut state = SymbolicState::blank("f");
        state.push(SymVal::symbol("x", 32));
        run(&mut state, NumericInstruction::Const(Value::I32(1)));
        run(&mut state, NumericInstruction::I32BinOp(IBinaryOp::Add));
        assert_eq!(state.hazards.len(), 1);
        assert_eq!(state.hazards[0].kind, HazardKind::IntegerOverflow);
        assert_eq!(state.hazards[0].condition.to_string(), "((x + 1) <u x)");

        // fully concrete arithmetic and non-wrapping ops stay quiet
        run(&mut state, NumericInstruction::Const(Value::I32(2)));
        run(&mut state, NumericInstruction::Const(Value::I32(3)));
        run(&mut state, NumericInstruction::I32BinOp(IBinaryOp::Mul));
        run(&mut state, NumericInstruction::I32BinOp(IBinaryOp::And));
        assert_eq!(state.hazards.len(), 1);

        let mut untracked = SymbolicState::blank("f");
        untracked.push(SymVal::symbol("x", 32));
        untracked.push(SymVal::symbol("y", 32));
        let op = NumericInstruction::I32BinOp(IBinaryOp::Sub);
        emulate_numeric(&op, &mut untracked, &insn(op.clone(), "i32.sub"), false).unwrap();
        assert!(untracked.hazards.is_empty());
    }
}
