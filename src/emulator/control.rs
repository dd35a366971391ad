use wasmparser::FuncType;

use super::{BranchStates, Step, value_width};
use crate::error::PathError;
use crate::ir::{ControlInstruction, EdgeType, ModuleSpec};
use crate::symbolic::{BinaryOp, StateStatus, SymExpr, SymVal, SymbolicState, TrapKind};

// One successor per side whose constraint isn't constant false.
fn fork(state: &SymbolicState, taken: SymExpr, not_taken: SymExpr) -> BranchStates {
    let mut forks = BranchStates::new();
    for (edge, constraint) in [
        (EdgeType::ConditionalTrue, taken),
        (EdgeType::ConditionalFalse, not_taken),
    ] {
        match constraint.as_const() {
            Some(0) => continue,
            Some(_) => {
                forks.insert(edge, state.clone());
            }
            None => {
                let mut forked = state.clone();
                forked.add_constraint(constraint);
                forks.insert(edge, forked);
            }
        }
    }
    forks
}

fn push_call_results(
    ty: &FuncType,
    callee: &str,
    state: &mut SymbolicState,
) -> Result<Step, PathError> {
    for result in ty.results() {
        let width =
            value_width(result).ok_or_else(|| PathError::UnsupportedType(format!("{result:?}")))?;
        let val = state.fresh_symbol(&format!("ret_{callee}"), width);
        state.push(val);
    }
    Ok(Step::Next)
}

fn pop_call_args(
    ty: &FuncType,
    state: &mut SymbolicState,
    at: &str,
) -> Result<Vec<SymExpr>, PathError> {
    let mut args = Vec::with_capacity(ty.params().len());
    for _ in ty.params() {
        args.push(state.pop(at)?);
    }
    args.reverse();
    Ok(args)
}

fn emulate_call(
    module: &ModuleSpec,
    function_index: u32,
    ty: &FuncType,
    state: &mut SymbolicState,
    at: &str,
) -> Result<Step, PathError> {
    let args = pop_call_args(ty, state, at)?;
    let callee = module.functions.get(function_index as usize);
    let name = callee
        .map(|func| func.import.as_deref().unwrap_or(&func.symbol))
        .unwrap_or("unknown");
    if callee.is_some_and(|func| func.is_import()) && name.rsplit("::").next() == Some("proc_exit")
    {
        let code = args.first().and_then(|code| code.as_const());
        state.status = StateStatus::Exited(code);
        return Ok(Step::Finished);
    }
    // callees aren't entered, their results are unconstrained
    tracing::trace!(callee = name, args = args.len(), "call summarized");
    push_call_results(ty, name, state)
}

pub(super) fn emulate_control(
    module: &ModuleSpec,
    op: &ControlInstruction,
    state: &mut SymbolicState,
    has_ret: bool,
    at: &str,
) -> Result<Step, PathError> {
    use ControlInstruction as C;
    match op {
        // targets are CFG edges
        C::Nop | C::Block | C::Loop | C::Else | C::End | C::Br | C::BrTable => Ok(Step::Next),
        C::Unreachable => {
            state.trap(TrapKind::Unreachable);
            Ok(Step::Finished)
        }
        C::Return => {
            state.finish_return(has_ret);
            Ok(Step::Finished)
        }
        C::If | C::BrIf => {
            let condition = state.pop(at)?;
            let zero = SymVal::constant(0, condition.width());
            let taken = SymVal::binary(BinaryOp::Ne, condition.clone(), zero.clone());
            let not_taken = SymVal::binary(BinaryOp::Eq, condition, zero);
            Ok(Step::Fork(fork(state, taken, not_taken)))
        }
        C::BrTableCase { case } => {
            // the index stays on the stack until a case matches
            let index = state.peek(at)?.clone();
            let case = SymVal::constant(*case as u64, index.width());
            let taken = SymVal::binary(BinaryOp::Eq, index.clone(), case.clone());
            let not_taken = SymVal::binary(BinaryOp::Ne, index, case);
            let mut forks = fork(state, taken, not_taken);
            if let Some(matched) = forks.get_mut(&EdgeType::ConditionalTrue) {
                matched.pop(at)?;
            }
            Ok(Step::Fork(forks))
        }
        C::Call {
            function_index,
            function_ty,
        } => emulate_call(module, *function_index, function_ty, state, at),
        C::CallIndirect { function_ty } => {
            state.pop(at)?;
            pop_call_args(function_ty, state, at)?;
            push_call_results(function_ty, "indirect", state)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_module() -> ModuleSpec {
        ModuleSpec::parse("t.wat", &wat::parse_str("(module (func))").unwrap()).unwrap()
    }

    #[test]
    fn br_table_case_consumes_index_on_match() {
        let module = empty_module();
        let mut state = SymbolicState::blank("f");
        state.push(SymVal::symbol("i", 32));
        let op = ControlInstruction::BrTableCase { case: 1 };
        let Step::Fork(forks) = emulate_control(&module, &op, &mut state, false, "case").unwrap()
        else {
            panic!("expected fork");
        };
        let matched = &forks[&EdgeType::ConditionalTrue];
        let next = &forks[&EdgeType::ConditionalFalse];
        assert!(matched.stack.is_empty());
        assert_eq!(next.stack.len(), 1);
        assert_eq!(matched.constraints[0].to_string(), "(i == 1)");
        assert_eq!(next.constraints[0].to_string(), "(i != 1)");
    }

    #[test]
    fn return_captures_top_of_stack() {
        let module = empty_module();
        let mut state = SymbolicState::blank("f");
        state.push(SymVal::constant(9, 32));
        let step = emulate_control(&module, &ControlInstruction::Return, &mut state, true, "return");
        assert!(matches!(step, Ok(Step::Finished)));
        assert_eq!(state.status, StateStatus::Returned);
        assert_eq!(state.return_value.and_then(|v| v.as_const()), Some(9));
    }
}
