pub mod operators;
use std::fmt::Display;

pub(crate) use operators::{
    ControlInstruction, ConversionOp, IBinaryOp, IRelOp, ITestOp, IUnaryOp, Instruction,
    MemoryInstruction, NumericInstruction, ParametricInstruction, VariableInstruction,
    WFOperator,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Value {
    I32(i32),
    I64(i64),
}

impl Value {
    pub(crate) fn default_for_ty(ty: &ValType) -> Option<Self> {
        match ty {
            ValType::I32 => Some(Self::I32(0)),
            ValType::I64 => Some(Self::I64(0)),
            _ => None,
        }
    }

    pub(crate) fn as_i32(&self) -> Option<i32> {
        match *self {
            Self::I32(val) => Some(val),
            _ => None,
        }
    }

    pub(crate) fn as_bits(&self) -> u64 {
        match *self {
            Self::I32(val) => val as u32 as u64,
            Self::I64(val) => val as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
// Function-local operator index
pub(crate) struct InsnIdx(pub u32);

impl Display for InsnIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl InsnIdx {
    pub(crate) fn i(&self) -> usize {
        self.0 as usize
    }

    pub(crate) fn inc(&self) -> Self {
        Self(self.0 + 1)
    }
}

pub mod cfg;
pub mod cycles;
pub mod parse;
pub mod parse_cfg;
#[cfg(test)]
pub(crate) use cfg::CfgBuilder;
pub(crate) use cfg::{ControlFlowGraph, EdgeType, Edges};
pub(crate) use cycles::{CycleHeaders, detect_cycles};
pub(crate) use parse::ModuleSpec;
use wasmparser::ValType;
