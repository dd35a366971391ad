use super::Value;
use wasmparser::{FuncType, MemArg, Operator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IUnaryOp {
    Clz,
    Ctz,
    Popcnt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IBinaryOp {
    Add,
    Sub,
    Mul,
    DivS,
    DivU,
    RemS,
    RemU,
    And,
    Or,
    Xor,
    Shl,
    ShrS,
    ShrU,
    Rotl,
    Rotr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ITestOp {
    Eqz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IRelOp {
    Eq,
    Ne,
    LtU,
    LtS,
    GtU,
    GtS,
    LeU,
    LeS,
    GeU,
    GeS,
}

// Integer conversions only, float conversions decode to `Unsupported`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConversionOp {
    I32Extend8S,
    I32Extend16S,
    I32WrapI64,
    I64Extend8S,
    I64Extend16S,
    I64Extend32S,
    I64ExtendI32S,
    I64ExtendI32U,
}

#[derive(Debug, Clone)]
pub(crate) enum NumericInstruction {
    Const(Value),
    I32UnOp(IUnaryOp),
    I32BinOp(IBinaryOp),
    I64UnOp(IUnaryOp),
    I64BinOp(IBinaryOp),
    I32TestOp(ITestOp),
    I64TestOp(ITestOp),
    I32RelOp(IRelOp),
    I64RelOp(IRelOp),
    ConversionOp(ConversionOp),
}

#[derive(Debug, Clone)]
pub(crate) enum MemoryInstruction {
    I32Load(MemArg),
    I32Load8U(MemArg),
    I32Load8S(MemArg),
    I32Load16U(MemArg),
    I32Load16S(MemArg),
    I64Load(MemArg),
    I64Load8U(MemArg),
    I64Load8S(MemArg),
    I64Load16U(MemArg),
    I64Load16S(MemArg),
    I64Load32U(MemArg),
    I64Load32S(MemArg),
    I32Store(MemArg),
    I32Store8(MemArg),
    I32Store16(MemArg),
    I64Store(MemArg),
    I64Store8(MemArg),
    I64Store16(MemArg),
    I64Store32(MemArg),
    MemorySize,
    MemoryGrow,
    MemoryFill,
    MemoryCopy,
}

impl MemoryInstruction {
    /// `(access width in bytes, value is i64, sign extend)` for loads.
    pub(crate) fn load_shape(&self) -> Option<(u32, bool, bool)> {
        use MemoryInstruction as M;
        Some(match self {
            M::I32Load(_) => (4, false, false),
            M::I32Load8U(_) => (1, false, false),
            M::I32Load8S(_) => (1, false, true),
            M::I32Load16U(_) => (2, false, false),
            M::I32Load16S(_) => (2, false, true),
            M::I64Load(_) => (8, true, false),
            M::I64Load8U(_) => (1, true, false),
            M::I64Load8S(_) => (1, true, true),
            M::I64Load16U(_) => (2, true, false),
            M::I64Load16S(_) => (2, true, true),
            M::I64Load32U(_) => (4, true, false),
            M::I64Load32S(_) => (4, true, true),
            _ => return None,
        })
    }

    /// Access width in bytes for stores.
    pub(crate) fn store_width(&self) -> Option<u32> {
        use MemoryInstruction as M;
        Some(match self {
            M::I32Store(_) => 4,
            M::I32Store8(_) | M::I64Store8(_) => 1,
            M::I32Store16(_) | M::I64Store16(_) => 2,
            M::I64Store(_) => 8,
            M::I64Store32(_) => 4,
            _ => return None,
        })
    }

    pub(crate) fn memarg(&self) -> Option<&MemArg> {
        use MemoryInstruction as M;
        match self {
            M::I32Load(m)
            | M::I32Load8U(m)
            | M::I32Load8S(m)
            | M::I32Load16U(m)
            | M::I32Load16S(m)
            | M::I64Load(m)
            | M::I64Load8U(m)
            | M::I64Load8S(m)
            | M::I64Load16U(m)
            | M::I64Load16S(m)
            | M::I64Load32U(m)
            | M::I64Load32S(m)
            | M::I32Store(m)
            | M::I32Store8(m)
            | M::I32Store16(m)
            | M::I64Store(m)
            | M::I64Store8(m)
            | M::I64Store16(m)
            | M::I64Store32(m) => Some(m),
            M::MemorySize | M::MemoryGrow | M::MemoryFill | M::MemoryCopy => None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum VariableInstruction {
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),
    GlobalSet(u32),
}

#[derive(Debug, Clone)]
pub(crate) enum ParametricInstruction {
    Drop,
    Select,
}

// Branch targets live in the CFG edges, so control instructions only carry what the
// emulator needs.
#[derive(Debug, Clone)]
pub(crate) enum ControlInstruction {
    Nop,
    Unreachable,
    Block,
    Loop,
    If,
    Else,
    End,
    Br,
    BrIf,
    BrTable,
    // Synthetic: one arm of a lowered `br_table`, compares the index on top of the stack
    BrTableCase { case: u32 },
    Return,
    Call {
        function_index: u32,
        function_ty: FuncType,
    },
    CallIndirect {
        function_ty: FuncType,
    },
}

#[derive(Debug, Clone)]
pub(crate) enum WFOperator {
    Numeric(NumericInstruction),
    Parametric(ParametricInstruction),
    Variable(VariableInstruction),
    Memory(MemoryInstruction),
    Control(ControlInstruction),
    Unsupported(String),
}

#[cfg(test)]
impl WFOperator {
    pub(crate) fn is_conditional_branch(&self) -> bool {
        matches!(
            self,
            WFOperator::Control(
                ControlInstruction::If
                    | ControlInstruction::BrIf
                    | ControlInstruction::BrTableCase { .. }
            )
        )
    }
}

/// One decoded instruction as it sits in a basic block.
#[derive(Debug, Clone)]
pub(crate) struct Instruction {
    // byte offset into the module binary
    pub offset: usize,
    pub op: WFOperator,
    pub text: String,
}

impl Instruction {
    pub(crate) fn new(offset: usize, op: WFOperator, text: impl Into<String>) -> Self {
        Self {
            offset,
            op,
            text: text.into(),
        }
    }

    #[cfg(test)]
    pub(crate) fn nop(offset: usize) -> Self {
        Self::new(offset, WFOperator::Control(ControlInstruction::Nop), "nop")
    }
}

pub(crate) fn op_to_const(op: &Operator) -> Option<Value> {
    match *op {
        Operator::I32Const { value } => Some(Value::I32(value)),
        Operator::I64Const { value } => Some(Value::I64(value)),
        _ => None,
    }
}

/// Render an operator the way it reads in the text format, e.g. `local.get 0`.
pub(crate) fn operator_text(op: &Operator) -> String {
    let debug = format!("{op:?}");
    let name = debug
        .split([' ', '{', '('])
        .next()
        .unwrap_or_default();
    let mut words: Vec<String> = Vec::new();
    for ch in name.chars() {
        if ch.is_ascii_uppercase() || words.is_empty() {
            words.push(String::new());
        }
        if let Some(word) = words.last_mut() {
            word.push(ch.to_ascii_lowercase());
        }
    }
    let mut mnemonic = String::new();
    for (i, word) in words.iter().enumerate() {
        match i {
            0 => {}
            1 if !matches!(words[0].as_str(), "br" | "call" | "return") => mnemonic.push('.'),
            _ => mnemonic.push('_'),
        }
        mnemonic.push_str(word);
    }
    let args = match *op {
        Operator::I32Const { value } => Some(value.to_string()),
        Operator::I64Const { value } => Some(value.to_string()),
        Operator::LocalGet { local_index }
        | Operator::LocalSet { local_index }
        | Operator::LocalTee { local_index } => Some(local_index.to_string()),
        Operator::GlobalGet { global_index } | Operator::GlobalSet { global_index } => {
            Some(global_index.to_string())
        }
        Operator::Call { function_index } => Some(function_index.to_string()),
        Operator::Br { relative_depth } | Operator::BrIf { relative_depth } => {
            Some(relative_depth.to_string())
        }
        _ => None,
    };
    match args {
        Some(args) => format!("{mnemonic} {args}"),
        None => mnemonic,
    }
}

pub(crate) fn translate_operator(op: &Operator) -> WFOperator {
    use ConversionOp as COP;
    use ControlInstruction as Ctl;
    use MemoryInstruction as Mem;
    use NumericInstruction as NumInst;
    use VariableInstruction as VarInstr;
    use WFOperator as WFO;
    match *op {
        Operator::Nop => WFO::Control(Ctl::Nop),
        Operator::Unreachable => WFO::Control(Ctl::Unreachable),
        Operator::Block { .. } => WFO::Control(Ctl::Block),
        Operator::Loop { .. } => WFO::Control(Ctl::Loop),
        Operator::If { .. } => WFO::Control(Ctl::If),
        Operator::Else => WFO::Control(Ctl::Else),
        Operator::End => WFO::Control(Ctl::End),
        Operator::Br { .. } => WFO::Control(Ctl::Br),
        Operator::BrIf { .. } => WFO::Control(Ctl::BrIf),
        Operator::BrTable { .. } => WFO::Control(Ctl::BrTable),
        Operator::Return => WFO::Control(Ctl::Return),

        Operator::LocalGet { local_index } => WFO::Variable(VarInstr::LocalGet(local_index)),
        Operator::LocalSet { local_index } => WFO::Variable(VarInstr::LocalSet(local_index)),
        Operator::LocalTee { local_index } => WFO::Variable(VarInstr::LocalTee(local_index)),
        Operator::GlobalGet { global_index } => WFO::Variable(VarInstr::GlobalGet(global_index)),
        Operator::GlobalSet { global_index } => WFO::Variable(VarInstr::GlobalSet(global_index)),

        Operator::I32Const { .. } | Operator::I64Const { .. } => match op_to_const(op) {
            Some(value) => WFO::Numeric(NumInst::Const(value)),
            None => WFO::Unsupported(operator_text(op)),
        },

        Operator::I32Clz => WFO::Numeric(NumInst::I32UnOp(IUnaryOp::Clz)),
        Operator::I32Ctz => WFO::Numeric(NumInst::I32UnOp(IUnaryOp::Ctz)),
        Operator::I32Popcnt => WFO::Numeric(NumInst::I32UnOp(IUnaryOp::Popcnt)),
        Operator::I64Clz => WFO::Numeric(NumInst::I64UnOp(IUnaryOp::Clz)),
        Operator::I64Ctz => WFO::Numeric(NumInst::I64UnOp(IUnaryOp::Ctz)),
        Operator::I64Popcnt => WFO::Numeric(NumInst::I64UnOp(IUnaryOp::Popcnt)),

        Operator::I32Add => WFO::Numeric(NumInst::I32BinOp(IBinaryOp::Add)),
        Operator::I32Sub => WFO::Numeric(NumInst::I32BinOp(IBinaryOp::Sub)),
        Operator::I32Mul => WFO::Numeric(NumInst::I32BinOp(IBinaryOp::Mul)),
        Operator::I32DivS => WFO::Numeric(NumInst::I32BinOp(IBinaryOp::DivS)),
        Operator::I32DivU => WFO::Numeric(NumInst::I32BinOp(IBinaryOp::DivU)),
        Operator::I32RemS => WFO::Numeric(NumInst::I32BinOp(IBinaryOp::RemS)),
        Operator::I32RemU => WFO::Numeric(NumInst::I32BinOp(IBinaryOp::RemU)),
        Operator::I32And => WFO::Numeric(NumInst::I32BinOp(IBinaryOp::And)),
        Operator::I32Or => WFO::Numeric(NumInst::I32BinOp(IBinaryOp::Or)),
        Operator::I32Xor => WFO::Numeric(NumInst::I32BinOp(IBinaryOp::Xor)),
        Operator::I32Shl => WFO::Numeric(NumInst::I32BinOp(IBinaryOp::Shl)),
        Operator::I32ShrS => WFO::Numeric(NumInst::I32BinOp(IBinaryOp::ShrS)),
        Operator::I32ShrU => WFO::Numeric(NumInst::I32BinOp(IBinaryOp::ShrU)),
        Operator::I32Rotl => WFO::Numeric(NumInst::I32BinOp(IBinaryOp::Rotl)),
        Operator::I32Rotr => WFO::Numeric(NumInst::I32BinOp(IBinaryOp::Rotr)),

        Operator::I64Add => WFO::Numeric(NumInst::I64BinOp(IBinaryOp::Add)),
        Operator::I64Sub => WFO::Numeric(NumInst::I64BinOp(IBinaryOp::Sub)),
        Operator::I64Mul => WFO::Numeric(NumInst::I64BinOp(IBinaryOp::Mul)),
        Operator::I64DivS => WFO::Numeric(NumInst::I64BinOp(IBinaryOp::DivS)),
        Operator::I64DivU => WFO::Numeric(NumInst::I64BinOp(IBinaryOp::DivU)),
        Operator::I64RemS => WFO::Numeric(NumInst::I64BinOp(IBinaryOp::RemS)),
        Operator::I64RemU => WFO::Numeric(NumInst::I64BinOp(IBinaryOp::RemU)),
        Operator::I64And => WFO::Numeric(NumInst::I64BinOp(IBinaryOp::And)),
        Operator::I64Or => WFO::Numeric(NumInst::I64BinOp(IBinaryOp::Or)),
        Operator::I64Xor => WFO::Numeric(NumInst::I64BinOp(IBinaryOp::Xor)),
        Operator::I64Shl => WFO::Numeric(NumInst::I64BinOp(IBinaryOp::Shl)),
        Operator::I64ShrS => WFO::Numeric(NumInst::I64BinOp(IBinaryOp::ShrS)),
        Operator::I64ShrU => WFO::Numeric(NumInst::I64BinOp(IBinaryOp::ShrU)),
        Operator::I64Rotl => WFO::Numeric(NumInst::I64BinOp(IBinaryOp::Rotl)),
        Operator::I64Rotr => WFO::Numeric(NumInst::I64BinOp(IBinaryOp::Rotr)),

        Operator::I32Eqz => WFO::Numeric(NumInst::I32TestOp(ITestOp::Eqz)),
        Operator::I64Eqz => WFO::Numeric(NumInst::I64TestOp(ITestOp::Eqz)),

        Operator::I32Eq => WFO::Numeric(NumInst::I32RelOp(IRelOp::Eq)),
        Operator::I32Ne => WFO::Numeric(NumInst::I32RelOp(IRelOp::Ne)),
        Operator::I32LtU => WFO::Numeric(NumInst::I32RelOp(IRelOp::LtU)),
        Operator::I32LtS => WFO::Numeric(NumInst::I32RelOp(IRelOp::LtS)),
        Operator::I32GtU => WFO::Numeric(NumInst::I32RelOp(IRelOp::GtU)),
        Operator::I32GtS => WFO::Numeric(NumInst::I32RelOp(IRelOp::GtS)),
        Operator::I32LeU => WFO::Numeric(NumInst::I32RelOp(IRelOp::LeU)),
        Operator::I32LeS => WFO::Numeric(NumInst::I32RelOp(IRelOp::LeS)),
        Operator::I32GeU => WFO::Numeric(NumInst::I32RelOp(IRelOp::GeU)),
        Operator::I32GeS => WFO::Numeric(NumInst::I32RelOp(IRelOp::GeS)),

        Operator::I64Eq => WFO::Numeric(NumInst::I64RelOp(IRelOp::Eq)),
        Operator::I64Ne => WFO::Numeric(NumInst::I64RelOp(IRelOp::Ne)),
        Operator::I64LtU => WFO::Numeric(NumInst::I64RelOp(IRelOp::LtU)),
        Operator::I64LtS => WFO::Numeric(NumInst::I64RelOp(IRelOp::LtS)),
        Operator::I64GtU => WFO::Numeric(NumInst::I64RelOp(IRelOp::GtU)),
        Operator::I64GtS => WFO::Numeric(NumInst::I64RelOp(IRelOp::GtS)),
        Operator::I64LeU => WFO::Numeric(NumInst::I64RelOp(IRelOp::LeU)),
        Operator::I64LeS => WFO::Numeric(NumInst::I64RelOp(IRelOp::LeS)),
        Operator::I64GeU => WFO::Numeric(NumInst::I64RelOp(IRelOp::GeU)),
        Operator::I64GeS => WFO::Numeric(NumInst::I64RelOp(IRelOp::GeS)),

        Operator::I32Extend8S => WFO::Numeric(NumInst::ConversionOp(COP::I32Extend8S)),
        Operator::I32Extend16S => WFO::Numeric(NumInst::ConversionOp(COP::I32Extend16S)),
        Operator::I64Extend8S => WFO::Numeric(NumInst::ConversionOp(COP::I64Extend8S)),
        Operator::I64Extend16S => WFO::Numeric(NumInst::ConversionOp(COP::I64Extend16S)),
        Operator::I64Extend32S => WFO::Numeric(NumInst::ConversionOp(COP::I64Extend32S)),
        Operator::I64ExtendI32S => WFO::Numeric(NumInst::ConversionOp(COP::I64ExtendI32S)),
        Operator::I64ExtendI32U => WFO::Numeric(NumInst::ConversionOp(COP::I64ExtendI32U)),
        Operator::I32WrapI64 => WFO::Numeric(NumInst::ConversionOp(COP::I32WrapI64)),

        Operator::I32Load { memarg } => WFO::Memory(Mem::I32Load(memarg)),
        Operator::I32Load8U { memarg } => WFO::Memory(Mem::I32Load8U(memarg)),
        Operator::I32Load8S { memarg } => WFO::Memory(Mem::I32Load8S(memarg)),
        Operator::I32Load16U { memarg } => WFO::Memory(Mem::I32Load16U(memarg)),
        Operator::I32Load16S { memarg } => WFO::Memory(Mem::I32Load16S(memarg)),
        Operator::I64Load { memarg } => WFO::Memory(Mem::I64Load(memarg)),
        Operator::I64Load8U { memarg } => WFO::Memory(Mem::I64Load8U(memarg)),
        Operator::I64Load8S { memarg } => WFO::Memory(Mem::I64Load8S(memarg)),
        Operator::I64Load16U { memarg } => WFO::Memory(Mem::I64Load16U(memarg)),
        Operator::I64Load16S { memarg } => WFO::Memory(Mem::I64Load16S(memarg)),
        Operator::I64Load32U { memarg } => WFO::Memory(Mem::I64Load32U(memarg)),
        Operator::I64Load32S { memarg } => WFO::Memory(Mem::I64Load32S(memarg)),
        Operator::I32Store { memarg } => WFO::Memory(Mem::I32Store(memarg)),
        Operator::I32Store8 { memarg } => WFO::Memory(Mem::I32Store8(memarg)),
        Operator::I32Store16 { memarg } => WFO::Memory(Mem::I32Store16(memarg)),
        Operator::I64Store { memarg } => WFO::Memory(Mem::I64Store(memarg)),
        Operator::I64Store8 { memarg } => WFO::Memory(Mem::I64Store8(memarg)),
        Operator::I64Store16 { memarg } => WFO::Memory(Mem::I64Store16(memarg)),
        Operator::I64Store32 { memarg } => WFO::Memory(Mem::I64Store32(memarg)),

        Operator::MemoryGrow { .. } => WFO::Memory(Mem::MemoryGrow),
        Operator::MemorySize { .. } => WFO::Memory(Mem::MemorySize),
        Operator::MemoryCopy { .. } => WFO::Memory(Mem::MemoryCopy),
        Operator::MemoryFill { .. } => WFO::Memory(Mem::MemoryFill),

        Operator::Select | Operator::TypedSelect { .. } => {
            WFO::Parametric(ParametricInstruction::Select)
        }
        Operator::Drop => WFO::Parametric(ParametricInstruction::Drop),

        // floats, tables, references, atomics, simd
        _ => WFO::Unsupported(operator_text(op)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_rendering() {
        assert_eq!(operator_text(&Operator::I32Add), "i32.add");
        assert_eq!(
            operator_text(&Operator::LocalGet { local_index: 3 }),
            "local.get 3"
        );
        assert_eq!(operator_text(&Operator::BrIf { relative_depth: 1 }), "br_if 1");
        assert_eq!(operator_text(&Operator::I64ExtendI32U), "i64.extend_i32_u");
        assert_eq!(operator_text(&Operator::I64Const { value: -7 }), "i64.const -7");
        assert_eq!(operator_text(&Operator::Unreachable), "unreachable");
    }

    #[test]
    fn floats_are_unsupported() {
        assert!(matches!(
            translate_operator(&Operator::F32Add),
            WFOperator::Unsupported(_)
        ));
        assert!(matches!(
            translate_operator(&Operator::I32Add),
            WFOperator::Numeric(NumericInstruction::I32BinOp(IBinaryOp::Add))
        ));
    }
}
