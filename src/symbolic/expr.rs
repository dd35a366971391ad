use std::fmt;
use std::rc::Rc;

use crate::ir::{ConversionOp, IBinaryOp, IRelOp, ITestOp, IUnaryOp};

/// Expression nodes are immutable, so forked states can share them.
pub(crate) type SymExpr = Rc<SymVal>;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Clz,
    Ctz,
    Popcnt,
    Eqz,

    I32Extend8S,
    I32Extend16S,
    I32WrapI64,
    I64Extend8S,
    I64Extend16S,
    I64Extend32S,
    I64ExtendI32S,
    I64ExtendI32U,
}

impl From<&IUnaryOp> for UnaryOp {
    fn from(val: &IUnaryOp) -> Self {
        match val {
            IUnaryOp::Clz => Self::Clz,
            IUnaryOp::Ctz => Self::Ctz,
            IUnaryOp::Popcnt => Self::Popcnt,
        }
    }
}

impl From<&ITestOp> for UnaryOp {
    fn from(val: &ITestOp) -> Self {
        match val {
            ITestOp::Eqz => Self::Eqz,
        }
    }
}

impl From<&ConversionOp> for UnaryOp {
    fn from(val: &ConversionOp) -> Self {
        match val {
            ConversionOp::I32Extend8S => Self::I32Extend8S,
            ConversionOp::I32Extend16S => Self::I32Extend16S,
            ConversionOp::I32WrapI64 => Self::I32WrapI64,
            ConversionOp::I64Extend8S => Self::I64Extend8S,
            ConversionOp::I64Extend16S => Self::I64Extend16S,
            ConversionOp::I64Extend32S => Self::I64Extend32S,
            ConversionOp::I64ExtendI32S => Self::I64ExtendI32S,
            ConversionOp::I64ExtendI32U => Self::I64ExtendI32U,
        }
    }
}

impl UnaryOp {
    fn name(self) -> &'static str {
        match self {
            Self::Clz => "clz",
            Self::Ctz => "ctz",
            Self::Popcnt => "popcnt",
            Self::Eqz => "eqz",
            Self::I32Extend8S => "i32.extend8_s",
            Self::I32Extend16S => "i32.extend16_s",
            Self::I32WrapI64 => "i32.wrap_i64",
            Self::I64Extend8S => "i64.extend8_s",
            Self::I64Extend16S => "i64.extend16_s",
            Self::I64Extend32S => "i64.extend32_s",
            Self::I64ExtendI32S => "i64.extend_i32_s",
            Self::I64ExtendI32U => "i64.extend_i32_u",
        }
    }

    fn result_width(self, operand: u32) -> u32 {
        match self {
            Self::Clz | Self::Ctz | Self::Popcnt => operand,
            Self::Eqz | Self::I32Extend8S | Self::I32Extend16S | Self::I32WrapI64 => 32,
            Self::I64Extend8S
            | Self::I64Extend16S
            | Self::I64Extend32S
            | Self::I64ExtendI32S
            | Self::I64ExtendI32U => 64,
        }
    }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    // arith
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

    // rel ops
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

impl From<&IBinaryOp> for BinaryOp {
    fn from(val: &IBinaryOp) -> Self {
        match val {
            IBinaryOp::Add => Self::Add,
            IBinaryOp::Sub => Self::Sub,
            IBinaryOp::Mul => Self::Mul,
            IBinaryOp::DivS => Self::DivS,
            IBinaryOp::DivU => Self::DivU,
            IBinaryOp::RemS => Self::RemS,
            IBinaryOp::RemU => Self::RemU,
            IBinaryOp::And => Self::And,
            IBinaryOp::Or => Self::Or,
            IBinaryOp::Xor => Self::Xor,
            IBinaryOp::Shl => Self::Shl,
            IBinaryOp::ShrS => Self::ShrS,
            IBinaryOp::ShrU => Self::ShrU,
            IBinaryOp::Rotl => Self::Rotl,
            IBinaryOp::Rotr => Self::Rotr,
        }
    }
}

impl From<&IRelOp> for BinaryOp {
    fn from(val: &IRelOp) -> Self {
        match val {
            IRelOp::Eq => Self::Eq,
            IRelOp::Ne => Self::Ne,
            IRelOp::LtU => Self::LtU,
            IRelOp::LtS => Self::LtS,
            IRelOp::GtU => Self::GtU,
            IRelOp::GtS => Self::GtS,
            IRelOp::LeU => Self::LeU,
            IRelOp::LeS => Self::LeS,
            IRelOp::GeU => Self::GeU,
            IRelOp::GeS => Self::GeS,
        }
    }
}

impl BinaryOp {
    pub(crate) fn is_relational(self) -> bool {
        matches!(
            self,
            Self::Eq
                | Self::Ne
                | Self::LtU
                | Self::LtS
                | Self::GtU
                | Self::GtS
                | Self::LeU
                | Self::LeS
                | Self::GeU
                | Self::GeS
        )
    }

    pub(crate) fn is_division(self) -> bool {
        matches!(self, Self::DivS | Self::DivU | Self::RemS | Self::RemU)
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::DivS => "/s",
            Self::DivU => "/u",
            Self::RemS => "%s",
            Self::RemU => "%u",
            Self::And => "&",
            Self::Or => "|",
            Self::Xor => "^",
            Self::Shl => "<<",
            Self::ShrS => ">>s",
            Self::ShrU => ">>u",
            Self::Rotl => "rotl",
            Self::Rotr => "rotr",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::LtU => "<u",
            Self::LtS => "<s",
            Self::GtU => ">u",
            Self::GtS => ">s",
            Self::LeU => "<=u",
            Self::LeS => "<=s",
            Self::GeU => ">=u",
            Self::GeS => ">=s",
        }
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub(crate) enum SymVal {
    Const {
        value: u64,
        width: u32,
    },
    Symbol {
        name: String,
        width: u32,
    },
    Unary(UnaryOp, SymExpr),
    Binary(BinaryOp, SymExpr, SymExpr),
    Select {
        condition: SymExpr,
        a: SymExpr,
        b: SymExpr,
    },
    ExtractByte {
        val: SymExpr,
        byte_index: u32,
    },
    // little-endian, byte 0 first
    CombineBytes(Vec<SymExpr>),
    Extend {
        val: SymExpr,
        width: u32,
        signed: bool,
    },
}

pub(crate) fn mask(value: u64, width: u32) -> u64 {
    if width >= 64 {
        value
    } else {
        value & ((1u64 << width) - 1)
    }
}

pub(crate) fn sign_extend(value: u64, width: u32) -> i64 {
    if width >= 64 {
        value as i64
    } else {
        let shift = 64 - width;
        ((value << shift) as i64) >> shift
    }
}

pub(crate) fn apply_unary(op: UnaryOp, v: u64, width: u32) -> u64 {
    let v = mask(v, width);
    match op {
        UnaryOp::Clz => (v.leading_zeros() - (64 - width)) as u64,
        UnaryOp::Ctz => {
            if v == 0 {
                width as u64
            } else {
                v.trailing_zeros() as u64
            }
        }
        UnaryOp::Popcnt => v.count_ones() as u64,
        UnaryOp::Eqz => (v == 0) as u64,
        UnaryOp::I32Extend8S => mask(sign_extend(v, 8) as u64, 32),
        UnaryOp::I32Extend16S => mask(sign_extend(v, 16) as u64, 32),
        UnaryOp::I32WrapI64 => mask(v, 32),
        UnaryOp::I64Extend8S => sign_extend(v, 8) as u64,
        UnaryOp::I64Extend16S => sign_extend(v, 16) as u64,
        UnaryOp::I64Extend32S | UnaryOp::I64ExtendI32S => sign_extend(v, 32) as u64,
        UnaryOp::I64ExtendI32U => mask(v, 32),
    }
}

/// `None` when the operation traps (division by zero, signed overflow).
pub(crate) fn apply_binary(op: BinaryOp, a: u64, b: u64, width: u32) -> Option<u64> {
    let (a, b) = (mask(a, width), mask(b, width));
    let (sa, sb) = (sign_extend(a, width), sign_extend(b, width));
    let k = (b % width as u64) as u32;
    let min_signed = sign_extend(1u64 << (width - 1), width);
    let res = match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::DivU | BinaryOp::RemU | BinaryOp::DivS | BinaryOp::RemS if b == 0 => {
            return None;
        }
        BinaryOp::DivU => a / b,
        BinaryOp::RemU => a % b,
        BinaryOp::DivS => {
            if sa == min_signed && sb == -1 {
                return None;
            }
            sa.wrapping_div(sb) as u64
        }
        BinaryOp::RemS => sa.wrapping_rem(sb) as u64,
        BinaryOp::And => a & b,
        BinaryOp::Or => a | b,
        BinaryOp::Xor => a ^ b,
        BinaryOp::Shl => a << k,
        BinaryOp::ShrU => a >> k,
        BinaryOp::ShrS => (sa >> k) as u64,
        BinaryOp::Rotl if k == 0 => a,
        BinaryOp::Rotr if k == 0 => a,
        BinaryOp::Rotl => (a << k) | (a >> (width - k)),
        BinaryOp::Rotr => (a >> k) | (a << (width - k)),
        BinaryOp::Eq => (a == b) as u64,
        BinaryOp::Ne => (a != b) as u64,
        BinaryOp::LtU => (a < b) as u64,
        BinaryOp::LtS => (sa < sb) as u64,
        BinaryOp::GtU => (a > b) as u64,
        BinaryOp::GtS => (sa > sb) as u64,
        BinaryOp::LeU => (a <= b) as u64,
        BinaryOp::LeS => (sa <= sb) as u64,
        BinaryOp::GeU => (a >= b) as u64,
        BinaryOp::GeS => (sa >= sb) as u64,
    };
    Some(mask(res, width))
}

impl SymVal {
    pub(crate) fn constant(value: u64, width: u32) -> SymExpr {
        Rc::new(SymVal::Const {
            value: mask(value, width),
            width,
        })
    }

    pub(crate) fn symbol(name: impl Into<String>, width: u32) -> SymExpr {
        Rc::new(SymVal::Symbol {
            name: name.into(),
            width,
        })
    }

    pub(crate) fn as_const(&self) -> Option<u64> {
        match self {
            SymVal::Const { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub(crate) fn width(&self) -> u32 {
        match self {
            SymVal::Const { width, .. } | SymVal::Symbol { width, .. } => *width,
            SymVal::Unary(op, val) => op.result_width(val.width()),
            SymVal::Binary(op, a, _) => {
                if op.is_relational() {
                    32
                } else {
                    a.width()
                }
            }
            SymVal::Select { a, .. } => a.width(),
            SymVal::ExtractByte { .. } => 8,
            SymVal::CombineBytes(bytes) => 8 * bytes.len() as u32,
            SymVal::Extend { width, .. } => *width,
        }
    }

    pub(crate) fn unary(op: UnaryOp, val: SymExpr) -> SymExpr {
        if let Some(v) = val.as_const() {
            let width = op.result_width(val.width());
            return Self::constant(apply_unary(op, v, val.width()), width);
        }
        // eqz(x != 0) == (x == 0), used by negated branch conditions
        if let (UnaryOp::Eqz, SymVal::Binary(BinaryOp::Ne, x, zero)) = (op, &*val) {
            if zero.as_const() == Some(0) {
                return Self::binary(BinaryOp::Eq, x.clone(), zero.clone());
            }
        }
        Rc::new(SymVal::Unary(op, val))
    }

    pub(crate) fn binary(op: BinaryOp, a: SymExpr, b: SymExpr) -> SymExpr {
        let width = a.width();
        if let (Some(x), Some(y)) = (a.as_const(), b.as_const()) {
            if let Some(res) = apply_binary(op, x, y, width) {
                let width = if op.is_relational() { 32 } else { width };
                return Self::constant(res, width);
            }
        }
        match (op, b.as_const()) {
            (BinaryOp::Add | BinaryOp::Sub | BinaryOp::Or | BinaryOp::Xor, Some(0)) => return a,
            (BinaryOp::Mul, Some(1)) => return a,
            // a relational result is already 0/1
            (BinaryOp::Ne, Some(0)) if Self::is_boolean(&a) => return a,
            _ => {}
        }
        Rc::new(SymVal::Binary(op, a, b))
    }

    fn is_boolean(val: &SymVal) -> bool {
        match val {
            SymVal::Binary(op, ..) => op.is_relational(),
            SymVal::Unary(UnaryOp::Eqz, _) => true,
            _ => false,
        }
    }

    pub(crate) fn select(condition: SymExpr, a: SymExpr, b: SymExpr) -> SymExpr {
        match condition.as_const() {
            Some(0) => b,
            Some(_) => a,
            None if a == b => a,
            None => Rc::new(SymVal::Select { condition, a, b }),
        }
    }

    pub(crate) fn extract_byte(val: SymExpr, byte_index: u32) -> SymExpr {
        if let Some(v) = val.as_const() {
            return Self::constant(v >> (8 * byte_index), 8);
        }
        if let SymVal::CombineBytes(bytes) = &*val {
            if let Some(byte) = bytes.get(byte_index as usize) {
                return byte.clone();
            }
        }
        if val.width() == 8 && byte_index == 0 {
            return val;
        }
        Rc::new(SymVal::ExtractByte { val, byte_index })
    }

    pub(crate) fn combine_bytes(bytes: Vec<SymExpr>) -> SymExpr {
        if bytes.len() == 1 {
            return bytes[0].clone();
        }
        if bytes.iter().all(|b| b.as_const().is_some()) {
            let value = bytes
                .iter()
                .enumerate()
                .fold(0u64, |acc, (i, b)| acc | (b.as_const().unwrap_or(0) << (8 * i)));
            return Self::constant(value, 8 * bytes.len() as u32);
        }
        // recombining all bytes of one value yields that value
        if let Some(SymVal::ExtractByte { val, .. }) = bytes.first().map(|b| &**b) {
            let whole = val.width() == 8 * bytes.len() as u32
                && bytes.iter().enumerate().all(|(i, b)| {
                    matches!(&**b, SymVal::ExtractByte { val: v, byte_index } if v == val && *byte_index == i as u32)
                });
            if whole {
                return val.clone();
            }
        }
        Rc::new(SymVal::CombineBytes(bytes))
    }

    pub(crate) fn extend(val: SymExpr, width: u32, signed: bool) -> SymExpr {
        let from = val.width();
        if from == width {
            return val;
        }
        if let Some(v) = val.as_const() {
            let v = if signed {
                sign_extend(v, from) as u64
            } else {
                v
            };
            return Self::constant(v, width);
        }
        Rc::new(SymVal::Extend { val, width, signed })
    }

    /// Evaluate with `lookup` supplying values for symbols or whole subterms.
    /// `None` when an unbound symbol is reached or the expression traps.
    pub(crate) fn eval_with(&self, lookup: &dyn Fn(&SymVal) -> Option<u64>) -> Option<u64> {
        if let Some(v) = lookup(self) {
            return Some(mask(v, self.width()));
        }
        self.eval_children(lookup)
    }

    /// Like `eval_with`, but never consults `lookup` for `self`.
    pub(crate) fn eval_children(&self, lookup: &dyn Fn(&SymVal) -> Option<u64>) -> Option<u64> {
        Some(match self {
            SymVal::Const { value, .. } => *value,
            SymVal::Symbol { .. } => return None,
            SymVal::Unary(op, val) => apply_unary(*op, val.eval_with(lookup)?, val.width()),
            SymVal::Binary(op, a, b) => {
                apply_binary(*op, a.eval_with(lookup)?, b.eval_with(lookup)?, a.width())?
            }
            SymVal::Select { condition, a, b } => {
                if condition.eval_with(lookup)? != 0 {
                    a.eval_with(lookup)?
                } else {
                    b.eval_with(lookup)?
                }
            }
            SymVal::ExtractByte { val, byte_index } => {
                mask(val.eval_with(lookup)? >> (8 * byte_index), 8)
            }
            SymVal::CombineBytes(bytes) => {
                let mut acc = 0u64;
                for (i, b) in bytes.iter().enumerate() {
                    acc |= b.eval_with(lookup)? << (8 * i);
                }
                acc
            }
            SymVal::Extend { val, width, signed } => {
                let v = val.eval_with(lookup)?;
                let v = if *signed {
                    sign_extend(v, val.width()) as u64
                } else {
                    v
                };
                mask(v, *width)
            }
        })
    }

    /// Symbols occurring in the expression, with their widths.
    pub(crate) fn collect_symbols(&self, out: &mut Vec<(String, u32)>) {
        match self {
            SymVal::Const { .. } => {}
            SymVal::Symbol { name, width } => {
                if !out.iter().any(|(n, _)| n == name) {
                    out.push((name.clone(), *width));
                }
            }
            SymVal::Unary(_, v) | SymVal::ExtractByte { val: v, .. } | SymVal::Extend { val: v, .. } => {
                v.collect_symbols(out)
            }
            SymVal::Binary(_, a, b) => {
                a.collect_symbols(out);
                b.collect_symbols(out);
            }
            SymVal::Select { condition, a, b } => {
                condition.collect_symbols(out);
                a.collect_symbols(out);
                b.collect_symbols(out);
            }
            SymVal::CombineBytes(bytes) => bytes.iter().for_each(|b| b.collect_symbols(out)),
        }
    }
}

impl fmt::Display for SymVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymVal::Const { value, width } => write!(f, "{}", sign_extend(*value, *width)),
            SymVal::Symbol { name, .. } => f.write_str(name),
            SymVal::Unary(op, val) => write!(f, "{}({val})", op.name()),
            SymVal::Binary(op, a, b) => write!(f, "({a} {} {b})", op.symbol()),
            SymVal::Select { condition, a, b } => write!(f, "select({condition}, {a}, {b})"),
            SymVal::ExtractByte { val, byte_index } => write!(f, "{val}[{byte_index}]"),
            SymVal::CombineBytes(bytes) => {
                f.write_str("bytes(")?;
                for (i, b) in bytes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{b}")?;
                }
                f.write_str(")")
            }
            SymVal::Extend { val, width, signed } => {
                write!(f, "{}ext{width}({val})", if *signed { 's' } else { 'z' })
            }
        }
    }
}
