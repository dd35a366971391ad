use std::time::Duration;

use z3::{
    Solver, Symbol,
    ast::{BV, Bool},
};

use super::{Model, SatResult, SatSolver};
use crate::HashMap;
use crate::symbolic::{BinaryOp, SymExpr, SymVal, UnaryOp};

trait BoolHelper {
    fn zero_ext(&self, w: u32) -> BV;
}
impl BoolHelper for Bool {
    fn zero_ext(&self, w: u32) -> BV {
        let sz = w + 1;
        let zero = BV::from_u64(0, sz);
        let one = BV::from_u64(1, sz);
        self.ite(&one, &zero)
    }
}

pub(crate) struct Z3Solver {
    timeout: Option<Duration>,
    // translated nodes, keyed by node address
    cache: HashMap<*const SymVal, BV>,
    // keeps cached nodes alive so addresses stay unique
    pinned: Vec<SymExpr>,
    symbols: HashMap<String, BV>,
}

impl Z3Solver {
    pub(crate) fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            cache: HashMap::default(),
            pinned: Vec::new(),
            symbols: HashMap::default(),
        }
    }

    fn z3_set_timeout(&self) {
        if let Some(timeout) = self.timeout {
            z3::Context::thread_local()
                .update_param_value("timeout", &timeout.as_millis().to_string());
        }
    }

    fn translate(&mut self, expr: &SymExpr) -> BV {
        if let Some(bv) = self.cache.get(&std::rc::Rc::as_ptr(expr)) {
            return bv.clone();
        }
        let bv = match &**expr {
            SymVal::Const { value, width } => BV::from_u64(*value, *width),
            SymVal::Symbol { name, width } => self
                .symbols
                .entry(name.clone())
                .or_insert_with(|| BV::new_const(Symbol::String(name.clone()), *width))
                .clone(),
            SymVal::Unary(op, val) => {
                let val = self.translate(val);
                Self::build_unary(*op, val)
            }
            SymVal::Binary(op, a, b) => {
                let (a, b) = (self.translate(a), self.translate(b));
                Self::build_binary(*op, a, b)
            }
            SymVal::Select { condition, a, b } => {
                let condition = self.translate(condition);
                let (a, b) = (self.translate(a), self.translate(b));
                let width = condition.get_size();
                condition
                    .eq(BV::from_u64(0, width))
                    .not()
                    .ite(&a, &b)
            }
            SymVal::ExtractByte { val, byte_index } => {
                let val = self.translate(val);
                val.extract(8 * byte_index + 7, 8 * byte_index)
            }
            SymVal::CombineBytes(bytes) => {
                let mut bytes = bytes.iter().rev();
                let first = bytes.next().map(|b| self.translate(b));
                let mut acc = first.unwrap_or_else(|| BV::from_u64(0, 8));
                for b in bytes {
                    let b = self.translate(b);
                    acc = acc.concat(&b);
                }
                acc
            }
            SymVal::Extend { val, width, signed } => {
                let from = val.width();
                let val = self.translate(val);
                if *signed {
                    val.sign_ext(width - from)
                } else {
                    val.zero_ext(width - from)
                }
            }
        };
        self.cache.insert(std::rc::Rc::as_ptr(expr), bv.clone());
        self.pinned.push(expr.clone());
        bv
    }

    fn build_unary(op: UnaryOp, val: BV) -> BV {
        let width = val.get_size();
        match op {
            UnaryOp::Clz | UnaryOp::Ctz => {
                let zero = BV::from_u64(0, width);
                let one = BV::from_u64(1, width);
                let one_1 = BV::from_u64(1, 1);
                let mut cnt = zero.clone();
                let mut seen = Bool::from_bool(false);
                for i in 0..width {
                    let i = if matches!(op, UnaryOp::Clz) {
                        width - i - 1
                    } else {
                        i
                    };
                    seen |= &val.extract(i, i).eq(&one_1);
                    cnt += &seen.ite(&zero, &one);
                }
                cnt
            }
            UnaryOp::Popcnt => {
                let mut cnt = BV::from_u64(0, width);
                for i in 0..width {
                    let bit = val.extract(i, i);
                    cnt += &bit.zero_ext(width - 1);
                }
                cnt
            }
            UnaryOp::Eqz => val.eq(BV::from_u64(0, width)).zero_ext(31),
            UnaryOp::I32Extend8S => val.extract(7, 0).sign_ext(24),
            UnaryOp::I32Extend16S => val.extract(15, 0).sign_ext(16),
            UnaryOp::I32WrapI64 => val.extract(31, 0),
            UnaryOp::I64Extend8S => val.extract(7, 0).sign_ext(56),
            UnaryOp::I64Extend16S => val.extract(15, 0).sign_ext(48),
            UnaryOp::I64Extend32S => val.extract(31, 0).sign_ext(32),
            UnaryOp::I64ExtendI32S => val.sign_ext(32),
            UnaryOp::I64ExtendI32U => val.zero_ext(32),
        }
    }

    fn build_binary(op: BinaryOp, a: BV, b: BV) -> BV {
        let shift_amount = || b.bvand(BV::from_u64(a.get_size() as u64 - 1, b.get_size()));
        match op {
            BinaryOp::Add => a.bvadd(&b),
            BinaryOp::Sub => a.bvsub(&b),
            BinaryOp::Mul => a.bvmul(&b),
            BinaryOp::DivS => a.bvsdiv(&b),
            BinaryOp::DivU => a.bvudiv(&b),
            BinaryOp::RemS => a.bvsrem(&b),
            BinaryOp::RemU => a.bvurem(&b),
            BinaryOp::And => a.bvand(&b),
            BinaryOp::Or => a.bvor(&b),
            BinaryOp::Xor => a.bvxor(&b),
            BinaryOp::Shl => a.bvshl(shift_amount()),
            BinaryOp::ShrS => a.bvashr(shift_amount()),
            BinaryOp::ShrU => a.bvlshr(shift_amount()),
            BinaryOp::Rotl => a.bvrotl(shift_amount()),
            BinaryOp::Rotr => a.bvrotr(shift_amount()),
            BinaryOp::Eq => a.eq(&b).zero_ext(31),
            BinaryOp::Ne => a.eq(&b).not().zero_ext(31),
            BinaryOp::LtU => a.bvult(&b).zero_ext(31),
            BinaryOp::LtS => a.bvslt(&b).zero_ext(31),
            BinaryOp::GtU => a.bvugt(&b).zero_ext(31),
            BinaryOp::GtS => a.bvsgt(&b).zero_ext(31),
            BinaryOp::LeU => a.bvule(&b).zero_ext(31),
            BinaryOp::LeS => a.bvsle(&b).zero_ext(31),
            BinaryOp::GeU => a.bvuge(&b).zero_ext(31),
            BinaryOp::GeS => a.bvsge(&b).zero_ext(31),
        }
    }

    fn assert_all(&mut self, constraints: &[SymExpr]) -> Solver {
        self.z3_set_timeout();
        let solver = Solver::new();
        for constraint in constraints {
            let bv = self.translate(constraint);
            let width = bv.get_size();
            solver.assert(&bv.eq(BV::from_u64(0, width)).not());
        }
        solver
    }
}

impl SatSolver for Z3Solver {
    fn name(&self) -> &'static str {
        "z3"
    }

    fn check(&mut self, constraints: &[SymExpr]) -> SatResult {
        let start = std::time::Instant::now();
        let solver = self.assert_all(constraints);
        let res = match solver.check() {
            z3::SatResult::Sat => SatResult::Sat,
            z3::SatResult::Unsat => SatResult::Unsat,
            z3::SatResult::Unknown => SatResult::Unknown,
        };
        tracing::trace!(?res, elapsed = ?start.elapsed(), "z3 query");
        res
    }

    fn model(&mut self, constraints: &[SymExpr]) -> Option<Model> {
        let solver = self.assert_all(constraints);
        if solver.check() != z3::SatResult::Sat {
            return None;
        }
        let z3_model = solver.get_model()?;
        let mut symbols = Vec::new();
        for c in constraints {
            c.collect_symbols(&mut symbols);
        }
        let mut model = Model::default();
        for (name, _) in symbols {
            let Some(bv) = self.symbols.get(&name) else {
                continue;
            };
            if let Some(value) = z3_model.eval(bv, true).and_then(|v| v.as_u64()) {
                model.insert(name, value);
            }
        }
        Some(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn z3_prunes_contradiction_and_finds_model() {
        let x = SymVal::symbol("x", 32);
        let sum = SymVal::binary(BinaryOp::Add, x.clone(), SymVal::constant(1, 32));
        let lt = SymVal::binary(BinaryOp::LtU, x.clone(), SymVal::constant(3, 32));
        let gt = SymVal::binary(BinaryOp::GtU, x, SymVal::constant(5, 32));
        let mut solver = Z3Solver::new(None);
        assert_eq!(solver.check(&[lt.clone(), gt]), SatResult::Unsat);
        let eq = SymVal::binary(BinaryOp::Eq, sum, SymVal::constant(2, 32));
        let model = solver.model(&[lt, eq]).unwrap();
        assert_eq!(model.get("x"), Some(1));
    }
}
