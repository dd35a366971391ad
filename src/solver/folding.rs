//! Solver that needs no external library: constant folding plus propagation of
//! `term == constant` and unsigned `term <op> constant` facts. It only answers
//! `Unsat` on a real contradiction.

use std::rc::Rc;

use super::{Model, SatResult, SatSolver};
use crate::HashMap;
use crate::symbolic::{BinaryOp, SymExpr, SymVal, UnaryOp, mask};

#[derive(Debug, Default)]
pub(crate) struct FoldingSolver {
    queries: usize,
}

// Inclusive unsigned bounds per term. `lo == hi` pins the term to a value.
#[derive(Debug, Default)]
struct Facts(HashMap<SymExpr, (u64, u64)>);

// A fact set became empty.
struct Contradiction;

impl Facts {
    fn narrow(&mut self, term: &SymExpr, lo: u64, hi: u64) -> Result<(), Contradiction> {
        let max = mask(u64::MAX, term.width());
        let range = self.0.entry(Rc::clone(term)).or_insert((0, max));
        range.0 = range.0.max(lo);
        range.1 = range.1.min(hi);
        if range.0 > range.1 {
            return Err(Contradiction);
        }
        Ok(())
    }

    fn value_of(&self, val: &SymVal) -> Option<u64> {
        match self.0.get(val) {
            Some(&(lo, hi)) if lo == hi => Some(lo),
            _ => None,
        }
    }

    fn lower_bound(&self, val: &SymVal) -> u64 {
        self.0.get(val).map_or(0, |&(lo, _)| lo)
    }
}

fn negated(op: BinaryOp) -> Option<BinaryOp> {
    use BinaryOp::*;
    Some(match op {
        Eq => Ne,
        Ne => Eq,
        LtU => GeU,
        GeU => LtU,
        GtU => LeU,
        LeU => GtU,
        LtS => GeS,
        GeS => LtS,
        GtS => LeS,
        LeS => GtS,
        _ => return None,
    })
}

// `k op x` as `x op' k`
fn swapped(op: BinaryOp) -> BinaryOp {
    use BinaryOp::*;
    match op {
        LtU => GtU,
        GtU => LtU,
        LeU => GeU,
        GeU => LeU,
        LtS => GtS,
        GtS => LtS,
        LeS => GeS,
        GeS => LeS,
        other => other,
    }
}

// Record what `x op k` says about `x`.
fn learn_comparison(
    facts: &mut Facts,
    op: BinaryOp,
    x: &SymExpr,
    k: u64,
) -> Result<(), Contradiction> {
    let max = mask(u64::MAX, x.width());
    match op {
        BinaryOp::Eq => facts.narrow(x, k, k),
        BinaryOp::Ne if k == 0 => facts.narrow(x, 1, max),
        BinaryOp::Ne if k == max => facts.narrow(x, 0, max - 1),
        BinaryOp::LtU => match k.checked_sub(1) {
            Some(hi) => facts.narrow(x, 0, hi),
            None => Err(Contradiction),
        },
        BinaryOp::LeU => facts.narrow(x, 0, k),
        BinaryOp::GtU if k == max => Err(Contradiction),
        BinaryOp::GtU => facts.narrow(x, k + 1, max),
        BinaryOp::GeU => facts.narrow(x, k, max),
        // `!=` inside the range and signed bounds are checked by evaluation only
        _ => Ok(()),
    }
}

// Record what `expr != 0` (`holds`) or `expr == 0` (`!holds`) says.
fn learn(facts: &mut Facts, expr: &SymExpr, holds: bool) -> Result<(), Contradiction> {
    if let Some(v) = expr.as_const() {
        return if (v != 0) == holds {
            Ok(())
        } else {
            Err(Contradiction)
        };
    }
    if let SymVal::Unary(UnaryOp::Eqz, x) = &**expr {
        return learn(facts, x, !holds);
    }
    if let SymVal::Binary(op, a, b) = &**expr {
        if op.is_relational() {
            let op = if holds {
                Some(*op)
            } else {
                negated(*op)
            };
            let term = match (op, a.as_const(), b.as_const()) {
                (Some(op), None, Some(k)) => Some((op, a, k)),
                (Some(op), Some(k), None) => Some((swapped(op), b, k)),
                _ => None,
            };
            if let Some((op, x, k)) = term {
                learn_comparison(facts, op, x, k)?;
            }
            // the comparison itself is a 0/1 term
            let v = holds as u64;
            return facts.narrow(expr, v, v);
        }
    }
    if holds {
        facts.narrow(expr, 1, mask(u64::MAX, expr.width()))
    } else {
        facts.narrow(expr, 0, 0)
    }
}

fn collect_facts(constraints: &[SymExpr]) -> Option<Facts> {
    let mut facts = Facts::default();
    for constraint in constraints {
        learn(&mut facts, constraint, true).ok()?;
    }
    Some(facts)
}

impl FoldingSolver {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn evaluate(constraints: &[SymExpr], facts: &Facts) -> SatResult {
        let lookup = |val: &SymVal| match val {
            SymVal::Const { .. } => None,
            _ => facts.value_of(val),
        };
        // facts must agree with what their own subterms evaluate to
        for (term, &(lo, hi)) in &facts.0 {
            if let Some(v) = term.eval_children(&lookup) {
                if v < lo || v > hi {
                    return SatResult::Unsat;
                }
            }
        }
        if constraints
            .iter()
            .any(|c| c.eval_with(&lookup) == Some(0))
        {
            return SatResult::Unsat;
        }
        // only a full assignment of the symbols proves satisfiability
        let symbols_only = |val: &SymVal| match val {
            SymVal::Symbol { .. } => facts.value_of(val),
            _ => None,
        };
        if constraints
            .iter()
            .all(|c| c.eval_with(&symbols_only).is_some_and(|v| v != 0))
        {
            SatResult::Sat
        } else {
            SatResult::Unknown
        }
    }
}

impl SatSolver for FoldingSolver {
    fn name(&self) -> &'static str {
        "builtin"
    }

    fn check(&mut self, constraints: &[SymExpr]) -> SatResult {
        self.queries += 1;
        let res = match collect_facts(constraints) {
            None => SatResult::Unsat,
            Some(facts) => Self::evaluate(constraints, &facts),
        };
        tracing::trace!(query = self.queries, constraints = constraints.len(), ?res);
        res
    }

    fn model(&mut self, constraints: &[SymExpr]) -> Option<Model> {
        let mut facts = collect_facts(constraints)?;
        // every symbol takes the smallest value its facts allow
        let mut symbols = Vec::new();
        for c in constraints {
            c.collect_symbols(&mut symbols);
        }
        for (name, width) in symbols {
            let symbol = SymVal::symbol(name, width);
            let lo = facts.lower_bound(&symbol);
            facts.narrow(&symbol, lo, lo).ok()?;
        }
        if Self::evaluate(constraints, &facts) != SatResult::Sat {
            return None;
        }
        let mut model = Model::default();
        for (term, &(value, _)) in &facts.0 {
            if let SymVal::Symbol { name, .. } = &**term {
                model.insert(name.clone(), value);
            }
        }
        Some(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x() -> SymExpr {
        SymVal::symbol("x", 32)
    }

    fn eq(a: SymExpr, k: u64) -> SymExpr {
        SymVal::binary(BinaryOp::Eq, a, SymVal::constant(k, 32))
    }

    #[test]
    fn contradicting_equalities_are_unsat() {
        let mut solver = FoldingSolver::new();
        assert_eq!(solver.check(&[eq(x(), 1), eq(x(), 2)]), SatResult::Unsat);
        assert_eq!(solver.check(&[eq(x(), 1), eq(x(), 1)]), SatResult::Sat);
    }

    #[test]
    fn negated_branch_guard() {
        let mut solver = FoldingSolver::new();
        let guard = eq(x(), 1);
        let negated = SymVal::unary(UnaryOp::Eqz, guard.clone());
        assert_eq!(solver.check(&[guard, negated]), SatResult::Unsat);
    }

    #[test]
    fn derived_terms_are_evaluated() {
        let mut solver = FoldingSolver::new();
        let sum = SymVal::binary(BinaryOp::Add, x(), SymVal::constant(1, 32));
        assert_eq!(solver.check(&[eq(x(), 4), eq(sum.clone(), 5)]), SatResult::Sat);
        assert_eq!(solver.check(&[eq(x(), 4), eq(sum, 7)]), SatResult::Unsat);
    }

    #[test]
    fn unknown_when_unconstrained() {
        let mut solver = FoldingSolver::new();
        let lt = SymVal::binary(BinaryOp::LtU, x(), SymVal::constant(10, 32));
        let mul = SymVal::binary(BinaryOp::Mul, x(), x());
        assert_eq!(solver.check(&[lt, eq(mul, 9)]), SatResult::Unknown);
        assert_eq!(solver.check(&[SymVal::constant(0, 32)]), SatResult::Unsat);
        assert_eq!(solver.check(&[]), SatResult::Sat);
    }

    #[test]
    fn model_binds_symbols() {
        let mut solver = FoldingSolver::new();
        let model = solver.model(&[eq(x(), 3)]).unwrap();
        assert_eq!(model.get("x"), Some(3));
        assert!(solver.model(&[eq(x(), 3), eq(x(), 4)]).is_none());
    }

    #[test]
    fn unsigned_ranges_are_intersected() {
        let mut solver = FoldingSolver::new();
        let lt5 = SymVal::binary(BinaryOp::LtU, x(), SymVal::constant(5, 32));
        let gt10 = SymVal::binary(BinaryOp::GtU, x(), SymVal::constant(10, 32));
        assert_eq!(solver.check(&[lt5.clone(), gt10.clone()]), SatResult::Unsat);
        // the negated guard keeps the range open
        let not_gt10 = SymVal::unary(UnaryOp::Eqz, gt10);
        assert_eq!(solver.check(&[lt5.clone(), not_gt10]), SatResult::Unknown);
        // constant on the left
        let k_le_x = SymVal::binary(BinaryOp::LeU, SymVal::constant(7, 32), x());
        assert_eq!(solver.check(&[lt5.clone(), k_le_x]), SatResult::Unsat);
        assert_eq!(solver.check(&[lt5, eq(x(), 9)]), SatResult::Unsat);
        let below_zero = SymVal::binary(BinaryOp::LtU, x(), SymVal::constant(0, 32));
        assert_eq!(solver.check(&[below_zero]), SatResult::Unsat);
    }

    #[test]
    fn model_takes_the_lower_bound() {
        let mut solver = FoldingSolver::new();
        let ge = SymVal::binary(BinaryOp::GeU, x(), SymVal::constant(3, 32));
        let model = solver.model(&[ge]).unwrap();
        assert_eq!(model.get("x"), Some(3));
        let nonzero = SymVal::binary(BinaryOp::Ne, x(), SymVal::constant(0, 32));
        assert_eq!(solver.model(&[nonzero]).unwrap().get("x"), Some(1));
    }
}
