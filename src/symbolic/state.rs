use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use super::expr::{SymExpr, SymVal};
use crate::error::PathError;

pub(crate) const WASM_PAGE_SIZE: u64 = 0x10000;
const MAX_PAGES: u32 = 0x10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum TrapKind {
    Unreachable,
    MemoryOutOfBounds,
    DivisionByZero,
    IntegerOverflow,
}

impl fmt::Display for TrapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrapKind::Unreachable => "unreachable executed",
            TrapKind::MemoryOutOfBounds => "out-of-bounds memory access",
            TrapKind::DivisionByZero => "integer division by zero",
            TrapKind::IntegerOverflow => "integer overflow",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StateStatus {
    Running,
    Returned,
    Trapped(TrapKind),
    // exit code, when it is concrete
    Exited(Option<u64>),
}

impl StateStatus {
    pub(crate) fn is_running(&self) -> bool {
        matches!(self, StateStatus::Running)
    }
}

impl fmt::Display for StateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateStatus::Running => f.write_str("running"),
            StateStatus::Returned => f.write_str("returned"),
            StateStatus::Trapped(kind) => write!(f, "trapped: {kind}"),
            StateStatus::Exited(Some(code)) => write!(f, "exited with {code}"),
            StateStatus::Exited(None) => f.write_str("exited with symbolic code"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum HazardKind {
    DivisionByZero,
    IntegerOverflow,
}

/// A condition under which the path would have trapped, recorded for detectors.
#[derive(Debug, Clone)]
pub(crate) struct Hazard {
    pub kind: HazardKind,
    pub condition: SymExpr,
    // number of path constraints in force when the hazard was recorded
    pub constraints_len: usize,
    pub instruction: String,
    pub offset: usize,
}

/// Linear memory: bytes written on this path over the module's data segments.
#[derive(Debug, Clone)]
pub(crate) struct Memory {
    image: Rc<BTreeMap<u32, u8>>,
    written: BTreeMap<u32, SymExpr>,
    pages: u32,
}

impl Memory {
    pub(crate) fn new(image: Rc<BTreeMap<u32, u8>>, pages: u32) -> Self {
        Self {
            image,
            written: BTreeMap::new(),
            pages,
        }
    }

    pub(crate) fn pages(&self) -> u32 {
        self.pages
    }

    pub(crate) fn size_bytes(&self) -> u64 {
        self.pages as u64 * WASM_PAGE_SIZE
    }

    fn in_bounds(&self, addr: u64, len: u64) -> bool {
        addr.checked_add(len).is_some_and(|end| end <= self.size_bytes())
    }

    /// Little-endian bytes at `addr`, `None` when the access is out of bounds.
    pub(crate) fn load(&self, addr: u64, len: u32) -> Option<Vec<SymExpr>> {
        if !self.in_bounds(addr, len as u64) {
            return None;
        }
        Some(
            (0..len)
                .map(|i| {
                    let a = (addr + i as u64) as u32;
                    match self.written.get(&a) {
                        Some(byte) => byte.clone(),
                        None => SymVal::constant(self.image.get(&a).copied().unwrap_or(0) as u64, 8),
                    }
                })
                .collect(),
        )
    }

    /// `false` when the access is out of bounds, memory is left untouched then.
    #[must_use]
    pub(crate) fn store(&mut self, addr: u64, bytes: Vec<SymExpr>) -> bool {
        if !self.in_bounds(addr, bytes.len() as u64) {
            return false;
        }
        for (i, byte) in bytes.into_iter().enumerate() {
            self.written.insert((addr + i as u64) as u32, byte);
        }
        true
    }

    /// Returns the previous size in pages, `None` when the limit would be exceeded.
    pub(crate) fn grow(&mut self, delta: u32) -> Option<u32> {
        let old = self.pages;
        let new = old.checked_add(delta).filter(|p| *p <= MAX_PAGES)?;
        self.pages = new;
        Some(old)
    }

    pub(crate) fn written(&self) -> impl Iterator<Item = (u32, &SymExpr)> + '_ {
        self.written.iter().map(|(a, b)| (*a, b))
    }
}

/// Abstract machine state along one path. `Clone` is the fork operation.
#[derive(Debug, Clone)]
pub(crate) struct SymbolicState {
    pub stack: Vec<SymExpr>,
    // `None` until the first write
    pub locals: Vec<Option<SymExpr>>,
    pub globals: Vec<Option<SymExpr>>,
    pub memory: Memory,
    pub constraints: Vec<SymExpr>,
    pub current_func: String,
    // offset and text of the most recently emulated instruction
    pub last_instruction: Option<(usize, String)>,
    pub status: StateStatus,
    pub hazards: Vec<Hazard>,
    pub return_value: Option<SymExpr>,
    next_symbol: u32,
}

impl SymbolicState {
    pub(crate) fn new(current_func: impl Into<String>, memory: Memory) -> Self {
        Self {
            stack: Vec::new(),
            locals: Vec::new(),
            globals: Vec::new(),
            memory,
            constraints: Vec::new(),
            current_func: current_func.into(),
            last_instruction: None,
            status: StateStatus::Running,
            hazards: Vec::new(),
            return_value: None,
            next_symbol: 0,
        }
    }

    /// A state without memory, globals or locals, for driving the engine directly.
    #[cfg(test)]
    pub(crate) fn blank(current_func: impl Into<String>) -> Self {
        Self::new(current_func, Memory::new(Rc::default(), 0))
    }

    pub(crate) fn fresh_symbol(&mut self, prefix: &str, width: u32) -> SymExpr {
        let n = self.next_symbol;
        self.next_symbol += 1;
        SymVal::symbol(format!("{prefix}_{n}"), width)
    }

    pub(crate) fn push(&mut self, val: SymExpr) {
        self.stack.push(val);
    }

    pub(crate) fn pop(&mut self, at: &str) -> Result<SymExpr, PathError> {
        self.stack
            .pop()
            .ok_or_else(|| PathError::StackUnderflow(at.to_owned()))
    }

    pub(crate) fn peek(&self, at: &str) -> Result<&SymExpr, PathError> {
        self.stack
            .last()
            .ok_or_else(|| PathError::StackUnderflow(at.to_owned()))
    }

    pub(crate) fn local(&self, index: u32) -> Result<SymExpr, PathError> {
        self.locals
            .get(index as usize)
            .cloned()
            .flatten()
            .ok_or(PathError::UninitializedRead {
                kind: "local",
                index,
            })
    }

    pub(crate) fn set_local(&mut self, index: u32, val: SymExpr) -> Result<(), PathError> {
        let slot = self
            .locals
            .get_mut(index as usize)
            .ok_or(PathError::UninitializedRead {
                kind: "local",
                index,
            })?;
        *slot = Some(val);
        Ok(())
    }

    pub(crate) fn global(&self, index: u32) -> Result<SymExpr, PathError> {
        self.globals
            .get(index as usize)
            .cloned()
            .flatten()
            .ok_or(PathError::UninitializedRead {
                kind: "global",
                index,
            })
    }

    pub(crate) fn set_global(&mut self, index: u32, val: SymExpr) -> Result<(), PathError> {
        let slot = self
            .globals
            .get_mut(index as usize)
            .ok_or(PathError::UninitializedRead {
                kind: "global",
                index,
            })?;
        *slot = Some(val);
        Ok(())
    }

    /// Assert `constraint != 0` on this path.
    pub(crate) fn add_constraint(&mut self, constraint: SymExpr) {
        self.constraints.push(constraint);
    }

    pub(crate) fn trap(&mut self, kind: TrapKind) {
        self.status = StateStatus::Trapped(kind);
    }

    /// Leave the function, the return value is whatever sits on top of the stack.
    pub(crate) fn finish_return(&mut self, has_ret: bool) {
        if has_ret {
            self.return_value = self.stack.last().cloned();
        }
        self.status = StateStatus::Returned;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_memory() -> SymbolicState {
        let image: BTreeMap<u32, u8> = [(16, 0xaa), (17, 0xbb)].into_iter().collect();
        SymbolicState::new("f", Memory::new(Rc::new(image), 1))
    }

    #[test]
    fn fork_does_not_share_mutations() {
        let mut a = state_with_memory();
        a.locals = vec![Some(SymVal::constant(1, 32))];
        let mut b = a.clone();
        b.push(SymVal::symbol("x", 32));
        b.set_local(0, SymVal::constant(9, 32)).unwrap();
        assert!(b.memory.store(0, vec![SymVal::constant(5, 8)]));
        b.add_constraint(SymVal::symbol("c", 32));
        assert!(a.stack.is_empty());
        assert_eq!(a.local(0).unwrap().as_const(), Some(1));
        assert_eq!(a.memory.load(0, 1).unwrap()[0].as_const(), Some(0));
        assert!(a.constraints.is_empty());
    }

    #[test]
    fn memory_reads_image_then_writes() {
        let mut s = state_with_memory();
        let bytes = s.memory.load(16, 2).unwrap();
        assert_eq!(SymVal::combine_bytes(bytes).as_const(), Some(0xbbaa));
        assert!(s.memory.store(17, vec![SymVal::constant(0x11, 8)]));
        let bytes = s.memory.load(16, 2).unwrap();
        assert_eq!(SymVal::combine_bytes(bytes).as_const(), Some(0x11aa));
    }

    #[test]
    fn out_of_bounds_access() {
        let mut s = state_with_memory();
        assert!(s.memory.load(WASM_PAGE_SIZE - 2, 4).is_none());
        assert!(!s.memory.store(WASM_PAGE_SIZE, vec![SymVal::constant(0, 8)]));
        assert_eq!(s.memory.grow(1), Some(1));
        assert!(s.memory.load(WASM_PAGE_SIZE - 2, 4).is_some());
    }

    #[test]
    fn uninitialized_reads_are_errors() {
        let mut s = SymbolicState::blank("f");
        s.locals = vec![None];
        assert_eq!(
            s.local(0),
            Err(PathError::UninitializedRead {
                kind: "local",
                index: 0
            })
        );
        assert!(s.global(3).is_err());
        assert!(matches!(s.pop("drop"), Err(PathError::StackUnderflow(_))));
    }
}
