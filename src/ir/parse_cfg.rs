use crate::error::AnalysisError;
use crate::{HashMap, HashSet};

use wasmparser::Operator;

use super::InsnIdx;

// cfg analysis
#[derive(Debug, Clone, Copy)]
enum StackEntry {
    If(InsnIdx),
    Block(InsnIdx),
    Loop(InsnIdx),
}

/// How control leaves the instruction that closes a basic block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BlockExit {
    // `if`: taken is the then-body, `br_if`: taken is the label target
    Conditional { taken: InsnIdx, not_taken: InsnIdx },
    // `br`, `else`
    Jump(InsnIdx),
    Table { targets: Vec<InsnIdx>, default: InsnIdx },
    // `return`, `unreachable`
    Halt,
}

#[derive(Debug, Clone)]
pub(crate) struct FuncCFG {
    pub bb_starts: Vec<InsnIdx>,
    pub exits: HashMap<InsnIdx, BlockExit>,
    pub end_idx: InsnIdx,
}

fn malformed(msg: impl std::fmt::Display, offset: usize) -> AnalysisError {
    AnalysisError::MalformedModule(format!("{msg} (at offset {offset:#x})"))
}

impl FuncCFG {
    pub fn parse_func(body: &wasmparser::FunctionBody) -> Result<Self, AnalysisError> {
        // pass 1: match structured instructions with their `else`/`end`
        let mut cfg_stack = Vec::new();
        let mut if_elses = HashMap::<InsnIdx, InsnIdx>::default();
        let mut ends = HashMap::<InsnIdx, InsnIdx>::default();
        let mut end_idx = None;
        for (ip, el) in body.get_operators_reader()?.into_iter_with_offsets().enumerate() {
            let ip = InsnIdx(ip as u32);
            let (op, offset) = el?;
            if end_idx.is_some() {
                return Err(malformed("operators after function end", offset));
            }
            match op {
                Operator::If { .. } => cfg_stack.push(StackEntry::If(ip)),
                Operator::Block { .. } => cfg_stack.push(StackEntry::Block(ip)),
                Operator::Loop { .. } => cfg_stack.push(StackEntry::Loop(ip)),
                Operator::Else => match cfg_stack.last() {
                    Some(StackEntry::If(source)) => {
                        if_elses.insert(*source, ip);
                    }
                    _ => return Err(malformed("`else` outside of `if`", offset)),
                },
                Operator::End => match cfg_stack.pop() {
                    Some(StackEntry::If(source) | StackEntry::Block(source) | StackEntry::Loop(source)) => {
                        ends.insert(source, ip);
                    }
                    None => end_idx = Some(ip),
                },
                _ => {}
            }
        }
        let Some(end_idx) = end_idx else {
            return Err(malformed("function body is missing its final `end`", 0));
        };

        // pass 2: resolve label targets
        let label_target = |stack: &[StackEntry], depth: u32, offset: usize| {
            let depth = depth as usize;
            if depth == stack.len() {
                return Ok(end_idx);
            }
            match stack.len().checked_sub(depth + 1).map(|i| stack[i]) {
                Some(StackEntry::Loop(source)) => Ok(source),
                Some(StackEntry::Block(source) | StackEntry::If(source)) => Ok(ends[&source]),
                None => Err(malformed(format!("branch depth {depth} out of range"), offset)),
            }
        };
        let mut bb_starts = HashSet::default();
        bb_starts.insert(InsnIdx(0));
        let mut exits = HashMap::default();
        for (ip, el) in body.get_operators_reader()?.into_iter_with_offsets().enumerate() {
            let ip = InsnIdx(ip as u32);
            let (op, offset) = el?;
            let exit = match op {
                Operator::If { .. } => {
                    cfg_stack.push(StackEntry::If(ip));
                    let not_taken = match if_elses.get(&ip) {
                        Some(else_ip) => else_ip.inc(),
                        None => ends[&ip],
                    };
                    Some(BlockExit::Conditional {
                        taken: ip.inc(),
                        not_taken,
                    })
                }
                Operator::Block { .. } => {
                    cfg_stack.push(StackEntry::Block(ip));
                    None
                }
                Operator::Loop { .. } => {
                    cfg_stack.push(StackEntry::Loop(ip));
                    bb_starts.insert(ip);
                    None
                }
                Operator::Else => match cfg_stack.last() {
                    Some(StackEntry::If(source)) => Some(BlockExit::Jump(ends[source])),
                    _ => unreachable!("checked in pass 1"),
                },
                Operator::End => {
                    cfg_stack.pop();
                    None
                }
                Operator::Br { relative_depth } => Some(BlockExit::Jump(label_target(
                    &cfg_stack,
                    relative_depth,
                    offset,
                )?)),
                Operator::BrIf { relative_depth } => Some(BlockExit::Conditional {
                    taken: label_target(&cfg_stack, relative_depth, offset)?,
                    not_taken: ip.inc(),
                }),
                Operator::BrTable { targets } => {
                    let mut table = Vec::new();
                    for depth in targets.targets() {
                        table.push(label_target(&cfg_stack, depth?, offset)?);
                    }
                    Some(BlockExit::Table {
                        targets: table,
                        default: label_target(&cfg_stack, targets.default(), offset)?,
                    })
                }
                Operator::Return | Operator::Unreachable => Some(BlockExit::Halt),
                _ => None,
            };
            let Some(exit) = exit else {
                continue;
            };
            match &exit {
                BlockExit::Conditional { taken, not_taken } => {
                    bb_starts.insert(*taken);
                    bb_starts.insert(*not_taken);
                }
                BlockExit::Jump(target) => {
                    bb_starts.insert(*target);
                }
                BlockExit::Table { targets, default } => {
                    bb_starts.extend(targets.iter().copied());
                    bb_starts.insert(*default);
                }
                BlockExit::Halt => {}
            }
            if ip < end_idx {
                bb_starts.insert(ip.inc());
            }
            exits.insert(ip, exit);
        }

        let mut bb_starts: Vec<InsnIdx> = bb_starts.into_iter().collect();
        bb_starts.sort();
        Ok(Self {
            bb_starts,
            exits,
            end_idx,
        })
    }

    /// `(start, last)` instruction ranges of all basic blocks, in order.
    pub(crate) fn block_ranges(&self) -> impl Iterator<Item = (InsnIdx, InsnIdx)> + '_ {
        self.bb_starts.iter().enumerate().map(|(i, start)| {
            let last = self
                .bb_starts
                .get(i + 1)
                .map(|next| InsnIdx(next.0 - 1))
                .unwrap_or(self.end_idx);
            (*start, last)
        })
    }
}
