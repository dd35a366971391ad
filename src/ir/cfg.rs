//! Basic-block graph of a module, read-only once built.

use std::fmt::{self, Write as _};

use wasmparser::FuncType;

use super::operators::{ControlInstruction, Instruction, ParametricInstruction, WFOperator};
use super::parse_cfg::{BlockExit, FuncCFG};
use super::{InsnIdx, ModuleSpec};
use crate::HashMap;
use crate::error::AnalysisError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum EdgeType {
    ConditionalTrue,
    ConditionalFalse,
    Fallthrough,
    Unconditional,
}

impl EdgeType {
    pub(crate) const ALL: [EdgeType; 4] = [
        EdgeType::ConditionalTrue,
        EdgeType::ConditionalFalse,
        EdgeType::Fallthrough,
        EdgeType::Unconditional,
    ];

    pub(crate) fn is_conditional(self) -> bool {
        matches!(self, EdgeType::ConditionalTrue | EdgeType::ConditionalFalse)
    }

    /// Operator token used by the guided prompt.
    pub(crate) fn token(self) -> char {
        match self {
            EdgeType::ConditionalTrue => 'T',
            EdgeType::ConditionalFalse => 'F',
            EdgeType::Fallthrough => 'f',
            EdgeType::Unconditional => 'u',
        }
    }

    pub(crate) fn from_token(token: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|ty| token.len() == 1 && token.starts_with(ty.token()))
    }

    pub(crate) fn other_conditional(self) -> Option<Self> {
        match self {
            EdgeType::ConditionalTrue => Some(EdgeType::ConditionalFalse),
            EdgeType::ConditionalFalse => Some(EdgeType::ConditionalTrue),
            _ => None,
        }
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EdgeType::ConditionalTrue => "conditional_true",
            EdgeType::ConditionalFalse => "conditional_false",
            EdgeType::Fallthrough => "fallthrough",
            EdgeType::Unconditional => "unconditional",
        })
    }
}

/// Outgoing edges of a block in insertion order, at most one per type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Edges(Vec<(EdgeType, String)>);

impl Edges {
    pub(crate) fn get(&self, ty: EdgeType) -> Option<&str> {
        self.0
            .iter()
            .find(|(t, _)| *t == ty)
            .map(|(_, dest)| dest.as_str())
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (EdgeType, &str)> + '_ {
        self.0.iter().map(|(ty, dest)| (*ty, dest.as_str()))
    }

    pub(crate) fn types(&self) -> impl Iterator<Item = EdgeType> + '_ {
        self.0.iter().map(|(ty, _)| *ty)
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct BasicBlock {
    pub name: String,
    pub instructions: Vec<Instruction>,
    pub edges: Edges,
}

#[derive(Debug, Clone)]
struct FunctionInfo {
    name: String,
    ty: FuncType,
    blocks: Vec<String>,
}

#[derive(Debug, Default)]
pub(crate) struct ControlFlowGraph {
    functions: Vec<FunctionInfo>,
    function_index: HashMap<String, usize>,
    blocks: HashMap<String, BasicBlock>,
}

impl ControlFlowGraph {
    pub(crate) fn functions(&self) -> impl Iterator<Item = &str> + '_ {
        self.functions.iter().map(|f| f.name.as_str())
    }

    fn function(&self, function: &str) -> Result<&FunctionInfo, AnalysisError> {
        self.function_index
            .get(function)
            .map(|&i| &self.functions[i])
            .ok_or_else(|| AnalysisError::UnknownFunction(function.to_owned()))
    }

    pub(crate) fn blocks_of(&self, function: &str) -> Result<&[String], AnalysisError> {
        Ok(&self.function(function)?.blocks)
    }

    pub(crate) fn entry_block(&self, function: &str) -> Result<&str, AnalysisError> {
        self.blocks_of(function)?
            .first()
            .map(String::as_str)
            .ok_or_else(|| AnalysisError::MissingEntryBlock(function.to_owned()))
    }

    pub(crate) fn signature_of(&self, function: &str) -> Result<&FuncType, AnalysisError> {
        Ok(&self.function(function)?.ty)
    }

    pub(crate) fn block(&self, name: &str) -> Option<&BasicBlock> {
        self.blocks.get(name)
    }

    // Block names are validated at build time, lookups of unknown names yield nothing.
    pub(crate) fn edges_of(&self, block: &str) -> &Edges {
        static NONE: Edges = Edges(Vec::new());
        self.blocks.get(block).map(|b| &b.edges).unwrap_or(&NONE)
    }

    pub(crate) fn instructions_of(&self, block: &str) -> &[Instruction] {
        self.blocks
            .get(block)
            .map(|b| b.instructions.as_slice())
            .unwrap_or_default()
    }

    pub(crate) fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn num_edges(&self) -> usize {
        self.blocks.values().map(|b| b.edges.len()).sum()
    }

    /// Lower every defined function of `module` into basic blocks.
    pub(crate) fn from_module(module: &ModuleSpec) -> Result<Self, AnalysisError> {
        let mut builder = CfgBuilder::new();
        for func in &module.functions {
            let Some(func_cfg) = &func.cfg else {
                continue;
            };
            builder.function(&func.symbol, func.ty.clone());
            lower_function(&mut builder, func.idx, &func.symbol, &func.instructions, func_cfg);
        }
        builder.build()
    }

    /// Graphviz rendering of one function's blocks and edges.
    pub(crate) fn to_dot(&self, function: &str) -> Result<String, AnalysisError> {
        let mut out = String::new();
        let _ = writeln!(out, "digraph {:?} {{", function);
        for name in self.blocks_of(function)? {
            let Some(block) = self.block(name) else {
                continue;
            };
            let mut label = format!("{name}\n");
            for insn in &block.instructions {
                let _ = writeln!(label, "{:#x}: {}", insn.offset, insn.text);
            }
            let _ = writeln!(out, "  {name:?} [shape=box,label={label:?}];");
            for (ty, dest) in block.edges.iter() {
                let color = match ty {
                    EdgeType::ConditionalTrue => "green",
                    EdgeType::ConditionalFalse => "red",
                    EdgeType::Fallthrough | EdgeType::Unconditional => "black",
                };
                let _ = writeln!(out, "  {name:?} -> {dest:?} [label=\"{ty}\",color={color}];");
            }
        }
        out.push_str("}\n");
        Ok(out)
    }
}

pub(crate) fn block_name(func_idx: u32, ip: InsnIdx) -> String {
    format!("block_{func_idx}_{ip}")
}

fn lower_function(
    builder: &mut CfgBuilder,
    func_idx: u32,
    symbol: &str,
    instructions: &[Instruction],
    func_cfg: &FuncCFG,
) {
    let name = |ip: InsnIdx| block_name(func_idx, ip);
    for (start, last) in func_cfg.block_ranges() {
        let insns = instructions[start.i()..=last.i()].to_vec();
        let this = name(start);
        let mut edges = Vec::new();
        match func_cfg.exits.get(&last) {
            Some(BlockExit::Conditional { taken, not_taken }) => {
                edges.push((EdgeType::ConditionalTrue, name(*taken)));
                edges.push((EdgeType::ConditionalFalse, name(*not_taken)));
            }
            Some(BlockExit::Jump(target)) => {
                edges.push((EdgeType::Unconditional, name(*target)));
            }
            Some(BlockExit::Halt) => {}
            Some(BlockExit::Table { targets, default }) => {
                let offset = instructions[last.i()].offset;
                let case_name = |i: usize| format!("{this}_case{i}");
                let default_name = format!("{this}_default");
                let first = if targets.is_empty() {
                    default_name.clone()
                } else {
                    case_name(0)
                };
                edges.push((EdgeType::Unconditional, first));
                for (i, target) in targets.iter().enumerate() {
                    let next = if i + 1 < targets.len() {
                        case_name(i + 1)
                    } else {
                        default_name.clone()
                    };
                    let case = Instruction::new(
                        offset,
                        WFOperator::Control(ControlInstruction::BrTableCase { case: i as u32 }),
                        format!("br_table.case {i}"),
                    );
                    builder.block(
                        symbol,
                        &case_name(i),
                        vec![case],
                        vec![
                            (EdgeType::ConditionalTrue, name(*target)),
                            (EdgeType::ConditionalFalse, next),
                        ],
                    );
                }
                let drop = Instruction::new(
                    offset,
                    WFOperator::Parametric(ParametricInstruction::Drop),
                    "drop",
                );
                builder.block(
                    symbol,
                    &default_name,
                    vec![drop],
                    vec![(EdgeType::Unconditional, name(*default))],
                );
            }
            None if last == func_cfg.end_idx => {}
            None => edges.push((EdgeType::Fallthrough, name(last.inc()))),
        }
        builder.block(symbol, &this, insns, edges);
    }
    // entry first, synthetic blocks after the block that owns them
    builder.sort_function_blocks(symbol, |a, b| {
        let key = |n: &str| {
            let mut parts = n.trim_start_matches("block_").split('_').skip(1);
            let ip = parts.next().and_then(|p| p.parse::<u32>().ok()).unwrap_or(u32::MAX);
            (ip, n.len())
        };
        key(a).cmp(&key(b))
    });
}

/// Collects functions and blocks and checks the edge invariants on `build`.
#[derive(Debug, Default)]
pub(crate) struct CfgBuilder {
    graph: ControlFlowGraph,
    pending: Vec<(String, String, Vec<(EdgeType, String)>)>,
}

impl CfgBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Declare a function. Its first block is the entry block.
    pub(crate) fn function(&mut self, name: &str, ty: FuncType) -> &mut Self {
        if !self.graph.function_index.contains_key(name) {
            self.graph
                .function_index
                .insert(name.to_owned(), self.graph.functions.len());
            self.graph.functions.push(FunctionInfo {
                name: name.to_owned(),
                ty,
                blocks: Vec::new(),
            });
        }
        self
    }

    pub(crate) fn block(
        &mut self,
        function: &str,
        name: &str,
        instructions: Vec<Instruction>,
        edges: Vec<(EdgeType, String)>,
    ) -> &mut Self {
        self.function(function, FuncType::new([], []));
        self.pending
            .push((function.to_owned(), name.to_owned(), edges.clone()));
        self.graph.blocks.insert(
            name.to_owned(),
            BasicBlock {
                name: name.to_owned(),
                instructions,
                edges: Edges(Vec::new()),
            },
        );
        self
    }

    fn sort_function_blocks(
        &mut self,
        function: &str,
        cmp: impl Fn(&str, &str) -> std::cmp::Ordering,
    ) {
        let mut names: Vec<String> = self
            .pending
            .iter()
            .filter(|(f, _, _)| f == function)
            .map(|(_, n, _)| n.clone())
            .collect();
        names.sort_by(|a, b| cmp(a, b));
        if let Some(&i) = self.graph.function_index.get(function) {
            self.graph.functions[i].blocks = names;
        }
    }

    pub(crate) fn build(mut self) -> Result<ControlFlowGraph, AnalysisError> {
        let malformed = |msg: String| Err(AnalysisError::MalformedModule(msg));
        for (function, name, edges) in std::mem::take(&mut self.pending) {
            for (i, (ty, dest)) in edges.iter().enumerate() {
                if edges[..i].iter().any(|(t, _)| t == ty) {
                    return malformed(format!("block `{name}` has two `{ty}` edges"));
                }
                if !self.graph.blocks.contains_key(dest) {
                    return malformed(format!("edge `{name}` -> `{dest}` references an undeclared block"));
                }
            }
            let conditionals = edges.iter().filter(|(t, _)| t.is_conditional()).count();
            if conditionals == 1 {
                return malformed(format!("block `{name}` has a single conditional edge"));
            }
            if conditionals == 2 && edges.len() > 2 {
                return malformed(format!(
                    "block `{name}` mixes conditional and unconditional edges"
                ));
            }
            if let Some(&i) = self.graph.function_index.get(&function) {
                let blocks = &mut self.graph.functions[i].blocks;
                if !blocks.contains(&name) {
                    blocks.push(name.clone());
                }
            }
            if let Some(block) = self.graph.blocks.get_mut(&name) {
                block.edges = Edges(edges);
            }
        }
        Ok(self.graph)
    }
}
