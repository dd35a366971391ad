//! Structural loop-header detection over one function's block graph.
//!
//! A block is a header when the depth-first walk reaches it again while it is still
//! on the current path and it has exactly two outgoing edges, i.e. it is the
//! conditional test that controls a lowered `loop`. Cycles of any other shape are
//! left alone.

use super::cfg::{ControlFlowGraph, EdgeType};
use crate::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LoopEdges {
    // the edge that stays inside the loop
    pub continuation: EdgeType,
    pub exit: EdgeType,
}

impl Default for LoopEdges {
    fn default() -> Self {
        Self {
            continuation: EdgeType::ConditionalFalse,
            exit: EdgeType::ConditionalTrue,
        }
    }
}

impl LoopEdges {
    fn entered_via(edge: EdgeType) -> Self {
        match edge.other_conditional() {
            Some(exit) => Self {
                continuation: edge,
                exit,
            },
            None => Self::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct CycleHeaders {
    headers: HashMap<String, LoopEdges>,
}

impl CycleHeaders {
    pub(crate) fn loop_edges(&self, block: &str) -> Option<LoopEdges> {
        self.headers.get(block).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.headers.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, LoopEdges)> + '_ {
        self.headers.iter().map(|(name, edges)| (name.as_str(), *edges))
    }
}

struct Walk<'a> {
    cfg: &'a ControlFlowGraph,
    // blocks on the current path, with the edge taken out of each
    path: Vec<(&'a str, Option<EdgeType>)>,
    on_path: HashSet<&'a str>,
    done: HashSet<&'a str>,
    headers: HashMap<String, LoopEdges>,
}

impl<'a> Walk<'a> {
    fn walk(&mut self, block: &'a str) {
        let cfg = self.cfg;
        self.path.push((block, None));
        self.on_path.insert(block);
        for (ty, dest) in cfg.edges_of(block).iter() {
            if let Some(last) = self.path.last_mut() {
                last.1 = Some(ty);
            }
            if self.on_path.contains(dest) {
                if cfg.edges_of(dest).len() == 2 && !self.headers.contains_key(dest) {
                    let entered_via = self
                        .path
                        .iter()
                        .find(|(name, _)| *name == dest)
                        .and_then(|(_, edge)| *edge);
                    let edges = entered_via.map(LoopEdges::entered_via).unwrap_or_default();
                    self.headers.insert(dest.to_owned(), edges);
                }
                continue;
            }
            // Finished blocks are not walked again. A cycle whose back edge lands on a
            // block without two edges stays unclassified even when another way into
            // the cycle would have closed it on a two-edge block; the traversal's
            // re-entrance guard bounds such cycles instead.
            if self.done.contains(dest) {
                continue;
            }
            self.walk(dest);
        }
        self.path.pop();
        self.on_path.remove(block);
        self.done.insert(block);
    }
}

/// Classify the loop headers reachable from `entry`.
pub(crate) fn detect_cycles(cfg: &ControlFlowGraph, entry: &str) -> CycleHeaders {
    let Some(entry) = cfg.block(entry).map(|b| b.name.as_str()) else {
        return CycleHeaders::default();
    };
    let mut walk = Walk {
        cfg,
        path: Vec::new(),
        on_path: HashSet::default(),
        done: HashSet::default(),
        headers: HashMap::default(),
    };
    walk.walk(entry);
    tracing::debug!(entry, headers = walk.headers.len(), "cycle detection done");
    CycleHeaders {
        headers: walk.headers,
    }
}
