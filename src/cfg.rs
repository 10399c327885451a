//! Basic blocks and the control-flow graph over them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::Address;

/// Kind of a control-flow edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    Fallthrough,
    /// Unconditional direct jump
    Branch,
    BranchTrue,
    BranchFalse,
    Call,
    /// Target recovered from a dispatch table or a computed register
    ResolvedIndirect,
    /// Computed jump whose target the scanner cannot see
    Indirect,
}

impl EdgeKind {
    /// Edges that belong in the call graph.
    pub fn is_call_graph(self) -> bool {
        matches!(self, EdgeKind::Call | EdgeKind::ResolvedIndirect)
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EdgeKind::Fallthrough => "fallthrough",
            EdgeKind::Branch => "branch",
            EdgeKind::BranchTrue => "branch-true",
            EdgeKind::BranchFalse => "branch-false",
            EdgeKind::Call => "call",
            EdgeKind::ResolvedIndirect => "resolved-indirect",
            EdgeKind::Indirect => "indirect",
        };
        f.write_str(s)
    }
}

/// Why an edge could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnresolvedReason {
    /// Target is computed at run time
    Indirect,
    /// Target lies outside every executable segment
    OutOfBounds,
    /// Target bytes do not decode
    Undecodable,
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnresolvedReason::Indirect => "indirect",
            UnresolvedReason::OutOfBounds => "out of bounds",
            UnresolvedReason::Undecodable => "undecodable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeTarget {
    Resolved(Address),
    Unresolved {
        raw: Option<Address>,
        reason: UnresolvedReason,
    },
}

impl EdgeTarget {
    pub fn address(&self) -> Option<Address> {
        match self {
            EdgeTarget::Resolved(addr) => Some(*addr),
            EdgeTarget::Unresolved { .. } => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, EdgeTarget::Resolved(_))
    }
}

/// One outgoing edge of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Edge {
    pub kind: EdgeKind,
    pub target: EdgeTarget,
}

impl Edge {
    pub fn resolved(kind: EdgeKind, target: Address) -> Self {
        Self {
            kind,
            target: EdgeTarget::Resolved(target),
        }
    }

    pub fn unresolved(kind: EdgeKind, raw: Option<Address>, reason: UnresolvedReason) -> Self {
        Self {
            kind,
            target: EdgeTarget::Unresolved { raw, reason },
        }
    }
}

/// One basic block, `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    /// Starting address of the basic block
    pub start: Address,
    /// First address past the block
    pub end: Address,
    /// Successor edges found by the scanner
    pub succs: Vec<Edge>,
}

impl BasicBlock {
    pub fn new(start: Address, end: Address, succs: Vec<Edge>) -> Self {
        Self { start, end, succs }
    }

    /// Get the size of the block in bytes
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// The control-flow graph: blocks partitioning the scanned code, their
/// scanner edges, and edges recovered later by the semantic analysis.
#[derive(Debug, Clone, Default)]
pub struct Cfg {
    blocks: BTreeMap<Address, BasicBlock>,
    resolved: BTreeMap<Address, Vec<Edge>>,
    undecodable: BTreeSet<Address>,
}

impl Cfg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Blocks in address order.
    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.values()
    }

    pub fn get(&self, start: Address) -> Option<&BasicBlock> {
        self.blocks.get(&start)
    }

    pub fn is_block_start(&self, addr: Address) -> bool {
        self.blocks.contains_key(&addr)
    }

    /// Block whose range contains `addr`.
    pub fn block_containing(&self, addr: Address) -> Option<&BasicBlock> {
        self.blocks
            .range(..=addr)
            .next_back()
            .map(|(_, b)| b)
            .filter(|b| b.contains(addr))
    }

    /// First block start strictly above `addr`.
    pub fn next_start_after(&self, addr: Address) -> Option<Address> {
        self.blocks.range(addr + 1..).next().map(|(start, _)| *start)
    }

    /// Insert a freshly scanned block. It must not overlap an existing one.
    pub fn insert(&mut self, block: BasicBlock) {
        debug_assert!(block.start < block.end);
        debug_assert!(self.block_containing(block.start).is_none());
        debug_assert!(self.next_start_after(block.start).map_or(true, |n| n >= block.end));
        self.blocks.insert(block.start, block);
    }

    /// Split the block containing `addr` so that `addr` starts a block.
    /// The head falls through into the tail, the tail keeps the original
    /// successors. Returns false when `addr` already starts a block or lies
    /// outside every block.
    pub fn split(&mut self, addr: Address) -> bool {
        let start = match self.block_containing(addr) {
            Some(b) if b.start != addr => b.start,
            _ => return false,
        };
        let head = match self.blocks.get_mut(&start) {
            Some(head) => head,
            None => return false,
        };
        let tail = BasicBlock::new(addr, head.end, std::mem::take(&mut head.succs));
        head.end = addr;
        head.succs.push(Edge::resolved(EdgeKind::Fallthrough, addr));
        self.blocks.insert(addr, tail);
        log::debug!("Split block 0x{:x} at 0x{:x}", start, addr);
        true
    }

    /// Remember a block start whose bytes do not decode.
    pub fn mark_undecodable(&mut self, addr: Address) {
        self.undecodable.insert(addr);
    }

    /// Replace the analysis edges of a block.
    pub fn set_resolved(&mut self, start: Address, edges: Vec<Edge>) {
        if edges.is_empty() {
            self.resolved.remove(&start);
        } else {
            self.resolved.insert(start, edges);
        }
    }

    pub fn clear_resolved(&mut self) {
        self.resolved.clear();
    }

    /// All successor edges of the block at `start`. Analysis edges take the
    /// place of the scanner's unresolved computed-transfer edge.
    pub fn successors(&self, start: Address) -> Vec<Edge> {
        let Some(block) = self.blocks.get(&start) else {
            return Vec::new();
        };
        let resolved = self.resolved.get(&start).map(Vec::as_slice).unwrap_or(&[]);

        let mut edges: Vec<Edge> = block
            .succs
            .iter()
            .filter(|e| {
                resolved.is_empty()
                    || !matches!(
                        (e.kind, e.target),
                        (EdgeKind::Indirect | EdgeKind::Call, EdgeTarget::Unresolved { reason: UnresolvedReason::Indirect, .. })
                    )
            })
            .chain(resolved.iter())
            .copied()
            .collect();

        for edge in &mut edges {
            if let EdgeTarget::Resolved(t) = edge.target {
                if self.undecodable.contains(&t) && !self.blocks.contains_key(&t) {
                    edge.target = EdgeTarget::Unresolved {
                        raw: Some(t),
                        reason: UnresolvedReason::Undecodable,
                    };
                }
            }
        }
        edges
    }

    /// Every edge, source block first, in address order.
    pub fn edges(&self) -> Vec<(Address, Edge)> {
        self.blocks
            .keys()
            .flat_map(|&start| self.successors(start).into_iter().map(move |e| (start, e)))
            .collect()
    }

    /// Total bytes covered by blocks.
    pub fn scanned_bytes(&self) -> u64 {
        self.blocks.values().map(BasicBlock::size).sum()
    }
}
