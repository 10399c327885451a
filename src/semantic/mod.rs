//! Block-local semantic analysis.
//!
//! Each block is decoded, cut into move chains, and every chain is
//! interpreted against an abstract [`RegisterState`] and classified through
//! the pattern grammar in [`patterns`] into exactly one [`SemanticOp`].

pub mod chain;
pub mod patterns;
pub mod state;
pub mod tables;

use std::fmt;

use serde::Serialize;

use self::chain::{interpret, split_chains, MoveChain, Step};
use self::patterns::MatchContext;
use self::state::{AbstractValue, RegisterState};
use crate::cfg::{Edge, EdgeKind, UnresolvedReason};
use crate::image::{Image, Relocations};
use crate::{Address, Decoder, Insn, Operand, Reg};

/// Tuning knobs for table identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisParams {
    /// Operand values probed per axis when identifying a lookup table
    pub probe_width: u32,
    /// Upper bound on dispatch table entries read
    pub max_table_entries: usize,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self {
            probe_width: 4,
            max_table_entries: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Mul,
}

impl AluOp {
    pub const ALL: [AluOp; 6] = [AluOp::Add, AluOp::Sub, AluOp::And, AluOp::Or, AluOp::Xor, AluOp::Mul];

    pub fn apply(self, a: u32, b: u32) -> u32 {
        match self {
            AluOp::Add => a.wrapping_add(b),
            AluOp::Sub => a.wrapping_sub(b),
            AluOp::And => a & b,
            AluOp::Or => a | b,
            AluOp::Xor => a ^ b,
            AluOp::Mul => a.wrapping_mul(b),
        }
    }

    pub fn is_commutative(self) -> bool {
        !matches!(self, AluOp::Sub)
    }

    pub fn name(self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::Sub => "sub",
            AluOp::And => "and",
            AluOp::Or => "or",
            AluOp::Xor => "xor",
            AluOp::Mul => "mul",
        }
    }
}

/// Unsigned relations, as produced by movfuscator's comparison tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    Eq,
    Ne,
    Ltu,
    Leu,
    Gtu,
    Geu,
}

impl Relation {
    pub const ALL: [Relation; 6] = [
        Relation::Eq,
        Relation::Ne,
        Relation::Ltu,
        Relation::Leu,
        Relation::Gtu,
        Relation::Geu,
    ];

    pub fn holds(self, a: u32, b: u32) -> bool {
        match self {
            Relation::Eq => a == b,
            Relation::Ne => a != b,
            Relation::Ltu => a < b,
            Relation::Leu => a <= b,
            Relation::Gtu => a > b,
            Relation::Geu => a >= b,
        }
    }

    /// The relation with its operands exchanged.
    pub fn swapped(self) -> Relation {
        match self {
            Relation::Ltu => Relation::Gtu,
            Relation::Leu => Relation::Geu,
            Relation::Gtu => Relation::Ltu,
            Relation::Geu => Relation::Leu,
            other => other,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Relation::Eq => "eq",
            Relation::Ne => "ne",
            Relation::Ltu => "ltu",
            Relation::Leu => "leu",
            Relation::Gtu => "gtu",
            Relation::Geu => "geu",
        }
    }
}

/// How sure the classifier is. Only `Exact` and `Heuristic` operations are
/// considered for rewriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    None,
    Heuristic,
    Exact,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Confidence::None => "none",
            Confidence::Heuristic => "heuristic",
            Confidence::Exact => "exact",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallTarget {
    /// Code inside an executable segment
    Code(Address),
    /// Relocation slot of an imported function
    Import { slot: Address, name: String },
    /// Target not known, or outside every executable segment
    Unresolved(Option<Address>),
}

/// What a move chain does.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpKind {
    /// `dst = lhs op rhs`, computed in `result` through the lookup `table`
    Arithmetic {
        op: AluOp,
        result: Reg,
        dst: Operand,
        lhs: Operand,
        rhs: Operand,
        table: Address,
    },
    /// `dst = lhs relation rhs` as 0/1
    Compare {
        relation: Relation,
        result: Reg,
        dst: Operand,
        lhs: Operand,
        rhs: Operand,
        table: Option<Address>,
    },
    /// Two-way dispatch on a boolean index
    ConditionalBranch {
        table: Address,
        index: Reg,
        true_target: Address,
        false_target: Address,
    },
    IndirectBranch {
        table: Option<Address>,
        index: Option<Reg>,
        targets: Vec<Address>,
    },
    Call {
        target: CallTarget,
        table: Option<Address>,
    },
    PlainMove,
    Unknown,
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Arithmetic { .. } => "ARITHMETIC",
            OpKind::Compare { .. } => "COMPARE",
            OpKind::ConditionalBranch { .. } => "CONDITIONAL_BRANCH",
            OpKind::IndirectBranch { .. } => "INDIRECT_BRANCH",
            OpKind::Call { .. } => "CALL",
            OpKind::PlainMove => "PLAIN_MOVE",
            OpKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        match self {
            OpKind::Arithmetic { op, dst, lhs, rhs, .. } => write!(f, " {} = {} {} {}", dst, lhs, op.name(), rhs),
            OpKind::Compare {
                relation, dst, lhs, rhs, ..
            } => write!(f, " {} = {} {} {}", dst, lhs, relation.name(), rhs),
            OpKind::ConditionalBranch {
                table,
                index,
                true_target,
                false_target,
            } => write!(
                f,
                " [0x{:x} + {}*4] true 0x{:x} false 0x{:x}",
                table, index, true_target, false_target
            ),
            OpKind::IndirectBranch { targets, .. } => {
                for t in targets {
                    write!(f, " 0x{:x}", t)?;
                }
                Ok(())
            }
            OpKind::Call { target, .. } => match target {
                CallTarget::Code(t) => write!(f, " 0x{:x}", t),
                CallTarget::Import { name, .. } => write!(f, " {}", name),
                CallTarget::Unresolved(Some(t)) => write!(f, " ? (0x{:x})", t),
                CallTarget::Unresolved(None) => write!(f, " ?"),
            },
            OpKind::PlainMove | OpKind::Unknown => Ok(()),
        }
    }
}

/// A classified chain with the byte range it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SemanticOp {
    pub start: Address,
    pub end: Address,
    pub confidence: Confidence,
    pub kind: OpKind,
}

impl SemanticOp {
    /// Control-flow edges this operation contributes.
    pub fn edges(&self, image: &Image) -> Vec<Edge> {
        let edge = |kind: EdgeKind, target: Address| {
            if image.is_executable(target) {
                Edge::resolved(kind, target)
            } else {
                Edge::unresolved(kind, Some(target), UnresolvedReason::OutOfBounds)
            }
        };
        match &self.kind {
            OpKind::ConditionalBranch {
                true_target,
                false_target,
                ..
            } => vec![
                edge(EdgeKind::ResolvedIndirect, *false_target),
                edge(EdgeKind::ResolvedIndirect, *true_target),
            ],
            OpKind::IndirectBranch { targets, .. } => {
                targets.iter().map(|t| edge(EdgeKind::ResolvedIndirect, *t)).collect()
            }
            OpKind::Call { target, .. } => match target {
                CallTarget::Code(t) => vec![Edge::resolved(EdgeKind::Call, *t)],
                CallTarget::Import { slot, .. } => vec![Edge::resolved(EdgeKind::Call, *slot)],
                CallTarget::Unresolved(Some(raw)) => vec![Edge::unresolved(
                    EdgeKind::Call,
                    Some(*raw),
                    UnresolvedReason::OutOfBounds,
                )],
                CallTarget::Unresolved(None) => {
                    vec![Edge::unresolved(EdgeKind::Call, None, UnresolvedReason::Indirect)]
                }
            },
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for SemanticOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}-0x{:08x} {} ({})", self.start, self.end, self.kind, self.confidence)
    }
}

/// A chain together with its interpretation and classification.
#[derive(Debug, Clone)]
pub struct ClassifiedChain {
    pub chain: MoveChain,
    pub steps: Vec<Step>,
    pub op: SemanticOp,
}

/// Read-only inputs of the analysis.
#[derive(Clone, Copy)]
pub struct AnalysisContext<'a> {
    pub image: &'a Image,
    pub decoder: &'a dyn Decoder,
    pub relocations: &'a Relocations,
    pub params: &'a AnalysisParams,
}

/// Result of analysing one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAnalysis {
    pub ops: Vec<SemanticOp>,
    /// Register and memory state after the last chain
    pub exit_state: RegisterState,
    pub edges: Vec<Edge>,
}

impl BlockAnalysis {
    /// Resolved edge targets inside executable code.
    pub fn code_targets<'a>(&'a self, image: &'a Image) -> impl Iterator<Item = Address> + 'a {
        self.edges
            .iter()
            .filter_map(|e| e.target.address())
            .filter(move |t| image.is_executable(*t))
    }
}

/// Decode the whole instructions in `[start, end)`.
pub fn decode_range(image: &Image, decoder: &dyn Decoder, start: Address, end: Address) -> Vec<Insn> {
    let mut insns = Vec::new();
    let mut at = start;
    while at < end {
        let Some(insn) = image.slice_from(at).and_then(|code| decoder.decode(code, at)) else {
            break;
        };
        if insn.end() > end {
            break;
        }
        at = insn.end();
        insns.push(insn);
    }
    insns
}

/// A recognised comparison leaves a boolean behind.
fn refine(state: &mut RegisterState, op: &SemanticOp) {
    if let OpKind::Compare { result, dst, .. } = &op.kind {
        state.set_reg(*result, AbstractValue::BOOL);
        if let Operand::Mem(m) = dst {
            if let Some(addr) = m.absolute_address() {
                state.store(addr, m.size, AbstractValue::BOOL);
            }
        }
    }
}

/// Interpret and classify every chain of the block `[start, end)`. The
/// state starts empty at the block entry and is reset by any instruction
/// that is not part of a chain.
pub fn classify_block(ctx: &AnalysisContext<'_>, start: Address, end: Address) -> (Vec<ClassifiedChain>, RegisterState) {
    let insns = decode_range(ctx.image, ctx.decoder, start, end);
    let mut state = RegisterState::new();
    let mut out = Vec::new();
    let mut last_end = start;

    for chain in split_chains(&insns) {
        if chain.start() != last_end {
            state = RegisterState::new();
        }
        last_end = chain.end();

        let steps = interpret(&chain, &mut state, ctx.image);
        let (kind, confidence) = patterns::classify(&MatchContext {
            steps: &steps,
            image: ctx.image,
            relocations: ctx.relocations,
            params: ctx.params,
        });
        let op = SemanticOp {
            start: chain.start(),
            end: chain.end(),
            confidence,
            kind,
        };
        refine(&mut state, &op);
        log::debug!("{}", op);
        out.push(ClassifiedChain { chain, steps, op });
    }
    (out, state)
}

/// Analyse one block: its operations, exit state and recovered edges.
pub fn analyse_block(ctx: &AnalysisContext<'_>, start: Address, end: Address) -> BlockAnalysis {
    let (chains, exit_state) = classify_block(ctx, start, end);
    let edges = chains.iter().flat_map(|c| c.op.edges(ctx.image)).collect();
    BlockAnalysis {
        ops: chains.into_iter().map(|c| c.op).collect(),
        exit_state,
        edges,
    }
}
