//! Recursive-descent scan of reachable code into basic blocks

use std::collections::{BTreeSet, VecDeque};

use crate::cfg::{BasicBlock, Cfg, Edge, EdgeKind, UnresolvedReason};
use crate::image::Image;
use crate::{Address, Decoder, Flow};

/// Pending addresses. Each address is scheduled at most once for the
/// lifetime of the queue, which is what bounds the scan/analyse fixpoint.
#[derive(Debug, Clone, Default)]
pub struct WorkQueue {
    queue: VecDeque<Address>,
    scheduled: BTreeSet<Address>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `addr`. Returns false if it was scheduled before.
    pub fn push(&mut self, addr: Address) -> bool {
        if !self.scheduled.insert(addr) {
            return false;
        }
        self.queue.push_back(addr);
        true
    }

    pub fn pop(&mut self) -> Option<Address> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

/// What one scan run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub blocks_created: usize,
    pub splits: usize,
    pub out_of_bounds: usize,
    pub undecodable: usize,
}

/// Drain `queue`, decoding from every pending address until a control
/// transfer, and record the blocks and their edges in `cfg`.
///
/// # Arguments
/// * `image` - The bound image; only executable segments are decoded
/// * `decoder` - The decoder to use for disassembly
/// * `cfg` - Graph to extend; existing blocks are split, never overlapped
/// * `queue` - Pending block starts; statically known targets are pushed back
pub fn scan(image: &Image, decoder: &dyn Decoder, cfg: &mut Cfg, queue: &mut WorkQueue) -> ScanReport {
    log::debug!("Scanning {} pending addresses", queue.len());
    let mut report = ScanReport::default();

    while let Some(addr) = queue.pop() {
        if cfg.is_block_start(addr) {
            continue;
        }
        if cfg.block_containing(addr).is_some() {
            if cfg.split(addr) {
                report.splits += 1;
            }
            continue;
        }
        if !image.is_executable(addr) {
            log::warn!("Skipping 0x{:x}: not in an executable segment", addr);
            continue;
        }

        let limit = cfg.next_start_after(addr);
        let mut succs = Vec::new();
        let mut at = addr;

        loop {
            // Ran into a block that is already known
            if at > addr && Some(at) == limit {
                succs.push(Edge::resolved(EdgeKind::Fallthrough, at));
                break;
            }

            let Some(insn) = image.slice_from(at).and_then(|code| decoder.decode(code, at)) else {
                if at != addr {
                    succs.push(Edge::unresolved(EdgeKind::Fallthrough, Some(at), UnresolvedReason::Undecodable));
                }
                break;
            };

            // An instruction straddling the next block start is cut there
            if let Some(next) = limit {
                if insn.end() > next {
                    log::warn!("Instruction at 0x{:x} overlaps block 0x{:x}", at, next);
                    at = next;
                    succs.push(Edge::resolved(EdgeKind::Fallthrough, at));
                    break;
                }
            }
            at = insn.end();

            let mut edge = |kind: EdgeKind, target: Address| {
                if image.is_executable(target) {
                    queue.push(target);
                    Edge::resolved(kind, target)
                } else {
                    log::warn!("Target 0x{:x} of 0x{:x} is outside executable code", target, insn.addr);
                    report.out_of_bounds += 1;
                    Edge::unresolved(kind, Some(target), UnresolvedReason::OutOfBounds)
                }
            };

            match insn.flow() {
                Flow::Sequential => {
                    if !image.is_executable(at) {
                        succs.push(edge(EdgeKind::Fallthrough, at));
                        break;
                    }
                    continue;
                }
                Flow::Jump(Some(target)) => succs.push(edge(EdgeKind::Branch, target)),
                Flow::Jump(None) => {
                    succs.push(Edge::unresolved(EdgeKind::Indirect, None, UnresolvedReason::Indirect))
                }
                Flow::CondBranch(target) => {
                    succs.push(edge(EdgeKind::BranchTrue, target));
                    succs.push(edge(EdgeKind::BranchFalse, at));
                }
                Flow::Call(target) => {
                    succs.push(match target {
                        Some(target) => edge(EdgeKind::Call, target),
                        None => Edge::unresolved(EdgeKind::Call, None, UnresolvedReason::Indirect),
                    });
                    succs.push(edge(EdgeKind::Fallthrough, at));
                }
                Flow::Stop => {}
            }
            break;
        }

        if at == addr {
            log::warn!("Could not decode block at 0x{:x}", addr);
            cfg.mark_undecodable(addr);
            report.undecodable += 1;
            continue;
        }

        log::debug!("Block 0x{:x}..0x{:x}, {} successors", addr, at, succs.len());
        cfg.insert(BasicBlock::new(addr, at, succs));
        report.blocks_created += 1;
    }

    log::debug!("Scan complete: {} basic blocks", cfg.len());
    report
}
