//! Instruction resubstitution: rewrite recognised chains as native code.
//!
//! Resubstitution runs in two steps so the image is only borrowed mutably
//! once everything has been decided. [`plan`] re-derives the classified
//! chains of a block and synthesizes a [`PatchRecord`] for each rewritable
//! one; [`apply`] writes the records in a single pass.

mod patch;
mod synth;

pub use self::patch::{PatchRecord, NOP};
pub use self::synth::synthesize;

use serde::Serialize;

use self::synth::{clobbers, Clobbers};
use crate::image::Image;
use crate::semantic::{classify_block, decode_range, AnalysisContext, ClassifiedChain, Confidence, OpKind};
use crate::{Address, Flow, Insn, Operand, Reg};

/// Rewrite policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResubOptions {
    /// Rewrite resolved calls as well
    pub patch_calls: bool,
}

/// Outcome of resubstituting one range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResubReport {
    pub bytes_patched: u64,
    pub applied: usize,
    pub skipped: usize,
}

impl std::ops::AddAssign for ResubReport {
    fn add_assign(&mut self, other: Self) {
        self.bytes_patched += other.bytes_patched;
        self.applied += other.applied;
        self.skipped += other.skipped;
    }
}

/// Patches decided for a range, and how many eligible chains were left
/// untouched because no rewrite fit.
#[derive(Debug, Clone, Default)]
pub struct ResubPlan {
    pub records: Vec<PatchRecord>,
    pub skipped: usize,
}

fn eligible(cc: &ClassifiedChain, opts: &ResubOptions) -> bool {
    if cc.op.confidence == Confidence::None {
        return false;
    }
    match cc.op.kind {
        OpKind::Unknown | OpKind::PlainMove => false,
        OpKind::Call { .. } => opts.patch_calls,
        _ => true,
    }
}

fn regs_read(insn: &Insn) -> Vec<Reg> {
    let mut regs = Vec::new();
    for (i, op) in insn.ops.iter().enumerate() {
        match op {
            Operand::Reg(r) if i > 0 => regs.push(*r),
            Operand::Mem(m) => regs.extend(m.base.iter().chain(m.index.iter()).copied()),
            _ => {}
        }
    }
    regs
}

/// Whether the code following a chain, up to the end of the range, reads
/// state the rewrite does not reproduce. Liveness ends at the first
/// control transfer.
fn observes(rest: &[Insn], mut clobbers: Clobbers) -> bool {
    for insn in rest {
        match insn.flow() {
            Flow::Sequential => {}
            Flow::CondBranch(_) => return clobbers.flags,
            _ => return false,
        }
        if clobbers.regs.is_empty() && !clobbers.flags {
            return false;
        }
        if !insn.is_move() {
            // no operand model for native code
            return true;
        }
        if regs_read(insn).into_iter().any(|r| clobbers.stale(r)) {
            return true;
        }
        if let Some(Operand::Reg(d)) = insn.ops.first() {
            clobbers.redefine(*d);
        }
    }
    false
}

/// Decide the patches for `[start, end)`.
pub fn plan(ctx: &AnalysisContext<'_>, start: Address, end: Address, opts: &ResubOptions) -> ResubPlan {
    let (chains, _) = classify_block(ctx, start, end);
    let mut plan = ResubPlan::default();

    for cc in chains.iter().filter(|cc| eligible(cc, opts)) {
        let span = cc.chain.byte_len();
        let Some(dropped) = clobbers(cc) else {
            plan.skipped += 1;
            continue;
        };
        if observes(&decode_range(ctx.image, ctx.decoder, cc.chain.end(), end), dropped) {
            log::debug!("Keeping {} at 0x{:x}: dropped state is read later", cc.op.kind.name(), cc.chain.start());
            plan.skipped += 1;
            continue;
        }
        let Some(bytes) = synthesize(cc, ctx.image) else {
            log::debug!("No rewrite for {}", cc.op);
            plan.skipped += 1;
            continue;
        };
        let len = bytes.len();
        let Some(record) = PatchRecord::new(cc.chain.start(), span, bytes) else {
            log::warn!(
                "Skipping {} at 0x{:x}: {} bytes do not fit in {}",
                cc.op.kind.name(),
                cc.chain.start(),
                len,
                span
            );
            plan.skipped += 1;
            continue;
        };
        if record.is_applied(ctx.image) {
            continue;
        }
        log::debug!("Patching {} ({} -> {} bytes)", cc.op, span, len);
        plan.records.push(record);
    }
    plan
}

/// Write every planned record into the image.
pub fn apply(image: &mut Image, plan: &ResubPlan) -> ResubReport {
    let mut report = ResubReport {
        skipped: plan.skipped,
        ..ResubReport::default()
    };
    for record in &plan.records {
        if record.apply(image) {
            report.applied += 1;
            report.bytes_patched += record.original_len() as u64;
        } else {
            report.skipped += 1;
        }
    }
    report
}
