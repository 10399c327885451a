//! Native instruction synthesis for classified chains.

use std::collections::BTreeSet;

use iced_x86::{BlockEncoder, BlockEncoderOptions, Code, Instruction, InstructionBlock, MemoryOperand, Register};

use crate::image::Image;
use crate::semantic::chain::{Step, TableBase, TableRead};
use crate::semantic::patterns::transfer_source;
use crate::semantic::{AluOp, CallTarget, ClassifiedChain, Confidence, OpKind, Relation};
use crate::{Address, MemRef, Operand, Reg};

fn reg32(r: Reg) -> Option<Register> {
    Some(match r {
        Reg::Eax => Register::EAX,
        Reg::Ecx => Register::ECX,
        Reg::Edx => Register::EDX,
        Reg::Ebx => Register::EBX,
        Reg::Esp => Register::ESP,
        Reg::Ebp => Register::EBP,
        Reg::Esi => Register::ESI,
        Reg::Edi => Register::EDI,
        _ => return None,
    })
}

fn reg8(r: Reg) -> Option<Register> {
    Some(match r {
        Reg::Al => Register::AL,
        Reg::Cl => Register::CL,
        Reg::Dl => Register::DL,
        Reg::Bl => Register::BL,
        Reg::Ah => Register::AH,
        Reg::Ch => Register::CH,
        Reg::Dh => Register::DH,
        Reg::Bh => Register::BH,
        _ => return None,
    })
}

fn mem(m: &MemRef) -> Option<MemoryOperand> {
    if m.segment.is_some() {
        return None;
    }
    let base = match m.base {
        Some(r) => reg32(r)?,
        None => Register::None,
    };
    let index = match m.index {
        Some(r) => reg32(r)?,
        None => Register::None,
    };
    let displ_size = if m.base.is_some() && m.disp == 0 { 0 } else { 4 };
    Some(MemoryOperand::with_base_index_scale_displ_size(
        base,
        index,
        m.scale.max(1) as u32,
        m.disp as i32 as i64,
        displ_size,
    ))
}

/// `r <- src`, zero-extending narrower sources.
fn load(r: Register, src: &Operand) -> Option<Instruction> {
    match src {
        Operand::Imm(v) => Instruction::with2(Code::Mov_r32_imm32, r, *v).ok(),
        Operand::Reg(s) => match s.width() {
            4 => Instruction::with2(Code::Mov_r32_rm32, r, reg32(*s)?).ok(),
            1 => Instruction::with2(Code::Movzx_r32_rm8, r, reg8(*s)?).ok(),
            _ => None,
        },
        Operand::Mem(m) => {
            let code = match m.size {
                4 => Code::Mov_r32_rm32,
                2 => Code::Movzx_r32_rm16,
                1 => Code::Movzx_r32_rm8,
                _ => return None,
            };
            Instruction::with2(code, r, mem(m)?).ok()
        }
    }
}

/// `dst <- r`, for a 32-bit or low-byte register.
fn store(dst: &MemRef, r: Reg) -> Option<Instruction> {
    match (dst.size, r.width()) {
        (4, 4) => Instruction::with2(Code::Mov_rm32_r32, mem(dst)?, reg32(r)?).ok(),
        (1, 1) => Instruction::with2(Code::Mov_rm8_r8, mem(dst)?, reg8(r)?).ok(),
        _ => None,
    }
}

/// `r <- r op src` for a 32-bit operand.
fn alu(op: AluOp, r: Register, src: &Operand) -> Option<Instruction> {
    let (rm, imm) = match op {
        AluOp::Add => (Code::Add_r32_rm32, Code::Add_rm32_imm32),
        AluOp::Sub => (Code::Sub_r32_rm32, Code::Sub_rm32_imm32),
        AluOp::And => (Code::And_r32_rm32, Code::And_rm32_imm32),
        AluOp::Or => (Code::Or_r32_rm32, Code::Or_rm32_imm32),
        AluOp::Xor => (Code::Xor_r32_rm32, Code::Xor_rm32_imm32),
        AluOp::Mul => (Code::Imul_r32_rm32, Code::Imul_r32_rm32_imm32),
    };
    match src {
        Operand::Imm(v) if op == AluOp::Mul => Instruction::with3(imm, r, r, *v).ok(),
        Operand::Imm(v) => Instruction::with2(imm, r, *v).ok(),
        Operand::Reg(s) if s.width() == 4 => Instruction::with2(rm, r, reg32(*s)?).ok(),
        Operand::Mem(m) if m.size == 4 => Instruction::with2(rm, r, mem(m)?).ok(),
        _ => None,
    }
}

fn cmp(r: Register, src: &Operand) -> Option<Instruction> {
    match src {
        Operand::Imm(v) => Instruction::with2(Code::Cmp_rm32_imm32, r, *v).ok(),
        Operand::Reg(s) if s.width() == 4 => Instruction::with2(Code::Cmp_r32_rm32, r, reg32(*s)?).ok(),
        Operand::Mem(m) if m.size == 4 => Instruction::with2(Code::Cmp_r32_rm32, r, mem(m)?).ok(),
        _ => None,
    }
}

fn setcc(relation: Relation) -> Code {
    match relation {
        Relation::Eq => Code::Sete_rm8,
        Relation::Ne => Code::Setne_rm8,
        Relation::Ltu => Code::Setb_rm8,
        Relation::Leu => Code::Setbe_rm8,
        Relation::Gtu => Code::Seta_rm8,
        Relation::Geu => Code::Setae_rm8,
    }
}

fn encode(ip: Address, insns: &[Instruction]) -> Option<Vec<u8>> {
    BlockEncoder::encode(32, InstructionBlock::new(insns, ip), BlockEncoderOptions::NONE)
        .map(|r| r.code_buffer)
        .map_err(|e| log::debug!("Encoding at 0x{:x} failed: {}", ip, e))
        .ok()
}

fn arithmetic(op: AluOp, result: Reg, dst: &Operand, lhs: &Operand, rhs: &Operand) -> Option<Vec<Instruction>> {
    if result.width() != 4 {
        return None;
    }
    let r = reg32(result)?;
    let (lhs, rhs) = if *rhs == Operand::Reg(result) && lhs != rhs {
        if !op.is_commutative() {
            return None;
        }
        (rhs, lhs)
    } else {
        (lhs, rhs)
    };

    let mut out = Vec::new();
    if *lhs != Operand::Reg(result) {
        out.push(load(r, lhs)?);
    }
    out.push(alu(op, r, rhs)?);
    if let Operand::Mem(m) = dst {
        out.push(store(m, result)?);
    }
    Some(out)
}

fn compare(relation: Relation, result: Reg, dst: &Operand, lhs: &Operand, rhs: &Operand) -> Option<Vec<Instruction>> {
    let full = result.full();
    let low = full.low_byte()?;
    if result != full && result != low {
        return None;
    }
    let w = reg32(full)?;
    let (relation, lhs, rhs) = if *rhs == Operand::Reg(full) && lhs != rhs {
        (relation.swapped(), rhs, lhs)
    } else {
        (relation, lhs, rhs)
    };
    if matches!(lhs, Operand::Imm(_)) && matches!(rhs, Operand::Imm(_)) {
        return None;
    }

    let mut out = Vec::new();
    if *lhs != Operand::Reg(full) {
        out.push(load(w, lhs)?);
    }
    out.push(cmp(w, rhs)?);
    out.push(Instruction::with1(setcc(relation), reg8(low)?).ok()?);
    if result == full {
        out.push(Instruction::with2(Code::Movzx_r32_rm8, w, reg8(low)?).ok()?);
    }
    if let Operand::Mem(m) = dst {
        out.push(store(m, result)?);
    }
    Some(out)
}

/// Steps of a control-transfer chain that the rewrite replaces: the
/// transfer itself and the lookup or move right before it that computes
/// the target register. Everything else is kept verbatim.
fn replaced_steps(steps: &[Step]) -> Option<(Vec<usize>, Option<TableRead>)> {
    let n = steps.len();
    let src = transfer_source(steps)?;
    match src.via {
        Operand::Mem(_) => Some((vec![n - 1], src.read)),
        Operand::Reg(r) if r.width() == 4 => match src.def {
            Some(d) if d + 1 == n - 1 => Some((vec![d, n - 1], src.read)),
            // the target register is loaded earlier; only a value-based
            // rewrite of the transfer itself is possible
            _ => Some((vec![n - 1], None)),
        },
        _ => None,
    }
}

fn jump_table(read: &TableRead) -> Option<Instruction> {
    let TableBase::Fixed(table) = read.table else {
        return None;
    };
    if read.base.is_some() || read.scale != 4 {
        return None;
    }
    let m = MemoryOperand::with_base_index_scale_displ_size(
        Register::None,
        reg32(read.index)?,
        4,
        table as u32 as i32 as i64,
        4,
    );
    Instruction::with1(Code::Jmp_rm32, m).ok()
}

fn branch(code: Code, target: Address) -> Option<Instruction> {
    Instruction::with_branch(code, target).ok()
}

/// Machine state a rewrite leaves different from the original chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Clobbers {
    /// Full registers that may hold another value afterwards
    pub regs: BTreeSet<Reg>,
    /// Register the rewrite recreates exactly
    pub kept: Option<Reg>,
    /// EFLAGS change, which a move chain never does
    pub flags: bool,
}

impl Clobbers {
    /// Whether reading `r` after the rewrite may see a different value.
    pub fn stale(&self, r: Reg) -> bool {
        self.regs.contains(&r.full())
            && !matches!(self.kept, Some(k) if k.full() == r.full() && (k.width() == 4 || k == r))
    }

    /// `r` was overwritten as a whole.
    pub fn redefine(&mut self, r: Reg) {
        if r.width() == 4 {
            self.regs.remove(&r);
        }
    }
}

fn written<'a>(steps: impl Iterator<Item = &'a Step>) -> BTreeSet<Reg> {
    steps.filter_map(Step::writes).map(Reg::full).collect()
}

/// What [`synthesize`] drops from the chain it replaces. `None` for
/// operations that are never rewritten.
pub(crate) fn clobbers(cc: &ClassifiedChain) -> Option<Clobbers> {
    match &cc.op.kind {
        OpKind::Arithmetic { result, .. } | OpKind::Compare { result, .. } => {
            let mut regs = written(cc.steps.iter());
            // compare widens through the full register
            regs.insert(result.full());
            Some(Clobbers {
                regs,
                kept: Some(*result),
                flags: true,
            })
        }
        OpKind::ConditionalBranch { .. } | OpKind::IndirectBranch { .. } | OpKind::Call { .. } => {
            let (replaced, _) = replaced_steps(&cc.steps)?;
            let mut regs = written(replaced.iter().map(|&i| &cc.steps[i]));
            if matches!(cc.op.kind, OpKind::Call { .. }) {
                // caller-saved, the callee owns them either way
                for r in [Reg::Eax, Reg::Ecx, Reg::Edx] {
                    regs.remove(&r);
                }
            }
            Some(Clobbers {
                regs,
                kept: None,
                flags: matches!(cc.op.kind, OpKind::ConditionalBranch { .. }),
            })
        }
        OpKind::PlainMove | OpKind::Unknown => None,
    }
}

/// Synthesize replacement bytes for a classified chain, or `None` when the
/// operation has no rewrite. The result may still be too long for the
/// chain's span; the caller checks.
pub fn synthesize(cc: &ClassifiedChain, image: &Image) -> Option<Vec<u8>> {
    let start = cc.chain.start();
    let fallthrough = cc.chain.end();

    let (prefix_steps, tail) = match &cc.op.kind {
        OpKind::Arithmetic {
            op, result, dst, lhs, rhs, ..
        } => (Vec::new(), arithmetic(*op, *result, dst, lhs, rhs)?),
        OpKind::Compare {
            relation,
            result,
            dst,
            lhs,
            rhs,
            ..
        } => (Vec::new(), compare(*relation, *result, dst, lhs, rhs)?),
        OpKind::ConditionalBranch {
            index,
            true_target,
            false_target,
            ..
        } => {
            if !image.is_executable(*true_target) || !image.is_executable(*false_target) {
                return None;
            }
            let (replaced, read) = replaced_steps(&cc.steps)?;
            let read = read?;
            let tail = if cc.op.confidence == Confidence::Exact {
                let r = reg32(*index)?;
                let mut out = vec![Instruction::with2(Code::Test_rm32_r32, r, r).ok()?];
                if *true_target == fallthrough {
                    out.push(branch(Code::Je_rel32_32, *false_target)?);
                } else {
                    out.push(branch(Code::Jne_rel32_32, *true_target)?);
                    if *false_target != fallthrough {
                        out.push(branch(Code::Jmp_rel32_32, *false_target)?);
                    }
                }
                out
            } else {
                vec![jump_table(&read)?]
            };
            (keep(&cc.steps, &replaced), tail)
        }
        OpKind::IndirectBranch { targets, .. } => {
            let (replaced, read) = replaced_steps(&cc.steps)?;
            let tail = match targets.as_slice() {
                [t] if cc.op.confidence == Confidence::Exact => {
                    if !image.is_executable(*t) {
                        return None;
                    }
                    vec![branch(Code::Jmp_rel32_32, *t)?]
                }
                _ => vec![jump_table(&read?)?],
            };
            (keep(&cc.steps, &replaced), tail)
        }
        OpKind::Call {
            target: CallTarget::Code(t),
            ..
        } => {
            let (replaced, _) = replaced_steps(&cc.steps)?;
            (keep(&cc.steps, &replaced), vec![branch(Code::Call_rel32_32, *t)?])
        }
        OpKind::Call { .. } | OpKind::PlainMove | OpKind::Unknown => return None,
    };

    let mut bytes: Vec<u8> = prefix_steps
        .iter()
        .flat_map(|&i| cc.chain.insns[i].bytes().iter().copied())
        .collect();
    let ip = start + bytes.len() as Address;
    bytes.extend(encode(ip, &tail)?);
    Some(bytes)
}

fn keep(steps: &[Step], replaced: &[usize]) -> Vec<usize> {
    (0..steps.len()).filter(|i| !replaced.contains(i)).collect()
}
