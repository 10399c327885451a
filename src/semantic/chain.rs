//! Move chains and their step-by-step abstract interpretation.

use std::collections::BTreeSet;

use super::state::{AbstractValue, RegisterState};
use super::tables;
use crate::image::Image;
use crate::{Address, Flow, Insn, MemRef, Operand, Reg};

/// A contiguous run of move-family instructions, optionally closed by an
/// indirect jump or call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveChain {
    pub insns: Vec<Insn>,
}

impl MoveChain {
    pub fn start(&self) -> Address {
        self.insns.first().map_or(0, |i| i.addr)
    }

    pub fn end(&self) -> Address {
        self.insns.last().map_or(0, Insn::end)
    }

    /// Length of the chain in bytes
    pub fn byte_len(&self) -> usize {
        (self.end() - self.start()) as usize
    }
}

fn stores_absolute(insn: &Insn) -> bool {
    matches!(insn.ops.first(), Some(Operand::Mem(m)) if m.absolute_address().is_some())
}

/// Cut a block's instructions into move chains. A chain closes after an
/// absolute store, after an indirect transfer, or before any instruction
/// that is not a move.
pub fn split_chains(insns: &[Insn]) -> Vec<MoveChain> {
    let mut chains = Vec::new();
    let mut current = Vec::new();

    let mut flush = |current: &mut Vec<Insn>| {
        if !current.is_empty() {
            chains.push(MoveChain {
                insns: std::mem::take(current),
            });
        }
    };

    for insn in insns {
        if insn.is_indirect_transfer() {
            current.push(insn.clone());
            flush(&mut current);
        } else if insn.is_move() {
            current.push(insn.clone());
            if stores_absolute(insn) {
                flush(&mut current);
            }
        } else {
            flush(&mut current);
        }
    }
    flush(&mut current);
    chains
}

/// First level of a lookup: a fixed table address, or a row selected
/// through a pointer loaded from the two-level table `Row(table)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableBase {
    Fixed(Address),
    Row(Address),
}

/// An indexed table read `[base + index*scale]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRead {
    pub table: TableBase,
    /// Register holding the table or row pointer, if any
    pub base: Option<Reg>,
    pub index: Reg,
    pub index_value: AbstractValue,
    pub scale: u8,
    pub width: u8,
}

/// One interpreted chain instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Direct operand to direct operand
    Move {
        dst: Operand,
        src: Operand,
        value: AbstractValue,
        signed: bool,
    },
    Lookup {
        dst: Reg,
        read: TableRead,
        value: AbstractValue,
    },
    /// `[base + disp] := src` through a register we know nothing about
    IndirectStore {
        base: Reg,
        disp: u32,
        size: u8,
        src: Operand,
    },
    IndirectLoad {
        dst: Reg,
        base: Reg,
        disp: u32,
    },
    Transfer {
        call: bool,
        via: Operand,
        read: Option<TableRead>,
        value: AbstractValue,
    },
    Opaque,
}

impl Step {
    /// Register written by this step.
    pub fn writes(&self) -> Option<Reg> {
        match self {
            Step::Move { dst: Operand::Reg(r), .. } => Some(*r),
            Step::Lookup { dst, .. } | Step::IndirectLoad { dst, .. } => Some(*dst),
            _ => None,
        }
    }

    pub fn value(&self) -> AbstractValue {
        match self {
            Step::Move { value, .. } | Step::Lookup { value, .. } | Step::Transfer { value, .. } => *value,
            _ => AbstractValue::ANY,
        }
    }
}

/// Index of the last step before `before` that writes any part of `reg`.
pub fn def_before(steps: &[Step], reg: Reg, before: usize) -> Option<usize> {
    steps[..before.min(steps.len())]
        .iter()
        .rposition(|s| s.writes().map_or(false, |w| w.full() == reg.full()))
}

/// The direct operand whose value `reg` holds just before step `before`,
/// following register-to-register moves. Steps that contribute are added
/// to `used`. `None` when the value comes from something other than a
/// plain move.
pub fn origin(steps: &[Step], reg: Reg, before: usize, used: &mut BTreeSet<usize>) -> Option<Operand> {
    let Some(i) = def_before(steps, reg, before) else {
        return Some(Operand::Reg(reg));
    };
    match &steps[i] {
        Step::Move {
            dst: Operand::Reg(d),
            src,
            signed,
            ..
        } if *d == reg => {
            if *signed && src.size() < reg.width() {
                return None;
            }
            used.insert(i);
            match *src {
                Operand::Reg(s) => origin(steps, s, i, used),
                other => Some(other),
            }
        }
        _ => None,
    }
}

enum Addressing {
    Absolute(Address),
    Table(TableRead),
    Via(Reg, u32),
    Unknown,
}

fn address(m: &MemRef, state: &RegisterState) -> Addressing {
    if !matches!(m.segment, None | Some(Reg::Ds)) {
        return Addressing::Unknown;
    }
    match (m.base, m.index) {
        (None, None) => Addressing::Absolute(m.disp as Address),
        (Some(b), None) => match state.reg(b) {
            AbstractValue::Concrete(c) => Addressing::Absolute(c.wrapping_add(m.disp) as Address),
            _ => Addressing::Via(b, m.disp),
        },
        (base, Some(index)) => {
            let table = match base.map(|b| state.reg(b)) {
                None => TableBase::Fixed(m.disp as Address),
                Some(AbstractValue::Concrete(c)) => TableBase::Fixed(c.wrapping_add(m.disp) as Address),
                Some(AbstractValue::TableRef { base: t, .. }) if m.disp == 0 => TableBase::Row(t),
                Some(_) => return Addressing::Unknown,
            };
            Addressing::Table(TableRead {
                table,
                base,
                index,
                index_value: state.reg(index),
                scale: m.scale,
                width: m.size,
            })
        }
    }
}

/// Memory we know about, or read-only image data.
fn load_cell(addr: Address, width: u8, state: &RegisterState, image: &Image) -> AbstractValue {
    let known = state.load(addr, width);
    if known != AbstractValue::ANY {
        return known;
    }
    match image.segment_of(addr) {
        Some(seg) if !seg.flags.contains(crate::image::SegmentFlags::W) => image
            .read_uint(addr, width)
            .map_or(AbstractValue::ANY, AbstractValue::Concrete),
        _ => AbstractValue::ANY,
    }
}

/// Value produced by a table read, from the bound image data.
fn table_value(read: &TableRead, image: &Image) -> AbstractValue {
    let TableBase::Fixed(table) = read.table else {
        return AbstractValue::ANY;
    };
    match read.index_value {
        AbstractValue::Concrete(i) => {
            let at = table.wrapping_add(i as Address * read.scale as Address);
            image
                .read_uint(at, read.width)
                .map_or(AbstractValue::ANY, AbstractValue::Concrete)
        }
        // Unknown index into a table of data pointers: a row table
        _ if read.width == 4 && read.scale == 4 => match image.read_u32(table) {
            Some(p) if tables::points_to_data(image, p as Address) => AbstractValue::TableRef {
                base: table,
                stride: read.scale,
            },
            _ => AbstractValue::ANY,
        },
        _ => AbstractValue::ANY,
    }
}

enum Source {
    Direct(Operand),
    Table(TableRead),
    Indirect(Reg, u32),
    Opaque,
}

fn interpret_insn(insn: &Insn, state: &mut RegisterState, image: &Image) -> Step {
    if insn.is_indirect_transfer() {
        let call = matches!(insn.flow(), Flow::Call(_));
        let (via, read, value) = match insn.ops.first() {
            Some(&Operand::Reg(r)) => (Operand::Reg(r), None, state.reg(r)),
            Some(&Operand::Mem(m)) => match address(&m, state) {
                Addressing::Absolute(a) => (Operand::Mem(MemRef::absolute(a, 4)), None, load_cell(a, 4, state, image)),
                Addressing::Table(read) => (Operand::Mem(m), Some(read), table_value(&read, image)),
                _ => (Operand::Mem(m), None, AbstractValue::ANY),
            },
            _ => return Step::Opaque,
        };
        if call {
            // cdecl scratch registers and any memory may change
            for r in [Reg::Eax, Reg::Ecx, Reg::Edx] {
                state.forget_reg(r);
            }
            state.clear_memory();
        }
        return Step::Transfer { call, via, read, value };
    }

    let (dst, src) = match insn.ops.as_slice() {
        [dst, src] => (*dst, *src),
        _ => return Step::Opaque,
    };

    let (source, value) = match src {
        Operand::Imm(v) => (Source::Direct(src), AbstractValue::Concrete(v)),
        Operand::Reg(r) => (Source::Direct(src), state.reg(r)),
        Operand::Mem(m) => match address(&m, state) {
            Addressing::Absolute(a) => (
                Source::Direct(Operand::Mem(MemRef::absolute(a, m.size))),
                load_cell(a, m.size, state, image),
            ),
            Addressing::Table(read) => (Source::Table(read), table_value(&read, image)),
            Addressing::Via(b, disp) => (Source::Indirect(b, disp), AbstractValue::ANY),
            Addressing::Unknown => (Source::Opaque, AbstractValue::ANY),
        },
    };
    let signed = insn.mnemonic == "movsx";
    let value = match insn.mnemonic.as_str() {
        "movzx" => value.truncate(src.size()),
        "movsx" => value.truncate(src.size()).sign_extend(src.size()),
        _ => value,
    };

    match dst {
        Operand::Reg(r) => {
            state.set_reg(r, value);
            match source {
                Source::Direct(src) => Step::Move { dst, src, value, signed },
                Source::Table(read) => Step::Lookup { dst: r, read, value },
                Source::Indirect(base, disp) => Step::IndirectLoad { dst: r, base, disp },
                Source::Opaque => Step::Opaque,
            }
        }
        Operand::Mem(m) => {
            let Source::Direct(src) = source else {
                state.clear_memory();
                return Step::Opaque;
            };
            match address(&m, state) {
                Addressing::Absolute(a) => {
                    state.store(a, m.size, value);
                    Step::Move {
                        dst: Operand::Mem(MemRef::absolute(a, m.size)),
                        src,
                        value,
                        signed,
                    }
                }
                Addressing::Via(base, disp) => {
                    state.clear_memory();
                    Step::IndirectStore {
                        base,
                        disp,
                        size: m.size,
                        src,
                    }
                }
                _ => {
                    state.clear_memory();
                    Step::Opaque
                }
            }
        }
        Operand::Imm(_) => Step::Opaque,
    }
}

/// Interpret `chain` against `state`, one step per instruction.
pub fn interpret(chain: &MoveChain, state: &mut RegisterState, image: &Image) -> Vec<Step> {
    chain
        .insns
        .iter()
        .map(|insn| interpret_insn(insn, state, image))
        .collect()
}
