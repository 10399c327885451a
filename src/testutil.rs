//! Helpers for building small x86-32 test images.

use iced_x86::{BlockEncoder, BlockEncoderOptions, Code, Instruction, InstructionBlock, MemoryOperand, Register};

use crate::image::{Image, Segment, SegmentFlags};
use crate::Address;

pub const CODE: Address = 0x8048000;
pub const DATA: Address = 0x804a000;
pub const SEGMENT_SIZE: usize = 0x1000;

/// Assemble `insns` as if placed at `ip`.
pub fn assemble(ip: Address, insns: &[Instruction]) -> Vec<u8> {
    BlockEncoder::encode(32, InstructionBlock::new(insns, ip), BlockEncoderOptions::NONE)
        .unwrap()
        .code_buffer
}

fn abs(addr: Address) -> MemoryOperand {
    MemoryOperand::with_base_index_scale_displ_size(Register::None, Register::None, 1, addr as i32 as i64, 4)
}

fn based(base: Register, disp: Address) -> MemoryOperand {
    MemoryOperand::with_base_index_scale_displ_size(base, Register::None, 1, disp as i32 as i64, 4)
}

/// `mov r32, imm`
pub fn mov_imm(r: Register, v: u32) -> Instruction {
    Instruction::with2(Code::Mov_r32_imm32, r, v).unwrap()
}

/// `mov r32, [addr]`
pub fn load(r: Register, addr: Address) -> Instruction {
    Instruction::with2(Code::Mov_r32_rm32, r, abs(addr)).unwrap()
}

/// `mov [addr], r32`
pub fn store(addr: Address, r: Register) -> Instruction {
    Instruction::with2(Code::Mov_rm32_r32, abs(addr), r).unwrap()
}

/// `mov byte [addr], r8`
pub fn store8(addr: Address, r: Register) -> Instruction {
    Instruction::with2(Code::Mov_rm8_r8, abs(addr), r).unwrap()
}

/// `movzx r32, byte [addr]`
pub fn movzx8(r: Register, addr: Address) -> Instruction {
    Instruction::with2(Code::Movzx_r32_rm8, r, abs(addr)).unwrap()
}

/// `mov dst, [index*4 + table]`
pub fn lookup(dst: Register, table: Address, index: Register) -> Instruction {
    let mem = MemoryOperand::with_base_index_scale_displ_size(Register::None, index, 4, table as i32 as i64, 4);
    Instruction::with2(Code::Mov_r32_rm32, dst, mem).unwrap()
}

/// `mov dst, [row + index*4]`
pub fn row_lookup(dst: Register, row: Register, index: Register) -> Instruction {
    let mem = MemoryOperand::with_base_index_scale_displ_size(row, index, 4, 0, 0);
    Instruction::with2(Code::Mov_r32_rm32, dst, mem).unwrap()
}

/// `mov r32, [base]`
pub fn load_via(dst: Register, base: Register) -> Instruction {
    Instruction::with2(Code::Mov_r32_rm32, dst, based(base, 0)).unwrap()
}

/// `mov byte [base + disp], imm8`
pub fn store_byte_via(base: Register, disp: Address, v: u32) -> Instruction {
    Instruction::with2(Code::Mov_rm8_imm8, based(base, disp), v).unwrap()
}

/// `mov r8, byte [base + disp]`
pub fn load_byte_via(dst: Register, base: Register, disp: Address) -> Instruction {
    Instruction::with2(Code::Mov_r8_rm8, dst, based(base, disp)).unwrap()
}

pub fn jmp(target: Address) -> Instruction {
    Instruction::with_branch(Code::Jmp_rel32_32, target).unwrap()
}

pub fn jmp_reg(r: Register) -> Instruction {
    Instruction::with1(Code::Jmp_rm32, r).unwrap()
}

pub fn call(target: Address) -> Instruction {
    Instruction::with_branch(Code::Call_rel32_32, target).unwrap()
}

pub fn call_reg(r: Register) -> Instruction {
    Instruction::with1(Code::Call_rm32, r).unwrap()
}

pub fn ret() -> Instruction {
    Instruction::with(Code::Retnd)
}

/// Ten moves and a return: enough to look movfuscated.
pub fn mov_chain_with_ret() -> Vec<Instruction> {
    let mut insns: Vec<Instruction> = (0..10u32)
        .map(|i| match i % 3 {
            0 => mov_imm(Register::EAX, i),
            1 => load(Register::EDX, DATA + 4 * i as Address),
            _ => store(DATA + 4 * i as Address, Register::EAX),
        })
        .collect();
    insns.push(ret());
    insns
}

/// A code segment (RX) at `CODE` and a data segment (RW) at `DATA`.
#[derive(Debug, Clone)]
pub struct Fixture {
    code: Vec<u8>,
    data: Vec<u8>,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            code: vec![0xcc; SEGMENT_SIZE],
            data: vec![0; SEGMENT_SIZE],
        }
    }

    /// Place assembled `insns` at `addr`, returning their length.
    pub fn code(&mut self, addr: Address, insns: &[Instruction]) -> usize {
        let bytes = assemble(addr, insns);
        let off = (addr - CODE) as usize;
        self.code[off..off + bytes.len()].copy_from_slice(&bytes);
        bytes.len()
    }

    pub fn data_u32(&mut self, addr: Address, v: u32) {
        let off = (addr - DATA) as usize;
        self.data[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Two-level lookup table of `n` rows by `n` dwords, row `a` column `b`
    /// holding `f(a, b)`.
    pub fn table2(&mut self, table: Address, rows: Address, n: u32, f: impl Fn(u32, u32) -> u32) {
        for a in 0..n {
            let row = rows + (a * n * 4) as Address;
            self.data_u32(table + 4 * a as Address, row as u32);
            for b in 0..n {
                self.data_u32(row + 4 * b as Address, f(a, b));
            }
        }
    }

    pub fn image(&self) -> Image {
        let mut buf = self.code.clone();
        buf.extend_from_slice(&self.data);
        Image::new(
            buf,
            vec![
                Segment {
                    base: CODE,
                    size: SEGMENT_SIZE as u64,
                    data_len: SEGMENT_SIZE as u64,
                    offset: 0,
                    flags: SegmentFlags::R | SegmentFlags::X,
                },
                Segment {
                    base: DATA,
                    size: SEGMENT_SIZE as u64,
                    data_len: SEGMENT_SIZE as u64,
                    offset: SEGMENT_SIZE,
                    flags: SegmentFlags::R | SegmentFlags::W,
                },
            ],
        )
    }

    pub fn elf(&self) -> Vec<u8> {
        elf32(CODE, &self.code, DATA, &self.data)
    }
}

/// Minimal ELF32 executable with two PT_LOAD segments and no sections.
/// Entry is the start of the code segment.
pub fn elf32(code_base: Address, code: &[u8], data_base: Address, data: &[u8]) -> Vec<u8> {
    const CODE_OFFSET: usize = 0x100;
    let data_offset = (CODE_OFFSET + code.len() + 0xf) & !0xf;

    let mut out = Vec::new();
    // e_ident
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]);
    out.extend_from_slice(&[0; 8]);
    let u16le = |out: &mut Vec<u8>, v: u16| out.extend_from_slice(&v.to_le_bytes());
    let u32le = |out: &mut Vec<u8>, v: u32| out.extend_from_slice(&v.to_le_bytes());
    u16le(&mut out, 2); // ET_EXEC
    u16le(&mut out, 3); // EM_386
    u32le(&mut out, 1);
    u32le(&mut out, code_base as u32);
    u32le(&mut out, 52); // e_phoff
    u32le(&mut out, 0); // e_shoff
    u32le(&mut out, 0);
    u16le(&mut out, 52);
    u16le(&mut out, 32);
    u16le(&mut out, 2);
    u16le(&mut out, 40);
    u16le(&mut out, 0);
    u16le(&mut out, 0);

    let phdr = |out: &mut Vec<u8>, offset: usize, vaddr: Address, len: usize, flags: u32| {
        u32le(out, 1); // PT_LOAD
        u32le(out, offset as u32);
        u32le(out, vaddr as u32);
        u32le(out, vaddr as u32);
        u32le(out, len as u32);
        u32le(out, len as u32);
        u32le(out, flags);
        u32le(out, 0x1000);
    };
    phdr(&mut out, CODE_OFFSET, code_base, code.len(), 0x5);
    phdr(&mut out, data_offset, data_base, data.len(), 0x6);

    out.resize(CODE_OFFSET, 0);
    out.extend_from_slice(code);
    out.resize(data_offset, 0);
    out.extend_from_slice(data);
    out
}
