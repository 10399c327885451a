//! Capstone-based x86-32 instruction decoder.

use std::fmt;

use capstone::arch::x86::{ArchMode as X86Mode, X86Operand, X86OperandType};
use capstone::prelude::*;
use capstone::RegId;

use crate::{Address, Decoder, Insn, MemRef, Operand, Reg, MAX_INSTRUCTION_SIZE};

/// Errors that can occur while preparing the decoder
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    /// Capstone error
    #[error("Capstone error: {0}")]
    CapstoneError(#[from] capstone::Error),
}

/// A Capstone decoder for 32-bit x86 with operand details enabled.
pub struct CapstoneDecoder {
    cs: Capstone,
}

impl CapstoneDecoder {
    /// Build the decoder.
    pub fn new() -> Result<Self, DecoderError> {
        let cs = Capstone::new()
            .x86()
            .mode(X86Mode::Mode32)
            .detail(true)
            .build()?;
        Ok(Self { cs })
    }

    fn reg(&self, id: RegId) -> Option<Reg> {
        if id == RegId::INVALID_REG {
            return None;
        }
        self.cs.reg_name(id)?.parse().ok()
    }

    fn operand(&self, op: &X86Operand) -> Option<Operand> {
        match op.op_type {
            X86OperandType::Reg(r) => self.reg(r).map(Operand::Reg),
            X86OperandType::Imm(v) => Some(Operand::Imm(v as u32)),
            X86OperandType::Mem(ref m) => Some(Operand::Mem(MemRef {
                segment: self.reg(m.segment()),
                base: self.reg(m.base()),
                index: self.reg(m.index()),
                scale: m.scale() as u8,
                disp: m.disp() as u32,
                size: op.size,
            })),
            _ => None,
        }
    }
}

impl fmt::Debug for CapstoneDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapstoneDecoder(x86-32)")
    }
}

impl Decoder for CapstoneDecoder {
    fn decode(&self, code: &[u8], at: Address) -> Option<Insn> {
        if code.is_empty() {
            return None;
        }

        // Only look at a small slice (16 bytes max)
        let slice = &code[..code.len().min(MAX_INSTRUCTION_SIZE)];
        let insns = self.cs.disasm_count(slice, at, 1).ok()?;
        let i = insns.iter().next()?;

        // Ensure instruction starts at the address we requested
        if i.address() != at {
            return None;
        }

        let detail = self.cs.insn_detail(&i).ok()?;
        let arch = detail.arch_detail();
        let x86 = arch.x86()?;
        let mut ops = Vec::new();
        for op in x86.operands() {
            // An operand we cannot model (x87, SSE) makes the instruction
            // opaque to the analysis, but it still decodes.
            match self.operand(&op) {
                Some(operand) => ops.push(operand),
                None => {
                    ops.clear();
                    break;
                }
            }
        }

        let mut bytes = [0u8; MAX_INSTRUCTION_SIZE];
        for (j, b) in i.bytes().iter().enumerate().take(MAX_INSTRUCTION_SIZE) {
            bytes[j] = *b;
        }

        Some(Insn {
            addr: i.address(),
            size: i.bytes().len() as u8,
            mnemonic: i.mnemonic().unwrap_or("").to_string(),
            operands: i.op_str().unwrap_or("").to_string(),
            bytes,
            ops,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Flow;

    #[test]
    fn test_decode_mov_imm() {
        // mov eax, 1
        let bytes = [0xb8, 0x01, 0x00, 0x00, 0x00];
        let decoder = CapstoneDecoder::new().unwrap();

        let insn = decoder.decode(&bytes, 0x1000).unwrap();
        assert_eq!(insn.mnemonic, "mov");
        assert_eq!(insn.size, 5);
        assert_eq!(insn.bytes(), &bytes);
        assert_eq!(insn.ops, vec![Operand::Reg(Reg::Eax), Operand::Imm(1)]);
    }

    #[test]
    fn test_decode_table_lookup() {
        // mov eax, dword ptr [eax*4 + 0x804a000]
        let bytes = [0x8b, 0x04, 0x85, 0x00, 0xa0, 0x04, 0x08];
        let decoder = CapstoneDecoder::new().unwrap();

        let insn = decoder.decode(&bytes, 0x1000).unwrap();
        assert!(insn.is_move());
        match insn.ops[1] {
            Operand::Mem(m) => {
                assert_eq!(m.base, None);
                assert_eq!(m.index, Some(Reg::Eax));
                assert_eq!(m.scale, 4);
                assert_eq!(m.disp, 0x804a000);
                assert_eq!(m.size, 4);
            }
            other => panic!("expected memory operand, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_branches() {
        let decoder = CapstoneDecoder::new().unwrap();

        // jmp eax
        let insn = decoder.decode(&[0xff, 0xe0], 0x1000).unwrap();
        assert_eq!(insn.flow(), Flow::Jump(None));

        // jmp +0x10 (rel8)
        let insn = decoder.decode(&[0xeb, 0x10], 0x1000).unwrap();
        assert_eq!(insn.flow(), Flow::Jump(Some(0x1012)));

        // ret
        let insn = decoder.decode(&[0xc3], 0x1000).unwrap();
        assert_eq!(insn.flow(), Flow::Stop);
    }

    #[test]
    fn test_decode_invalid() {
        let decoder = CapstoneDecoder::new().unwrap();
        assert!(decoder.decode(&[], 0x1000).is_none());
        // truncated mov eax, imm32
        assert!(decoder.decode(&[0xb8, 0x01], 0x1000).is_none());
    }
}
