//! Core IR, traits and errors for the demov deobfuscation engine.
//!
//! demov takes a binary produced by a mov-only compiler (every instruction is a
//! `mov`, control flow and arithmetic are encoded as table lookups), recovers
//! its control-flow graph, recognises the move-chain idioms that stand in for
//! arithmetic, comparisons, branches and calls, and patches equivalent compact
//! instructions back into the image.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use std::fs;
//! use demov::{parser::{GoblinParser, Loader}, engine::Demov, resub::ResubOptions};
//!
//! let data = fs::read("path/to/binary").unwrap();
//! let loaded = GoblinParser::new().load(data).unwrap();
//!
//! let mut de = Demov::init().unwrap();
//! de.bind_entry_point(loaded.entry).unwrap();
//! de.bind_relocations(loaded.relocations).unwrap();
//! de.bind_segments(loaded.image).unwrap();
//!
//! de.parse_entry().unwrap();
//! de.scan().unwrap();
//! de.analyse().unwrap();
//! for (start, end) in de.blocks() {
//!     de.resub(start, end - start, &ResubOptions::default()).unwrap();
//! }
//! println!("{}", de.dump_syms());
//! ```

pub mod image;
pub mod parser;
pub mod decoder;
pub mod cfg;
pub mod scanner;
pub mod semantic;
pub mod resub;
pub mod symbols;
pub mod format;
pub mod engine;
pub mod driver;
#[cfg(test)]
mod testutil;
#[cfg(test)]
mod scenario_tests;

/// Represents an address in memory
pub type Address = u64;

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// Maximum instruction size in bytes
pub const MAX_INSTRUCTION_SIZE: usize = 16;

/// x86-32 registers as seen by the analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Reg {
    Eax,
    Ecx,
    Edx,
    Ebx,
    Esp,
    Ebp,
    Esi,
    Edi,
    Ax,
    Cx,
    Dx,
    Bx,
    Sp,
    Bp,
    Si,
    Di,
    Al,
    Cl,
    Dl,
    Bl,
    Ah,
    Ch,
    Dh,
    Bh,
    Cs,
    Ds,
    Es,
    Fs,
    Gs,
    Ss,
}

impl Reg {
    const NAMES: [(&'static str, Reg); 30] = [
        ("eax", Reg::Eax),
        ("ecx", Reg::Ecx),
        ("edx", Reg::Edx),
        ("ebx", Reg::Ebx),
        ("esp", Reg::Esp),
        ("ebp", Reg::Ebp),
        ("esi", Reg::Esi),
        ("edi", Reg::Edi),
        ("ax", Reg::Ax),
        ("cx", Reg::Cx),
        ("dx", Reg::Dx),
        ("bx", Reg::Bx),
        ("sp", Reg::Sp),
        ("bp", Reg::Bp),
        ("si", Reg::Si),
        ("di", Reg::Di),
        ("al", Reg::Al),
        ("cl", Reg::Cl),
        ("dl", Reg::Dl),
        ("bl", Reg::Bl),
        ("ah", Reg::Ah),
        ("ch", Reg::Ch),
        ("dh", Reg::Dh),
        ("bh", Reg::Bh),
        ("cs", Reg::Cs),
        ("ds", Reg::Ds),
        ("es", Reg::Es),
        ("fs", Reg::Fs),
        ("gs", Reg::Gs),
        ("ss", Reg::Ss),
    ];

    /// The 32-bit register this register is part of.
    pub fn full(self) -> Reg {
        use Reg::*;
        match self {
            Ax | Al | Ah => Eax,
            Cx | Cl | Ch => Ecx,
            Dx | Dl | Dh => Edx,
            Bx | Bl | Bh => Ebx,
            Sp => Esp,
            Bp => Ebp,
            Si => Esi,
            Di => Edi,
            other => other,
        }
    }

    /// Width in bytes.
    pub fn width(self) -> u8 {
        use Reg::*;
        match self {
            Eax | Ecx | Edx | Ebx | Esp | Ebp | Esi | Edi => 4,
            Al | Cl | Dl | Bl | Ah | Ch | Dh | Bh => 1,
            _ => 2,
        }
    }

    /// Bit offset of this register inside its 32-bit parent.
    pub fn shift(self) -> u32 {
        match self {
            Reg::Ah | Reg::Ch | Reg::Dh | Reg::Bh => 8,
            _ => 0,
        }
    }

    /// Low byte register of a 32-bit register, where one exists.
    pub fn low_byte(self) -> Option<Reg> {
        match self.full() {
            Reg::Eax => Some(Reg::Al),
            Reg::Ecx => Some(Reg::Cl),
            Reg::Edx => Some(Reg::Dl),
            Reg::Ebx => Some(Reg::Bl),
            _ => None,
        }
    }

    pub fn is_segment(self) -> bool {
        matches!(self, Reg::Cs | Reg::Ds | Reg::Es | Reg::Fs | Reg::Gs | Reg::Ss)
    }

    pub fn name(self) -> &'static str {
        Self::NAMES
            .iter()
            .find(|(_, r)| *r == self)
            .map(|(n, _)| *n)
            .unwrap_or("?")
    }
}

impl FromStr for Reg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        Self::NAMES
            .iter()
            .find(|(n, _)| *n == lower)
            .map(|(_, r)| *r)
            .ok_or_else(|| format!("Unknown register: {}", s))
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A memory operand `segment:[base + index*scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MemRef {
    pub segment: Option<Reg>,
    pub base: Option<Reg>,
    pub index: Option<Reg>,
    pub scale: u8,
    pub disp: u32,
    /// Access size in bytes
    pub size: u8,
}

impl MemRef {
    /// An absolute `[disp]` reference of `size` bytes.
    pub fn absolute(addr: Address, size: u8) -> Self {
        Self {
            segment: None,
            base: None,
            index: None,
            scale: 1,
            disp: addr as u32,
            size,
        }
    }

    /// The referenced address when neither base nor index is used.
    pub fn absolute_address(&self) -> Option<Address> {
        if self.base.is_none() && self.index.is_none() {
            Some(self.disp as Address)
        } else {
            None
        }
    }
}

impl fmt::Display for MemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ptr = match self.size {
            1 => "byte",
            2 => "word",
            _ => "dword",
        };
        write!(f, "{} [", ptr)?;
        let mut first = true;
        if let Some(base) = self.base {
            write!(f, "{}", base)?;
            first = false;
        }
        if let Some(index) = self.index {
            if !first {
                f.write_str(" + ")?;
            }
            write!(f, "{}*{}", index, self.scale)?;
            first = false;
        }
        if self.disp != 0 || first {
            if !first {
                f.write_str(" + ")?;
            }
            write!(f, "0x{:x}", self.disp)?;
        }
        f.write_str("]")
    }
}

/// One instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Operand {
    Reg(Reg),
    Imm(u32),
    Mem(MemRef),
}

impl Operand {
    /// Size of the operand in bytes (immediates report 4).
    pub fn size(&self) -> u8 {
        match self {
            Operand::Reg(r) => r.width(),
            Operand::Imm(_) => 4,
            Operand::Mem(m) => m.size,
        }
    }

    /// True for operands that need no register to locate: immediates,
    /// registers and absolute memory.
    pub fn is_direct(&self) -> bool {
        match self {
            Operand::Mem(m) => m.absolute_address().is_some(),
            _ => true,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "{}", r),
            Operand::Imm(v) => write!(f, "0x{:x}", v),
            Operand::Mem(m) => write!(f, "{}", m),
        }
    }
}

/// How an instruction hands control onward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Execution continues with the next instruction
    Sequential,
    /// Unconditional jump; `None` when the target is computed
    Jump(Option<Address>),
    /// Conditional branch to a fixed target, else fall through
    CondBranch(Address),
    /// Call; `None` when the target is computed
    Call(Option<Address>),
    /// Return or an instruction that never falls through (hlt, ud2, the
    /// `mov cs, ...` trap used to restart the main loop)
    Stop,
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insn {
    /// Address of the instruction
    pub addr: Address,
    /// Size of the instruction in bytes
    pub size: u8,
    /// Instruction mnemonic (e.g., "mov", "jmp")
    pub mnemonic: String,
    /// Instruction operands as string representation
    pub operands: String,
    /// Raw bytes of the instruction (up to MAX_INSTRUCTION_SIZE)
    pub bytes: [u8; MAX_INSTRUCTION_SIZE],
    /// Structured operands, destination first
    pub ops: Vec<Operand>,
}

impl Insn {
    /// Returns the instruction bytes, up to the actual instruction size.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.size as usize]
    }

    /// Address of the next instruction.
    pub fn end(&self) -> Address {
        self.addr + self.size as Address
    }

    /// True for the data-movement instructions chains are built from.
    pub fn is_move(&self) -> bool {
        matches!(self.mnemonic.as_str(), "mov" | "movzx" | "movsx")
            && self.ops.len() == 2
            && !self.ops.iter().any(|op| matches!(op, Operand::Reg(r) if r.is_segment()))
    }

    /// True for `jmp`/`call` through a register or memory operand.
    pub fn is_indirect_transfer(&self) -> bool {
        matches!(self.flow(), Flow::Jump(None) | Flow::Call(None))
    }

    fn direct_target(&self) -> Option<Address> {
        match self.ops.first() {
            Some(Operand::Imm(target)) => Some(*target as Address),
            _ => None,
        }
    }

    /// Classify the control transfer performed by this instruction.
    pub fn flow(&self) -> Flow {
        let m = self.mnemonic.as_str();
        match m {
            "jmp" | "ljmp" => Flow::Jump(self.direct_target()),
            "call" | "lcall" => Flow::Call(self.direct_target()),
            "ret" | "retf" | "iret" | "iretd" | "hlt" | "ud2" => Flow::Stop,
            "mov" if matches!(self.ops.first(), Some(Operand::Reg(Reg::Cs))) => Flow::Stop,
            _ if m.starts_with('j') || m.starts_with("loop") => match self.direct_target() {
                Some(target) => Flow::CondBranch(target),
                None => Flow::Jump(None),
            },
            _ => Flow::Sequential,
        }
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}", self.mnemonic, self.operands)
    }
}

/// Decoder trait: architecture-specific disassembler.
pub trait Decoder {
    /// Decode a single instruction.
    ///
    /// # Arguments
    /// * `code` - Bytes starting at the instruction
    /// * `at` - Virtual address of `code[0]`
    ///
    /// # Returns
    /// Some(Insn) if an instruction was successfully decoded, None otherwise
    fn decode(&self, code: &[u8], at: Address) -> Option<Insn>;
}

/// Error type for engine operations
#[derive(Debug, thiserror::Error)]
pub enum DemovError {
    /// Internal state could not be prepared
    #[error("Failed to initialise engine: {0}")]
    Init(String),

    /// A one-time binding was invoked again
    #[error("{0} already bound")]
    Rebind(&'static str),

    /// An operation ran before its prerequisites were bound
    #[error("{0} not bound")]
    Unbound(&'static str),

    /// Entry point outside every executable segment
    #[error("Entry point 0x{0:x} is not inside an executable segment")]
    InvalidEntry(Address),

    /// Address outside the bound image
    #[error("Address 0x{0:x} is outside the bound image")]
    OutOfBounds(Address),

    /// Failed to parse binary format
    #[error("Failed to parse binary format: {0}")]
    Parsing(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insn(mnemonic: &str, ops: Vec<Operand>) -> Insn {
        Insn {
            addr: 0x1000,
            size: 2,
            mnemonic: mnemonic.to_string(),
            operands: String::new(),
            bytes: [0; MAX_INSTRUCTION_SIZE],
            ops,
        }
    }

    #[test]
    fn test_insn_bytes() {
        let mut i = insn("add", vec![Operand::Reg(Reg::Eax), Operand::Reg(Reg::Ebx)]);
        i.bytes[..2].copy_from_slice(&[0x01, 0xd8]);

        assert_eq!(i.bytes(), &[0x01, 0xd8]);
        assert_eq!(i.end(), 0x1002);
    }

    #[test]
    fn test_register_families() {
        assert_eq!(Reg::Ah.full(), Reg::Eax);
        assert_eq!(Reg::Ah.shift(), 8);
        assert_eq!(Reg::Si.full(), Reg::Esi);
        assert_eq!(Reg::Esi.low_byte(), None);
        assert_eq!(Reg::Edx.low_byte(), Some(Reg::Dl));
        assert_eq!("EAX".parse::<Reg>().unwrap(), Reg::Eax);
        assert!("xmm0".parse::<Reg>().is_err());
    }

    #[test]
    fn test_flow_classification() {
        let jmp = insn("jmp", vec![Operand::Imm(0x2000)]);
        assert_eq!(jmp.flow(), Flow::Jump(Some(0x2000)));

        let jmp_reg = insn("jmp", vec![Operand::Reg(Reg::Eax)]);
        assert_eq!(jmp_reg.flow(), Flow::Jump(None));
        assert!(jmp_reg.is_indirect_transfer());

        let je = insn("je", vec![Operand::Imm(0x3000)]);
        assert_eq!(je.flow(), Flow::CondBranch(0x3000));

        let trap = insn("mov", vec![Operand::Reg(Reg::Cs), Operand::Reg(Reg::Ax)]);
        assert_eq!(trap.flow(), Flow::Stop);
        assert!(!trap.is_move());

        let mov = insn("mov", vec![Operand::Reg(Reg::Eax), Operand::Imm(1)]);
        assert_eq!(mov.flow(), Flow::Sequential);
        assert!(mov.is_move());
    }

    #[test]
    fn test_mem_display() {
        let m = MemRef {
            segment: None,
            base: Some(Reg::Eax),
            index: Some(Reg::Edx),
            scale: 4,
            disp: 0x10,
            size: 4,
        };
        assert_eq!(m.to_string(), "dword [eax + edx*4 + 0x10]");
        assert_eq!(MemRef::absolute(0x804a000, 1).to_string(), "byte [0x804a000]");
    }
}
