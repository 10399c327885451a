//! Abstract register and memory state for interpreting move chains.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::{Address, Reg};

/// A tracked storage location: a 32-bit register or an absolute memory cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Reg(Reg),
    Mem(Address),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Reg(r) => write!(f, "{}", r),
            Location::Mem(addr) => write!(f, "[0x{:08x}]", addr),
        }
    }
}

/// What is known about a symbolic value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Any,
    /// Only 0 or 1
    Bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AbstractValue {
    Concrete(u32),
    Symbolic(Domain),
    /// Pointer to the row table of a lookup, `stride` bytes per entry
    TableRef { base: Address, stride: u8 },
}

impl Default for AbstractValue {
    fn default() -> Self {
        AbstractValue::Symbolic(Domain::Any)
    }
}

impl AbstractValue {
    pub const ANY: AbstractValue = AbstractValue::Symbolic(Domain::Any);
    pub const BOOL: AbstractValue = AbstractValue::Symbolic(Domain::Bool);

    pub fn concrete(&self) -> Option<u32> {
        match self {
            AbstractValue::Concrete(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, AbstractValue::Symbolic(Domain::Bool) | AbstractValue::Concrete(0 | 1))
    }

    /// The value as seen through an access of `width` bytes.
    pub fn truncate(self, width: u8) -> Self {
        match (self, width) {
            (_, 4) => self,
            (AbstractValue::Concrete(v), w) => AbstractValue::Concrete(v & mask(w)),
            (AbstractValue::Symbolic(Domain::Bool), _) => self,
            _ => AbstractValue::ANY,
        }
    }

    /// Sign-extend a `width`-byte value to 32 bits.
    pub fn sign_extend(self, width: u8) -> Self {
        match self {
            AbstractValue::Concrete(v) if width < 4 => {
                let bits = 8 * width as u32;
                let shift = 32 - bits;
                AbstractValue::Concrete((((v << shift) as i32) >> shift) as u32)
            }
            other => other,
        }
    }
}

impl fmt::Display for AbstractValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbstractValue::Concrete(v) => write!(f, "0x{:x}", v),
            AbstractValue::Symbolic(Domain::Any) => f.write_str("?"),
            AbstractValue::Symbolic(Domain::Bool) => f.write_str("bool"),
            AbstractValue::TableRef { base, stride } => write!(f, "table(0x{:x}, {})", base, stride),
        }
    }
}

/// Bit mask for a `width`-byte value.
pub fn mask(width: u8) -> u32 {
    match width {
        1 => 0xff,
        2 => 0xffff,
        _ => 0xffff_ffff,
    }
}

/// Map from location to abstract value; anything absent is `Symbolic(Any)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterState {
    cells: BTreeMap<Location, AbstractValue>,
    /// Access width of the store that produced each memory cell
    widths: BTreeMap<Address, u8>,
}

impl RegisterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, loc: Location) -> AbstractValue {
        self.cells.get(&loc).copied().unwrap_or_default()
    }

    fn set(&mut self, loc: Location, value: AbstractValue) {
        if value == AbstractValue::ANY {
            self.cells.remove(&loc);
        } else {
            self.cells.insert(loc, value);
        }
    }

    /// Value of a `width`-byte load from `addr`. Reads wider than the store
    /// that produced the cell see unknown upper bytes.
    pub fn load(&self, addr: Address, width: u8) -> AbstractValue {
        let value = self.get(Location::Mem(addr));
        match self.widths.get(&addr) {
            Some(&stored) if width <= stored => value.truncate(width),
            _ => AbstractValue::ANY,
        }
    }

    /// Record a `width`-byte store to `addr`, dropping overlapped cells.
    pub fn store(&mut self, addr: Address, width: u8, value: AbstractValue) {
        let lo = addr.saturating_sub(3);
        let hi = addr + width as Address;
        let stale: Vec<Address> = self
            .widths
            .range(lo..hi)
            .filter(|&(&a, &w)| a + w as Address > addr)
            .map(|(&a, _)| a)
            .collect();
        for a in stale {
            self.widths.remove(&a);
            self.cells.remove(&Location::Mem(a));
        }
        if value != AbstractValue::ANY {
            self.widths.insert(addr, width);
            self.cells.insert(Location::Mem(addr), value);
        }
    }

    /// Value of a register of any width.
    pub fn reg(&self, r: Reg) -> AbstractValue {
        let full = self.get(Location::Reg(r.full()));
        if r.width() == 4 {
            return full;
        }
        match full {
            AbstractValue::Concrete(v) => AbstractValue::Concrete((v >> r.shift()) & mask(r.width())),
            AbstractValue::Symbolic(Domain::Bool) if r.shift() == 0 => full,
            _ => AbstractValue::ANY,
        }
    }

    /// Write a register of any width, merging partial writes into the
    /// containing 32-bit register where the result is still known.
    pub fn set_reg(&mut self, r: Reg, value: AbstractValue) {
        let loc = Location::Reg(r.full());
        if r.width() == 4 {
            self.set(loc, value);
            return;
        }
        let m = mask(r.width()) << r.shift();
        let merged = match (self.get(loc), value) {
            (AbstractValue::Concrete(old), AbstractValue::Concrete(new)) => {
                AbstractValue::Concrete((old & !m) | ((new << r.shift()) & m))
            }
            _ => AbstractValue::ANY,
        };
        self.set(loc, merged);
    }

    /// Forget a register after something the chain cannot see clobbers it.
    pub fn forget_reg(&mut self, r: Reg) {
        self.cells.remove(&Location::Reg(r.full()));
    }

    /// Drop all memory knowledge, after a store through an unknown pointer.
    pub fn clear_memory(&mut self) {
        self.cells.retain(|loc, _| matches!(loc, Location::Reg(_)));
        self.widths.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Location, &AbstractValue)> {
        self.cells.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
