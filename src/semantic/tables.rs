//! Reading lookup and dispatch tables out of segment data.

use super::state::mask;
use super::{AluOp, Relation};
use crate::image::Image;
use crate::Address;

/// What a two-level lookup table computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableOp {
    Alu(AluOp),
    Cmp(Relation),
}

impl TableOp {
    fn eval(self, a: u32, b: u32) -> u32 {
        match self {
            TableOp::Alu(op) => op.apply(a, b),
            TableOp::Cmp(rel) => rel.holds(a, b) as u32,
        }
    }
}

/// True when `addr` lies in a loaded, non-executable segment.
pub fn points_to_data(image: &Image, addr: Address) -> bool {
    image.contains(addr) && !image.is_executable(addr)
}

/// Identify the operation behind the table `row = table[a]; v = row[b]` by
/// probing `probe`² operand pairs. Candidates are tried in a fixed order and
/// the first one agreeing with every probe wins.
pub fn identify(image: &Image, table: Address, outer_scale: u8, inner_scale: u8, width: u8, probe: u32) -> Option<TableOp> {
    if outer_scale != 4 || probe < 2 {
        return None;
    }

    let mut samples = Vec::with_capacity((probe * probe) as usize);
    for a in 0..probe {
        let row = image.read_u32(table + 4 * a as Address)? as Address;
        if !points_to_data(image, row) {
            return None;
        }
        for b in 0..probe {
            let v = image.read_uint(row + inner_scale as Address * b as Address, width)?;
            samples.push((a, b, v));
        }
    }

    let m = mask(width);
    AluOp::ALL
        .iter()
        .map(|&op| TableOp::Alu(op))
        .chain(Relation::ALL.iter().map(|&rel| TableOp::Cmp(rel)))
        .find(|op| samples.iter().all(|&(a, b, v)| op.eval(a, b) & m == v))
}

/// Entries of a dispatch table, read until the first entry that does not
/// point into executable code or `max` entries.
pub fn dispatch_entries(image: &Image, table: Address, max: usize) -> Vec<Address> {
    let mut entries = Vec::new();
    for i in 0..max {
        match image.read_u32(table + 4 * i as Address) {
            Some(p) if image.is_executable(p as Address) => entries.push(p as Address),
            _ => break,
        }
    }
    entries
}
