//! Plain text dumps.

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::engine::Stats;
use crate::semantic::BlockAnalysis;
use crate::symbols::SymbolTable;
use crate::Address;

/// `0x%08x name` per line, in address order.
pub fn syms(syms: &SymbolTable) -> String {
    let mut out = String::new();
    for (addr, name) in syms.iter() {
        let _ = writeln!(out, "0x{:08x} {}", addr, name);
    }
    out
}

/// Recognised operations and the exit register state of every block.
pub fn regs(analysis: &BTreeMap<Address, BlockAnalysis>) -> String {
    let mut out = String::new();
    for (start, ba) in analysis {
        let _ = writeln!(out, "block 0x{:08x}:", start);
        for op in &ba.ops {
            let _ = writeln!(out, "  {}", op);
        }
        if ba.exit_state.is_empty() {
            continue;
        }
        let cells: Vec<String> = ba.exit_state.iter().map(|(loc, v)| format!("{}={}", loc, v)).collect();
        let _ = writeln!(out, "  state: {}", cells.join(" "));
    }
    out
}

pub fn stat(stats: &Stats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "blocks: {}", stats.blocks);
    let _ = writeln!(out, "scanned bytes: {}", stats.scanned_bytes);
    for (kind, n) in &stats.ops {
        let _ = writeln!(out, "{}: {}", kind, n);
    }
    let _ = writeln!(out, "recognised ops: {}", stats.recognised_ops);
    let _ = writeln!(out, "unknown ops: {}", stats.unknown_ops);
    let _ = writeln!(out, "unresolved edges: {}", stats.unresolved_edges);
    let _ = writeln!(out, "bytes patched: {}", stats.bytes_patched);
    let _ = writeln!(out, "patches applied: {}", stats.patches_applied);
    let _ = writeln!(out, "patches skipped: {}", stats.patches_skipped);
    out
}
