//! IDA symbol import script.

use std::fmt::Write;

use crate::symbols::SymbolTable;

/// One `MakeName` statement per symbol.
pub fn names(syms: &SymbolTable) -> String {
    let mut out = String::new();
    for (addr, name) in syms.iter() {
        let _ = writeln!(out, "\tMakeName(0x{:x}, \"{}\");", addr, name.replace('"', "\\\""));
    }
    out
}

/// The complete script: include directive and a single `main`.
pub fn script(syms: &SymbolTable) -> String {
    format!("#include <idc.idc>\n\nstatic main() {{\n{}}}\n", names(syms))
}
