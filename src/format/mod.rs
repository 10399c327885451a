//! Renderers for the engine's reports.
//!
//! Everything here is a pure function over already computed state: the
//! flow and call graphs in Graphviz dot, the symbol table as text or as an
//! IDA script, register snapshots, statistics and a JSON report.

pub mod dot;
pub mod idc;
pub mod json;
pub mod text;

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;

use crate::Address;

/// Quoted dot node id for an address.
pub(crate) fn node(addr: Address) -> String {
    format!("\"0x{:08x}\"", addr)
}

/// Report that can be printed to stdout after processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Dump {
    /// Flow graph (dot)
    Flow,
    /// Call graph (dot)
    Calls,
    /// Symbols in address order
    Syms,
    /// IDA symbol script
    Idc,
    /// Register state at the end of each block
    Regs,
    /// Statistics
    Stat,
    /// Full JSON report
    Json,
}

impl Dump {
    pub fn all() -> &'static [Dump] {
        &[
            Dump::Flow,
            Dump::Calls,
            Dump::Syms,
            Dump::Idc,
            Dump::Regs,
            Dump::Stat,
            Dump::Json,
        ]
    }
}

impl fmt::Display for Dump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Dump::Flow => "flow",
            Dump::Calls => "calls",
            Dump::Syms => "syms",
            Dump::Idc => "idc",
            Dump::Regs => "regs",
            Dump::Stat => "stat",
            Dump::Json => "json",
        };
        f.write_str(s)
    }
}

impl FromStr for Dump {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dump::all()
            .iter()
            .copied()
            .find(|d| d.to_string() == s.to_lowercase())
            .ok_or_else(|| format!("Unknown dump: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_names() {
        for dump in Dump::all() {
            assert_eq!(dump.to_string().parse::<Dump>(), Ok(*dump));
        }
        assert_eq!("SYMS".parse::<Dump>(), Ok(Dump::Syms));
        assert!("csv".parse::<Dump>().is_err());
    }

    #[test]
    fn test_node_id() {
        assert_eq!(node(0x8048000), "\"0x08048000\"");
    }
}
