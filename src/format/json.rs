//! Machine-readable report.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::cfg::{Cfg, Edge};
use crate::engine::Stats;
use crate::semantic::{BlockAnalysis, SemanticOp};
use crate::symbols::SymbolTable;
use crate::Address;

#[derive(Serialize)]
struct SymbolJson<'a> {
    address: String,
    name: &'a str,
}

#[derive(Serialize)]
struct BlockJson<'a> {
    start: String,
    end: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    ops: &'a [SemanticOp],
    edges: Vec<Edge>,
}

#[derive(Serialize)]
struct ReportJson<'a> {
    stats: &'a Stats,
    symbols: Vec<SymbolJson<'a>>,
    blocks: Vec<BlockJson<'a>>,
}

fn hex(addr: Address) -> String {
    format!("0x{:x}", addr)
}

/// Statistics, symbols, and every block with its operations and edges.
pub fn report(
    stats: &Stats,
    syms: &SymbolTable,
    cfg: &Cfg,
    analysis: &BTreeMap<Address, BlockAnalysis>,
) -> Result<String, serde_json::Error> {
    let report = ReportJson {
        stats,
        symbols: syms
            .iter()
            .map(|(addr, name)| SymbolJson {
                address: hex(addr),
                name,
            })
            .collect(),
        blocks: cfg
            .blocks()
            .map(|b| BlockJson {
                start: hex(b.start),
                end: hex(b.end),
                name: syms.get(b.start),
                ops: analysis.get(&b.start).map(|a| a.ops.as_slice()).unwrap_or(&[]),
                edges: cfg.successors(b.start),
            })
            .collect(),
    };
    serde_json::to_string_pretty(&report)
}
