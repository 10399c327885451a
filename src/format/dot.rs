//! Graphviz renderings of the flow and call graphs.

use std::fmt::Write;

use super::node;
use crate::cfg::{Cfg, Edge, EdgeTarget};
use crate::symbols::SymbolTable;
use crate::Address;

fn label(addr: Address, syms: &SymbolTable) -> String {
    match syms.get(addr) {
        Some(name) => format!("{}\\n0x{:08x}", escape(name), addr),
        None => format!("0x{:08x}", addr),
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Id of the placeholder node for the `n`-th unresolved edge of `from`.
fn unresolved_node(from: Address, n: usize) -> String {
    format!("\"unresolved_{:08x}_{}\"", from, n)
}

fn unresolved_label(edge: &Edge) -> String {
    match edge.target {
        EdgeTarget::Unresolved { raw: Some(raw), reason } => format!("0x{:x}? ({})", raw, reason),
        EdgeTarget::Unresolved { raw: None, reason } => format!("? ({})", reason),
        EdgeTarget::Resolved(t) => format!("0x{:x}", t),
    }
}

/// Every block and every edge, including unresolved ones as dashed
/// placeholder nodes.
pub fn flow(cfg: &Cfg, syms: &SymbolTable) -> String {
    let mut out = String::from("digraph flow {\n\tnode [shape=box fontname=\"monospace\"];\n");
    for block in cfg.blocks() {
        let _ = writeln!(
            out,
            "\t{} [label=\"{}\\n{} bytes\"];",
            node(block.start),
            label(block.start, syms),
            block.size()
        );
    }
    for block in cfg.blocks() {
        for (n, edge) in cfg.successors(block.start).iter().enumerate() {
            match edge.target {
                EdgeTarget::Resolved(t) => {
                    let _ = writeln!(out, "\t{} -> {} [label=\"{}\"];", node(block.start), node(t), edge.kind);
                }
                EdgeTarget::Unresolved { .. } => {
                    let target = unresolved_node(block.start, n);
                    let _ = writeln!(out, "\t{} [label=\"{}\" style=dashed];", target, unresolved_label(edge));
                    let _ = writeln!(
                        out,
                        "\t{} -> {} [label=\"{}\" style=dashed];",
                        node(block.start),
                        target,
                        edge.kind
                    );
                }
            }
        }
    }
    out.push_str("}\n");
    out
}

/// Resolved `call` and `resolved-indirect` edges only.
pub fn calls(cfg: &Cfg, syms: &SymbolTable) -> String {
    let mut out = String::from("digraph calls {\n");
    let edges: Vec<_> = cfg
        .edges()
        .into_iter()
        .filter(|(_, e)| e.kind.is_call_graph())
        .filter_map(|(from, e)| e.target.address().map(|t| (from, t, e.kind)))
        .collect();

    let mut named = std::collections::BTreeSet::new();
    for (from, to, _) in &edges {
        named.insert(*from);
        named.insert(*to);
    }
    for addr in named {
        let _ = writeln!(out, "\t{} [label=\"{}\"];", node(addr), label(addr, syms));
    }
    for (from, to, kind) in edges {
        let _ = writeln!(out, "\t{} -> {} [label=\"{}\"];", node(from), node(to), kind);
    }
    out.push_str("}\n");
    out
}
