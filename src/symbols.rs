//! Recovered symbol table.

use std::collections::BTreeMap;

use crate::cfg::{Cfg, EdgeKind};
use crate::image::{Image, Relocations};
use crate::semantic::{BlockAnalysis, OpKind};
use crate::Address;

/// Address-ordered, one name per address. The first name recorded for an
/// address is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable {
    names: BTreeMap<Address, String>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `name` at `addr` unless the address already has one.
    /// Returns whether the name was recorded.
    pub fn insert(&mut self, addr: Address, name: impl Into<String>) -> bool {
        if self.names.contains_key(&addr) {
            return false;
        }
        self.names.insert(addr, name.into());
        true
    }

    pub fn get(&self, addr: Address) -> Option<&str> {
        self.names.get(&addr).map(String::as_str)
    }

    fn name_taken(&self, name: &str) -> bool {
        self.names.values().any(|n| n == name)
    }

    /// Record `name`, or `name_<addr>` when another address already uses it.
    fn insert_unique(&mut self, addr: Address, name: &str) {
        if self.name_taken(name) {
            self.insert(addr, format!("{}_{:x}", name, addr));
        } else {
            self.insert(addr, name);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Address, &str)> {
        self.names.iter().map(|(a, n)| (*a, n.as_str()))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Derive the table from relocations, the entry point, call edges and
    /// the tables behind recognised operations.
    pub fn build(
        image: &Image,
        relocations: &Relocations,
        entry: Option<Address>,
        cfg: &Cfg,
        analysis: &BTreeMap<Address, BlockAnalysis>,
    ) -> Self {
        let mut syms = Self::new();
        for (slot, name) in relocations {
            syms.insert(*slot, name.clone());
        }
        if let Some(entry) = entry {
            syms.insert(entry, "start");
        }

        for (_, edge) in cfg.edges() {
            if edge.kind != EdgeKind::Call {
                continue;
            }
            if let Some(t) = edge.target.address().filter(|t| image.is_executable(*t)) {
                syms.insert(t, format!("sub_{:x}", t));
            }
        }

        for ba in analysis.values() {
            for op in &ba.ops {
                match &op.kind {
                    OpKind::ConditionalBranch { table, .. } | OpKind::IndirectBranch { table: Some(table), .. } => {
                        syms.insert(*table, format!("jpt_{:x}", table));
                    }
                    OpKind::Arithmetic { op: alu, table, .. } => {
                        if syms.get(*table).is_none() {
                            syms.insert_unique(*table, &format!("alu_{}", alu.name()));
                        }
                    }
                    OpKind::Compare {
                        relation,
                        table: Some(table),
                        ..
                    } => {
                        if syms.get(*table).is_none() {
                            syms.insert_unique(*table, &format!("alu_{}", relation.name()));
                        }
                    }
                    _ => {}
                }
            }
        }
        log::info!("Recovered {} symbols", syms.len());
        syms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_name_wins() {
        let mut syms = SymbolTable::new();
        assert!(syms.insert(0x10, "printf"));
        assert!(!syms.insert(0x10, "sub_10"));
        assert_eq!(syms.get(0x10), Some("printf"));
    }

    #[test]
    fn test_unique_suffix() {
        let mut syms = SymbolTable::new();
        syms.insert_unique(0x100, "alu_add");
        syms.insert_unique(0x200, "alu_add");
        assert_eq!(syms.get(0x100), Some("alu_add"));
        assert_eq!(syms.get(0x200), Some("alu_add_200"));
    }

    #[test]
    fn test_address_order() {
        let mut syms = SymbolTable::new();
        syms.insert(0x300, "c");
        syms.insert(0x100, "a");
        syms.insert(0x200, "b");
        let addrs: Vec<_> = syms.iter().map(|(a, _)| a).collect();
        assert_eq!(addrs, vec![0x100, 0x200, 0x300]);
    }
}
