//! The deobfuscation engine: one instance per input binary.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::cfg::Cfg;
use crate::decoder::CapstoneDecoder;
use crate::format::{dot, idc, json, text};
use crate::image::{Image, Relocations};
use crate::resub::{self, ResubOptions, ResubReport};
use crate::scanner::{self, WorkQueue};
use crate::semantic::{analyse_block, AnalysisContext, AnalysisParams, BlockAnalysis, Confidence, OpKind};
use crate::symbols::SymbolTable;
use crate::{Address, Decoder, DemovError};

/// Aggregate counters over the current engine state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub blocks: usize,
    pub scanned_bytes: u64,
    /// Operation count per kind name
    pub ops: BTreeMap<&'static str, usize>,
    pub recognised_ops: usize,
    /// Unrecognised chains and operations left unresolved
    pub unknown_ops: usize,
    pub unresolved_edges: usize,
    pub bytes_patched: u64,
    pub patches_applied: usize,
    pub patches_skipped: usize,
}

/// Pipeline state for one binary: bind the loader's outputs once, then
/// `parse_entry`, `scan`, `analyse`, `resub` per block, and dump.
pub struct Demov {
    decoder: CapstoneDecoder,
    params: AnalysisParams,
    image: Option<Image>,
    relocations: Option<Relocations>,
    entry: Option<Address>,
    entry_parsed: bool,
    cfg: Cfg,
    queue: WorkQueue,
    analysis: BTreeMap<Address, BlockAnalysis>,
    symbols: SymbolTable,
    patches: ResubReport,
}

impl Demov {
    /// Prepare an engine with default analysis parameters.
    pub fn init() -> Result<Self, DemovError> {
        Self::with_params(AnalysisParams::default())
    }

    /// Prepare an engine with explicit analysis parameters.
    pub fn with_params(params: AnalysisParams) -> Result<Self, DemovError> {
        let decoder = CapstoneDecoder::new().map_err(|e| DemovError::Init(e.to_string()))?;
        Ok(Self {
            decoder,
            params,
            image: None,
            relocations: None,
            entry: None,
            entry_parsed: false,
            cfg: Cfg::new(),
            queue: WorkQueue::new(),
            analysis: BTreeMap::new(),
            symbols: SymbolTable::new(),
            patches: ResubReport::default(),
        })
    }

    /// Take ownership of the image and its segment table.
    pub fn bind_segments(&mut self, image: Image) -> Result<(), DemovError> {
        if self.image.is_some() {
            return Err(DemovError::Rebind("segments"));
        }
        self.image = Some(image);
        Ok(())
    }

    /// Take the relocation table (slot address to imported name).
    pub fn bind_relocations(&mut self, relocations: Relocations) -> Result<(), DemovError> {
        if self.relocations.is_some() {
            return Err(DemovError::Rebind("relocations"));
        }
        self.relocations = Some(relocations);
        Ok(())
    }

    /// Record the program entry address.
    pub fn bind_entry_point(&mut self, entry: Address) -> Result<(), DemovError> {
        if self.entry.is_some() {
            return Err(DemovError::Rebind("entry point"));
        }
        self.entry = Some(entry);
        Ok(())
    }

    fn bound(&self) -> Result<(&Image, &Relocations, Address), DemovError> {
        let image = self.image.as_ref().ok_or(DemovError::Unbound("segments"))?;
        let relocations = self.relocations.as_ref().ok_or(DemovError::Unbound("relocations"))?;
        let entry = self.entry.ok_or(DemovError::Unbound("entry point"))?;
        Ok((image, relocations, entry))
    }

    /// Check that the entry point is executable and schedule it.
    pub fn parse_entry(&mut self) -> Result<(), DemovError> {
        let (image, _, entry) = self.bound()?;
        if !image.is_executable(entry) {
            return Err(DemovError::InvalidEntry(entry));
        }
        self.queue.push(entry);
        self.entry_parsed = true;
        Ok(())
    }

    /// Drain the work list into the control-flow graph.
    pub fn scan(&mut self) -> Result<(), DemovError> {
        if !self.entry_parsed {
            return Err(DemovError::Unbound("entry"));
        }
        let image = self.image.as_ref().ok_or(DemovError::Unbound("segments"))?;
        let report = scanner::scan(image, &self.decoder, &mut self.cfg, &mut self.queue);
        log::info!(
            "Scanned {} blocks ({} new, {} splits, {} out of bounds)",
            self.cfg.len(),
            report.blocks_created,
            report.splits,
            report.out_of_bounds
        );
        Ok(())
    }

    /// Classify every block and feed recovered targets back into the scan
    /// until no new code is found.
    pub fn analyse(&mut self) -> Result<(), DemovError> {
        if !self.entry_parsed {
            return Err(DemovError::Unbound("entry"));
        }
        // field borrows, so the graph and results stay mutable
        let image = self.image.as_ref().ok_or(DemovError::Unbound("segments"))?;
        let relocations = self.relocations.as_ref().ok_or(DemovError::Unbound("relocations"))?;
        let entry = self.entry.ok_or(DemovError::Unbound("entry point"))?;
        let ctx = AnalysisContext {
            image,
            decoder: &self.decoder,
            relocations,
            params: &self.params,
        };

        let mut rounds = 0;
        loop {
            rounds += 1;
            scanner::scan(image, &self.decoder, &mut self.cfg, &mut self.queue);

            self.cfg.clear_resolved();
            self.analysis.clear();
            let ranges: Vec<(Address, Address)> = self.cfg.blocks().map(|b| (b.start, b.end)).collect();
            let mut fed = false;
            for (start, end) in ranges {
                let ba = analyse_block(&ctx, start, end);
                for target in ba.code_targets(image) {
                    if !self.cfg.is_block_start(target) && self.queue.push(target) {
                        log::debug!("New target 0x{:x} from block 0x{:x}", target, start);
                        fed = true;
                    }
                }
                self.cfg.set_resolved(start, ba.edges.clone());
                self.analysis.insert(start, ba);
            }
            if !fed {
                break;
            }
        }

        self.symbols = SymbolTable::build(image, relocations, Some(entry), &self.cfg, &self.analysis);
        log::info!("Analysis finished after {} rounds, {} blocks", rounds, self.cfg.len());
        Ok(())
    }

    /// `(start, end)` of every block, in address order.
    pub fn blocks(&self) -> Vec<(Address, Address)> {
        self.cfg.blocks().map(|b| (b.start, b.end)).collect()
    }

    /// Rewrite the recognised operations in `[start, start + len)`.
    pub fn resub(&mut self, start: Address, len: u64, opts: &ResubOptions) -> Result<ResubReport, DemovError> {
        let (image, relocations, _) = self.bound()?;
        if len == 0 {
            return Ok(ResubReport::default());
        }
        let end = start + len;
        for addr in [start, end - 1] {
            if !image.is_executable(addr) {
                return Err(DemovError::OutOfBounds(addr));
            }
        }
        let plan = resub::plan(
            &AnalysisContext {
                image,
                decoder: &self.decoder,
                relocations,
                params: &self.params,
            },
            start,
            end,
            opts,
        );

        let image = self.image.as_mut().ok_or(DemovError::Unbound("segments"))?;
        let report = resub::apply(image, &plan);
        if report.applied > 0 {
            log::debug!("Patched {} bytes in 0x{:x}..0x{:x}", report.bytes_patched, start, end);
        }
        self.patches += report;
        Ok(report)
    }

    /// Counters over the graph, the analysis and the patches applied so far.
    pub fn stats(&self) -> Stats {
        let mut stats = Stats {
            blocks: self.cfg.len(),
            scanned_bytes: self.cfg.scanned_bytes(),
            bytes_patched: self.patches.bytes_patched,
            patches_applied: self.patches.applied,
            patches_skipped: self.patches.skipped,
            ..Stats::default()
        };
        for op in self.analysis.values().flat_map(|ba| &ba.ops) {
            *stats.ops.entry(op.kind.name()).or_default() += 1;
            // an operation we could not resolve does not count as recovered
            if op.kind == OpKind::Unknown || op.confidence == Confidence::None {
                stats.unknown_ops += 1;
            } else {
                stats.recognised_ops += 1;
            }
        }
        stats.unresolved_edges = self.cfg.edges().iter().filter(|(_, e)| !e.target.is_resolved()).count();
        stats
    }

    /// Flow graph of every block and edge, in dot syntax.
    pub fn dump_flow(&self) -> String {
        dot::flow(&self.cfg, &self.symbols)
    }

    /// Call graph over call and resolved indirect edges, in dot syntax.
    pub fn dump_calls(&self) -> String {
        dot::calls(&self.cfg, &self.symbols)
    }

    /// Symbol table, one `address name` line per entry in address order.
    pub fn dump_syms(&self) -> String {
        text::syms(&self.symbols)
    }

    /// `MakeName` statements only; see [`Demov::dump_idc_script`] for the
    /// full file.
    pub fn dump_idc(&self) -> String {
        idc::names(&self.symbols)
    }

    /// Complete IDA script naming every symbol.
    pub fn dump_idc_script(&self) -> String {
        idc::script(&self.symbols)
    }

    /// Abstract register and memory state at the end of each block.
    pub fn dump_regs(&self) -> String {
        text::regs(&self.analysis)
    }

    /// [`Stats`] as text.
    pub fn dump_stat(&self) -> String {
        text::stat(&self.stats())
    }

    /// Statistics, symbols and blocks as pretty-printed JSON.
    pub fn dump_json(&self) -> Result<String, serde_json::Error> {
        json::report(&self.stats(), &self.symbols, &self.cfg, &self.analysis)
    }

    /// The decoder the engine scans with.
    pub fn decoder(&self) -> &dyn Decoder {
        &self.decoder
    }

    /// The control-flow graph built so far.
    pub fn cfg(&self) -> &Cfg {
        &self.cfg
    }

    /// Per-block analysis results, keyed by block start.
    pub fn analysis(&self) -> &BTreeMap<Address, BlockAnalysis> {
        &self.analysis
    }

    /// Symbols derived by the last [`Demov::analyse`].
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// The bound image, patched in place by [`Demov::resub`].
    pub fn image(&self) -> Option<&Image> {
        self.image.as_ref()
    }

    /// Hand the (patched) image back.
    pub fn into_image(self) -> Option<Image> {
        self.image
    }
}
