//! Command-line driver: run the whole pipeline on each input file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;

use crate::engine::Demov;
use crate::format::Dump;
use crate::parser::{GoblinParser, Loader};
use crate::resub::ResubOptions;

/// Deobfuscate binaries built by a mov-only compiler.
#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "demov",
    version,
    after_help = "Convert the dot file with:\n\n\tcat cfg.dot | dot -Tpng > cfg.png"
)]
pub struct Options {
    /// Obfuscated input binaries
    pub inputs: Vec<PathBuf>,

    /// Write the patched binary
    #[arg(short = 'o', value_name = "patched_bin")]
    pub output: Option<PathBuf>,

    /// Write the flow graph and call graph (dot)
    #[arg(short = 'g', value_name = "cfg.dot")]
    pub graph: Option<PathBuf>,

    /// Derive symbols and write them as an IDA script
    #[arg(short = 'i', value_name = "symbols.idc")]
    pub idc: Option<PathBuf>,

    /// Write a JSON report
    #[arg(short = 'j', value_name = "report.json")]
    pub json: Option<PathBuf>,

    /// Rewrite resolved calls too
    #[arg(short = 'c')]
    pub patch_calls: bool,

    /// Print a report to stdout after processing
    #[arg(short = 'd', long = "dump", value_enum)]
    pub dumps: Vec<Dump>,
}

/// Short usage line printed for bad invocations.
pub const USAGE: &str = "Usage: demov [-h] [-o patched] [-g graph] [-i idc] [-j json] [-c] input...";

fn write(path: &Path, contents: impl AsRef<[u8]>) -> anyhow::Result<()> {
    fs::write(path, contents).with_context(|| format!("cannot write {}", path.display()))
}

/// Load, analyse and patch one binary, writing every requested output.
pub fn process_file(path: &Path, opts: &Options) -> anyhow::Result<()> {
    let data = fs::read(path).with_context(|| format!("cannot open file {}", path.display()))?;
    let loaded = GoblinParser::new()
        .load(data)
        .with_context(|| format!("cannot load {}", path.display()))?;

    let mut de = Demov::init()?;
    let movfuscated = loaded.looks_movfuscated(de.decoder());
    println!("{} movfuscated", if movfuscated { "possibly" } else { "not" });

    if !loaded.relocations.is_empty() {
        println!("Relocations:");
        for (slot, name) in &loaded.relocations {
            println!("{} at {:x}", name, slot);
        }
    }
    println!("Segments:");
    for seg in loaded.image.segments().values() {
        println!("{:x} - {:x} : {}", seg.base, seg.end(), seg.flags);
    }
    println!("The entry point is {:x}", loaded.entry);

    de.bind_segments(loaded.image)?;
    de.bind_relocations(loaded.relocations)?;
    de.bind_entry_point(loaded.entry)?;

    println!("parsing entry");
    de.parse_entry()?;
    de.scan()?;
    print!("{}", de.dump_stat());

    println!("analysing binary");
    de.analyse()?;

    println!("Basic blocks:");
    let flow = de.dump_flow();
    let resub = ResubOptions {
        patch_calls: opts.patch_calls,
    };
    for (start, end) in de.blocks() {
        de.resub(start, end - start, &resub)?;
    }

    println!("getting rid of tables");
    println!("Symbols:");
    print!("{}", de.dump_syms());
    log::debug!("Register state:\n{}", de.dump_regs());

    if let Some(graph) = &opts.graph {
        write(graph, format!("{}\n{}", flow, de.dump_calls()))?;
    }
    if let Some(idc) = &opts.idc {
        write(idc, de.dump_idc_script())?;
    }
    if let Some(json) = &opts.json {
        write(json, de.dump_json()?)?;
    }
    for dump in &opts.dumps {
        let text = match dump {
            Dump::Flow => de.dump_flow(),
            Dump::Calls => de.dump_calls(),
            Dump::Syms => de.dump_syms(),
            Dump::Idc => de.dump_idc_script(),
            Dump::Regs => de.dump_regs(),
            Dump::Stat => de.dump_stat(),
            Dump::Json => de.dump_json()?,
        };
        print!("{}", text);
    }
    if let Some(output) = &opts.output {
        let image = de.into_image().context("no image bound")?;
        write(output, image.into_bytes())?;
    }

    log::info!("Finished {}", path.display());
    Ok(())
}

/// Process every input in order. A failing file is reported and skipped.
/// Returns the number of files that failed.
pub fn run(opts: &Options) -> usize {
    let mut failed = 0;
    for path in &opts.inputs {
        if let Err(e) = process_file(path, opts) {
            eprintln!("{}: {:#}", path.display(), e);
            failed += 1;
        }
    }
    failed
}
