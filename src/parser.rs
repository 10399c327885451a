//! Goblin-based ELF loader: segments, relocations and entry point.

use std::fmt;

use goblin::elf::{self, program_header::PT_LOAD, Elf};
use goblin::Object;

use crate::image::{Image, Relocations, Segment, SegmentFlags};
use crate::{Address, Decoder, DemovError};

/// Share of `mov` instructions above which a binary is reported as
/// possibly movfuscated.
pub const MOV_RATIO_THRESHOLD: f64 = 0.9;

/// Everything the engine needs from a binary container.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    /// Raw file buffer and its segment table
    pub image: Image,
    /// Relocation slot -> imported symbol
    pub relocations: Relocations,
    /// Program entry point
    pub entry: Address,
}

impl LoadedImage {
    /// Fraction of `mov`-family instructions found by a linear sweep over
    /// the executable segments.
    pub fn mov_ratio(&self, decoder: &dyn Decoder) -> f64 {
        let mut total = 0usize;
        let mut movs = 0usize;

        for seg in self.image.segments().values().filter(|s| s.is_executable()) {
            let mut at = seg.base;
            let end = seg.base + seg.data_len;
            while at < end {
                let decoded = self.image.slice_from(at).and_then(|code| decoder.decode(code, at));
                match decoded {
                    Some(insn) if insn.size > 0 => {
                        total += 1;
                        if insn.mnemonic.starts_with("mov") {
                            movs += 1;
                        }
                        at += insn.size as Address;
                    }
                    // Couldn't decode an instruction, skip one byte
                    _ => at += 1,
                }
            }
        }

        if total == 0 {
            0.0
        } else {
            movs as f64 / total as f64
        }
    }

    /// The original tool's "possibly movfuscated" check.
    pub fn looks_movfuscated(&self, decoder: &dyn Decoder) -> bool {
        self.mov_ratio(decoder) >= MOV_RATIO_THRESHOLD
    }
}

/// Loader trait: turn raw file bytes into a `LoadedImage`.
pub trait Loader {
    fn load(&self, data: Vec<u8>) -> Result<LoadedImage, DemovError>;
}

/// A loader for 32-bit x86 ELF files via Goblin.
#[derive(Debug, Default)]
pub struct GoblinParser;

impl GoblinParser {
    /// Construct a new GoblinParser.
    pub fn new() -> Self {
        GoblinParser
    }

    fn segments(elf: &Elf) -> Vec<Segment> {
        elf.program_headers
            .iter()
            .filter(|ph| ph.p_type == PT_LOAD)
            .map(|ph| Segment {
                base: ph.p_vaddr,
                size: ph.p_memsz,
                data_len: ph.p_filesz.min(ph.p_memsz),
                offset: ph.p_offset as usize,
                flags: SegmentFlags::from_bits_truncate(ph.p_flags),
            })
            .collect()
    }

    fn relocations(elf: &Elf) -> Relocations {
        let mut relocations = Relocations::new();
        for reloc in elf.dynrels.iter().chain(elf.dynrelas.iter()).chain(elf.pltrelocs.iter()) {
            if reloc.r_sym == 0 {
                continue;
            }
            let name = elf
                .dynsyms
                .get(reloc.r_sym)
                .and_then(|sym| elf.dynstrtab.get_at(sym.st_name))
                .filter(|name| !name.is_empty());
            if let Some(name) = name {
                relocations.entry(reloc.r_offset).or_insert_with(|| name.to_string());
            }
        }
        relocations
    }
}

impl fmt::Display for GoblinParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GoblinParser")
    }
}

impl Loader for GoblinParser {
    fn load(&self, data: Vec<u8>) -> Result<LoadedImage, DemovError> {
        let (segments, relocations, entry) = match Object::parse(&data) {
            Ok(Object::Elf(elf)) => {
                if elf.is_64 || elf.header.e_machine != elf::header::EM_386 {
                    return Err(DemovError::Parsing("not a 32-bit x86 ELF".into()));
                }
                (Self::segments(&elf), Self::relocations(&elf), elf.entry)
            }
            Ok(_) => return Err(DemovError::Parsing("Unsupported file format".into())),
            Err(e) => return Err(DemovError::Parsing(e.to_string())),
        };

        Ok(LoadedImage {
            image: Image::new(data, segments),
            relocations,
            entry,
        })
    }
}
