//! Address-space view of a loaded binary: segments, relocations and the
//! raw image buffer they point into.

use std::collections::BTreeMap;
use std::fmt;

use bitflags::bitflags;

use crate::Address;

bitflags! {
    /// Segment permission flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SegmentFlags: u32 {
        const X = 0x1;
        const W = 0x2;
        const R = 0x4;
    }
}

impl fmt::Display for SegmentFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |bit: SegmentFlags, c: char| if self.contains(bit) { c } else { ' ' };
        write!(
            f,
            "{}{}{}",
            flag(SegmentFlags::R, 'R'),
            flag(SegmentFlags::W, 'W'),
            flag(SegmentFlags::X, 'X')
        )
    }
}

/// A loaded segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Virtual base address
    pub base: Address,
    /// Size in memory
    pub size: u64,
    /// Bytes backed by the image buffer (the rest reads as zero)
    pub data_len: u64,
    /// Offset of the segment's first byte in the image buffer
    pub offset: usize,
    /// Permissions
    pub flags: SegmentFlags,
}

impl Segment {
    pub fn end(&self) -> Address {
        self.base + self.size
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.base && addr < self.end()
    }

    pub fn is_executable(&self) -> bool {
        self.flags.contains(SegmentFlags::X)
    }
}

/// Address-ordered segment table, base -> segment.
pub type SegmentMap = BTreeMap<Address, Segment>;

/// Relocations, slot address -> symbol name.
pub type Relocations = BTreeMap<Address, String>;

/// The raw image buffer plus the segment table that maps virtual addresses
/// into it. All engine reads and writes go through here.
#[derive(Debug, Clone)]
pub struct Image {
    buf: Vec<u8>,
    segments: SegmentMap,
}

impl Image {
    /// Wrap `buf`, dropping segments whose file-backed part lies outside it.
    pub fn new(buf: Vec<u8>, segments: impl IntoIterator<Item = Segment>) -> Self {
        let len = buf.len();
        let segments = segments
            .into_iter()
            .filter(|s| {
                let fits = s.offset.checked_add(s.data_len as usize).map_or(false, |end| end <= len);
                if !fits {
                    log::warn!("Dropping segment at 0x{:x}: data outside the image buffer", s.base);
                }
                fits && s.size > 0
            })
            .map(|s| (s.base, s))
            .collect();
        Self { buf, segments }
    }

    pub fn segments(&self) -> &SegmentMap {
        &self.segments
    }

    /// Segment containing `addr`.
    pub fn segment_of(&self, addr: Address) -> Option<&Segment> {
        self.segments
            .range(..=addr)
            .next_back()
            .map(|(_, s)| s)
            .filter(|s| s.contains(addr))
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.segment_of(addr).is_some()
    }

    pub fn is_executable(&self, addr: Address) -> bool {
        self.segment_of(addr).map_or(false, Segment::is_executable)
    }

    /// File-backed bytes from `addr` to the end of its segment's data.
    pub fn slice_from(&self, addr: Address) -> Option<&[u8]> {
        let seg = self.segment_of(addr)?;
        let rel = addr - seg.base;
        if rel >= seg.data_len {
            return None;
        }
        let start = seg.offset + rel as usize;
        let end = seg.offset + seg.data_len as usize;
        Some(&self.buf[start..end])
    }

    /// File-backed bytes in `[addr, addr + len)`.
    pub fn bytes(&self, addr: Address, len: usize) -> Option<&[u8]> {
        self.slice_from(addr).filter(|s| s.len() >= len).map(|s| &s[..len])
    }

    /// Read a little-endian value of `width` bytes (1, 2 or 4). Bytes past
    /// the file-backed part of a segment read as zero.
    pub fn read_uint(&self, addr: Address, width: u8) -> Option<u32> {
        if !matches!(width, 1 | 2 | 4) {
            return None;
        }
        let seg = self.segment_of(addr)?;
        let last = addr.checked_add(width as Address - 1)?;
        if !seg.contains(last) {
            return None;
        }
        let mut value = 0u32;
        for i in 0..width as Address {
            let rel = addr + i - seg.base;
            let byte = if rel < seg.data_len {
                self.buf[seg.offset + rel as usize]
            } else {
                0
            };
            value |= (byte as u32) << (8 * i);
        }
        Some(value)
    }

    pub fn read_u32(&self, addr: Address) -> Option<u32> {
        self.read_uint(addr, 4)
    }

    /// Fixed-size writable view of `[addr, addr + len)`. The span must be
    /// file-backed and inside a single segment; it can never grow.
    pub fn span_mut(&mut self, addr: Address, len: usize) -> Option<&mut [u8]> {
        let seg = self.segment_of(addr)?;
        let rel = addr - seg.base;
        if rel + len as u64 > seg.data_len {
            return None;
        }
        let start = seg.offset + rel as usize;
        Some(&mut self.buf[start..start + len])
    }

    /// The whole buffer, as it would be written back to disk.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}
