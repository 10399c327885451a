//! Fixed-size in-place patches.

use crate::image::Image;
use crate::Address;

/// x86 one-byte `nop`
pub const NOP: u8 = 0x90;

/// A replacement for the bytes `[offset, offset + original_len)`. The
/// replacement is never longer than the span it replaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRecord {
    offset: Address,
    original_len: usize,
    replacement: Vec<u8>,
}

impl PatchRecord {
    /// `None` when `replacement` does not fit the original span.
    pub fn new(offset: Address, original_len: usize, replacement: Vec<u8>) -> Option<Self> {
        (replacement.len() <= original_len).then_some(Self {
            offset,
            original_len,
            replacement,
        })
    }

    pub fn offset(&self) -> Address {
        self.offset
    }

    pub fn original_len(&self) -> usize {
        self.original_len
    }

    pub fn replacement(&self) -> &[u8] {
        &self.replacement
    }

    fn padded(&self) -> impl Iterator<Item = u8> + '_ {
        self.replacement
            .iter()
            .copied()
            .chain(std::iter::repeat(NOP))
            .take(self.original_len)
    }

    /// True when the image already holds exactly this patch.
    pub fn is_applied(&self, image: &Image) -> bool {
        image
            .bytes(self.offset, self.original_len)
            .map_or(false, |current| current.iter().copied().eq(self.padded()))
    }

    /// Write the replacement and pad the rest of the span with no-ops.
    /// Returns false, touching nothing, when the span is not writable.
    pub fn apply(&self, image: &mut Image) -> bool {
        let Some(span) = image.span_mut(self.offset, self.original_len) else {
            return false;
        };
        for (dst, src) in span.iter_mut().zip(self.padded()) {
            *dst = src;
        }
        true
    }
}
