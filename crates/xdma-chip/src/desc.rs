//! Descriptor wire format.
//!
//! One descriptor describes one contiguous transfer and links to the next.
//! The record is eight little-endian 32-bit words:
//!
//! ```text
//! word  field
//! ────  ─────────────────────────────────────────────────────────────
//!  0    control   [31:16] magic 0xAD4B  [13:8] extra adjacent
//!                 [4] EOP  [1] COMPLETED  [0] STOP
//!  1    bytes     transfer length, < 2^28
//!  2,3  src_addr  lo / hi
//!  4,5  dst_addr  lo / hi
//!  6,7  next      lo / hi (0 terminates the chain)
//! ```
//!
//! "Extra adjacent" counts the descriptors that follow the *next* one
//! contiguously in memory, letting the engine prefetch a block without a
//! fetch round-trip per descriptor.

use crate::regs::MAX_EXTRA_ADJACENT;

/// Size of one descriptor in bytes.
pub const DESC_SIZE: usize = 32;

/// Size of one descriptor in 32-bit words.
pub const DESC_WORDS: usize = DESC_SIZE / 4;

/// Magic tag in the upper half of every valid control word.
pub const DESC_MAGIC: u32 = 0xAD4B_0000;

/// Mask selecting the magic tag.
pub const MAGIC_MASK: u32 = 0xFFFF_0000;

/// Bit position of the extra-adjacent field.
pub const ADJACENT_SHIFT: u32 = 8;

/// Mask selecting the extra-adjacent field.
pub const ADJACENT_MASK: u32 = MAX_EXTRA_ADJACENT << ADJACENT_SHIFT;

/// Mask selecting the flag byte.
pub const FLAGS_MASK: u32 = 0xFF;

/// Width of the length field in bits.
pub const BLEN_BITS: u32 = 28;

/// Largest length a single descriptor can carry.
pub const BLEN_MAX: u32 = (1 << BLEN_BITS) - 1;

/// Descriptor control flags.
pub mod flags {
    /// Engine stops after this descriptor.
    pub const STOP: u32 = 1 << 0;
    /// Engine reports completion (interrupt / write-back) after this descriptor.
    pub const COMPLETED: u32 = 1 << 1;
    /// Last descriptor of a caller-visible transfer.
    pub const EOP: u32 = 1 << 4;
}

/// Bits kept when a descriptor is linked onward: STOP, COMPLETED and the
/// adjacent field are cleared, everything else survives.
const LINK_KEEP_MASK: u32 = 0xFFFF_C0FC;

/// One hardware descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Descriptor {
    /// Magic, adjacent count and flags.
    pub control: u32,
    /// Transfer length in bytes.
    pub bytes: u32,
    /// Source bus / device address.
    pub src_addr: u64,
    /// Destination bus / device address.
    pub dst_addr: u64,
    /// Bus address of the next descriptor, 0 if last.
    pub next_addr: u64,
}

impl Descriptor {
    /// A descriptor carrying the magic tag and no flags.
    #[must_use]
    pub const fn new(bytes: u32, src_addr: u64, dst_addr: u64) -> Self {
        Self {
            control: DESC_MAGIC,
            bytes,
            src_addr,
            dst_addr,
            next_addr: 0,
        }
    }

    /// Encode as the eight words the engine fetches.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn to_words(&self) -> [u32; DESC_WORDS] {
        [
            self.control,
            self.bytes,
            self.src_addr as u32,
            (self.src_addr >> 32) as u32,
            self.dst_addr as u32,
            (self.dst_addr >> 32) as u32,
            self.next_addr as u32,
            (self.next_addr >> 32) as u32,
        ]
    }

    /// Decode from the eight words in descriptor memory.
    #[must_use]
    pub const fn from_words(w: [u32; DESC_WORDS]) -> Self {
        Self {
            control: w[0],
            bytes: w[1],
            src_addr: join(w[2], w[3]),
            dst_addr: join(w[4], w[5]),
            next_addr: join(w[6], w[7]),
        }
    }

    /// Little-endian byte image.
    #[must_use]
    pub fn to_le_bytes(&self) -> [u8; DESC_SIZE] {
        let mut out = [0u8; DESC_SIZE];
        for (chunk, word) in out.chunks_exact_mut(4).zip(self.to_words()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Whether the control word carries the magic tag.
    #[must_use]
    pub const fn has_magic(&self) -> bool {
        self.control & MAGIC_MASK == DESC_MAGIC
    }

    /// Extra adjacent descriptors after the next one.
    #[must_use]
    pub const fn extra_adjacent(&self) -> u32 {
        (self.control & ADJACENT_MASK) >> ADJACENT_SHIFT
    }

    /// Replace the extra-adjacent field. Values beyond the field width are
    /// clamped.
    pub fn set_extra_adjacent(&mut self, extra: u32) {
        let extra = extra.min(MAX_EXTRA_ADJACENT);
        self.control = (self.control & !ADJACENT_MASK) | (extra << ADJACENT_SHIFT);
    }

    /// Set flag bits.
    pub fn set_flags(&mut self, bits: u32) {
        self.control |= bits & FLAGS_MASK;
    }

    /// Whether all of `bits` are set.
    #[must_use]
    pub const fn has_flags(&self, bits: u32) -> bool {
        self.control & bits == bits
    }

    /// Make this the terminal descriptor of a chain.
    pub fn terminate(&mut self) {
        self.control |= flags::STOP | flags::COMPLETED;
        self.next_addr = 0;
    }

    /// Continue the chain at `next`, clearing STOP, COMPLETED and the
    /// adjacent count so the engine fetches `next` individually.
    pub fn link_to(&mut self, next: u64) {
        self.control &= LINK_KEEP_MASK;
        self.next_addr = next;
    }
}

const fn join(lo: u32, hi: u32) -> u64 {
    ((hi as u64) << 32) | lo as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_layout_matches_hardware() {
        let mut d = Descriptor::new(0x1000, 0x1_2345_6780, 0xABCD_0000);
        d.next_addr = 0x0000_0002_0000_0040;
        d.set_flags(flags::EOP);
        let b = d.to_le_bytes();
        assert_eq!(&b[0..4], &0xAD4B_0010u32.to_le_bytes());
        assert_eq!(&b[4..8], &0x1000u32.to_le_bytes());
        assert_eq!(&b[8..12], &0x2345_6780u32.to_le_bytes());
        assert_eq!(&b[12..16], &1u32.to_le_bytes());
        assert_eq!(&b[16..20], &0xABCD_0000u32.to_le_bytes());
        assert_eq!(&b[20..24], &0u32.to_le_bytes());
        assert_eq!(&b[24..28], &0x40u32.to_le_bytes());
        assert_eq!(&b[28..32], &2u32.to_le_bytes());
        assert_eq!(Descriptor::from_words(d.to_words()), d);
    }

    #[test]
    fn adjacent_is_clamped_to_field_width() {
        let mut d = Descriptor::new(4, 0, 0);
        d.set_extra_adjacent(200);
        assert_eq!(d.extra_adjacent(), MAX_EXTRA_ADJACENT);
        d.set_extra_adjacent(3);
        assert_eq!(d.extra_adjacent(), 3);
        assert!(d.has_magic());
    }

    #[test]
    fn link_clears_stop_completed_and_adjacent_but_keeps_eop() {
        let mut d = Descriptor::new(4, 0, 0);
        d.set_extra_adjacent(5);
        d.set_flags(flags::EOP);
        d.terminate();
        assert!(d.has_flags(flags::STOP | flags::COMPLETED));
        d.link_to(0x8000);
        assert!(!d.has_flags(flags::STOP));
        assert!(!d.has_flags(flags::COMPLETED));
        assert!(d.has_flags(flags::EOP));
        assert_eq!(d.extra_adjacent(), 0);
        assert_eq!(d.next_addr, 0x8000);
        assert!(d.has_magic());
    }
}
