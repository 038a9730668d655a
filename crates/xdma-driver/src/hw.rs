//! Hardware seams: register access, coherent memory, per-engine register view
//!
//! The engine never touches a pointer directly. Registers go through
//! [`RegisterAccess`] (a mapped BAR in production, the simulator in CI) and
//! every piece of memory the hardware reads or writes is a [`DmaRegion`]
//! handed out by a [`DmaAllocator`].

use crate::error::Result;
use std::fmt::Debug;
use std::sync::Arc;
use xdma_chip::bar::{self, Direction};
use xdma_chip::regs::sgdma_common;

/// 32-bit register access to the config BAR
pub trait RegisterAccess: Send + Sync + Debug {
    /// Read the register at a BAR offset
    fn read32(&self, offset: usize) -> u32;

    /// Write the register at a BAR offset
    fn write32(&self, offset: usize, value: u32);
}

/// Host memory the engine can address by bus address
///
/// Access is word-granular; offsets are in bytes and must be 4-aligned.
pub trait DmaRegion: Send + Sync + Debug {
    /// Bus (device-visible) address of the first byte
    fn bus_addr(&self) -> u64;

    /// Size in bytes
    fn len(&self) -> usize;

    /// Read the little-endian word at `offset`
    fn read32(&self, offset: usize) -> u32;

    /// Write the little-endian word at `offset`
    fn write32(&self, offset: usize, value: u32);

    /// Whether the region is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write consecutive words starting at `offset`
    fn write_words(&self, offset: usize, words: &[u32]) {
        for (i, w) in words.iter().enumerate() {
            self.write32(offset + i * 4, *w);
        }
    }

    /// Read consecutive words starting at `offset`
    fn read_words(&self, offset: usize, out: &mut [u32]) {
        for (i, w) in out.iter_mut().enumerate() {
            *w = self.read32(offset + i * 4);
        }
    }

    /// Zero `len` bytes starting at `offset` (both 4-aligned)
    fn zero(&self, offset: usize, len: usize) {
        for at in (offset..offset + len).step_by(4) {
            self.write32(at, 0);
        }
    }

    /// Copy bytes out of the region
    fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        for (i, b) in out.iter_mut().enumerate() {
            let at = offset + i;
            *b = self.read32(at & !3).to_le_bytes()[at & 3];
        }
    }

    /// Copy bytes into the region
    fn write_bytes(&self, offset: usize, data: &[u8]) {
        let mut i = 0;
        while i < data.len() {
            let at = offset + i;
            if at & 3 == 0 && data.len() - i >= 4 {
                let mut word = [0u8; 4];
                word.copy_from_slice(&data[i..i + 4]);
                self.write32(at, u32::from_le_bytes(word));
                i += 4;
            } else {
                let mut word = self.read32(at & !3).to_le_bytes();
                word[at & 3] = data[i];
                self.write32(at & !3, u32::from_le_bytes(word));
                i += 1;
            }
        }
    }
}

/// Source of coherent memory for descriptors, results and write-back
pub trait DmaAllocator: Send + Sync + Debug {
    /// Allocate at least `size` zeroed bytes visible to the engine
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` if the allocation cannot be satisfied.
    fn alloc_coherent(&self, size: usize) -> Result<Arc<dyn DmaRegion>>;
}

/// One engine's registers, addressed by name instead of BAR offset
#[derive(Debug, Clone)]
pub struct EngineRegs {
    bar: Arc<dyn RegisterAccess>,
    channel_base: usize,
    sgdma_base: usize,
    direction: Direction,
    channel: u32,
}

impl EngineRegs {
    /// View of the engine for `direction` / `channel` inside `bar`
    pub fn new(bar: Arc<dyn RegisterAccess>, direction: Direction, channel: u32) -> Self {
        Self {
            bar,
            channel_base: bar::channel_block(direction, channel),
            sgdma_base: bar::sgdma_block(direction, channel),
            direction,
            channel,
        }
    }

    /// Read a channel block register (`regs::engine::*`)
    pub fn read(&self, reg: usize) -> u32 {
        self.bar.read32(self.channel_base + reg)
    }

    /// Write a channel block register (`regs::engine::*`)
    pub fn write(&self, reg: usize, value: u32) {
        tracing::trace!("{}{} ch+{reg:#04x} <= {value:#010x}", self.direction, self.channel);
        self.bar.write32(self.channel_base + reg, value);
    }

    /// Read an SGDMA block register (`regs::sgdma::*`)
    pub fn sgdma_read(&self, reg: usize) -> u32 {
        self.bar.read32(self.sgdma_base + reg)
    }

    /// Write an SGDMA block register (`regs::sgdma::*`)
    pub fn sgdma_write(&self, reg: usize, value: u32) {
        tracing::trace!("{}{} sg+{reg:#04x} <= {value:#010x}", self.direction, self.channel);
        self.bar.write32(self.sgdma_base + reg, value);
    }

    /// Write an SGDMA common block register (`regs::sgdma_common::*`)
    pub fn common_write(&self, reg: usize, value: u32) {
        self.bar.write32(bar::SGDMA_COMMON_OFFSET + reg, value);
    }

    /// Read an SGDMA common block register
    pub fn common_read(&self, reg: usize) -> u32 {
        self.bar.read32(bar::SGDMA_COMMON_OFFSET + reg)
    }

    /// This engine's bit in the credit mode enable register
    pub const fn credit_bit(&self) -> u32 {
        sgdma_common::credit_bit(self.channel)
    }

    /// Direction of the engine
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Channel of the engine
    pub const fn channel(&self) -> u32 {
        self.channel
    }
}
