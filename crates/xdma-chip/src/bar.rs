//! Config BAR layout of the DMA IP.
//!
//! The IP exposes all of its engines through a single config BAR. The BAR
//! is divided into 4 KB targets; each engine owns a 256-byte block inside
//! the target for its direction.
//!
//! ```text
//! Target  Offset   Contents
//! ──────  ───────  ──────────────────────────────────────────────
//!  0      0x0000   H2C channel register blocks (0x100 per channel)
//!  1      0x1000   C2H channel register blocks (0x100 per channel)
//!  2      0x2000   IRQ block
//!  3      0x3000   Config block
//!  4      0x4000   H2C SGDMA blocks (0x100 per channel)
//!  5      0x5000   C2H SGDMA blocks (0x100 per channel)
//!  6      0x6000   SGDMA common block (credit mode enables)
//! ```

/// Spacing between targets.
pub const TARGET_SPACING: usize = 0x1000;

/// Spacing between channels inside a target.
pub const CHANNEL_SPACING: usize = 0x100;

/// Distance from a channel block to its SGDMA block.
pub const SGDMA_OFFSET_FROM_CHANNEL: usize = 0x4000;

/// Offset of the SGDMA common block.
pub const SGDMA_COMMON_OFFSET: usize = 6 * TARGET_SPACING;

/// Highest channel number per direction.
pub const MAX_CHANNELS: u32 = 4;

/// Transfer direction as seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host to card: descriptors read host memory, write the device.
    H2C,
    /// Card to host: descriptors read the device, write host memory.
    C2H,
}

impl Direction {
    /// Target index of this direction's channel blocks.
    #[must_use]
    pub const fn target(self) -> usize {
        match self {
            Self::H2C => 0,
            Self::C2H => 1,
        }
    }

    /// Whether data flows from the device into host memory.
    #[must_use]
    pub const fn is_to_host(self) -> bool {
        matches!(self, Self::C2H)
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::H2C => write!(f, "H2C"),
            Self::C2H => write!(f, "C2H"),
        }
    }
}

/// Offset of an engine's channel register block.
#[must_use]
pub const fn channel_block(dir: Direction, channel: u32) -> usize {
    dir.target() * TARGET_SPACING + channel as usize * CHANNEL_SPACING
}

/// Offset of an engine's SGDMA register block.
#[must_use]
pub const fn sgdma_block(dir: Direction, channel: u32) -> usize {
    channel_block(dir, channel) + SGDMA_OFFSET_FROM_CHANNEL
}
