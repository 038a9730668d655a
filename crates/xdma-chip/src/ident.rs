//! Engine identifier and alignments register decoding.
//!
//! ```text
//! identifier  [31:20] subsystem 0x1fc  [19:16] target  [15] streaming
//!             [11:8] channel id        [7:0] version
//! alignments  [23:16] address alignment bytes  [15:8] length granularity
//!             [7:0] address bits
//! ```

use crate::bar::Direction;

/// Subsystem tag every DMA block reports.
pub const SUBSYSTEM_ID: u32 = 0x1FC;

/// Decoded identifier register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineIdentity {
    /// Subsystem tag (0x1fc for a DMA block).
    pub subsystem: u32,
    /// Direction derived from the target field, if it names an engine.
    pub direction: Option<Direction>,
    /// AXI streaming (true) or memory-mapped (false) user interface.
    pub streaming: bool,
    /// Channel id.
    pub channel: u32,
    /// IP version.
    pub version: u32,
}

impl EngineIdentity {
    /// Decode a raw identifier value.
    #[must_use]
    pub const fn decode(raw: u32) -> Self {
        let direction = match (raw >> 16) & 0xF {
            0 => Some(Direction::H2C),
            1 => Some(Direction::C2H),
            _ => None,
        };
        Self {
            subsystem: raw >> 20,
            direction,
            streaming: raw & 0x8000 != 0,
            channel: (raw >> 8) & 0xF,
            version: raw & 0xFF,
        }
    }

    /// Encode back to the raw register value.
    #[must_use]
    pub const fn encode(&self) -> u32 {
        let target = match self.direction {
            Some(Direction::H2C) => 0,
            Some(Direction::C2H) => 1,
            None => 0xF,
        };
        let stream = if self.streaming { 0x8000 } else { 0 };
        (self.subsystem << 20) | (target << 16) | stream | ((self.channel & 0xF) << 8) | (self.version & 0xFF)
    }

    /// Whether this looks like a DMA engine block at all.
    #[must_use]
    pub const fn is_dma_engine(&self) -> bool {
        self.subsystem == SUBSYSTEM_ID && self.direction.is_some()
    }
}

/// Decoded alignments register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alignments {
    /// Required host address alignment in bytes.
    pub addr_align: u32,
    /// Required transfer length granularity in bytes.
    pub len_granularity: u32,
    /// Usable address bits.
    pub addr_bits: u32,
}

impl Alignments {
    /// Values assumed when the register reads zero.
    pub const UNSPECIFIED: Self = Self {
        addr_align: 1,
        len_granularity: 1,
        addr_bits: 64,
    };

    /// Decode a raw alignments value.
    #[must_use]
    pub const fn decode(raw: u32) -> Self {
        if raw == 0 {
            return Self::UNSPECIFIED;
        }
        Self {
            addr_align: nonzero((raw >> 16) & 0xFF),
            len_granularity: nonzero((raw >> 8) & 0xFF),
            addr_bits: if raw & 0xFF == 0 { 64 } else { raw & 0xFF },
        }
    }

    /// Encode back to the raw register value.
    #[must_use]
    pub const fn encode(&self) -> u32 {
        ((self.addr_align & 0xFF) << 16) | ((self.len_granularity & 0xFF) << 8) | (self.addr_bits & 0xFF)
    }
}

const fn nonzero(v: u32) -> u32 {
    if v == 0 {
        1
    } else {
        v
    }
}
