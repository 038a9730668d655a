//! Streaming result entries and the poll-mode write-back word.
//!
//! For card-to-host streaming, every descriptor's source address points
//! at a result entry instead of device memory. The engine writes the
//! delivered payload length and a status word carrying [`RESULT_TAG`]
//! into that entry when the payload lands.
//!
//! ```text
//! word  field
//! ────  ──────────────────────────────────────────
//!  0    status   [31:16] 0x52B4 once written  [0] EOP
//!  1    length   payload bytes delivered
//!  2-7  reserved
//! ```

/// Size of one result entry in bytes.
pub const RESULT_SIZE: usize = 32;

/// Word offset of the status field.
pub const STATUS_WORD: usize = 0;

/// Word offset of the length field.
pub const LENGTH_WORD: usize = 1;

/// Tag the engine stamps into the upper half of a written status word.
pub const RESULT_TAG: u32 = 0x52B4_0000;

/// Mask selecting the tag.
pub const RESULT_TAG_MASK: u32 = 0xFFFF_0000;

/// Status bit marking the end of a packet.
pub const RESULT_EOP: u32 = 1 << 0;

/// Whether a status word was written by the engine.
#[must_use]
pub const fn is_written(status: u32) -> bool {
    status & RESULT_TAG_MASK == RESULT_TAG
}

/// Size of the poll-mode write-back area.
pub const WRITEBACK_SIZE: usize = 4;

/// Completed descriptor count bits of the write-back word.
pub const WB_COUNT_MASK: u32 = 0x00FF_FFFF;

/// Error flag of the write-back word.
pub const WB_ERR_MASK: u32 = 1 << 31;

/// Decoded poll-mode write-back word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Writeback {
    /// Descriptors completed since the last start.
    pub completed: u32,
    /// Engine flagged an error.
    pub error: bool,
}

impl Writeback {
    /// Decode the raw word.
    #[must_use]
    pub const fn decode(raw: u32) -> Self {
        Self {
            completed: raw & WB_COUNT_MASK,
            error: raw & WB_ERR_MASK != 0,
        }
    }

    /// Encode as the raw word the engine writes.
    #[must_use]
    pub const fn encode(self) -> u32 {
        let err = if self.error { WB_ERR_MASK } else { 0 };
        (self.completed & WB_COUNT_MASK) | err
    }
}
