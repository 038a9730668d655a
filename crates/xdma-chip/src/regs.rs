//! Engine register map.
//!
//! Offsets are relative to the block they live in: [`engine`] offsets to
//! the channel block, [`sgdma`] offsets to the SGDMA block and
//! [`sgdma_common`] offsets to the SGDMA common block (see [`crate::bar`]).
//!
//! ```text
//! channel block                     SGDMA block
//! 0x00  identifier                  0x00  identifier
//! 0x04  control                     0x80  first_desc_lo
//! 0x08  control_w1s                 0x84  first_desc_hi
//! 0x0c  control_w1c                 0x88  first_desc_adjacent
//! 0x40  status                      0x8c  credits
//! 0x44  status_rc (read-to-clear)
//! 0x48  completed_desc_count
//! 0x4c  alignments
//! 0x88  poll_mode_wb_lo
//! 0x8c  poll_mode_wb_hi
//! 0x90  interrupt_enable_mask
//! 0x94  interrupt_enable_mask_w1s
//! 0x98  interrupt_enable_mask_w1c
//! ```

// ── Channel block ────────────────────────────────────────────────────────────

/// Channel register block offsets.
pub mod engine {
    /// Identifier register (subsystem tag, target, stream bit, channel, version).
    pub const IDENTIFIER: usize = 0x00;
    /// Control register.
    pub const CONTROL: usize = 0x04;
    /// Control register, write-1-to-set.
    pub const CONTROL_W1S: usize = 0x08;
    /// Control register, write-1-to-clear.
    pub const CONTROL_W1C: usize = 0x0C;
    /// Status register.
    pub const STATUS: usize = 0x40;
    /// Status register, read-to-clear.
    pub const STATUS_RC: usize = 0x44;
    /// Running count of completed descriptors since the last start.
    pub const COMPLETED_DESC_COUNT: usize = 0x48;
    /// Address alignment / length granularity / address bits.
    pub const ALIGNMENTS: usize = 0x4C;
    /// Poll-mode write-back address, low 32 bits.
    pub const POLL_MODE_WB_LO: usize = 0x88;
    /// Poll-mode write-back address, high 32 bits.
    pub const POLL_MODE_WB_HI: usize = 0x8C;
    /// Interrupt enable mask.
    pub const INTERRUPT_ENABLE_MASK: usize = 0x90;
    /// Interrupt enable mask, write-1-to-set.
    pub const INTERRUPT_ENABLE_MASK_W1S: usize = 0x94;
    /// Interrupt enable mask, write-1-to-clear.
    pub const INTERRUPT_ENABLE_MASK_W1C: usize = 0x98;
}

// ── SGDMA block ──────────────────────────────────────────────────────────────

/// SGDMA register block offsets.
pub mod sgdma {
    /// Identifier register.
    pub const IDENTIFIER: usize = 0x00;
    /// Bus address of the first descriptor, low 32 bits.
    pub const FIRST_DESC_LO: usize = 0x80;
    /// Bus address of the first descriptor, high 32 bits.
    pub const FIRST_DESC_HI: usize = 0x84;
    /// Extra adjacent descriptors following the first one.
    pub const FIRST_DESC_ADJACENT: usize = 0x88;
    /// Streaming receive credits.
    pub const CREDITS: usize = 0x8C;
}

/// SGDMA common block offsets.
pub mod sgdma_common {
    /// Credit mode enable (one bit per C2H channel at `16 + channel`).
    pub const CREDIT_MODE_ENABLE: usize = 0x20;
    /// Credit mode enable, write-1-to-set.
    pub const CREDIT_MODE_ENABLE_W1S: usize = 0x24;
    /// Credit mode enable, write-1-to-clear.
    pub const CREDIT_MODE_ENABLE_W1C: usize = 0x28;

    /// Credit mode bit for a C2H channel.
    #[must_use]
    pub const fn credit_bit(channel: u32) -> u32 {
        (1 << channel) << 16
    }
}

// ── Control register bit definitions ────────────────────────────────────────

/// Control register bits.
pub mod control {
    /// Run / stop.
    pub const RUN_STOP: u32 = 1 << 0;
    /// Interrupt on descriptor with STOP flag.
    pub const IE_DESC_STOPPED: u32 = 1 << 1;
    /// Interrupt on descriptor with COMPLETED flag.
    pub const IE_DESC_COMPLETED: u32 = 1 << 2;
    /// Interrupt on descriptor alignment mismatch.
    pub const IE_DESC_ALIGN_MISMATCH: u32 = 1 << 3;
    /// Interrupt on bad descriptor magic.
    pub const IE_MAGIC_STOPPED: u32 = 1 << 4;
    /// Interrupt on idle stop.
    pub const IE_IDLE_STOPPED: u32 = 1 << 6;
    /// Interrupt on read errors.
    pub const IE_READ_ERROR: u32 = 0x1F << 9;
    /// Interrupt on descriptor fetch errors.
    pub const IE_DESC_ERROR: u32 = 0x1F << 19;
    /// Do not advance the device-side address.
    pub const NON_INCR_ADDR: u32 = 1 << 25;
    /// Write the completed count to host memory instead of interrupting.
    pub const POLL_MODE_WB: u32 = 1 << 26;

    /// Error classes always enabled while the engine runs or stops.
    pub const IE_ERRORS: u32 =
        IE_DESC_ALIGN_MISMATCH | IE_MAGIC_STOPPED | IE_READ_ERROR | IE_DESC_ERROR;

    /// Completion interrupts used in interrupt mode.
    pub const IE_COMPLETIONS: u32 = IE_DESC_STOPPED | IE_DESC_COMPLETED;
}

// ── Status register bit definitions ──────────────────────────────────────────

/// Status register bits.
pub mod status {
    /// Engine is fetching or executing descriptors.
    pub const BUSY: u32 = 1 << 0;
    /// Stopped on a descriptor carrying the STOP flag.
    pub const DESC_STOPPED: u32 = 1 << 1;
    /// Executed a descriptor carrying the COMPLETED flag.
    pub const DESC_COMPLETED: u32 = 1 << 2;
    /// Descriptor address / length alignment mismatch.
    pub const ALIGN_MISMATCH: u32 = 1 << 3;
    /// Descriptor magic was wrong; engine stopped unexpectedly.
    pub const MAGIC_STOPPED: u32 = 1 << 4;
    /// Invalid transfer length.
    pub const INVALID_LEN: u32 = 1 << 5;
    /// Engine went idle while run was asserted.
    pub const IDLE_STOPPED: u32 = 1 << 6;

    /// H2C read error class.
    pub const H2C_READ_ERROR: u32 = 0x1F << 9;
    /// C2H read error class.
    pub const C2H_READ_ERROR: u32 = 0x3 << 9;
    /// C2H write error class.
    pub const C2H_WRITE_ERROR: u32 = 0x7 << 14;
    /// Descriptor fetch error class.
    pub const DESC_ERROR: u32 = 0x1F << 19;

    /// Every bit that fails an H2C engine.
    pub const H2C_ERR_MASK: u32 =
        ALIGN_MISMATCH | MAGIC_STOPPED | INVALID_LEN | H2C_READ_ERROR | DESC_ERROR;

    /// Every bit that fails a C2H engine.
    pub const C2H_ERR_MASK: u32 = ALIGN_MISMATCH
        | MAGIC_STOPPED
        | INVALID_LEN
        | C2H_READ_ERROR
        | C2H_WRITE_ERROR
        | DESC_ERROR;
}

/// Largest value the first-descriptor-adjacent and descriptor adjacent
/// fields can hold.
pub const MAX_EXTRA_ADJACENT: u32 = 0x3F;
