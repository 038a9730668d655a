//! Engine configuration
//!
//! Plain struct with chained setters. Defaults mirror the values the
//! hardware was validated with; `from_env` lets a deployment override the
//! handful of knobs that used to be load-time parameters.

use crate::error::{DmaError, Result};
use std::time::Duration;
use xdma_chip::bar::{Direction, MAX_CHANNELS};
use xdma_chip::desc::BLEN_MAX;
use xdma_chip::result::WB_COUNT_MASK;

/// Supported descriptor set depths
pub const SUPPORTED_DEPTHS: [u32; 4] = [16, 32, 64, 128];

/// How completion is detected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Read the completed-count register after an interrupt
    Interrupt,
    /// Poll a write-back word the engine updates in host memory
    Poll,
}

/// Per-engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Transfer direction
    pub direction: Direction,

    /// Channel number within the direction
    pub channel: u32,

    /// Number of descriptor sets in the ring (N)
    pub set_count: u32,

    /// Descriptors per set
    pub set_depth: u32,

    /// Largest length a single descriptor may carry
    pub desc_blen_max: u32,

    /// Interrupt or write-back polling
    pub completion_mode: CompletionMode,

    /// Streaming user interface; `None` reads it from the identifier register
    pub streaming: Option<bool>,

    /// Enable credit control for streaming receive
    pub credit_control: bool,

    /// Keep the device address fixed across descriptors
    pub non_incrementing: bool,

    /// Keep adjacent prefetch blocks inside one 4 KB page
    pub page_clamp: bool,

    /// How long a write-back poll may spin
    pub poll_timeout: Duration,

    /// Default deadline for a request
    pub request_timeout: Duration,

    /// Host buffer size behind each streaming receive descriptor
    pub stream_buffer_bytes: u32,

    /// Pending-build requests accepted before submit reports busy
    pub max_pending_requests: usize,

    /// Hardware start retries when the caller demands progress
    pub start_retry_limit: u32,

    /// Write-back reads between scheduler yields
    pub polls_per_yield: u32,
}

impl EngineConfig {
    /// Defaults for one engine
    pub const fn new(direction: Direction, channel: u32) -> Self {
        Self {
            direction,
            channel,
            set_count: 64,
            set_depth: 32,
            desc_blen_max: BLEN_MAX,
            completion_mode: CompletionMode::Interrupt,
            streaming: None,
            credit_control: true,
            non_incrementing: false,
            page_clamp: false,
            poll_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            stream_buffer_bytes: 4096,
            max_pending_requests: 1024,
            start_retry_limit: 8,
            polls_per_yield: 1000,
        }
    }

    /// Defaults overridden from `XDMA_*` environment variables
    ///
    /// Recognised: `XDMA_POLL_MODE` (0/1), `XDMA_DESC_SET_DEPTH`,
    /// `XDMA_DESC_SET_COUNT`, `XDMA_DESC_BLEN_MAX`, `XDMA_CREDIT_MODE` (0/1).
    /// Unparseable values are ignored with a warning.
    pub fn from_env(direction: Direction, channel: u32) -> Self {
        let mut cfg = Self::new(direction, channel);
        if let Some(v) = env_u32("XDMA_POLL_MODE") {
            cfg.completion_mode = if v == 0 {
                CompletionMode::Interrupt
            } else {
                CompletionMode::Poll
            };
        }
        if let Some(v) = env_u32("XDMA_DESC_SET_DEPTH") {
            cfg.set_depth = v;
        }
        if let Some(v) = env_u32("XDMA_DESC_SET_COUNT") {
            cfg.set_count = v;
        }
        if let Some(v) = env_u32("XDMA_DESC_BLEN_MAX") {
            cfg.desc_blen_max = v;
        }
        if let Some(v) = env_u32("XDMA_CREDIT_MODE") {
            cfg.credit_control = v != 0;
        }
        cfg
    }

    /// Set the number of descriptor sets
    #[must_use]
    pub const fn with_set_count(mut self, n: u32) -> Self {
        self.set_count = n;
        self
    }

    /// Set the descriptors per set
    #[must_use]
    pub const fn with_set_depth(mut self, depth: u32) -> Self {
        self.set_depth = depth;
        self
    }

    /// Set the per-descriptor length limit
    #[must_use]
    pub const fn with_desc_blen_max(mut self, max: u32) -> Self {
        self.desc_blen_max = max;
        self
    }

    /// Set the completion mode
    #[must_use]
    pub const fn with_completion_mode(mut self, mode: CompletionMode) -> Self {
        self.completion_mode = mode;
        self
    }

    /// Force streaming or memory-mapped operation
    #[must_use]
    pub const fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = Some(streaming);
        self
    }

    /// Enable or disable streaming receive credits
    #[must_use]
    pub const fn with_credit_control(mut self, on: bool) -> Self {
        self.credit_control = on;
        self
    }

    /// Keep the device address fixed
    #[must_use]
    pub const fn with_non_incrementing(mut self, on: bool) -> Self {
        self.non_incrementing = on;
        self
    }

    /// Clamp adjacent blocks to 4 KB pages
    #[must_use]
    pub const fn with_page_clamp(mut self, on: bool) -> Self {
        self.page_clamp = on;
        self
    }

    /// Set the write-back poll timeout
    #[must_use]
    pub const fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the default request deadline
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the streaming receive buffer size
    #[must_use]
    pub const fn with_stream_buffer_bytes(mut self, bytes: u32) -> Self {
        self.stream_buffer_bytes = bytes;
        self
    }

    /// Set the pending request limit
    #[must_use]
    pub const fn with_max_pending_requests(mut self, n: usize) -> Self {
        self.max_pending_requests = n;
        self
    }

    /// Set the hardware start retry limit
    #[must_use]
    pub const fn with_start_retry_limit(mut self, n: u32) -> Self {
        self.start_retry_limit = n;
        self
    }

    /// Total descriptor slots in the ring
    pub const fn total_descriptors(&self) -> u32 {
        self.set_count * self.set_depth
    }

    /// Check the configuration against what the hardware can express
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.channel >= MAX_CHANNELS {
            return Err(DmaError::invalid_argument(format!(
                "channel {} >= {MAX_CHANNELS}",
                self.channel
            )));
        }
        if !SUPPORTED_DEPTHS.contains(&self.set_depth) {
            return Err(DmaError::invalid_argument(format!(
                "set depth {} not one of {SUPPORTED_DEPTHS:?}",
                self.set_depth
            )));
        }
        if self.set_count < 2 {
            return Err(DmaError::invalid_argument(format!(
                "set count {} < 2",
                self.set_count
            )));
        }
        if self.set_count.checked_mul(self.set_depth).is_none_or(|t| t > WB_COUNT_MASK) {
            return Err(DmaError::invalid_argument(format!(
                "{} sets of {} exceed the completed-count field",
                self.set_count, self.set_depth
            )));
        }
        if self.desc_blen_max == 0 || self.desc_blen_max > BLEN_MAX {
            return Err(DmaError::invalid_argument(format!(
                "desc_blen_max {:#x} outside 1..={BLEN_MAX:#x}",
                self.desc_blen_max
            )));
        }
        if self.stream_buffer_bytes == 0 {
            return Err(DmaError::invalid_argument("stream_buffer_bytes is zero"));
        }
        if self.max_pending_requests == 0 {
            return Err(DmaError::invalid_argument("max_pending_requests is zero"));
        }
        Ok(())
    }
}

fn env_u32(name: &str) -> Option<u32> {
    let raw = std::env::var(name).ok()?;
    let parsed = raw
        .strip_prefix("0x")
        .map_or_else(|| raw.parse::<u32>(), |hex| u32::from_str_radix(hex, 16));
    match parsed {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("Ignoring {name}={raw}: {e}");
            None
        }
    }
}
