//! Error types for DMA engine operations

use thiserror::Error;

/// Result type alias for DMA engine operations
pub type Result<T> = std::result::Result<T, DmaError>;

/// Errors that can occur while submitting or servicing DMA requests
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DmaError {
    /// Ring or engine temporarily saturated; nothing was queued
    #[error("Engine busy: {reason}")]
    Busy {
        /// What was saturated
        reason: String,
    },

    /// Malformed request, rejected before any ring mutation
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the request
        reason: String,
    },

    /// Synchronous wait exceeded its deadline; the transfer may still run
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Engine status register reported an error class
    #[error("Hardware error: status {status:#010x} ({reason})")]
    HardwareError {
        /// Raw status register value
        status: u32,
        /// Decoded error classes
        reason: String,
    },

    /// Engine is tearing down or offline
    #[error("Engine {engine} is shutting down")]
    ShuttingDown {
        /// Engine name
        engine: String,
    },

    /// Coherent memory could not be allocated
    #[error("Out of DMA memory: {reason}")]
    OutOfMemory {
        /// Allocation that failed
        reason: String,
    },

    /// I/O error while mapping or accessing the device
    #[error("I/O error: {reason}")]
    Io {
        /// Underlying error text
        reason: String,
    },
}

impl From<std::io::Error> for DmaError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            reason: source.to_string(),
        }
    }
}

impl DmaError {
    /// Create a busy error
    pub fn busy(reason: impl Into<String>) -> Self {
        Self::Busy {
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout {
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a hardware error from a raw status value
    pub fn hardware(status: u32) -> Self {
        Self::HardwareError {
            status,
            reason: describe_status(status),
        }
    }

    /// Create a shutting-down error
    pub fn shutting_down(engine: impl Into<String>) -> Self {
        Self::ShuttingDown {
            engine: engine.into(),
        }
    }

    /// Create an out-of-memory error
    pub fn out_of_memory(reason: impl Into<String>) -> Self {
        Self::OutOfMemory {
            reason: reason.into(),
        }
    }

    /// Only `Busy` is worth retrying without caller intervention
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    /// Negative errno a C caller of the engine would have seen
    pub const fn errno(&self) -> i32 {
        const EIO: i32 = 5;
        const ENOMEM: i32 = 12;
        const EBUSY: i32 = 16;
        const EINVAL: i32 = 22;
        const ESHUTDOWN: i32 = 108;
        match self {
            Self::Busy { .. } => -EBUSY,
            Self::InvalidArgument { .. } => -EINVAL,
            Self::Timeout { .. } | Self::HardwareError { .. } | Self::Io { .. } => -EIO,
            Self::ShuttingDown { .. } => -ESHUTDOWN,
            Self::OutOfMemory { .. } => -ENOMEM,
        }
    }
}

/// Name the error classes present in a status value
fn describe_status(status: u32) -> String {
    use xdma_chip::regs::status as st;

    let classes = [
        (st::ALIGN_MISMATCH, "align mismatch"),
        (st::MAGIC_STOPPED, "unexpected stop"),
        (st::INVALID_LEN, "invalid length"),
        (st::H2C_READ_ERROR, "read error"),
        (st::C2H_WRITE_ERROR, "write error"),
        (st::DESC_ERROR, "descriptor error"),
    ];
    let names: Vec<&str> = classes
        .iter()
        .filter(|(mask, _)| status & mask != 0)
        .map(|(_, name)| *name)
        .collect();
    if names.is_empty() {
        "no error class".to_string()
    } else {
        names.join(", ")
    }
}
