//! Streaming receive result ring
//!
//! Every card-to-host streaming descriptor is paired with one 32-byte
//! result entry, zeroed when the descriptor is built. The engine stamps
//! [`RESULT_TAG`](xdma_chip::result::RESULT_TAG) and the delivered length
//! into it when a packet lands; draining walks the tagged entries in order.

use crate::error::Result;
use crate::hw::{DmaAllocator, DmaRegion};
use std::sync::Arc;
use xdma_chip::result::{is_written, LENGTH_WORD, RESULT_SIZE, STATUS_WORD};

/// Ring of result entries, one per descriptor slot
#[derive(Debug)]
pub struct ResultRing {
    region: Arc<dyn DmaRegion>,
    capacity: u32,
    pidx: u32,
    cidx: u32,
    /// Entries claimed and not yet drained
    outstanding: u32,
    /// Descriptors accounted for since the engine last started
    completed_since_start: u32,
}

impl ResultRing {
    /// Allocate `capacity` entries
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` if the allocator cannot supply the region.
    pub fn new(allocator: &dyn DmaAllocator, capacity: u32) -> Result<Self> {
        let region = allocator.alloc_coherent(capacity as usize * RESULT_SIZE)?;
        Ok(Self {
            region,
            capacity,
            pidx: 0,
            cidx: 0,
            outstanding: 0,
            completed_since_start: 0,
        })
    }

    /// Zero the next entry and return its bus address
    pub fn claim(&mut self) -> u64 {
        let at = self.pidx as usize * RESULT_SIZE;
        self.region.zero(at, RESULT_SIZE);
        self.pidx = (self.pidx + 1) % self.capacity;
        self.outstanding += 1;
        self.region.bus_addr() + at as u64
    }

    /// Consume every written entry from `cidx` onward
    ///
    /// Each entry accounts for its length rounded up to whole `buffer_bytes`
    /// descriptors (at least one). Returns the descriptors accounted for.
    pub fn drain(&mut self, buffer_bytes: u32) -> u32 {
        let mut descriptors = 0;
        while self.outstanding > 0 {
            let at = self.cidx as usize * RESULT_SIZE;
            let status = self.region.read32(at + STATUS_WORD * 4);
            if !is_written(status) {
                break;
            }
            let len = self.region.read32(at + LENGTH_WORD * 4);
            tracing::debug!("result {}: {len} bytes, status {status:#010x}", self.cidx);
            descriptors += len.div_ceil(buffer_bytes).max(1);
            self.cidx = (self.cidx + 1) % self.capacity;
            self.outstanding -= 1;
        }
        self.completed_since_start += descriptors;
        descriptors
    }

    /// Entries written by the engine and not yet drained
    pub fn undrained(&self) -> u32 {
        let mut n = 0;
        while n < self.outstanding {
            let idx = (self.cidx + n) % self.capacity;
            let status = self.region.read32(idx as usize * RESULT_SIZE + STATUS_WORD * 4);
            if !is_written(status) {
                break;
            }
            n += 1;
        }
        n
    }

    /// Entries claimed and not yet drained
    pub const fn outstanding(&self) -> u32 {
        self.outstanding
    }

    /// Start counting for a new engine run
    pub fn begin_run(&mut self) {
        self.completed_since_start = 0;
    }

    /// Descriptors accounted for since [`ResultRing::begin_run`]
    pub const fn completed_since_start(&self) -> u32 {
        self.completed_since_start
    }

    /// Forget every entry
    pub fn reset(&mut self) {
        self.region.zero(0, self.capacity as usize * RESULT_SIZE);
        self.pidx = 0;
        self.cidx = 0;
        self.outstanding = 0;
        self.completed_since_start = 0;
    }
}
