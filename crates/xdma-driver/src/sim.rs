// SPDX-License-Identifier: AGPL-3.0-only

//! Software model of one DMA engine
//!
//! Stands in for the config BAR so the full submit/complete path runs in CI
//! without an FPGA. The model:
//!
//! - decodes descriptors from host memory, following `next` links and
//!   honoring the magic tag and the STOP/COMPLETED flags
//! - copies data between host buffers and a flat card memory (memory
//!   mapped) or generates/consumes packets (streaming)
//! - writes a result entry per streaming receive descriptor, one credit
//!   each, and stalls with no credit left
//! - keeps the completed-descriptor count, writes it back in poll mode and
//!   raises the interrupt when the mask allows
//!
//! In [`SimMode::Immediate`] a started chain runs to completion inside the
//! control register write; in [`SimMode::Manual`] nothing moves until
//! [`SimulatedEngine::advance`] is called.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use xdma_driver::prelude::*;
//! use xdma_driver::sim::{SimMemory, SimulatedEngine};
//!
//! let mem = Arc::new(SimMemory::new());
//! let sim = Arc::new(SimulatedEngine::new(mem.clone(), Direction::H2C, 0));
//! let engine = Engine::new(EngineConfig::new(Direction::H2C, 0), sim.clone(), mem.as_ref())?;
//! sim.connect_irq(engine.irq_handle());
//! # Ok::<(), DmaError>(())
//! ```

use crate::error::Result;
use crate::hw::{DmaAllocator, DmaRegion, RegisterAccess};
use crate::memory::{HostAllocator, HostRegion};
use crate::worker::IrqHandle;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use xdma_chip::bar::{self, Direction};
use xdma_chip::desc::{flags, Descriptor, DESC_SIZE, DESC_WORDS};
use xdma_chip::ident::{Alignments, EngineIdentity, SUBSYSTEM_ID};
use xdma_chip::regs::{control, engine as reg, sgdma, sgdma_common, status};
use xdma_chip::result::{Writeback, LENGTH_WORD, RESULT_EOP, RESULT_SIZE, RESULT_TAG, STATUS_WORD};

/// First synthetic bus address; above 4 GiB so the high words matter
const SIM_IOVA_BASE: u64 = 0x1_0000_0000;

/// Default card memory size
const DEFAULT_CARD_BYTES: usize = 1 << 20;

/// Status bit raised when host memory cannot be read
const READ_ERROR: u32 = 1 << 9;

/// Status bit raised when card memory cannot be written
const CARD_WRITE_ERROR: u32 = 1 << 10;

/// Status bit raised when host memory cannot be written
const WRITE_ERROR: u32 = 1 << 14;

/// Status bit raised when a descriptor cannot be fetched
const FETCH_ERROR: u32 = 1 << 19;

/// Host memory plus card memory shared by simulated engines
#[derive(Debug)]
pub struct SimMemory {
    allocator: HostAllocator,
    regions: Mutex<BTreeMap<u64, Arc<HostRegion>>>,
    card: Mutex<Vec<u8>>,
}

impl Default for SimMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl SimMemory {
    /// Memory with a 1 MiB card
    pub fn new() -> Self {
        Self::with_card_size(DEFAULT_CARD_BYTES)
    }

    /// Memory with a card of `bytes`
    pub fn with_card_size(bytes: usize) -> Self {
        Self {
            allocator: HostAllocator::new(SIM_IOVA_BASE),
            regions: Mutex::new(BTreeMap::new()),
            card: Mutex::new(vec![0; bytes]),
        }
    }

    /// Allocate a host buffer the engine can reach
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` if the allocation fails.
    pub fn alloc_buffer(&self, size: usize) -> Result<Arc<HostRegion>> {
        let region = self.allocator.alloc_region(size)?;
        crate::lock(&self.regions).insert(region.bus_addr(), region.clone());
        Ok(region)
    }

    /// Region and offset holding `[bus, bus + len)`
    #[allow(clippy::cast_possible_truncation)]
    pub fn resolve(&self, bus: u64, len: usize) -> Option<(Arc<HostRegion>, usize)> {
        let regions = crate::lock(&self.regions);
        let (base, region) = regions.range(..=bus).next_back()?;
        region
            .contains(bus, len)
            .then(|| (region.clone(), (bus - base) as usize))
    }

    /// Copy out of card memory; `false` if out of range
    pub fn read_card(&self, offset: u64, out: &mut [u8]) -> bool {
        let card = crate::lock(&self.card);
        match card_range(card.len(), offset, out.len()) {
            Some(r) => {
                out.copy_from_slice(&card[r]);
                true
            }
            None => false,
        }
    }

    /// Copy into card memory; `false` if out of range
    pub fn write_card(&self, offset: u64, data: &[u8]) -> bool {
        let mut card = crate::lock(&self.card);
        match card_range(card.len(), offset, data.len()) {
            Some(r) => {
                card[r].copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    fn read_descriptor(&self, bus: u64) -> Option<Descriptor> {
        let (region, at) = self.resolve(bus, DESC_SIZE)?;
        let mut w = [0u32; DESC_WORDS];
        region.read_words(at, &mut w);
        Some(Descriptor::from_words(w))
    }
}

fn card_range(size: usize, offset: u64, len: usize) -> Option<std::ops::Range<usize>> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(len)?;
    (end <= size).then_some(start..end)
}

impl DmaAllocator for SimMemory {
    fn alloc_coherent(&self, size: usize) -> Result<Arc<dyn DmaRegion>> {
        let region: Arc<dyn DmaRegion> = self.alloc_buffer(size)?;
        Ok(region)
    }
}

/// When a started chain executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimMode {
    /// Run to the terminal descriptor inside the start write
    Immediate,
    /// Only run on [`SimulatedEngine::advance`]
    Manual,
}

#[derive(Debug, Default)]
struct SimState {
    control: u32,
    status: u32,
    completed: u32,
    irq_mask: u32,
    wb_lo: u32,
    wb_hi: u32,
    first_lo: u32,
    first_hi: u32,
    first_adjacent: u32,
    credits: u32,
    credit_mode: u32,
    cursor: Option<u64>,
    running: bool,
    forced_busy: u32,
    starts: u32,
    irq: Option<IrqHandle>,
    stream_bytes: u64,
    stream_seq: u8,
}

enum Block {
    Channel(usize),
    Sgdma(usize),
    Common(usize),
    Other,
}

/// Register-level model of one engine
#[derive(Debug)]
pub struct SimulatedEngine {
    memory: Arc<SimMemory>,
    direction: Direction,
    channel: u32,
    streaming: bool,
    mode: SimMode,
    alignments: Alignments,
    packet_len: Option<u32>,
    state: Mutex<SimState>,
}

impl SimulatedEngine {
    /// Memory-mapped engine in immediate mode
    pub fn new(memory: Arc<SimMemory>, direction: Direction, channel: u32) -> Self {
        Self {
            memory,
            direction,
            channel,
            streaming: false,
            mode: SimMode::Immediate,
            alignments: Alignments {
                addr_align: 1,
                len_granularity: 4,
                addr_bits: 64,
            },
            packet_len: None,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Report a streaming user interface
    #[must_use]
    pub fn streaming(mut self, on: bool) -> Self {
        self.streaming = on;
        self
    }

    /// Choose when chains execute
    #[must_use]
    pub fn mode(mut self, mode: SimMode) -> Self {
        self.mode = mode;
        self
    }

    /// Alignment rules the alignments register reports
    #[must_use]
    pub fn alignments(mut self, alignments: Alignments) -> Self {
        self.alignments = alignments;
        self
    }

    /// Deliver streaming receive packets of at most `len` bytes
    #[must_use]
    pub fn stream_packet_len(mut self, len: u32) -> Self {
        self.packet_len = Some(len);
        self
    }

    /// Route interrupts to an engine's completion path
    pub fn connect_irq(&self, irq: IrqHandle) {
        crate::lock(&self.state).irq = Some(irq);
    }

    /// Execute up to `n` descriptors; returns how many ran
    pub fn advance(&self, n: u32) -> u32 {
        let mut s = crate::lock(&self.state);
        self.execute(&mut s, n)
    }

    /// Execute until the chain stops or stalls
    pub fn run_until_idle(&self) -> u32 {
        self.advance(u32::MAX)
    }

    /// Stop the engine with `bits` in the status register
    pub fn inject_error(&self, bits: u32) {
        let mut s = crate::lock(&self.state);
        self.halt(&mut s, bits);
    }

    /// Report busy on the next `n` status reads
    pub fn force_start_busy(&self, n: u32) {
        crate::lock(&self.state).forced_busy = n;
    }

    /// Streaming receive credits left
    pub fn credits(&self) -> u32 {
        crate::lock(&self.state).credits
    }

    /// Times the run bit was set
    pub fn starts(&self) -> u32 {
        crate::lock(&self.state).starts
    }

    /// Whether a chain is executing
    pub fn is_running(&self) -> bool {
        crate::lock(&self.state).running
    }

    /// Bytes a streaming send engine has consumed
    pub fn stream_bytes(&self) -> u64 {
        crate::lock(&self.state).stream_bytes
    }

    fn identity(&self) -> u32 {
        EngineIdentity {
            subsystem: SUBSYSTEM_ID,
            direction: Some(self.direction),
            streaming: self.streaming,
            channel: self.channel,
            version: 6,
        }
        .encode()
    }

    fn block(&self, offset: usize) -> Block {
        let ch = bar::channel_block(self.direction, self.channel);
        let sg = bar::sgdma_block(self.direction, self.channel);
        let common = bar::SGDMA_COMMON_OFFSET;
        if (ch..ch + bar::CHANNEL_SPACING).contains(&offset) {
            Block::Channel(offset - ch)
        } else if (sg..sg + bar::CHANNEL_SPACING).contains(&offset) {
            Block::Sgdma(offset - sg)
        } else if (common..common + bar::TARGET_SPACING).contains(&offset) {
            Block::Common(offset - common)
        } else {
            Block::Other
        }
    }

    fn is_streaming_receive(&self) -> bool {
        self.streaming && self.direction == Direction::C2H
    }

    fn credit_limited(&self, s: &SimState) -> bool {
        self.is_streaming_receive() && s.credit_mode & sgdma_common::credit_bit(self.channel) != 0
    }

    fn control_changed(&self, s: &mut SimState, before: u32) {
        let run_now = s.control & control::RUN_STOP != 0;
        let run_before = before & control::RUN_STOP != 0;
        if run_now && !run_before {
            s.starts += 1;
            s.completed = 0;
            s.cursor = Some((u64::from(s.first_hi) << 32) | u64::from(s.first_lo));
            s.running = true;
            s.status &= !(status::DESC_STOPPED | status::DESC_COMPLETED);
            tracing::trace!("sim {}{}: start #{}", self.direction, self.channel, s.starts);
            if self.mode == SimMode::Immediate {
                self.execute(s, u32::MAX);
            }
        } else if !run_now && run_before {
            s.running = false;
            s.cursor = None;
        }
    }

    fn execute(&self, s: &mut SimState, max: u32) -> u32 {
        let mut n = 0;
        while n < max && self.step(s) {
            n += 1;
        }
        n
    }

    /// Run one descriptor; `false` if nothing could run
    fn step(&self, s: &mut SimState) -> bool {
        if !s.running {
            return false;
        }
        let Some(at) = s.cursor else {
            return false;
        };
        let Some(desc) = self.memory.read_descriptor(at) else {
            self.halt(s, FETCH_ERROR);
            return false;
        };
        if !desc.has_magic() {
            self.halt(s, status::MAGIC_STOPPED);
            return false;
        }
        if self.credit_limited(s) && s.credits == 0 {
            return false;
        }
        if let Err(bits) = self.transfer(s, &desc) {
            self.halt(s, bits);
            return false;
        }
        if self.credit_limited(s) {
            s.credits -= 1;
        }
        s.completed += 1;
        if s.control & control::POLL_MODE_WB != 0 {
            self.write_back(s, false);
        }

        let mut notify = self.is_streaming_receive() || desc.has_flags(flags::COMPLETED);
        if desc.has_flags(flags::STOP) {
            s.running = false;
            s.cursor = None;
            s.status |= status::DESC_STOPPED;
            if desc.has_flags(flags::COMPLETED) {
                s.status |= status::DESC_COMPLETED;
            }
            notify = true;
        } else if desc.next_addr == 0 {
            self.halt(s, FETCH_ERROR);
            return true;
        } else {
            s.cursor = Some(desc.next_addr);
        }
        if notify && s.irq_mask & control::IE_COMPLETIONS != 0 {
            raise(s);
        }
        true
    }

    fn transfer(&self, s: &mut SimState, desc: &Descriptor) -> std::result::Result<(), u32> {
        let len = desc.bytes as usize;
        match (self.direction, self.streaming) {
            (Direction::H2C, streaming) => {
                let (src, off) = self.memory.resolve(desc.src_addr, len).ok_or(READ_ERROR)?;
                let mut buf = vec![0u8; len];
                src.read_bytes(off, &mut buf);
                if streaming {
                    s.stream_bytes += buf.len() as u64;
                } else if !self.memory.write_card(desc.dst_addr, &buf) {
                    return Err(CARD_WRITE_ERROR);
                }
            }
            (Direction::C2H, false) => {
                let mut buf = vec![0u8; len];
                if !self.memory.read_card(desc.src_addr, &mut buf) {
                    return Err(READ_ERROR);
                }
                let (dst, off) = self.memory.resolve(desc.dst_addr, len).ok_or(WRITE_ERROR)?;
                dst.write_bytes(off, &buf);
            }
            (Direction::C2H, true) => {
                let packet = self.packet_len.map_or(desc.bytes, |p| p.min(desc.bytes));
                s.stream_seq = s.stream_seq.wrapping_add(1);
                let buf = vec![s.stream_seq; packet as usize];
                let (dst, off) = self
                    .memory
                    .resolve(desc.dst_addr, buf.len())
                    .ok_or(WRITE_ERROR)?;
                dst.write_bytes(off, &buf);
                let (result, roff) = self
                    .memory
                    .resolve(desc.src_addr, RESULT_SIZE)
                    .ok_or(WRITE_ERROR)?;
                result.write32(roff + LENGTH_WORD * 4, packet);
                result.write32(roff + STATUS_WORD * 4, RESULT_TAG | RESULT_EOP);
            }
        }
        Ok(())
    }

    fn write_back(&self, s: &SimState, error: bool) {
        let bus = (u64::from(s.wb_hi) << 32) | u64::from(s.wb_lo);
        if let Some((region, at)) = self.memory.resolve(bus, 4) {
            let word = Writeback {
                completed: s.completed,
                error,
            };
            region.write32(at, word.encode());
        }
    }

    fn halt(&self, s: &mut SimState, bits: u32) {
        tracing::debug!("sim {}{}: halted, status bits {bits:#x}", self.direction, self.channel);
        s.status |= bits;
        s.running = false;
        s.cursor = None;
        if s.control & control::POLL_MODE_WB != 0 {
            self.write_back(s, true);
        }
        if s.irq_mask & control::IE_ERRORS != 0 {
            raise(s);
        }
    }
}

fn raise(s: &SimState) {
    if let Some(irq) = &s.irq {
        irq.raise();
    }
}

impl RegisterAccess for SimulatedEngine {
    fn read32(&self, offset: usize) -> u32 {
        let mut s = crate::lock(&self.state);
        match self.block(offset) {
            Block::Channel(r) => match r {
                reg::IDENTIFIER => self.identity(),
                reg::CONTROL => s.control,
                reg::STATUS => {
                    let busy = if s.forced_busy > 0 {
                        s.forced_busy -= 1;
                        true
                    } else {
                        s.running
                    };
                    s.status | if busy { status::BUSY } else { 0 }
                }
                reg::STATUS_RC => {
                    let value = s.status | if s.running { status::BUSY } else { 0 };
                    s.status = 0;
                    value
                }
                reg::COMPLETED_DESC_COUNT => s.completed,
                reg::ALIGNMENTS => self.alignments.encode(),
                reg::POLL_MODE_WB_LO => s.wb_lo,
                reg::POLL_MODE_WB_HI => s.wb_hi,
                reg::INTERRUPT_ENABLE_MASK
                | reg::INTERRUPT_ENABLE_MASK_W1S
                | reg::INTERRUPT_ENABLE_MASK_W1C => s.irq_mask,
                _ => 0,
            },
            Block::Sgdma(r) => match r {
                sgdma::IDENTIFIER => self.identity(),
                sgdma::FIRST_DESC_LO => s.first_lo,
                sgdma::FIRST_DESC_HI => s.first_hi,
                sgdma::FIRST_DESC_ADJACENT => s.first_adjacent,
                sgdma::CREDITS => s.credits,
                _ => 0,
            },
            Block::Common(r) => match r {
                sgdma_common::CREDIT_MODE_ENABLE
                | sgdma_common::CREDIT_MODE_ENABLE_W1S
                | sgdma_common::CREDIT_MODE_ENABLE_W1C => s.credit_mode,
                _ => 0,
            },
            Block::Other => 0,
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut s = crate::lock(&self.state);
        match self.block(offset) {
            Block::Channel(r) => {
                let before = s.control;
                match r {
                    reg::CONTROL => s.control = value,
                    reg::CONTROL_W1S => s.control |= value,
                    reg::CONTROL_W1C => s.control &= !value,
                    reg::POLL_MODE_WB_LO => s.wb_lo = value,
                    reg::POLL_MODE_WB_HI => s.wb_hi = value,
                    reg::INTERRUPT_ENABLE_MASK => s.irq_mask = value,
                    reg::INTERRUPT_ENABLE_MASK_W1S => s.irq_mask |= value,
                    reg::INTERRUPT_ENABLE_MASK_W1C => s.irq_mask &= !value,
                    _ => {}
                }
                if s.control != before {
                    self.control_changed(&mut s, before);
                }
            }
            Block::Sgdma(r) => match r {
                sgdma::FIRST_DESC_LO => s.first_lo = value,
                sgdma::FIRST_DESC_HI => s.first_hi = value,
                sgdma::FIRST_DESC_ADJACENT => s.first_adjacent = value,
                sgdma::CREDITS => s.credits = value,
                _ => {}
            },
            Block::Common(r) => match r {
                sgdma_common::CREDIT_MODE_ENABLE => s.credit_mode = value,
                sgdma_common::CREDIT_MODE_ENABLE_W1S => s.credit_mode |= value,
                sgdma_common::CREDIT_MODE_ENABLE_W1C => s.credit_mode &= !value,
                _ => {}
            },
            Block::Other => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::EngineRegs;

    fn link(mem: &SimMemory, descs: &[Descriptor]) -> u64 {
        let region = mem.alloc_buffer(descs.len() * DESC_SIZE).unwrap();
        for (i, d) in descs.iter().enumerate() {
            let mut d = *d;
            if i + 1 < descs.len() {
                d.next_addr = region.bus_addr() + ((i + 1) * DESC_SIZE) as u64;
            }
            region.write_words(i * DESC_SIZE, &d.to_words());
        }
        region.bus_addr()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn start(regs: &EngineRegs, first: u64) {
        regs.sgdma_write(sgdma::FIRST_DESC_LO, first as u32);
        regs.sgdma_write(sgdma::FIRST_DESC_HI, (first >> 32) as u32);
        regs.write(reg::CONTROL, control::RUN_STOP);
    }

    #[test]
    fn resolve_finds_the_owning_region() {
        let mem = SimMemory::new();
        let a = mem.alloc_buffer(4096).unwrap();
        let b = mem.alloc_buffer(4096).unwrap();
        let (r, off) = mem.resolve(b.bus_addr() + 16, 8).unwrap();
        assert_eq!((r.bus_addr(), off), (b.bus_addr(), 16));
        assert!(mem.resolve(a.bus_addr() + 4090, 8).is_none());
        assert!(mem.resolve(0, 4).is_none());
    }

    #[test]
    fn runs_a_chain_into_card_memory() {
        let mem = Arc::new(SimMemory::new());
        let sim = Arc::new(SimulatedEngine::new(mem.clone(), Direction::H2C, 0));
        let regs = EngineRegs::new(sim.clone(), Direction::H2C, 0);
        let buf = mem.alloc_buffer(8).unwrap();
        buf.write_bytes(0, b"abcdefgh");

        let mut last = Descriptor::new(4, buf.bus_addr() + 4, 0x104);
        last.terminate();
        let first = link(&mem, &[Descriptor::new(4, buf.bus_addr(), 0x100), last]);
        start(&regs, first);

        assert!(!sim.is_running());
        assert_eq!(regs.read(reg::COMPLETED_DESC_COUNT), 2);
        assert_ne!(regs.read(reg::STATUS_RC) & status::DESC_STOPPED, 0);
        assert_eq!(regs.read(reg::STATUS_RC), 0, "read clears");
        let mut out = [0u8; 8];
        assert!(mem.read_card(0x100, &mut out));
        assert_eq!(&out, b"abcdefgh");
    }

    #[test]
    fn bad_magic_stops_the_engine() {
        let mem = Arc::new(SimMemory::new());
        let sim = Arc::new(SimulatedEngine::new(mem.clone(), Direction::H2C, 0));
        let regs = EngineRegs::new(sim.clone(), Direction::H2C, 0);
        let mut d = Descriptor::new(4, 0, 0);
        d.control = 0;
        start(&regs, link(&mem, &[d]));
        assert_ne!(regs.read(reg::STATUS) & status::MAGIC_STOPPED, 0);
        assert_eq!(regs.read(reg::COMPLETED_DESC_COUNT), 0);
    }

    #[test]
    fn streaming_receive_stalls_without_credit() {
        let mem = Arc::new(SimMemory::new());
        let sim = Arc::new(
            SimulatedEngine::new(mem.clone(), Direction::C2H, 1)
                .streaming(true)
                .mode(SimMode::Manual),
        );
        let regs = EngineRegs::new(sim.clone(), Direction::C2H, 1);
        regs.common_write(sgdma_common::CREDIT_MODE_ENABLE_W1S, regs.credit_bit());
        regs.sgdma_write(sgdma::CREDITS, 1);

        let results = mem.alloc_buffer(2 * RESULT_SIZE).unwrap();
        let data = mem.alloc_buffer(8192).unwrap();
        let mut last = Descriptor::new(4096, results.bus_addr() + RESULT_SIZE as u64, data.bus_addr() + 4096);
        last.terminate();
        let first = link(&mem, &[Descriptor::new(4096, results.bus_addr(), data.bus_addr()), last]);
        start(&regs, first);

        assert_eq!(sim.advance(5), 1);
        assert_eq!(sim.credits(), 0);
        assert_eq!(results.read32(STATUS_WORD * 4), RESULT_TAG | RESULT_EOP);
        assert_eq!(results.read32(RESULT_SIZE + STATUS_WORD * 4), 0);
        regs.sgdma_write(sgdma::CREDITS, 1);
        assert_eq!(sim.advance(5), 1);
        assert!(!sim.is_running());
    }

    #[test]
    fn forced_busy_is_reported_then_clears() {
        let mem = Arc::new(SimMemory::new());
        let sim = Arc::new(SimulatedEngine::new(mem, Direction::H2C, 0));
        sim.force_start_busy(1);
        let regs = EngineRegs::new(sim, Direction::H2C, 0);
        assert_ne!(regs.read(reg::STATUS) & status::BUSY, 0);
        assert_eq!(regs.read(reg::STATUS) & status::BUSY, 0);
    }
}
