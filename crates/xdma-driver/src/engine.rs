// SPDX-License-Identifier: AGPL-3.0-only

//! Per-channel DMA engine
//!
//! One [`Engine`] owns one descriptor ring, one request queue and the run
//! state of one direction/channel of the IP.
//!
//! ## Locking
//!
//! ```text
//!   run lock   state, per-run descriptor counts, the decision to start
//!     └── ring lock   ring indices, set fill levels, request lists, result ring
//! ```
//!
//! The run lock is always taken first. The ring lock is held only for
//! bookkeeping and never across a register write; the run lock is held
//! across the hardware start and stop.
//!
//! ## State machine
//!
//! ```text
//!   Idle ──start──► Running ──last credit──► Idle
//!     │                │
//!     └──shutdown──► ShuttingDown ──hardware stopped, queues empty──► Idle (offline)
//! ```

use crate::builder::{self, BuildState, FillParams, FillReport};
use crate::completion::{CompletionSource, CompletionTracker, InterruptSource, WritebackSource};
use crate::config::{CompletionMode, EngineConfig};
use crate::error::{DmaError, Result};
use crate::hw::{DmaAllocator, DmaRegion, EngineRegs, RegisterAccess};
use crate::request::{split, Callback, Completion, Delivery, Notify, Request, RequestQueue, ScatterEntry};
use crate::result_ring::ResultRing;
use crate::ring::{Chain, DescriptorArena, Ring};
use crate::worker::{Doorbell, IrqHandle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use xdma_chip::bar::Direction;
use xdma_chip::ident::{Alignments, EngineIdentity, SUBSYSTEM_ID};
use xdma_chip::regs::{control, engine as reg, sgdma, sgdma_common, status};
use xdma_chip::result::WRITEBACK_SIZE;

/// How long shutdown waits for the busy bit to drop
const SHUTDOWN_BUSY_WAIT: Duration = Duration::from_millis(100);

/// Interrupt sources enabled while the engine runs
const IRQ_MASK: u32 = control::IE_ERRORS | control::IE_COMPLETIONS;

/// Engine run state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No chain handed to the hardware
    Idle,
    /// A chain is executing
    Running,
    /// Teardown in progress
    ShuttingDown,
}

#[derive(Debug)]
struct RunState {
    state: EngineState,
    /// Descriptors handed to the hardware in the current run
    desc_queued: u32,
    /// Descriptors of the current run already credited
    desc_dequeued: u32,
    /// Bumped on every start, abort and shutdown
    epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    /// Caller needs forward progress: retry a busy start a bounded number of times
    Retry,
    /// Background fill: give up on the first busy start
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Start {
    Started,
    AlreadyRunning,
    NothingReady,
}

/// Counters since construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Requests accepted by submit
    pub requests_submitted: u64,
    /// Requests fully credited
    pub requests_completed: u64,
    /// Requests resolved with an error (hardware, shutdown, expiry)
    pub requests_failed: u64,
    /// Descriptors created from scatter lists
    pub descriptors_submitted: u64,
    /// Descriptors credited complete
    pub descriptors_completed: u64,
    /// Bytes delivered to completed requests
    pub bytes_completed: u64,
    /// Successful hardware starts
    pub hw_starts: u64,
    /// Starts refused because the engine reported busy
    pub start_busy_retries: u64,
    /// Fill passes that stopped for lack of a free set
    pub ring_full_events: u64,
    /// Descriptor sets closed
    pub sets_closed: u64,
    /// Completion service passes
    pub services: u64,
    /// Completed descriptors no set or request could absorb
    pub unattributed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    requests_submitted: AtomicU64,
    requests_completed: AtomicU64,
    requests_failed: AtomicU64,
    descriptors_submitted: AtomicU64,
    descriptors_completed: AtomicU64,
    bytes_completed: AtomicU64,
    hw_starts: AtomicU64,
    start_busy_retries: AtomicU64,
    ring_full_events: AtomicU64,
    sets_closed: AtomicU64,
    services: AtomicU64,
    unattributed: AtomicU64,
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/// Requests whose submitter has not yet been told anything
fn unresolved(reqs: &[Request]) -> u64 {
    reqs.iter().filter(|r| !matches!(r.notify, Notify::Consumed)).count() as u64
}

impl Counters {
    fn snapshot(&self) -> EngineStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EngineStats {
            requests_submitted: get(&self.requests_submitted),
            requests_completed: get(&self.requests_completed),
            requests_failed: get(&self.requests_failed),
            descriptors_submitted: get(&self.descriptors_submitted),
            descriptors_completed: get(&self.descriptors_completed),
            bytes_completed: get(&self.bytes_completed),
            hw_starts: get(&self.hw_starts),
            start_busy_retries: get(&self.start_busy_retries),
            ring_full_events: get(&self.ring_full_events),
            sets_closed: get(&self.sets_closed),
            services: get(&self.services),
            unattributed: get(&self.unattributed),
        }
    }
}

/// Point-in-time view of the ring and queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSnapshot {
    /// Sets in the ring (N)
    pub sets: u32,
    /// Sets free for filling
    pub avail_sets: u32,
    /// Closed sets awaiting submission
    pub sets_ready: u32,
    /// Sets handed to the hardware
    pub in_flight_sets: u32,
    /// Next set to fill
    pub pidx: u32,
    /// Oldest set owed completion credit
    pub cidx: u32,
    /// Next set to submit
    pub sw_cidx: u32,
    /// Requests not yet fully built
    pub pending: usize,
    /// Requests fully built, awaiting completion
    pub in_flight: usize,
    /// Result entries written and not yet drained
    pub undrained_results: u32,
}

impl RingSnapshot {
    /// `avail + ready + in_flight == N`
    pub const fn is_consistent(&self) -> bool {
        self.avail_sets + self.sets_ready + self.in_flight_sets == self.sets
    }

    /// Every set free and no request queued
    pub const fn is_drained(&self) -> bool {
        self.avail_sets == self.sets && self.pending == 0 && self.in_flight == 0
    }
}

/// Engine registers captured for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterDump {
    /// Identifier register
    pub identifier: u32,
    /// Control register
    pub control: u32,
    /// Status register (non-clearing read)
    pub status: u32,
    /// Completed descriptor count
    pub completed: u32,
    /// Alignments register
    pub alignments: u32,
    /// Interrupt enable mask
    pub irq_mask: u32,
    /// First descriptor bus address
    pub first_desc: u64,
    /// First descriptor extra adjacent count
    pub first_adjacent: u32,
    /// Streaming credits
    pub credits: u32,
}

impl std::fmt::Display for RegisterDump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "id={:#010x} ctrl={:#010x} status={:#010x} completed={} align={:#010x} \
             irq_mask={:#010x} first={:#x}+{} credits={}",
            self.identifier,
            self.control,
            self.status,
            self.completed,
            self.alignments,
            self.irq_mask,
            self.first_desc,
            self.first_adjacent,
            self.credits
        )
    }
}

/// One direction/channel of the DMA IP
#[derive(Debug)]
pub struct Engine {
    name: String,
    config: EngineConfig,
    regs: EngineRegs,
    streaming: bool,
    alignments: Alignments,
    max_desc_len: u32,
    run: Mutex<RunState>,
    ring: Mutex<BuildState>,
    writeback: Option<Arc<dyn DmaRegion>>,
    source: Box<dyn CompletionSource>,
    doorbell: Doorbell,
    offline: AtomicBool,
    next_id: AtomicU64,
    stats: Counters,
}

impl Engine {
    /// Bring up the engine described by `config` on `bar`
    ///
    /// Descriptor, result and write-back memory come from `allocator`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the configuration is invalid or the
    /// identifier register does not name a DMA engine of the configured
    /// direction, and `OutOfMemory` if coherent memory runs out.
    pub fn new(
        config: EngineConfig,
        bar: Arc<dyn RegisterAccess>,
        allocator: &dyn DmaAllocator,
    ) -> Result<Self> {
        config.validate()?;
        let regs = EngineRegs::new(bar, config.direction, config.channel);
        let id = identify(&regs, &config)?;
        let streaming = config.streaming.unwrap_or(id.streaming);
        let alignments = Alignments::decode(regs.read(reg::ALIGNMENTS));
        let streaming_receive = streaming && config.direction == Direction::C2H;

        let mut max_desc_len = config.desc_blen_max;
        if streaming_receive {
            max_desc_len = max_desc_len.min(config.stream_buffer_bytes);
        }
        let granularity = alignments.len_granularity.max(1);
        if max_desc_len >= granularity {
            max_desc_len -= max_desc_len % granularity;
        }

        let name = format!(
            "{}{}-{}",
            config.direction,
            config.channel,
            if streaming { "ST" } else { "MM" }
        );

        let total = config.total_descriptors();
        let arena = DescriptorArena::new(allocator, total)?;
        let ring = Ring::new(arena, config.set_depth, config.page_clamp);
        let results = if streaming_receive {
            Some(ResultRing::new(allocator, total)?)
        } else {
            None
        };

        let (writeback, source): (Option<Arc<dyn DmaRegion>>, Box<dyn CompletionSource>) =
            match config.completion_mode {
                CompletionMode::Interrupt => (None, Box::new(InterruptSource)),
                CompletionMode::Poll => {
                    let wb = allocator.alloc_coherent(WRITEBACK_SIZE)?;
                    let source =
                        WritebackSource::new(wb.clone(), config.poll_timeout, config.polls_per_yield);
                    (Some(wb), Box::new(source))
                }
            };

        let engine = Self {
            name,
            regs,
            streaming,
            alignments,
            max_desc_len,
            run: Mutex::new(RunState {
                state: EngineState::Idle,
                desc_queued: 0,
                desc_dequeued: 0,
                epoch: 0,
            }),
            ring: Mutex::new(BuildState {
                ring,
                queue: RequestQueue::default(),
                results,
            }),
            writeback,
            source,
            doorbell: Doorbell::new(),
            offline: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            stats: Counters::default(),
            config,
        };
        engine.init_hardware();

        tracing::info!(
            "{}: {} sets x {} desc, {:?} completion, max desc {} bytes, version {}",
            engine.name,
            engine.config.set_count,
            engine.config.set_depth,
            engine.config.completion_mode,
            engine.max_desc_len,
            id.version
        );
        Ok(engine)
    }

    /// Queue a transfer and, without a callback, wait for it
    ///
    /// `device_offset` is the card-side address of the first byte; it is
    /// ignored by streaming engines. With `callback` the call returns
    /// `Ok(0)` at once and the callback later receives the byte count or
    /// the error. Without one the caller blocks up to `timeout` (or the
    /// configured request timeout) and receives the byte count.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument`: wrong direction, empty list, zero-length entry,
    ///   or an entry violating the engine's alignment rules
    /// - `ShuttingDown`: the engine is offline
    /// - `Busy`: too many requests are waiting to be built
    /// - `Timeout`: the synchronous wait expired; the transfer stays queued
    /// - `HardwareError`: the engine reported an error while this request
    ///   was queued
    pub fn submit(
        &self,
        direction: Direction,
        device_offset: u64,
        entries: &[ScatterEntry],
        timeout: Option<Duration>,
        callback: Option<Callback>,
    ) -> Result<usize> {
        self.check_request(direction, device_offset, entries)?;
        if self.offline.load(Ordering::Acquire) {
            return Err(DmaError::shutting_down(&self.name));
        }

        let timeout = timeout.unwrap_or(self.config.request_timeout);
        let sdesc = split(entries, self.max_desc_len)?;
        let descriptors = sdesc.len() as u64;
        let total_len: u64 = entries.iter().map(|e| u64::from(e.len)).sum();
        let (notify, waiter) = match callback {
            Some(cb) => (Notify::Callback(cb), None),
            None => {
                let w = Arc::new(Completion::default());
                (Notify::Waiter(w.clone()), Some(w))
            }
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = Request {
            id,
            sdesc,
            ep_addr: if self.streaming { 0 } else { device_offset },
            total_len,
            built: 0,
            completed: 0,
            done_bytes: 0,
            notify,
            deadline: Instant::now() + timeout,
            timeout,
        };

        {
            let mut st = crate::lock(&self.ring);
            // shutdown drains under this lock after going offline
            if self.offline.load(Ordering::Acquire) {
                return Err(DmaError::shutting_down(&self.name));
            }
            if st.queue.pending.len() >= self.config.max_pending_requests {
                return Err(DmaError::busy(format!(
                    "{} has {} requests waiting to be built",
                    self.name,
                    st.queue.pending.len()
                )));
            }
            st.queue.pending.push_back(req);
        }
        bump(&self.stats.requests_submitted, 1);
        bump(&self.stats.descriptors_submitted, descriptors);
        tracing::debug!("{}: request {id}: {total_len} bytes in {descriptors} desc", self.name);

        if let Err(e) = self.process(Progress::Retry) {
            tracing::debug!("{}: request {id} queued, start deferred: {e}", self.name);
        }

        let Some(waiter) = waiter else {
            return Ok(0);
        };
        waiter.wait(timeout).unwrap_or_else(|| {
            tracing::warn!("{}: request {id} timed out after {timeout:?}", self.name);
            tracing::warn!("{}: {}", self.name, self.dump_registers());
            Err(DmaError::timeout(timeout))
        })
    }

    /// Reconcile hardware progress with the request lists
    ///
    /// Called by the completion context after an interrupt or a poll
    /// doorbell. Credits finished descriptors in ring order, frees drained
    /// sets, stops the engine when the run is over, notifies finished
    /// requests (outside every lock) and refills the ring. Returns the
    /// descriptors credited.
    ///
    /// # Errors
    ///
    /// Returns `HardwareError` if the status register reported an error
    /// class; every queued request has then been failed with it.
    pub fn service_completions(&self) -> Result<usize> {
        bump(&self.stats.services, 1);
        let (expected, epoch) = {
            let run = crate::lock(&self.run);
            if run.state != EngineState::Running {
                drop(run);
                self.kick();
                return Ok(0);
            }
            (run.desc_queued, run.epoch)
        };

        let streaming_receive = self.is_streaming_receive();
        let obs = self
            .source
            .observe(&self.regs, if streaming_receive { 0 } else { expected });

        let mut run = crate::lock(&self.run);
        if run.epoch != epoch || run.state != EngineState::Running {
            return Ok(0);
        }
        if obs.status & self.error_mask() != 0 || obs.error {
            return Err(self.abort(run, obs.status));
        }

        let mut completed = obs.completed;
        if streaming_receive {
            let mut st = crate::lock(&self.ring);
            if let Some(results) = st.results.as_mut() {
                results.drain(self.config.stream_buffer_bytes);
                if results.completed_since_start() > 0 {
                    completed = results.completed_since_start();
                }
            }
        }

        let delta = completed
            .saturating_sub(run.desc_dequeued)
            .min(run.desc_queued - run.desc_dequeued);
        run.desc_dequeued += delta;

        let deliveries = {
            let mut st = crate::lock(&self.ring);
            let (credited, deliveries) = CompletionTracker::credit(&mut st.queue, delta);
            let leftover = st.ring.free_completed(delta);
            let stray = leftover.max(delta - credited);
            if stray > 0 {
                tracing::warn!(
                    "{}: {stray} of {delta} completed descriptors unattributed",
                    self.name
                );
                bump(&self.stats.unattributed, u64::from(stray));
            }
            deliveries
        };

        let outstanding = run.desc_queued - run.desc_dequeued;
        if outstanding == 0 {
            self.regs.write(reg::CONTROL_W1C, control::RUN_STOP);
            run.state = EngineState::Idle;
            tracing::debug!("{}: run of {} desc finished", self.name, run.desc_queued);
        } else {
            self.source.rearm(&self.regs, &self.doorbell);
        }
        drop(run);

        self.finish(deliveries, delta);
        self.kick();
        Ok(delta as usize)
    }

    /// Stop accepting work and fail everything queued
    ///
    /// Disables interrupts, stops the hardware, fails every queued request
    /// with `ShuttingDown` and resets the ring. Calling it again is
    /// harmless. Returns the number of requests failed by this call.
    pub fn shutdown(&self) -> usize {
        if self.offline.swap(true, Ordering::AcqRel) {
            tracing::debug!("{}: shutdown of an offline engine", self.name);
        }
        let mut run = crate::lock(&self.run);
        run.state = EngineState::ShuttingDown;

        self.regs.write(reg::INTERRUPT_ENABLE_MASK_W1C, IRQ_MASK);
        self.regs.write(reg::CONTROL, 0);
        if self.uses_credits() {
            self.regs
                .common_write(sgdma_common::CREDIT_MODE_ENABLE_W1C, self.regs.credit_bit());
        }

        let failed = {
            let mut st = crate::lock(&self.ring);
            let failed = st.queue.drain_all();
            st.reset();
            failed
        };

        let deadline = Instant::now() + SHUTDOWN_BUSY_WAIT;
        while self.regs.read(reg::STATUS) & status::BUSY != 0 {
            if Instant::now() >= deadline {
                tracing::warn!("{}: still busy after stop; {}", self.name, self.dump_registers());
                break;
            }
            std::thread::yield_now();
        }

        run.state = EngineState::Idle;
        run.desc_queued = 0;
        run.desc_dequeued = 0;
        run.epoch += 1;
        drop(run);

        let n = failed.len();
        let err = DmaError::shutting_down(&self.name);
        bump(&self.stats.requests_failed, unresolved(&failed));
        for req in failed {
            req.fail(err.clone()).deliver();
        }
        tracing::info!("{}: shut down, {n} requests failed", self.name);
        n
    }

    /// Bring a shut-down engine back online
    ///
    /// # Errors
    ///
    /// Returns `Busy` if the engine is running and `InvalidArgument` if the
    /// identifier register no longer names this engine.
    pub fn restart(&self) -> Result<()> {
        let run = crate::lock(&self.run);
        if run.state != EngineState::Idle {
            return Err(DmaError::busy(format!("{} is {:?}", self.name, run.state)));
        }
        if !self.offline.load(Ordering::Acquire) {
            return Ok(());
        }
        identify(&self.regs, &self.config)?;
        crate::lock(&self.ring).reset();
        self.init_hardware();
        self.offline.store(false, Ordering::Release);
        drop(run);
        tracing::info!("{}: restarted", self.name);
        Ok(())
    }

    /// Resolve overdue asynchronous requests with `Timeout`
    ///
    /// Requests with nothing in the ring are removed. Requests with
    /// descriptors in the ring stay for credit accounting but their
    /// callback is consumed. Returns the number of requests resolved.
    pub fn expire_requests(&self, now: Instant) -> usize {
        let expired: Vec<Delivery> = {
            let mut st = crate::lock(&self.ring);
            let mut out = Vec::new();
            for mut req in std::mem::take(&mut st.queue.pending) {
                if req.is_overdue(now) && req.built == 0 {
                    let err = DmaError::timeout(req.timeout);
                    out.push(req.fail(err));
                } else {
                    if req.is_overdue(now) {
                        out.push(req.expire());
                    }
                    st.queue.pending.push_back(req);
                }
            }
            out.extend(
                st.queue
                    .in_flight
                    .iter_mut()
                    .filter(|r| r.is_overdue(now))
                    .map(Request::expire),
            );
            out
        };

        let n = expired.len();
        if n > 0 {
            tracing::warn!("{}: {n} asynchronous requests expired", self.name);
            bump(&self.stats.requests_failed, n as u64);
        }
        expired.into_iter().for_each(Delivery::deliver);
        n
    }

    /// Fill freed capacity and start the engine if it is idle
    ///
    /// # Errors
    ///
    /// Returns `Busy` if the engine is offline or refused to start.
    pub fn process_pending(&self) -> Result<()> {
        self.process(Progress::BestEffort)
    }

    /// Read the engine's registers for diagnostics
    pub fn dump_registers(&self) -> RegisterDump {
        let lo = self.regs.sgdma_read(sgdma::FIRST_DESC_LO);
        let hi = self.regs.sgdma_read(sgdma::FIRST_DESC_HI);
        RegisterDump {
            identifier: self.regs.read(reg::IDENTIFIER),
            control: self.regs.read(reg::CONTROL),
            status: self.regs.read(reg::STATUS),
            completed: self.regs.read(reg::COMPLETED_DESC_COUNT),
            alignments: self.regs.read(reg::ALIGNMENTS),
            irq_mask: self.regs.read(reg::INTERRUPT_ENABLE_MASK),
            first_desc: (u64::from(hi) << 32) | u64::from(lo),
            first_adjacent: self.regs.sgdma_read(sgdma::FIRST_DESC_ADJACENT),
            credits: self.regs.sgdma_read(sgdma::CREDITS),
        }
    }

    /// Counters since construction
    pub fn stats(&self) -> EngineStats {
        self.stats.snapshot()
    }

    /// Ring indices and queue lengths
    pub fn ring_snapshot(&self) -> RingSnapshot {
        let st = crate::lock(&self.ring);
        let (pidx, cidx, sw_cidx) = st.ring.indices();
        RingSnapshot {
            sets: st.ring.count(),
            avail_sets: st.ring.avail_sets(),
            sets_ready: st.ring.sets_ready(),
            in_flight_sets: st.ring.in_flight_sets(),
            pidx,
            cidx,
            sw_cidx,
            pending: st.queue.pending.len(),
            in_flight: st.queue.in_flight.len(),
            undrained_results: st.results.as_ref().map_or(0, ResultRing::undrained),
        }
    }

    /// Current run state
    pub fn state(&self) -> EngineState {
        crate::lock(&self.run).state
    }

    /// Whether shutdown has taken the engine offline
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Acquire)
    }

    /// Engine name, e.g. `C2H0-ST`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in effect
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Streaming (true) or memory-mapped user interface
    pub const fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Alignment rules read from the hardware
    pub const fn alignments(&self) -> Alignments {
        self.alignments
    }

    /// Largest length a single descriptor carries
    pub const fn max_desc_len(&self) -> u32 {
        self.max_desc_len
    }

    /// Handle for the interrupt path: raising it schedules completion service
    pub fn irq_handle(&self) -> IrqHandle {
        self.doorbell.irq_handle()
    }

    pub(crate) const fn doorbell(&self) -> &Doorbell {
        &self.doorbell
    }

    fn is_streaming_receive(&self) -> bool {
        self.streaming && self.config.direction == Direction::C2H
    }

    fn uses_credits(&self) -> bool {
        self.is_streaming_receive() && self.config.credit_control
    }

    const fn error_mask(&self) -> u32 {
        match self.config.direction {
            Direction::H2C => status::H2C_ERR_MASK,
            Direction::C2H => status::C2H_ERR_MASK,
        }
    }

    fn fill_params(&self) -> FillParams {
        FillParams {
            direction: self.config.direction,
            non_incrementing: self.config.non_incrementing,
        }
    }

    fn check_request(&self, direction: Direction, device_offset: u64, entries: &[ScatterEntry]) -> Result<()> {
        if direction != self.config.direction {
            return Err(DmaError::invalid_argument(format!(
                "{direction} request on {}",
                self.name
            )));
        }
        if entries.is_empty() {
            return Err(DmaError::invalid_argument("empty scatter list"));
        }
        let a = self.alignments;
        let last = entries.len() - 1;
        for (i, e) in entries.iter().enumerate() {
            if e.len == 0 {
                return Err(DmaError::invalid_argument(format!(
                    "scatter entry {i} has zero length"
                )));
            }
            if e.addr % u64::from(a.addr_align) != 0 {
                return Err(DmaError::invalid_argument(format!(
                    "scatter entry {i} at {:#x} not {}-byte aligned",
                    e.addr, a.addr_align
                )));
            }
            if i != last && e.len % a.len_granularity != 0 {
                return Err(DmaError::invalid_argument(format!(
                    "scatter entry {i} length {} not a multiple of {}",
                    e.len, a.len_granularity
                )));
            }
            let last_byte = e.addr.checked_add(u64::from(e.len) - 1);
            if !last_byte.is_some_and(|b| a.addr_bits >= 64 || b < 1u64 << a.addr_bits) {
                return Err(DmaError::invalid_argument(format!(
                    "scatter entry {i} beyond {}-bit addressing",
                    a.addr_bits
                )));
            }
        }
        if self.streaming {
            return Ok(());
        }
        if device_offset % u64::from(a.addr_align) != 0 {
            return Err(DmaError::invalid_argument(format!(
                "device offset {device_offset:#x} not {}-byte aligned",
                a.addr_align
            )));
        }
        let total: u64 = entries.iter().map(|e| u64::from(e.len)).sum();
        if !self.config.non_incrementing && device_offset.checked_add(total).is_none() {
            return Err(DmaError::invalid_argument(format!(
                "{total} bytes at device offset {device_offset:#x} wrap the address space"
            )));
        }
        Ok(())
    }

    /// Fill the ring and start the engine if it is idle
    fn process(&self, progress: Progress) -> Result<()> {
        let mut attempts = 0;
        loop {
            if self.offline.load(Ordering::Acquire) {
                return Err(DmaError::busy(format!("{} is offline", self.name)));
            }
            let report = {
                let mut st = crate::lock(&self.ring);
                builder::fill(&mut st, self.fill_params())
            };
            self.record_fill(report);

            match self.try_start() {
                Ok(_) => return Ok(()),
                Err(e @ DmaError::Busy { .. }) => {
                    attempts += 1;
                    if progress == Progress::BestEffort || attempts > self.config.start_retry_limit {
                        return Err(e);
                    }
                    std::thread::yield_now();
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn kick(&self) {
        if let Err(e) = self.process(Progress::BestEffort) {
            tracing::debug!("{}: background fill: {e}", self.name);
        }
    }

    fn record_fill(&self, report: FillReport) {
        bump(&self.stats.sets_closed, u64::from(report.sets_closed));
        if report.ring_full {
            bump(&self.stats.ring_full_events, 1);
            tracing::debug!("{}: ring full after {} desc", self.name, report.placed);
        }
    }

    /// Hand every ready set to an idle engine
    fn try_start(&self) -> Result<Start> {
        let mut run = crate::lock(&self.run);
        match run.state {
            EngineState::Running => return Ok(Start::AlreadyRunning),
            EngineState::ShuttingDown => {
                return Err(DmaError::busy(format!("{} is shutting down", self.name)));
            }
            EngineState::Idle => {}
        }

        let (chain, adjacent) = {
            let mut st = crate::lock(&self.ring);
            let max_sets = if self.is_streaming_receive() {
                1
            } else {
                st.ring.count()
            };
            let Some(chain) = st.ring.chain_ready_sets(max_sets) else {
                return Ok(Start::NothingReady);
            };
            if let Some(results) = st.results.as_mut() {
                results.begin_run();
            }
            (chain, st.ring.first_adjacent(&chain))
        };

        if let Err(e) = self.start_hardware(&chain, adjacent) {
            crate::lock(&self.ring).ring.requeue(&chain);
            bump(&self.stats.start_busy_retries, 1);
            tracing::debug!("{}: start refused: {e}", self.name);
            return Err(e);
        }

        run.state = EngineState::Running;
        run.desc_queued = chain.total;
        run.desc_dequeued = 0;
        run.epoch += 1;
        drop(run);

        bump(&self.stats.hw_starts, 1);
        tracing::debug!(
            "{}: started {} desc in {} sets at {:#x} (+{adjacent})",
            self.name,
            chain.total,
            chain.sets,
            chain.first_bus
        );
        if self.config.completion_mode == CompletionMode::Poll {
            self.doorbell.ring();
        }
        Ok(Start::Started)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn start_hardware(&self, chain: &Chain, adjacent: u32) -> Result<()> {
        let st = self.regs.read(reg::STATUS);
        if st & status::BUSY != 0 {
            return Err(DmaError::busy(format!("{} busy at start (status {st:#010x})", self.name)));
        }
        if let Some(wb) = &self.writeback {
            wb.write32(0, 0);
        }
        if self.uses_credits() {
            self.regs.sgdma_write(sgdma::CREDITS, self.config.set_depth);
        }
        self.regs.sgdma_write(sgdma::FIRST_DESC_LO, chain.first_bus as u32);
        self.regs.sgdma_write(sgdma::FIRST_DESC_HI, (chain.first_bus >> 32) as u32);
        self.regs.sgdma_write(sgdma::FIRST_DESC_ADJACENT, adjacent);

        let mut ctrl = control::RUN_STOP | control::IE_ERRORS;
        match self.config.completion_mode {
            CompletionMode::Interrupt => {
                self.regs.write(reg::INTERRUPT_ENABLE_MASK_W1S, IRQ_MASK);
                ctrl |= control::IE_COMPLETIONS;
            }
            CompletionMode::Poll => ctrl |= control::POLL_MODE_WB,
        }
        if self.config.non_incrementing {
            ctrl |= control::NON_INCR_ADDR;
        }
        self.regs.write(reg::CONTROL, ctrl);
        Ok(())
    }

    /// Fail every queued request after a hardware error
    fn abort(&self, mut run: MutexGuard<'_, RunState>, status: u32) -> DmaError {
        self.regs.write(reg::CONTROL, 0);
        self.regs.write(reg::INTERRUPT_ENABLE_MASK_W1C, IRQ_MASK);
        run.state = EngineState::Idle;
        run.desc_queued = 0;
        run.desc_dequeued = 0;
        run.epoch += 1;

        let failed = {
            let mut st = crate::lock(&self.ring);
            let failed = st.queue.drain_all();
            st.reset();
            failed
        };
        drop(run);

        let err = DmaError::hardware(status);
        tracing::error!("{}: {err}; failing {} requests", self.name, failed.len());
        tracing::error!("{}: {}", self.name, self.dump_registers());
        bump(&self.stats.requests_failed, unresolved(&failed));
        for req in failed {
            req.fail(err.clone()).deliver();
        }
        err
    }

    fn finish(&self, deliveries: Vec<Delivery>, credited: u32) {
        bump(&self.stats.descriptors_completed, u64::from(credited));
        for d in deliveries {
            if d.is_consumed() {
                continue;
            }
            if let Ok(bytes) = &d.result {
                bump(&self.stats.requests_completed, 1);
                bump(&self.stats.bytes_completed, *bytes as u64);
            }
            d.deliver();
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn init_hardware(&self) {
        self.regs.write(reg::CONTROL, 0);
        self.regs.write(reg::INTERRUPT_ENABLE_MASK_W1C, IRQ_MASK);
        if let Some(wb) = &self.writeback {
            wb.write32(0, 0);
            let bus = wb.bus_addr();
            self.regs.write(reg::POLL_MODE_WB_LO, bus as u32);
            self.regs.write(reg::POLL_MODE_WB_HI, (bus >> 32) as u32);
        }
        if self.uses_credits() {
            self.regs
                .common_write(sgdma_common::CREDIT_MODE_ENABLE_W1S, self.regs.credit_bit());
        }
        let stale = self.regs.read(reg::STATUS_RC);
        if stale != 0 {
            tracing::debug!("{}: cleared stale status {stale:#010x}", self.name);
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.offline.load(Ordering::Acquire) {
            self.shutdown();
        }
    }
}

/// Check the identifier register against the configuration
fn identify(regs: &EngineRegs, config: &EngineConfig) -> Result<EngineIdentity> {
    let raw = regs.read(reg::IDENTIFIER);
    let id = EngineIdentity::decode(raw);
    if id.subsystem != SUBSYSTEM_ID {
        return Err(DmaError::invalid_argument(format!(
            "identifier {raw:#010x} at {}{} is not a DMA engine",
            config.direction, config.channel
        )));
    }
    if id.direction != Some(config.direction) {
        return Err(DmaError::invalid_argument(format!(
            "identifier {raw:#010x} is not a {} engine",
            config.direction
        )));
    }
    if id.channel != config.channel {
        tracing::warn!(
            "{}{}: identifier reports channel {}",
            config.direction,
            config.channel,
            id.channel
        );
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimMemory, SimMode, SimulatedEngine};

    fn engine(dir: Direction, cfg: impl FnOnce(EngineConfig) -> EngineConfig) -> (Arc<SimMemory>, Arc<SimulatedEngine>, Engine) {
        let mem = Arc::new(SimMemory::new());
        let sim = Arc::new(SimulatedEngine::new(mem.clone(), dir, 0).mode(SimMode::Manual));
        let config = cfg(EngineConfig::new(dir, 0).with_set_count(2).with_set_depth(16));
        let eng = Engine::new(config, sim.clone(), mem.as_ref()).unwrap();
        (mem, sim, eng)
    }

    fn entries(mem: &SimMemory, n: u32, len: u32) -> Vec<ScatterEntry> {
        (0..n)
            .map(|_| ScatterEntry::new(mem.alloc_buffer(len as usize).unwrap().bus_addr(), len))
            .collect()
    }

    #[test]
    fn new_rejects_wrong_direction() {
        let mem = Arc::new(SimMemory::new());
        let sim = Arc::new(SimulatedEngine::new(mem.clone(), Direction::C2H, 0));
        // H2C view of a BAR whose H2C block reads zero
        let err = Engine::new(EngineConfig::new(Direction::H2C, 0), sim, mem.as_ref()).unwrap_err();
        assert!(matches!(err, DmaError::InvalidArgument { .. }));
    }

    #[test]
    fn name_and_alignment_come_from_hardware() {
        let (_, _, eng) = engine(Direction::H2C, |c| c);
        assert_eq!(eng.name(), "H2C0-MM");
        assert_eq!(eng.alignments().len_granularity, 4);
        assert_eq!(eng.max_desc_len() % 4, 0);
    }

    #[test]
    fn invalid_requests_leave_the_ring_untouched() {
        let (mem, _, eng) = engine(Direction::H2C, |c| c);
        let ok = entries(&mem, 1, 64);
        let cases: [(Direction, Vec<ScatterEntry>); 4] = [
            (Direction::C2H, ok.clone()),
            (Direction::H2C, vec![]),
            (Direction::H2C, vec![ScatterEntry::new(ok[0].addr, 0)]),
            (Direction::H2C, vec![ScatterEntry::new(ok[0].addr, 6), ok[0]]),
        ];
        for (dir, list) in cases {
            let err = eng.submit(dir, 0, &list, None, None).unwrap_err();
            assert!(matches!(err, DmaError::InvalidArgument { .. }), "{err}");
        }
        let snap = eng.ring_snapshot();
        assert!(snap.is_drained());
        assert_eq!(eng.stats().requests_submitted, 0);
    }

    #[test]
    fn async_submit_starts_the_engine() {
        let (mem, sim, eng) = engine(Direction::H2C, |c| c);
        let list = entries(&mem, 3, 256);
        assert_eq!(eng.submit(Direction::H2C, 0, &list, None, Some(Box::new(|_| {}))).unwrap(), 0);
        assert_eq!(eng.state(), EngineState::Running);
        assert_eq!(sim.starts(), 1);
        let dump = eng.dump_registers();
        assert_ne!(dump.control & control::RUN_STOP, 0);
        assert_eq!(dump.first_adjacent, 2);
    }

    #[test]
    fn service_without_run_is_a_no_op() {
        let (_, _, eng) = engine(Direction::H2C, |c| c);
        assert_eq!(eng.service_completions().unwrap(), 0);
        assert_eq!(eng.state(), EngineState::Idle);
    }

    #[test]
    fn pending_limit_reports_busy() {
        let (mem, _, eng) = engine(Direction::H2C, |c| c.with_max_pending_requests(1));
        let big = entries(&mem, 40, 64);
        eng.submit(Direction::H2C, 0, &big, None, Some(Box::new(|_| {}))).unwrap();
        let err = eng
            .submit(Direction::H2C, 0, &big[..1], None, Some(Box::new(|_| {})))
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn restart_brings_engine_back() {
        let (mem, _, eng) = engine(Direction::H2C, |c| c);
        eng.shutdown();
        assert!(eng.is_offline());
        let list = entries(&mem, 1, 64);
        let err = eng.submit(Direction::H2C, 0, &list, None, Some(Box::new(|_| {}))).unwrap_err();
        assert!(matches!(err, DmaError::ShuttingDown { .. }));
        eng.restart().unwrap();
        assert!(!eng.is_offline());
        eng.submit(Direction::H2C, 0, &list, None, Some(Box::new(|_| {}))).unwrap();
    }
}
