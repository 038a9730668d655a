//! Request builder
//!
//! Drains the pending-build list into the descriptor ring. One pass fills
//! the open set (acquiring a new one as each closes), marks end of payload
//! on each request's last descriptor and promotes fully built requests to
//! the in-flight list. A pass stops when the ring has no set to offer or no
//! work is pending; in the latter case a partially filled set is closed so
//! it can be submitted.
//!
//! Everything here runs under the ring lock and never touches registers.

use crate::request::RequestQueue;
use crate::result_ring::ResultRing;
use crate::ring::Ring;
use xdma_chip::bar::Direction;
use xdma_chip::desc::Descriptor;

/// State guarded by the ring lock
#[derive(Debug)]
pub(crate) struct BuildState {
    pub ring: Ring,
    pub queue: RequestQueue,
    /// Present only for streaming receive engines
    pub results: Option<ResultRing>,
}

impl BuildState {
    /// Forget every set and result entry
    pub fn reset(&mut self) {
        self.ring.reset();
        if let Some(results) = self.results.as_mut() {
            results.reset();
        }
    }
}

/// Engine properties the builder needs
#[derive(Debug, Clone, Copy)]
pub(crate) struct FillParams {
    pub direction: Direction,
    pub non_incrementing: bool,
}

/// What one pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct FillReport {
    /// Descriptors placed
    pub placed: u32,
    /// Sets closed
    pub sets_closed: u32,
    /// Requests promoted to in-flight
    pub promoted: u32,
    /// Work remained but no set could be acquired
    pub ring_full: bool,
}

/// Fill the ring from the pending-build list
pub(crate) fn fill(state: &mut BuildState, params: FillParams) -> FillReport {
    let mut report = FillReport::default();

    while let Some(req) = state.queue.pending.front_mut() {
        let Ok(set) = state.ring.acquire_open_set() else {
            report.ring_full = true;
            break;
        };
        let count = req.remaining_to_build().min(state.ring.remaining(set));
        let mut last_slot = 0;

        for _ in 0..count {
            let sw = req.sdesc[req.built as usize];
            let desc = match params.direction {
                Direction::H2C => Descriptor::new(sw.len, sw.addr, req.ep_addr),
                Direction::C2H => {
                    // streaming receive reads from the result entry slot
                    let src = state
                        .results
                        .as_mut()
                        .map_or(req.ep_addr, ResultRing::claim);
                    Descriptor::new(sw.len, src, sw.addr)
                }
            };
            last_slot = state.ring.place(set, desc);
            req.built += 1;
            if !params.non_incrementing {
                // submit rejects ranges that would wrap
                req.ep_addr += u64::from(sw.len);
            }
        }
        report.placed += count;

        if req.is_built() {
            state.ring.mark_eop(last_slot);
            tracing::trace!("request {} fully built ({} desc)", req.id, req.built);
            state.queue.promote_head();
            report.promoted += 1;
        }
        if state.ring.remaining(set) == 0 {
            state.ring.close_set(set);
            report.sets_closed += 1;
        }
    }

    if state.queue.pending.is_empty() {
        if let Ok(set) = state.ring.acquire_open_set() {
            if state.ring.fill(set) > 0 {
                state.ring.close_set(set);
                report.sets_closed += 1;
            }
        }
    }
    report
}
