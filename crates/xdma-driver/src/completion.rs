//! Completion detection and crediting
//!
//! Two producers report how many descriptors the engine has finished since
//! it was last started:
//!
//! | Source | Count from | Re-armed by |
//! |---|---|---|
//! | [`InterruptSource`] | completed-count register after an interrupt | interrupt mask write-1-to-set |
//! | [`WritebackSource`] | write-back word in host memory | ringing the doorbell |
//!
//! Both feed [`CompletionTracker::credit`], which walks the request lists
//! in ring order.

use crate::hw::{DmaRegion, EngineRegs};
use crate::request::{Delivery, RequestQueue};
use crate::worker::Doorbell;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};
use xdma_chip::regs::{control, engine};
use xdma_chip::result::{Writeback, WB_COUNT_MASK};

/// One look at the engine's progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Observation {
    /// Descriptors completed since the last start
    pub completed: u32,
    /// Status register value, if it was read
    pub status: u32,
    /// The source itself flagged an error
    pub error: bool,
}

/// Producer of completed-descriptor counts
pub trait CompletionSource: Send + Sync + Debug {
    /// Report progress; `expected` is the count that would finish the run
    fn observe(&self, regs: &EngineRegs, expected: u32) -> Observation;

    /// Ask to be told again once more work completes
    fn rearm(&self, regs: &EngineRegs, doorbell: &Doorbell);
}

/// Interrupt-driven completion
#[derive(Debug, Default)]
pub struct InterruptSource;

impl CompletionSource for InterruptSource {
    fn observe(&self, regs: &EngineRegs, _expected: u32) -> Observation {
        regs.write(
            engine::INTERRUPT_ENABLE_MASK_W1C,
            control::IE_ERRORS | control::IE_COMPLETIONS,
        );
        let status = regs.read(engine::STATUS_RC);
        let completed = regs.read(engine::COMPLETED_DESC_COUNT) & WB_COUNT_MASK;
        Observation {
            completed,
            status,
            error: false,
        }
    }

    fn rearm(&self, regs: &EngineRegs, _doorbell: &Doorbell) {
        regs.write(
            engine::INTERRUPT_ENABLE_MASK_W1S,
            control::IE_ERRORS | control::IE_COMPLETIONS,
        );
    }
}

/// Write-back polling
#[derive(Debug)]
pub struct WritebackSource {
    region: Arc<dyn DmaRegion>,
    timeout: Duration,
    polls_per_yield: u32,
}

impl WritebackSource {
    /// Poll the first word of `region`
    pub fn new(region: Arc<dyn DmaRegion>, timeout: Duration, polls_per_yield: u32) -> Self {
        Self {
            region,
            timeout,
            polls_per_yield: polls_per_yield.max(1),
        }
    }

    /// Zero the write-back word before a run
    pub fn clear(&self) {
        self.region.write32(0, 0);
    }

    fn read(&self) -> Writeback {
        Writeback::decode(self.region.read32(0))
    }
}

impl CompletionSource for WritebackSource {
    fn observe(&self, regs: &EngineRegs, expected: u32) -> Observation {
        let start = Instant::now();
        let mut polls = 0u32;
        let mut wb = self.read();
        while wb.completed < expected && !wb.error {
            if start.elapsed() >= self.timeout {
                tracing::warn!(
                    "{}{} write-back poll timed out at {}/{expected}",
                    regs.direction(),
                    regs.channel(),
                    wb.completed
                );
                break;
            }
            polls += 1;
            if polls % self.polls_per_yield == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
            wb = self.read();
        }

        let mut obs = Observation {
            completed: wb.completed,
            status: 0,
            error: wb.error,
        };
        if expected > 0 && wb.completed > expected {
            tracing::error!(
                "{}{} write-back over-count {} > {expected}",
                regs.direction(),
                regs.channel(),
                wb.completed
            );
            obs.error = true;
        }
        if obs.completed == 0 || obs.error {
            obs.status = regs.read(engine::STATUS_RC);
        }
        if obs.completed == 0 {
            obs.completed = regs.read(engine::COMPLETED_DESC_COUNT) & WB_COUNT_MASK;
        }
        // the run is over once the expected count shows up
        if expected > 0 && wb.completed >= expected {
            self.clear();
        }
        obs
    }

    fn rearm(&self, _regs: &EngineRegs, doorbell: &Doorbell) {
        doorbell.ring();
    }
}

/// Credits completed descriptors against requests in ring order
#[derive(Debug)]
pub(crate) struct CompletionTracker;

impl CompletionTracker {
    /// Credit `delta` descriptors
    ///
    /// In-flight requests are credited head first; whatever is left goes to
    /// the partially built head of the pending list, whose placed
    /// descriptors follow every in-flight request's in the ring. Returns the
    /// descriptors credited and the notifications of finished requests.
    pub(crate) fn credit(queue: &mut RequestQueue, delta: u32) -> (u32, Vec<Delivery>) {
        let mut left = delta;
        let mut finished = Vec::new();

        while left > 0 {
            let Some(head) = queue.in_flight.front_mut() else {
                break;
            };
            left -= head.credit(left);
            if !head.is_complete() {
                break;
            }
            if let Some(done) = queue.in_flight.pop_front() {
                tracing::trace!("request {} complete, {} bytes", done.id, done.done_bytes);
                finished.push(done.finish());
            }
        }

        if left > 0 && queue.in_flight.is_empty() {
            if let Some(head) = queue.pending.front_mut() {
                left -= head.credit(left);
            }
        }

        (delta - left, finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HostAllocator;
    use crate::request::{split, Completion, Notify, Request, ScatterEntry};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use xdma_chip::bar::Direction;

    fn request(id: u64, lens: &[u32], built: u32, waiter: &Arc<Completion>) -> Request {
        let entries: Vec<_> = lens.iter().map(|l| ScatterEntry::new(0, *l)).collect();
        Request {
            id,
            sdesc: split(&entries, 4096).unwrap(),
            ep_addr: 0,
            total_len: lens.iter().map(|l| u64::from(*l)).sum(),
            built,
            completed: 0,
            done_bytes: 0,
            notify: Notify::Waiter(waiter.clone()),
            deadline: Instant::now(),
            timeout: Duration::ZERO,
        }
    }

    #[test]
    fn credits_in_flight_head_first() {
        let wa = Arc::new(Completion::default());
        let wb = Arc::new(Completion::default());
        let mut q = RequestQueue::default();
        q.in_flight.push_back(request(1, &[100, 200], 2, &wa));
        q.in_flight.push_back(request(2, &[300, 400], 2, &wb));

        let (credited, done) = CompletionTracker::credit(&mut q, 3);
        assert_eq!(credited, 3);
        assert_eq!(done.len(), 1);
        done.into_iter().for_each(Delivery::deliver);
        assert_eq!(wa.wait(Duration::ZERO), Some(Ok(300)));
        assert_eq!(q.in_flight[0].done_bytes, 300);

        let (credited, done) = CompletionTracker::credit(&mut q, 1);
        assert_eq!((credited, done.len()), (1, 1));
        done.into_iter().for_each(Delivery::deliver);
        assert_eq!(wb.wait(Duration::ZERO), Some(Ok(700)));
    }

    #[test]
    fn leftover_goes_to_partially_built_pending_head() {
        let w = Arc::new(Completion::default());
        let mut q = RequestQueue::default();
        q.pending.push_back(request(1, &[64; 10], 6, &w));
        let (credited, done) = CompletionTracker::credit(&mut q, 8);
        assert_eq!(credited, 6, "only placed descriptors can complete");
        assert!(done.is_empty());
        assert_eq!(q.pending[0].completed, 6);
    }

    #[test]
    fn nothing_to_credit_is_reported() {
        let mut q = RequestQueue::default();
        assert_eq!(CompletionTracker::credit(&mut q, 5).0, 0);
    }

    #[derive(Debug, Default)]
    struct Regs(Mutex<HashMap<usize, u32>>);

    impl crate::hw::RegisterAccess for Regs {
        fn read32(&self, offset: usize) -> u32 {
            self.0.lock().unwrap().get(&offset).copied().unwrap_or(0)
        }
        fn write32(&self, offset: usize, value: u32) {
            self.0.lock().unwrap().insert(offset, value);
        }
    }

    #[test]
    fn writeback_returns_once_expected_count_lands() {
        let alloc = HostAllocator::new(0);
        let region = alloc.alloc_region(4).unwrap();
        let src = WritebackSource::new(region.clone(), Duration::from_secs(5), 10);
        let regs = EngineRegs::new(Arc::new(Regs::default()), Direction::H2C, 0);
        region.write32(0, Writeback { completed: 7, error: false }.encode());
        let obs = src.observe(&regs, 7);
        assert_eq!(obs.completed, 7);
        assert!(!obs.error);
        assert_eq!(region.read32(0), 0, "word cleared after a finished run");
    }

    #[test]
    fn writeback_timeout_and_over_count() {
        let alloc = HostAllocator::new(0);
        let region = alloc.alloc_region(4).unwrap();
        let src = WritebackSource::new(region.clone(), Duration::from_millis(5), 4);
        let regs = EngineRegs::new(Arc::new(Regs::default()), Direction::H2C, 0);

        region.write32(0, 3);
        let obs = src.observe(&regs, 5);
        assert_eq!(obs.completed, 3);
        assert!(!obs.error);
        assert_eq!(region.read32(0), 3, "partial run keeps the word");

        region.write32(0, 9);
        assert!(src.observe(&regs, 5).error);
    }
}
