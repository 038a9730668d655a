//! Requests and the two request lists
//!
//! A request is a caller's scatter list pre-split into software
//! descriptors no longer than the engine accepts. It sits on the
//! pending-build list until its last descriptor is placed in the ring, then
//! on the in-flight list until every descriptor has been credited.

use crate::error::{DmaError, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// One contiguous piece of host memory in a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScatterEntry {
    /// Bus address
    pub addr: u64,
    /// Length in bytes
    pub len: u32,
}

impl ScatterEntry {
    /// Entry covering `len` bytes at `addr`
    pub const fn new(addr: u64, len: u32) -> Self {
        Self { addr, len }
    }
}

/// Completion callback for asynchronous submits
///
/// Runs on the completion thread with the byte count or the error. It must
/// not block or submit synchronously.
pub type Callback = Box<dyn FnOnce(Result<usize>) + Send + 'static>;

/// Host side of one hardware descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SwDesc {
    pub addr: u64,
    pub len: u32,
}

/// Split a scatter list so no piece exceeds `max_len`
///
/// # Errors
///
/// Returns `InvalidArgument` if an entry wraps the 64-bit address space.
pub(crate) fn split(entries: &[ScatterEntry], max_len: u32) -> Result<Vec<SwDesc>> {
    let mut out = Vec::with_capacity(entries.len());
    for (i, e) in entries.iter().enumerate() {
        let mut addr = e.addr;
        let mut left = e.len;
        while left > 0 {
            let len = left.min(max_len);
            out.push(SwDesc { addr, len });
            left -= len;
            if left > 0 {
                addr = addr.checked_add(u64::from(len)).ok_or_else(|| {
                    DmaError::invalid_argument(format!(
                        "scatter entry {i} at {:#x} wraps the address space",
                        e.addr
                    ))
                })?;
            }
        }
    }
    Ok(out)
}

/// Wait handle for a synchronous submit
#[derive(Debug, Default)]
pub(crate) struct Completion {
    state: Mutex<Option<Result<usize>>>,
    cond: Condvar,
}

impl Completion {
    pub fn complete(&self, result: Result<usize>) {
        let mut state = crate::lock(&self.state);
        if state.is_none() {
            *state = Some(result);
            self.cond.notify_all();
        }
    }

    /// Block until completed or `timeout` elapses
    pub fn wait(&self, timeout: Duration) -> Option<Result<usize>> {
        let state = crate::lock(&self.state);
        let (mut state, _) = self
            .cond
            .wait_timeout_while(state, timeout, |s| s.is_none())
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.take()
    }
}

/// How the submitter hears about the outcome
pub(crate) enum Notify {
    Waiter(Arc<Completion>),
    Callback(Callback),
    /// Callback already delivered (expired); keep the request for accounting
    Consumed,
}

impl std::fmt::Debug for Notify {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiter(_) => write!(f, "Waiter"),
            Self::Callback(_) => write!(f, "Callback"),
            Self::Consumed => write!(f, "Consumed"),
        }
    }
}

impl Notify {
    pub const fn is_async(&self) -> bool {
        matches!(self, Self::Callback(_))
    }
}

/// A notification to deliver once all locks are released
#[derive(Debug)]
pub(crate) struct Delivery {
    pub notify: Notify,
    pub result: Result<usize>,
}

impl Delivery {
    /// The submitter already heard a timeout for this request
    pub const fn is_consumed(&self) -> bool {
        matches!(self.notify, Notify::Consumed)
    }

    /// Wake the waiter or run the callback
    pub fn deliver(self) {
        match self.notify {
            Notify::Waiter(c) => c.complete(self.result),
            Notify::Callback(cb) => cb(self.result),
            Notify::Consumed => {}
        }
    }
}

/// One queued transfer
#[derive(Debug)]
pub(crate) struct Request {
    pub id: u64,
    pub sdesc: Vec<SwDesc>,
    /// Device-side address of the next descriptor to build
    pub ep_addr: u64,
    pub total_len: u64,
    /// Descriptors placed in the ring
    pub built: u32,
    /// Descriptors credited complete
    pub completed: u32,
    pub done_bytes: u64,
    pub notify: Notify,
    pub deadline: Instant,
    pub timeout: Duration,
}

impl Request {
    #[allow(clippy::cast_possible_truncation)]
    pub fn total_descriptors(&self) -> u32 {
        self.sdesc.len() as u32
    }

    pub fn remaining_to_build(&self) -> u32 {
        self.total_descriptors() - self.built
    }

    pub fn is_built(&self) -> bool {
        self.built == self.total_descriptors()
    }

    pub fn is_complete(&self) -> bool {
        self.completed == self.total_descriptors()
    }

    /// Credit up to `n` placed descriptors; returns how many were taken
    pub fn credit(&mut self, n: u32) -> u32 {
        let take = n.min(self.built - self.completed);
        let from = self.completed as usize;
        self.done_bytes += self.sdesc[from..from + take as usize]
            .iter()
            .map(|d| u64::from(d.len))
            .sum::<u64>();
        self.completed += take;
        take
    }

    /// Outcome delivered on full credit
    #[allow(clippy::cast_possible_truncation)]
    pub fn finish(self) -> Delivery {
        Delivery {
            notify: self.notify,
            result: Ok(self.done_bytes as usize),
        }
    }

    /// Outcome delivered on abort
    pub fn fail(self, err: DmaError) -> Delivery {
        Delivery {
            notify: self.notify,
            result: Err(err),
        }
    }

    /// Async request whose deadline has passed
    pub fn is_overdue(&self, now: Instant) -> bool {
        self.notify.is_async() && self.deadline <= now
    }

    /// Resolve the callback with `Timeout`, leaving the request in place
    pub fn expire(&mut self) -> Delivery {
        Delivery {
            notify: std::mem::replace(&mut self.notify, Notify::Consumed),
            result: Err(DmaError::timeout(self.timeout)),
        }
    }
}

/// Pending-build and in-flight lists
#[derive(Debug, Default)]
pub(crate) struct RequestQueue {
    pub pending: VecDeque<Request>,
    pub in_flight: VecDeque<Request>,
}

impl RequestQueue {
    /// Move the fully built head of pending to the tail of in-flight
    pub fn promote_head(&mut self) {
        if let Some(req) = self.pending.pop_front() {
            debug_assert!(req.is_built());
            self.in_flight.push_back(req);
        }
    }

    /// Take every request, in-flight first, for an abort
    pub fn drain_all(&mut self) -> Vec<Request> {
        self.in_flight.drain(..).chain(self.pending.drain(..)).collect()
    }

}
