//! Completion context
//!
//! The interrupt stub only rings a doorbell; all ring mutation happens on
//! the completion worker thread that waits on it.
//!
//! ```text
//!   IRQ / poll rearm ──► Doorbell (bounded 1) ──► CompletionWorker
//!                                                   ├─ service_completions()
//!                                                   └─ idle tick: expire_requests(), process_pending()
//! ```

use crate::engine::Engine;
use crate::error::{DmaError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Coalescing "completion pending" flag
///
/// Rings collapse: while one is unconsumed, further rings are dropped.
#[derive(Debug, Clone)]
pub struct Doorbell {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Default for Doorbell {
    fn default() -> Self {
        Self::new()
    }
}

impl Doorbell {
    /// A doorbell with nothing pending
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        Self { tx, rx }
    }

    /// Mark completion work pending; never blocks
    pub fn ring(&self) {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                tracing::trace!("doorbell rung with no listener");
            }
        }
    }

    /// Wait for a ring; `false` on timeout
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Handle for an interrupt source
    pub fn irq_handle(&self) -> IrqHandle {
        IrqHandle {
            tx: self.tx.clone(),
        }
    }
}

/// What an interrupt handler holds: it can only ring
#[derive(Debug, Clone)]
pub struct IrqHandle {
    tx: Sender<()>,
}

impl IrqHandle {
    /// Signal that the engine wants service
    pub fn raise(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Dedicated completion thread for one engine
#[derive(Debug)]
pub struct CompletionWorker {
    stop: Arc<AtomicBool>,
    doorbell: Doorbell,
    handle: Option<JoinHandle<()>>,
}

impl CompletionWorker {
    /// Start servicing `engine`, waking at least every `tick`
    ///
    /// # Errors
    ///
    /// Returns `Io` if the thread cannot be spawned.
    pub fn spawn(engine: Arc<Engine>, tick: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let doorbell = engine.doorbell().clone();
        let name = format!("xdma-{}", engine.name());

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn({
                let stop = stop.clone();
                let doorbell = doorbell.clone();
                move || run(&engine, &doorbell, &stop, tick)
            })
            .map_err(DmaError::from)?;

        tracing::info!("{name}: completion worker started");
        Ok(Self {
            stop,
            doorbell,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.doorbell.ring();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("completion worker panicked");
            }
        }
    }
}

impl Drop for CompletionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(engine: &Engine, doorbell: &Doorbell, stop: &AtomicBool, tick: Duration) {
    while !stop.load(Ordering::Acquire) {
        if doorbell.wait(tick) {
            if stop.load(Ordering::Acquire) {
                break;
            }
            if let Err(e) = engine.service_completions() {
                tracing::warn!("{}: completion service failed: {e}", engine.name());
            }
        } else {
            let expired = engine.expire_requests(Instant::now());
            if expired > 0 {
                tracing::debug!("{}: expired {expired} requests", engine.name());
            }
            if let Err(e) = engine.process_pending() {
                tracing::debug!("{}: idle kick: {e}", engine.name());
            }
        }
    }
    tracing::debug!("{}: completion worker exiting", engine.name());
}
