//! Userspace driver core for a PCIe scatter-gather DMA engine.
//!
//! Turns scatter lists into hardware descriptor chains, feeds them to the
//! engine through a fixed ring of descriptor sets, and reconciles hardware
//! completions with the requests that produced them.
//!
//! # Data path
//!
//! ```text
//!   submit() ──► pending list ──► builder ──► descriptor sets ──► start
//!                                    │              (N x D ring)      │
//!                                    └─► in-flight list ◄── credit ◄──┘
//!                                                 ▲
//!                  IRQ / poll ──► Doorbell ──► CompletionWorker
//! ```
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`ring`] | Descriptor arena and the set allocator |
//! | [`result_ring`] | Streaming receive result entries |
//! | [`completion`] | Interrupt and write-back completion sources |
//! | [`worker`] | Doorbell and completion thread |
//! | [`hw`] | Register and coherent-memory seams |
//! | [`memory`] | Page-locked host buffers |
//! | [`mmio`] | Config BAR mapping through sysfs |
//! | [`sim`] | Register-level engine model for tests and benchmarks |
//!
//! # Quick start
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use xdma_driver::prelude::*;
//! use xdma_driver::sim::{SimMemory, SimulatedEngine};
//!
//! # fn main() -> Result<()> {
//! let mem = Arc::new(SimMemory::new());
//! let sim = Arc::new(SimulatedEngine::new(mem.clone(), Direction::H2C, 0));
//! let engine = Arc::new(Engine::new(
//!     EngineConfig::new(Direction::H2C, 0),
//!     sim.clone(),
//!     mem.as_ref(),
//! )?);
//! sim.connect_irq(engine.irq_handle());
//! let _worker = CompletionWorker::spawn(engine.clone(), Duration::from_millis(10))?;
//!
//! let buf = mem.alloc_buffer(4096)?;
//! let sent = engine.submit(Direction::H2C, 0, &[ScatterEntry::new(buf.bus_addr(), 4096)], None, None)?;
//! assert_eq!(sent, 4096);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod builder;
pub mod completion;
mod config;
mod engine;
mod error;
pub mod hw;
pub mod memory;
pub mod mmio;
mod request;
pub mod result_ring;
pub mod ring;
pub mod sim;
pub mod worker;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::{CompletionMode, EngineConfig, SUPPORTED_DEPTHS};
pub use engine::{Engine, EngineState, EngineStats, RegisterDump, RingSnapshot};
pub use error::{DmaError, Result};
pub use hw::{DmaAllocator, DmaRegion, RegisterAccess};
pub use memory::{HostAllocator, HostRegion};
pub use request::{Callback, ScatterEntry};
pub use worker::{CompletionWorker, IrqHandle};
pub use xdma_chip::bar::Direction;

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        Callback, CompletionMode, CompletionWorker, Direction, DmaError, Engine, EngineConfig,
        EngineState, Result, ScatterEntry,
    };
    pub use crate::hw::DmaRegion;
}

/// Take a lock, recovering the data if a holder panicked
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
