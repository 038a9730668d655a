//! Page-locked host memory regions
//!
//! A [`HostRegion`] is a page-aligned, zeroed allocation that is pinned with
//! `mlock` when the process is allowed to. Its bus address is supplied by the
//! caller: in production that is the IOVA the region was mapped at, in CI it
//! is a synthetic address handed out by [`crate::sim::SimMemory`].
//!
//! Words are accessed through `AtomicU32` so the engine (or the simulator
//! running on another thread) and the driver observe each other's stores
//! without tearing.

// Host memory access requires exact pointer casts
#![allow(clippy::cast_ptr_alignment)]

use crate::error::{DmaError, Result};
use crate::hw::{DmaAllocator, DmaRegion};
use rustix::mm::{mlock, munlock};
use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Alignment and rounding unit of every region
pub const PAGE_SIZE: usize = 4096;

/// Page-aligned host allocation with a bus address
pub struct HostRegion {
    ptr: NonNull<u8>,
    size: usize,
    bus_addr: u64,
    locked: bool,
}

impl std::fmt::Debug for HostRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRegion")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .field("bus_addr", &format_args!("{:#x}", self.bus_addr))
            .field("locked", &self.locked)
            .finish()
    }
}

// SAFETY: Send - HostRegion owns its allocation exclusively; the pointer is
// not tied to the allocating thread.
unsafe impl Send for HostRegion {}

// SAFETY: Sync - every access goes through AtomicU32 loads and stores on
// 4-aligned, in-bounds words, so shared access from several threads is sound.
unsafe impl Sync for HostRegion {}

impl HostRegion {
    /// Allocate `size` bytes (rounded up to a page) at `bus_addr`
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` if the size is zero, the layout is invalid or
    /// the allocator fails.
    pub fn new(size: usize, bus_addr: u64) -> Result<Self> {
        if size == 0 {
            return Err(DmaError::out_of_memory("zero-sized region"));
        }
        let size = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let layout = Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|e| DmaError::out_of_memory(format!("invalid layout: {e}")))?;

        // SAFETY: alloc_zeroed necessary for a page-aligned DMA region.
        // Invariants: (1) layout from from_size_align, size > 0, align is a
        // power of two; (2) returns a valid pointer or null; (3) dealloc in
        // Drop with the same layout.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| DmaError::out_of_memory(format!("{size} bytes")))?;

        // SAFETY: mlock on [ptr, ptr+size), entirely inside the allocation
        // above. Failure (RLIMIT_MEMLOCK) leaves the memory usable but
        // swappable.
        let locked = match unsafe { mlock(ptr.as_ptr().cast(), size) } {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("mlock of {size} bytes failed ({e}); region stays pageable");
                false
            }
        };

        tracing::debug!("Allocated host region: {size} bytes at bus {bus_addr:#x}");

        Ok(Self {
            ptr,
            size,
            bus_addr,
            locked,
        })
    }

    /// Whether the pages are pinned
    pub const fn is_locked(&self) -> bool {
        self.locked
    }

    /// Whether a bus address range falls inside this region
    pub fn contains(&self, bus: u64, len: usize) -> bool {
        bus >= self.bus_addr
            && (bus - self.bus_addr)
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.size as u64)
    }

    fn word(&self, offset: usize) -> &AtomicU32 {
        assert!(
            offset % 4 == 0 && offset + 4 <= self.size,
            "Region offset {offset:#x} out of bounds or unaligned"
        );
        // SAFETY: ptr is valid for self.size bytes for the lifetime of self,
        // offset is 4-aligned and in bounds (checked above), the allocation
        // is page-aligned so the word is naturally aligned, and AtomicU32 has
        // the same layout as u32.
        unsafe { &*self.ptr.as_ptr().add(offset).cast::<AtomicU32>() }
    }
}

impl DmaRegion for HostRegion {
    fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    fn len(&self) -> usize {
        self.size
    }

    fn read32(&self, offset: usize) -> u32 {
        u32::from_le(self.word(offset).load(Ordering::Acquire))
    }

    fn write32(&self, offset: usize, value: u32) {
        self.word(offset).store(value.to_le(), Ordering::Release);
    }
}

impl Drop for HostRegion {
    fn drop(&mut self) {
        if self.locked {
            // SAFETY: munlock of the exact range locked in new().
            unsafe {
                let _ = munlock(self.ptr.as_ptr().cast(), self.size);
            }
        }
        if let Ok(layout) = Layout::from_size_align(self.size, PAGE_SIZE) {
            // SAFETY: dealloc must match alloc_zeroed in new(). Invariants:
            // (1) ptr from that allocation; (2) same layout; (3) no
            // references outlive self.
            unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
        tracing::trace!("Freed host region at bus {:#x}", self.bus_addr);
    }
}

/// Hands out host regions at consecutive page-aligned bus addresses
///
/// The caller is responsible for making `[iova_base, ...)` translate to
/// these pages (an IOMMU mapping, or identity in the simulator).
#[derive(Debug)]
pub struct HostAllocator {
    next_iova: AtomicU64,
}

impl HostAllocator {
    /// Allocator starting at `iova_base` (rounded up to a page)
    pub fn new(iova_base: u64) -> Self {
        Self {
            next_iova: AtomicU64::new(iova_base.next_multiple_of(PAGE_SIZE as u64)),
        }
    }

    /// Allocate a region and keep its concrete type
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` if the allocation fails.
    pub fn alloc_region(&self, size: usize) -> Result<Arc<HostRegion>> {
        let rounded = size.max(1).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        // one guard page between regions so overruns land nowhere
        let bus = self
            .next_iova
            .fetch_add((rounded + PAGE_SIZE) as u64, Ordering::Relaxed);
        Ok(Arc::new(HostRegion::new(rounded, bus)?))
    }
}

impl DmaAllocator for HostAllocator {
    fn alloc_coherent(&self, size: usize) -> Result<Arc<dyn DmaRegion>> {
        let region: Arc<dyn DmaRegion> = self.alloc_region(size)?;
        Ok(region)
    }
}
