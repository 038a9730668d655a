//! Memory-mapped config BAR
//!
//! Maps `/sys/bus/pci/devices/<addr>/resource<N>` with rustix and exposes it
//! as [`RegisterAccess`]. Only register access lives here; interrupt vectors
//! and IOMMU mappings belong to whoever owns the PCI function.

// MMIO registers are naturally aligned by hardware, so pointer casts are safe
#![allow(clippy::cast_ptr_alignment)]
#![allow(clippy::cast_possible_truncation)]

use crate::error::{DmaError, Result};
use crate::hw::RegisterAccess;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsFd;
use std::path::Path;
use std::ptr::NonNull;
use xdma_chip::bar::TARGET_SPACING;
use xdma_chip::ident::SUBSYSTEM_ID;

/// Target index of the IRQ block
const IRQ_TARGET: u32 = 2;

/// Target index of the config block
const CONFIG_TARGET: u32 = 3;

/// Mapped BAR region for register access
pub struct MappedRegion {
    ptr: NonNull<u8>,
    size: usize,
    _file: File,
    path: String,
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .field("path", &self.path)
            .finish()
    }
}

// SAFETY: Send - MappedRegion owns the mapping exclusively. Moving between
// threads does not invalidate it (mmap'd memory is process-wide).
unsafe impl Send for MappedRegion {}

// SAFETY: Sync - all access is bounds-checked volatile 32-bit reads and
// writes; the hardware serialises concurrent register accesses itself.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map BAR `bar_index` of the PCI function at `pcie_address`
    ///
    /// # Errors
    ///
    /// Returns an error if the resource file cannot be opened or mapped.
    pub fn open(pcie_address: &str, bar_index: usize) -> Result<Self> {
        Self::from_path(format!("/sys/bus/pci/devices/{pcie_address}/resource{bar_index}"))
    }

    /// Map a BAR resource file by path
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be opened read/write
    /// - The BAR size is zero
    /// - mmap fails
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let display = path.display().to_string();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| DmaError::Io {
                reason: format!("Cannot open {display}: {e}. Is the device enabled?"),
            })?;

        let size = file.metadata()?.len() as usize;
        if size == 0 {
            return Err(DmaError::Io {
                reason: format!("{display} has size 0 (device not enabled?)"),
            });
        }

        // SAFETY: mmap necessary for MMIO - maps the BAR into the process.
        // Invariants: (1) fd valid, just opened; (2) size non-zero; (3)
        // MAP_SHARED so writes reach the device; (4) file kept alive in self
        // for the lifetime of the mapping; (5) unmapped in Drop.
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
        }
        .map_err(|e| DmaError::Io {
            reason: format!("mmap of {display} failed: {e}"),
        })?;

        let ptr = NonNull::new(addr.cast::<u8>()).ok_or_else(|| DmaError::Io {
            reason: format!("mmap of {display} returned null"),
        })?;

        let path_str = display.as_str();
        tracing::info!("Mapped {path_str} ({size:#x} bytes at {ptr:p})");

        Ok(Self {
            ptr,
            size,
            _file: file,
            path: display,
        })
    }

    /// Size of the mapping
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Whether this BAR carries the DMA config block
    ///
    /// Checks the IRQ and config block identifiers for the subsystem tag.
    pub fn is_config_bar(&self) -> bool {
        let cfg_off = CONFIG_TARGET as usize * TARGET_SPACING;
        if self.size < cfg_off + 4 {
            return false;
        }
        let irq_id = self.read32(IRQ_TARGET as usize * TARGET_SPACING);
        let cfg_id = self.read32(cfg_off);
        let tagged = |raw: u32, target: u32| raw >> 20 == SUBSYSTEM_ID && (raw >> 16) & 0xF == target;
        tagged(irq_id, IRQ_TARGET) && tagged(cfg_id, CONFIG_TARGET)
    }
}

impl RegisterAccess for MappedRegion {
    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the mapping.
    fn read32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.size, "Register offset out of bounds");
        // SAFETY: read_volatile necessary for MMIO - hardware can change the
        // value. Invariants: (1) ptr from mmap, valid for self.size; (2)
        // offset + 4 <= size; (3) registers are 4-byte aligned.
        unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().read_volatile() }
    }

    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the mapping.
    fn write32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.size, "Register offset out of bounds");
        // SAFETY: write_volatile necessary for MMIO - triggers hardware side
        // effects. Invariants: (1) ptr from mmap; (2) offset + 4 <= size;
        // (3) 4-byte aligned.
        unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().write_volatile(value) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: munmap of the exact range mapped in from_path(); Drop
        // runs at most once and no references outlive self.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), self.size);
        }
        tracing::debug!("Unmapped {}", self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_resource_is_an_io_error() {
        let err = MappedRegion::open("0000:ff:1f.7", 9).unwrap_err();
        assert!(matches!(err, DmaError::Io { .. }));
    }

    #[test]
    #[ignore = "requires a DMA-capable PCIe function; set XDMA_TEST_BDF"]
    fn maps_real_config_bar() {
        let bdf = std::env::var("XDMA_TEST_BDF").unwrap();
        let found = (0..6).any(|bar| {
            MappedRegion::open(&bdf, bar).is_ok_and(|region| region.is_config_bar())
        });
        assert!(found, "no config BAR on {bdf}");
    }
}
