//! Platform traits the driver core is written against.
//!
//! The core never touches hardware directly; it goes through an [`MmioSpace`]
//! for the register window, a [`DmaAllocator`] for coherent memory shared
//! with the device, and an [`IrqLine`] for the interrupt. Production bindings
//! map these onto a real BAR and IRQ registration; the test suite binds them
//! to `vexgpu-model`.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crate::error::{GpuError, Result};

/// 32-bit little-endian MMIO register window.
///
/// All accesses are dword-sized and dword-aligned; alignment is enforced by
/// the register accessor layer, not here. Implementations must give reads
/// and writes at least acquire/release semantics so that MMIO observed by
/// the device is ordered against prior coherent-memory stores.
pub trait MmioSpace: Send + Sync {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);
}

/// Device-visible system memory, addressed by bus address.
///
/// This is the device's view of the coherent allocations handed out by a
/// [`DmaAllocator`]; the host's view of the same words is a [`DmaRegion`].
pub trait BusMemory: Send + Sync {
    fn read_u32(&self, bus_addr: u64) -> u32;
    fn write_u32(&self, bus_addr: u64, value: u32);
}

/// Allocator for DMA-coherent memory shared between host and device.
pub trait DmaAllocator: Send + Sync {
    /// Allocates `bytes` of zeroed coherent memory. Fails with `OutOfMemory`
    /// when the pool is exhausted.
    fn alloc_coherent(&self, bytes: usize) -> Result<DmaRegion>;
}

/// The device interrupt line. The core installs exactly one handler at probe
/// and detaches it at shutdown; the handler runs in hard-IRQ context and must
/// not block.
pub trait IrqLine: Send + Sync {
    fn attach(&self, handler: Arc<dyn Fn() + Send + Sync>);
    fn detach(&self);
}

/// Host-side view of one DMA-coherent allocation, in dword units.
///
/// Reads and writes go through the shared [`BusMemory`] so they are visible
/// to the device without further synchronization beyond the barrier points
/// the ring/fence code already issues.
#[derive(Clone)]
pub struct DmaRegion {
    mem: Arc<dyn BusMemory>,
    bus_addr: u64,
    len_bytes: usize,
}

impl DmaRegion {
    pub fn new(mem: Arc<dyn BusMemory>, bus_addr: u64, len_bytes: usize) -> Self {
        debug_assert_eq!(bus_addr % 4, 0);
        debug_assert_eq!(len_bytes % 4, 0);
        Self {
            mem,
            bus_addr,
            len_bytes,
        }
    }

    pub fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    pub fn len_bytes(&self) -> usize {
        self.len_bytes
    }

    pub fn len_dwords(&self) -> u32 {
        (self.len_bytes / 4) as u32
    }

    /// Volatile read of the dword at `index`.
    pub fn read_dword(&self, index: u32) -> u32 {
        debug_assert!(index < self.len_dwords());
        self.mem.read_u32(self.bus_addr + u64::from(index) * 4)
    }

    pub fn write_dword(&self, index: u32, value: u32) {
        debug_assert!(index < self.len_dwords());
        self.mem.write_u32(self.bus_addr + u64::from(index) * 4, value);
    }

    /// Whether `bus_addr` names a dword inside this region.
    pub fn contains(&self, bus_addr: u64) -> bool {
        bus_addr % 4 == 0
            && bus_addr >= self.bus_addr
            && bus_addr < self.bus_addr + self.len_bytes as u64
    }

    /// Dword index of `bus_addr` within the region.
    pub fn index_of(&self, bus_addr: u64) -> Result<u32> {
        if !self.contains(bus_addr) {
            return Err(GpuError::InvalidArgument(format!(
                "bus address {bus_addr:#x} outside coherent region"
            )));
        }
        Ok(((bus_addr - self.bus_addr) / 4) as u32)
    }

    pub fn fill(&self, value: u32) {
        for i in 0..self.len_dwords() {
            self.write_dword(i, value);
        }
    }
}

impl std::fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaRegion")
            .field("bus_addr", &format_args!("{:#x}", self.bus_addr))
            .field("len_bytes", &self.len_bytes)
            .finish()
    }
}

/// Write barrier: coherent-memory stores issued before this are visible to
/// the device before any MMIO write issued after it.
#[inline]
pub fn wmb() {
    fence(Ordering::Release);
}

/// Read barrier: issued after observing a status/IRQ bit, before consuming
/// the shared memory that bit covers.
#[inline]
pub fn rmb() {
    fence(Ordering::Acquire);
}
