//! Memory-backed fence engine.
//!
//! A single coherent page holds 32-bit fence cells the device advances
//! monotonically. Sequence numbers are engine-global and never zero (zero
//! means "no fence"); each hardware queue conventionally signals through its
//! own cell so every cell observes a strictly increasing series.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{GpuError, Result};
use crate::hal::{rmb, DmaAllocator, DmaRegion};
use crate::regs::Registers;

/// Size of the fence page, one cell per dword.
pub const FENCE_PAGE_BYTES: usize = 4096;

struct WaitSlot {
    token: u64,
    addr: u64,
    expected: u32,
    satisfied: bool,
}

struct WaitList {
    slots: Vec<WaitSlot>,
    /// Set at shutdown/reset teardown so sleepers stop waiting for hardware
    /// that will never signal.
    cancelled: bool,
}

pub struct FenceEngine {
    page: DmaRegion,
    seqno: AtomicU32,
    next_token: AtomicU64,
    waiters: Mutex<WaitList>,
    cv: Condvar,
}

impl FenceEngine {
    /// Allocates and zeroes the fence page and programs `FENCE_ADDR`.
    pub fn new(regs: &Registers, dma: &dyn DmaAllocator) -> Result<Self> {
        let page = dma.alloc_coherent(FENCE_PAGE_BYTES)?;
        page.fill(0);
        regs.set_fence_addr(page.bus_addr() as u32);
        debug!(
            bus_addr = format_args!("{:#x}", page.bus_addr()),
            "fence page installed"
        );
        Ok(Self {
            page,
            seqno: AtomicU32::new(0),
            next_token: AtomicU64::new(1),
            waiters: Mutex::new(WaitList {
                slots: Vec::new(),
                cancelled: false,
            }),
            cv: Condvar::new(),
        })
    }

    /// Next monotonic sequence number; never zero, even across wrap.
    pub fn next(&self) -> u32 {
        loop {
            let value = self.seqno.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if value != 0 {
                return value;
            }
        }
    }

    /// Bus address of fence cell `index`.
    pub fn cell_addr(&self, index: u32) -> u64 {
        debug_assert!((index as usize) < FENCE_PAGE_BYTES / 4);
        self.page.bus_addr() + u64::from(index) * 4
    }

    /// Current value of fence cell `index`.
    pub fn cell_value(&self, index: u32) -> u32 {
        self.page.read_dword(index)
    }

    /// Validates an `(addr, value)` pair for emission into a FENCE record.
    /// The record itself is written by the submission path.
    pub fn check_emit(&self, addr: u64, value: u32) -> Result<()> {
        if value == 0 {
            return Err(GpuError::InvalidArgument(
                "fence value zero is reserved".into(),
            ));
        }
        if !self.page.contains(addr) {
            return Err(GpuError::InvalidArgument(format!(
                "fence address {addr:#x} outside the fence page"
            )));
        }
        Ok(())
    }

    /// Whether the cell at `addr` has reached `expected`. Addresses outside
    /// the fence page read as signaled so nothing ever blocks on an unknown
    /// cell.
    pub fn signaled(&self, addr: u64, expected: u32) -> bool {
        let Ok(index) = self.page.index_of(addr) else {
            return true;
        };
        self.page.read_dword(index) >= expected
    }

    /// Blocks until `(addr, expected)` signals. `timeout_ms == 0` waits
    /// indefinitely; otherwise the wait fails with `Timeout`. Cancellation
    /// (shutdown) surfaces as `Cancelled`.
    pub fn wait(&self, addr: u64, expected: u32, timeout_ms: u32) -> Result<()> {
        if self.signaled(addr, expected) {
            return Ok(());
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let deadline = if timeout_ms == 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(u64::from(timeout_ms)))
        };

        let mut list = self.waiters.lock().unwrap();
        list.slots.push(WaitSlot {
            token,
            addr,
            expected,
            satisfied: false,
        });

        let result = loop {
            if self.signaled(addr, expected) {
                break Ok(());
            }
            if list.cancelled {
                break Err(GpuError::Cancelled);
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break Err(GpuError::Timeout);
                    }
                    let (guard, _timed_out) =
                        self.cv.wait_timeout(list, deadline - now).unwrap();
                    list = guard;
                }
                None => {
                    list = self.cv.wait(list).unwrap();
                }
            }
        };

        list.slots.retain(|slot| slot.token != token);
        result
    }

    /// Called from the FENCE interrupt's deferred handler: marks satisfied
    /// slots and wakes every sleeper so they re-check their cells.
    pub fn process(&self) {
        // Fence memory stores happen-before the IRQ bit (hardware contract);
        // order our cell reads after the observed bit.
        rmb();
        let mut list = self.waiters.lock().unwrap();
        let mut any = false;
        for slot in list.slots.iter_mut() {
            if !slot.satisfied && self.signaled(slot.addr, slot.expected) {
                slot.satisfied = true;
                any = true;
            }
        }
        if any {
            self.cv.notify_all();
        }
    }

    /// Unblocks every waiter with `Cancelled`; used at shutdown and when a
    /// reset gives up on the device.
    pub fn cancel_waiters(&self) {
        let mut list = self.waiters.lock().unwrap();
        list.cancelled = true;
        self.cv.notify_all();
    }

    /// Re-arms the engine after `cancel_waiters` (reset recovery).
    pub fn rearm(&self) {
        let mut list = self.waiters.lock().unwrap();
        list.cancelled = false;
    }

    /// Wakes sleepers without cancelling; used when ring state changed under
    /// them (resume after reset).
    pub fn kick_waiters(&self) {
        let list = self.waiters.lock().unwrap();
        drop(list);
        self.cv.notify_all();
    }

    /// Clears the device's view of the fence page at teardown.
    pub fn release(&self, regs: &Registers) {
        regs.set_fence_addr(0);
        self.cancel_waiters();
    }

    pub fn page_bus_addr(&self) -> u64 {
        self.page.bus_addr()
    }

    pub fn last_seqno(&self) -> u32 {
        self.seqno.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for FenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FenceEngine")
            .field("page", &self.page)
            .field("seqno", &self.last_seqno())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{BusMemory, DmaAllocator, MmioSpace};
    use std::sync::atomic::AtomicU32 as Cell;
    use std::sync::Arc;

    struct FlatMmio {
        words: Vec<Cell>,
    }

    impl MmioSpace for FlatMmio {
        fn read32(&self, offset: u32) -> u32 {
            self.words[(offset / 4) as usize].load(Ordering::SeqCst)
        }

        fn write32(&self, offset: u32, value: u32) {
            self.words[(offset / 4) as usize].store(value, Ordering::SeqCst);
        }
    }

    struct FlatMem {
        words: Vec<Cell>,
    }

    impl BusMemory for FlatMem {
        fn read_u32(&self, bus_addr: u64) -> u32 {
            self.words[(bus_addr / 4) as usize].load(Ordering::SeqCst)
        }

        fn write_u32(&self, bus_addr: u64, value: u32) {
            self.words[(bus_addr / 4) as usize].store(value, Ordering::SeqCst);
        }
    }

    struct OnePageAlloc {
        mem: Arc<FlatMem>,
    }

    impl DmaAllocator for OnePageAlloc {
        fn alloc_coherent(&self, bytes: usize) -> crate::error::Result<DmaRegion> {
            let mem: Arc<dyn BusMemory> = self.mem.clone();
            Ok(DmaRegion::new(mem, 0x1000, bytes))
        }
    }

    fn fixture() -> (Arc<FlatMem>, Registers, FenceEngine) {
        let mem = Arc::new(FlatMem {
            words: (0..0x1000).map(|_| Cell::new(0)).collect(),
        });
        let mmio = Arc::new(FlatMmio {
            words: (0..0x100).map(|_| Cell::new(0)).collect(),
        });
        let regs = Registers::new(mmio);
        let engine = FenceEngine::new(&regs, &OnePageAlloc { mem: Arc::clone(&mem) }).unwrap();
        (mem, regs, engine)
    }

    #[test]
    fn init_programs_the_fence_base() {
        let (_mem, regs, engine) = fixture();
        assert_eq!(regs.fence_addr() as u64, engine.page_bus_addr());
    }

    #[test]
    fn sequence_numbers_start_at_one_and_increase() {
        let (_mem, _regs, engine) = fixture();
        assert_eq!(engine.next(), 1);
        assert_eq!(engine.next(), 2);
        assert_eq!(engine.next(), 3);
    }

    #[test]
    fn out_of_page_addresses_read_as_signaled() {
        let (_mem, _regs, engine) = fixture();
        assert!(engine.signaled(0, u32::MAX));
        assert!(engine.signaled(0xFFFF_0000, u32::MAX));
        // Misaligned addresses are never valid cells.
        assert!(engine.signaled(engine.cell_addr(0) + 1, u32::MAX));
        assert!(!engine.signaled(engine.cell_addr(0), 1));
    }

    #[test]
    fn check_emit_bounds_the_pair() {
        let (_mem, _regs, engine) = fixture();
        assert!(engine.check_emit(engine.cell_addr(3), 7).is_ok());
        assert!(engine.check_emit(engine.cell_addr(3), 0).is_err());
        assert!(engine.check_emit(0x10, 7).is_err());
    }

    #[test]
    fn wait_times_out_then_signals() {
        let (mem, _regs, engine) = fixture();
        let addr = engine.cell_addr(0);
        assert_eq!(engine.wait(addr, 5, 20), Err(GpuError::Timeout));

        mem.write_u32(addr, 5);
        assert_eq!(engine.wait(addr, 5, 20), Ok(()));
    }

    #[test]
    fn process_wakes_a_parked_waiter() {
        let (mem, _regs, engine) = fixture();
        let engine = Arc::new(engine);
        let addr = engine.cell_addr(1);

        let waiter = std::thread::spawn({
            let engine = Arc::clone(&engine);
            move || engine.wait(addr, 2, 0)
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        mem.write_u32(addr, 2);
        engine.process();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn cancel_unblocks_waiters_with_cancelled() {
        let (_mem, _regs, engine) = fixture();
        let engine = Arc::new(engine);
        let addr = engine.cell_addr(2);

        let waiter = std::thread::spawn({
            let engine = Arc::clone(&engine);
            move || engine.wait(addr, 1, 0)
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        engine.cancel_waiters();
        assert_eq!(waiter.join().unwrap(), Err(GpuError::Cancelled));
    }
}
