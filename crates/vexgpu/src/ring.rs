//! Per-queue command rings.
//!
//! A ring is a power-of-two circular buffer of dwords in DMA-coherent
//! memory. The device owns the head (read pointer, re-read from its register
//! on every space query); the host owns the tail (next write position). One
//! slot stays reserved so a full ring is distinguishable from an empty one.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::cmd::{RING_SIZE_MAX, RING_SIZE_MIN};
use crate::error::{GpuError, Result};
use crate::hal::{wmb, DmaAllocator, DmaRegion};
use crate::regs::{status, Registers};

/// Poll quantum for space waits; the QUEUE_EMPTY interrupt short-circuits it.
const SPACE_POLL_QUANTUM: Duration = Duration::from_millis(1);

/// Wait queue for ring space, shared by all rings of a device and kicked by
/// the QUEUE_EMPTY interrupt. Purely a wake hint; waiters always re-read the
/// device head.
pub struct SpaceWait {
    generation: Mutex<u64>,
    cv: Condvar,
}

impl SpaceWait {
    pub fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub fn notify_all(&self) {
        let mut generation = self.generation.lock().unwrap();
        *generation += 1;
        self.cv.notify_all();
    }

    fn wait_quantum(&self, quantum: Duration) {
        let generation = self.generation.lock().unwrap();
        let _unused = self.cv.wait_timeout(generation, quantum).unwrap();
    }
}

impl Default for SpaceWait {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CommandRing {
    queue_id: u32,
    size_dw: u32,
    region: DmaRegion,
    /// Host-private write pointer in dwords. Mutated only under the device
    /// command lock; atomic so observers (stats, health) can read it.
    tail: AtomicU32,
    enabled: AtomicBool,
    /// Device head captured at suspend, restored on resume.
    last_head: AtomicU32,
    submitted_cmds: AtomicU64,
    completed_cmds: AtomicU64,
}

impl CommandRing {
    /// Allocates the coherent buffer, programs the queue's base/size bank and
    /// zeroes both pointers. `size_bytes` is rounded up to the next power of
    /// two and must land inside `[RING_SIZE_MIN, RING_SIZE_MAX]`.
    pub fn create(
        regs: &Registers,
        dma: &dyn DmaAllocator,
        queue_id: u32,
        size_bytes: usize,
    ) -> Result<Self> {
        if size_bytes < RING_SIZE_MIN || size_bytes > RING_SIZE_MAX {
            return Err(GpuError::InvalidArgument(format!(
                "ring size {size_bytes} outside [{RING_SIZE_MIN}, {RING_SIZE_MAX}]"
            )));
        }
        let size_bytes = size_bytes.next_power_of_two();

        let region = dma.alloc_coherent(size_bytes)?;
        region.fill(0);

        regs.set_cmd_base(queue_id, region.bus_addr() as u32);
        regs.set_cmd_size(queue_id, size_bytes as u32);
        regs.set_cmd_head(queue_id, 0);
        regs.set_cmd_tail(queue_id, 0);

        debug!(
            queue = queue_id,
            size_bytes,
            bus_addr = format_args!("{:#x}", region.bus_addr()),
            "created command ring"
        );

        Ok(Self {
            queue_id,
            size_dw: (size_bytes / 4) as u32,
            region,
            tail: AtomicU32::new(0),
            enabled: AtomicBool::new(true),
            last_head: AtomicU32::new(0),
            submitted_cmds: AtomicU64::new(0),
            completed_cmds: AtomicU64::new(0),
        })
    }

    pub fn queue_id(&self) -> u32 {
        self.queue_id
    }

    pub fn size_dw(&self) -> u32 {
        self.size_dw
    }

    pub fn bus_addr(&self) -> u64 {
        self.region.bus_addr()
    }

    pub fn tail(&self) -> u32 {
        self.tail.load(Ordering::Acquire)
    }

    /// Device read pointer, masked into range. Always a fresh register read.
    pub fn head(&self, regs: &Registers) -> u32 {
        regs.cmd_head(self.queue_id) & (self.size_dw - 1)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_empty(&self, regs: &Registers) -> bool {
        self.head(regs) == self.tail()
    }

    /// Available dwords under the reserved-slot convention.
    pub fn space_dw(&self, regs: &Registers) -> u32 {
        let head = self.head(regs);
        let tail = self.tail();
        if head <= tail {
            self.size_dw - (tail - head) - 1
        } else {
            head - tail - 1
        }
    }

    /// Blocks until `needed` dwords are free. A hardware error observed while
    /// polling aborts the wait; the caller is responsible for scheduling
    /// recovery.
    pub fn wait_space(
        &self,
        regs: &Registers,
        waiter: &SpaceWait,
        needed: u32,
        timeout: Duration,
    ) -> Result<()> {
        if needed > self.size_dw - 1 {
            return Err(GpuError::InvalidArgument(format!(
                "{needed} dwords can never fit a {}-dword ring",
                self.size_dw
            )));
        }
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_enabled() {
                return Err(GpuError::Busy);
            }
            if self.space_dw(regs) >= needed {
                return Ok(());
            }
            if regs.status() & status::ERROR != 0 {
                warn!(queue = self.queue_id, "hardware error while waiting for ring space");
                return Err(GpuError::Hardware);
            }
            if Instant::now() >= deadline {
                return Err(GpuError::Timeout);
            }
            waiter.wait_quantum(SPACE_POLL_QUANTUM);
        }
    }

    /// Copies `dwords` into the ring at the tail, wrapping at the boundary,
    /// and publishes the new host-private tail. The caller holds the device
    /// command lock; space for the payload has already been reserved.
    pub fn write(&self, dwords: &[u32]) {
        let mask = self.size_dw - 1;
        let mut tail = self.tail.load(Ordering::Relaxed);
        for &dword in dwords {
            self.region.write_dword(tail, dword);
            tail = (tail + 1) & mask;
        }
        // Payload must be visible to the device before the tail moves.
        wmb();
        self.tail.store(tail, Ordering::Release);
    }

    /// Publishes the tail to the device and rings the doorbell.
    pub fn kick(&self, regs: &Registers) {
        regs.set_cmd_tail(self.queue_id, self.tail());
        regs.ring_doorbell(self.queue_id);
        self.submitted_cmds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_completed(&self) {
        self.completed_cmds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn submitted_cmds(&self) -> u64 {
        self.submitted_cmds.load(Ordering::Relaxed)
    }

    pub fn completed_cmds(&self) -> u64 {
        self.completed_cmds.load(Ordering::Relaxed)
    }

    /// Stops accepting submissions and waits up to `drain_timeout` for the
    /// device to consume everything already published. Returns whether the
    /// ring drained; a wedged device leaves residue that resume will replay.
    pub fn suspend(&self, regs: &Registers, drain_timeout: Duration) -> bool {
        self.set_enabled(false);
        let deadline = Instant::now() + drain_timeout;
        let mut drained = self.is_empty(regs);
        while !drained && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
            drained = self.is_empty(regs);
        }
        if !drained {
            warn!(
                queue = self.queue_id,
                head = self.head(regs),
                tail = self.tail(),
                "ring not empty at suspend"
            );
        }
        self.last_head.store(self.head(regs), Ordering::Release);
        drained
    }

    /// Reprograms the queue bank and restores both pointers after a reset or
    /// resume. The caller wakes space waiters once all rings are back.
    pub fn resume(&self, regs: &Registers) {
        regs.set_cmd_base(self.queue_id, self.region.bus_addr() as u32);
        regs.set_cmd_size(self.queue_id, self.size_dw * 4);
        regs.set_cmd_head(self.queue_id, self.last_head.load(Ordering::Acquire));
        regs.set_cmd_tail(self.queue_id, self.tail());
        self.set_enabled(true);
        debug!(queue = self.queue_id, "command ring resumed");
    }

    /// Detaches the ring from the device. The coherent buffer is freed when
    /// the ring drops.
    pub fn release(&self, regs: &Registers) {
        self.set_enabled(false);
        regs.set_cmd_base(self.queue_id, 0);
        regs.set_cmd_size(self.queue_id, 0);
    }
}

impl std::fmt::Debug for CommandRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRing")
            .field("queue_id", &self.queue_id)
            .field("size_dw", &self.size_dw)
            .field("tail", &self.tail())
            .finish_non_exhaustive()
    }
}
