//! VexGPU register map and the typed accessor over the MMIO window.
//!
//! All registers are 32-bit little-endian. Per-queue command registers sit in
//! banks of stride [`mmio::CMD_BANK_STRIDE`] starting at the queue-0 bank;
//! doorbells use a separate 4-byte stride in their own window.

use std::sync::Arc;

use crate::error::{GpuError, Result};
use crate::hal::{wmb, MmioSpace};

/// Maximum number of hardware queues the doorbell window decodes.
pub const MAX_QUEUES: u32 = 16;

/// Number of queues with usable command-register banks.
///
/// Banks advance in 0x10 strides from `CMD_BASE`; the bank for queue 2 would
/// land on the fence block at 0x60, so only queues 0 and 1 are addressable
/// with the current map.
pub const MAX_BANKED_QUEUES: u32 = 2;

pub mod mmio {
    pub const VERSION: u32 = 0x0000;
    pub const CAPS: u32 = 0x0004;
    pub const CONTROL: u32 = 0x0008;
    pub const STATUS: u32 = 0x000C;
    pub const SCRATCH: u32 = 0x0010;

    pub const IRQ_STATUS: u32 = 0x0020;
    pub const IRQ_ENABLE: u32 = 0x0024;
    pub const IRQ_ACK: u32 = 0x0028;

    /// Queue-0 command bank; queue `q` adds `q * CMD_BANK_STRIDE`.
    pub const CMD_BASE: u32 = 0x0040;
    pub const CMD_SIZE: u32 = 0x0044;
    pub const CMD_HEAD: u32 = 0x0048;
    pub const CMD_TAIL: u32 = 0x004C;
    pub const CMD_BANK_STRIDE: u32 = 0x10;

    pub const FENCE_ADDR: u32 = 0x0060;
    pub const FENCE_VALUE: u32 = 0x0064;

    pub const VERTEX_BASE: u32 = 0x0080;
    pub const VERTEX_COUNT: u32 = 0x0084;
    pub const VERTEX_STRIDE: u32 = 0x0088;

    pub const SHADER_PC: u32 = 0x00A0;
    pub const SHADER_ADDR: u32 = 0x00A4;
    pub const SHADER_DATA: u32 = 0x00A8;
    pub const SHADER_CTRL: u32 = 0x00AC;

    /// Shader instruction-memory window (word-addressed through
    /// `SHADER_ADDR`/`SHADER_DATA`).
    pub const INSTR_MEM_BASE: u32 = 0x1000;
    pub const INSTR_MEM_SIZE: u32 = 0x1000;

    pub const DOORBELL_BASE: u32 = 0x2000;
    pub const DOORBELL_STRIDE: u32 = 4;
}

pub mod control {
    pub const ENABLE: u32 = 1 << 0;
    pub const RESET: u32 = 1 << 1;
    pub const PAUSE: u32 = 1 << 2;
    pub const FLUSH_CACHE: u32 = 1 << 4;
    pub const PERF_COUNTER: u32 = 1 << 5;
}

pub mod status {
    pub const IDLE: u32 = 1 << 0;
    pub const BUSY: u32 = 1 << 1;
    pub const ERROR: u32 = 1 << 2;
    pub const HALTED: u32 = 1 << 3;
    pub const FENCE_DONE: u32 = 1 << 4;
    pub const CMD_EMPTY: u32 = 1 << 5;
    pub const CMD_FULL: u32 = 1 << 6;
}

pub mod irq_bits {
    pub const CMD_COMPLETE: u32 = 1 << 0;
    pub const ERROR: u32 = 1 << 1;
    pub const FENCE: u32 = 1 << 2;
    pub const QUEUE_EMPTY: u32 = 1 << 3;
    pub const SHADER_HALT: u32 = 1 << 4;
    pub const PERF_COUNTER: u32 = 1 << 5;

    pub const ALL: u32 = CMD_COMPLETE | ERROR | FENCE | QUEUE_EMPTY | SHADER_HALT | PERF_COUNTER;
}

pub mod caps {
    pub const VERTEX_SHADER: u32 = 1 << 0;
    pub const FRAGMENT_SHADER: u32 = 1 << 1;
    pub const TEXTURE: u32 = 1 << 2;
    pub const FLOAT16: u32 = 1 << 3;
    pub const FLOAT32: u32 = 1 << 4;
    pub const INT32: u32 = 1 << 5;
    pub const ATOMIC: u32 = 1 << 6;
    pub const FENCE: u32 = 1 << 7;
    pub const MULTI_QUEUE: u32 = 1 << 8;
    pub const PREEMPTION: u32 = 1 << 9;
}

/// Decoded `VERSION` register (`MMmmppbb` packed).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub build: u8,
}

impl Version {
    pub fn from_raw(raw: u32) -> Self {
        Self {
            major: (raw >> 24) as u8,
            minor: (raw >> 16) as u8,
            patch: (raw >> 8) as u8,
            build: raw as u8,
        }
    }

    pub fn to_raw(self) -> u32 {
        (u32::from(self.major) << 24)
            | (u32::from(self.minor) << 16)
            | (u32::from(self.patch) << 8)
            | u32::from(self.build)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.patch, self.build
        )
    }
}

/// Typed accessor over the MMIO window.
///
/// Named helpers use known-aligned offsets; the generic [`Registers::read`]
/// and [`Registers::write`] reject misaligned offsets so callers cannot issue
/// torn accesses.
#[derive(Clone)]
pub struct Registers {
    mmio: Arc<dyn MmioSpace>,
}

impl Registers {
    pub fn new(mmio: Arc<dyn MmioSpace>) -> Self {
        Self { mmio }
    }

    pub fn read(&self, offset: u32) -> Result<u32> {
        if offset % 4 != 0 {
            return Err(GpuError::InvalidArgument(format!(
                "misaligned register offset {offset:#x}"
            )));
        }
        Ok(self.mmio.read32(offset))
    }

    pub fn write(&self, offset: u32, value: u32) -> Result<()> {
        if offset % 4 != 0 {
            return Err(GpuError::InvalidArgument(format!(
                "misaligned register offset {offset:#x}"
            )));
        }
        self.mmio.write32(offset, value);
        Ok(())
    }

    #[inline]
    fn rd(&self, offset: u32) -> u32 {
        self.mmio.read32(offset)
    }

    #[inline]
    fn wr(&self, offset: u32, value: u32) {
        self.mmio.write32(offset, value);
    }

    pub fn version(&self) -> Version {
        Version::from_raw(self.rd(mmio::VERSION))
    }

    pub fn version_raw(&self) -> u32 {
        self.rd(mmio::VERSION)
    }

    pub fn caps(&self) -> u32 {
        self.rd(mmio::CAPS)
    }

    pub fn control(&self) -> u32 {
        self.rd(mmio::CONTROL)
    }

    pub fn set_control(&self, value: u32) {
        self.wr(mmio::CONTROL, value);
    }

    pub fn status(&self) -> u32 {
        self.rd(mmio::STATUS)
    }

    pub fn scratch(&self) -> u32 {
        self.rd(mmio::SCRATCH)
    }

    pub fn set_scratch(&self, value: u32) {
        self.wr(mmio::SCRATCH, value);
    }

    pub fn irq_status(&self) -> u32 {
        self.rd(mmio::IRQ_STATUS)
    }

    pub fn irq_ack(&self, mask: u32) {
        self.wr(mmio::IRQ_ACK, mask);
    }

    pub fn irq_enabled(&self) -> u32 {
        self.rd(mmio::IRQ_ENABLE)
    }

    pub fn set_irq_enable(&self, mask: u32) {
        self.wr(mmio::IRQ_ENABLE, mask);
    }

    fn bank_reg(base: u32, queue: u32) -> u32 {
        debug_assert!(queue < MAX_BANKED_QUEUES);
        base + queue * mmio::CMD_BANK_STRIDE
    }

    pub fn cmd_base(&self, queue: u32) -> u32 {
        self.rd(Self::bank_reg(mmio::CMD_BASE, queue))
    }

    pub fn set_cmd_base(&self, queue: u32, value: u32) {
        self.wr(Self::bank_reg(mmio::CMD_BASE, queue), value);
    }

    pub fn cmd_size(&self, queue: u32) -> u32 {
        self.rd(Self::bank_reg(mmio::CMD_SIZE, queue))
    }

    pub fn set_cmd_size(&self, queue: u32, value: u32) {
        self.wr(Self::bank_reg(mmio::CMD_SIZE, queue), value);
    }

    /// Volatile read of the device-owned read pointer, in dwords.
    pub fn cmd_head(&self, queue: u32) -> u32 {
        self.rd(Self::bank_reg(mmio::CMD_HEAD, queue))
    }

    /// Host writes of `CMD_HEAD` are only legal during ring init and resume,
    /// while the queue is quiesced.
    pub fn set_cmd_head(&self, queue: u32, value: u32) {
        self.wr(Self::bank_reg(mmio::CMD_HEAD, queue), value);
    }

    pub fn cmd_tail(&self, queue: u32) -> u32 {
        self.rd(Self::bank_reg(mmio::CMD_TAIL, queue))
    }

    pub fn set_cmd_tail(&self, queue: u32, value: u32) {
        self.wr(Self::bank_reg(mmio::CMD_TAIL, queue), value);
    }

    /// Rings the per-queue doorbell. Callers must have already published the
    /// new tail; the barrier here only orders the tail write against the
    /// doorbell itself.
    pub fn ring_doorbell(&self, queue: u32) {
        debug_assert!(queue < MAX_QUEUES);
        wmb();
        self.wr(mmio::DOORBELL_BASE + queue * mmio::DOORBELL_STRIDE, 1);
    }

    pub fn fence_addr(&self) -> u32 {
        self.rd(mmio::FENCE_ADDR)
    }

    pub fn set_fence_addr(&self, value: u32) {
        self.wr(mmio::FENCE_ADDR, value);
    }

    /// Most recent fence value the device has written.
    pub fn fence_value(&self) -> u32 {
        self.rd(mmio::FENCE_VALUE)
    }
}

impl std::fmt::Debug for Registers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registers").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlatMmio {
        words: Vec<AtomicU32>,
    }

    impl FlatMmio {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                words: (0..0x1000).map(|_| AtomicU32::new(0)).collect(),
            })
        }
    }

    impl MmioSpace for FlatMmio {
        fn read32(&self, offset: u32) -> u32 {
            self.words[(offset / 4) as usize].load(Ordering::SeqCst)
        }

        fn write32(&self, offset: u32, value: u32) {
            self.words[(offset / 4) as usize].store(value, Ordering::SeqCst);
        }
    }

    #[test]
    fn version_unpacks_packed_fields() {
        let v = Version::from_raw(0x0102_0304);
        assert_eq!(
            v,
            Version {
                major: 1,
                minor: 2,
                patch: 3,
                build: 4
            }
        );
        assert_eq!(v.to_raw(), 0x0102_0304);
        assert_eq!(v.to_string(), "1.2.3.4");
    }

    #[test]
    fn queue_banks_use_the_documented_stride() {
        let regs = Registers::new(FlatMmio::new());
        regs.set_cmd_base(1, 0xAB00);
        assert_eq!(regs.read(0x0050).unwrap(), 0xAB00);
        regs.set_cmd_tail(1, 7);
        assert_eq!(regs.read(0x005C).unwrap(), 7);
        // Queue 0 bank is untouched.
        assert_eq!(regs.cmd_base(0), 0);
        assert_eq!(regs.cmd_tail(0), 0);
    }

    #[test]
    fn banked_queues_stop_short_of_the_fence_block() {
        assert!(
            mmio::CMD_BASE + MAX_BANKED_QUEUES * mmio::CMD_BANK_STRIDE <= mmio::FENCE_ADDR,
            "queue banks must not overlap the fence registers"
        );
    }

    #[test]
    fn misaligned_offsets_are_rejected() {
        let regs = Registers::new(FlatMmio::new());
        assert!(matches!(
            regs.read(0x0002),
            Err(GpuError::InvalidArgument(_))
        ));
        assert!(matches!(
            regs.write(0x0046, 1),
            Err(GpuError::InvalidArgument(_))
        ));
    }
}
