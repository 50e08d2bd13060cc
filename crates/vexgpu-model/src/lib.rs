#![forbid(unsafe_code)]

//! Software model of the VexGPU device.
//!
//! [`SoftGpu`] implements the driver's platform traits ([`MmioSpace`],
//! [`DmaAllocator`], [`IrqLine`]) over a register file, a flat guest memory
//! and a consumption-engine thread that drains command rings, executes
//! records, writes fence cells and raises the interrupt line. It is close
//! enough to the FPGA's behavior to exercise every driver path, including
//! the ugly ones: [`SoftGpu::wedge`] freezes consumption while still
//! reporting BUSY, [`SoftGpu::inject_error`] latches STATUS.ERROR, and
//! [`SoftGpu::fail_heartbeat`] corrupts scratch readback.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, trace};

use vexgpu::cmd::Opcode;
use vexgpu::error::{GpuError, Result};
use vexgpu::hal::{BusMemory, DmaAllocator, DmaRegion, IrqLine, MmioSpace};
use vexgpu::regs::{caps, control, irq_bits, mmio, status, MAX_BANKED_QUEUES};

/// First bus address handed out by the allocator; zero stays unmapped so
/// null-looking addresses never alias real memory.
const DMA_FIRST_ADDR: u64 = 0x1000;

const INSTR_MEM_WORDS: usize = (mmio::INSTR_MEM_SIZE / 4) as usize;

#[derive(Clone, Debug)]
pub struct SoftGpuConfig {
    /// Guest memory backing DMA-coherent allocations.
    pub mem_bytes: usize,
    /// Raw VERSION register value.
    pub version: u32,
    /// CAPS register value.
    pub caps: u32,
    /// Engine poll interval when no doorbell wakes it early.
    pub step_interval: Duration,
}

impl Default for SoftGpuConfig {
    fn default() -> Self {
        Self {
            mem_bytes: 8 * 1024 * 1024,
            version: 0x0103_0000, // 1.3.0.0
            caps: caps::VERTEX_SHADER
                | caps::FRAGMENT_SHADER
                | caps::FENCE
                | caps::MULTI_QUEUE,
            step_interval: Duration::from_micros(100),
        }
    }
}

/// Flat dword-granular guest memory shared between the "device" and the
/// host. Out-of-range reads return zero and writes are dropped, like a
/// forgiving bus.
pub struct SharedMemory {
    words: Vec<std::sync::atomic::AtomicU32>,
}

impl SharedMemory {
    fn new(bytes: usize) -> Self {
        Self {
            words: (0..bytes / 4)
                .map(|_| std::sync::atomic::AtomicU32::new(0))
                .collect(),
        }
    }

    fn word(&self, bus_addr: u64) -> Option<&std::sync::atomic::AtomicU32> {
        if bus_addr % 4 != 0 {
            return None;
        }
        self.words.get((bus_addr / 4) as usize)
    }
}

impl BusMemory for SharedMemory {
    fn read_u32(&self, bus_addr: u64) -> u32 {
        self.word(bus_addr).map_or(0, |w| w.load(Ordering::SeqCst))
    }

    fn write_u32(&self, bus_addr: u64, value: u32) {
        if let Some(word) = self.word(bus_addr) {
            word.store(value, Ordering::SeqCst);
        }
    }
}

#[derive(Default)]
struct RegFile {
    control: u32,
    scratch: u32,
    irq_status: u32,
    irq_enable: u32,
    cmd_base: [u32; MAX_BANKED_QUEUES as usize],
    cmd_size: [u32; MAX_BANKED_QUEUES as usize],
    cmd_head: [u32; MAX_BANKED_QUEUES as usize],
    cmd_tail: [u32; MAX_BANKED_QUEUES as usize],
    fence_addr: u32,
    fence_value: u32,
    vertex_base: u32,
    vertex_count: u32,
    vertex_stride: u32,
    shader_pc: u32,
    shader_addr: u32,
    shader_ctrl: u32,
    instr_mem: Vec<u32>,
    in_reset: bool,
    error: bool,
    halted: bool,
}

impl RegFile {
    fn new() -> Self {
        Self {
            instr_mem: vec![0; INSTR_MEM_WORDS],
            ..Default::default()
        }
    }

    fn any_ring_pending(&self) -> bool {
        (0..MAX_BANKED_QUEUES as usize).any(|q| {
            self.cmd_base[q] != 0
                && self.cmd_size[q] >= 4
                && self.cmd_head[q] != self.cmd_tail[q]
        })
    }

    fn status_bits(&self) -> u32 {
        if self.in_reset {
            return 0;
        }
        let busy = self.any_ring_pending();
        let mut bits = 0;
        if !busy {
            bits |= status::IDLE;
        } else {
            bits |= status::BUSY;
        }
        if self.error {
            bits |= status::ERROR;
        }
        if self.halted {
            bits |= status::HALTED;
        }
        if !self.any_ring_pending() {
            bits |= status::CMD_EMPTY;
        }
        bits
    }

    /// Device-side reset: drop wedges and pointers; configuration registers
    /// come back through the driver's restore path.
    fn reset(&mut self) {
        let instr_mem = std::mem::take(&mut self.instr_mem);
        *self = Self {
            instr_mem,
            in_reset: true,
            ..Default::default()
        };
    }
}

struct Engine {
    wake: Mutex<bool>,
    cv: Condvar,
}

struct SoftInner {
    config: SoftGpuConfig,
    mem: Arc<SharedMemory>,
    regs: Mutex<RegFile>,
    handler: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    engine: Engine,
    stop: AtomicBool,
    wedged: AtomicBool,
    scratch_fault: AtomicBool,
    next_alloc: AtomicU64,
    executed: AtomicU64,
}

impl SoftInner {
    fn wake_engine(&self) {
        let mut wake = self.engine.wake.lock().unwrap();
        *wake = true;
        self.engine.cv.notify_all();
    }

    /// Latches `bits` into IRQ_STATUS and fires the line for enabled ones.
    /// The handler runs without any model lock held.
    fn raise_irq(&self, bits: u32) {
        let fire = {
            let mut regs = self.regs.lock().unwrap();
            regs.irq_status |= bits;
            bits & regs.irq_enable != 0
        };
        if fire {
            let handler = self.handler.lock().unwrap().clone();
            if let Some(handler) = handler {
                handler();
            }
        }
    }

    fn read_reg(&self, offset: u32) -> u32 {
        let regs = self.regs.lock().unwrap();
        match offset {
            mmio::VERSION => self.config.version,
            mmio::CAPS => self.config.caps,
            mmio::CONTROL => regs.control,
            mmio::STATUS => regs.status_bits(),
            mmio::SCRATCH => {
                if self.scratch_fault.load(Ordering::SeqCst) {
                    !regs.scratch
                } else {
                    regs.scratch
                }
            }
            mmio::IRQ_STATUS => regs.irq_status,
            mmio::IRQ_ENABLE => regs.irq_enable,
            mmio::FENCE_ADDR => regs.fence_addr,
            mmio::FENCE_VALUE => regs.fence_value,
            mmio::VERTEX_BASE => regs.vertex_base,
            mmio::VERTEX_COUNT => regs.vertex_count,
            mmio::VERTEX_STRIDE => regs.vertex_stride,
            mmio::SHADER_PC => regs.shader_pc,
            mmio::SHADER_ADDR => regs.shader_addr,
            mmio::SHADER_DATA => regs
                .instr_mem
                .get(regs.shader_addr as usize)
                .copied()
                .unwrap_or(0),
            mmio::SHADER_CTRL => regs.shader_ctrl,
            _ => {
                if let Some((queue, reg)) = decode_bank(offset) {
                    match reg {
                        mmio::CMD_BASE => regs.cmd_base[queue],
                        mmio::CMD_SIZE => regs.cmd_size[queue],
                        mmio::CMD_HEAD => regs.cmd_head[queue],
                        mmio::CMD_TAIL => regs.cmd_tail[queue],
                        _ => 0,
                    }
                } else {
                    0
                }
            }
        }
    }

    fn write_reg(&self, offset: u32, value: u32) {
        // Doorbells only wake the engine; no register state changes.
        if (mmio::DOORBELL_BASE
            ..mmio::DOORBELL_BASE + vexgpu::regs::MAX_QUEUES * mmio::DOORBELL_STRIDE)
            .contains(&offset)
        {
            trace!(offset = format_args!("{offset:#x}"), "doorbell");
            self.wake_engine();
            return;
        }

        let mut regs = self.regs.lock().unwrap();
        match offset {
            mmio::CONTROL => {
                if value & control::RESET != 0 {
                    debug!("model reset asserted");
                    regs.reset();
                    self.wedged.store(false, Ordering::SeqCst);
                    self.scratch_fault.store(false, Ordering::SeqCst);
                } else {
                    regs.in_reset = false;
                    regs.control = value;
                }
            }
            mmio::SCRATCH => regs.scratch = value,
            mmio::IRQ_ENABLE => regs.irq_enable = value,
            mmio::IRQ_ACK => regs.irq_status &= !value,
            mmio::FENCE_ADDR => regs.fence_addr = value,
            mmio::VERTEX_BASE => regs.vertex_base = value,
            mmio::VERTEX_COUNT => regs.vertex_count = value,
            mmio::VERTEX_STRIDE => regs.vertex_stride = value,
            mmio::SHADER_PC => regs.shader_pc = value,
            mmio::SHADER_ADDR => regs.shader_addr = value,
            mmio::SHADER_DATA => {
                let addr = regs.shader_addr as usize;
                if let Some(word) = regs.instr_mem.get_mut(addr) {
                    *word = value;
                }
            }
            mmio::SHADER_CTRL => regs.shader_ctrl = value,
            _ => {
                if let Some((queue, reg)) = decode_bank(offset) {
                    match reg {
                        mmio::CMD_BASE => regs.cmd_base[queue] = value,
                        mmio::CMD_SIZE => regs.cmd_size[queue] = value,
                        mmio::CMD_HEAD => regs.cmd_head[queue] = value,
                        mmio::CMD_TAIL => {
                            regs.cmd_tail[queue] = value;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// One engine pass: drain every enabled ring unless wedged or in reset.
    fn process_rings(&self) {
        for queue in 0..MAX_BANKED_QUEUES as usize {
            let mut consumed = false;
            loop {
                if self.wedged.load(Ordering::SeqCst) || self.stop.load(Ordering::SeqCst) {
                    return;
                }
                let (base, size_dw, head, tail, in_reset) = {
                    let regs = self.regs.lock().unwrap();
                    (
                        regs.cmd_base[queue],
                        regs.cmd_size[queue] / 4,
                        regs.cmd_head[queue],
                        regs.cmd_tail[queue],
                        regs.in_reset,
                    )
                };
                if in_reset || base == 0 || size_dw == 0 {
                    break;
                }
                let head = head % size_dw;
                let tail = tail % size_dw;
                if head == tail {
                    break;
                }

                let word = |i: u32| -> u32 {
                    self.mem
                        .read_u32(u64::from(base) + u64::from((head + i) % size_dw) * 4)
                };
                let raw = word(0);
                let opcode = raw as u8;
                // A zero-size record can never advance; flag it instead of
                // spinning.
                let mut size = (raw >> 8) as u8 as u32;
                if size == 0 {
                    self.regs.lock().unwrap().error = true;
                    self.raise_irq(irq_bits::ERROR);
                    size = 1;
                }

                if !self.execute(queue, opcode, size, &word) {
                    // An unmet WAIT stalls the queue; retry on a later pass
                    // without advancing the head.
                    break;
                }

                {
                    let mut regs = self.regs.lock().unwrap();
                    regs.cmd_head[queue] = (head + size) % size_dw;
                }
                self.executed.fetch_add(1, Ordering::SeqCst);
                consumed = true;
            }
            if consumed {
                self.raise_irq(irq_bits::CMD_COMPLETE | irq_bits::QUEUE_EMPTY);
            }
        }
    }

    /// Executes one record. Returns `false` when the record cannot retire
    /// yet (an unmet WAIT) so the ring head must not advance.
    fn execute(&self, queue: usize, opcode: u8, size_dw: u32, word: &dyn Fn(u32) -> u32) -> bool {
        match Opcode::from_u8(opcode) {
            // FENCE {header, addr, value}
            Some(Opcode::Fence) => {
                let addr = word(1);
                let value = word(2);
                self.mem.write_u32(u64::from(addr), value);
                {
                    let mut regs = self.regs.lock().unwrap();
                    regs.fence_value = value;
                }
                trace!(queue, addr = format_args!("{addr:#x}"), value, "fence written");
                self.raise_irq(irq_bits::FENCE);
                true
            }
            // WAIT {header, value} compares against the FENCE_VALUE mirror;
            // WAIT {header, addr, value} polls the named cell.
            Some(Opcode::Wait) => {
                if size_dw >= 3 {
                    let addr = u64::from(word(1));
                    let value = word(2);
                    self.mem.read_u32(addr) >= value
                } else {
                    let value = word(1);
                    self.regs.lock().unwrap().fence_value >= value
                }
            }
            // DMA {header, src, dst, size, flags}
            Some(Opcode::Dma) => {
                let src = u64::from(word(1));
                let dst = u64::from(word(2));
                let bytes = word(3);
                for i in 0..u64::from(bytes / 4) {
                    let v = self.mem.read_u32(src + i * 4);
                    self.mem.write_u32(dst + i * 4, v);
                }
                true
            }
            // REG_WRITE {header, offset, value}
            Some(Opcode::RegWrite) => {
                let offset = word(1);
                let value = word(2);
                self.write_reg(offset, value);
                true
            }
            // REG_READ {header, offset, dst}
            Some(Opcode::RegRead) => {
                let offset = word(1);
                let dst = u64::from(word(2));
                let value = self.read_reg(offset);
                self.mem.write_u32(dst, value);
                true
            }
            // NOP, DRAW, COMPUTE: nothing observable in the model.
            _ => true,
        }
    }

    fn engine_loop(&self) {
        debug!("model engine started");
        loop {
            {
                let mut wake = self.engine.wake.lock().unwrap();
                if !*wake {
                    let (guard, _timed_out) = self
                        .engine
                        .cv
                        .wait_timeout(wake, self.config.step_interval)
                        .unwrap();
                    wake = guard;
                }
                *wake = false;
            }
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            if self.wedged.load(Ordering::SeqCst) {
                continue;
            }
            self.process_rings();
        }
        debug!("model engine stopped");
    }
}

fn decode_bank(offset: u32) -> Option<(usize, u32)> {
    let end = mmio::CMD_BASE + MAX_BANKED_QUEUES * mmio::CMD_BANK_STRIDE;
    if !(mmio::CMD_BASE..end).contains(&offset) {
        return None;
    }
    let rel = offset - mmio::CMD_BASE;
    let queue = (rel / mmio::CMD_BANK_STRIDE) as usize;
    let reg = mmio::CMD_BASE + rel % mmio::CMD_BANK_STRIDE;
    Some((queue, reg))
}

pub struct SoftGpu {
    inner: Arc<SoftInner>,
    engine_thread: Mutex<Option<JoinHandle<()>>>,
}

impl SoftGpu {
    pub fn new(config: SoftGpuConfig) -> Arc<Self> {
        let mem = Arc::new(SharedMemory::new(config.mem_bytes));
        let inner = Arc::new(SoftInner {
            config,
            mem,
            regs: Mutex::new(RegFile::new()),
            handler: Mutex::new(None),
            engine: Engine {
                wake: Mutex::new(false),
                cv: Condvar::new(),
            },
            stop: AtomicBool::new(false),
            wedged: AtomicBool::new(false),
            scratch_fault: AtomicBool::new(false),
            next_alloc: AtomicU64::new(DMA_FIRST_ADDR),
            executed: AtomicU64::new(0),
        });
        let engine_thread = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("softgpu-engine".into())
                .spawn(move || inner.engine_loop())
                .expect("spawn model engine")
        };
        Arc::new(Self {
            inner,
            engine_thread: Mutex::new(Some(engine_thread)),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(SoftGpuConfig::default())
    }

    /// Direct handle to guest memory, for test fixtures.
    pub fn memory(&self) -> Arc<SharedMemory> {
        Arc::clone(&self.inner.mem)
    }

    /// Freezes command consumption while still reporting BUSY for pending
    /// work: the classic hang. Cleared by [`SoftGpu::unwedge`] or a device
    /// reset.
    pub fn wedge(&self) {
        self.inner.wedged.store(true, Ordering::SeqCst);
    }

    pub fn unwedge(&self) {
        self.inner.wedged.store(false, Ordering::SeqCst);
        self.inner.wake_engine();
    }

    pub fn is_wedged(&self) -> bool {
        self.inner.wedged.load(Ordering::SeqCst)
    }

    /// Latches STATUS.ERROR and raises the ERROR interrupt.
    pub fn inject_error(&self) {
        self.inner.regs.lock().unwrap().error = true;
        self.inner.raise_irq(irq_bits::ERROR);
    }

    /// Makes scratch reads return the bitwise inverse of the stored value,
    /// so every heartbeat misses. Cleared by a device reset.
    pub fn fail_heartbeat(&self, broken: bool) {
        self.inner.scratch_fault.store(broken, Ordering::SeqCst);
    }

    /// Records executed since power-on.
    pub fn executed_records(&self) -> u64 {
        self.inner.executed.load(Ordering::SeqCst)
    }

    /// Most recent fence value the model wrote.
    pub fn fence_value(&self) -> u32 {
        self.inner.regs.lock().unwrap().fence_value
    }

    pub fn instr_word(&self, index: usize) -> u32 {
        self.inner
            .regs
            .lock()
            .unwrap()
            .instr_mem
            .get(index)
            .copied()
            .unwrap_or(0)
    }
}

impl Drop for SoftGpu {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        self.inner.wake_engine();
        if let Some(thread) = self.engine_thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

impl MmioSpace for SoftGpu {
    fn read32(&self, offset: u32) -> u32 {
        self.inner.read_reg(offset)
    }

    fn write32(&self, offset: u32, value: u32) {
        self.inner.write_reg(offset, value);
    }
}

impl DmaAllocator for SoftGpu {
    fn alloc_coherent(&self, bytes: usize) -> Result<DmaRegion> {
        if bytes == 0 || bytes % 4 != 0 {
            return Err(GpuError::InvalidArgument(format!(
                "bad coherent allocation size {bytes}"
            )));
        }
        // Page-align every allocation; a bump allocator is plenty for a
        // device model.
        let aligned = (bytes + 0xFFF) & !0xFFF;
        let addr = self
            .inner
            .next_alloc
            .fetch_add(aligned as u64, Ordering::SeqCst);
        if addr + bytes as u64 > self.inner.config.mem_bytes as u64 {
            return Err(GpuError::OutOfMemory);
        }
        let region = DmaRegion::new(self.memory(), addr, bytes);
        region.fill(0);
        Ok(region)
    }
}

impl IrqLine for SoftGpu {
    fn attach(&self, handler: Arc<dyn Fn() + Send + Sync>) {
        *self.inner.handler.lock().unwrap() = Some(handler);
    }

    fn detach(&self) {
        *self.inner.handler.lock().unwrap() = None;
    }
}
