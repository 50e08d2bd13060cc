//! Device context and lifecycle controller.
//!
//! [`VexGpu`] owns the register window, the interrupt registration, the fence
//! engine, the rings, the scheduler and the health/reset machinery. Exactly
//! one exists per physical device; every subsystem receives the shared core
//! as a handle, never through process-wide state.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use tracing::{debug, error, info, trace, warn};

use crate::cmd::{fence_record, RING_SIZE_MAX};
use crate::error::{GpuError, Result};
use crate::fence::FenceEngine;
use crate::hal::{DmaAllocator, IrqLine, MmioSpace};
use crate::irq::IrqCore;
use crate::regs::{caps, control, irq_bits, status, Registers, Version, MAX_BANKED_QUEUES};
use crate::reset::{
    hw_reset, scratch_probe, HealthMonitor, HealthStats, ResetEngine, ResetGate, ResetRequest,
    SavedRegs,
};
use crate::ring::{CommandRing, SpaceWait};
use crate::sched::{JobParams, JobState, JobType, Priority, SchedStats, Scheduler};
use crate::shader::{ShaderMem, ShaderType};
use crate::validate::validate_stream;

/// Interrupts the driver services in normal operation.
const DEFAULT_IRQ_MASK: u32 =
    irq_bits::CMD_COMPLETE | irq_bits::ERROR | irq_bits::FENCE | irq_bits::QUEUE_EMPTY;

/// Per-device tunables. Defaults match the hardware bring-up values; tests
/// shrink the timing knobs.
#[derive(Clone, Debug)]
pub struct VexGpuConfig {
    /// Ring size per queue in bytes; rounded up to a power of two.
    pub ring_size_bytes: usize,
    /// Hardware pipeline depth per queue.
    pub queue_depth: u32,
    /// Applied when a submission passes `timeout_ms == 0`.
    pub default_job_timeout: Duration,
    /// Budget for a scheduler submission waiting on ring space.
    pub ring_wait: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_miss_threshold: u32,
    pub hang_check_interval: Duration,
    pub hang_timeout: Duration,
    pub timeout_sweep_interval: Duration,
    /// Ring drain budget during suspend and reset quiesce.
    pub drain_timeout: Duration,
    /// How long the reset bit is held asserted.
    pub reset_hold: Duration,
    /// Budget for STATUS.IDLE after deasserting reset.
    pub reset_poll_timeout: Duration,
    /// Run the self-test at the end of probe.
    pub run_selftest: bool,
}

impl Default for VexGpuConfig {
    fn default() -> Self {
        Self {
            ring_size_bytes: 4096,
            queue_depth: 16,
            default_job_timeout: Duration::from_secs(10),
            ring_wait: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_miss_threshold: 3,
            hang_check_interval: Duration::from_secs(2),
            hang_timeout: Duration::from_secs(5),
            timeout_sweep_interval: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(1),
            reset_hold: Duration::from_millis(10),
            reset_poll_timeout: Duration::from_secs(1),
            run_selftest: false,
        }
    }
}

/// The platform bindings a device instance is probed against.
#[derive(Clone)]
pub struct GpuPlatform {
    pub mmio: Arc<dyn MmioSpace>,
    pub dma: Arc<dyn DmaAllocator>,
    pub irq: Arc<dyn IrqLine>,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SubmitFlags: u32 {
        /// Wait for completion before returning.
        const SYNC = 1 << 0;
        /// The submitting context may carry privileged opcodes.
        const PRIVILEGED = 1 << 1;
    }
}

/// How a submission signals completion through fence memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FenceMode {
    /// No fence record is appended.
    #[default]
    None,
    /// The device picks the queue's fence cell and the next sequence number.
    Auto,
    /// Caller-provided cell and value; the pair must target the fence page.
    Explicit { addr: u64, value: u32 },
}

#[derive(Clone, Debug, Default)]
pub struct SubmitRequest {
    /// Untrusted command stream, dword-aligned.
    pub commands: Vec<u32>,
    /// Target queue; auto-selected from the job type when `None`.
    pub queue: Option<u32>,
    pub priority: Priority,
    /// Per-job timeout in milliseconds; 0 selects the configured default.
    pub timeout_ms: u32,
    pub fence: FenceMode,
    pub flags: SubmitFlags,
    /// Jobs that must reach a terminal state before this one may start.
    pub deps: Vec<u64>,
}

/// What a successful submission hands back to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobTicket {
    pub job_id: u64,
    /// Fence `(addr, value)` the job signals, when one was requested.
    pub fence: Option<(u64, u32)>,
}

/// Decoded identity and capability view of the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub version: Version,
    pub caps: u32,
    pub num_queues: u32,
    pub has_fence: bool,
    pub has_multi_queue: bool,
    pub has_preemption: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingStats {
    pub queue_id: u32,
    pub submitted_cmds: u64,
    pub completed_cmds: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub sched: SchedStats,
    pub rings: Vec<RingStats>,
    pub reset_count: u32,
    pub health: HealthStats,
    pub hard_irqs: u64,
    pub irq_dispatches: u64,
    pub shader_halts: u64,
    pub perf_overflows: u64,
}

/// Shared guts of a device instance. Owned by [`VexGpu`], handed to the
/// scheduler, reset engine, health monitor and the IRQ bottom half.
pub(crate) struct DeviceCore {
    pub(crate) regs: Registers,
    pub(crate) config: VexGpuConfig,
    pub(crate) version: Version,
    pub(crate) caps: u32,
    pub(crate) num_queues: u32,
    rings: RwLock<Vec<Arc<CommandRing>>>,
    /// Guards the producer side of every ring across write + kick.
    cmd_lock: Mutex<()>,
    pub(crate) space_wait: SpaceWait,
    pub(crate) fence: FenceEngine,
    pub(crate) irq: Arc<IrqCore>,
    pub(crate) in_reset: AtomicBool,
    pub(crate) suspended: AtomicBool,
    pub(crate) dead: AtomicBool,
    pub(crate) reset_count: AtomicU32,
    pub(crate) reset_request: ResetRequest,
    pub(crate) reset_gate: ResetGate,
    /// Registers captured at suspend, restored on resume.
    saved: Mutex<Option<SavedRegs>>,
    pub(crate) shader_halts: AtomicU64,
    pub(crate) perf_overflows: AtomicU64,
}

impl DeviceCore {
    pub(crate) fn ring(&self, queue_id: u32) -> Option<Arc<CommandRing>> {
        self.rings
            .read()
            .unwrap()
            .iter()
            .find(|r| r.queue_id() == queue_id)
            .cloned()
    }

    pub(crate) fn rings_snapshot(&self) -> Vec<Arc<CommandRing>> {
        self.rings.read().unwrap().clone()
    }

    fn add_ring(&self, ring: Arc<CommandRing>) {
        self.rings.write().unwrap().push(ring);
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Gate for caller-context submissions.
    pub(crate) fn accepting_submissions(&self) -> Result<()> {
        if self.is_dead() {
            return Err(GpuError::Hardware);
        }
        if self.in_reset.load(Ordering::Acquire) || self.suspended.load(Ordering::Acquire) {
            return Err(GpuError::Busy);
        }
        Ok(())
    }

    /// Gate for the scheduler worker starting hardware work.
    pub(crate) fn accepting_dispatch(&self) -> bool {
        !self.is_dead()
            && !self.in_reset.load(Ordering::Acquire)
            && !self.suspended.load(Ordering::Acquire)
    }

    /// Writes a validated payload (plus its optional fence record) into the
    /// queue's ring and kicks the doorbell. Holds the command lock for the
    /// whole write + kick so no other producer interleaves.
    pub(crate) fn submit_payload(
        &self,
        queue_id: u32,
        payload: &[u32],
        fence: Option<(u64, u32)>,
    ) -> Result<()> {
        let ring = self.ring(queue_id).ok_or(GpuError::NotFound)?;
        let record = fence.map(|(addr, value)| fence_record(addr as u32, value));
        let needed = payload.len() as u32 + record.map_or(0, |r| r.len() as u32);

        let _cmd = self.cmd_lock.lock().unwrap();
        ring.wait_space(&self.regs, &self.space_wait, needed, self.config.ring_wait)?;
        ring.write(payload);
        if let Some(record) = record {
            ring.write(&record);
        }
        ring.kick(&self.regs);
        trace!(queue = queue_id, dwords = needed, "payload on ring");
        Ok(())
    }

    /// Idempotent: requests while a reset is pending or running collapse
    /// into one cycle.
    pub(crate) fn request_reset(&self) {
        if self.is_dead() || self.in_reset.load(Ordering::Acquire) {
            return;
        }
        self.reset_request.request();
    }
}

pub struct VexGpu {
    core: Arc<DeviceCore>,
    sched: Arc<Scheduler>,
    reset: Arc<ResetEngine>,
    health: Arc<HealthMonitor>,
    irq_line: Arc<dyn IrqLine>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl VexGpu {
    /// Brings the device up: register sanity, hardware reset, interrupt
    /// install (masked), fence engine, rings, scheduler, health, unmask,
    /// optional self-test. Fails cleanly: everything initialized before the
    /// failing step is torn back down.
    pub fn probe(platform: GpuPlatform, config: VexGpuConfig) -> Result<Self> {
        let regs = Registers::new(Arc::clone(&platform.mmio));

        // Identity sanity before touching anything else.
        let raw_version = regs.version_raw();
        if raw_version == 0 || raw_version == u32::MAX {
            error!(raw_version, "no device behind the register window");
            return Err(GpuError::Hardware);
        }

        hw_reset(&regs, config.reset_hold, config.reset_poll_timeout)?;
        scratch_probe(&regs)?;

        let version = regs.version();
        let caps_raw = regs.caps();
        let num_queues = if caps_raw & caps::MULTI_QUEUE != 0 {
            MAX_BANKED_QUEUES
        } else {
            1
        };
        info!(%version, caps = format_args!("{caps_raw:#x}"), num_queues, "vexgpu probed");

        // Interrupt core: handler installed now, IRQ_ENABLE stays zero until
        // the end of probe.
        let irq = Arc::new(IrqCore::new());
        {
            let irq = Arc::clone(&irq);
            let handler_regs = regs.clone();
            platform
                .irq
                .attach(Arc::new(move || {
                    irq.hard_irq(&handler_regs);
                }));
        }

        let fence = match FenceEngine::new(&regs, platform.dma.as_ref()) {
            Ok(fence) => fence,
            Err(err) => {
                platform.irq.detach();
                return Err(err);
            }
        };

        let ring0 = match CommandRing::create(
            &regs,
            platform.dma.as_ref(),
            0,
            config.ring_size_bytes,
        ) {
            Ok(ring) => Arc::new(ring),
            Err(err) => {
                fence.release(&regs);
                platform.irq.detach();
                return Err(err);
            }
        };

        let core = Arc::new(DeviceCore {
            regs: regs.clone(),
            config: config.clone(),
            version,
            caps: caps_raw,
            num_queues,
            rings: RwLock::new(vec![ring0]),
            cmd_lock: Mutex::new(()),
            space_wait: SpaceWait::new(),
            fence,
            irq: Arc::clone(&irq),
            in_reset: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            reset_count: AtomicU32::new(0),
            reset_request: ResetRequest::new(),
            reset_gate: ResetGate::new(),
            saved: Mutex::new(None),
            shader_halts: AtomicU64::new(0),
            perf_overflows: AtomicU64::new(0),
        });

        // Scheduler bring-up owns the remaining queues.
        for queue_id in 1..num_queues {
            match CommandRing::create(&regs, platform.dma.as_ref(), queue_id, config.ring_size_bytes)
            {
                Ok(ring) => core.add_ring(Arc::new(ring)),
                Err(err) => {
                    for ring in core.rings_snapshot() {
                        ring.release(&regs);
                    }
                    core.fence.release(&regs);
                    platform.irq.detach();
                    return Err(err);
                }
            }
        }
        let sched = Scheduler::new(Arc::clone(&core));
        let reset = ResetEngine::new(Arc::clone(&core), Arc::clone(&sched));
        let health = HealthMonitor::new(Arc::clone(&core));

        let mut threads = Vec::new();
        {
            let sched = Arc::clone(&sched);
            threads.push(
                std::thread::Builder::new()
                    .name("vexgpu-sched".into())
                    .spawn(move || sched.worker_loop())
                    .expect("spawn scheduler worker"),
            );
        }
        {
            let reset = Arc::clone(&reset);
            threads.push(
                std::thread::Builder::new()
                    .name("vexgpu-reset".into())
                    .spawn(move || reset.worker_loop())
                    .expect("spawn reset worker"),
            );
        }
        {
            let health = Arc::clone(&health);
            threads.push(
                std::thread::Builder::new()
                    .name("vexgpu-health".into())
                    .spawn(move || health.worker_loop())
                    .expect("spawn health monitor"),
            );
        }
        {
            let core = Arc::clone(&core);
            let sched = Arc::clone(&sched);
            threads.push(
                std::thread::Builder::new()
                    .name("vexgpu-irq".into())
                    .spawn(move || irq_bottom_half(core, sched))
                    .expect("spawn irq bottom half"),
            );
        }

        regs.set_control(control::ENABLE);
        regs.set_irq_enable(DEFAULT_IRQ_MASK);

        let device = Self {
            core,
            sched,
            reset,
            health,
            irq_line: Arc::clone(&platform.irq),
            threads: Mutex::new(threads),
            shut_down: AtomicBool::new(false),
        };

        if config.run_selftest {
            if let Err(err) = device.self_test() {
                error!(%err, "probe-time self-test failed");
                device.shutdown();
                return Err(GpuError::Hardware);
            }
        }

        Ok(device)
    }

    /// Validates and schedules a command stream. With [`SubmitFlags::SYNC`]
    /// the call also waits for the job using its own timeout.
    pub fn submit(&self, req: SubmitRequest) -> Result<JobTicket> {
        self.core.accepting_submissions()?;

        if req.commands.is_empty() {
            return Err(GpuError::InvalidArgument("empty command buffer".into()));
        }
        if req.commands.len() * 4 > RING_SIZE_MAX {
            return Err(GpuError::InvalidArgument(format!(
                "command buffer of {} dwords exceeds the ring maximum",
                req.commands.len()
            )));
        }

        // Validation happens on this kernel-owned copy; the payload is never
        // read again from caller memory.
        let mut payload = req.commands;
        validate_stream(
            &self.core.regs,
            &mut payload,
            req.flags.contains(SubmitFlags::PRIVILEGED),
        )?;

        let ty = JobType::classify(&payload);
        let queue_id = match req.queue {
            Some(q) if q < self.sched.num_queues() => q,
            Some(q) => {
                return Err(GpuError::InvalidArgument(format!(
                    "queue {q} does not exist"
                )))
            }
            None => self.sched.auto_queue(ty),
        };

        let fence = match req.fence {
            FenceMode::None => None,
            FenceMode::Auto => {
                let value = self.core.fence.next();
                Some((self.core.fence.cell_addr(queue_id), value))
            }
            FenceMode::Explicit { addr, value } => {
                self.core.fence.check_emit(addr, value)?;
                Some((addr, value))
            }
        };

        let timeout = if req.timeout_ms == 0 {
            self.core.config.default_job_timeout
        } else {
            Duration::from_millis(u64::from(req.timeout_ms))
        };

        let job = self.sched.submit(JobParams {
            payload,
            ty,
            priority: req.priority,
            queue_id,
            fence,
            timeout,
            deps: req.deps,
        })?;
        let ticket = JobTicket {
            job_id: job.id(),
            fence: job.fence(),
        };

        if req.flags.contains(SubmitFlags::SYNC) {
            job.wait(Some(Instant::now() + timeout))?;
        }
        Ok(ticket)
    }

    /// Waits for a job's completion latch. `timeout_ms == 0` polls once.
    /// Timing out leaves the job state untouched.
    pub fn wait_job(&self, job_id: u64, timeout_ms: u32) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
        self.sched.wait_job(job_id, Some(deadline))
    }

    pub fn job_state(&self, job_id: u64) -> Result<JobState> {
        self.sched
            .job(job_id)
            .map(|job| job.state())
            .ok_or(GpuError::NotFound)
    }

    /// Cancels a job that has not started running.
    pub fn cancel_job(&self, job_id: u64) -> Result<()> {
        self.sched.cancel(job_id)
    }

    /// Declares that `dependent` must not start before `predecessor`
    /// finishes.
    pub fn add_job_dependency(&self, dependent: u64, predecessor: u64) -> Result<()> {
        self.sched.add_dependency(dependent, predecessor)
    }

    /// Whether the fence cell at `addr` has reached `expected`.
    pub fn fence_signaled(&self, addr: u64, expected: u32) -> bool {
        self.core.fence.signaled(addr, expected)
    }

    /// Blocks until `(addr, expected)` signals; `timeout_ms == 0` waits
    /// indefinitely.
    pub fn wait_fence(&self, addr: u64, expected: u32, timeout_ms: u32) -> Result<()> {
        self.core.fence.wait(addr, expected, timeout_ms)
    }

    /// Bus address of a queue's fence cell.
    pub fn fence_cell_addr(&self, queue_id: u32) -> u64 {
        self.core.fence.cell_addr(queue_id)
    }

    /// Schedules a recovery cycle; no-op while one is already pending.
    pub fn schedule_reset(&self) {
        self.core.request_reset();
    }

    /// Blocks until no reset is in flight. `timeout_ms == 0` polls once.
    pub fn wait_reset(&self, timeout_ms: u32) -> Result<()> {
        self.core
            .reset_gate
            .wait(Duration::from_millis(u64::from(timeout_ms)))
    }

    pub fn reset_count(&self) -> u32 {
        self.core.reset_count.load(Ordering::Acquire)
    }

    pub fn is_dead(&self) -> bool {
        self.core.is_dead()
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            version: self.core.version,
            caps: self.core.caps,
            num_queues: self.core.num_queues,
            has_fence: self.core.caps & caps::FENCE != 0,
            has_multi_queue: self.core.caps & caps::MULTI_QUEUE != 0,
            has_preemption: self.core.caps & caps::PREEMPTION != 0,
        }
    }

    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            sched: self.sched.stats(),
            rings: self
                .core
                .rings_snapshot()
                .iter()
                .map(|ring| RingStats {
                    queue_id: ring.queue_id(),
                    submitted_cmds: ring.submitted_cmds(),
                    completed_cmds: ring.completed_cmds(),
                })
                .collect(),
            reset_count: self.reset_count(),
            health: self.health.stats(),
            hard_irqs: self.core.irq.hard_irq_count(),
            irq_dispatches: self.core.irq.dispatch_count(),
            shader_halts: self.core.shader_halts.load(Ordering::Relaxed),
            perf_overflows: self.core.perf_overflows.load(Ordering::Relaxed),
        }
    }

    /// Loads a shader program into instruction memory.
    pub fn load_shader(&self, offset_words: u32, words: &[u32]) -> Result<()> {
        self.core.accepting_submissions()?;
        ShaderMem::new().load(&self.core.regs, offset_words, words)
    }

    pub fn bind_shader(&self, slot: u32, ty: ShaderType) -> Result<()> {
        self.core.accepting_submissions()?;
        ShaderMem::new().bind(&self.core.regs, slot, ty)
    }

    pub fn set_shader_entry(&self, pc: u32) -> Result<()> {
        self.core.accepting_submissions()?;
        ShaderMem::new().set_entry(&self.core.regs, pc)
    }

    /// Starts the hardware performance counters and their overflow
    /// interrupt.
    pub fn enable_perf_counters(&self) -> Result<()> {
        self.core.accepting_submissions()?;
        let regs = &self.core.regs;
        regs.set_control(regs.control() | control::PERF_COUNTER);
        regs.set_irq_enable(regs.irq_enabled() | irq_bits::PERF_COUNTER);
        debug!("performance counters enabled");
        Ok(())
    }

    pub fn disable_perf_counters(&self) -> Result<()> {
        self.core.accepting_submissions()?;
        let regs = &self.core.regs;
        regs.set_control(regs.control() & !control::PERF_COUNTER);
        regs.set_irq_enable(regs.irq_enabled() & !irq_bits::PERF_COUNTER);
        Ok(())
    }

    /// Pulses the device cache-flush bit and orders prior coherent-memory
    /// stores against whatever the device reads next.
    pub fn flush_caches(&self) -> Result<()> {
        self.core.accepting_submissions()?;
        let regs = &self.core.regs;
        regs.set_control(regs.control() | control::FLUSH_CACHE);
        std::thread::sleep(Duration::from_micros(10));
        regs.set_control(regs.control() & !control::FLUSH_CACHE);
        crate::hal::wmb();
        Ok(())
    }

    /// Scratch patterns, version sanity, and a synchronous NOP round trip.
    pub fn self_test(&self) -> Result<()> {
        info!("running self-test");
        for pattern in [0xDEAD_BEEFu32, 0xCAFE_BABE, 0x1234_5678, 0x8765_4321] {
            self.core.regs.set_scratch(pattern);
            let read = self.core.regs.scratch();
            if read != pattern {
                error!(
                    wrote = format_args!("{pattern:#010x}"),
                    read = format_args!("{read:#010x}"),
                    "self-test scratch mismatch"
                );
                return Err(GpuError::Hardware);
            }
        }
        let raw_version = self.core.regs.version_raw();
        if raw_version == 0 || raw_version == u32::MAX {
            error!(raw_version, "self-test version check failed");
            return Err(GpuError::Hardware);
        }

        let mut writer = crate::cmd::CmdWriter::new();
        writer.nop();
        self.submit(SubmitRequest {
            commands: writer.finish(),
            queue: Some(0),
            timeout_ms: 1_000,
            fence: FenceMode::Auto,
            flags: SubmitFlags::SYNC,
            ..Default::default()
        })?;
        info!("self-test passed");
        Ok(())
    }

    /// Quiesces submission, drains the rings, saves registers and masks
    /// interrupts. The device stays suspended until [`VexGpu::resume`].
    pub fn suspend(&self) -> Result<()> {
        if self.core.is_dead() {
            return Err(GpuError::Hardware);
        }
        if self.core.suspended.swap(true, Ordering::AcqRel) {
            return Err(GpuError::AlreadyInProgress);
        }
        info!("suspending");
        self.health.set_paused(true);
        for ring in self.core.rings_snapshot() {
            ring.suspend(&self.core.regs, self.core.config.drain_timeout);
        }
        let saved = SavedRegs::save(&self.core.regs, self.core.num_queues);
        *self.core.saved.lock().unwrap() = Some(saved);
        self.core.regs.set_irq_enable(0);
        Ok(())
    }

    /// Restores registers, re-enables interrupts and resumes the rings.
    pub fn resume(&self) -> Result<()> {
        if self.core.is_dead() {
            return Err(GpuError::Hardware);
        }
        if !self.core.suspended.load(Ordering::Acquire) {
            return Err(GpuError::InvalidArgument("device is not suspended".into()));
        }
        info!("resuming");
        if let Some(saved) = self.core.saved.lock().unwrap().take() {
            saved.restore(&self.core.regs, self.core.num_queues);
        } else {
            self.core.regs.set_irq_enable(DEFAULT_IRQ_MASK);
            self.core.regs.set_control(control::ENABLE);
        }
        for ring in self.core.rings_snapshot() {
            ring.resume(&self.core.regs);
        }
        self.core.space_wait.notify_all();
        self.core.fence.kick_waiters();
        self.health.set_paused(false);
        self.core.suspended.store(false, Ordering::Release);
        self.sched.wake();
        Ok(())
    }

    /// Logs the full register state, for bug reports.
    pub fn dump_state(&self) {
        let regs = &self.core.regs;
        info!(
            version = format_args!("{:#010x}", regs.version_raw()),
            caps = format_args!("{:#010x}", regs.caps()),
            control = format_args!("{:#010x}", regs.control()),
            status = format_args!("{:#010x}", regs.status()),
            irq_status = format_args!("{:#010x}", regs.irq_status()),
            irq_enable = format_args!("{:#010x}", regs.irq_enabled()),
            fence_value = regs.fence_value(),
            "register dump"
        );
        for q in 0..self.core.num_queues {
            info!(
                queue = q,
                base = format_args!("{:#010x}", regs.cmd_base(q)),
                size = regs.cmd_size(q),
                head = regs.cmd_head(q),
                tail = regs.cmd_tail(q),
                "queue registers"
            );
        }
    }

    /// Tears the device down in reverse initialization order. Safe to call
    /// more than once; also runs on drop.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down");

        self.health.stop();
        self.core.regs.set_irq_enable(0);
        self.reset.stop();
        self.sched.stop();
        self.sched.fail_all(GpuError::Cancelled);
        self.core.irq.stop();

        let threads = {
            let mut guard = self.threads.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for thread in threads {
            let _ = thread.join();
        }

        self.irq_line.detach();
        for ring in self.core.rings_snapshot() {
            ring.release(&self.core.regs);
        }
        self.core.fence.release(&self.core.regs);
        self.core.regs.set_control(0);
        debug!("shutdown complete");
    }
}

impl Drop for VexGpu {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for VexGpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VexGpu")
            .field("version", &self.core.version)
            .field("num_queues", &self.core.num_queues)
            .field("dead", &self.core.is_dead())
            .finish_non_exhaustive()
    }
}

/// Deferred interrupt dispatch: drains the accumulated mask and branches on
/// each bit. Runs until the interrupt core stops.
fn irq_bottom_half(core: Arc<DeviceCore>, sched: Arc<Scheduler>) {
    debug!("irq bottom half started");
    while let Some(bits) = core.irq.wait_pending(Duration::from_millis(100)) {
        if bits & irq_bits::CMD_COMPLETE != 0 {
            sched.handle_cmd_complete();
        }
        if bits & irq_bits::ERROR != 0 {
            let hw_status = core.regs.status();
            error!(
                status = format_args!("{hw_status:#x}"),
                "device error interrupt"
            );
            if hw_status & (status::ERROR | status::HALTED) != 0 {
                core.request_reset();
            }
        }
        if bits & irq_bits::FENCE != 0 {
            core.fence.process();
        }
        if bits & irq_bits::QUEUE_EMPTY != 0 {
            core.space_wait.notify_all();
        }
        if bits & irq_bits::SHADER_HALT != 0 {
            core.shader_halts.fetch_add(1, Ordering::Relaxed);
            warn!("shader halt");
        }
        if bits & irq_bits::PERF_COUNTER != 0 {
            core.perf_overflows.fetch_add(1, Ordering::Relaxed);
            trace!("performance counter overflow");
        }
    }
    debug!("irq bottom half stopped");
}
