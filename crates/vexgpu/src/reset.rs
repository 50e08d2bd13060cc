//! Reset and health engine.
//!
//! The health monitor probes the scratch register (heartbeat) and watches
//! command-head/fence progress against STATUS.BUSY (hang detection). Either
//! finding, a device ERROR, or a job timeout schedules the reset worker,
//! which quiesces the rings, saves host-controlled registers, resets the
//! hardware, restores state and resumes. Reset scheduling is idempotent: a
//! request while a reset is pending or running is a no-op.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::device::DeviceCore;
use crate::error::GpuError;
use crate::regs::{status, Registers, MAX_BANKED_QUEUES};
use crate::sched::Scheduler;

/// Pending-reset flag the reset worker sleeps on. The flag stays set for
/// the whole recovery cycle, so every request that lands while one is
/// pending or running collapses into that cycle.
pub(crate) struct ResetRequest {
    pending: Mutex<bool>,
    cv: Condvar,
}

impl ResetRequest {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn request(&self) {
        let mut pending = self.pending.lock().unwrap();
        if *pending {
            return;
        }
        *pending = true;
        self.cv.notify_all();
    }

    /// Kicks the worker without scheduling a reset (used at stop).
    pub(crate) fn kick(&self) {
        self.cv.notify_all();
    }

    /// Waits up to `park` for a request without consuming it.
    fn wait_requested(&self, park: Duration) -> bool {
        let mut pending = self.pending.lock().unwrap();
        if !*pending {
            let (guard, _timed_out) = self.cv.wait_timeout(pending, park).unwrap();
            pending = guard;
        }
        *pending
    }

    /// Clears the flag once the cycle is over.
    fn finish(&self) {
        *self.pending.lock().unwrap() = false;
    }
}

/// Gate callers block on while a reset is in flight.
pub(crate) struct ResetGate {
    in_reset: Mutex<bool>,
    cv: Condvar,
}

impl ResetGate {
    pub(crate) fn new() -> Self {
        Self {
            in_reset: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn enter(&self) {
        *self.in_reset.lock().unwrap() = true;
    }

    pub(crate) fn open(&self) {
        let mut in_reset = self.in_reset.lock().unwrap();
        *in_reset = false;
        self.cv.notify_all();
    }

    /// Blocks until no reset is in flight. A zero timeout polls once.
    pub(crate) fn wait(&self, timeout: Duration) -> crate::error::Result<()> {
        let deadline = Instant::now() + timeout;
        let mut in_reset = self.in_reset.lock().unwrap();
        while *in_reset {
            let now = Instant::now();
            if now >= deadline {
                return Err(GpuError::Timeout);
            }
            let (guard, _timed_out) = self.cv.wait_timeout(in_reset, deadline - now).unwrap();
            in_reset = guard;
        }
        Ok(())
    }
}

/// Snapshot of the host-controlled registers restored after reset or resume.
/// Restore order is the reverse of the save order, control last, so
/// interrupts are unmasked before the device is re-enabled.
#[derive(Clone, Debug)]
pub(crate) struct SavedRegs {
    control: u32,
    irq_enable: u32,
    cmd_base: [u32; MAX_BANKED_QUEUES as usize],
    cmd_size: [u32; MAX_BANKED_QUEUES as usize],
    fence_addr: u32,
    vertex_base: u32,
    vertex_count: u32,
    vertex_stride: u32,
    shader_pc: u32,
}

impl SavedRegs {
    pub(crate) fn save(regs: &Registers, num_queues: u32) -> Self {
        use crate::regs::mmio;
        let mut cmd_base = [0u32; MAX_BANKED_QUEUES as usize];
        let mut cmd_size = [0u32; MAX_BANKED_QUEUES as usize];
        for q in 0..num_queues.min(MAX_BANKED_QUEUES) {
            cmd_base[q as usize] = regs.cmd_base(q);
            cmd_size[q as usize] = regs.cmd_size(q);
        }
        let saved = Self {
            control: regs.control(),
            irq_enable: regs.irq_enabled(),
            cmd_base,
            cmd_size,
            fence_addr: regs.fence_addr(),
            vertex_base: regs.read(mmio::VERTEX_BASE).unwrap_or(0),
            vertex_count: regs.read(mmio::VERTEX_COUNT).unwrap_or(0),
            vertex_stride: regs.read(mmio::VERTEX_STRIDE).unwrap_or(0),
            shader_pc: regs.read(mmio::SHADER_PC).unwrap_or(0),
        };
        debug!("saved host-controlled registers");
        saved
    }

    pub(crate) fn restore(&self, regs: &Registers, num_queues: u32) {
        use crate::regs::mmio;
        let _ = regs.write(mmio::SHADER_PC, self.shader_pc);
        let _ = regs.write(mmio::VERTEX_STRIDE, self.vertex_stride);
        let _ = regs.write(mmio::VERTEX_COUNT, self.vertex_count);
        let _ = regs.write(mmio::VERTEX_BASE, self.vertex_base);
        regs.set_fence_addr(self.fence_addr);
        for q in (0..num_queues.min(MAX_BANKED_QUEUES)).rev() {
            regs.set_cmd_size(q, self.cmd_size[q as usize]);
            regs.set_cmd_base(q, self.cmd_base[q as usize]);
        }
        regs.set_irq_enable(self.irq_enable);
        regs.set_control(self.control);
        debug!("restored host-controlled registers");
    }
}

pub(crate) struct ResetEngine {
    core: Arc<DeviceCore>,
    sched: Arc<Scheduler>,
    stop: AtomicBool,
}

impl ResetEngine {
    pub(crate) fn new(core: Arc<DeviceCore>, sched: Arc<Scheduler>) -> Arc<Self> {
        Arc::new(Self {
            core,
            sched,
            stop: AtomicBool::new(false),
        })
    }

    pub(crate) fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.core.reset_request.kick();
    }

    pub(crate) fn worker_loop(&self) {
        debug!("reset worker started");
        while !self.stop.load(Ordering::Acquire) {
            if self
                .core
                .reset_request
                .wait_requested(Duration::from_millis(100))
            {
                if !self.core.is_dead() {
                    self.run_reset();
                }
                self.core.reset_request.finish();
            }
        }
        debug!("reset worker stopped");
    }

    /// The staged recovery sequence of the reset work item. Single-threaded:
    /// only the reset worker calls this.
    fn run_reset(&self) {
        let core = &self.core;
        let cfg = &core.config;
        warn!("gpu reset initiated");

        // 1. Stop accepting submissions.
        core.in_reset.store(true, Ordering::Release);
        core.reset_gate.enter();

        // 2. Quiesce each ring; a wedged device may leave residue behind,
        //    which resume replays.
        for ring in core.rings_snapshot() {
            ring.suspend(&core.regs, cfg.drain_timeout);
        }
        // Whatever was on the hardware is lost.
        self.sched.abort_running(GpuError::Hardware);

        // 3. Save host-controlled registers.
        let saved = SavedRegs::save(&core.regs, core.num_queues);

        // 4. Quiet the interrupt line across the reset pulse.
        core.regs.set_irq_enable(0);

        // 5. Hardware reset pulse; failure here is fatal for the instance.
        if let Err(err) = hw_reset(&core.regs, cfg.reset_hold, cfg.reset_poll_timeout) {
            error!(%err, "hardware reset failed, marking device dead");
            self.give_up();
            return;
        }

        // 6. Re-read identity and probe responsiveness.
        let version = core.regs.version_raw();
        if version == 0 || version == u32::MAX || scratch_probe(&core.regs).is_err() {
            error!(version, "device unresponsive after reset, marking device dead");
            self.give_up();
            return;
        }

        // 7./8. Restore registers in reverse save order; control last, so
        //       interrupts are unmasked before the device re-enables.
        saved.restore(&core.regs, core.num_queues);

        // 9. Resume rings and wake everything that was parked on them.
        for ring in core.rings_snapshot() {
            ring.resume(&core.regs);
        }
        core.space_wait.notify_all();
        core.fence.rearm();
        core.fence.kick_waiters();

        // 10. Reopen for business.
        core.in_reset.store(false, Ordering::Release);
        let count = core.reset_count.fetch_add(1, Ordering::AcqRel) + 1;
        core.reset_gate.open();
        self.sched.wake();
        info!(reset_count = count, "gpu reset complete");
    }

    fn give_up(&self) {
        let core = &self.core;
        core.dead.store(true, Ordering::Release);
        core.fence.cancel_waiters();
        self.sched.fail_all(GpuError::Hardware);
        core.in_reset.store(false, Ordering::Release);
        core.reset_gate.open();
    }
}

/// Asserts the reset bit, holds it, deasserts and polls for IDLE.
pub(crate) fn hw_reset(
    regs: &Registers,
    hold: Duration,
    idle_timeout: Duration,
) -> crate::error::Result<()> {
    use crate::regs::control;
    regs.set_control(control::RESET);
    std::thread::sleep(hold);
    regs.set_control(0);

    let deadline = Instant::now() + idle_timeout;
    loop {
        if regs.status() & status::IDLE != 0 {
            break;
        }
        if Instant::now() >= deadline {
            return Err(GpuError::Hardware);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    regs.irq_ack(u32::MAX);
    Ok(())
}

/// Scratch-register aliveness probe: echo a pattern and its inverse.
pub(crate) fn scratch_probe(regs: &Registers) -> crate::error::Result<()> {
    for pattern in [0xDEAD_BEEFu32, !0xDEAD_BEEFu32] {
        regs.set_scratch(pattern);
        let read = regs.scratch();
        if read != pattern {
            warn!(
                wrote = format_args!("{pattern:#010x}"),
                read = format_args!("{read:#010x}"),
                "scratch probe failed"
            );
            return Err(GpuError::Hardware);
        }
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HealthStats {
    pub checks: u64,
    pub heartbeat_misses: u64,
    pub hangs: u64,
}

struct HealthState {
    heartbeat_counter: u32,
    consecutive_misses: u32,
    last_heads: [u32; MAX_BANKED_QUEUES as usize],
    last_fence: u32,
    last_activity: Instant,
    next_heartbeat: Instant,
    next_hang_check: Instant,
}

pub(crate) struct HealthMonitor {
    core: Arc<DeviceCore>,
    stop: AtomicBool,
    paused: AtomicBool,
    state: Mutex<HealthState>,
    checks: AtomicU64,
    heartbeat_misses: AtomicU64,
    hangs: AtomicU64,
}

impl HealthMonitor {
    pub(crate) fn new(core: Arc<DeviceCore>) -> Arc<Self> {
        let now = Instant::now();
        let heartbeat = core.config.heartbeat_interval;
        let hang = core.config.hang_check_interval;
        Arc::new(Self {
            core,
            stop: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            state: Mutex::new(HealthState {
                heartbeat_counter: 0,
                consecutive_misses: 0,
                last_heads: [0; MAX_BANKED_QUEUES as usize],
                last_fence: 0,
                last_activity: now,
                next_heartbeat: now + heartbeat,
                next_hang_check: now + hang,
            }),
            checks: AtomicU64::new(0),
            heartbeat_misses: AtomicU64::new(0),
            hangs: AtomicU64::new(0),
        })
    }

    pub(crate) fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
        if !paused {
            // Re-arm both timers so a long suspend does not read as a hang.
            let mut state = self.state.lock().unwrap();
            let now = Instant::now();
            state.last_activity = now;
            state.next_heartbeat = now + self.core.config.heartbeat_interval;
            state.next_hang_check = now + self.core.config.hang_check_interval;
        }
    }

    pub(crate) fn stats(&self) -> HealthStats {
        HealthStats {
            checks: self.checks.load(Ordering::Relaxed),
            heartbeat_misses: self.heartbeat_misses.load(Ordering::Relaxed),
            hangs: self.hangs.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn worker_loop(&self) {
        debug!("health monitor started");
        while !self.stop.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(20));
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            if self.paused.load(Ordering::Acquire)
                || self.core.in_reset.load(Ordering::Acquire)
                || self.core.is_dead()
            {
                continue;
            }
            let now = Instant::now();
            let (do_heartbeat, do_hang) = {
                let mut state = self.state.lock().unwrap();
                let heartbeat = now >= state.next_heartbeat;
                let hang = now >= state.next_hang_check;
                if heartbeat {
                    state.next_heartbeat = now + self.core.config.heartbeat_interval;
                }
                if hang {
                    state.next_hang_check = now + self.core.config.hang_check_interval;
                }
                (heartbeat, hang)
            };
            if do_heartbeat {
                self.heartbeat();
            }
            if do_hang {
                self.hang_check();
            }
        }
        debug!("health monitor stopped");
    }

    /// Writes a monotonically increasing counter to the scratch register and
    /// verifies the echo. Consecutive misses past the threshold schedule a
    /// reset.
    fn heartbeat(&self) {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let regs = &self.core.regs;
        let mut state = self.state.lock().unwrap();
        state.heartbeat_counter = state.heartbeat_counter.wrapping_add(1);
        let wrote = state.heartbeat_counter;
        regs.set_scratch(wrote);
        let read = regs.scratch();
        if read == wrote {
            state.consecutive_misses = 0;
            return;
        }
        state.consecutive_misses += 1;
        self.heartbeat_misses.fetch_add(1, Ordering::Relaxed);
        warn!(
            wrote,
            read,
            misses = state.consecutive_misses,
            "heartbeat mismatch"
        );
        if state.consecutive_misses >= self.core.config.heartbeat_miss_threshold {
            error!("heartbeat lost, scheduling reset");
            state.consecutive_misses = 0;
            drop(state);
            self.core.request_reset();
        }
    }

    /// Declares a hang when neither command heads nor the fence cell move
    /// for longer than the hang timeout while the device claims BUSY.
    fn hang_check(&self) {
        let regs = &self.core.regs;
        let hw_status = regs.status();
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        if hw_status & status::BUSY == 0 {
            state.last_activity = now;
            return;
        }

        let mut progressed = false;
        for q in 0..self.core.num_queues.min(MAX_BANKED_QUEUES) {
            let head = regs.cmd_head(q);
            if head != state.last_heads[q as usize] {
                state.last_heads[q as usize] = head;
                progressed = true;
            }
        }
        let fence = regs.fence_value();
        if fence != state.last_fence {
            state.last_fence = fence;
            progressed = true;
        }

        if progressed {
            state.last_activity = now;
            return;
        }
        if now.duration_since(state.last_activity) > self.core.config.hang_timeout {
            self.hangs.fetch_add(1, Ordering::Relaxed);
            error!(
                stalled_ms = now.duration_since(state.last_activity).as_millis() as u64,
                "gpu hang detected, scheduling reset"
            );
            // Restart the stall clock so a pending reset is not re-requested
            // every check interval.
            state.last_activity = now;
            drop(state);
            self.core.request_reset();
        }
    }
}
