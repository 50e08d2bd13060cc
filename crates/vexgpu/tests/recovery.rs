//! Hang detection, heartbeat loss, error interrupts and the staged reset
//! cycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use vexgpu::cmd::CmdWriter;
use vexgpu::{
    FenceMode, GpuError, GpuPlatform, SubmitFlags, SubmitRequest, VexGpu, VexGpuConfig,
};
use vexgpu_model::SoftGpu;

/// Recovery timing shrunk so the suite runs in seconds.
fn fast_config() -> VexGpuConfig {
    VexGpuConfig {
        heartbeat_interval: Duration::from_millis(40),
        heartbeat_miss_threshold: 3,
        hang_check_interval: Duration::from_millis(40),
        hang_timeout: Duration::from_millis(200),
        timeout_sweep_interval: Duration::from_millis(100),
        drain_timeout: Duration::from_millis(100),
        ..Default::default()
    }
}

fn bring_up(config: VexGpuConfig) -> (Arc<SoftGpu>, VexGpu) {
    let model = SoftGpu::with_defaults();
    let platform = GpuPlatform {
        mmio: model.clone(),
        dma: model.clone(),
        irq: model.clone(),
    };
    let gpu = VexGpu::probe(platform, config).expect("probe");
    (model, gpu)
}

fn nop_request() -> SubmitRequest {
    let mut w = CmdWriter::new();
    w.nop();
    SubmitRequest {
        commands: w.finish(),
        fence: FenceMode::Auto,
        ..Default::default()
    }
}

fn wait_for<F: Fn() -> bool>(what: &str, timeout: Duration, cond: F) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn hang_detection_resets_and_resumes() {
    let (model, gpu) = bring_up(fast_config());

    // Wedge the device, then give it work it will never consume: BUSY stays
    // asserted while head and fence make no progress.
    model.wedge();
    let hung = gpu.submit(nop_request()).expect("submit");

    wait_for("hang detector to fire", Duration::from_secs(10), || {
        gpu.reset_count() >= 1
    });
    gpu.wait_reset(2_000).expect("reset completion");
    assert_eq!(gpu.reset_count(), 1, "exactly one recovery cycle");
    assert!(!model.is_wedged(), "device reset cleared the wedge");

    // The hung job was failed by the recovery path.
    assert_eq!(gpu.wait_job(hung.job_id, 1_000), Err(GpuError::Hardware));

    // A NOP completes promptly on the recovered device.
    let started = Instant::now();
    gpu.submit(SubmitRequest {
        flags: SubmitFlags::SYNC,
        ..nop_request()
    })
    .expect("submit after reset");
    assert!(
        started.elapsed() < Duration::from_millis(100),
        "post-reset submission must complete promptly"
    );
    assert_eq!(gpu.reset_count(), 1);
    assert_eq!(gpu.stats().health.hangs, 1);
}

#[test]
fn consecutive_reset_requests_converge_to_one_cycle() {
    let (_model, gpu) = bring_up(fast_config());
    gpu.schedule_reset();
    gpu.schedule_reset();
    wait_for("reset cycle", Duration::from_secs(5), || {
        gpu.reset_count() >= 1
    });
    gpu.wait_reset(2_000).expect("reset completion");
    // Give a hypothetical second cycle time to (incorrectly) run.
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(gpu.reset_count(), 1);

    gpu.submit(SubmitRequest {
        flags: SubmitFlags::SYNC,
        ..nop_request()
    })
    .expect("submit after reset");
}

#[test]
fn heartbeat_loss_schedules_a_reset() {
    let (model, gpu) = bring_up(fast_config());
    model.fail_heartbeat(true);

    wait_for("heartbeat misses to accumulate", Duration::from_secs(10), || {
        gpu.reset_count() >= 1
    });
    gpu.wait_reset(2_000).expect("reset completion");

    // The device reset cleared the injected fault; the heartbeat recovers
    // and no further resets pile up.
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(gpu.reset_count(), 1);
    assert!(gpu.stats().health.heartbeat_misses >= 3);

    gpu.submit(SubmitRequest {
        flags: SubmitFlags::SYNC,
        ..nop_request()
    })
    .expect("submit after reset");
}

#[test]
fn error_interrupt_schedules_a_reset() {
    let (model, gpu) = bring_up(fast_config());
    model.inject_error();

    wait_for("error-driven reset", Duration::from_secs(5), || {
        gpu.reset_count() >= 1
    });
    gpu.wait_reset(2_000).expect("reset completion");

    gpu.submit(SubmitRequest {
        flags: SubmitFlags::SYNC,
        ..nop_request()
    })
    .expect("submit after reset");
}

#[test]
fn submissions_fail_busy_while_reset_is_in_flight() {
    let (model, gpu) = bring_up(VexGpuConfig {
        // Long drain keeps the reset window open wide enough to observe.
        drain_timeout: Duration::from_millis(500),
        ..fast_config()
    });

    model.wedge();
    let _hung = gpu.submit(nop_request()).expect("submit");
    gpu.schedule_reset();

    // While the reset drains the wedged ring, new submissions bounce.
    wait_for("reset entry", Duration::from_secs(5), || {
        gpu.submit(nop_request()) == Err(GpuError::Busy)
    });

    gpu.wait_reset(5_000).expect("reset completion");
    gpu.submit(SubmitRequest {
        flags: SubmitFlags::SYNC,
        ..nop_request()
    })
    .expect("submit after reset");
}

#[test]
fn wait_reset_with_zero_timeout_polls() {
    let (model, gpu) = bring_up(VexGpuConfig {
        // Long drain keeps the reset window open wide enough to observe.
        drain_timeout: Duration::from_millis(500),
        ..fast_config()
    });

    // No reset in flight: the poll returns immediately.
    gpu.wait_reset(0).expect("idle gate");

    model.wedge();
    let _hung = gpu.submit(nop_request()).expect("submit");
    gpu.schedule_reset();

    // While the cycle drains the wedged ring, a zero-timeout wait must not
    // block; it reports Timeout straight away.
    wait_for("reset entry", Duration::from_secs(5), || {
        gpu.wait_reset(0) == Err(GpuError::Timeout)
    });

    gpu.wait_reset(5_000).expect("reset completion");
    gpu.wait_reset(0).expect("poll after completion");
}

#[test]
fn job_timeout_sweep_fails_the_job_and_recovers() {
    let (model, gpu) = bring_up(fast_config());
    model.wedge();

    let mut w = CmdWriter::new();
    w.nop();
    let slow = gpu
        .submit(SubmitRequest {
            commands: w.finish(),
            timeout_ms: 100,
            fence: FenceMode::Auto,
            ..Default::default()
        })
        .expect("submit");

    // The sweep marks the job timed out and schedules recovery.
    assert_eq!(gpu.wait_job(slow.job_id, 5_000), Err(GpuError::Timeout));
    assert_eq!(
        gpu.job_state(slow.job_id),
        Ok(vexgpu::JobState::TimedOut)
    );
    wait_for("sweep-driven reset", Duration::from_secs(5), || {
        gpu.reset_count() >= 1
    });
    gpu.wait_reset(2_000).expect("reset completion");

    gpu.submit(SubmitRequest {
        flags: SubmitFlags::SYNC,
        ..nop_request()
    })
    .expect("submit after reset");
}
