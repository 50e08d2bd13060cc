//! Scheduler semantics: dependencies, priority admission, cancellation and
//! queue auto-selection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use vexgpu::cmd::CmdWriter;
use vexgpu::sched::Priority;
use vexgpu::{
    FenceMode, GpuError, GpuPlatform, JobState, SubmitFlags, SubmitRequest, VexGpu, VexGpuConfig,
};
use vexgpu_model::SoftGpu;

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

fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn dependency_chain_completes_in_order() {
    let (model, gpu) = bring_up(VexGpuConfig::default());
    model.wedge();

    let j1 = gpu.submit(nop_request()).expect("j1");
    let j2 = gpu
        .submit(SubmitRequest {
            deps: vec![j1.job_id],
            ..nop_request()
        })
        .expect("j2");
    let j3 = gpu
        .submit(SubmitRequest {
            deps: vec![j2.job_id],
            ..nop_request()
        })
        .expect("j3");

    // Auto fences take consecutive sequence numbers on the shared cell.
    let (addr, v1) = j1.fence.unwrap();
    let (_, v2) = j2.fence.unwrap();
    let (_, v3) = j3.fence.unwrap();
    assert_eq!((v1, v2, v3), (1, 2, 3));

    // With the device wedged, J1 occupies the queue and J2 stays gated.
    wait_for("j1 to start", || {
        gpu.job_state(j1.job_id) == Ok(JobState::Running)
    });
    assert_eq!(gpu.job_state(j2.job_id), Ok(JobState::Queued));
    assert_eq!(
        gpu.wait_fence(addr, v2, 50),
        Err(GpuError::Timeout),
        "fence 2 must not signal before J2 completes"
    );

    model.unwedge();
    gpu.wait_job(j3.job_id, 5_000).expect("chain completion");
    gpu.wait_fence(addr, v2, 5_000).expect("fence 2 after J2");

    // The cell passed 1, 2, 3 in order and rests at 3.
    assert!(gpu.fence_signaled(addr, v3));
    assert_eq!(model.fence_value(), v3);
}

#[test]
fn realtime_beats_low_at_admission() {
    // queue_depth = 1: exactly one job owns the hardware at a time.
    let (model, gpu) = bring_up(VexGpuConfig {
        queue_depth: 1,
        ..Default::default()
    });
    model.wedge();

    let running = gpu.submit(nop_request()).expect("running job");
    wait_for("running job to start", || {
        gpu.job_state(running.job_id) == Ok(JobState::Running)
    });

    let low = gpu
        .submit(SubmitRequest {
            priority: Priority::Low,
            ..nop_request()
        })
        .expect("low");
    let rt = gpu
        .submit(SubmitRequest {
            priority: Priority::Realtime,
            ..nop_request()
        })
        .expect("rt");
    let (_, v_low) = low.fence.unwrap();
    let (_, v_rt) = rt.fence.unwrap();
    assert!(v_rt > v_low, "rt was submitted after low");

    model.unwedge();
    gpu.wait_job(low.job_id, 5_000).expect("low completes");
    gpu.wait_job(rt.job_id, 5_000).expect("rt completes");

    // Execution order was running, rt, low: the device's FENCE_VALUE mirror
    // holds whichever fence executed last, so it must be low's.
    assert_eq!(model.fence_value(), v_low);
}

#[test]
fn cancel_only_touches_unstarted_jobs() {
    let (model, gpu) = bring_up(VexGpuConfig::default());
    model.wedge();

    let running = gpu.submit(nop_request()).expect("running");
    wait_for("job to start", || {
        gpu.job_state(running.job_id) == Ok(JobState::Running)
    });
    let queued = gpu.submit(nop_request()).expect("queued");

    gpu.cancel_job(queued.job_id).expect("cancel queued");
    assert_eq!(gpu.job_state(queued.job_id), Ok(JobState::Aborted));
    assert_eq!(
        gpu.wait_job(queued.job_id, 100),
        Err(GpuError::Cancelled)
    );

    assert_eq!(
        gpu.cancel_job(running.job_id),
        Err(GpuError::AlreadyInProgress)
    );

    model.unwedge();
    gpu.wait_job(running.job_id, 5_000).expect("running completes");
    assert_eq!(
        gpu.cancel_job(running.job_id),
        Err(GpuError::AlreadyInProgress)
    );
    assert_eq!(gpu.cancel_job(0xDEAD), Err(GpuError::NotFound));
}

#[test]
fn dependency_edges_are_checked() {
    let (model, gpu) = bring_up(VexGpuConfig::default());
    model.wedge();

    let running = gpu.submit(nop_request()).expect("running");
    wait_for("job to start", || {
        gpu.job_state(running.job_id) == Ok(JobState::Running)
    });
    let a = gpu.submit(nop_request()).expect("a");
    let b = gpu
        .submit(SubmitRequest {
            deps: vec![a.job_id],
            ..nop_request()
        })
        .expect("b");

    assert!(matches!(
        gpu.add_job_dependency(a.job_id, a.job_id),
        Err(GpuError::InvalidArgument(_))
    ));
    assert_eq!(
        gpu.add_job_dependency(a.job_id, 0xDEAD),
        Err(GpuError::NotFound)
    );
    // b already waits on a; the reverse edge would close a cycle.
    assert!(matches!(
        gpu.add_job_dependency(a.job_id, b.job_id),
        Err(GpuError::InvalidArgument(_))
    ));
    // The running job cannot gain new predecessors.
    assert_eq!(
        gpu.add_job_dependency(running.job_id, a.job_id),
        Err(GpuError::AlreadyInProgress)
    );

    model.unwedge();
    gpu.wait_job(b.job_id, 5_000).expect("chain completes");
}

#[test]
fn unknown_dependency_at_submit_is_rejected() {
    let (_model, gpu) = bring_up(VexGpuConfig::default());
    assert_eq!(
        gpu.submit(SubmitRequest {
            deps: vec![0xDEAD],
            ..nop_request()
        })
        .map(|t| t.job_id),
        Err(GpuError::NotFound)
    );
}

#[test]
fn job_types_pick_their_preferred_queues() {
    let (_model, gpu) = bring_up(VexGpuConfig::default());

    // Compute prefers queue 1 on a two-queue device.
    let mut w = CmdWriter::new();
    w.compute(1, 1, 1);
    gpu.submit(SubmitRequest {
        commands: w.finish(),
        flags: SubmitFlags::SYNC,
        ..Default::default()
    })
    .expect("compute");

    // DMA prefers queue 2, which does not exist here; it falls back to 0.
    let mut w = CmdWriter::new();
    w.dma(0, 0, 64, 0);
    gpu.submit(SubmitRequest {
        commands: w.finish(),
        flags: SubmitFlags::SYNC,
        ..Default::default()
    })
    .expect("dma");

    let stats = gpu.stats();
    assert_eq!(stats.sched.queues[1].jobs_completed, 1, "compute on queue 1");
    assert_eq!(stats.sched.queues[0].jobs_completed, 1, "dma fell back to queue 0");
}

#[test]
fn explicit_queue_overrides_auto_selection() {
    let (_model, gpu) = bring_up(VexGpuConfig::default());
    let mut w = CmdWriter::new();
    w.compute(1, 1, 1);
    gpu.submit(SubmitRequest {
        commands: w.finish(),
        queue: Some(0),
        flags: SubmitFlags::SYNC,
        ..Default::default()
    })
    .expect("compute pinned to queue 0");
    let stats = gpu.stats();
    assert_eq!(stats.sched.queues[0].jobs_completed, 1);
    assert_eq!(stats.sched.queues[1].jobs_completed, 0);
}
