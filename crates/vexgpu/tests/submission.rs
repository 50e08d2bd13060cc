//! End-to-end submission paths: probe, validation, fencing, suspend/resume,
//! shader loads and the self-test, all over the software device model.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use vexgpu::cmd::CmdWriter;
use vexgpu::hal::{BusMemory, MmioSpace};
use vexgpu::regs::{control, irq_bits, mmio};
use vexgpu::{
    FenceMode, GpuError, GpuPlatform, JobState, ShaderType, SubmitFlags, SubmitRequest, VexGpu,
    VexGpuConfig,
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

fn nop_stream() -> Vec<u32> {
    let mut w = CmdWriter::new();
    w.nop();
    w.finish()
}

#[test]
fn probe_reports_identity_and_queues() {
    let (_model, gpu) = bring_up(VexGpuConfig::default());
    let info = gpu.info();
    assert_eq!(info.version.major, 1);
    assert_eq!(info.version.minor, 3);
    assert!(info.has_multi_queue);
    assert!(info.has_fence);
    assert_eq!(info.num_queues, 2);
    gpu.dump_state();
}

#[test]
fn synchronous_nop_signals_its_fence() {
    let (_model, gpu) = bring_up(VexGpuConfig::default());
    let ticket = gpu
        .submit(SubmitRequest {
            commands: nop_stream(),
            fence: FenceMode::Auto,
            flags: SubmitFlags::SYNC,
            ..Default::default()
        })
        .expect("submit");

    let (addr, value) = ticket.fence.expect("auto fence");
    assert_eq!(value, 1, "first auto fence takes the first sequence number");
    assert!(gpu.fence_signaled(addr, value));
    assert_eq!(gpu.job_state(ticket.job_id), Ok(JobState::Completed));

    let stats = gpu.stats();
    assert_eq!(stats.sched.queues[0].jobs_completed, 1);
    assert!(stats.rings[0].submitted_cmds >= 1);
    assert!(stats.hard_irqs >= 1);
}

#[test]
fn unprivileged_reg_write_is_neutered() {
    let (model, gpu) = bring_up(VexGpuConfig::default());

    // VERTEX_COUNT has no other writer in this test, unlike SCRATCH which
    // the heartbeat owns.
    let mut w = CmdWriter::new();
    w.nop().reg_write(mmio::VERTEX_COUNT, 0x77).nop();
    gpu.submit(SubmitRequest {
        commands: w.finish(),
        flags: SubmitFlags::SYNC,
        fence: FenceMode::Auto,
        ..Default::default()
    })
    .expect("submit");
    assert_eq!(model.read32(mmio::VERTEX_COUNT), 0, "rewritten to NOP");

    let mut w = CmdWriter::new();
    w.reg_write(mmio::VERTEX_COUNT, 0x77);
    gpu.submit(SubmitRequest {
        commands: w.finish(),
        flags: SubmitFlags::SYNC | SubmitFlags::PRIVILEGED,
        fence: FenceMode::Auto,
        ..Default::default()
    })
    .expect("privileged submit");
    assert_eq!(model.read32(mmio::VERTEX_COUNT), 0x77);
}

#[test]
fn bad_submissions_are_rejected_before_the_ring() {
    let (model, gpu) = bring_up(VexGpuConfig::default());
    let executed_before = model.executed_records();

    assert!(matches!(
        gpu.submit(SubmitRequest::default()),
        Err(GpuError::InvalidArgument(_))
    ));

    // Unknown opcode 0x3F.
    assert!(matches!(
        gpu.submit(SubmitRequest {
            commands: vec![0x0000_013F],
            ..Default::default()
        }),
        Err(GpuError::InvalidArgument(_))
    ));

    // Nonexistent queue.
    assert!(matches!(
        gpu.submit(SubmitRequest {
            commands: nop_stream(),
            queue: Some(7),
            ..Default::default()
        }),
        Err(GpuError::InvalidArgument(_))
    ));

    // Fence outside the fence page.
    assert!(matches!(
        gpu.submit(SubmitRequest {
            commands: nop_stream(),
            fence: FenceMode::Explicit { addr: 0x10, value: 5 },
            ..Default::default()
        }),
        Err(GpuError::InvalidArgument(_))
    ));

    // Nothing reached the hardware.
    assert_eq!(model.executed_records(), executed_before);
}

#[test]
fn suspend_quiesces_and_resume_restores() {
    let (_model, gpu) = bring_up(VexGpuConfig::default());
    gpu.submit(SubmitRequest {
        commands: nop_stream(),
        flags: SubmitFlags::SYNC,
        ..Default::default()
    })
    .expect("warm-up submit");

    gpu.suspend().expect("suspend");
    assert_eq!(gpu.suspend(), Err(GpuError::AlreadyInProgress));
    assert_eq!(
        gpu.submit(SubmitRequest {
            commands: nop_stream(),
            ..Default::default()
        }),
        Err(GpuError::Busy)
    );

    gpu.resume().expect("resume");
    gpu.submit(SubmitRequest {
        commands: nop_stream(),
        flags: SubmitFlags::SYNC,
        ..Default::default()
    })
    .expect("submit after resume");
}

#[test]
fn self_test_passes_on_a_healthy_device() {
    let (_model, gpu) = bring_up(VexGpuConfig::default());
    gpu.self_test().expect("self-test");
}

#[test]
fn probe_runs_the_self_test_when_configured() {
    let model = SoftGpu::with_defaults();
    let platform = GpuPlatform {
        mmio: model.clone(),
        dma: model.clone(),
        irq: model.clone(),
    };
    let gpu = VexGpu::probe(
        platform,
        VexGpuConfig {
            run_selftest: true,
            ..Default::default()
        },
    )
    .expect("probe with self-test");
    drop(gpu);
}

#[test]
fn shader_loads_land_in_instruction_memory() {
    let (model, gpu) = bring_up(VexGpuConfig::default());

    gpu.load_shader(4, &[0xAAAA_0001, 0xAAAA_0002]).expect("load");
    assert_eq!(model.instr_word(4), 0xAAAA_0001);
    assert_eq!(model.instr_word(5), 0xAAAA_0002);

    gpu.set_shader_entry(4).expect("entry");
    assert_eq!(model.read32(mmio::SHADER_PC), 4);

    gpu.bind_shader(3, ShaderType::Fragment).expect("bind");
    assert_ne!(model.read32(mmio::SHADER_CTRL), 0);

    assert!(matches!(
        gpu.load_shader(1020, &[0; 8]),
        Err(GpuError::InvalidArgument(_))
    ));
    assert!(matches!(
        gpu.bind_shader(16, ShaderType::Vertex),
        Err(GpuError::InvalidArgument(_))
    ));
}

#[test]
fn dma_records_copy_guest_memory() {
    let (model, gpu) = bring_up(VexGpuConfig::default());
    let mem = model.memory();

    let src = 0x20_0000u64;
    let dst = 0x20_4000u64;
    for i in 0..16u32 {
        mem.write_u32(src + u64::from(i) * 4, 0xA500_0000 | i);
    }

    let mut w = CmdWriter::new();
    w.dma(src as u32, dst as u32, 64, 0);
    gpu.submit(SubmitRequest {
        commands: w.finish(),
        flags: SubmitFlags::SYNC,
        ..Default::default()
    })
    .expect("dma submit");

    for i in 0..16u32 {
        assert_eq!(mem.read_u32(dst + u64::from(i) * 4), 0xA500_0000 | i);
    }
}

#[test]
fn wait_record_stalls_until_its_cell_signals() {
    let (model, gpu) = bring_up(VexGpuConfig::default());
    let cell = 0x30_0000u64;

    let mut w = CmdWriter::new();
    w.wait(Some(cell as u32), 5).nop();
    let ticket = gpu
        .submit(SubmitRequest {
            commands: w.finish(),
            fence: FenceMode::Auto,
            ..Default::default()
        })
        .expect("submit");

    // The stream sits on the unmet WAIT; the job stays running.
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert_eq!(gpu.job_state(ticket.job_id), Ok(JobState::Running));

    model.memory().write_u32(cell, 5);
    gpu.wait_job(ticket.job_id, 5_000).expect("wait satisfied");
}

#[test]
fn perf_counters_toggle_control_and_irq_mask() {
    let (model, gpu) = bring_up(VexGpuConfig::default());

    gpu.enable_perf_counters().expect("enable");
    assert_ne!(model.read32(mmio::CONTROL) & control::PERF_COUNTER, 0);
    assert_ne!(
        model.read32(mmio::IRQ_ENABLE) & irq_bits::PERF_COUNTER,
        0
    );

    gpu.disable_perf_counters().expect("disable");
    assert_eq!(model.read32(mmio::CONTROL) & control::PERF_COUNTER, 0);
    assert_eq!(
        model.read32(mmio::IRQ_ENABLE) & irq_bits::PERF_COUNTER,
        0
    );

    gpu.flush_caches().expect("flush");
    assert_eq!(model.read32(mmio::CONTROL) & control::FLUSH_CACHE, 0);
}

#[test]
fn wait_job_with_zero_timeout_polls() {
    let (model, gpu) = bring_up(VexGpuConfig::default());
    model.wedge();
    let ticket = gpu
        .submit(SubmitRequest {
            commands: nop_stream(),
            ..Default::default()
        })
        .expect("submit");
    assert_eq!(gpu.wait_job(ticket.job_id, 0), Err(GpuError::Timeout));
    model.unwedge();
    gpu.wait_job(ticket.job_id, 2_000).expect("completion");
}
