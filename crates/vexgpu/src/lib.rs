#![forbid(unsafe_code)]

//! Command-submission core for the VexGPU FPGA graphics device.
//!
//! The driver accepts user-supplied command buffers, validates them, places
//! them into hardware-visible ring buffers, schedules them across
//! priority-ordered queues honoring dependencies and admission limits, and
//! signals completion through memory-backed fences. The device exposes its
//! state through a memory-mapped register window, per-queue doorbells and a
//! single shared interrupt line; the [`hal`] traits abstract those so the
//! same core runs against real hardware or the `vexgpu-model` software
//! device.
//!
//! The entry point is [`VexGpu::probe`], which brings the subsystems up in
//! dependency order and hands back the device context:
//!
//! ```no_run
//! use vexgpu::{FenceMode, GpuPlatform, SubmitFlags, SubmitRequest, VexGpu, VexGpuConfig};
//!
//! # fn platform() -> GpuPlatform { unimplemented!() }
//! let gpu = VexGpu::probe(platform(), VexGpuConfig::default())?;
//!
//! let mut commands = vexgpu::cmd::CmdWriter::new();
//! commands.nop();
//! let ticket = gpu.submit(SubmitRequest {
//!     commands: commands.finish(),
//!     fence: FenceMode::Auto,
//!     flags: SubmitFlags::SYNC,
//!     ..Default::default()
//! })?;
//! assert!(gpu.fence_signaled(ticket.fence.unwrap().0, ticket.fence.unwrap().1));
//! # Ok::<(), vexgpu::GpuError>(())
//! ```

pub mod cmd;
pub mod device;
pub mod error;
pub mod fence;
pub mod hal;
pub mod irq;
pub mod regs;
pub mod reset;
pub mod ring;
pub mod sched;
pub mod shader;
pub mod validate;

pub use device::{
    DeviceInfo, DeviceStats, FenceMode, GpuPlatform, JobTicket, RingStats, SubmitFlags,
    SubmitRequest, VexGpu, VexGpuConfig,
};
pub use error::{GpuError, Result};
pub use regs::Version;
pub use reset::HealthStats;
pub use sched::{JobState, JobType, Priority, QueueStats, SchedStats};
pub use shader::ShaderType;
pub use validate::ValidateError;
