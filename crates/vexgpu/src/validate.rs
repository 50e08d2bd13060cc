//! Command stream validation.
//!
//! Submission payloads are untrusted. The validator walks the kernel copy of
//! the stream before any ring write, enforcing per-opcode size bounds and
//! domain rules, and rewrites privileged opcodes to NOP for unprivileged
//! contexts (the header size is preserved so the stream stays walkable).

use thiserror::Error;

use crate::cmd::{CmdHeader, Opcode, DMA_MAX_BYTES, DRAW_MAX_VERTICES};
use crate::error::GpuError;
use crate::regs::Registers;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidateError {
    #[error("unknown opcode {opcode:#04x} at dword {at}")]
    UnknownOpcode { opcode: u8, at: usize },
    #[error("opcode {opcode:#04x} size {size_dw} outside [{min_dw}, {max_dw}] at dword {at}")]
    BadSize {
        opcode: u8,
        size_dw: u8,
        min_dw: u8,
        max_dw: u8,
        at: usize,
    },
    #[error("record at dword {at} overruns the stream")]
    Truncated { at: usize },
    #[error("DRAW vertex count {0} outside [1, 65536]")]
    BadVertexCount(u32),
    #[error("DRAW instance count must be non-zero")]
    BadInstanceCount,
    #[error("DRAW with no vertex buffer configured")]
    NoVertexBuffer,
    #[error("DMA size {0} outside [1, 16 MiB]")]
    BadDmaSize(u32),
    #[error("DMA addresses and size must be 4-byte aligned")]
    UnalignedDma,
    #[error("fence address must be 4-byte aligned")]
    UnalignedFence,
}

impl From<ValidateError> for GpuError {
    fn from(err: ValidateError) -> Self {
        GpuError::InvalidArgument(err.to_string())
    }
}

struct OpcodeRule {
    opcode: Opcode,
    min_dw: u8,
    max_dw: u8,
    privileged: bool,
}

static RULES: [OpcodeRule; 8] = [
    OpcodeRule {
        opcode: Opcode::Nop,
        min_dw: 1,
        max_dw: 1,
        privileged: false,
    },
    OpcodeRule {
        opcode: Opcode::Draw,
        min_dw: 5,
        max_dw: 8,
        privileged: false,
    },
    OpcodeRule {
        opcode: Opcode::Compute,
        min_dw: 4,
        max_dw: 8,
        privileged: false,
    },
    OpcodeRule {
        opcode: Opcode::Dma,
        min_dw: 4,
        max_dw: 5,
        privileged: false,
    },
    OpcodeRule {
        opcode: Opcode::Fence,
        min_dw: 3,
        max_dw: 3,
        privileged: false,
    },
    OpcodeRule {
        opcode: Opcode::Wait,
        min_dw: 2,
        max_dw: 3,
        privileged: false,
    },
    OpcodeRule {
        opcode: Opcode::RegWrite,
        min_dw: 3,
        max_dw: 3,
        privileged: true,
    },
    OpcodeRule {
        opcode: Opcode::RegRead,
        min_dw: 3,
        max_dw: 3,
        privileged: true,
    },
];

fn rule_for(opcode: u8) -> Option<&'static OpcodeRule> {
    RULES.iter().find(|r| r.opcode as u8 == opcode)
}

/// Walks `stream` and enforces the per-opcode rules; privileged records are
/// rewritten to NOP in place unless `privileged` is set. On error the stream
/// may be partially rewritten but nothing has touched the ring.
pub fn validate_stream(
    regs: &Registers,
    stream: &mut [u32],
    privileged: bool,
) -> Result<(), ValidateError> {
    let mut at = 0usize;
    while at < stream.len() {
        let hdr = CmdHeader::unpack(stream[at]);
        let rule = rule_for(hdr.opcode).ok_or(ValidateError::UnknownOpcode {
            opcode: hdr.opcode,
            at,
        })?;

        if hdr.size_dw < rule.min_dw || hdr.size_dw > rule.max_dw {
            return Err(ValidateError::BadSize {
                opcode: hdr.opcode,
                size_dw: hdr.size_dw,
                min_dw: rule.min_dw,
                max_dw: rule.max_dw,
                at,
            });
        }

        let size = hdr.size_dw as usize;
        if at + size > stream.len() {
            return Err(ValidateError::Truncated { at });
        }

        match rule.opcode {
            Opcode::Draw => validate_draw(regs, &stream[at..at + size])?,
            Opcode::Dma => validate_dma(&stream[at..at + size])?,
            Opcode::Fence => validate_fence(&stream[at..at + size])?,
            _ => {}
        }

        if rule.privileged && !privileged {
            tracing::warn!(
                opcode = hdr.opcode,
                at,
                "rewriting privileged record to NOP"
            );
            stream[at] = CmdHeader {
                opcode: Opcode::Nop as u8,
                size_dw: hdr.size_dw,
                flags: hdr.flags,
            }
            .pack();
        }

        at += size;
    }
    Ok(())
}

fn validate_draw(regs: &Registers, record: &[u32]) -> Result<(), ValidateError> {
    let vertex_count = record[1];
    let instance_count = record[2];
    if vertex_count == 0 || vertex_count > DRAW_MAX_VERTICES {
        return Err(ValidateError::BadVertexCount(vertex_count));
    }
    if instance_count == 0 {
        return Err(ValidateError::BadInstanceCount);
    }
    if regs.read(crate::regs::mmio::VERTEX_BASE).unwrap_or(0) == 0 {
        return Err(ValidateError::NoVertexBuffer);
    }
    Ok(())
}

fn validate_dma(record: &[u32]) -> Result<(), ValidateError> {
    let src = record[1];
    let dst = record[2];
    let size = record[3];
    if size == 0 || size > DMA_MAX_BYTES {
        return Err(ValidateError::BadDmaSize(size));
    }
    if src % 4 != 0 || dst % 4 != 0 || size % 4 != 0 {
        return Err(ValidateError::UnalignedDma);
    }
    Ok(())
}

fn validate_fence(record: &[u32]) -> Result<(), ValidateError> {
    if record[1] % 4 != 0 {
        return Err(ValidateError::UnalignedFence);
    }
    Ok(())
}
