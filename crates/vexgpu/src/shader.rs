//! Shader instruction-memory accessor.
//!
//! Programs flow into the device through the SHADER_ADDR/SHADER_DATA
//! register pair, word-addressed within the 4 KiB instruction window.
//! Binary validation and slot bookkeeping belong to the shader manager; this
//! layer only moves words and flips the bind control.

use tracing::debug;

use crate::error::{GpuError, Result};
use crate::regs::{mmio, Registers};

/// Instruction window capacity in 32-bit words.
pub const INSTR_MEM_WORDS: u32 = mmio::INSTR_MEM_SIZE / 4;

/// Number of shader slots the bind control addresses.
pub const SHADER_SLOTS: u32 = 16;

const CTRL_VALID: u32 = 1 << 31;
const CTRL_TYPE_SHIFT: u32 = 8;
const CTRL_SLOT_MASK: u32 = 0xF;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ShaderType {
    Vertex = 0,
    Fragment = 1,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ShaderMem;

impl ShaderMem {
    pub fn new() -> Self {
        Self
    }

    /// Writes `words` into instruction memory starting at `offset_words`.
    pub fn load(&self, regs: &Registers, offset_words: u32, words: &[u32]) -> Result<()> {
        let len = words.len() as u32;
        if len == 0 {
            return Err(GpuError::InvalidArgument("empty shader program".into()));
        }
        if offset_words >= INSTR_MEM_WORDS || INSTR_MEM_WORDS - offset_words < len {
            return Err(GpuError::InvalidArgument(format!(
                "shader program [{offset_words}, {}) exceeds {INSTR_MEM_WORDS}-word window",
                offset_words + len
            )));
        }
        for (i, &word) in words.iter().enumerate() {
            regs.write(mmio::SHADER_ADDR, offset_words + i as u32)?;
            regs.write(mmio::SHADER_DATA, word)?;
        }
        debug!(offset_words, len, "shader program loaded");
        Ok(())
    }

    /// Points the device at a program entry.
    pub fn set_entry(&self, regs: &Registers, pc: u32) -> Result<()> {
        if pc >= INSTR_MEM_WORDS {
            return Err(GpuError::InvalidArgument(format!(
                "shader entry {pc} outside the {INSTR_MEM_WORDS}-word window"
            )));
        }
        regs.write(mmio::SHADER_PC, pc)
    }

    /// Binds `slot` as the active shader of the given type. Whether the slot
    /// holds a program is the shader manager's concern.
    pub fn bind(&self, regs: &Registers, slot: u32, ty: ShaderType) -> Result<()> {
        if slot >= SHADER_SLOTS {
            return Err(GpuError::InvalidArgument(format!(
                "shader slot {slot} outside [0, {SHADER_SLOTS})"
            )));
        }
        let ctrl = CTRL_VALID | ((ty as u32) << CTRL_TYPE_SHIFT) | (slot & CTRL_SLOT_MASK);
        regs.write(mmio::SHADER_CTRL, ctrl)?;
        debug!(slot, ?ty, "shader bound");
        Ok(())
    }
}
