//! ROM header fields.
//!
//! Only the handful of header words the patch engine needs are parsed:
//! per-processor entry address, RAM load address, and the auto-load-list
//! hook offset used to locate the module parameters inside the main binary.

use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::config::Processor;

/// Load parameters of one processor's main binary.
#[derive(Debug, Clone, Copy)]
pub struct CpuParams {
    pub entry_address: u32,
    pub ram_address: u32,
    pub autoload_hook: u32,
}

/// The header words consumed from `header.bin`.
#[derive(Debug, Clone, Copy)]
pub struct RomHeader {
    pub arm9: CpuParams,
    pub arm7: CpuParams,
}

// Fixed field offsets inside the header.
const ARM9_ENTRY: usize = 0x24;
const ARM9_RAM: usize = 0x28;
const ARM7_ENTRY: usize = 0x34;
const ARM7_RAM: usize = 0x38;
const ARM9_AUTOLOAD_HOOK: usize = 0x70;
const ARM7_AUTOLOAD_HOOK: usize = 0x74;

impl RomHeader {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("could not read {}", path.display()))?;
        if bytes.len() < 0x78 {
            bail!("{} is truncated ({} bytes)", path.display(), bytes.len());
        }
        let word = |off: usize| {
            u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
        };
        Ok(Self {
            arm9: CpuParams {
                entry_address: word(ARM9_ENTRY),
                ram_address: word(ARM9_RAM),
                autoload_hook: word(ARM9_AUTOLOAD_HOOK),
            },
            arm7: CpuParams {
                entry_address: word(ARM7_ENTRY),
                ram_address: word(ARM7_RAM),
                autoload_hook: word(ARM7_AUTOLOAD_HOOK),
            },
        })
    }

    pub fn cpu(&self, processor: Processor) -> &CpuParams {
        match processor {
            Processor::Arm9 => &self.arm9,
            Processor::Arm7 => &self.arm7,
        }
    }
}
