//! The main processor binary.
//!
//! Besides plain code bytes the main binary carries a module-parameters
//! block and, at the tail of its data, the auto-load directory: a list of
//! (address, size, bss size) triples the console's loader copies into place
//! at boot. New code is installed into the main binary by shifting that
//! directory up and prepending a fresh entry, so the image keeps its own
//! little layout rules close to the byte buffer here.

use anyhow::{bail, Context, Result};
use std::path::Path;
use tracing::debug;

use crate::image::CodeImage;

/// The module-parameters block embedded in the main binary.
///
/// Located through the word stored 4 bytes before the auto-load-list hook
/// named by the ROM header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleParams {
    pub autoload_list_start: u32,
    pub autoload_list_end: u32,
    pub autoload_start: u32,
    pub static_bss_start: u32,
    pub static_bss_end: u32,
    pub compressed_static_end: u32,
    pub sdk_version: u32,
    pub nitrocode_be: u32,
    pub nitrocode_le: u32,
}

impl ModuleParams {
    pub const SIZE: usize = 36;

    fn parse(bytes: &[u8]) -> Self {
        let word = |off: usize| {
            u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
        };
        Self {
            autoload_list_start: word(0),
            autoload_list_end: word(4),
            autoload_start: word(8),
            static_bss_start: word(12),
            static_bss_end: word(16),
            compressed_static_end: word(20),
            sdk_version: word(24),
            nitrocode_be: word(28),
            nitrocode_le: word(32),
        }
    }

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        for (i, v) in [
            self.autoload_list_start,
            self.autoload_list_end,
            self.autoload_start,
            self.static_bss_start,
            self.static_bss_end,
            self.compressed_static_end,
            self.sdk_version,
            self.nitrocode_be,
            self.nitrocode_le,
        ]
        .into_iter()
        .enumerate()
        {
            out[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
        out
    }
}

/// One auto-load directory entry.
///
/// Serialized as the `(address, size, bss_size)` triple; `data_off` is the
/// derived in-file offset of the segment's bytes and is not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoLoadEntry {
    pub address: u32,
    pub size: u32,
    pub bss_size: u32,
    pub data_off: u32,
}

impl AutoLoadEntry {
    pub const SIZE: usize = 12;
}

/// The loaded main binary.
#[derive(Debug)]
pub struct ArmImage {
    ram_address: u32,
    data: Vec<u8>,
    dirty: bool,
    module_params_off: usize,
    pub module_params: ModuleParams,
    pub autoload: Vec<AutoLoadEntry>,
}

impl ArmImage {
    pub fn load(path: &Path, entry_address: u32, ram_address: u32, autoload_hook: u32) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("could not read {}", path.display()))?;
        Self::parse(data, entry_address, ram_address, autoload_hook)
            .with_context(|| format!("malformed main binary {}", path.display()))
    }

    pub fn parse(
        data: Vec<u8>,
        entry_address: u32,
        ram_address: u32,
        autoload_hook: u32,
    ) -> Result<Self> {
        let file_off = |addr: u32, len: usize| -> Result<usize> {
            let off = addr
                .checked_sub(ram_address)
                .map(|o| o as usize)
                .filter(|&o| o + len <= data.len())
                .with_context(|| format!("address {addr:#010X} is outside the binary"))?;
            Ok(off)
        };

        let hook_off = file_off(autoload_hook.wrapping_sub(4), 4)
            .context("bad auto-load-list hook offset")?;
        let params_addr = u32::from_le_bytes([
            data[hook_off],
            data[hook_off + 1],
            data[hook_off + 2],
            data[hook_off + 3],
        ]);
        let module_params_off = file_off(params_addr, ModuleParams::SIZE)
            .context("bad module-parameters address")?;
        let module_params =
            ModuleParams::parse(&data[module_params_off..module_params_off + ModuleParams::SIZE]);
        debug!("module parameters at {params_addr:#010X} (entry {entry_address:#010X})");

        if module_params.compressed_static_end != 0 {
            bail!("the main binary is compressed, which is not supported");
        }

        let list_start = file_off(module_params.autoload_list_start, 0)
            .context("bad auto-load list start")?;
        let list_end = file_off(module_params.autoload_list_end, 0)
            .context("bad auto-load list end")?;
        if list_end < list_start || (list_end - list_start) % AutoLoadEntry::SIZE != 0 {
            bail!("the auto-load list has an invalid extent");
        }

        let mut autoload = Vec::with_capacity((list_end - list_start) / AutoLoadEntry::SIZE);
        let mut data_off = module_params
            .autoload_start
            .checked_sub(ram_address)
            .context("bad auto-load data start")?;
        for off in (list_start..list_end).step_by(AutoLoadEntry::SIZE) {
            let word = |o: usize| {
                u32::from_le_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]])
            };
            let entry = AutoLoadEntry {
                address: word(off),
                size: word(off + 4),
                bss_size: word(off + 8),
                data_off,
            };
            data_off += entry.size;
            autoload.push(entry);
        }

        Ok(Self {
            ram_address,
            data,
            dirty: false,
            module_params_off,
            module_params,
            autoload,
        })
    }

    pub fn ram_address(&self) -> u32 {
        self.ram_address
    }

    /// Re-serializes the module-parameters block into the image bytes.
    pub fn flush_module_params(&mut self) {
        let off = self.module_params_off;
        let bytes = self.module_params.to_bytes();
        self.data_mut()[off..off + ModuleParams::SIZE].copy_from_slice(&bytes);
    }

    /// Writes the auto-load directory triples starting at `file_off`.
    pub fn write_autoload_list(&mut self, file_off: usize) {
        let entries = self.autoload.clone();
        let data = self.data_mut();
        let mut off = file_off;
        for entry in entries {
            data[off..off + 4].copy_from_slice(&entry.address.to_le_bytes());
            data[off + 4..off + 8].copy_from_slice(&entry.size.to_le_bytes());
            data[off + 8..off + 12].copy_from_slice(&entry.bss_size.to_le_bytes());
            off += AutoLoadEntry::SIZE;
        }
    }
}

impl CodeImage for ArmImage {
    fn ram_base(&self) -> u32 {
        self.ram_address
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn data_mut(&mut self) -> &mut Vec<u8> {
        self.dirty = true;
        &mut self.data
    }

    fn dirty(&self) -> bool {
        self.dirty
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const RAM: u32 = 0x0200_0000;

    /// Builds a small synthetic main binary:
    /// module params at 0x100, auto-load data at 0x140, list at 0x1A0.
    pub(crate) fn sample_data() -> Vec<u8> {
        let mut data = vec![0u8; 0x200];
        // Hook word: module params live at RAM+0x100.
        data[0x4C..0x50].copy_from_slice(&(RAM + 0x100).to_le_bytes());
        let params = ModuleParams {
            autoload_list_start: RAM + 0x1A0,
            autoload_list_end: RAM + 0x1B8,
            autoload_start: RAM + 0x140,
            ..ModuleParams::default()
        };
        data[0x100..0x100 + ModuleParams::SIZE].copy_from_slice(&params.to_bytes());
        for (i, (addr, size, bss)) in
            [(0x027E_0000u32, 0x20u32, 0x10u32), (0x027F_0000, 0x08, 0x00)]
                .into_iter()
                .enumerate()
        {
            let off = 0x1A0 + i * AutoLoadEntry::SIZE;
            data[off..off + 4].copy_from_slice(&addr.to_le_bytes());
            data[off + 4..off + 8].copy_from_slice(&size.to_le_bytes());
            data[off + 8..off + 12].copy_from_slice(&bss.to_le_bytes());
        }
        data
    }

    pub(crate) fn sample_image() -> ArmImage {
        ArmImage::parse(sample_data(), RAM, RAM, RAM + 0x50).unwrap()
    }

    #[test]
    fn parses_module_params_and_autoload_list() {
        let img = sample_image();
        assert_eq!(img.module_params.autoload_list_start, RAM + 0x1A0);
        assert_eq!(img.autoload.len(), 2);
        assert_eq!(img.autoload[0].address, 0x027E_0000);
        assert_eq!(img.autoload[0].data_off, 0x140);
        assert_eq!(img.autoload[1].data_off, 0x160);
        assert!(!img.dirty());
    }

    #[test]
    fn flush_module_params_round_trips() {
        let mut img = sample_image();
        img.module_params.autoload_list_start += 0x40;
        img.module_params.autoload_list_end += 0x4C;
        img.flush_module_params();
        assert!(img.dirty());
        let reparsed = ModuleParams::parse(&img.data()[0x100..0x100 + ModuleParams::SIZE]);
        assert_eq!(reparsed, img.module_params);
    }

    #[test]
    fn compressed_main_binary_is_rejected() {
        let mut data = vec![0u8; 0x200];
        data[0x4C..0x50].copy_from_slice(&(RAM + 0x100).to_le_bytes());
        let params = ModuleParams {
            autoload_list_start: RAM + 0x1A0,
            autoload_list_end: RAM + 0x1A0,
            autoload_start: RAM + 0x140,
            compressed_static_end: RAM + 0x180,
            ..ModuleParams::default()
        };
        data[0x100..0x100 + ModuleParams::SIZE].copy_from_slice(&params.to_bytes());
        let err = ArmImage::parse(data, RAM, RAM, RAM + 0x50).unwrap_err();
        assert!(err.to_string().contains("compressed"));
    }
}
