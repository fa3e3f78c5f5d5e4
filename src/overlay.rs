//! Overlay binaries and the overlay table.
//!
//! An overlay is a code+data chunk loaded into a fixed RAM window at
//! runtime. The overlay table is a flat on-disk array of 32-byte records
//! describing each overlay's RAM address, sizes, static-init range and
//! compression state; the engine rewrites entries for every overlay it
//! ships and always ships uncompressed.

use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::image::CodeImage;

/// Low bit of [`OvtEntry::flag`]: the on-disk payload is compressed.
pub const FLAG_COMPRESSED: u8 = 1;

/// One overlay-table record (32 packed little-endian bytes on disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OvtEntry {
    pub overlay_id: u32,
    pub ram_address: u32,
    pub ram_size: u32,
    pub bss_size: u32,
    pub sinit_start: u32,
    pub sinit_end: u32,
    pub file_id: u32,
    /// Size of the compressed payload; 24 bits on disk.
    pub compressed: u32,
    pub flag: u8,
}

impl OvtEntry {
    pub const SIZE: usize = 32;

    pub fn parse(bytes: &[u8]) -> Self {
        let word = |off: usize| {
            u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
        };
        let packed = word(0x1C);
        Self {
            overlay_id: word(0x00),
            ram_address: word(0x04),
            ram_size: word(0x08),
            bss_size: word(0x0C),
            sinit_start: word(0x10),
            sinit_end: word(0x14),
            file_id: word(0x18),
            compressed: packed & 0x00FF_FFFF,
            flag: (packed >> 24) as u8,
        }
    }

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut put = |off: usize, v: u32| out[off..off + 4].copy_from_slice(&v.to_le_bytes());
        put(0x00, self.overlay_id);
        put(0x04, self.ram_address);
        put(0x08, self.ram_size);
        put(0x0C, self.bss_size);
        put(0x10, self.sinit_start);
        put(0x14, self.sinit_end);
        put(0x18, self.file_id);
        put(0x1C, (self.compressed & 0x00FF_FFFF) | (u32::from(self.flag) << 24));
        out
    }
}

/// The on-disk overlay directory.
#[derive(Debug, Clone, Default)]
pub struct OverlayTable {
    pub entries: Vec<OvtEntry>,
}

impl OverlayTable {
    pub fn parse(bytes: &[u8], path: &Path) -> Result<Self> {
        if bytes.len() % OvtEntry::SIZE != 0 {
            bail!(
                "{} is truncated: {} bytes is not a multiple of {}",
                path.display(),
                bytes.len(),
                OvtEntry::SIZE
            );
        }
        let entries = bytes
            .chunks_exact(OvtEntry::SIZE)
            .map(OvtEntry::parse)
            .collect();
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("could not read {}", path.display()))?;
        Self::parse(&bytes, path)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * OvtEntry::SIZE);
        for entry in &self.entries {
            out.extend_from_slice(&entry.to_bytes());
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.serialize())
            .with_context(|| format!("could not write {}", path.display()))
    }
}

/// One loaded overlay binary.
#[derive(Debug)]
pub struct OverlayImage {
    id: u32,
    ram_address: u32,
    data: Vec<u8>,
    dirty: bool,
    /// Pristine bytes pending a first-run backup write.
    backup: Option<Vec<u8>>,
}

impl OverlayImage {
    pub fn new(id: u32, ram_address: u32, data: Vec<u8>) -> Self {
        Self { id, ram_address, data, dirty: false, backup: None }
    }

    /// Loads an overlay from disk. The `compressed` bit comes from the
    /// overlay-table flag; compressed payloads are not supported, the run
    /// must start from a decompressed backup instead.
    pub fn load(path: &Path, ram_address: u32, compressed: bool, id: u32) -> Result<Self> {
        if compressed {
            bail!(
                "overlay {} ({}) is compressed, which is not supported",
                id,
                path.display()
            );
        }
        let data = std::fs::read(path)
            .with_context(|| format!("could not read {}", path.display()))?;
        Ok(Self::new(id, ram_address, data))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Remembers the current (pristine) bytes for a first-run backup.
    pub fn stash_backup(&mut self) {
        self.backup = Some(self.data.clone());
    }

    pub fn backup(&self) -> Option<&[u8]> {
        self.backup.as_deref()
    }
}

impl CodeImage for OverlayImage {
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
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample_entry() -> OvtEntry {
        OvtEntry {
            overlay_id: 3,
            ram_address: 0x0210_0000,
            ram_size: 0x8000,
            bss_size: 0x400,
            sinit_start: 0x0210_7F00,
            sinit_end: 0x0210_7F20,
            file_id: 3,
            compressed: 0x6F00,
            flag: FLAG_COMPRESSED | 2,
        }
    }

    #[test]
    fn ovt_entry_codec_is_bit_exact() {
        let entry = sample_entry();
        let bytes = entry.to_bytes();
        // The flag byte occupies the top byte of the last word.
        assert_eq!(bytes[0x1C..0x20], [0x00, 0x6F, 0x00, 0x03]);
        assert_eq!(OvtEntry::parse(&bytes), entry);
    }

    #[test]
    fn table_parse_rejects_truncated_input() {
        let path = PathBuf::from("arm9ovt.bin");
        let mut bytes = sample_entry().to_bytes().to_vec();
        bytes.push(0);
        assert!(OverlayTable::parse(&bytes, &path).is_err());
    }

    #[test]
    fn table_round_trips() {
        let path = PathBuf::from("arm9ovt.bin");
        let mut second = sample_entry();
        second.overlay_id = 4;
        second.flag = 0;
        let table = OverlayTable { entries: vec![sample_entry(), second] };
        let parsed = OverlayTable::parse(&table.serialize(), &path).unwrap();
        assert_eq!(parsed.entries, table.entries);
    }

    #[test]
    fn compressed_overlays_are_rejected_at_load() {
        let err = OverlayImage::load(&PathBuf::from("overlay9_0.bin"), 0, true, 0)
            .unwrap_err();
        assert!(err.to_string().contains("compressed"));
    }
}
