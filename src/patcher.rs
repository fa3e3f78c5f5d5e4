//! The patch engine.
//!
//! One `run_target` call performs a full pass for one processor:
//!
//! 1. create the build and backup directories
//! 2. load the main binary and the overlay table (backup-aware), pre-load
//!    the overlays patched by the previous pass
//! 3. compute the new-code base address of every region
//! 4. discover intents, synthesise the linker script, run the linker
//! 5. resolve the linked ELF and apply everything
//! 6. rewrite the rebuild hand-off and save the binaries
//!
//! All per-run state lives on this stack; the only persisted effects are
//! the edited binaries, the overlay table, the rebuild state and the
//! first-run backups. Edits already on disk are not rolled back on error;
//! the backups exist precisely so a fixed-up run can start clean.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::apply;
use crate::arm::ArmImage;
use crate::config::{
    BuildConfig, Destination, Processor, RegionMode, SourceJob, TargetConfig, ADDRESS_AUTO,
};
use crate::elf;
use crate::header::RomHeader;
use crate::image::CodeImage;
use crate::intent::{self, Discovery};
use crate::ldscript;
use crate::link;
use crate::overlay::{OverlayImage, OverlayTable, OvtEntry, FLAG_COMPRESSED};
use crate::rebuild::RebuildState;
use crate::resolve::{self, Resolution};

/// The main binary, the overlay table, and the lazily loaded overlays of
/// one target, with their backup bookkeeping.
pub struct ImageCache {
    processor: Processor,
    rom_dir: PathBuf,
    backup_dir: PathBuf,
    arm: ArmImage,
    table: OverlayTable,
    /// Pristine table copy pending a first-run backup write.
    table_backup: Option<OverlayTable>,
    overlays: BTreeMap<u32, OverlayImage>,
}

impl ImageCache {
    /// Loads the main binary and the overlay table, preferring backups and
    /// creating them on first contact.
    pub fn open(
        processor: Processor,
        rom_dir: PathBuf,
        backup_dir: PathBuf,
        header: &RomHeader,
    ) -> Result<Self> {
        let cpu = header.cpu(processor);

        let bin_name = processor.bin_name();
        let bak_path = backup_dir.join(bin_name);
        let arm = if bak_path.exists() {
            ArmImage::load(&bak_path, cpu.entry_address, cpu.ram_address, cpu.autoload_hook)?
        } else {
            let image = ArmImage::load(
                &rom_dir.join(bin_name),
                cpu.entry_address,
                cpu.ram_address,
                cpu.autoload_hook,
            )?;
            fs::write(&bak_path, image.data())
                .with_context(|| format!("could not write {}", bak_path.display()))?;
            image
        };

        info!("Loading the overlay table...");
        let ovt_name = processor.ovt_name();
        let bak_path = backup_dir.join(ovt_name);
        let (table, table_backup) = if bak_path.exists() {
            (OverlayTable::load(&bak_path)?, None)
        } else {
            let rom_path = rom_dir.join(ovt_name);
            if !rom_path.exists() {
                bail!("could not find {}", rom_path.display());
            }
            let table = OverlayTable::load(&rom_path)?;
            let backup = table.clone();
            (table, Some(backup))
        };

        Ok(Self {
            processor,
            rom_dir,
            backup_dir,
            arm,
            table,
            table_backup,
            overlays: BTreeMap::new(),
        })
    }

    pub fn arm(&self) -> &ArmImage {
        &self.arm
    }

    pub fn arm_mut(&mut self) -> &mut ArmImage {
        &mut self.arm
    }

    pub fn table(&self) -> &OverlayTable {
        &self.table
    }

    fn overlay_rel_path(&self, id: u32) -> PathBuf {
        let prefix = self.processor.overlay_prefix();
        PathBuf::from(prefix).join(format!("{prefix}_{id}.bin"))
    }

    fn ensure_overlay(&mut self, id: u32) -> Result<()> {
        if self.overlays.contains_key(&id) {
            return Ok(());
        }
        let rel = self.overlay_rel_path(id);
        let entry = self
            .table
            .entries
            .get_mut(id as usize)
            .with_context(|| format!("overlay {id} is not present in the overlay table"))?;
        let compressed = entry.flag & FLAG_COMPRESSED != 0;

        let bak_path = self.backup_dir.join(&rel);
        let image = if bak_path.exists() {
            OverlayImage::load(&bak_path, entry.ram_address, compressed, id)?
        } else {
            let mut image =
                OverlayImage::load(&self.rom_dir.join(&rel), entry.ram_address, compressed, id)?;
            image.stash_backup();
            image
        };

        // The shipped product is always uncompressed.
        entry.flag = 0;
        if let Some(backup) = &mut self.table_backup {
            backup.entries[id as usize].flag = 0;
        }

        self.overlays.insert(id, image);
        Ok(())
    }

    pub fn overlay_mut(&mut self, id: u32) -> Result<&mut OverlayImage> {
        self.ensure_overlay(id)?;
        Ok(self.overlays.get_mut(&id).expect("overlay was just loaded"))
    }

    /// The overlay image together with its table entry, for payload
    /// installation.
    pub fn overlay_with_entry(&mut self, id: u32) -> Result<(&mut OverlayImage, &mut OvtEntry)> {
        self.ensure_overlay(id)?;
        let image = self.overlays.get_mut(&id).expect("overlay was just loaded");
        let entry = self
            .table
            .entries
            .get_mut(id as usize)
            .expect("entry was checked at load");
        Ok((image, entry))
    }

    pub fn image_mut(&mut self, dest: Destination) -> Result<&mut dyn CodeImage> {
        match dest {
            Destination::Main => Ok(&mut self.arm),
            Destination::Overlay(id) => Ok(self.overlay_mut(id)?),
        }
    }

    /// Overlays that were loaded and actually written to this pass.
    pub fn dirty_overlays(&self) -> Vec<u32> {
        self.overlays
            .values()
            .filter(|image| image.dirty())
            .map(|image| image.id())
            .collect()
    }

    /// Writes everything back: overlays (with their pending pristine
    /// backups), the overlay table (backup first), then the main binary.
    pub fn save(&self) -> Result<()> {
        for image in self.overlays.values() {
            let rel = self.overlay_rel_path(image.id());
            let rom_path = self.rom_dir.join(&rel);
            fs::write(&rom_path, image.data())
                .with_context(|| format!("could not write {}", rom_path.display()))?;
            if let Some(pristine) = image.backup() {
                let bak_path = self.backup_dir.join(&rel);
                fs::write(&bak_path, pristine)
                    .with_context(|| format!("could not write {}", bak_path.display()))?;
            }
        }

        if let Some(backup) = &self.table_backup {
            backup.save(&self.backup_dir.join(self.processor.ovt_name()))?;
        }
        self.table.save(&self.rom_dir.join(self.processor.ovt_name()))?;

        let rom_path = self.rom_dir.join(self.processor.bin_name());
        fs::write(&rom_path, self.arm.data())
            .with_context(|| format!("could not write {}", rom_path.display()))?;
        Ok(())
    }
}

/// Computes every region's new-code base address.
///
/// The main binary appends at the current heap base; overlays append
/// behind their BSS, or start at the configured (or their existing)
/// address when replaced.
fn newcode_addresses(
    target: &TargetConfig,
    images: &ImageCache,
) -> Result<BTreeMap<Destination, u32>> {
    let mut addrs = BTreeMap::new();
    addrs.insert(Destination::Main, images.arm().read_u32(target.arena_lo));

    for region in &target.regions {
        let Destination::Overlay(id) = region.destination() else { continue };
        let entry = images
            .table()
            .entries
            .get(id as usize)
            .with_context(|| format!("overlay {id} is not present in the overlay table"))?;
        let addr = match region.mode {
            RegionMode::Append => entry.ram_address + entry.ram_size + entry.bss_size,
            RegionMode::Replace => {
                if region.address == ADDRESS_AUTO {
                    entry.ram_address
                } else {
                    region.address
                }
            }
            RegionMode::Create => region.address,
        };
        addrs.insert(region.destination(), addr);
    }
    Ok(addrs)
}

fn apply_all(
    processor: Processor,
    target: &TargetConfig,
    discovery: &Discovery,
    jobs: &[SourceJob],
    obj: &object::File,
    images: &mut ImageCache,
    resolution: &mut Resolution,
    newcode_addrs: &BTreeMap<Destination, u32>,
) -> Result<()> {
    apply::apply_intents(
        processor,
        &discovery.intents,
        jobs,
        obj,
        images,
        &mut resolution.autogen,
    )?;
    apply::install_payloads(
        target,
        &resolution.payloads,
        newcode_addrs,
        &resolution.autogen,
        images,
    )
}

/// Runs a full patch pass for one processor target.
pub fn run_target(
    config: &BuildConfig,
    processor: Processor,
    target: &TargetConfig,
    header: &RomHeader,
) -> Result<()> {
    info!("Patching the {} target...", processor.name());

    let rom_dir = absolute(&config.rom)?;
    let backup_dir = absolute(&config.backup)?;
    let build_dir = absolute(&target.build)?;

    for dir in [&build_dir, &backup_dir, &backup_dir.join(processor.overlay_prefix())] {
        fs::create_dir_all(dir)
            .with_context(|| format!("could not create directory {}", dir.display()))?;
    }

    let mut jobs = target.jobs();
    if jobs.is_empty() {
        bail!("there are no object files to link");
    }
    for job in &mut jobs {
        job.object = absolute(&job.object)?;
    }

    let mut images = ImageCache::open(processor, rom_dir, backup_dir, header)?;

    let rebuild_path = build_dir.join("rebuild.json");
    let mut rebuild = RebuildState::load(&rebuild_path);
    for &id in rebuild.patched(processor) {
        images.overlay_mut(id)?;
    }

    let newcode_addrs = newcode_addresses(target, &images)?;

    let mut discovery = intent::discover(&jobs, &target.regions)?;

    info!("Generating the linker script...");
    let symbols = absolute(&target.symbols)?;
    let elf_path = build_dir.join(processor.elf_name());
    let script = ldscript::synthesise(
        &symbols,
        &elf_path,
        &jobs,
        &target.regions,
        &discovery,
        &newcode_addrs,
    );
    ldscript::write_script(&build_dir.join(processor.ldscript_name()), &script)?;

    link::link(&config.toolchain, &build_dir, processor.ldscript_name(), &target.ld_flags)?;

    let mmap = elf::map_file(&elf_path)?;
    let obj = elf::parse(&mmap, &elf_path)?;
    let mut resolution = resolve::resolve(&obj, &mut discovery, &jobs)?;

    apply_all(
        processor,
        target,
        &discovery,
        &jobs,
        &obj,
        &mut images,
        &mut resolution,
        &newcode_addrs,
    )
    .with_context(|| format!("Failed to apply patches for the {} target.", processor.name()))?;

    rebuild.set_patched(processor, images.dirty_overlays());
    images.save()?;
    rebuild.save(&rebuild_path)?;

    info!("{} target patched.", processor.name());
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path)
        .with_context(|| format!("could not resolve the path {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm;
    use crate::overlay::OvtEntry;

    fn entry(id: u32, flag: u8) -> OvtEntry {
        OvtEntry {
            overlay_id: id,
            ram_address: 0x0210_0000,
            ram_size: 0x40,
            bss_size: 0x10,
            sinit_start: 0,
            sinit_end: 0,
            file_id: id,
            compressed: 0,
            flag,
        }
    }

    fn seed_rom(rom: &Path) {
        fs::create_dir_all(rom.join("overlay9")).unwrap();
        fs::write(rom.join("arm9.bin"), arm::tests::sample_data()).unwrap();
        let table = OverlayTable { entries: vec![entry(0, 2)] };
        fs::write(rom.join("arm9ovt.bin"), table.serialize()).unwrap();
        fs::write(rom.join("overlay9/overlay9_0.bin"), vec![0x5Au8; 0x40]).unwrap();
    }

    fn header() -> RomHeader {
        let cpu = crate::header::CpuParams {
            entry_address: arm::tests::RAM,
            ram_address: arm::tests::RAM,
            autoload_hook: arm::tests::RAM + 0x50,
        };
        RomHeader { arm9: cpu, arm7: cpu }
    }

    #[test]
    fn first_run_creates_backups_and_clears_flags() {
        let dir = tempfile::tempdir().unwrap();
        let rom = dir.path().join("rom");
        let backup = dir.path().join("backup");
        seed_rom(&rom);
        fs::create_dir_all(backup.join("overlay9")).unwrap();

        let mut cache =
            ImageCache::open(Processor::Arm9, rom.clone(), backup.clone(), &header()).unwrap();
        // The main binary is backed up immediately.
        assert_eq!(
            fs::read(backup.join("arm9.bin")).unwrap(),
            arm::tests::sample_data()
        );

        // Loading an overlay clears its flag in the live and backup tables.
        cache.overlay_mut(0).unwrap();
        assert_eq!(cache.table().entries[0].flag, 0);
        assert!(cache.dirty_overlays().is_empty());

        // Patch one word and save everything.
        cache.overlay_mut(0).unwrap().write_u32(0x0210_0000, 0xDEAD_BEEF);
        assert_eq!(cache.dirty_overlays(), vec![0]);
        cache.save().unwrap();

        // The backup keeps the pristine bytes, the ROM copy the patch.
        assert_eq!(
            fs::read(backup.join("overlay9/overlay9_0.bin")).unwrap(),
            vec![0x5Au8; 0x40]
        );
        let patched = fs::read(rom.join("overlay9/overlay9_0.bin")).unwrap();
        assert_eq!(&patched[0..4], &0xDEAD_BEEFu32.to_le_bytes());

        // The table was backed up with the loaded overlay's flag cleared.
        let bak_table = OverlayTable::load(&backup.join("arm9ovt.bin")).unwrap();
        assert_eq!(bak_table.entries[0].flag, 0);
    }

    #[test]
    fn second_run_prefers_backups() {
        let dir = tempfile::tempdir().unwrap();
        let rom = dir.path().join("rom");
        let backup = dir.path().join("backup");
        seed_rom(&rom);
        fs::create_dir_all(backup.join("overlay9")).unwrap();

        let mut cache =
            ImageCache::open(Processor::Arm9, rom.clone(), backup.clone(), &header()).unwrap();
        cache.overlay_mut(0).unwrap().write_u32(0x0210_0000, 0xDEAD_BEEF);
        cache.save().unwrap();

        // A fresh cache must see the pristine overlay through its backup.
        let mut cache =
            ImageCache::open(Processor::Arm9, rom.clone(), backup.clone(), &header()).unwrap();
        let overlay = cache.overlay_mut(0).unwrap();
        assert_eq!(overlay.read_u32(0x0210_0000), 0x5A5A_5A5A);
        // No new backup is pending on the second run.
        assert!(overlay.backup().is_none());
    }

    #[test]
    fn newcode_addresses_follow_region_modes() {
        let dir = tempfile::tempdir().unwrap();
        let rom = dir.path().join("rom");
        let backup = dir.path().join("backup");
        seed_rom(&rom);
        fs::create_dir_all(backup.join("overlay9")).unwrap();
        let cache =
            ImageCache::open(Processor::Arm9, rom.clone(), backup.clone(), &header()).unwrap();

        let target: TargetConfig = serde_json::from_str(
            r#"{
                "build": "build",
                "symbols": "symbols.x",
                "arena_lo": "0x02000060",
                "regions": [
                    { "length": "0x8000" },
                    { "overlay": 0, "mode": "append", "length": "0x1000" },
                    { "overlay": 0, "mode": "replace", "length": "0x1000" },
                    { "overlay": 0, "mode": "replace", "address": "0x02300000",
                      "length": "0x1000" }
                ]
            }"#,
        )
        .unwrap();

        // arenaLo holds 0 in the synthetic image.
        let addrs = newcode_addresses(&target, &cache).unwrap();
        assert_eq!(addrs[&Destination::Main], 0);
        // Append: ram + size + bss; the later replace regions overwrite
        // the map entry in declaration order.
        assert_eq!(addrs[&Destination::Overlay(0)], 0x0230_0000);

        let append_only = TargetConfig {
            regions: target.regions[..2].to_vec(),
            ..target.clone()
        };
        let addrs = newcode_addresses(&append_only, &cache).unwrap();
        assert_eq!(addrs[&Destination::Overlay(0)], 0x0210_0000 + 0x40 + 0x10);

        let auto_replace = TargetConfig {
            regions: vec![target.regions[2].clone()],
            ..target.clone()
        };
        let addrs = newcode_addresses(&auto_replace, &cache).unwrap();
        assert_eq!(addrs[&Destination::Overlay(0)], 0x0210_0000);
    }
}
