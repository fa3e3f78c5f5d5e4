//! Command-line and build configuration.
//!
//! The CLI surface is tiny (a verbosity switch); everything describing the
//! ROM and the patch targets comes from an `ncpatch.json` file in the
//! working directory: toolchain prefix, ROM filesystem directory, backup
//! directory, and one target block per processor with its regions and
//! object files.

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::utils::parse_number;

/// A post-link code patcher for DS ROM images.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Print per-intent diagnostics while patching.
    #[arg(short, long)]
    pub verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Which processor a target patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processor {
    Arm9,
    Arm7,
}

impl Processor {
    pub fn name(self) -> &'static str {
        match self {
            Processor::Arm9 => "ARM9",
            Processor::Arm7 => "ARM7",
        }
    }

    pub fn bin_name(self) -> &'static str {
        match self {
            Processor::Arm9 => "arm9.bin",
            Processor::Arm7 => "arm7.bin",
        }
    }

    pub fn ovt_name(self) -> &'static str {
        match self {
            Processor::Arm9 => "arm9ovt.bin",
            Processor::Arm7 => "arm7ovt.bin",
        }
    }

    /// Directory (and file-name stem) holding this processor's overlays.
    pub fn overlay_prefix(self) -> &'static str {
        match self {
            Processor::Arm9 => "overlay9",
            Processor::Arm7 => "overlay7",
        }
    }

    pub fn ldscript_name(self) -> &'static str {
        match self {
            Processor::Arm9 => "ldscript9.x",
            Processor::Arm7 => "ldscript7.x",
        }
    }

    pub fn elf_name(self) -> &'static str {
        match self {
            Processor::Arm9 => "arm9.elf",
            Processor::Arm7 => "arm7.elf",
        }
    }
}

/// Which binary a region's code targets.
///
/// The ordering puts `Main` below every overlay so that sorting regions in
/// descending order lists overlays first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Destination {
    Main,
    Overlay(u32),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Main => write!(f, "main"),
            Destination::Overlay(id) => write!(f, "overlay {id}"),
        }
    }
}

/// How a region's new-code base address is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionMode {
    #[default]
    Append,
    Replace,
    Create,
}

/// Configured address meaning "use the overlay's existing RAM address".
pub const ADDRESS_AUTO: u32 = 0xFFFF_FFFF;

/// A configurable span of code space targeted by a set of object files.
#[derive(Debug, Clone, Deserialize)]
pub struct Region {
    /// Target overlay id; absent means the main binary.
    #[serde(default)]
    pub overlay: Option<u32>,
    #[serde(default)]
    pub mode: RegionMode,
    #[serde(default = "default_address", deserialize_with = "de_address")]
    pub address: u32,
    #[serde(deserialize_with = "de_address")]
    pub length: u32,
    /// Relocatable objects compiled against this region.
    #[serde(default)]
    pub objects: Vec<PathBuf>,
}

impl Region {
    pub fn destination(&self) -> Destination {
        match self.overlay {
            None => Destination::Main,
            Some(id) => Destination::Overlay(id),
        }
    }
}

fn default_address() -> u32 {
    ADDRESS_AUTO
}

/// One relocatable object tagged with the region it belongs to.
#[derive(Debug, Clone)]
pub struct SourceJob {
    pub object: PathBuf,
    pub region: usize,
}

/// Per-processor target description.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    /// Build directory: linker script, linked ELF and rebuild state go here.
    pub build: PathBuf,
    /// Symbols file INCLUDEd by the synthesised linker script.
    pub symbols: PathBuf,
    /// Extra `-Wl,` suffixes appended to the linker invocation.
    #[serde(default)]
    pub ld_flags: String,
    /// Address of the heap-base word in the main binary.
    #[serde(deserialize_with = "de_address")]
    pub arena_lo: u32,
    pub regions: Vec<Region>,
}

impl TargetConfig {
    /// Flattens the per-region object lists, preserving input order.
    pub fn jobs(&self) -> Vec<SourceJob> {
        self.regions
            .iter()
            .enumerate()
            .flat_map(|(region, r)| {
                r.objects
                    .iter()
                    .map(move |object| SourceJob { object: object.clone(), region })
            })
            .collect()
    }
}

/// The whole `ncpatch.json` file.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    /// Toolchain prefix, e.g. `arm-none-eabi-`; the engine runs `<prefix>gcc`.
    pub toolchain: String,
    /// ROM filesystem directory holding the original binaries.
    pub rom: PathBuf,
    #[serde(default = "default_backup")]
    pub backup: PathBuf,
    #[serde(default)]
    pub arm9: Option<TargetConfig>,
    #[serde(default)]
    pub arm7: Option<TargetConfig>,
}

fn default_backup() -> PathBuf {
    PathBuf::from("backup")
}

impl BuildConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not read {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("could not parse {}", path.display()))
    }
}

/// Accepts addresses as JSON numbers or `"0x..."` strings.
fn de_address<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => parse_number(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid address {s:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_config() {
        let text = r#"{
            "toolchain": "arm-none-eabi-",
            "rom": "rom",
            "arm9": {
                "build": "build/arm9",
                "symbols": "symbols9.x",
                "arena_lo": "0x02004F60",
                "regions": [
                    { "length": "0x8000", "objects": ["main.o", "extra.o"] },
                    { "overlay": 2, "mode": "replace", "address": "0x02200000",
                      "length": 16384, "objects": ["ov2.o"] }
                ]
            }
        }"#;
        let config: BuildConfig = serde_json::from_str(text).unwrap();
        assert_eq!(config.backup, PathBuf::from("backup"));
        let arm9 = config.arm9.unwrap();
        assert_eq!(arm9.arena_lo, 0x02004F60);
        assert_eq!(arm9.regions[0].destination(), Destination::Main);
        assert_eq!(arm9.regions[0].address, ADDRESS_AUTO);
        assert_eq!(arm9.regions[1].destination(), Destination::Overlay(2));
        assert_eq!(arm9.regions[1].mode, RegionMode::Replace);
        assert_eq!(arm9.regions[1].length, 16384);
        let jobs = arm9.jobs();
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[2].region, 1);
    }

    #[test]
    fn destinations_sort_overlays_above_main() {
        let mut dests = vec![Destination::Overlay(2), Destination::Main, Destination::Overlay(0)];
        dests.sort();
        assert_eq!(
            dests,
            vec![Destination::Main, Destination::Overlay(0), Destination::Overlay(2)]
        );
    }
}
