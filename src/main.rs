//! Entry point for the ncpatch patcher.
//!
//! Simple flow: parse args → load config and ROM header → patch targets.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ncpatch::config::{BuildConfig, Cli, Processor};
use ncpatch::header::RomHeader;
use ncpatch::patcher;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default = if cli.verbose { "debug" } else { cli.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = BuildConfig::load(Path::new("ncpatch.json"))
        .context("Could not load the build configuration.")?;

    let header = RomHeader::load(&config.rom.join("header.bin"))
        .context("Could not read the ROM header.")?;

    if let Some(target) = &config.arm7 {
        patcher::run_target(&config, Processor::Arm7, target, &header)
            .context("Could not patch the ARM7 target.")?;
    }
    if let Some(target) = &config.arm9 {
        patcher::run_target(&config, Processor::Arm9, target, &header)
            .context("Could not patch the ARM9 target.")?;
    }

    info!("All tasks finished.");
    Ok(())
}
