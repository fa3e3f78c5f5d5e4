//! External linker invocation.
//!
//! The synthesised script carries the inputs and the output path, so the
//! command line is just `<prefix>gcc -Wl,--gc-sections,-T<script>` plus any
//! user-supplied `-Wl,` suffixes, run from the build directory.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::Command;
use tracing::{debug, info};

pub fn link(toolchain: &str, build_dir: &Path, script_name: &str, ld_flags: &str) -> Result<()> {
    info!("Linking the ARM binary...");

    let program = format!("{toolchain}gcc");
    let mut wl_arg = format!("-Wl,--gc-sections,-T{script_name}");
    if !ld_flags.is_empty() {
        wl_arg.push(',');
        wl_arg.push_str(ld_flags);
    }
    debug!("{program} {wl_arg}");

    let output = Command::new(&program)
        .arg(&wl_arg)
        .current_dir(build_dir)
        .output()
        .with_context(|| {
            format!("the build toolchain {program:?} was not found or could not be started")
        })?;

    if !output.status.success() {
        bail!(
            "the linker exited with {}:\n{}{}",
            output.status,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );
    }
    Ok(())
}
