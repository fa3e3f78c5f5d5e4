//! 32-bit ELF views.
//!
//! The engine only ever reads ELF files: relocatable objects during intent
//! discovery and the linked executable afterwards. Inputs are memory-mapped
//! and parsed with the `object` crate; callers keep the mapping alive for as
//! long as they hold the parsed view.

use anyhow::{bail, Context, Result};
use memmap2::Mmap;
use object::read::{Object, Symbol};
use object::Architecture;
use std::fs::File;
use std::path::Path;

/// Memory-maps a file for parsing.
pub fn map_file(path: &Path) -> Result<Mmap> {
    let file = File::open(path)
        .with_context(|| format!("could not open {}", path.display()))?;
    let mmap = unsafe { Mmap::map(&file) }
        .with_context(|| format!("could not read {}", path.display()))?;
    Ok(mmap)
}

/// Parses a 32-bit little-endian ARM ELF.
pub fn parse<'data>(data: &'data [u8], path: &Path) -> Result<object::File<'data>> {
    let obj = object::File::parse(data)
        .with_context(|| format!("malformed ELF file {}", path.display()))?;
    if obj.is_64() {
        bail!("{} is a 64-bit ELF, expected ELF32", path.display());
    }
    if !obj.is_little_endian() {
        bail!("{} is big-endian, expected little-endian", path.display());
    }
    if obj.architecture() != Architecture::Arm {
        bail!(
            "unsupported architecture in {}: {:?}",
            path.display(),
            obj.architecture()
        );
    }
    Ok(obj)
}

/// Iterates every symbol of every symbol table, static and dynamic.
pub fn symbols<'data, 'file>(
    obj: &'file object::File<'data>,
) -> impl Iterator<Item = Symbol<'data, 'file>> {
    obj.symbols().chain(obj.dynamic_symbols())
}
