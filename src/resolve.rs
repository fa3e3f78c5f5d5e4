//! Post-link resolution.
//!
//! After the external linker runs, the linked ELF is the source of truth
//! for where everything landed. Three passes fill in the intent list:
//! symbols give every patch its source address (and locate the
//! auto-generated-data areas), sections pin `over` patches and replace
//! `set`-variant source addresses with the table contents, and the
//! `.arm.*`/`.ov<N>.*` output sections become the new-code payloads.
//! Finally every pair of intents sharing a destination is checked for
//! overlapping write ranges.

use anyhow::{bail, Context, Result};
use object::read::{Object, ObjectSection, ObjectSymbol};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

use crate::config::{Destination, SourceJob};
use crate::elf;
use crate::intent::{Discovery, PatchIntent, PatchKind, SectionRef};
use crate::utils::{overlaps, parse_number};

/// A reservation inside a region's new code where the applier emits
/// trampolines. `cursor` advances as bridges and veneers are written into
/// `data`.
#[derive(Debug)]
pub struct AutogenArea {
    pub base: u32,
    pub cursor: u32,
    pub data: Vec<u8>,
}

/// New code the link produced for one destination.
#[derive(Debug, Default)]
pub struct NewCodePayload {
    pub text: Vec<u8>,
    pub text_align: u32,
    pub bss_size: u32,
    pub bss_align: u32,
}

impl NewCodePayload {
    pub fn text_size(&self) -> u32 {
        self.text.len() as u32
    }
}

#[derive(Debug, Default)]
pub struct Resolution {
    pub autogen: BTreeMap<Destination, AutogenArea>,
    pub payloads: BTreeMap<Destination, NewCodePayload>,
}

/// Classifies a linked output section as a new-code payload.
pub(crate) fn payload_section(name: &str) -> Option<(Destination, bool)> {
    if let Some(rest) = name.strip_prefix(".arm.") {
        Some((Destination::Main, rest == "bss"))
    } else if let Some(rest) = name.strip_prefix(".ov") {
        let dot = rest.find('.')?;
        let id: u32 = rest[..dot].parse().ok()?;
        Some((Destination::Overlay(id), rest[dot + 1..] == *"bss"))
    } else {
        None
    }
}

/// Fails if any two intents write overlapping ranges into one destination.
pub(crate) fn check_overlaps(intents: &[PatchIntent], jobs: &[SourceJob]) -> Result<()> {
    let mut conflict = false;
    for i in 0..intents.len() {
        for j in i + 1..intents.len() {
            let (a, b) = (&intents[i], &intents[j]);
            if a.dest != b.dest {
                continue;
            }
            let a_size = if a.kind == PatchKind::Over { a.section_size } else { 4 };
            let b_size = if b.kind == PatchKind::Over { b.section_size } else { 4 };
            if overlaps(
                a.dest_address,
                a.dest_address + a_size,
                b.dest_address,
                b.dest_address + b_size,
            ) {
                error!(
                    "{:?} [size {}] ({}) overlaps with {:?} [size {}] ({})",
                    a.symbol,
                    a_size,
                    jobs[a.job].object.display(),
                    b.symbol,
                    b_size,
                    jobs[b.job].object.display(),
                );
                conflict = true;
            }
        }
    }
    if conflict {
        bail!("overlapping patches were detected");
    }
    Ok(())
}

/// Rewalks the linked ELF and completes the discovery.
pub fn resolve(
    obj: &object::File,
    discovery: &mut Discovery,
    jobs: &[SourceJob],
) -> Result<Resolution> {
    info!("Getting patches from the linked ELF...");

    let mut resolution = Resolution::default();

    // Symbol pass. Section-bound intents were turned into labels by the
    // linker script, so they match on the name with the leading dot
    // dropped; label-bound ones match as-is. This must run before the
    // set-table read below, which consumes the symbol addresses.
    for sym in elf::symbols(obj) {
        let Ok(name) = sym.name() else { continue };
        let addr = sym.address() as u32;
        let shndx = sym.section_index().map(|i| i.0).unwrap_or(0);

        for p in &mut discovery.intents {
            match p.section {
                SectionRef::Index(_) => {
                    if p.symbol.get(1..) == Some(name) {
                        p.src_address = addr;
                        p.section = SectionRef::Index(shndx);
                        p.symbol.remove(0);
                    }
                }
                SectionRef::Label => {
                    if p.symbol == name {
                        p.src_address = addr;
                        p.section = SectionRef::Index(shndx);
                    }
                }
            }
        }

        if let Some(rest) = name.strip_prefix("ncp_autogendata") {
            let dest = if rest.is_empty() {
                Some(Destination::Main)
            } else {
                rest.strip_prefix("_ov").and_then(parse_number).map(Destination::Overlay)
            };
            match dest {
                Some(dest) => {
                    resolution.autogen.insert(
                        dest,
                        AutogenArea { base: addr, cursor: addr, data: Vec::new() },
                    );
                }
                None => warn!("ignoring malformed auto-generated-data symbol {name:?}"),
            }
        }
    }

    // Section pass: pin over patches and read set tables.
    for sec in obj.sections() {
        let Ok(name) = sec.name() else { continue };

        for p in &mut discovery.intents {
            if p.kind == PatchKind::Over && p.symbol == name {
                p.src_address = sec.address() as u32;
                p.section = SectionRef::Index(sec.index().0);
            }
        }

        if let Some(rest) = name.strip_prefix(".ncp_set") {
            if !rest.is_empty() && rest.strip_prefix("_ov").and_then(parse_number).is_none() {
                warn!("ignoring malformed set-table section {name:?}");
                continue;
            }
            let data = sec
                .data()
                .with_context(|| format!("could not read section {name}"))?;
            let base = sec.address() as u32;
            for p in &mut discovery.intents {
                if !p.is_set {
                    continue;
                }
                // The symbol points at a table entry holding the real
                // target; only read it from the section that contains it.
                let Some(off) = p.src_address.checked_sub(base) else { continue };
                let off = off as usize;
                if off + 4 <= data.len() {
                    p.src_address = u32::from_le_bytes([
                        data[off],
                        data[off + 1],
                        data[off + 2],
                        data[off + 3],
                    ]);
                }
            }
        }
    }

    check_overlaps(&discovery.intents, jobs)?;

    for p in &discovery.intents {
        debug!(
            "  {} {} src={:#010X} ({}) dest={:#010X} ({}) set={} src_thumb={} dest_thumb={}",
            p.kind.name(),
            p.symbol,
            p.src_address,
            p.src_dest,
            p.dest_address,
            p.dest,
            p.is_set,
            p.src_thumb,
            p.dest_thumb,
        );
    }

    // Payload pass: collect the new code per destination.
    for sec in obj.sections() {
        let Ok(name) = sec.name() else { continue };
        let Some((dest, is_bss)) = payload_section(name) else { continue };
        let entry = resolution.payloads.entry(dest).or_default();
        let align = sec.align() as u32;
        if is_bss {
            entry.bss_size = sec.size() as u32;
            // An empty output section can report alignment 0, which the
            // heap-top computation divides by.
            entry.bss_align = if align == 0 { 4 } else { align };
        } else {
            entry.text = sec
                .data()
                .with_context(|| format!("could not read section {name}"))?
                .to_vec();
            entry.text_align = align;
        }
    }

    Ok(resolution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn over(symbol: &str, dest_address: u32, size: u32, dest: Destination) -> PatchIntent {
        PatchIntent {
            src_address: 0,
            src_dest: dest,
            dest_address,
            dest,
            kind: PatchKind::Over,
            is_set: false,
            src_thumb: false,
            dest_thumb: false,
            section: SectionRef::Index(1),
            section_size: size,
            symbol: symbol.to_string(),
            job: 0,
        }
    }

    fn jump(symbol: &str, dest_address: u32, dest: Destination) -> PatchIntent {
        PatchIntent {
            kind: PatchKind::Jump,
            section: SectionRef::Label,
            section_size: 0,
            ..over(symbol, dest_address, 0, dest)
        }
    }

    fn jobs() -> Vec<SourceJob> {
        vec![SourceJob { object: PathBuf::from("main.o"), region: 0 }]
    }

    #[test]
    fn touching_ranges_do_not_conflict() {
        let intents = vec![
            over("a", 0x0200_4000, 8, Destination::Main),
            over("b", 0x0200_4008, 4, Destination::Main),
        ];
        assert!(check_overlaps(&intents, &jobs()).is_ok());
    }

    #[test]
    fn overlapping_ranges_conflict() {
        let intents = vec![
            over("a", 0x0200_4000, 9, Destination::Main),
            over("b", 0x0200_4008, 4, Destination::Main),
        ];
        assert!(check_overlaps(&intents, &jobs()).is_err());

        let intents = vec![
            over("a", 0x0200_4000, 8, Destination::Main),
            over("b", 0x0200_4007, 4, Destination::Main),
        ];
        assert!(check_overlaps(&intents, &jobs()).is_err());
    }

    #[test]
    fn word_patches_occupy_four_bytes() {
        let intents = vec![
            jump("a", 0x0200_1000, Destination::Main),
            jump("b", 0x0200_1003, Destination::Main),
        ];
        assert!(check_overlaps(&intents, &jobs()).is_err());

        let intents = vec![
            jump("a", 0x0200_1000, Destination::Main),
            jump("b", 0x0200_1004, Destination::Main),
        ];
        assert!(check_overlaps(&intents, &jobs()).is_ok());
    }

    #[test]
    fn destinations_are_checked_independently() {
        let intents = vec![
            jump("a", 0x0200_1000, Destination::Main),
            jump("b", 0x0200_1000, Destination::Overlay(0)),
            jump("c", 0x0200_1000, Destination::Overlay(1)),
        ];
        assert!(check_overlaps(&intents, &jobs()).is_ok());
    }

    #[test]
    fn payload_sections_are_classified_by_name() {
        assert_eq!(payload_section(".arm.text"), Some((Destination::Main, false)));
        assert_eq!(payload_section(".arm.bss"), Some((Destination::Main, true)));
        assert_eq!(payload_section(".ov2.text"), Some((Destination::Overlay(2), false)));
        assert_eq!(payload_section(".ov12.bss"), Some((Destination::Overlay(12), true)));
        assert_eq!(payload_section(".text"), None);
        assert_eq!(payload_section(".ncp_set"), None);
        assert_eq!(payload_section(".ovx.text"), None);
    }
}
