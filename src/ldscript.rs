//! Linker-script synthesis.
//!
//! One script drives the whole link: every input object, a MEMORY region
//! per configured code region (overlays first, then the main binary), one
//! pinned region per `over` patch so replacement code can never outgrow the
//! bytes it displaces, aggregated `.text`/`.bss` output sections per
//! region, the auto-generated-data reservation, and an EXTERN list keeping
//! label-bound patch symbols alive through `--gc-sections`.
//!
//! The output is deterministic: regions are sorted by destination and
//! everything else follows input order.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::{Destination, Region, SourceJob};
use crate::intent::{Discovery, PatchKind, SectionRef};
use crate::opcode::{HOOK_BRIDGE_SIZE, THUMB_VENEER_SIZE};

struct MemoryEntry {
    name: String,
    origin: u32,
    length: u32,
}

struct RegionEntry {
    region_idx: usize,
    dest: Destination,
    mem: String,
    autogen: u32,
    /// Indices of section-bound intents placed (as labels) in this region.
    section_patches: Vec<usize>,
}

/// Input sections gathered into each region's text output section.
const TEXT_INPUTS: [&str; 8] = [
    ".text",
    ".rodata",
    ".init_array",
    ".data",
    ".text.*",
    ".rodata.*",
    ".init_array.*",
    ".data.*",
];

fn label_of(symbol: &str) -> &str {
    symbol.strip_prefix('.').unwrap_or(symbol)
}

/// Builds the complete linker script as one string.
pub fn synthesise(
    symbols: &Path,
    elf_path: &Path,
    jobs: &[SourceJob],
    regions: &[Region],
    discovery: &Discovery,
    newcode_addrs: &BTreeMap<Destination, u32>,
) -> String {
    let mut memory = vec![MemoryEntry { name: "bin".into(), origin: 0, length: 0x0010_0000 }];

    // Overlay regions must precede the main region.
    let mut order: Vec<usize> = (0..regions.len()).collect();
    order.sort_by(|&a, &b| regions[b].destination().cmp(&regions[a].destination()));

    let mut region_entries = Vec::with_capacity(order.len());
    for ri in order {
        let dest = regions[ri].destination();
        let mem = match dest {
            Destination::Main => "arm".to_string(),
            Destination::Overlay(id) => format!("ov{id}"),
        };
        let origin = *newcode_addrs
            .get(&dest)
            .expect("new-code base computed for every region");
        memory.push(MemoryEntry { name: mem.clone(), origin, length: regions[ri].length });
        region_entries.push(RegionEntry {
            region_idx: ri,
            dest,
            mem,
            autogen: 0,
            section_patches: Vec::new(),
        });
    }

    // Over patches pin their own memory region; everything else feeds the
    // region of its owning object and reserves auto-generated data space.
    let mut over_patches: Vec<(usize, String)> = Vec::new();
    for (pi, p) in discovery.intents.iter().enumerate() {
        if p.kind == PatchKind::Over {
            let mut name = format!("over_{:08X}", p.dest_address);
            if let Destination::Overlay(id) = p.dest {
                name.push('_');
                name.push_str(&id.to_string());
            }
            memory.push(MemoryEntry {
                name: name.clone(),
                origin: p.dest_address,
                length: p.section_size,
            });
            over_patches.push((pi, name));
        } else {
            let job_dest = regions[jobs[p.job].region].destination();
            for entry in &mut region_entries {
                if entry.dest == job_dest {
                    if matches!(p.section, SectionRef::Index(_)) {
                        entry.section_patches.push(pi);
                    }
                    if p.kind == PatchKind::Hook {
                        entry.autogen += HOOK_BRIDGE_SIZE;
                    } else if p.kind == PatchKind::Jump && !p.dest_thumb && p.src_thumb {
                        entry.autogen += THUMB_VENEER_SIZE;
                    }
                }
            }
        }
    }

    if !discovery.set_dests.is_empty() {
        memory.push(MemoryEntry { name: "ncp_set".into(), origin: 0, length: 0x0010_0000 });
    }

    let mut o = String::with_capacity(0x10000);
    o.push_str("/* ncpatch: auto-generated linker script */\n\nINCLUDE \"");
    o.push_str(&symbols.display().to_string());
    o.push_str("\"\n\nINPUT (\n");
    for job in jobs {
        o.push_str("\t\"");
        o.push_str(&job.object.display().to_string());
        o.push_str("\"\n");
    }
    o.push_str(")\n\nOUTPUT (\"");
    o.push_str(&elf_path.display().to_string());
    o.push_str("\")\n\nMEMORY {\n");

    for entry in &memory {
        o.push_str(&format!(
            "\t{} (rwx): ORIGIN = 0x{:08X}, LENGTH = 0x{:08X}\n",
            entry.name, entry.origin, entry.length
        ));
    }

    o.push_str("}\n\nSECTIONS {\n");

    for entry in &region_entries {
        // TEXT
        o.push_str(&format!("\t.{}.text : ALIGN(4) {{\n", entry.mem));
        for &pi in &entry.section_patches {
            let p = &discovery.intents[pi];
            o.push_str(&format!(
                "\t\t{} = .;\n\t\tKEEP(* ({}))\n",
                label_of(&p.symbol),
                p.symbol
            ));
        }
        for rt in &discovery.rtrepl {
            if jobs[rt.job].region == entry.region_idx {
                let stem = label_of(&rt.symbol);
                o.push_str(&format!(
                    "\t\t{stem}_start = .;\n\t\t* ({})\n\t\t{stem}_end = .;\n",
                    rt.symbol
                ));
            }
        }
        if entry.dest == Destination::Main {
            for sec in TEXT_INPUTS {
                o.push_str(&format!("\t\t* ({sec})\n"));
            }
        } else {
            for job in jobs {
                if job.region == entry.region_idx {
                    for sec in TEXT_INPUTS {
                        o.push_str(&format!("\t\t\"{}\" ({sec})\n", job.object.display()));
                    }
                }
            }
        }
        if entry.autogen != 0 {
            let symbol = match entry.dest {
                Destination::Main => "ncp_autogendata".to_string(),
                Destination::Overlay(_) => format!("ncp_autogendata_{}", entry.mem),
            };
            o.push_str(&format!(
                "\t\t. = ALIGN(4);\n\t\t{symbol} = .;\n\t\tFILL(0)\n\t\t. = {symbol} + {};\n",
                entry.autogen
            ));
        }
        o.push_str(&format!("\t\t. = ALIGN(4);\n\t}} > {} AT > bin\n", entry.mem));

        // BSS
        o.push_str(&format!("\n\t.{}.bss : ALIGN(4) {{\n", entry.mem));
        if entry.dest == Destination::Main {
            o.push_str("\t\t* (.bss)\n\t\t* (.bss.*)\n");
        } else {
            for job in jobs {
                if job.region == entry.region_idx {
                    o.push_str(&format!(
                        "\t\t\"{0}\" (.bss)\n\t\t\"{0}\" (.bss.*)\n",
                        job.object.display()
                    ));
                }
            }
        }
        o.push_str(&format!("\t\t. = ALIGN(4);\n\t}} > {} AT > bin\n\n", entry.mem));
    }

    for (pi, mem) in &over_patches {
        let p = &discovery.intents[*pi];
        o.push_str(&format!(
            "\t{0} : {{ KEEP(* ({0})) }} > {1} AT > bin\n",
            p.symbol, mem
        ));
    }
    if !over_patches.is_empty() {
        o.push('\n');
    }

    for dest in &discovery.set_dests {
        match dest {
            Destination::Main => {
                o.push_str("\t.ncp_set : { KEEP(* (.ncp_set)) } > ncp_set AT > bin\n");
            }
            Destination::Overlay(id) => {
                o.push_str(&format!("\t.ncp_set_ov{id} : {{\n"));
                for &ji in &discovery.set_jobs {
                    if regions[jobs[ji].region].destination() == *dest {
                        o.push_str(&format!(
                            "\t\tKEEP(\"{}\" (.ncp_set))\n",
                            jobs[ji].object.display()
                        ));
                    }
                }
                o.push_str("\t} > ncp_set AT > bin\n");
            }
        }
    }
    if !discovery.set_dests.is_empty() {
        o.push('\n');
    }

    o.push_str("\t/DISCARD/ : {*(.*)}\n}\n");

    if !discovery.extern_symbols.is_empty() {
        o.push_str("\nEXTERN (\n");
        for sym in &discovery.extern_symbols {
            o.push('\t');
            o.push_str(sym);
            o.push('\n');
        }
        o.push_str(")\n");
    }

    o
}

/// Writes the script with LF endings, replacing any previous one.
pub fn write_script(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents)
        .with_context(|| format!("could not write {}", path.display()))
}
