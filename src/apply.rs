//! Patch application.
//!
//! Walks the resolved intent list in discovery order and edits the target
//! binaries: branches and calls are encoded in place, hooks and
//! ARM-to-THUMB jumps emit trampolines into the auto-generated data area
//! reserved at link time, and `over` patches copy their section bytes over
//! the displaced code. Afterwards the accumulated new-code payloads are
//! installed: appended to the main binary through a fresh auto-load entry,
//! or appended to / replacing an overlay.

use anyhow::{bail, Context, Result};
use object::read::{Object, ObjectSection, SectionIndex};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::arm::{ArmImage, AutoLoadEntry};
use crate::config::{Destination, Processor, RegionMode, SourceJob, TargetConfig};
use crate::image::CodeImage;
use crate::intent::{PatchIntent, PatchKind, SectionRef};
use crate::opcode::{
    arm_branch, fixup_arm_branch, thumb_branch, ARM_B, ARM_BL, ARM_BLX, ARM_HOOK_POP,
    ARM_HOOK_PUSH, ARM_LDR_PC, HOOK_BRIDGE_SIZE, THUMB_BL1, THUMB_BLX1, THUMB_POP_PC,
    THUMB_PUSH_LR, THUMB_VENEER_SIZE,
};
use crate::overlay::{OverlayImage, OvtEntry};
use crate::patcher::ImageCache;
use crate::resolve::{AutogenArea, NewCodePayload};

/// Applies every intent to its target image.
pub fn apply_intents(
    processor: Processor,
    intents: &[PatchIntent],
    jobs: &[SourceJob],
    obj: &object::File,
    images: &mut ImageCache,
    autogen: &mut BTreeMap<Destination, AutogenArea>,
) -> Result<()> {
    info!("Patching the binaries...");

    for p in intents {
        let over_bytes = if p.kind == PatchKind::Over {
            let SectionRef::Index(idx) = p.section else {
                bail!("over patch {:?} was never resolved to a section", p.symbol);
            };
            let sec = obj
                .section_by_index(SectionIndex(idx))
                .with_context(|| format!("over patch {:?} points at a bad section", p.symbol))?;
            Some(
                sec.data()
                    .with_context(|| format!("could not read bytes of {:?}", p.symbol))?,
            )
        } else {
            None
        };

        let bin = images.image_mut(p.dest)?;
        let area = autogen.get_mut(&p.src_dest);
        apply_intent(processor, p, bin, area, over_bytes, &jobs[p.job].object)?;
    }
    Ok(())
}

/// Applies one intent to `bin`.
///
/// `autogen` is the trampoline area of the intent's source destination,
/// when one was reserved; `over_bytes` carries the replacement bytes for
/// `Over` patches.
pub(crate) fn apply_intent(
    processor: Processor,
    p: &PatchIntent,
    bin: &mut dyn CodeImage,
    autogen: Option<&mut AutogenArea>,
    over_bytes: Option<&[u8]>,
    owner: &Path,
) -> Result<()> {
    match p.kind {
        PatchKind::Jump => match (p.dest_thumb, p.src_thumb) {
            (false, false) => {
                bin.write_u32(p.dest_address, arm_branch(ARM_B, p.dest_address, p.src_address));
            }
            (false, true) => {
                // No direct ARM-to-THUMB jump exists; branch to a veneer
                // that loads the absolute target with the THUMB bit set.
                let area = autogen.with_context(|| {
                    format!("no auto-generated data area was reserved for {}", p.src_dest)
                })?;
                let bridge = area.cursor;
                bin.write_u32(p.dest_address, arm_branch(ARM_B, p.dest_address, bridge));
                area.data.extend_from_slice(&ARM_LDR_PC.to_le_bytes());
                area.data.extend_from_slice(&(p.src_address | 1).to_le_bytes());
                area.cursor += THUMB_VENEER_SIZE;
                debug!("thumb veneer at {bridge:#010X}");
            }
            (true, src_thumb) => {
                let suffix = if src_thumb { THUMB_BL1 } else { THUMB_BLX1 };
                let pair = thumb_branch(suffix, p.dest_address, p.src_address);
                let mut bytes = [0u8; 6];
                bytes[0..2].copy_from_slice(&THUMB_PUSH_LR.to_le_bytes());
                bytes[2..4].copy_from_slice(&(pair as u16).to_le_bytes());
                bytes[4..6].copy_from_slice(&THUMB_POP_PC.to_le_bytes());
                bin.write_bytes(p.dest_address, &bytes);
            }
        },
        PatchKind::Call => {
            if p.dest_thumb != p.src_thumb && processor == Processor::Arm7 {
                bail!(
                    "cannot encode an interworking call on the ARM7 (no BLX), at {:?} ({})",
                    p.symbol,
                    owner.display()
                );
            }
            match (p.dest_thumb, p.src_thumb) {
                (false, false) => {
                    bin.write_u32(p.dest_address, arm_branch(ARM_BL, p.dest_address, p.src_address));
                }
                (false, true) => {
                    // BLX carries the halfword offset in its H bit.
                    let op = ARM_BLX | (((p.src_address % 4) >> 1) << 23);
                    bin.write_u32(p.dest_address, arm_branch(op, p.dest_address, p.src_address));
                }
                (true, false) => {
                    bin.write_u32(
                        p.dest_address,
                        thumb_branch(THUMB_BLX1, p.dest_address, p.src_address),
                    );
                }
                (true, true) => {
                    bin.write_u32(
                        p.dest_address,
                        thumb_branch(THUMB_BL1, p.dest_address, p.src_address),
                    );
                }
            }
        }
        PatchKind::Hook => {
            if p.dest_thumb || p.src_thumb {
                bail!(
                    "hooks between ARM and THUMB code are not supported, at {:?} ({})",
                    p.symbol,
                    owner.display()
                );
            }
            let area = autogen.with_context(|| {
                format!("no auto-generated data area was reserved for {}", p.src_dest)
            })?;

            let original = bin.read_u32(p.dest_address);
            let bridge = area.cursor;
            bin.write_u32(p.dest_address, arm_branch(ARM_B, p.dest_address, bridge));

            // The bridge saves the caller-visible registers, calls the
            // user's hook, replays the displaced instruction and resumes.
            let words = [
                ARM_HOOK_PUSH,
                arm_branch(ARM_BL, bridge + 4, p.src_address),
                ARM_HOOK_POP,
                fixup_arm_branch(original, p.dest_address, bridge + 12),
                arm_branch(ARM_B, bridge + 16, p.dest_address + 4),
            ];
            for word in words {
                area.data.extend_from_slice(&word.to_le_bytes());
            }
            area.cursor += HOOK_BRIDGE_SIZE;
            debug!("hook bridge at {bridge:#010X}");
        }
        PatchKind::Over => {
            let bytes = over_bytes
                .with_context(|| format!("no replacement bytes for {:?}", p.symbol))?;
            let size = p.section_size as usize;
            if bytes.len() < size {
                bail!(
                    "replacement section {:?} shrank to {} bytes, expected {}",
                    p.symbol,
                    bytes.len(),
                    size
                );
            }
            bin.write_bytes(p.dest_address, &bytes[..size]);
        }
    }
    Ok(())
}

/// The linked text with the FILL(0) reservation replaced by the emitted
/// trampolines.
fn assemble_newcode(payload: &NewCodePayload, autogen: Option<&AutogenArea>) -> Vec<u8> {
    let generated = autogen.map(|a| a.data.as_slice()).unwrap_or(&[]);
    let keep = payload.text.len() - generated.len();
    let mut out = payload.text[..keep].to_vec();
    out.extend_from_slice(generated);
    out
}

/// Installs every destination's new code into its binary.
pub fn install_payloads(
    target: &TargetConfig,
    payloads: &BTreeMap<Destination, NewCodePayload>,
    newcode_addrs: &BTreeMap<Destination, u32>,
    autogen: &BTreeMap<Destination, AutogenArea>,
    images: &mut ImageCache,
) -> Result<()> {
    for (dest, payload) in payloads {
        let addr = *newcode_addrs
            .get(dest)
            .with_context(|| format!("no region is configured for {dest}"))?;
        match dest {
            Destination::Main => {
                install_main(images.arm_mut(), payload, autogen.get(dest), addr, target.arena_lo);
            }
            Destination::Overlay(id) => {
                let region = target
                    .regions
                    .iter()
                    .find(|r| r.destination() == *dest)
                    .with_context(|| format!("no region is configured for {dest}"))?;
                let mode = region.mode;
                let length = region.length;
                let (image, entry) = images.overlay_with_entry(*id)?;
                match mode {
                    RegionMode::Append => {
                        install_overlay_append(image, entry, payload, autogen.get(dest), length)?;
                    }
                    RegionMode::Replace => {
                        install_overlay_replace(
                            image,
                            entry,
                            payload,
                            autogen.get(dest),
                            addr,
                            length,
                        )?;
                    }
                    RegionMode::Create => {
                        bail!("creating new overlays is not supported yet");
                    }
                }
            }
        }
    }
    Ok(())
}

/// Extends the main binary: raises the heap base, shifts the auto-load
/// directory up by the new code's size and prepends an entry for it.
pub(crate) fn install_main(
    arm: &mut ArmImage,
    payload: &NewCodePayload,
    autogen: Option<&AutogenArea>,
    newcode_addr: u32,
    arena_lo: u32,
) {
    let text_size = payload.text_size();
    if text_size + payload.bss_size == 0 {
        return;
    }

    let old_len = arm.data().len();
    arm.data_mut().resize(old_len + text_size as usize + 12, 0);

    let bss_align = if payload.bss_align == 0 { 4 } else { payload.bss_align };
    let heap_top = newcode_addr + text_size + (bss_align - text_size % bss_align) + payload.bss_size;
    arm.write_u32(arena_lo, heap_top);

    let ram = arm.ram_address();
    let params = arm.module_params;
    let list_start = (params.autoload_list_start - ram) as usize;
    let code_start = (params.autoload_start - ram) as usize;

    arm.autoload.insert(
        0,
        AutoLoadEntry {
            address: newcode_addr,
            size: text_size,
            bss_size: payload.bss_size,
            data_off: code_start as u32,
        },
    );

    if text_size != 0 {
        let code = assemble_newcode(payload, autogen);
        let data = arm.data_mut();
        data.copy_within(code_start..list_start, code_start + text_size as usize);
        data[code_start..code_start + code.len()].copy_from_slice(&code);
    }

    arm.module_params.autoload_list_start = params.autoload_list_start + text_size;
    arm.module_params.autoload_list_end = params.autoload_list_end + text_size + 12;
    arm.flush_module_params();
    arm.write_autoload_list(list_start + text_size as usize);
}

/// Appends new code behind an overlay's current data, turning its old BSS
/// into zero-filled file bytes.
pub(crate) fn install_overlay_append(
    image: &mut OverlayImage,
    entry: &mut OvtEntry,
    payload: &NewCodePayload,
    autogen: Option<&AutogenArea>,
    region_length: u32,
) -> Result<()> {
    entry.compressed = 0;
    entry.flag = 0;

    let old_size = image.data().len();
    let old_bss = entry.bss_size as usize;
    let total = old_size + old_bss + payload.text.len() + payload.bss_size as usize;
    if total > region_length as usize {
        bail!(
            "overlay {} exceeds its region's maximum of {} bytes, got {}",
            entry.overlay_id,
            region_length,
            total
        );
    }

    if !payload.text.is_empty() {
        let new_size = old_size + old_bss + payload.text.len();
        let code = assemble_newcode(payload, autogen);
        let data = image.data_mut();
        data.resize(new_size, 0);
        data[old_size + old_bss..].copy_from_slice(&code);
        entry.ram_size = new_size as u32;
        entry.bss_size = payload.bss_size;
    } else {
        entry.bss_size += payload.bss_size;
    }
    Ok(())
}

/// Replaces an overlay's contents with the new code wholesale.
pub(crate) fn install_overlay_replace(
    image: &mut OverlayImage,
    entry: &mut OvtEntry,
    payload: &NewCodePayload,
    autogen: Option<&AutogenArea>,
    newcode_addr: u32,
    region_length: u32,
) -> Result<()> {
    entry.ram_address = newcode_addr;
    entry.ram_size = payload.text_size();
    entry.bss_size = payload.bss_size;
    entry.sinit_start = 0;
    entry.sinit_end = 0;
    entry.compressed = 0;
    entry.flag = 0;

    let total = payload.text.len() + payload.bss_size as usize;
    if total > region_length as usize {
        bail!(
            "overlay {} exceeds its region's maximum of {} bytes, got {}",
            entry.overlay_id,
            region_length,
            total
        );
    }

    let data = image.data_mut();
    if payload.text.is_empty() {
        data.clear();
    } else {
        let code = assemble_newcode(payload, autogen);
        data.resize(code.len(), 0);
        data.copy_from_slice(&code);
    }
    Ok(())
}
