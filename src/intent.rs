//! Patch intents and their discovery.
//!
//! User objects declare where their code should be injected through two
//! naming conventions: a section named `.ncp_<kind>_<addr>[_ov<N>]` marks a
//! section-bound intent, a symbol named `ncp_<kind>_<addr>[_ov<N>]` a
//! label-bound one. Discovery walks every object's sections and symbols,
//! decodes the names with a small grammar parser, and produces the flat
//! intent list the later passes mutate by index.
//!
//! A name that fails to decode is warned about and skipped; only an object
//! that cannot be loaded at all fails the run.

use anyhow::Result;
use object::read::{Object, ObjectSection, ObjectSymbol};
use object::SymbolKind;
use tracing::{debug, info, warn};

use crate::config::{Destination, Region, SourceJob};
use crate::elf;
use crate::utils::parse_number;

/// What a patch does at its destination address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    Jump,
    Call,
    Hook,
    Over,
}

impl PatchKind {
    pub fn name(self) -> &'static str {
        match self {
            PatchKind::Jump => "jump",
            PatchKind::Call => "call",
            PatchKind::Hook => "hook",
            PatchKind::Over => "over",
        }
    }
}

/// Where an intent came from: a marker section or a bare label.
///
/// After the link the resolver refreshes `Index` with the linked ELF's
/// section index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionRef {
    Label,
    Index(usize),
}

/// One declared patch operation.
#[derive(Debug, Clone)]
pub struct PatchIntent {
    /// Address of the injected code; known only after the link.
    pub src_address: u32,
    pub src_dest: Destination,
    /// Address being patched, always even; the THUMB bit lives in
    /// `dest_thumb`.
    pub dest_address: u32,
    pub dest: Destination,
    pub kind: PatchKind,
    /// The payload is a data table holding the real target address.
    pub is_set: bool,
    pub src_thumb: bool,
    pub dest_thumb: bool,
    pub section: SectionRef,
    /// Size of the marker section; meaningful for `Over` patches.
    pub section_size: u32,
    pub symbol: String,
    /// Index of the owning job.
    pub job: usize,
}

/// A source-resident block the linker places verbatim between generated
/// `_start`/`_end` markers. No binary edit is emitted for these.
#[derive(Debug, Clone)]
pub struct RtReplIntent {
    pub symbol: String,
    pub job: usize,
}

/// Everything discovery extracts from the input objects.
#[derive(Debug, Default)]
pub struct Discovery {
    pub intents: Vec<PatchIntent>,
    pub rtrepl: Vec<RtReplIntent>,
    /// Label-bound symbols that must survive dead-stripping.
    pub extern_symbols: Vec<String>,
    /// Destinations owning `.ncp_set` payload sections, in input order.
    pub set_dests: Vec<Destination>,
    /// Jobs contributing `.ncp_set` payload sections.
    pub set_jobs: Vec<usize>,
}

/// A decoded `ncp_*` name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Patch {
        kind: PatchKind,
        is_set: bool,
        /// Destination address with the THUMB bit still attached.
        address: u32,
        overlay: Option<u32>,
    },
    RtRepl,
}

/// Why a name was not accepted by the grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseIssue {
    /// No `_` separator follows the prefix; not a directive at all.
    NotADirective,
    UnknownKind,
    BadAddress,
    /// A third segment is present but does not start with `ov`.
    MissingOverlay,
    BadOverlay,
}

/// Decodes the part of a patch name after the `ncp_` / `.ncp_` prefix.
pub fn parse_directive(stem: &str) -> Result<Directive, ParseIssue> {
    let (kind_name, rest) = stem.split_once('_').ok_or(ParseIssue::NotADirective)?;

    use PatchKind::*;
    let (kind, thumb, is_set) = match kind_name {
        "jump" => (Jump, false, false),
        "call" => (Call, false, false),
        "hook" => (Hook, false, false),
        "over" => (Over, false, false),
        "setjump" => (Jump, false, true),
        "setcall" => (Call, false, true),
        "sethook" => (Hook, false, true),
        "tjump" => (Jump, true, false),
        "tcall" => (Call, true, false),
        "thook" => (Hook, true, false),
        "tsetjump" => (Jump, true, true),
        "tsetcall" => (Call, true, true),
        "tsethook" => (Hook, true, true),
        "rtrepl" => return Ok(Directive::RtRepl),
        _ => return Err(ParseIssue::UnknownKind),
    };

    let (addr_text, overlay_text) = match rest.split_once('_') {
        Some((a, o)) => (a, Some(o)),
        None => (rest, None),
    };
    let mut address = parse_number(addr_text).ok_or(ParseIssue::BadAddress)?;
    if thumb {
        address |= 1;
    }

    let overlay = match overlay_text {
        None => None,
        Some(text) => {
            let digits = text.strip_prefix("ov").ok_or(ParseIssue::MissingOverlay)?;
            Some(parse_number(digits).ok_or(ParseIssue::BadOverlay)?)
        }
    };

    Ok(Directive::Patch { kind, is_set, address, overlay })
}

/// Decodes one name and appends the resulting intent, if any.
///
/// `section` carries `(index, size)` for section-bound names. Grammar
/// failures warn and leave the discovery untouched.
pub(crate) fn push_intent(
    out: &mut Discovery,
    name: &str,
    stem: &str,
    symbol_addr: u32,
    section: Option<(usize, u32)>,
    job: usize,
    region_dest: Destination,
) {
    let directive = match parse_directive(stem) {
        Ok(d) => d,
        Err(ParseIssue::NotADirective) => return,
        Err(issue) => {
            warn!("skipping unrecognised patch name {name:?}: {issue:?}");
            return;
        }
    };

    let (kind, is_set, address, overlay) = match directive {
        Directive::RtRepl => {
            // Only the marker sections matter; rtrepl labels are
            // placeholders inside them.
            if section.is_some() {
                out.rtrepl.push(RtReplIntent { symbol: name.to_string(), job });
            }
            return;
        }
        Directive::Patch { kind, is_set, address, overlay } => (kind, is_set, address, overlay),
    };

    if kind == PatchKind::Over && section.is_none() {
        warn!("skipping {name:?}: an \"over\" patch must be section-bound");
        return;
    }

    let dest = match overlay {
        None => Destination::Main,
        Some(id) => Destination::Overlay(id),
    };
    let (section, section_size) = match section {
        Some((index, size)) => (SectionRef::Index(index), size),
        None => (SectionRef::Label, 0),
    };

    out.intents.push(PatchIntent {
        src_address: 0,
        src_dest: if kind == PatchKind::Over { dest } else { region_dest },
        dest_address: address & !1,
        dest,
        kind,
        is_set,
        src_thumb: symbol_addr & 1 == 1,
        dest_thumb: address & 1 == 1,
        section,
        section_size,
        symbol: name.to_string(),
        job,
    });
}

/// Walks every object and collects its declared patches.
pub fn discover(jobs: &[SourceJob], regions: &[Region]) -> Result<Discovery> {
    info!("Getting patches from objects...");

    let mut out = Discovery::default();

    for (job_idx, job) in jobs.iter().enumerate() {
        debug!("{}", job.object.display());
        let region_dest = regions[job.region].destination();

        let mmap = elf::map_file(&job.object)?;
        let obj = elf::parse(&mmap, &job.object)?;

        let first = out.intents.len();

        // Section-bound intents. `.ncp_set*` sections are payload tables,
        // not intents; record who owns them so the linker script can place
        // them.
        for sec in obj.sections() {
            let Ok(name) = sec.name() else { continue };
            let Some(stem) = name.strip_prefix(".ncp_") else { continue };
            if stem.starts_with("set") {
                if !out.set_dests.contains(&region_dest) {
                    out.set_dests.push(region_dest);
                }
                out.set_jobs.push(job_idx);
                continue;
            }
            push_intent(
                &mut out,
                name,
                stem,
                0,
                Some((sec.index().0, sec.size() as u32)),
                job_idx,
                region_dest,
            );
        }

        // The low bit of a function symbol's value encodes THUMB mode;
        // propagate it onto the intent bound to the same section.
        for sym in elf::symbols(&obj) {
            if sym.kind() != SymbolKind::Text {
                continue;
            }
            let Some(si) = sym.section_index() else { continue };
            for intent in &mut out.intents[first..] {
                if intent.section == SectionRef::Index(si.0) {
                    intent.src_thumb = sym.address() & 1 == 1;
                    break;
                }
            }
        }

        // Label-bound intents. `ncp_dest` is a reserved marker, not a patch.
        for sym in elf::symbols(&obj) {
            let Ok(name) = sym.name() else { continue };
            let Some(stem) = name.strip_prefix("ncp_") else { continue };
            if stem == "dest" {
                continue;
            }
            push_intent(&mut out, name, stem, sym.address() as u32, None, job_idx, region_dest);
        }

        // Label-bound symbols are referenced by nothing the linker can see;
        // they go into the EXTERN set to survive --gc-sections.
        for intent in &out.intents[first..] {
            if intent.section == SectionRef::Label {
                out.extern_symbols.push(intent.symbol.clone());
            }
        }

        for intent in &out.intents[first..] {
            debug!(
                "  {} {} dest={:#010X} ({}) set={} src_thumb={} dest_thumb={}",
                intent.kind.name(),
                intent.symbol,
                intent.dest_address,
                intent.dest,
                intent.is_set,
                intent.src_thumb,
                intent.dest_thumb,
            );
        }
    }

    if out.extern_symbols.is_empty() {
        debug!("external symbols: none");
    } else {
        for sym in &out.extern_symbols {
            debug!("external symbol: {sym}");
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grammar_accepts_every_kind_token() {
        use PatchKind::*;
        let cases = [
            ("jump", Jump, false, false),
            ("call", Call, false, false),
            ("hook", Hook, false, false),
            ("over", Over, false, false),
            ("setjump", Jump, false, true),
            ("setcall", Call, false, true),
            ("sethook", Hook, false, true),
            ("tjump", Jump, true, false),
            ("tcall", Call, true, false),
            ("thook", Hook, true, false),
            ("tsetjump", Jump, true, true),
            ("tsetcall", Call, true, true),
            ("tsethook", Hook, true, true),
        ];
        for (token, kind, thumb, is_set) in cases {
            let stem = format!("{token}_0x02001000");
            let parsed = parse_directive(&stem).unwrap();
            let expected_addr = 0x0200_1000 | u32::from(thumb);
            assert_eq!(
                parsed,
                Directive::Patch { kind, is_set, address: expected_addr, overlay: None },
                "token {token}"
            );
        }
        assert_eq!(parse_directive("rtrepl_block"), Ok(Directive::RtRepl));
    }

    #[test]
    fn grammar_parses_overlay_suffixes_and_decimal_addresses() {
        assert_eq!(
            parse_directive("call_1234_ov12"),
            Ok(Directive::Patch {
                kind: PatchKind::Call,
                is_set: false,
                address: 1234,
                overlay: Some(12),
            })
        );
    }

    #[test]
    fn grammar_rejects_everything_else() {
        assert_eq!(parse_directive("jump"), Err(ParseIssue::NotADirective));
        assert_eq!(parse_directive("dest"), Err(ParseIssue::NotADirective));
        assert_eq!(parse_directive("frob_0x100"), Err(ParseIssue::UnknownKind));
        assert_eq!(parse_directive("Jump_0x100"), Err(ParseIssue::UnknownKind));
        assert_eq!(parse_directive("jump_zzz"), Err(ParseIssue::BadAddress));
        assert_eq!(parse_directive("jump_0x100_2"), Err(ParseIssue::MissingOverlay));
        assert_eq!(parse_directive("jump_0x100_ovx"), Err(ParseIssue::BadOverlay));
    }

    #[test]
    fn thumb_bit_moves_into_dest_thumb() {
        let mut d = Discovery::default();
        push_intent(
            &mut d,
            "ncp_tjump_0x02001000",
            "tjump_0x02001000",
            0x0203_5001,
            None,
            0,
            Destination::Main,
        );
        let p = &d.intents[0];
        assert_eq!(p.dest_address & 1, 0);
        assert_eq!(p.dest_address, 0x0200_1000);
        assert!(p.dest_thumb);
        assert!(p.src_thumb);
        assert_eq!(p.section, SectionRef::Label);
        assert_eq!(d.extern_symbols.len(), 0); // extern set is filled by discover()
    }

    #[test]
    fn over_must_be_section_bound() {
        let mut d = Discovery::default();
        push_intent(
            &mut d,
            "ncp_over_0x02004000",
            "over_0x02004000",
            0,
            None,
            0,
            Destination::Main,
        );
        assert!(d.intents.is_empty());

        push_intent(
            &mut d,
            ".ncp_over_0x02004000_ov3",
            "over_0x02004000_ov3",
            0,
            Some((7, 16)),
            0,
            Destination::Main,
        );
        let p = &d.intents[0];
        assert_eq!(p.kind, PatchKind::Over);
        assert_eq!(p.dest, Destination::Overlay(3));
        // An over patch writes into its own destination.
        assert_eq!(p.src_dest, Destination::Overlay(3));
        assert_eq!(p.section, SectionRef::Index(7));
        assert_eq!(p.section_size, 16);
    }

    #[test]
    fn rtrepl_records_only_marker_sections() {
        let mut d = Discovery::default();
        push_intent(&mut d, "ncp_rtrepl_block", "rtrepl_block", 0, None, 0, Destination::Main);
        assert!(d.rtrepl.is_empty());
        push_intent(
            &mut d,
            ".ncp_rtrepl_block",
            "rtrepl_block",
            0,
            Some((2, 32)),
            1,
            Destination::Main,
        );
        assert_eq!(d.rtrepl.len(), 1);
        assert_eq!(d.rtrepl[0].symbol, ".ncp_rtrepl_block");
        assert!(d.intents.is_empty());
    }
}
