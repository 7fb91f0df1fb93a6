//! Phase 3: provider extraction.
//!
//! Walks each `PROVIDER` section, resolves its associated `PROBES`,
//! `PRARGS`, `PROFFS`, and (format version 2+) `PRENOFFS` sections by index,
//! and emits the [`dof_wire::record::ParsedRecord`] stream described in
//! `original_source/libcommon/dof_parser.h`.

use dof_wire::consts::{self, sect_type};
use dof_wire::layout::{self, DofProbe, DofProviderV1, DofProviderV2, LeU32};
use dof_wire::record::ParsedRecord;
use zerocopy::LayoutVerified;

use crate::error::ParseError;
use crate::sections::Section;

pub fn extract_providers(
    sections: &[Section],
    buf: &[u8],
    dof_version: u8,
    module: &str,
) -> Result<Vec<ParsedRecord>, ParseError> {
    let providers: Vec<&Section> = sections
        .iter()
        .filter(|s| s.sec_type == sect_type::PROVIDER)
        .collect();

    if providers.is_empty() {
        return Ok(vec![ParsedRecord::Provider {
            name: String::new(),
            nprobes: 0,
        }]);
    }

    let mut out = Vec::new();
    for provider_sec in providers {
        out.extend(extract_one_provider(
            sections,
            buf,
            provider_sec,
            dof_version,
            module,
        )?);
    }
    Ok(out)
}

fn extract_one_provider(
    sections: &[Section],
    buf: &[u8],
    provider_sec: &Section,
    dof_version: u8,
    module: &str,
) -> Result<Vec<ParsedRecord>, ParseError> {
    let raw = buf
        .get(provider_sec.range())
        .ok_or(ParseError::BadSectionBounds {
            index: provider_sec.index,
        })?;

    let (v1, prenoffs_idx) = if dof_version >= consts::DOF_VERSION_2 {
        let need = layout::provider_v2_size();
        if raw.len() < need {
            return Err(ParseError::BadProviderSize {
                version: dof_version,
                found: raw.len(),
            });
        }
        let (l, _) = LayoutVerified::<_, DofProviderV2>::new_unaligned_from_prefix(raw)
            .ok_or(ParseError::BadProviderSize {
                version: dof_version,
                found: raw.len(),
            })?;
        let v2: DofProviderV2 = *l;
        (v2.v1, Some(v2.prenoffs.get()))
    } else {
        let need = layout::provider_v1_size();
        if raw.len() < need {
            return Err(ParseError::BadProviderSize {
                version: dof_version,
                found: raw.len(),
            });
        }
        let (l, _) = LayoutVerified::<_, DofProviderV1>::new_unaligned_from_prefix(raw)
            .ok_or(ParseError::BadProviderSize {
                version: dof_version,
                found: raw.len(),
            })?;
        (*l, None)
    };

    let strtab = section_of_type(sections, v1.strtab.get(), sect_type::STRTAB)?;
    let probes_sec = section_of_type(sections, v1.probes.get(), sect_type::PROBES)?;
    let proffs_sec = section_of_type(sections, v1.proffs.get(), sect_type::PROFFS)?;
    let prargs_sec = section_of_type(sections, v1.prargs.get(), sect_type::PRARGS)?;
    let prenoffs_sec = match prenoffs_idx {
        Some(idx) if idx != u32::MAX => Some(section_of_type(sections, idx, sect_type::PRENOFFS)?),
        _ => None,
    };

    let provider_name = read_cstr(buf, strtab, v1.name.get(), consts::PROVIDER_NAME_MAX)?;

    let probe_entsize = std::mem::size_of::<DofProbe>();
    let nprobes = probes_sec.size as usize / probe_entsize;

    let mut records = Vec::with_capacity(1 + nprobes * 2);
    records.push(ParsedRecord::Provider {
        name: provider_name,
        nprobes: nprobes as u32,
    });

    for i in 0..nprobes {
        let off = probes_sec.offset as usize + i * probe_entsize;
        let raw = buf
            .get(off..off + probe_entsize)
            .ok_or(ParseError::BadSectionBounds {
                index: probes_sec.index,
            })?;
        let (layout, _) = LayoutVerified::<_, DofProbe>::new_unaligned_from_prefix(raw)
            .ok_or(ParseError::BadSectionBounds {
                index: probes_sec.index,
            })?;
        let probe: DofProbe = *layout;

        let function = read_cstr(buf, strtab, probe.func.get(), consts::FUNCTION_NAME_MAX)?;
        let name = read_cstr(buf, strtab, probe.name.get(), consts::PROBE_NAME_MAX)?;

        let mut offsets = read_offsets(buf, proffs_sec, probe.offidx.get(), probe.noffs.get())?;
        let mut enoffsets = match prenoffs_sec {
            Some(sec) if probe.nenoffs.get() > 0 => {
                read_offsets(buf, sec, probe.enoffidx.get(), probe.nenoffs.get())?
            }
            Some(_) => Vec::new(),
            None => {
                if probe.nenoffs.get() > 0 {
                    return Err(ParseError::UnexpectedIsEnabled);
                }
                Vec::new()
            }
        };

        if offsets.is_empty() && enoffsets.is_empty() {
            return Err(ParseError::NoOffsets);
        }
        if dof_version == consts::DOF_VERSION_1 && offsets.is_empty() {
            return Err(ParseError::NoOffsets);
        }

        offsets.sort_unstable();
        reject_duplicates(&offsets)?;
        enoffsets.sort_unstable();
        reject_duplicates(&enoffsets)?;

        validate_args(buf, strtab, prargs_sec, &probe)?;

        records.push(ParsedRecord::Probe {
            module: module.to_string(),
            function,
            name,
            ntracepoints: (offsets.len() + enoffsets.len()) as u32,
        });
        for addr in offsets {
            records.push(ParsedRecord::Tracepoint {
                addr,
                is_enabled: false,
            });
        }
        for addr in enoffsets {
            records.push(ParsedRecord::Tracepoint {
                addr,
                is_enabled: true,
            });
        }
    }

    Ok(records)
}

/// Bounds-checks one probe's translated-args (prargs) data, per spec.md
/// §4.C Phase 3 ("arg-type index bytes must not reference beyond the
/// native-arg count; arg-type strings must fit within bounds") and
/// `original_source/libcommon/dof_parser.c`'s `dofpr_argidx`/`dofpr_xargc`
/// checks (~L750) and per-byte `arg[...] > dofpr_nargc` check (~L783). The
/// bytes themselves are never exposed on the emitted `Probe` record — only
/// validated — matching SPEC_FULL.md MODULE C's "parsed for bounds-safety
/// only" note.
fn validate_args(buf: &[u8], strtab: &Section, prargs_sec: &Section, probe: &DofProbe) -> Result<(), ParseError> {
    let argidx = probe.argidx.get();
    let xargc = probe.xargc as u32;
    let nargc = probe.nargc;

    let arg_end = argidx.checked_add(xargc).ok_or(ParseError::BadArgType)?;
    if arg_end as u64 > prargs_sec.size {
        return Err(ParseError::BadArgType);
    }
    let arg_start = prargs_sec.offset as usize + argidx as usize;
    let arg_bytes = buf
        .get(arg_start..arg_start + xargc as usize)
        .ok_or(ParseError::BadArgType)?;
    if arg_bytes.iter().any(|&b| b > nargc) {
        return Err(ParseError::BadArgType);
    }

    walk_arg_type_strings(buf, strtab, probe.nargv.get(), nargc as u32)
}

/// Walks `count` NUL-terminated native arg-type strings starting at
/// `strtab` offset `start`, rejecting any that run past the strtab or
/// exceed `ARG_TYPE_MAX` (`DTRACE_ARGTYPELEN` in the original).
fn walk_arg_type_strings(buf: &[u8], strtab: &Section, start: u32, count: u32) -> Result<(), ParseError> {
    let mut cursor = strtab.offset as usize + start as usize;
    for _ in 0..count {
        if cursor >= strtab.range().end {
            return Err(ParseError::BadArgType);
        }
        let slice = &buf[cursor..strtab.range().end];
        let end = slice.iter().position(|&b| b == 0).ok_or(ParseError::BadArgType)?;
        if end >= consts::ARG_TYPE_MAX {
            return Err(ParseError::BadArgType);
        }
        cursor += end + 1;
    }
    Ok(())
}

fn section_of_type(sections: &[Section], index: u32, want: u32) -> Result<&Section, ParseError> {
    let sec = sections.get(index as usize).ok_or(ParseError::BadSectionIndex { index })?;
    if sec.sec_type != want {
        return Err(ParseError::WrongSectionType { index });
    }
    Ok(sec)
}

fn read_cstr(buf: &[u8], strtab: &Section, offset: u32, max_len: usize) -> Result<String, ParseError> {
    let start = strtab.offset as usize + offset as usize;
    if start >= strtab.range().end {
        return Err(ParseError::BadSectionBounds { index: strtab.index });
    }
    let slice = &buf[start..strtab.range().end];
    let end = slice
        .iter()
        .position(|&b| b == 0)
        .ok_or(ParseError::UnterminatedName)?;
    if end > max_len {
        return Err(ParseError::NameTooLong { max: max_len });
    }
    String::from_utf8(slice[..end].to_vec()).map_err(|_| ParseError::UnterminatedName)
}

fn read_offsets(buf: &[u8], sec: &Section, idx: u32, count: u32) -> Result<Vec<u64>, ParseError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let entsize = std::mem::size_of::<LeU32>();
    let start = sec.offset as usize + idx as usize * entsize;
    let end = start + count as usize * entsize;
    if end > sec.range().end {
        return Err(ParseError::BadOffsetArray);
    }
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let off = start + i * entsize;
        let raw: [u8; 4] = buf[off..off + 4].try_into().unwrap();
        out.push(u32::from_le_bytes(raw) as u64);
    }
    Ok(out)
}

fn reject_duplicates(sorted: &[u64]) -> Result<(), ParseError> {
    for w in sorted.windows(2) {
        if w[0] == w[1] {
            return Err(ParseError::DuplicateOffset);
        }
    }
    Ok(())
}
