//! Phase 2: section table validation and relocation application.

use dof_wire::consts::{self, sect_type};
use dof_wire::layout::{DofRelo, DofReloHdr, DofSec};
use zerocopy::LayoutVerified;

use crate::error::ParseError;
use crate::header::ValidatedHeader;

/// One validated section: its declared type/flags plus the byte range it
/// occupies in the input buffer (already bounds-checked).
#[derive(Debug, Clone, Copy)]
pub struct Section {
    pub index: u32,
    pub sec_type: u32,
    pub flags: u32,
    pub align: u32,
    pub offset: u64,
    pub size: u64,
}

impl Section {
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset as usize..(self.offset + self.size) as usize
    }
}

pub fn validate_sections(
    validated: &ValidatedHeader<'_>,
    buf_len: usize,
) -> Result<Vec<Section>, ParseError> {
    let entsize = std::mem::size_of::<DofSec>();
    let mut sections = Vec::with_capacity(validated.hdr.secnum.get() as usize);

    for index in 0..validated.hdr.secnum.get() {
        let start = index as usize * entsize;
        let raw = validated
            .section_table
            .get(start..start + entsize)
            .ok_or(ParseError::BadSectionTable)?;
        let (layout, _) = LayoutVerified::<_, DofSec>::new_unaligned_from_prefix(raw)
            .ok_or(ParseError::BadSectionTable)?;
        let sec: DofSec = *layout;

        let align = sec.align.get();
        if align != 0 && !align.is_power_of_two() {
            return Err(ParseError::BadSectionAlignment { index, align });
        }

        let offset = sec.offset.get();
        if align != 0 && offset % align as u64 != 0 {
            return Err(ParseError::UnalignedSectionOffset { index, align });
        }
        let size = sec.size.get();
        let end = offset
            .checked_add(size)
            .ok_or(ParseError::BadSectionBounds { index })?;
        if end > buf_len as u64 {
            return Err(ParseError::BadSectionBounds { index });
        }

        let sec_type = sec.sec_type.get();
        let flags = sec.flags.get();
        if sect_type::is_loadable(sec_type) && flags & consts::DOF_SECF_LOAD == 0 {
            return Err(ParseError::MissingLoadFlag { index });
        }

        sections.push(Section {
            index,
            sec_type,
            flags,
            align,
            offset,
            size,
        });
    }

    Ok(sections)
}

/// Separate pass (needs the whole buffer, not just the section table) that
/// confirms every `STRTAB` section ends in a NUL byte.
pub fn check_strtabs_terminated(sections: &[Section], buf: &[u8]) -> Result<(), ParseError> {
    for sec in sections.iter().filter(|s| s.sec_type == sect_type::STRTAB) {
        if sec.size == 0 {
            continue;
        }
        let range = sec.range();
        let slice = buf.get(range).ok_or(ParseError::BadSectionBounds { index: sec.index })?;
        if *slice.last().unwrap() != 0 {
            return Err(ParseError::UnterminatedStrtab { index: sec.index });
        }
    }
    Ok(())
}

/// Applies every `URELHDR` section's relocations in place. Only
/// `DOF_RELO_NONE` (ignored) and `DOF_RELO_SETX` (add `load_base`, 64-bit)
/// are supported; anything else is fatal. A target already `>= load_base`
/// is assumed already relocated (by the dynamic linker) and is skipped,
/// matching the original parser's idempotence guarantee.
pub fn apply_relocations(
    sections: &[Section],
    buf: &mut [u8],
    load_base: u64,
) -> Result<(), ParseError> {
    let urelhdrs: Vec<Section> = sections
        .iter()
        .copied()
        .filter(|s| s.sec_type == sect_type::URELHDR)
        .collect();

    for urel in urelhdrs {
        let hdr_bytes = buf
            .get(urel.range())
            .ok_or(ParseError::BadSectionBounds { index: urel.index })?;
        let (layout, _) = LayoutVerified::<_, DofReloHdr>::new_unaligned_from_prefix(hdr_bytes)
            .ok_or(ParseError::BadSectionBounds { index: urel.index })?;
        let relo_hdr: DofReloHdr = *layout;

        let relsec = section_by_index(sections, relo_hdr.relsec.get())?;
        let tgtsec = section_by_index(sections, relo_hdr.tgtsec.get())?;

        if relsec.sec_type != sect_type::RELTAB {
            return Err(ParseError::WrongSectionType { index: relsec.index });
        }

        let entsize = std::mem::size_of::<DofRelo>();
        let count = relsec.size as usize / entsize;
        for i in 0..count {
            let rel_off = relsec.offset as usize + i * entsize;
            let raw = buf
                .get(rel_off..rel_off + entsize)
                .ok_or(ParseError::BadSectionBounds { index: relsec.index })?;
            let (layout, _) = LayoutVerified::<_, DofRelo>::new_unaligned_from_prefix(raw)
                .ok_or(ParseError::BadSectionBounds { index: relsec.index })?;
            let relo: DofRelo = *layout;

            match relo.reloc_type.get() {
                consts::DOF_RELO_NONE => continue,
                consts::DOF_RELO_SETX => {
                    let target_off = tgtsec.offset + relo.offset.get();
                    if target_off + 8 > tgtsec.offset + tgtsec.size {
                        return Err(ParseError::BadRelocationTarget { index: tgtsec.index });
                    }
                    let pos = target_off as usize;
                    let cur = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
                    if cur > load_base {
                        continue;
                    }
                    let new = relo.data.get().wrapping_add(load_base);
                    buf[pos..pos + 8].copy_from_slice(&new.to_le_bytes());
                }
                other => return Err(ParseError::BadRelocationType(other)),
            }
        }
    }

    Ok(())
}

fn section_by_index(sections: &[Section], index: u32) -> Result<Section, ParseError> {
    sections
        .get(index as usize)
        .copied()
        .ok_or(ParseError::BadSectionIndex { index })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dof_wire::layout::{DofHdr, DofIdent, LeU32, LeU64};

    fn hdr_with_sections(sections: &[DofSec]) -> (DofHdr, Vec<u8>) {
        let hdr_size = std::mem::size_of::<DofHdr>();
        let sec_size = std::mem::size_of::<DofSec>();
        let secoff = hdr_size as u64;
        let hdr = DofHdr {
            ident: DofIdent {
                magic: consts::DOF_MAGIC,
                model: consts::DOF_MODEL_LP64,
                encoding: consts::DOF_ENCODING_LITTLE,
                version: consts::DOF_VERSION_2,
                difvers: 0,
                difireg: 8,
                difdreg: 8,
                pad: [0; 6],
            },
            flags: LeU32::new(0),
            hdrsize: LeU32::new(hdr_size as u32),
            secsize: LeU32::new(sec_size as u32),
            secnum: LeU32::new(sections.len() as u32),
            secoff: LeU64::new(secoff),
            loadsz: LeU64::new(0),
            filesz: LeU64::new(0),
        };
        let mut buf = zerocopy::AsBytes::as_bytes(&hdr).to_vec();
        for s in sections {
            buf.extend_from_slice(zerocopy::AsBytes::as_bytes(s));
        }
        (hdr, buf)
    }

    #[test]
    fn section_requiring_load_flag_without_it_is_rejected() {
        let sec = DofSec {
            sec_type: LeU32::new(sect_type::STRTAB),
            align: LeU32::new(1),
            flags: LeU32::new(0),
            entsize: LeU32::new(0),
            offset: LeU64::new(0),
            size: LeU64::new(0),
        };
        let (hdr, buf) = hdr_with_sections(&[sec]);
        let validated = ValidatedHeader {
            hdr,
            section_table: &buf[std::mem::size_of::<DofHdr>()..],
        };
        let err = validate_sections(&validated, buf.len()).unwrap_err();
        assert!(matches!(err, ParseError::MissingLoadFlag { index: 0 }));
    }

    #[test]
    fn offset_not_a_multiple_of_alignment_is_rejected() {
        let sec = DofSec {
            sec_type: LeU32::new(sect_type::NONE),
            align: LeU32::new(8),
            flags: LeU32::new(0),
            entsize: LeU32::new(0),
            offset: LeU64::new(4),
            size: LeU64::new(0),
        };
        let (hdr, buf) = hdr_with_sections(&[sec]);
        let validated = ValidatedHeader {
            hdr,
            section_table: &buf[std::mem::size_of::<DofHdr>()..],
        };
        let err = validate_sections(&validated, buf.len()).unwrap_err();
        assert!(matches!(err, ParseError::UnalignedSectionOffset { index: 0, align: 8 }));
    }

    #[test]
    fn non_power_of_two_alignment_is_rejected() {
        let sec = DofSec {
            sec_type: LeU32::new(sect_type::NONE),
            align: LeU32::new(3),
            flags: LeU32::new(0),
            entsize: LeU32::new(0),
            offset: LeU64::new(0),
            size: LeU64::new(0),
        };
        let (hdr, buf) = hdr_with_sections(&[sec]);
        let validated = ValidatedHeader {
            hdr,
            section_table: &buf[std::mem::size_of::<DofHdr>()..],
        };
        let err = validate_sections(&validated, buf.len()).unwrap_err();
        assert!(matches!(err, ParseError::BadSectionAlignment { .. }));
    }
}
