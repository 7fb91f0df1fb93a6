//! Phase 1: header validation.
//!
//! Checks the fixed-size `DofHdr` prologue in isolation — nothing here
//! touches section contents. A buffer that fails this phase is rejected
//! before a single byte past the header is interpreted.

use dof_wire::consts;
use dof_wire::layout::DofHdr;
use zerocopy::LayoutVerified;

use crate::error::ParseError;

/// A header that has passed every Phase 1 check, plus the slice of the
/// input buffer that holds the (unvalidated) section table.
pub struct ValidatedHeader<'a> {
    pub hdr: DofHdr,
    pub section_table: &'a [u8],
}

pub fn validate_header(buf: &[u8], maxsz: u64) -> Result<ValidatedHeader<'_>, ParseError> {
    let need = std::mem::size_of::<DofHdr>();
    if buf.len() < need {
        return Err(ParseError::TruncatedHeader {
            len: buf.len(),
            need,
        });
    }

    let (layout, _) =
        LayoutVerified::<_, DofHdr>::new_unaligned_from_prefix(buf).ok_or(ParseError::TruncatedHeader {
            len: buf.len(),
            need,
        })?;
    let hdr: DofHdr = *layout;

    if hdr.ident.magic != consts::DOF_MAGIC {
        return Err(ParseError::BadMagic);
    }
    match hdr.ident.model {
        consts::DOF_MODEL_ILP32 | consts::DOF_MODEL_LP64 => {}
        other => return Err(ParseError::BadModel(other)),
    }
    if hdr.ident.encoding != consts::DOF_ENCODING_LITTLE {
        return Err(ParseError::BadEncoding(hdr.ident.encoding));
    }
    match hdr.ident.version {
        consts::DOF_VERSION_1 | consts::DOF_VERSION_2 => {}
        other => return Err(ParseError::BadVersion(other)),
    }
    if hdr.ident.pad != [0u8; 6] {
        return Err(ParseError::ReservedNonzero);
    }

    let loadsz = hdr.loadsz.get();
    if loadsz > maxsz {
        return Err(ParseError::TooLarge {
            claimed: loadsz,
            max: maxsz,
        });
    }

    let hdrsize = hdr.hdrsize.get() as usize;
    if hdrsize < need {
        return Err(ParseError::BadSectionTable);
    }

    let secoff = hdr.secoff.get();
    let secsize = hdr.secsize.get() as u64;
    let secnum = hdr.secnum.get() as u64;

    if secoff % consts::SECTION_TABLE_ALIGN != 0 {
        return Err(ParseError::Misaligned {
            align: consts::SECTION_TABLE_ALIGN,
        });
    }

    let table_len = secnum
        .checked_mul(secsize)
        .ok_or(ParseError::BadSectionTable)?;
    let table_end = secoff.checked_add(table_len).ok_or(ParseError::BadSectionTable)?;
    if table_end > buf.len() as u64 || table_end > loadsz {
        return Err(ParseError::BadSectionTable);
    }

    let start = secoff as usize;
    let end = table_end as usize;
    Ok(ValidatedHeader {
        hdr,
        section_table: &buf[start..end],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dof_wire::layout::{DofIdent, LeU32, LeU64};

    fn base_hdr() -> DofHdr {
        DofHdr {
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
            hdrsize: LeU32::new(std::mem::size_of::<DofHdr>() as u32),
            secsize: LeU32::new(32),
            secnum: LeU32::new(0),
            secoff: LeU64::new(std::mem::size_of::<DofHdr>() as u64),
            loadsz: LeU64::new(std::mem::size_of::<DofHdr>() as u64),
            filesz: LeU64::new(std::mem::size_of::<DofHdr>() as u64),
        }
    }

    fn bytes_of(hdr: &DofHdr) -> Vec<u8> {
        zerocopy::AsBytes::as_bytes(hdr).to_vec()
    }

    #[test]
    fn empty_dof_with_no_sections_validates() {
        let hdr = base_hdr();
        let buf = bytes_of(&hdr);
        let result = validate_header(&buf, consts::DOF_MAXSZ_DEFAULT);
        assert!(result.is_ok());
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let err = validate_header(&[0u8; 4], consts::DOF_MAXSZ_DEFAULT).unwrap_err();
        assert!(matches!(err, ParseError::TruncatedHeader { .. }));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut hdr = base_hdr();
        hdr.ident.magic = [0; 4];
        let buf = bytes_of(&hdr);
        assert_eq!(
            validate_header(&buf, consts::DOF_MAXSZ_DEFAULT).unwrap_err(),
            ParseError::BadMagic
        );
    }

    #[test]
    fn oversized_claim_is_rejected() {
        let mut hdr = base_hdr();
        hdr.loadsz = LeU64::new(consts::DOF_MAXSZ_DEFAULT + 1);
        let buf = bytes_of(&hdr);
        assert!(matches!(
            validate_header(&buf, consts::DOF_MAXSZ_DEFAULT),
            Err(ParseError::TooLarge { .. })
        ));
    }

    #[test]
    fn misaligned_section_table_is_rejected() {
        let mut hdr = base_hdr();
        hdr.secoff = LeU64::new(hdr.secoff.get() + 1);
        let buf = bytes_of(&hdr);
        assert!(matches!(
            validate_header(&buf, consts::DOF_MAXSZ_DEFAULT),
            Err(ParseError::Misaligned { .. })
        ));
    }

    #[test]
    fn big_endian_dof_is_rejected() {
        let mut hdr = base_hdr();
        hdr.ident.encoding = consts::DOF_ENCODING_BIG;
        let buf = bytes_of(&hdr);
        assert!(matches!(
            validate_header(&buf, consts::DOF_MAXSZ_DEFAULT),
            Err(ParseError::BadEncoding(_))
        ));
    }
}
