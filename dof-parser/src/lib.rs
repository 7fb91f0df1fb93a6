//! Three-phase DOF validator and decomposer.
//!
//! Meant to run inside a seccomp-jailed child process (see the
//! `dof-parser-child` binary) fed adversary-controlled bytes by `dtprobed`.
//! Nothing in this crate trusts its input further than the phase that has
//! already validated it: header fields gate section-table access, section
//! bounds gate every later byte read, and so on.

pub mod error;
pub mod header;
pub mod providers;
pub mod sections;

use dof_wire::record::ParsedRecord;

pub use error::ParseError;

/// Runs all three phases over `buf`, mutating it in place to apply
/// relocations, and returns the flattened record stream a caller would
/// otherwise receive one [`ParsedRecord`] at a time over the parser pipe.
pub fn parse_dof(
    buf: &mut [u8],
    load_addr: u64,
    module: &str,
    maxsz: u64,
) -> Result<Vec<ParsedRecord>, ParseError> {
    let buf_len = buf.len();
    let validated = header::validate_header(buf, maxsz)?;
    let dof_version = validated.hdr.ident.version;
    let sections = sections::validate_sections(&validated, buf_len)?;
    sections::check_strtabs_terminated(&sections, buf)?;
    sections::apply_relocations(&sections, buf, load_addr)?;
    providers::extract_providers(&sections, buf, dof_version, module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dof_wire::consts::{self, sect_type};
    use dof_wire::layout::{DofHdr, DofIdent, DofProviderV2, DofSec, LeU32, LeU64};

    fn pad_to(buf: &mut Vec<u8>, align: usize) {
        while buf.len() % align != 0 {
            buf.push(0);
        }
    }

    /// Builds a minimal, fully valid DOF buffer with one provider, one
    /// probe, and one tracepoint offset — enough to exercise all three
    /// phases end to end.
    fn build_minimal_dof() -> Vec<u8> {
        let hdr_size = std::mem::size_of::<DofHdr>();
        let sec_size = std::mem::size_of::<DofSec>();

        // Layout (in order): header, 5 section headers, strtab, provider,
        // probes, proffs, prargs.
        const N_SECTIONS: u32 = 5;
        let secoff = hdr_size as u64;
        let data_off = secoff + N_SECTIONS as u64 * sec_size as u64;

        let strtab_off = data_off;
        // strtab: \0 "myprov\0" "myfunc\0" "myprobe\0"
        let mut strtab = vec![0u8];
        let prov_name_off = strtab.len() as u32;
        strtab.extend_from_slice(b"myprov\0");
        let func_name_off = strtab.len() as u32;
        strtab.extend_from_slice(b"myfunc\0");
        let probe_name_off = strtab.len() as u32;
        strtab.extend_from_slice(b"myprobe\0");
        let strtab_len = strtab.len() as u64;
        pad_to(&mut strtab, 4);

        let provider_off = strtab_off + strtab.len() as u64;
        let provider = DofProviderV2 {
            v1: dof_wire::layout::DofProviderV1 {
                strtab: LeU32::new(0),
                probes: LeU32::new(2),
                prargs: LeU32::new(4),
                proffs: LeU32::new(3),
                name: LeU32::new(prov_name_off),
            },
            prenoffs: LeU32::new(u32::MAX),
        };
        let provider_bytes = zerocopy::AsBytes::as_bytes(&provider).to_vec();
        let provider_len = provider_bytes.len() as u64;

        let probes_off = provider_off + provider_len;
        let probe = dof_wire::layout::DofProbe {
            func: LeU32::new(func_name_off),
            name: LeU32::new(probe_name_off),
            offidx: LeU32::new(0),
            noffs: LeU32::new(1),
            enoffidx: LeU32::new(0),
            nenoffs: LeU32::new(0),
            nargc: 0,
            xargc: 0,
            pad: [0; 2],
            argidx: LeU32::new(0),
            nargv: LeU32::new(0),
        };
        let probe_bytes = zerocopy::AsBytes::as_bytes(&probe).to_vec();
        let probe_len = probe_bytes.len() as u64;

        let proffs_off = probes_off + probe_len;
        let proffs_bytes = 0x1000u32.to_le_bytes().to_vec();
        let proffs_len = proffs_bytes.len() as u64;

        // Empty: the probe above declares xargc = 0, so no prargs bytes are
        // ever read, but every provider must still reference a real PRARGS
        // section for `extract_one_provider`'s section-type lookup to pass.
        let prargs_off = proffs_off + proffs_len;
        let prargs_bytes: Vec<u8> = Vec::new();
        let prargs_len = prargs_bytes.len() as u64;

        let sections = [
            DofSec {
                sec_type: LeU32::new(sect_type::STRTAB),
                align: LeU32::new(1),
                flags: LeU32::new(consts::DOF_SECF_LOAD),
                entsize: LeU32::new(0),
                offset: LeU64::new(strtab_off),
                size: LeU64::new(strtab_len),
            },
            DofSec {
                sec_type: LeU32::new(sect_type::PROVIDER),
                align: LeU32::new(4),
                flags: LeU32::new(consts::DOF_SECF_LOAD),
                entsize: LeU32::new(0),
                offset: LeU64::new(provider_off),
                size: LeU64::new(provider_len),
            },
            DofSec {
                sec_type: LeU32::new(sect_type::PROBES),
                align: LeU32::new(4),
                flags: LeU32::new(consts::DOF_SECF_LOAD),
                entsize: LeU32::new(probe_len as u32),
                offset: LeU64::new(probes_off),
                size: LeU64::new(probe_len),
            },
            DofSec {
                sec_type: LeU32::new(sect_type::PROFFS),
                align: LeU32::new(4),
                flags: LeU32::new(consts::DOF_SECF_LOAD),
                entsize: LeU32::new(4),
                offset: LeU64::new(proffs_off),
                size: LeU64::new(proffs_len),
            },
            DofSec {
                sec_type: LeU32::new(sect_type::PRARGS),
                align: LeU32::new(1),
                flags: LeU32::new(consts::DOF_SECF_LOAD),
                entsize: LeU32::new(1),
                offset: LeU64::new(prargs_off),
                size: LeU64::new(prargs_len),
            },
        ];

        let total_len = prargs_off + prargs_len;

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
            secnum: LeU32::new(N_SECTIONS),
            secoff: LeU64::new(secoff),
            loadsz: LeU64::new(total_len),
            filesz: LeU64::new(total_len),
        };

        let mut buf = zerocopy::AsBytes::as_bytes(&hdr).to_vec();
        for s in &sections {
            buf.extend_from_slice(zerocopy::AsBytes::as_bytes(s));
        }
        buf.extend_from_slice(&strtab);
        buf.extend_from_slice(&provider_bytes);
        buf.extend_from_slice(&probe_bytes);
        buf.extend_from_slice(&proffs_bytes);
        buf.extend_from_slice(&prargs_bytes);
        buf
    }

    #[test]
    fn minimal_dof_parses_to_one_provider_one_probe_one_tracepoint() {
        let mut buf = build_minimal_dof();
        let records = parse_dof(&mut buf, 0x400000, "mymod", consts::DOF_MAXSZ_DEFAULT).unwrap();
        assert_eq!(
            records,
            vec![
                ParsedRecord::Provider {
                    name: "myprov".to_string(),
                    nprobes: 1,
                },
                ParsedRecord::Probe {
                    module: "mymod".to_string(),
                    function: "myfunc".to_string(),
                    name: "myprobe".to_string(),
                    ntracepoints: 1,
                },
                ParsedRecord::Tracepoint {
                    addr: 0x1000,
                    is_enabled: false,
                },
            ]
        );
    }

    #[test]
    fn no_provider_sections_yields_single_zero_count_record() {
        let hdr_size = std::mem::size_of::<DofHdr>();
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
            secsize: LeU32::new(std::mem::size_of::<DofSec>() as u32),
            secnum: LeU32::new(0),
            secoff: LeU64::new(hdr_size as u64),
            loadsz: LeU64::new(hdr_size as u64),
            filesz: LeU64::new(hdr_size as u64),
        };
        let mut buf = zerocopy::AsBytes::as_bytes(&hdr).to_vec();
        let records = parse_dof(&mut buf, 0, "mymod", consts::DOF_MAXSZ_DEFAULT).unwrap();
        assert_eq!(
            records,
            vec![ParsedRecord::Provider {
                name: String::new(),
                nprobes: 0,
            }]
        );
    }

    #[test]
    fn bad_magic_is_rejected_before_any_section_is_touched() {
        let mut buf = vec![0u8; std::mem::size_of::<DofHdr>()];
        assert_eq!(
            parse_dof(&mut buf, 0, "mymod", consts::DOF_MAXSZ_DEFAULT).unwrap_err(),
            ParseError::BadMagic
        );
    }
}
