//! On-disk / on-wire DOF structures, overlaid directly on attacker-supplied
//! byte buffers.
//!
//! These mirror the technique used by the `dof` crate in
//! `oxidecomputer/usdt` (overlaying `dof_hdr`/`dof_sec`/`dof_probe` structs on
//! a byte slice with `zerocopy`), generalized to DOF that is *validated*
//! rather than trusted: every field is read through `zerocopy::byteorder`
//! wrapper types so no field access requires the buffer to be aligned, and
//! every overlay goes through a bounds-checked constructor.
//!
//! DOF is required to be little-endian (see `consts::DOF_ENCODING_LITTLE`);
//! cross-endian DOF is rejected in Phase 1 rather than byte-swapped. This is
//! the same simplifying assumption the `oxidecomputer/usdt` DOF reader makes
//! (it overlays native-endian structs unconditionally).

use zerocopy::byteorder::{LittleEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

pub type LeU32 = U32<LittleEndian>;
pub type LeU64 = U64<LittleEndian>;

/// Identifying prologue of a DOF header (16 bytes).
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes, Unaligned)]
#[repr(C)]
pub struct DofIdent {
    pub magic: [u8; 4],
    pub model: u8,
    pub encoding: u8,
    pub version: u8,
    pub difvers: u8,
    pub difireg: u8,
    pub difdreg: u8,
    pub pad: [u8; 6],
}

/// Full DOF header.
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes, Unaligned)]
#[repr(C)]
pub struct DofHdr {
    pub ident: DofIdent,
    pub flags: LeU32,
    pub hdrsize: LeU32,
    pub secsize: LeU32,
    pub secnum: LeU32,
    pub secoff: LeU64,
    /// Claimed total size of the DOF blob. Cross-checked against
    /// `DOF_MAXSZ` before any buffer of that size is allocated.
    pub loadsz: LeU64,
    pub filesz: LeU64,
}

/// Section header (32 bytes).
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes, Unaligned)]
#[repr(C)]
pub struct DofSec {
    pub sec_type: LeU32,
    pub align: LeU32,
    pub flags: LeU32,
    pub entsize: LeU32,
    pub offset: LeU64,
    pub size: LeU64,
}

/// Body of a `URELHDR` section: points at the strtab, the `RELTAB` section
/// holding the actual relocation entries, and the section being relocated.
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes, Unaligned)]
#[repr(C)]
pub struct DofReloHdr {
    pub strtab: LeU32,
    pub relsec: LeU32,
    pub tgtsec: LeU32,
    pub pad: LeU32,
}

/// One relocation entry within a `RELTAB` section.
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes, Unaligned)]
#[repr(C)]
pub struct DofRelo {
    pub reloc_type: LeU32,
    pub pad: LeU32,
    pub offset: LeU64,
    pub data: LeU64,
}

/// Format-version-1 provider descriptor. Version 2 appends `prenoffs`; see
/// [`DofProviderV2`] and `provider_struct_size_for_version`.
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes, Unaligned)]
#[repr(C)]
pub struct DofProviderV1 {
    pub strtab: LeU32,
    pub probes: LeU32,
    pub prargs: LeU32,
    pub proffs: LeU32,
    pub name: LeU32,
}

#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes, Unaligned)]
#[repr(C)]
pub struct DofProviderV2 {
    pub v1: DofProviderV1,
    pub prenoffs: LeU32,
}

/// One probe descriptor within a `PROBES` section.
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes, Unaligned)]
#[repr(C)]
pub struct DofProbe {
    pub func: LeU32,
    pub name: LeU32,
    pub offidx: LeU32,
    pub noffs: LeU32,
    pub enoffidx: LeU32,
    pub nenoffs: LeU32,
    pub nargc: u8,
    pub xargc: u8,
    pub pad: [u8; 2],
    pub argidx: LeU32,
    pub nargv: LeU32,
}

/// The ~64-byte per-registration helper struct the caller supplies: load
/// address and module name, stored verbatim so a later reparse can
/// reconstruct tracepoint addresses without the caller involved.
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes, Unaligned)]
#[repr(C)]
pub struct DofHelper {
    /// Reserved; must be zero. Present for layout parity with the original
    /// `dof_helper_t`, which used this word for an in-process DOF pointer.
    pub reserved: LeU64,
    /// Base address the DOF's providers were loaded at.
    pub load_addr: LeU64,
    /// NUL-padded module name.
    pub module: [u8; 48],
}

impl DofHelper {
    /// Decodes the NUL-padded module name, requiring an actual NUL terminator
    /// and UTF-8 content within `consts::MODULE_NAME_MAX` bytes — the same
    /// rigor `dof_parser::providers::read_cstr` applies to provider/function/
    /// probe names pulled from the DOF string table.
    pub fn module_str(&self) -> Result<&str, &'static str> {
        let end = self
            .module
            .iter()
            .position(|&b| b == 0)
            .ok_or("module name is not NUL-terminated")?;
        if end > crate::consts::MODULE_NAME_MAX {
            return Err("module name exceeds maximum length");
        }
        std::str::from_utf8(&self.module[..end]).map_err(|_| "module name is not valid UTF-8")
    }
}

/// Overlays the wire-format 64-byte helper struct. Every bit pattern is a
/// structurally valid `DofHelper` (plain fixed-width integers and a NUL-
/// padded byte array), so this can't fail given an exactly-64-byte input —
/// callers on both sides of the daemon/parser-child pipe and the control
/// socket share this instead of each hand-rolling field offsets.
pub fn parse_helper(raw: &[u8; 64]) -> DofHelper {
    DofHelper::read_from(raw.as_slice()).expect("DofHelper is exactly 64 bytes")
}

pub const fn provider_v1_size() -> usize {
    std::mem::size_of::<DofProviderV1>()
}

pub const fn provider_v2_size() -> usize {
    std::mem::size_of::<DofProviderV2>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn ident_is_sixteen_bytes() {
        assert_eq!(size_of::<DofIdent>(), 16);
    }

    #[test]
    fn helper_is_about_sixty_four_bytes() {
        assert_eq!(size_of::<DofHelper>(), 64);
    }

    #[test]
    fn provider_v2_is_larger_than_v1() {
        assert!(provider_v2_size() > provider_v1_size());
    }

    #[test]
    fn parse_helper_round_trips_load_addr_and_module() {
        let mut raw = [0u8; 64];
        raw[8..16].copy_from_slice(&0x400000u64.to_le_bytes());
        raw[16..19].copy_from_slice(b"lib");
        let helper = parse_helper(&raw);
        assert_eq!(helper.load_addr.get(), 0x400000);
        assert_eq!(helper.module_str().unwrap(), "lib");
    }

    #[test]
    fn helper_module_str_stops_at_nul() {
        let mut helper = DofHelper {
            reserved: LeU64::new(0),
            load_addr: LeU64::new(0x400000),
            module: [0; 48],
        };
        helper.module[..3].copy_from_slice(b"lib");
        assert_eq!(helper.module_str().unwrap(), "lib");
    }

    #[test]
    fn helper_module_str_rejects_missing_nul_terminator() {
        let helper = DofHelper {
            reserved: LeU64::new(0),
            load_addr: LeU64::new(0x400000),
            module: [b'a'; 48],
        };
        assert!(helper.module_str().is_err());
    }
}
