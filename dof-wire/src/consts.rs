//! Constants shared by the daemon and the sandboxed parser.
//!
//! Values mirror the defaults documented in the design: a 512MiB DOF size
//! cap, 64KiB ioctl-equivalent chunks, and the on-disk parsed-record version.

/// Magic bytes identifying a DOF blob (`\x7FDOF`).
pub const DOF_MAGIC: [u8; 4] = [0x7f, b'D', b'O', b'F'];

/// Supported DOF format versions. Anything else fails header validation.
pub const DOF_VERSION_1: u8 = 1;
pub const DOF_VERSION_2: u8 = 2;

/// Data model values in `DofIdent::model`.
pub const DOF_MODEL_NONE: u8 = 0;
pub const DOF_MODEL_ILP32: u8 = 1;
pub const DOF_MODEL_LP64: u8 = 2;

/// Encoding values in `DofIdent::encoding`. Only `LITTLE` is accepted: DOF
/// declaring `BIG` is rejected in Phase 1, matching the native-endian-only
/// scope decision recorded in DESIGN.md.
pub const DOF_ENCODING_NONE: u8 = 0;
pub const DOF_ENCODING_LITTLE: u8 = 1;
pub const DOF_ENCODING_BIG: u8 = 2;

/// Maximum accepted DOF blob size (the `load-size` field in the DOF header).
/// Overridable via configuration but this is the wire-level ceiling nothing
/// may exceed regardless of configuration.
pub const DOF_MAXSZ_DEFAULT: u64 = 512 * 1024 * 1024;

/// Default ioctl-equivalent chunk size for the chunked transfer state machine.
pub const CHUNK_SIZE_DEFAULT: usize = 64 * 1024;

/// Version prefix written at the start of every persisted parsed-probe file.
/// Bump whenever `ParsedRecord`'s on-disk encoding changes; daemon startup
/// discards and rebuilds any parsed file whose prefix disagrees.
pub const DOF_PARSED_VERSION: u64 = 1;

/// Section types. Only the subset the validator actually consults.
pub mod sect_type {
    pub const NONE: u32 = 0;
    pub const STRTAB: u32 = 1;
    pub const PROVIDER: u32 = 2;
    pub const PROBES: u32 = 3;
    pub const PRARGS: u32 = 4;
    pub const PROFFS: u32 = 5;
    pub const PRENOFFS: u32 = 6;
    pub const URELHDR: u32 = 7;
    pub const RELTAB: u32 = 8;

    /// Section types that must carry the `LOAD` flag (DOF_SEC_ISLOADABLE).
    pub fn is_loadable(t: u32) -> bool {
        matches!(
            t,
            STRTAB | PROVIDER | PROBES | PRARGS | PROFFS | PRENOFFS | URELHDR | RELTAB
        )
    }
}

/// `DofSec::flags` bit values.
pub const DOF_SECF_LOAD: u32 = 0x1;

/// Relocation types recognised in a `RELTAB` section.
pub const DOF_RELO_NONE: u32 = 0;
pub const DOF_RELO_SETX: u32 = 1;

/// Name length bounds enforced during provider extraction (Phase 3).
pub const PROVIDER_NAME_MAX: usize = 64;
pub const MODULE_NAME_MAX: usize = 64;
pub const FUNCTION_NAME_MAX: usize = 128;
pub const PROBE_NAME_MAX: usize = 64;

/// Maximum length of a single arg-type string (`DTRACE_ARGTYPELEN` in the
/// original), enforced while walking a probe's native arg-type strings.
pub const ARG_TYPE_MAX: usize = 128;

/// Required alignment of the section table itself.
pub const SECTION_TABLE_ALIGN: u64 = 8;

/// Default well-known device / socket name (spec.md `-n` flag default).
pub const DEFAULT_DEVICE_NAME: &str = "dtrace/helper";

/// Default state directory (spec.md `-s` flag default).
pub const DEFAULT_STATE_DIR: &str = "/run/dtrace";

/// Default parser reply timeout in seconds (spec.md `-t` flag default).
pub const DEFAULT_PARSER_TIMEOUT_SECS: u64 = 5;

/// Default caller-state sweep interval, in accepted connections.
pub const DEFAULT_SWEEP_INTERVAL: u64 = 128;

/// Sweep interval under `_DTRACE_TESTING`.
pub const TESTING_SWEEP_INTERVAL: u64 = 5;
