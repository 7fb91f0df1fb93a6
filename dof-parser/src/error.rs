use thiserror::Error;

/// Every way a DOF buffer can be rejected, across all three validation
/// phases. Mirrors the `thiserror`-based `DofError` in
/// `examples/other_examples/.../oxidecomputer-usdt/dof/src/lib.rs`, widened
/// to cover validation (not just construction) failures.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ParseError {
    #[error("buffer too small for a DOF header ({len} < {need})")]
    TruncatedHeader { len: usize, need: usize },
    #[error("bad DOF magic")]
    BadMagic,
    #[error("unsupported data model {0}")]
    BadModel(u8),
    #[error("unsupported byte encoding {0}")]
    BadEncoding(u8),
    #[error("unsupported DOF version {0}")]
    BadVersion(u8),
    #[error("nonzero reserved field")]
    ReservedNonzero,
    #[error("claimed load size {claimed} exceeds the {max} maximum")]
    TooLarge { claimed: u64, max: u64 },
    #[error("section table offset/stride out of bounds")]
    BadSectionTable,
    #[error("section table is not {align}-byte aligned")]
    Misaligned { align: u64 },
    #[error("section {index} has out-of-bounds offset/size")]
    BadSectionBounds { index: u32 },
    #[error("section {index} requires the LOAD flag")]
    MissingLoadFlag { index: u32 },
    #[error("section {index} alignment {align} is not a power of two")]
    BadSectionAlignment { index: u32, align: u32 },
    #[error("section {index} offset is not a multiple of its {align}-byte alignment")]
    UnalignedSectionOffset { index: u32, align: u32 },
    #[error("string table section {index} is not NUL-terminated")]
    UnterminatedStrtab { index: u32 },
    #[error("unsupported relocation type {0}")]
    BadRelocationType(u32),
    #[error("relocation in section {index} is out of bounds")]
    BadRelocationTarget { index: u32 },
    #[error("provider struct size {found} too small for format version {version}")]
    BadProviderSize { version: u8, found: usize },
    #[error("section index {index} out of range")]
    BadSectionIndex { index: u32 },
    #[error("section {index} has the wrong type for this role")]
    WrongSectionType { index: u32 },
    #[error("name exceeds the {max}-byte limit")]
    NameTooLong { max: usize },
    #[error("name is not NUL-terminated within its string table")]
    UnterminatedName,
    #[error("probe offset array is out of bounds")]
    BadOffsetArray,
    #[error("probe has no offsets of any kind")]
    NoOffsets,
    #[error("is-enabled offsets present but no is-enabled section exists")]
    UnexpectedIsEnabled,
    #[error("duplicate tracepoint offset after sort")]
    DuplicateOffset,
    #[error("arg-type index/string out of bounds")]
    BadArgType,
    #[error("i/o error talking to the host: {0}")]
    Io(String),
}

impl ParseError {
    /// The errno-shaped code reported back to the caller over the control
    /// socket (spec.md §7: "reply with a generic numeric error").
    pub fn to_errno(&self) -> i32 {
        match self {
            ParseError::TooLarge { .. } => libc::E2BIG,
            ParseError::Io(_) => libc::EIO,
            _ => libc::EINVAL,
        }
    }
}
