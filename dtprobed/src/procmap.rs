//! Process-mapping oracle (spec.md §4.E).
//!
//! The out-of-scope "libproc-style process introspection library" is
//! realized with the `procfs` crate — already a teacher dependency, used
//! there for `/proc/self/stat` CPU/RSS sampling in `cognitod::main`'s
//! resource-monitoring loop. The oracle's contract (handle-acquire,
//! address→map, link-map→exec-map, handle-release, one error code) is
//! modeled as a single [`ProcMapError`] collapsing every failure mode a
//! caller can observe.

use procfs::process::{MMapPath, Process};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum ProcMapError {
    #[error("process no longer exists")]
    ProcessGone,
    #[error("process memory map unreadable")]
    MapsUnreadable,
    #[error("address is not mapped in this process")]
    AddressNotMapped,
    #[error("primary executable mapping could not be identified")]
    ExecMappingNotFound,
}

/// The (device, inode) pair that globally identifies a DOF object's
/// backing ELF mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingId {
    pub dev: u64,
    pub ino: u64,
}

impl std::fmt::Display for MappingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.dev, self.ino)
    }
}

/// A single "handle acquire ... handle release" oracle session for one pid,
/// matching the original's one-error-code contract.
pub struct ProcMapOracle {
    process: Process,
}

impl ProcMapOracle {
    pub fn open(pid: i32) -> Result<Self, ProcMapError> {
        let process = Process::new(pid).map_err(|_| ProcMapError::ProcessGone)?;
        Ok(Self { process })
    }

    /// Resolves the mapping containing `addr`.
    pub fn resolve_address(&self, addr: u64) -> Result<MappingId, ProcMapError> {
        let maps = self.process.maps().map_err(|_| ProcMapError::MapsUnreadable)?;
        for entry in maps.iter() {
            let (start, end) = entry.address;
            if addr >= start && addr < end {
                return mapping_id_of(entry).ok_or(ProcMapError::AddressNotMapped);
            }
        }
        Err(ProcMapError::AddressNotMapped)
    }

    /// Resolves the process's primary text mapping (its executable's own
    /// ELF mapping, i.e. the "link-map base").
    pub fn resolve_exec_mapping(&self) -> Result<MappingId, ProcMapError> {
        let exe = self.process.exe().map_err(|_| ProcMapError::ExecMappingNotFound)?;
        let maps = self.process.maps().map_err(|_| ProcMapError::MapsUnreadable)?;
        maps.iter()
            .find(|entry| matches!(&entry.pathname, MMapPath::Path(p) if *p == exe))
            .and_then(mapping_id_of)
            .ok_or(ProcMapError::ExecMappingNotFound)
    }
}

fn mapping_id_of(entry: &procfs::process::MemoryMapEntry) -> Option<MappingId> {
    if entry.inode == 0 {
        return None;
    }
    let (major, minor) = entry.dev;
    Some(MappingId {
        dev: ((major as u64) << 8) | (minor as u64),
        ino: entry.inode,
    })
}
