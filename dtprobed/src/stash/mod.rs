//! The DOF stash: spec.md §4.D's on-disk, hard-link-refcounted, crash-
//! resistant registration store.
//!
//! Filesystem primitives (`O_EXCL` creation, `linkat`, `unlinkat`,
//! `ftruncate`, `readlinkat`) are reached through the `nix` crate — already
//! a teacher dependency — mirroring how `cognitod`'s own `procfs`/`nix`
//! usage reaches raw Linux facilities rather than reimplementing them.

mod rollback;

pub use rollback::{RollbackAction, ScopeGuard};

use dof_wire::consts::DOF_PARSED_VERSION;
use dof_wire::record::ParsedRecord;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::unistd;
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::symlink;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::procmap::MappingId;

#[derive(Debug, Error)]
pub enum StashError {
    #[error("reserved path component {0:?}")]
    ReservedName(String),
    #[error("pid {0} has no such generation")]
    NoSuchGeneration(i32, u64),
    #[error("another daemon instance is concurrently mutating the stash; aborting")]
    ConcurrentDaemonDetected,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("os error: {0}")]
    Errno(#[from] nix::errno::Errno),
}

fn mapping_key(m: MappingId) -> String {
    format!("{}-{}", m.dev, m.ino)
}

/// One probe's fully-qualified name, used both as the parsed-file name
/// (`<prov>:<mod>:<fun>:<prb>`) and as the `probes/` path components.
#[derive(Debug, Clone)]
struct ProbeKey {
    provider: String,
    module: String,
    function: String,
    probe: String,
}

impl ProbeKey {
    fn filename(&self) -> String {
        format!("{}:{}:{}:{}", self.provider, self.module, self.function, self.probe)
    }

    fn validate(&self) -> Result<(), StashError> {
        for c in [&self.provider, &self.module, &self.function, &self.probe] {
            rollback::reject_reserved_component(c)?;
        }
        Ok(())
    }
}

/// An explicit handle holding the stash's root path and the policy options,
/// constructed once at startup and threaded everywhere — replacing the
/// "three global root directory file descriptors" pattern spec.md §9 flags
/// for re-architecture.
#[derive(Clone)]
pub struct StashHandle {
    root: PathBuf,
}

/// One parsed subtree found stale by [`StashHandle::collect_stale`]. Its
/// `parsed/` directory has already been removed; `raw`/`helper` are enough
/// to resubmit the registration through the sandboxed parser and rebuild it
/// with [`StashHandle::rebuild_parsed`].
pub struct StaleEntry {
    pub mapping_dir: PathBuf,
    pub module: String,
    pub raw: Vec<u8>,
    pub helper: [u8; 64],
}

impl StashHandle {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StashError> {
        let root = root.into();
        fs::create_dir_all(root.join("stash/dof"))?;
        fs::create_dir_all(root.join("stash/dof-pid"))?;
        fs::create_dir_all(root.join("probes"))?;
        Ok(Self { root })
    }

    fn dof_root_file(&self, key: &str) -> PathBuf {
        self.root.join("stash/dof").join(key)
    }

    fn pid_dir(&self, pid: i32) -> PathBuf {
        self.root.join("stash/dof-pid").join(pid.to_string())
    }

    fn probes_root(&self) -> PathBuf {
        self.root.join("probes")
    }

    /// Registers one DOF object's worth of parsed records for `pid`,
    /// returning the new generation number.
    ///
    /// `records` is the flattened [`ParsedRecord`] stream the parser
    /// emitted: one `Provider`, then per probe a `Probe` followed by its
    /// `Tracepoint`s. Probes with zero tracepoints are silently skipped
    /// (spec.md §8 boundary behaviour), and a failure writing any single
    /// probe's parsed file does not abort the registration — surviving
    /// probes remain active (spec.md §7, §9 Open Questions).
    pub fn add_registration(
        &self,
        pid: i32,
        mapping: MappingId,
        exec_mapping: MappingId,
        module: &str,
        dof_raw: &[u8],
        helper_raw: &[u8; 64],
        records: &[ParsedRecord],
    ) -> Result<u64, StashError> {
        let pid_dir = self.pid_dir(pid);
        let mut guard = ScopeGuard::new();

        let pid_dir_existed = pid_dir.exists();
        fs::create_dir_all(&pid_dir)?;
        if !pid_dir_existed {
            guard.push_dir(pid_dir.clone());
        }

        self.invalidate_on_exec_change(pid, &pid_dir, exec_mapping, &mut guard)?;
        self.write_exec_mapping(&pid_dir, exec_mapping)?;

        let generation = self.next_generation(&pid_dir)?;

        let key = mapping_key(mapping);
        let mapping_dir = pid_dir.join(&key);
        let subtree_is_new = !mapping_dir.exists();

        if subtree_is_new {
            self.materialize_subtree(&mapping_dir, &key, module, dof_raw, helper_raw, records, &mut guard)?;
        }

        let symlink_path = pid_dir.join(generation.to_string());
        symlink(&key, &symlink_path)?;
        guard.push_file(symlink_path);

        guard.commit();
        Ok(generation)
    }

    fn materialize_subtree(
        &self,
        mapping_dir: &Path,
        key: &str,
        module: &str,
        dof_raw: &[u8],
        helper_raw: &[u8; 64],
        records: &[ParsedRecord],
        guard: &mut ScopeGuard,
    ) -> Result<(), StashError> {
        let dof_root = self.dof_root_file(key);
        if !dof_root.exists() {
            fs::write(&dof_root, dof_raw)?;
        }

        fs::create_dir_all(mapping_dir)?;
        guard.push_dir(mapping_dir.to_path_buf());

        let raw_link = mapping_dir.join("raw");
        unistd::linkat(None, &dof_root, None, &raw_link, unistd::LinkatFlags::NoSymlinkFollow)?;
        guard.push_file(raw_link);

        let dh_path = mapping_dir.join("dh");
        fs::write(&dh_path, helper_raw)?;
        guard.push_file(dh_path);

        let parsed_dir = mapping_dir.join("parsed");
        fs::create_dir_all(&parsed_dir)?;
        guard.push_dir(parsed_dir.clone());

        let version_path = parsed_dir.join("version");
        fs::write(&version_path, DOF_PARSED_VERSION.to_le_bytes())?;
        guard.push_file(version_path);

        for (key, recs) in group_probes(records, module) {
            if let Err(e) = key.validate() {
                log::warn!("dropping probe {}: {e}", key.filename());
                continue;
            }
            // Per spec.md §7/§9: a failure writing one probe's parsed file
            // is logged and that probe is dropped; it does not abort the
            // rest of the registration.
            if let Err(e) = self.write_one_probe(&parsed_dir, &key, &recs) {
                log::warn!("dropping probe {}: {e}", key.filename());
                continue;
            }
            if let Err(e) = self.link_probe_into_namespace(mapping_dir, &key) {
                log::warn!("failed to publish probe {}: {e}", key.filename());
            }
        }

        Ok(())
    }

    fn write_one_probe(&self, parsed_dir: &Path, key: &ProbeKey, recs: &[ParsedRecord]) -> Result<(), StashError> {
        let path = parsed_dir.join(key.filename());
        let mut buf = Vec::new();
        for rec in recs {
            dof_wire::record::write_frame(&mut buf, &rec.encode())?;
        }
        fs::write(path, buf)?;
        Ok(())
    }

    fn link_probe_into_namespace(&self, mapping_dir: &Path, key: &ProbeKey) -> Result<(), StashError> {
        let pid = mapping_dir
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|s| s.to_str())
            .unwrap_or("0");
        let probe_dir = self
            .probes_root()
            .join(pid)
            .join(format!("{}{}", key.provider, pid))
            .join(&key.module)
            .join(&key.function);
        fs::create_dir_all(&probe_dir)?;
        let src = mapping_dir.join("parsed").join(key.filename());
        let dst = probe_dir.join(&key.probe);
        if dst.exists() {
            return Ok(());
        }
        unistd::linkat(None, &src, None, &dst, unistd::LinkatFlags::NoSymlinkFollow)?;
        Ok(())
    }

    fn invalidate_on_exec_change(
        &self,
        pid: i32,
        pid_dir: &Path,
        exec_mapping: MappingId,
        _guard: &mut ScopeGuard,
    ) -> Result<(), StashError> {
        let exec_path = pid_dir.join("exec-mapping");
        let current = fs::read_to_string(&exec_path).ok();
        let new_value = mapping_key(exec_mapping);
        if let Some(current) = current {
            if current != new_value {
                log::info!("pid {pid} exec-mapping changed {current} -> {new_value}; purging prior registrations");
                self.purge_pid_subtree(pid_dir)?;
            }
        }
        Ok(())
    }

    fn write_exec_mapping(&self, pid_dir: &Path, exec_mapping: MappingId) -> Result<(), StashError> {
        fs::write(pid_dir.join("exec-mapping"), mapping_key(exec_mapping))?;
        Ok(())
    }

    fn next_generation(&self, pid_dir: &Path) -> Result<u64, StashError> {
        let path = pid_dir.join("next-gen");
        let file = fs::OpenOptions::new().create(true).read(true).write(true).open(&path)?;
        let current = file.metadata()?.len();
        unistd::ftruncate(file.as_raw_fd(), current as i64 + 1)?;
        Ok(current)
    }

    /// Removes the generation `g` for `pid`. Detects a racing second daemon
    /// instance via the stat/readlinkat length check described in spec.md
    /// §4.D.
    pub fn remove_registration(&self, pid: i32, generation: u64) -> Result<(), StashError> {
        let pid_dir = self.pid_dir(pid);
        let symlink_path = pid_dir.join(generation.to_string());

        let expected_len = fs::symlink_metadata(&symlink_path)
            .map_err(|_| StashError::NoSuchGeneration(pid, generation))?
            .len() as usize;

        let target = self.readlinkat_with_race_check(&symlink_path, expected_len)?;
        fs::remove_file(&symlink_path)?;

        if !self.any_symlink_targets(&pid_dir, &target)? {
            self.destroy_subtree(&pid_dir, &target)?;
        }

        Ok(())
    }

    fn readlinkat_with_race_check(&self, path: &Path, expected_len: usize) -> Result<String, StashError> {
        let dirfd = fcntl::open(
            path.parent().unwrap_or(Path::new(".")),
            OFlag::O_RDONLY | OFlag::O_DIRECTORY,
            Mode::empty(),
        )?;
        let file_name = path.file_name().unwrap_or_default();
        let mut buf = vec![0u8; expected_len + 1];
        let n = nix::fcntl::readlinkat(dirfd, Path::new(file_name), &mut buf)?;
        let _ = unistd::close(dirfd);
        if n.len() == expected_len + 1 {
            return Err(StashError::ConcurrentDaemonDetected);
        }
        Ok(n.to_string_lossy().into_owned())
    }

    fn any_symlink_targets(&self, pid_dir: &Path, target: &str) -> Result<bool, StashError> {
        for entry in fs::read_dir(pid_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.parse::<u64>().is_err() {
                continue;
            }
            if let Ok(dest) = fs::read_link(entry.path()) {
                if dest.to_string_lossy() == target {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn destroy_subtree(&self, pid_dir: &Path, key: &str) -> Result<(), StashError> {
        let mapping_dir = pid_dir.join(key);
        let parsed_dir = mapping_dir.join("parsed");
        if let Ok(entries) = fs::read_dir(&parsed_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name == "version" {
                    continue;
                }
                if let Some(key) = parse_probe_filename(&name) {
                    let pid = pid_dir.file_name().and_then(|s| s.to_str()).unwrap_or("0");
                    let probe_path = self
                        .probes_root()
                        .join(pid)
                        .join(format!("{}{}", key.provider, pid))
                        .join(&key.module)
                        .join(&key.function)
                        .join(&key.probe);
                    let _ = fs::remove_file(probe_path);
                }
            }
        }

        let dof_root = self.dof_root_file(key);
        fs::remove_dir_all(&mapping_dir)?;

        if let Ok(meta) = fs::metadata(&dof_root) {
            if nix::sys::stat::stat(&dof_root).map(|s| s.st_nlink).unwrap_or(2) <= 1 {
                let _ = fs::remove_file(&dof_root);
            }
            let _ = meta;
        }

        Ok(())
    }

    fn purge_pid_subtree(&self, pid_dir: &Path) -> Result<(), StashError> {
        for entry in fs::read_dir(pid_dir)?.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Ok(gen) = name.parse::<u64>() {
                if let Ok(target) = fs::read_link(entry.path()) {
                    let _ = self.destroy_subtree(pid_dir, &target.to_string_lossy());
                }
                let _ = fs::remove_file(entry.path());
                let _ = gen;
            }
        }
        Ok(())
    }

    /// Periodic pruning: walks `stash/dof-pid/*`, skipping non-numeric
    /// names, and removes subtrees for pids that are no longer alive
    /// (checked via a signal-0 `kill`).
    pub fn prune_dead_pids(&self) -> usize {
        let mut pruned = 0;
        let dof_pid_root = self.root.join("stash/dof-pid");
        let entries = match fs::read_dir(&dof_pid_root) {
            Ok(e) => e,
            Err(_) => return 0,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Ok(pid) = name.parse::<i32>() else { continue };
            if process_is_alive(pid) {
                continue;
            }
            log::info!("pruning dead pid {pid}");
            let _ = self.purge_pid_subtree(&entry.path());
            let _ = fs::remove_dir_all(entry.path());
            pruned += 1;
        }
        pruned
    }

    /// Startup/forced reparse, phase one: finds every parsed subtree whose
    /// `version` file disagrees with the current code (or, if `force`,
    /// every subtree regardless), removes its stale `parsed/` directory, and
    /// returns enough (raw DOF, helper) to resubmit it through the sandboxed
    /// parser. Synchronous and filesystem-only, so it can run from `main`
    /// before any async runtime exists; the async reparse itself (talking to
    /// the parser sandbox) is the caller's job, finishing with
    /// [`StashHandle::rebuild_parsed`].
    pub fn collect_stale(&self, force: bool) -> Vec<StaleEntry> {
        let mut stale = Vec::new();
        for entry in walkdir::WalkDir::new(self.root.join("stash/dof-pid"))
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .flatten()
        {
            if !entry.file_type().is_dir() {
                continue;
            }
            let parsed_dir = entry.path().join("parsed");
            let version_path = parsed_dir.join("version");
            let is_stale = force
                || fs::read(&version_path)
                    .map(|bytes| bytes != DOF_PARSED_VERSION.to_le_bytes())
                    .unwrap_or(true);
            if !is_stale {
                continue;
            }
            let raw_path = entry.path().join("raw");
            let Ok(raw) = fs::read(&raw_path) else { continue };
            let dh_path = entry.path().join("dh");
            let Ok(dh_bytes) = fs::read(&dh_path) else { continue };
            let Ok(helper): Result<[u8; 64], _> = dh_bytes.try_into() else { continue };
            let Ok(module) = dof_wire::layout::parse_helper(&helper).module_str().map(str::to_string) else {
                continue;
            };

            let _ = fs::remove_dir_all(&parsed_dir);
            stale.push(StaleEntry { mapping_dir: entry.path().to_path_buf(), module, raw, helper });
        }
        stale
    }

    /// Startup/forced reparse, phase two: rebuilds `parsed/` for one
    /// [`StaleEntry`] from a fresh [`ParsedRecord`] stream, using the same
    /// probe-grouping and namespace-linking logic as a live registration.
    pub fn rebuild_parsed(&self, mapping_dir: &Path, module: &str, records: &[ParsedRecord]) -> Result<(), StashError> {
        let parsed_dir = mapping_dir.join("parsed");
        fs::create_dir_all(&parsed_dir)?;
        fs::write(parsed_dir.join("version"), DOF_PARSED_VERSION.to_le_bytes())?;

        for (key, recs) in group_probes(records, module) {
            if let Err(e) = key.validate() {
                log::warn!("dropping probe {}: {e}", key.filename());
                continue;
            }
            if let Err(e) = self.write_one_probe(&parsed_dir, &key, &recs) {
                log::warn!("dropping probe {}: {e}", key.filename());
                continue;
            }
            if let Err(e) = self.link_probe_into_namespace(mapping_dir, &key) {
                log::warn!("failed to publish probe {}: {e}", key.filename());
            }
        }
        Ok(())
    }
}

fn process_is_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

fn group_probes(records: &[ParsedRecord], module: &str) -> Vec<(ProbeKey, Vec<ParsedRecord>)> {
    let mut out = Vec::new();
    let mut provider_name = String::new();
    let mut i = 0;
    while i < records.len() {
        match &records[i] {
            ParsedRecord::Provider { name, .. } => {
                provider_name = name.clone();
                i += 1;
            }
            ParsedRecord::Probe { function, name, ntracepoints, .. } => {
                let count = *ntracepoints as usize;
                let mut group = vec![records[i].clone()];
                group.extend(records[i + 1..i + 1 + count].iter().cloned());
                // Probes with zero tracepoints are silently skipped.
                if count > 0 {
                    out.push((
                        ProbeKey {
                            provider: provider_name.clone(),
                            module: module.to_string(),
                            function: function.clone(),
                            probe: name.clone(),
                        },
                        group,
                    ));
                }
                i += 1 + count;
            }
            _ => i += 1,
        }
    }
    out
}

fn parse_probe_filename(name: &str) -> Option<ProbeKey> {
    let mut parts = name.splitn(4, ':');
    Some(ProbeKey {
        provider: parts.next()?.to_string(),
        module: parts.next()?.to_string(),
        function: parts.next()?.to_string(),
        probe: parts.next()?.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_records() -> Vec<ParsedRecord> {
        vec![
            ParsedRecord::Provider { name: "p".to_string(), nprobes: 1 },
            ParsedRecord::Probe {
                module: "m".to_string(),
                function: "f".to_string(),
                name: "pr".to_string(),
                ntracepoints: 1,
            },
            ParsedRecord::Tracepoint { addr: 0x400100, is_enabled: false },
        ]
    }

    #[test]
    fn register_then_remove_leaves_no_pid_directory_contents() {
        // Given: a fresh stash and one minimal registration.
        let dir = tempdir().unwrap();
        let stash = StashHandle::open(dir.path()).unwrap();
        let mapping = MappingId { dev: 8, ino: 100 };
        let helper = [0u8; 64];

        // When: the DOF is registered and then removed.
        let gen = stash
            .add_registration(1234, mapping, mapping, "m", b"dof-bytes", &helper, &sample_records())
            .unwrap();
        assert_eq!(gen, 0);
        assert!(dir.path().join("probes/1234/p1234/m/f/pr").exists());

        stash.remove_registration(1234, gen).unwrap();

        // Then: the generation symlink and mapping subtree are both gone.
        assert!(!dir.path().join("stash/dof-pid/1234/0").exists());
        assert!(!dir.path().join("stash/dof-pid/1234/8-100").exists());
    }

    #[test]
    fn exec_mapping_change_purges_prior_generations() {
        let dir = tempdir().unwrap();
        let stash = StashHandle::open(dir.path()).unwrap();
        let helper = [0u8; 64];
        let first = MappingId { dev: 8, ino: 1 };
        stash
            .add_registration(77, first, first, "m", b"dof-a", &helper, &sample_records())
            .unwrap();

        let second = MappingId { dev: 8, ino: 2 };
        stash
            .add_registration(77, second, second, "m", b"dof-b", &helper, &sample_records())
            .unwrap();

        assert!(!dir.path().join("stash/dof-pid/77/8-1").exists());
        assert!(dir.path().join("stash/dof-pid/77/8-2").exists());
    }

    #[test]
    fn stale_version_is_rebuilt_via_collect_and_rebuild() {
        let dir = tempdir().unwrap();
        let stash = StashHandle::open(dir.path()).unwrap();
        let mapping = MappingId { dev: 8, ino: 100 };
        let helper = [0u8; 64];
        stash
            .add_registration(55, mapping, mapping, "m", b"dof-bytes", &helper, &sample_records())
            .unwrap();

        let version_path = dir.path().join("stash/dof-pid/55/8-100/parsed/version");
        fs::write(&version_path, (DOF_PARSED_VERSION + 1).to_le_bytes()).unwrap();

        let stale = stash.collect_stale(false);
        assert_eq!(stale.len(), 1);
        assert!(!version_path.exists(), "stale parsed dir should be removed by collect_stale");

        stash.rebuild_parsed(&stale[0].mapping_dir, &stale[0].module, &sample_records()).unwrap();
        assert!(version_path.exists());
        assert_eq!(fs::read(&version_path).unwrap(), DOF_PARSED_VERSION.to_le_bytes());
    }

    #[test]
    fn collect_stale_skips_up_to_date_subtrees() {
        let dir = tempdir().unwrap();
        let stash = StashHandle::open(dir.path()).unwrap();
        let mapping = MappingId { dev: 8, ino: 200 };
        let helper = [0u8; 64];
        stash
            .add_registration(56, mapping, mapping, "m", b"dof-bytes", &helper, &sample_records())
            .unwrap();

        assert!(stash.collect_stale(false).is_empty());
        assert_eq!(stash.collect_stale(true).len(), 1);
    }

    #[test]
    fn zero_tracepoint_probes_are_skipped() {
        let records = vec![
            ParsedRecord::Provider { name: "p".to_string(), nprobes: 1 },
            ParsedRecord::Probe {
                module: "m".to_string(),
                function: "f".to_string(),
                name: "empty".to_string(),
                ntracepoints: 0,
            },
        ];
        let groups = group_probes(&records, "m");
        assert!(groups.is_empty());
    }
}
