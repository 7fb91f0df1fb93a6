//! Scope-guard rollback for multi-step filesystem mutations.
//!
//! Translates the original's "ladder of goto-style unwinds"
//! (`original_source/dtprobed/dof_stash.c`) into a guard that records each
//! mutation as it succeeds and, unless explicitly disarmed, undoes them in
//! reverse (LIFO) order on drop. Directory removal and file/link removal
//! are distinct actions because a directory must be believed-empty before
//! `unlinkat(..., AT_REMOVEDIR)` is attempted — conflating the two risks
//! trying to rmdir a non-empty directory during unwind.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub enum RollbackAction {
    /// Undo via `unlinkat` without `AT_REMOVEDIR`: a plain file, symlink, or
    /// hard link created during this registration attempt.
    RemoveFile(PathBuf),
    /// Undo via `unlinkat(..., AT_REMOVEDIR)`: a directory created during
    /// this attempt, assumed empty (its contents were themselves registered
    /// as their own rollback actions, earlier in the ladder).
    RemoveDir(PathBuf),
}

impl RollbackAction {
    fn apply(&self) {
        match self {
            RollbackAction::RemoveFile(path) => {
                if let Err(e) = std::fs::remove_file(path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        log::warn!("rollback: failed to remove file {}: {e}", path.display());
                    }
                }
            }
            RollbackAction::RemoveDir(path) => {
                if let Err(e) = std::fs::remove_dir(path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        log::warn!("rollback: failed to remove dir {}: {e}", path.display());
                    }
                }
            }
        }
    }
}

/// Accumulates [`RollbackAction`]s as a multi-step mutation proceeds. Call
/// [`ScopeGuard::push`] after each step that succeeds; call
/// [`ScopeGuard::commit`] once the whole mutation has succeeded. If the
/// guard is dropped without being committed, every recorded action runs in
/// reverse order.
#[derive(Default)]
pub struct ScopeGuard {
    actions: Vec<RollbackAction>,
    committed: bool,
}

impl ScopeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: RollbackAction) {
        self.actions.push(action);
    }

    pub fn push_file(&mut self, path: impl Into<PathBuf>) {
        self.push(RollbackAction::RemoveFile(path.into()));
    }

    pub fn push_dir(&mut self, path: impl Into<PathBuf>) {
        self.push(RollbackAction::RemoveDir(path.into()));
    }

    /// Disarms the guard: the mutation succeeded and none of the recorded
    /// actions should run.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for action in self.actions.iter().rev() {
            action.apply();
        }
    }
}

/// Path components equal to `.` or `..` are rejected during probespec
/// construction (spec.md §4.D "Reserved names").
pub fn reject_reserved_component(component: &str) -> Result<(), super::StashError> {
    if component == "." || component == ".." || component.is_empty() {
        return Err(super::StashError::ReservedName(component.to_string()));
    }
    Ok(())
}
