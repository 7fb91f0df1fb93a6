//! Harness around the sandboxed `dof-parser-child` process.
//!
//! The original ran the parser in-process; spec.md §4.B requires it
//! isolated so a hostile DOF blob can corrupt at most a throwaway child.
//! `std::process::Command::pre_exec` (stabilized sandboxing hook, same shape
//! `cognitod::handler::docker` reaches for with a plain `Command`) launches
//! the child with stdin/stdout replaced by anonymous pipes and every other
//! fd closed; `tokio::process::Command` lets the daemon await it without
//! blocking its single worker thread.

use crate::error::SandboxError;
use dof_wire::record::ParsedRecord;
use std::io::Write as _;
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;

/// Locates the `dof-parser-child` binary alongside the running `dtprobed`
/// executable, matching how a cargo workspace installs sibling binaries.
pub fn default_child_path() -> std::path::PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|dir| dir.join("dof-parser-child")))
        .unwrap_or_else(|| std::path::PathBuf::from("dof-parser-child"))
}

/// One sandboxed parser child, restarted transparently on death.
pub struct ParserSandbox {
    child_path: std::path::PathBuf,
    timeout: Duration,
    child: Option<Child>,
}

impl ParserSandbox {
    pub fn new(child_path: impl Into<std::path::PathBuf>, timeout_secs: u64) -> Self {
        Self {
            child_path: child_path.into(),
            timeout: Duration::from_secs(timeout_secs),
            child: None,
        }
    }

    /// Parses `dof` on behalf of `helper` (the 64-byte wire helper struct),
    /// giving the request up to two attempts total (spec.md §4.B): if the
    /// child has died, crashed mid-request, or timed out, it is respawned
    /// once and the same request retried before giving up.
    pub async fn parse(&mut self, helper: &[u8; 64], dof: &[u8]) -> Result<Vec<ParsedRecord>, SandboxError> {
        match self.try_once(helper, dof).await {
            Ok(records) => Ok(records),
            Err(_) => {
                log::warn!("parser child attempt failed; restarting for one retry");
                self.child = None;
                self.try_once(helper, dof).await
            }
        }
    }

    async fn try_once(&mut self, helper: &[u8; 64], dof: &[u8]) -> Result<Vec<ParsedRecord>, SandboxError> {
        if self.child.is_none() {
            self.child = Some(spawn_child(&self.child_path)?);
        }
        let child = self.child.as_mut().expect("just populated");

        let result = timeout(self.timeout, exchange(child, helper, dof)).await;
        match result {
            Ok(Ok(records)) => Ok(records),
            Ok(Err(e)) => {
                self.reap();
                Err(e)
            }
            Err(_) => {
                self.reap();
                Err(SandboxError::Timeout(self.timeout.as_secs()))
            }
        }
    }

    fn reap(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
    }
}

fn spawn_child(path: &std::path::Path) -> Result<Child, SandboxError> {
    let mut cmd = Command::new(path);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    // The daemon itself ignores SIGPIPE at startup (see `main::ignore_sigpipe`)
    // so a dead child surfaces as a write error on the pipe instead of killing
    // the daemon; restore the default disposition in the child so it still
    // dies normally on its own broken-pipe conditions (e.g. the daemon
    // dropping its end early).
    unsafe {
        cmd.pre_exec(|| {
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);
            Ok(())
        });
    }

    cmd.spawn().map_err(SandboxError::Spawn)
}

async fn exchange(child: &mut Child, helper: &[u8; 64], dof: &[u8]) -> Result<Vec<ParsedRecord>, SandboxError> {
    let stdin = child.stdin.as_mut().ok_or(SandboxError::ChildDied)?;
    let stdout = child.stdout.as_mut().ok_or(SandboxError::ChildDied)?;

    stdin.write_all(helper).await?;
    let mut frame = Vec::new();
    dof_wire::record::write_frame(&mut frame, dof)?;
    stdin.write_all(&frame).await?;
    stdin.flush().await?;

    let mut count_buf = [0u8; 4];
    match stdout.read_exact(&mut count_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(SandboxError::ChildDied),
        Err(e) => return Err(e.into()),
    }
    let count = u32::from_le_bytes(count_buf);

    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut len_buf = [0u8; 4];
        stdout
            .read_exact(&mut len_buf)
            .await
            .map_err(|_| SandboxError::ChildDied)?;
        let len = u32::from_le_bytes(len_buf);
        if len > dof_wire::record::MAX_FRAME_LEN {
            return Err(SandboxError::Malformed("parser reply exceeds maximum frame length".into()));
        }
        let mut body = vec![0u8; len as usize];
        stdout.read_exact(&mut body).await?;
        let record = ParsedRecord::decode(&body).map_err(|e| SandboxError::Malformed(e.to_string()))?;
        records.push(record);
    }
    Ok(records)
}
