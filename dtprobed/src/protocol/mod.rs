//! Device protocol engine — spec.md §4.A's per-caller state machine
//! (START → HDR → DOFHDR → {DOF|DOFCHUNK} → DOF → START), carried over a
//! Unix domain socket instead of CUSE ioctls (see SPEC_FULL.md MODULE A for
//! the substitution rationale).
//!
//! Runs on a **current-thread** Tokio runtime: connections are driven with
//! `tokio::task::spawn_local` and shared state is `Rc`/`RefCell`, not
//! `Arc`/`Mutex`, enforcing the single-thread invariant of spec.md §5 at the
//! type level rather than by convention.

mod state;

pub use state::CallerState;

use crate::config::Config;
use crate::error::ProtocolError;
use crate::metrics::Metrics;
use crate::procmap::ProcMapOracle;
use crate::sandbox::ParserSandbox;
use crate::stash::StashHandle;
use dof_wire::protocol::{Request, Response};
use dof_wire::record::ParsedRecord;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::io;
use std::rc::Rc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

/// Everything a connection handler needs, shared (not `Send`) across the
/// current-thread runtime's tasks.
pub struct ProtocolEngine {
    stash: StashHandle,
    sandbox: RefCell<ParserSandbox>,
    metrics: Rc<Metrics>,
    caller_states: RefCell<BTreeMap<i32, CallerState>>,
    dof_maxsz: u64,
    sweep_interval: u64,
    connections_since_sweep: Cell<u64>,
}

impl ProtocolEngine {
    pub fn new(config: &Config, stash: StashHandle, sandbox: ParserSandbox, metrics: Rc<Metrics>) -> Rc<Self> {
        Rc::new(Self {
            stash,
            sandbox: RefCell::new(sandbox),
            metrics,
            caller_states: RefCell::new(BTreeMap::new()),
            dof_maxsz: config.dof_maxsz,
            sweep_interval: config.effective_sweep_interval(),
            connections_since_sweep: Cell::new(0),
        })
    }

    /// Binds `socket_path` (removing a stale socket left by a prior unclean
    /// shutdown) and serves connections until `shutdown` resolves.
    pub async fn serve(self: Rc<Self>, socket_path: &std::path::Path, shutdown: impl std::future::Future<Output = ()>) -> anyhow::Result<()> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(socket_path)?;
        log::info!("listening on {}", socket_path.display());

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async move {
                tokio::select! {
                    _ = self.accept_loop(listener) => {},
                    _ = shutdown => { log::info!("shutdown requested"); },
                }
            })
            .await;
        Ok(())
    }

    async fn accept_loop(self: Rc<Self>, listener: UnixListener) {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    continue;
                }
            };
            self.note_connection_and_maybe_sweep();
            let engine = Rc::clone(&self);
            tokio::task::spawn_local(async move {
                if let Err(e) = engine.handle_connection(stream).await {
                    log::debug!("connection ended: {e}");
                }
            });
        }
    }

    fn note_connection_and_maybe_sweep(&self) {
        let n = self.connections_since_sweep.get() + 1;
        if n >= self.sweep_interval {
            self.connections_since_sweep.set(0);
            let pruned = self.stash.prune_dead_pids();
            for _ in 0..pruned {
                self.metrics.record_pruned_pid();
            }
            self.caller_states.borrow_mut().retain(|pid, _| process_alive(*pid));
        } else {
            self.connections_since_sweep.set(n);
        }
    }

    async fn handle_connection(self: Rc<Self>, mut stream: UnixStream) -> io::Result<()> {
        let pid = stream
            .peer_cred()
            .ok()
            .and_then(|c| c.pid())
            .unwrap_or(0);

        loop {
            let body = match read_frame(&mut stream).await? {
                Some(body) => body,
                None => break,
            };
            let request = match Request::decode(&body) {
                Ok(r) => r,
                Err(_) => {
                    self.caller_states.borrow_mut().remove(&pid);
                    write_response(&mut stream, &Response::Nack { errno: libc::EINVAL, message: "malformed request".into() }).await?;
                    continue;
                }
            };
            let response = self.dispatch(pid, request).await;
            write_response(&mut stream, &response).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, pid: i32, request: Request) -> Response {
        match request {
            Request::Begin { helper, total_len } => self.on_begin(pid, helper, total_len),
            Request::Chunk { data } => self.on_chunk(pid, data),
            Request::Commit => self.on_commit(pid).await,
            Request::Remove { generation } => self.on_remove(pid, generation),
        }
    }

    fn on_begin(&self, pid: i32, helper: [u8; 64], total_len: u64) -> Response {
        if total_len > self.dof_maxsz {
            self.metrics.record_registration_rejected();
            return nack(ProtocolError::SizeLimit { claimed: total_len, max: self.dof_maxsz });
        }
        let buf = Vec::with_capacity(total_len.min(self.dof_maxsz) as usize);
        self.caller_states
            .borrow_mut()
            .insert(pid, CallerState::Collecting { helper, total_len, buf });
        Response::Ack
    }

    fn on_chunk(&self, pid: i32, data: Vec<u8>) -> Response {
        let mut states = self.caller_states.borrow_mut();
        let Some(CallerState::Collecting { total_len, buf, .. }) = states.get_mut(&pid) else {
            states.remove(&pid);
            return nack(ProtocolError::UnexpectedRequest { state: "Idle", expected: "Collecting" });
        };
        if data.len() as u64 > self.dof_maxsz {
            let claimed = data.len() as u64;
            states.remove(&pid);
            return nack(ProtocolError::SizeLimit { claimed, max: self.dof_maxsz });
        }
        if buf.len() as u64 + data.len() as u64 > *total_len {
            let overrun = *total_len;
            states.remove(&pid);
            return nack(ProtocolError::ChunkOverrun(overrun));
        }
        buf.extend_from_slice(&data);
        Response::Ack
    }

    async fn on_commit(&self, pid: i32) -> Response {
        let Some(CallerState::Collecting { helper, total_len, buf }) = self.caller_states.borrow_mut().remove(&pid) else {
            return nack(ProtocolError::UnexpectedRequest { state: "Idle", expected: "Collecting" });
        };
        if buf.len() as u64 != total_len {
            self.metrics.record_registration_rejected();
            return nack(ProtocolError::ChunkOverrun(total_len));
        }

        match self.commit_registration(pid, helper, buf).await {
            Ok(generation) => {
                self.metrics.record_registration_accepted();
                Response::Registered { generation }
            }
            Err((errno, message)) => {
                self.metrics.record_registration_rejected();
                Response::Nack { errno, message }
            }
        }
    }

    async fn commit_registration(&self, pid: i32, helper: [u8; 64], buf: Vec<u8>) -> Result<u64, (i32, String)> {
        let helper_struct = dof_wire::layout::parse_helper(&helper);
        let load_addr = helper_struct.load_addr.get();
        let module = helper_struct
            .module_str()
            .map_err(|e| (libc::EINVAL, e.to_string()))?
            .to_string();

        let oracle = ProcMapOracle::open(pid).map_err(|e| (libc::ESRCH, e.to_string()))?;
        let mapping = oracle.resolve_address(load_addr).map_err(|e| (libc::EFAULT, e.to_string()))?;
        let exec_mapping = oracle.resolve_exec_mapping().map_err(|e| (libc::EFAULT, e.to_string()))?;

        let records = self
            .sandbox
            .borrow_mut()
            .parse(&helper, &buf)
            .await
            .map_err(|e| (libc::EIO, e.to_string()))?;

        if let [ParsedRecord::Err { errno, message }] = records.as_slice() {
            return Err((*errno, message.clone()));
        }

        self.stash
            .add_registration(pid, mapping, exec_mapping, &module, &buf, &helper, &records)
            .map_err(|e| (libc::EIO, e.to_string()))
    }

    fn on_remove(&self, pid: i32, generation: u64) -> Response {
        match self.stash.remove_registration(pid, generation) {
            Ok(()) => Response::Removed,
            Err(e) => Response::Nack { errno: libc::ENOENT, message: e.to_string() },
        }
    }

    /// Rebuilds every parsed subtree whose on-disk version is stale (or,
    /// with `force`, every subtree), via the sandboxed parser — never a
    /// direct in-process call, since the stashed raw DOF is exactly as
    /// adversary-controlled on reparse as it was on first registration.
    /// Returns the number of subtrees successfully rebuilt. Called once,
    /// unconditionally, at startup (`force: false`) and, under
    /// `_DTRACE_TESTING`, again on every `SIGUSR2` (`force: true`).
    pub async fn reparse(&self, force: bool) -> usize {
        let stale = self.stash.collect_stale(force);
        let mut rebuilt = 0;
        for entry in stale {
            let records = match self.sandbox.borrow_mut().parse(&entry.helper, &entry.raw).await {
                Ok(records) => records,
                Err(e) => {
                    log::warn!("reparse of {} failed: {e}", entry.mapping_dir.display());
                    continue;
                }
            };
            if let [ParsedRecord::Err { message, .. }] = records.as_slice() {
                log::warn!("reparse of {} rejected by parser: {message}", entry.mapping_dir.display());
                continue;
            }
            if let Err(e) = self.stash.rebuild_parsed(&entry.mapping_dir, &entry.module, &records) {
                log::warn!("failed to rebuild parsed data for {}: {e}", entry.mapping_dir.display());
                continue;
            }
            self.metrics.record_reparse();
            rebuilt += 1;
        }
        rebuilt
    }
}

fn nack(e: ProtocolError) -> Response {
    let errno = match &e {
        ProtocolError::UnexpectedRequest { .. } => libc::EINVAL,
        ProtocolError::ChunkOverrun(_) => libc::EINVAL,
        ProtocolError::SizeLimit { .. } => libc::E2BIG,
        ProtocolError::Io(_) => libc::EIO,
    };
    Response::Nack { errno, message: e.to_string() }
}

fn process_alive(pid: i32) -> bool {
    pid != 0 && nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

async fn read_frame(stream: &mut UnixStream) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > dof_wire::record::MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame exceeds maximum length"));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

async fn write_response(stream: &mut UnixStream, response: &Response) -> io::Result<()> {
    let body = response.encode();
    let len = body.len() as u32;
    stream.write_all(&len.to_le_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await
}
