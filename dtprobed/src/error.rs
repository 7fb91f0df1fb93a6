//! Library-level error enums (`thiserror`), one per subsystem, following
//! `examples/other_examples/.../oxidecomputer-usdt/dof/src/lib.rs`'s
//! `DofError` rather than the teacher's ad hoc `String` errors. `anyhow`
//! remains at the daemon's outermost edges (startup, fatal duplicate-daemon
//! detection), matching `cognitod::main`'s use of `anyhow::Context`.

use thiserror::Error;

/// Errors from the control-socket state machine. Per spec.md §7, any of
/// these reset the offending caller's state to `START` and reply with a
/// generic error; the daemon keeps running.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("request received in state {state} but expected one of {expected}")]
    UnexpectedRequest { state: &'static str, expected: &'static str },
    #[error("chunk would exceed the {0}-byte claimed total length")]
    ChunkOverrun(u64),
    #[error("claimed DOF length {claimed} exceeds the {max} maximum")]
    SizeLimit { claimed: u64, max: u64 },
    #[error("i/o error on control socket: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the sandboxed-parser harness.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to spawn parser child: {0}")]
    Spawn(std::io::Error),
    #[error("parser child exited without a reply")]
    ChildDied,
    #[error("timed out waiting {0}s for a parser reply")]
    Timeout(u64),
    #[error("i/o error talking to parser child: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed record from parser: {0}")]
    Malformed(String),
}
