//! Shared types for the DOF registration subsystem: on-wire binary layout,
//! the parser's output record stream, and the control-socket protocol.
//!
//! This crate has no async runtime dependency and no I/O of its own beyond
//! the small synchronous framing helpers in [`record`] — both `dtprobed`
//! (tokio, async) and `dof-parser`'s sandboxed child binary (synchronous)
//! link it.

pub mod consts;
pub mod layout;
pub mod protocol;
pub mod record;
