//! Per-caller state, keyed by pid in [`super::ProtocolEngine`]'s table.
//!
//! Collapses spec.md §4.A's five-state machine (START/HDR/DOFHDR/DOFCHUNK/
//! DOF) into two: there is no observable difference between "waiting for a
//! helper" and "waiting for a DOF header" once both halves of `Begin` travel
//! together in one frame, so `Idle` covers START/HDR/DOFHDR and `Collecting`
//! covers DOFCHUNK. The DOF state (processing) is not represented — it is
//! the synchronous span of `on_commit`, not a state a caller can observe.

/// A caller with no registration transfer in progress has no entry in the
/// table at all; `Idle` only appears transiently while deciding a request
/// was out of order.
#[derive(Debug)]
pub enum CallerState {
    /// Accumulating DOF bytes announced by a `Begin`, awaiting `Commit`.
    Collecting {
        helper: [u8; 64],
        total_len: u64,
        buf: Vec<u8>,
    },
}
