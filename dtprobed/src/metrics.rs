//! All-atomics counters, updated from the hot path and rolled up via
//! periodic `log::info!` (no HTTP surface; see DESIGN.md for why the
//! teacher's `axum` dependency was dropped).

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    registrations_accepted: AtomicU64,
    registrations_rejected: AtomicU64,
    parser_restarts: AtomicU64,
    reparse_count: AtomicU64,
    pruned_pids: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_registration_accepted(&self) {
        self.registrations_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_registration_rejected(&self) {
        self.registrations_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parser_restart(&self) {
        self.parser_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reparse(&self) {
        self.reparse_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pruned_pid(&self) {
        self.pruned_pids.fetch_add(1, Ordering::Relaxed);
    }

    pub fn log_rollup(&self) {
        log::info!(
            "metrics: accepted={} rejected={} parser_restarts={} reparses={} pruned_pids={}",
            self.registrations_accepted.load(Ordering::Relaxed),
            self.registrations_rejected.load(Ordering::Relaxed),
            self.parser_restarts.load(Ordering::Relaxed),
            self.reparse_count.load(Ordering::Relaxed),
            self.pruned_pids.load(Ordering::Relaxed),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let m = Metrics::new();
        m.record_registration_accepted();
        m.record_registration_accepted();
        m.record_registration_rejected();
        assert_eq!(m.registrations_accepted.load(Ordering::Relaxed), 2);
        assert_eq!(m.registrations_rejected.load(Ordering::Relaxed), 1);
    }
}
