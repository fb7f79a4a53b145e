//! Ambient engine metrics, exposed as lightweight atomics rather than a
//! dependency on an external metrics crate.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Active want count broken down by status, channels currently open, agent
/// executions in flight by kind, and the owner coordinator's pending-children
/// count. Cloning an [`Engine`](crate::engine::Engine) shares one `Metrics`.
#[derive(Default, Debug)]
pub struct Metrics {
    pub wants_idle: AtomicI64,
    pub wants_reaching: AtomicI64,
    pub wants_prepare_agent: AtomicI64,
    pub wants_executing: AtomicI64,
    pub wants_suspended: AtomicI64,
    pub wants_achieved: AtomicI64,
    pub wants_failed: AtomicI64,
    pub channels_open: AtomicI64,
    pub agent_executions_do: AtomicI64,
    pub agent_executions_monitor: AtomicI64,
    pub agent_executions_poll: AtomicI64,
    pub agent_executions_think: AtomicI64,
    pub owner_pending_children: AtomicI64,
    pub progress_cycles_total: AtomicU64,
    pub history_entries_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel_opened(&self) {
        self.channels_open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn channel_closed(&self) {
        self.channels_open.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn progress_cycle_completed(&self) {
        self.progress_cycles_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn history_entry_recorded(&self) {
        self.history_entries_total.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn channel_counter_tracks_open_close() {
        let m = Metrics::new();
        m.channel_opened();
        m.channel_opened();
        m.channel_closed();
        assert_eq!(m.channels_open.load(Ordering::Relaxed), 1);
    }
}
