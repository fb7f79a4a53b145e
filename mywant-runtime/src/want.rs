//! The in-memory want object: spec, status, committed state, pending
//! (in-cycle) state, history and the current path set.
//!
//! Each want owns its own lock (spec.md §5 "Shared resources and locks":
//! "Each want has its own state lock guarding `state`, `pendingStateChanges`,
//! `inProgressCycle`, `stateHistory`..."). `mywant-runtime` follows the
//! teacher's habit (`metrics.rs`, `cache/mod.rs`) of using `parking_lot` for
//! this rather than `std::sync`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::Notify;

use mywant_core::{
    AgentExecution, AgentExecutionStatus, HistoryEntry, HistorySource, ParamValue, PathSet, StateHistory, WantId, WantMeta,
    WantSpec, WantStatus,
};

/// A single want's runtime object. Cheap to clone via `Arc` (the registry
/// stores `Arc<Want>`); all interior state is behind locks so concurrent
/// readers (resolver, management API) never block the owning executor task
/// for longer than a lock acquisition.
pub struct Want {
    pub id: WantId,
    pub type_name: String,
    spec: RwLock<WantSpec>,
    status: RwLock<WantStatus>,
    /// Status held before the most recent `Suspended` transition, restored on
    /// resume (spec.md §4.4 "suspended is a shadow state... returns to the
    /// prior state on resume").
    pre_suspend_status: RwLock<Option<WantStatus>>,
    state: RwLock<BTreeMap<String, ParamValue>>,
    pending: RwLock<BTreeMap<String, ParamValue>>,
    in_progress_cycle: AtomicBool,
    history: RwLock<StateHistory>,
    paths_in: RwLock<PathSet>,
    paths_out: RwLock<PathSet>,
    cycle_counter: AtomicU64,
    stop_requested: AtomicBool,
    error: RwLock<Option<String>>,
    agent_executions: RwLock<VecDeque<AgentExecution>>,
    agent_execution_counter: AtomicU64,
    agent_execution_cap: usize,
    /// Wakes the executor's scheduling loop when a paused want is resumed
    /// (spec.md §5 "Suspension points... between cycles: waiting for the
    /// reconciler to signal"). Separate from `stop_signal` so resume and
    /// stop can be awaited together without one masking the other.
    resume_signal: Notify,
    stop_signal: Notify,
}

impl Want {
    pub fn new(meta: WantMeta, spec: WantSpec, type_name: impl Into<String>) -> Self {
        let history = StateHistory::new(spec.options.history_max_entries);
        let agent_execution_cap = spec.options.history_max_entries;
        Self {
            id: meta.id,
            type_name: type_name.into(),
            spec: RwLock::new(spec),
            status: RwLock::new(WantStatus::Idle),
            pre_suspend_status: RwLock::new(None),
            state: RwLock::new(BTreeMap::new()),
            pending: RwLock::new(BTreeMap::new()),
            in_progress_cycle: AtomicBool::new(false),
            history: RwLock::new(history),
            paths_in: RwLock::new(PathSet::default()),
            paths_out: RwLock::new(PathSet::default()),
            cycle_counter: AtomicU64::new(0),
            stop_requested: AtomicBool::new(false),
            error: RwLock::new(None),
            agent_executions: RwLock::new(VecDeque::new()),
            agent_execution_counter: AtomicU64::new(0),
            agent_execution_cap,
            resume_signal: Notify::new(),
            stop_signal: Notify::new(),
        }
    }

    /// Reconstructs a want from a cold-start snapshot (spec.md §6, SPEC_FULL
    /// §12 "Cold-start snapshot re-ingestion"): installs committed state,
    /// status and history directly rather than replaying `store_state`/
    /// `end_progress_cycle` calls, since a snapshot is already the end state
    /// of whatever cycles produced it.
    pub fn restore(
        meta: WantMeta,
        spec: WantSpec,
        type_name: impl Into<String>,
        status: WantStatus,
        state: BTreeMap<String, ParamValue>,
        history: Vec<HistoryEntry>,
        error: Option<String>,
    ) -> Self {
        let want = Self::new(meta, spec, type_name);
        *want.status.write() = status;
        *want.state.write() = state;
        *want.error.write() = error;
        let mut log = want.history.write();
        for entry in history {
            log.push(entry);
        }
        drop(log);
        want
    }

    pub fn status(&self) -> WantStatus {
        *self.status.read()
    }

    /// Applies a status transition if legal (spec.md §4.4 state machine);
    /// returns `false` (no-op) for an illegal transition rather than
    /// panicking, since callers are expected to check first where it matters.
    pub fn transition_status(&self, next: WantStatus) -> bool {
        let mut status = self.status.write();
        if !status.can_transition_to(next) {
            return false;
        }
        *status = next;
        true
    }

    /// Explicit pause: snapshots the current status and moves to `Suspended`
    /// from any non-terminal state (spec.md §4.4).
    pub fn suspend(&self) -> bool {
        let mut status = self.status.write();
        if status.is_terminal() || *status == WantStatus::Suspended {
            return false;
        }
        *self.pre_suspend_status.write() = Some(*status);
        *status = WantStatus::Suspended;
        true
    }

    /// Resume: restores the status captured at suspend time.
    pub fn resume(&self) -> bool {
        let mut status = self.status.write();
        if *status != WantStatus::Suspended {
            return false;
        }
        let resumed = if let Some(prior) = self.pre_suspend_status.write().take() {
            *status = prior;
            true
        } else {
            *status = WantStatus::Idle;
            true
        };
        drop(status);
        self.resume_signal.notify_waiters();
        resumed
    }

    pub fn is_suspended(&self) -> bool {
        self.status() == WantStatus::Suspended
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.stop_signal.notify_waiters();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub async fn wait_resume(&self) {
        self.resume_signal.notified().await;
    }

    pub async fn wait_stop(&self) {
        self.stop_signal.notified().await;
    }

    pub fn spec(&self) -> WantSpec {
        self.spec.read().clone()
    }

    pub fn replace_spec(&self, spec: WantSpec) {
        *self.spec.write() = spec;
    }

    pub fn set_param(&self, key: String, value: ParamValue) {
        self.spec.write().params.insert(key, value);
    }

    pub fn paths_in(&self) -> PathSet {
        self.paths_in.read().clone()
    }

    pub fn paths_out(&self) -> PathSet {
        self.paths_out.read().clone()
    }

    pub fn set_paths(&self, paths_in: PathSet, paths_out: PathSet) {
        *self.paths_in.write() = paths_in;
        *self.paths_out.write() = paths_out;
    }

    pub fn history_snapshot(&self) -> Vec<HistoryEntry> {
        self.history.read().to_vec()
    }

    pub fn error(&self) -> Option<String> {
        self.error.read().clone()
    }

    pub fn fail(&self, reason: impl Into<String>) {
        *self.error.write() = Some(reason.into());
        self.transition_status(WantStatus::Failed);
    }

    // --- Agent execution log (spec.md §3 "AgentExecution record") ---

    /// Appends a `Running` entry and returns its id, so the caller can close
    /// it out later via [`Want::agent_execution_end`] even if the log has
    /// since rotated past it.
    pub fn agent_execution_start(&self, agent_name: impl Into<String>, mode: impl Into<String>, start_time_millis: u64, activity: impl Into<String>) -> u64 {
        let id = self.agent_execution_counter.fetch_add(1, Ordering::SeqCst);
        let entry = AgentExecution {
            id,
            agent_name: agent_name.into(),
            mode: mode.into(),
            start_time_millis,
            end_time_millis: None,
            status: AgentExecutionStatus::Running,
            activity: activity.into(),
            error: None,
        };
        let mut executions = self.agent_executions.write();
        if self.agent_execution_cap > 0 && executions.len() >= self.agent_execution_cap {
            executions.pop_front();
        }
        executions.push_back(entry);
        id
    }

    pub fn agent_execution_end(&self, id: u64, end_time_millis: u64, status: AgentExecutionStatus, error: Option<String>) {
        let mut executions = self.agent_executions.write();
        if let Some(entry) = executions.iter_mut().find(|e| e.id == id) {
            entry.end_time_millis = Some(end_time_millis);
            entry.status = status;
            entry.error = error;
        }
    }

    pub fn agent_executions_snapshot(&self) -> Vec<AgentExecution> {
        self.agent_executions.read().iter().cloned().collect()
    }

    // --- Progress-cycle state batching (spec.md §4.4) ---

    /// `BeginProgressCycle()`: clears `pendingStateChanges`, marks
    /// `inProgressCycle=true`.
    pub fn begin_progress_cycle(&self) -> u64 {
        self.pending.write().clear();
        self.in_progress_cycle.store(true, Ordering::SeqCst);
        self.cycle_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// `GetState(key)`: reads pending first, falling back to committed.
    pub fn get_state(&self, key: &str) -> Option<ParamValue> {
        if let Some(v) = self.pending.read().get(key) {
            return Some(v.clone());
        }
        self.state.read().get(key).cloned()
    }

    pub fn state_snapshot(&self) -> BTreeMap<String, ParamValue> {
        let committed = self.state.read().clone();
        let pending = self.pending.read().clone();
        let mut merged = committed;
        merged.extend(pending);
        merged
    }

    /// `StoreState(key, value)`: a confirmed write, immediately visible
    /// through `GetState`.
    pub fn store_state(&self, key: impl Into<String>, value: impl Into<ParamValue>) {
        let key = key.into();
        let value = value.into();
        self.state.write().insert(key.clone(), value.clone());
        self.pending.write().insert(key, value);
    }

    /// `MergeState(partial)`: tentative writes, not reflected in committed
    /// state until `EndProgressCycle`. A later `StoreState` in the same cycle
    /// overwrites a prior `MergeState` value (both just land in `pending`;
    /// `StoreState` additionally commits immediately).
    pub fn merge_state(&self, partial: BTreeMap<String, ParamValue>) {
        self.pending.write().extend(partial);
    }

    /// Commits a state delta directly onto `state` and appends its own
    /// history entry, bypassing `pending` entirely. Background agents
    /// (Monitor/Poll/Think, spec.md §4.6) run concurrently with the owning
    /// want's progress cycle rather than inside it, so routing their writes
    /// through the cycle-scoped `pending` buffer would race with
    /// `BeginProgressCycle`'s clear; this gives them their own atomic commit
    /// path with the same differential-history shape `EndProgressCycle`
    /// produces. Do-agent deltas, by contrast, run synchronously inside the
    /// owning cycle and use `merge_state` so they land in that cycle's own
    /// entry (spec.md §4.6: "Single batch applied before the cycle ends").
    pub fn commit_agent_delta(&self, delta: BTreeMap<String, ParamValue>, timestamp_millis: u64, source: HistorySource) -> Option<HistoryEntry> {
        if delta.is_empty() {
            return None;
        }
        let mut diff = BTreeMap::new();
        {
            let mut state = self.state.write();
            for (k, v) in delta {
                if state.get(&k) != Some(&v) {
                    diff.insert(k.clone(), v.clone());
                }
                state.insert(k, v);
            }
        }
        if diff.is_empty() {
            return None;
        }
        let entry = HistoryEntry {
            cycle_id: self.cycle_counter.fetch_add(1, Ordering::SeqCst),
            timestamp_millis,
            source,
            diff,
        };
        self.history.write().push(entry.clone());
        Some(entry)
    }

    /// `EndProgressCycle()`: if `achieved`, forces `achievingPercentage=100`
    /// into `pendingStateChanges`; atomically applies pending onto committed
    /// state, appending a single differential history entry (only keys whose
    /// committed value changed) tagged with cycle id/timestamp/source; clears
    /// pending. Returns the history entry if anything changed.
    pub fn end_progress_cycle(
        &self,
        cycle_id: u64,
        timestamp_millis: u64,
        source: HistorySource,
    ) -> Option<HistoryEntry> {
        if self.status() == WantStatus::Achieved {
            self.pending
                .write()
                .insert("achievingPercentage".to_string(), ParamValue::Num(100.0));
        }

        let pending = std::mem::take(&mut *self.pending.write());
        self.in_progress_cycle.store(false, Ordering::SeqCst);

        if pending.is_empty() {
            return None;
        }

        let mut diff = BTreeMap::new();
        {
            let mut state = self.state.write();
            for (k, v) in pending {
                if state.get(&k) != Some(&v) {
                    diff.insert(k.clone(), v.clone());
                }
                state.insert(k, v);
            }
        }
        if diff.is_empty() {
            return None;
        }

        let entry = HistoryEntry {
            cycle_id,
            timestamp_millis,
            source,
            diff,
        };
        self.history.write().push(entry.clone());
        Some(entry)
    }

    pub fn in_progress_cycle(&self) -> bool {
        self.in_progress_cycle.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mywant_core::WantMeta;

    fn want() -> Want {
        Want::new(WantMeta::new("w1"), WantSpec::default(), "test")
    }

    #[test]
    fn store_state_is_immediately_visible() {
        let w = want();
        w.begin_progress_cycle();
        w.store_state("k", "v");
        assert_eq!(w.get_state("k"), Some(ParamValue::Str("v".to_string())));
    }

    #[test]
    fn merge_state_visible_via_get_state_before_commit() {
        let w = want();
        w.begin_progress_cycle();
        let mut partial = BTreeMap::new();
        partial.insert("k".to_string(), ParamValue::from("v"));
        w.merge_state(partial);
        // GetState reads pending first, so the tentative write is visible...
        assert_eq!(w.get_state("k"), Some(ParamValue::Str("v".to_string())));
        w.end_progress_cycle(1, 0, HistorySource::Progress);
        // ...and is coalesced into committed state at cycle end.
        assert_eq!(w.state_snapshot().get("k"), Some(&ParamValue::Str("v".to_string())));
    }

    #[test]
    fn store_state_overwrites_prior_merge_in_same_cycle() {
        let w = want();
        w.begin_progress_cycle();
        let mut partial = BTreeMap::new();
        partial.insert("k".to_string(), ParamValue::from("old"));
        w.merge_state(partial);
        w.store_state("k", "new");
        assert_eq!(w.get_state("k"), Some(ParamValue::Str("new".to_string())));
    }

    #[test]
    fn end_progress_cycle_emits_one_entry_with_only_changed_keys() {
        let w = want();
        w.begin_progress_cycle();
        w.store_state("a", "1");
        let entry = w.end_progress_cycle(1, 1000, HistorySource::Progress).unwrap();
        assert_eq!(entry.diff.len(), 1);
        assert!(entry.diff.contains_key("a"));

        w.begin_progress_cycle();
        w.store_state("a", "1"); // unchanged value
        let entry = w.end_progress_cycle(2, 2000, HistorySource::Progress);
        assert!(entry.is_none());
    }

    #[test]
    fn achieve_forces_achieving_percentage_100() {
        let w = want();
        w.transition_status(WantStatus::Reaching);
        w.transition_status(WantStatus::Achieved);
        w.begin_progress_cycle();
        let entry = w.end_progress_cycle(1, 0, HistorySource::Progress).unwrap();
        assert_eq!(entry.diff.get("achievingPercentage"), Some(&ParamValue::Num(100.0)));
    }

    #[test]
    fn suspend_then_resume_restores_prior_status() {
        let w = want();
        w.transition_status(WantStatus::Reaching);
        assert!(w.suspend());
        assert_eq!(w.status(), WantStatus::Suspended);
        assert!(w.resume());
        assert_eq!(w.status(), WantStatus::Reaching);
    }

    #[test]
    fn agent_execution_closes_out_by_id() {
        let w = want();
        let id = w.agent_execution_start("booker", "local", 100, "stage_state_change");
        w.agent_execution_end(id, 150, mywant_core::AgentExecutionStatus::Succeeded, None);
        let snap = w.agent_executions_snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].status, mywant_core::AgentExecutionStatus::Succeeded);
        assert_eq!(snap[0].end_time_millis, Some(150));
    }

    #[test]
    fn history_is_capped() {
        let w = Want::new(
            WantMeta::new("w1"),
            WantSpec {
                options: mywant_core::params::WantOptions {
                    history_max_entries: 2,
                    ..Default::default()
                },
                ..Default::default()
            },
            "test",
        );
        for i in 0..5 {
            w.begin_progress_cycle();
            w.store_state("k", i as f64);
            w.end_progress_cycle(i, i, HistorySource::Progress);
        }
        assert_eq!(w.history_snapshot().len(), 2);
    }
}
