//! Bounded, append-only per-cycle state differential log (spec.md §3, §4.4,
//! §8.3, §8.10).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::params::ParamValue;

/// Where a history entry's values came from.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum HistorySource {
    Progress,
    Agent(String),
    ParamChange,
}

impl std::fmt::Display for HistorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistorySource::Progress => write!(f, "progress"),
            HistorySource::Agent(name) => write!(f, "agent:{name}"),
            HistorySource::ParamChange => write!(f, "param_change"),
        }
    }
}

/// One differential entry: only the keys whose committed value changed in
/// that cycle (spec.md §8.3, the atomicity invariant).
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct HistoryEntry {
    pub cycle_id: u64,
    pub timestamp_millis: u64,
    pub source: HistorySource,
    pub diff: BTreeMap<String, ParamValue>,
}

/// FIFO-evicting, capped history (spec.md §3: "append-only (bounded: ...
/// e.g. 1000 entries, oldest evicted)", invariant §8.10: `|history| <= cap`
/// at all times).
#[derive(Clone, Debug, Default)]
pub struct StateHistory {
    cap: usize,
    entries: VecDeque<HistoryEntry>,
}

impl StateHistory {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            entries: VecDeque::with_capacity(cap.min(64)),
        }
    }

    /// Appends a new entry, evicting the oldest if at capacity. A no-op diff
    /// (nothing changed) still isn't recorded by callers — only non-empty
    /// diffs reach this method (spec.md §8.3).
    pub fn push(&mut self, entry: HistoryEntry) {
        if self.cap == 0 {
            return;
        }
        if self.entries.len() >= self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    pub fn to_vec(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }
}
