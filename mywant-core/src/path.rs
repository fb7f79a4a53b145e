//! Per-want ordered input/output channel views (spec.md §3 "Path set",
//! §4.2 "Tie-breaks and ordering").

use serde::{Deserialize, Serialize};

use crate::WantId;

/// Whether a path entry came from a local (`using`) or cross-recipe
/// (`usingGlobal`) selector. Consumers must treat `paths.in` as opaque and
/// not depend on this (spec.md §4.2), but the resolver needs it to order
/// locals before globals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum SourceTag {
    Local,
    Global,
}

/// One edge in a want's path set: which channel, which peer, and whether it
/// arose from a local or global selector.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PathEntry {
    pub channel_name: String,
    pub peer_id: WantId,
    pub source: SourceTag,
}

/// The authoritative ordered `paths.in` / `paths.out` for a want (spec.md
/// §3). Locals precede globals; within each group, original selector order
/// is preserved, and for multi-match selectors, producer registry order is
/// preserved (spec.md §4.2).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PathSet {
    entries: Vec<PathEntry>,
}

impl PathSet {
    pub fn from_entries(entries: Vec<PathEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[PathEntry] {
        &self.entries
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.channel_name.as_str())
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.peer_id.as_str())
    }
}

/// Channel name for a local connection: `"{producer_id}_to_{consumer_id}"`
/// (spec.md §3 "Channel").
pub fn local_channel_name(producer_id: &str, consumer_id: &str) -> String {
    format!("{producer_id}_to_{consumer_id}")
}

/// Channel name for a cross-recipe connection:
/// `"{producer_id}_global_to_{consumer_id}"` (spec.md §3 "Channel").
pub fn global_channel_name(producer_id: &str, consumer_id: &str) -> String {
    format!("{producer_id}_global_to_{consumer_id}")
}

pub fn channel_name(producer_id: &str, consumer_id: &str, source: SourceTag) -> String {
    match source {
        SourceTag::Local => local_channel_name(producer_id, consumer_id),
        SourceTag::Global => global_channel_name(producer_id, consumer_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_differ_by_scope() {
        assert_eq!(local_channel_name("a", "b"), "a_to_b");
        assert_eq!(global_channel_name("a", "b"), "a_global_to_b");
    }
}
