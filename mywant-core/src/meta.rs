//! Want identity and ownership metadata (spec.md §3 "Want", "Owner reference").

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::WantId;

/// Declares that one want controls another's lifecycle (spec.md §3).
///
/// A target want's `CreateChildren()` attaches exactly one controller owner
/// reference (`controller = true`) on each materialised child; cascade
/// deletion (spec.md §4.5, §8.7) walks `blockOwnerDeletion` references.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub id: WantId,
    pub controller: bool,
    pub block_owner_deletion: bool,
}

impl OwnerReference {
    pub fn controller_of(kind: impl Into<String>, name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            id: id.into(),
            controller: true,
            block_owner_deletion: true,
        }
    }
}

/// Metadata common to every want: identity, labels, and owner references.
///
/// Invariant (spec.md §3): at most one owner reference may have
/// `controller = true`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct WantMeta {
    pub id: WantId,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
}

impl WantMeta {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            labels: BTreeMap::new(),
            owner_references: Vec::new(),
        }
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Returns the controller owner, if any. Callers rely on the at-most-one
    /// invariant enforced at construction time (`set_owner_references`).
    pub fn controller_owner(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|o| o.controller)
    }

    /// Validates and installs owner references, rejecting more than one
    /// controller (spec.md §3 invariant).
    pub fn set_owner_references(&mut self, refs: Vec<OwnerReference>) -> Result<(), String> {
        let controllers = refs.iter().filter(|o| o.controller).count();
        if controllers > 1 {
            return Err(format!(
                "want {} would have {} controller owner references, at most 1 allowed",
                self.id, controllers
            ));
        }
        self.owner_references = refs;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_multiple_controllers() {
        let mut meta = WantMeta::new("child-1");
        let result = meta.set_owner_references(vec![
            OwnerReference::controller_of("Target", "t1", "parent-1"),
            OwnerReference::controller_of("Target", "t2", "parent-2"),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn accepts_single_controller() {
        let mut meta = WantMeta::new("child-1");
        meta.set_owner_references(vec![OwnerReference::controller_of("Target", "t1", "parent-1")])
            .unwrap();
        assert_eq!(meta.controller_owner().unwrap().id, "parent-1");
    }
}
