//! The live want set and its inverted label index.
//!
//! Mirrors `kube_runtime::reflector::store`'s `Writer`/`Store` split: a single
//! exclusive [`Writer`] handle performs all mutation, while any number of
//! [`Store`] handles may be cloned out for read-only snapshot access. Unlike
//! the teacher, both sides here are backed by the same `Arc<RwLock<..>>` (the
//! registry is in-process, not a watch cache), but the API shape — and the
//! discipline of routing every mutation through one writer — is the same.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;

use mywant_core::{EngineError, WantId, WantMeta};

/// One live want's registry-visible record: metadata, spec, status and state
/// live on [`crate::want::Want`]; the registry only needs id + labels to
/// maintain the index, so it stores the full [`crate::want::Want`] handle
/// behind an `Arc` for cheap snapshot cloning.
#[derive(Clone)]
pub struct RegistryEntry {
    pub meta: WantMeta,
    pub want: Arc<crate::want::Want>,
}

#[derive(Default)]
struct Inner {
    wants: BTreeMap<WantId, RegistryEntry>,
    /// `(label key, label value) -> ids, in insertion order`.
    label_index: BTreeMap<(String, String), Vec<WantId>>,
    insertion_order: Vec<WantId>,
}

impl Inner {
    fn index_labels(&mut self, id: &WantId, labels: &BTreeMap<String, String>) {
        for (k, v) in labels {
            self.label_index
                .entry((k.clone(), v.clone()))
                .or_default()
                .push(id.clone());
        }
    }

    fn deindex_labels(&mut self, id: &WantId, labels: &BTreeMap<String, String>) {
        for (k, v) in labels {
            if let Some(ids) = self.label_index.get_mut(&(k.clone(), v.clone())) {
                ids.retain(|existing| existing != id);
                if ids.is_empty() {
                    self.label_index.remove(&(k.clone(), v.clone()));
                }
            }
        }
    }
}

/// The exclusive mutating handle. Only the reconciler holds one; it is not
/// `Clone` (same reasoning as `kube_runtime::reflector::store::Writer`: two
/// writers racing on the same backing map would corrupt the index).
pub struct Writer {
    inner: Arc<RwLock<Inner>>,
}

impl Writer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    pub fn as_reader(&self) -> Store {
        Store {
            inner: self.inner.clone(),
        }
    }

    /// `Add(want)` (spec.md §4.1): fails if the id is already present.
    pub fn add(&self, meta: WantMeta, want: Arc<crate::want::Want>) -> Result<(), EngineError> {
        let mut inner = self.inner.write();
        if inner.wants.contains_key(&meta.id) {
            return Err(EngineError::DuplicateWant(meta.id));
        }
        inner.index_labels(&meta.id, &meta.labels);
        inner.insertion_order.push(meta.id.clone());
        inner.wants.insert(meta.id.clone(), RegistryEntry { meta, want });
        Ok(())
    }

    /// `Delete(id)` (spec.md §4.1): fails if unknown.
    pub fn delete(&self, id: &str) -> Result<RegistryEntry, EngineError> {
        let mut inner = self.inner.write();
        let entry = inner
            .wants
            .remove(id)
            .ok_or_else(|| EngineError::UnknownWant(id.to_string()))?;
        inner.deindex_labels(&entry.meta.id, &entry.meta.labels);
        inner.insertion_order.retain(|existing| existing != id);
        Ok(entry)
    }

    /// `UpdateLabels(id, newLabels)` (spec.md §4.1): diffs old/new labels,
    /// reindexes atomically, and returns the set of label keys that changed
    /// (key present with a different value, newly added, or removed) so the
    /// resolver can re-evaluate only affected selectors.
    pub fn update_labels(
        &self,
        id: &str,
        new_labels: BTreeMap<String, String>,
    ) -> Result<BTreeSet<String>, EngineError> {
        let mut inner = self.inner.write();
        let entry = inner
            .wants
            .get(id)
            .ok_or_else(|| EngineError::UnknownWant(id.to_string()))?;
        let old_labels = entry.meta.labels.clone();

        let mut changed_keys = BTreeSet::new();
        for (k, v) in &new_labels {
            if old_labels.get(k) != Some(v) {
                changed_keys.insert(k.clone());
            }
        }
        for k in old_labels.keys() {
            if !new_labels.contains_key(k) {
                changed_keys.insert(k.clone());
            }
        }

        inner.deindex_labels(&id.to_string(), &old_labels);
        inner.index_labels(&id.to_string(), &new_labels);
        inner.wants.get_mut(id).unwrap().meta.labels = new_labels;
        Ok(changed_keys)
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

/// A readable, cloneable view of the registry. Cannot mutate; all mutation
/// routes through the single [`Writer`] held by the reconciler.
#[derive(Clone)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
}

impl Store {
    /// `Get(id)` (spec.md §4.1).
    pub fn get(&self, id: &str) -> Option<RegistryEntry> {
        self.inner.read().wants.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().wants.contains_key(id)
    }

    /// `FindByLabels(selector)` (spec.md §4.1): conjunction of equality on
    /// all provided keys, returned in registry insertion order for stable
    /// tie-breaks.
    pub fn find_by_labels(&self, selector: &mywant_core::Selector) -> Vec<WantId> {
        let inner = self.inner.read();
        if selector.selects_all() {
            return inner.insertion_order.clone();
        }
        let mut candidate_sets = Vec::new();
        for expr in selector.expressions() {
            let ids = inner
                .label_index
                .get(&(expr.key.clone(), expr.value.clone()))
                .cloned()
                .unwrap_or_default();
            candidate_sets.push(ids.into_iter().collect::<BTreeSet<_>>());
        }
        let Some(first) = candidate_sets.first().cloned() else {
            return Vec::new();
        };
        let matched: BTreeSet<WantId> = candidate_sets
            .into_iter()
            .fold(first, |acc, set| acc.intersection(&set).cloned().collect());
        inner
            .insertion_order
            .iter()
            .filter(|id| matched.contains(*id))
            .cloned()
            .collect()
    }

    /// Full snapshot of every registered want, in insertion order.
    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        let inner = self.inner.read();
        inner
            .insertion_order
            .iter()
            .filter_map(|id| inner.wants.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().wants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::want::Want;
    use mywant_core::{Selector, WantSpec, WantStatus};

    fn want_with_labels(id: &str, labels: &[(&str, &str)]) -> (WantMeta, Arc<Want>) {
        let labels: BTreeMap<String, String> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let meta = WantMeta::new(id).with_labels(labels);
        let want = Arc::new(Want::new(meta.clone(), WantSpec::default(), "test".to_string()));
        (meta, want)
    }

    #[test]
    fn find_by_labels_matches_insertion_order() {
        let writer = Writer::new();
        let (m1, w1) = want_with_labels("a", &[("role", "src")]);
        let (m2, w2) = want_with_labels("b", &[("role", "src")]);
        writer.add(m1, w1).unwrap();
        writer.add(m2, w2).unwrap();

        let store = writer.as_reader();
        let sel = Selector::from_expressions(vec![mywant_core::Expression {
            key: "role".into(),
            value: "src".into(),
        }]);
        assert_eq!(store.find_by_labels(&sel), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn update_labels_reindexes_and_reports_changed_keys() {
        let writer = Writer::new();
        let (m1, w1) = want_with_labels("a", &[("role", "src")]);
        writer.add(m1, w1).unwrap();

        let mut new_labels = BTreeMap::new();
        new_labels.insert("role".to_string(), "src2".to_string());
        let changed = writer.update_labels("a", new_labels).unwrap();
        assert!(changed.contains("role"));

        let store = writer.as_reader();
        let old_sel = Selector::from_expressions(vec![mywant_core::Expression {
            key: "role".into(),
            value: "src".into(),
        }]);
        assert!(store.find_by_labels(&old_sel).is_empty());
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let writer = Writer::new();
        let (m1, w1) = want_with_labels("a", &[]);
        let (m2, w2) = want_with_labels("a", &[]);
        writer.add(m1, w1).unwrap();
        assert!(matches!(writer.add(m2, w2), Err(EngineError::DuplicateWant(_))));
    }

    #[test]
    fn delete_unknown_fails() {
        let writer = Writer::new();
        assert!(matches!(writer.delete("missing"), Err(EngineError::UnknownWant(_))));
    }

    #[test]
    fn want_status_defaults_to_idle_on_registration() {
        let writer = Writer::new();
        let (m1, w1) = want_with_labels("a", &[]);
        writer.add(m1, w1.clone()).unwrap();
        assert_eq!(w1.status(), WantStatus::Idle);
    }
}
