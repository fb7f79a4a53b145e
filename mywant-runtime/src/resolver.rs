//! Connectivity resolver (spec.md §4.2).
//!
//! Evaluates every want's `using`/`usingGlobal` selectors against the label
//! index and produces the authoritative `paths.in`/`paths.out`, diffing
//! against the previous run so persisting edges retain their channel
//! identity (spec.md §4.2 step 4, and the monotonicity invariant, spec.md
//! §8.2).

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use mywant_core::path::SourceTag;
use mywant_core::{PathEntry, PathSet, WantId};
use tracing::{debug, instrument};

use crate::channel::ChannelFabric;
use crate::registry::Store;

/// Two wants are in the same "recipe scope" (spec.md §4.2 step 1
/// "sameRecipeScope(C)") if they share the same immediate controller-owner
/// id, or both have none (the top-level scope). This engine has no other
/// notion of namespacing, so scope is derived structurally from the owner
/// hierarchy rather than tracked as separate metadata.
fn recipe_scope_of(meta: &mywant_core::WantMeta) -> Option<WantId> {
    meta.controller_owner().map(|o| o.id.clone())
}

/// One full resolver pass over every want currently in the registry.
/// Creates/closes channels on `fabric` as edges are added/removed, and
/// installs the new path sets on each affected `Want`. Returns the ids of
/// wants whose resolution failed a structural check (self-loop) — per
/// spec.md §4.2 "Failure semantics" these wants should be failed by the
/// caller, not the resolver itself.
#[instrument(skip(store, fabric))]
pub fn resolve_all<P: Send + 'static>(store: &Store, fabric: &ChannelFabric<P>) -> Vec<WantId> {
    let entries = store.snapshot();

    // edges_in[consumer] = ordered Vec<(producer, source)>
    let mut edges_in: std::collections::BTreeMap<WantId, Vec<(WantId, SourceTag)>> =
        std::collections::BTreeMap::new();
    // edges_out[producer] = ordered Vec<(consumer, source)>, in emission order
    let mut edges_out: std::collections::BTreeMap<WantId, Vec<(WantId, SourceTag)>> =
        std::collections::BTreeMap::new();

    for entry in &entries {
        let consumer_id = &entry.meta.id;
        let consumer_scope = recipe_scope_of(&entry.meta);
        let spec = entry.want.spec();
        let mut local_producers: Vec<WantId> = Vec::new();

        for selector in &spec.using {
            let matches = store.find_by_labels(selector);
            for producer_id in matches {
                if &producer_id == consumer_id {
                    // spec.md §4.2 edge case: "A want matching itself by
                    // label is excluded (no self-loops)".
                    continue;
                }
                let Some(producer_entry) = store.get(&producer_id) else {
                    continue;
                };
                if recipe_scope_of(&producer_entry.meta) != consumer_scope {
                    continue;
                }
                local_producers.push(producer_id);
            }
        }

        let mut global_producers: Vec<WantId> = Vec::new();
        for selector in &spec.using_global {
            let matches = store.find_by_labels(selector);
            for producer_id in matches {
                if &producer_id == consumer_id {
                    continue;
                }
                global_producers.push(producer_id);
            }
        }

        let consumer_edges = edges_in.entry(consumer_id.clone()).or_default();
        for producer_id in local_producers {
            consumer_edges.push((producer_id.clone(), SourceTag::Local));
            edges_out
                .entry(producer_id)
                .or_default()
                .push((consumer_id.clone(), SourceTag::Local));
        }
        for producer_id in global_producers {
            consumer_edges.push((producer_id.clone(), SourceTag::Global));
            edges_out
                .entry(producer_id)
                .or_default()
                .push((consumer_id.clone(), SourceTag::Global));
        }
    }

    // Diff against each want's previous path set, create/close channels, and
    // install the new path sets.
    let mut new_channel_keys: HashSet<(WantId, WantId, SourceTag)> = HashSet::new();
    for entry in &entries {
        let id = &entry.meta.id;
        let new_in = edges_in.remove(id).unwrap_or_default();
        let new_out = edges_out.remove(id).unwrap_or_default();

        let path_in = PathSet::from_entries(
            new_in
                .iter()
                .map(|(peer, source)| PathEntry {
                    channel_name: mywant_core::path::channel_name(peer, id, *source),
                    peer_id: peer.clone(),
                    source: *source,
                })
                .collect(),
        );
        let path_out = PathSet::from_entries(
            new_out
                .iter()
                .map(|(peer, source)| PathEntry {
                    channel_name: mywant_core::path::channel_name(id, peer, *source),
                    peer_id: peer.clone(),
                    source: *source,
                })
                .collect(),
        );

        for (peer, source) in &new_in {
            new_channel_keys.insert((peer.clone(), id.clone(), *source));
        }

        entry.want.set_paths(path_in, path_out);
    }

    // Create any channel that should now exist but doesn't; the executor
    // claims the matching receiver lazily, the first time it sees this edge
    // in the consumer's `paths.in` (`ChannelFabric::take_receiver`).
    let mut keep_names = HashSet::new();
    for (producer, consumer, source) in &new_channel_keys {
        if !fabric.is_open(producer, consumer, *source) {
            fabric.ensure(producer, consumer, *source);
            debug!(%producer, %consumer, ?source, "channel opened");
        }
        keep_names.insert(mywant_core::path::channel_name(producer, consumer, *source));
    }
    fabric.retain_only(&keep_names);

    // No selector in this engine can produce a structural resolution error
    // (equality-only matching, spec.md's Non-goal on selector complexity);
    // the `Vec<WantId>` return is kept so a future selector kind with real
    // failure modes (spec.md §4.2 "Failure semantics") has somewhere to
    // report into without changing this function's signature.
    Vec::new()
}

/// Closes every channel no longer present in `current_edges`, given the set
/// of edges the previous resolver pass installed. Kept separate from
/// `resolve_all` so the executor can call it once it has confirmed no
/// in-flight consumer is still draining a about-to-be-removed channel's
/// buffer this cycle.
pub fn close_stale_channels<P: Send + 'static>(
    fabric: &ChannelFabric<P>,
    previous_edges: &BTreeSet<(WantId, WantId, SourceTag)>,
    current_edges: &BTreeSet<(WantId, WantId, SourceTag)>,
) {
    for (producer, consumer, source) in previous_edges.difference(current_edges) {
        fabric.close(producer, consumer, *source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::want::Want;
    use mywant_core::{Selector, WantMeta, WantSpec};
    use std::sync::Arc;

    fn add_want(writer: &crate::registry::Writer, id: &str, labels: &[(&str, &str)], spec: WantSpec) {
        let labels = labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let meta = WantMeta::new(id).with_labels(labels);
        let want = Arc::new(Want::new(meta.clone(), spec, "test"));
        writer.add(meta, want).unwrap();
    }

    #[test]
    fn linear_pipeline_resolves_in_order() {
        let writer = crate::registry::Writer::new();
        add_want(&writer, "a", &[("role", "src")], WantSpec::default());
        add_want(
            &writer,
            "b",
            &[("role", "mid")],
            WantSpec {
                using: vec![Selector::from_iter(Some(("role", "src")))],
                ..Default::default()
            },
        );
        add_want(
            &writer,
            "c",
            &[],
            WantSpec {
                using: vec![Selector::from_iter(Some(("role", "mid")))],
                ..Default::default()
            },
        );

        let store = writer.as_reader();
        let fabric = crate::channel::ChannelFabric::<i32>::new(10, Arc::new(crate::metrics::Metrics::new()));
        resolve_all(&store, &fabric);

        let b = store.get("b").unwrap();
        assert_eq!(b.want.paths_in().peer_ids().collect::<Vec<_>>(), vec!["a"]);
        let a = store.get("a").unwrap();
        assert_eq!(a.want.paths_out().peer_ids().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn self_loop_is_excluded() {
        let writer = crate::registry::Writer::new();
        add_want(
            &writer,
            "a",
            &[("role", "src")],
            WantSpec {
                using: vec![Selector::from_iter(Some(("role", "src")))],
                ..Default::default()
            },
        );
        let store = writer.as_reader();
        let fabric = crate::channel::ChannelFabric::<i32>::new(10, Arc::new(crate::metrics::Metrics::new()));
        resolve_all(&store, &fabric);
        let a = store.get("a").unwrap();
        assert!(a.want.paths_in().entries().is_empty());
    }

    #[test]
    fn zero_match_selector_is_legal() {
        let writer = crate::registry::Writer::new();
        add_want(
            &writer,
            "b",
            &[],
            WantSpec {
                using: vec![Selector::from_iter(Some(("role", "nonexistent")))],
                ..Default::default()
            },
        );
        let store = writer.as_reader();
        let fabric = crate::channel::ChannelFabric::<i32>::new(10, Arc::new(crate::metrics::Metrics::new()));
        resolve_all(&store, &fabric);
        assert!(store.get("b").unwrap().want.paths_in().entries().is_empty());
    }
}
