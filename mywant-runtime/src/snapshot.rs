//! Cold-start snapshot export/import (spec.md §6: "emit a snapshot per want
//! ... and re-ingest such snapshots on cold start, reproducing the label
//! index and resolver output before scheduling begins"; SPEC_FULL.md §12).
//!
//! Built directly on the registry's [`Writer`]/[`Store`] split: exporting is
//! a [`Store::snapshot`] plus a `Want` field read-out, and importing is
//! replaying [`Writer::add`] calls before the reconciler starts taking new
//! mutations. The resolver pass that reproduces `paths.in`/`paths.out` is the
//! caller's responsibility (typically the first thing run after `import`
//! returns), since this module only knows about the registry, not the
//! channel fabric.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use mywant_core::{EngineError, HistoryEntry, ParamValue, WantMeta, WantSpec, WantStatus};

use crate::registry::Writer;
use crate::want::Want;

/// The serialisable, at-rest form of one want. Deliberately flat (no
/// `Arc<Want>`, no channel state) so it round-trips through `serde_json`
/// without the engine's runtime types leaking into storage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WantSnapshotRecord {
    pub meta: WantMeta,
    pub type_name: String,
    pub spec: WantSpec,
    pub status: WantStatus,
    pub state: BTreeMap<String, ParamValue>,
    pub history: Vec<HistoryEntry>,
    pub error: Option<String>,
}

/// A full engine snapshot: every want, in registry insertion order.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub wants: Vec<WantSnapshotRecord>,
}

/// Exports every want currently in `store` (spec.md §6). Does not include
/// `paths.in`/`paths.out` or open channels — those are resolver output,
/// reproduced by re-running the resolver after [`import`], not persisted
/// state in their own right (spec.md §4.2's monotonicity invariant already
/// guarantees they are a pure function of specs and labels).
pub fn export(store: &crate::registry::Store) -> EngineSnapshot {
    let wants = store
        .snapshot()
        .into_iter()
        .map(|entry| WantSnapshotRecord {
            meta: entry.meta,
            type_name: entry.want.type_name.clone(),
            spec: entry.want.spec(),
            status: entry.want.status(),
            state: entry.want.state_snapshot(),
            history: entry.want.history_snapshot(),
            error: entry.want.error(),
        })
        .collect();
    EngineSnapshot { wants }
}

/// Re-ingests a snapshot into a freshly created [`Writer`], in the order the
/// records appear (spec.md §6: "reproducing the label index... before
/// scheduling begins"). The caller still owns running the resolver and
/// starting executor tasks afterward; this only repopulates the registry.
/// Fails fast on the first duplicate id, since a snapshot with repeated ids
/// indicates corrupt storage rather than something to paper over.
pub fn import(writer: &Writer, snapshot: EngineSnapshot) -> Result<(), EngineError> {
    for record in snapshot.wants {
        let want = Arc::new(Want::restore(
            record.meta.clone(),
            record.spec,
            record.type_name,
            record.status,
            record.state,
            record.history,
            record.error,
        ));
        writer.add(record.meta, want)?;
    }
    Ok(())
}
