//! The interface a want's type-specific logic sees inside one progress
//! cycle (spec.md §4.4 step 3): channel access plus the `StoreState` /
//! `MergeState` / `GetState` batching API.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use mywant_core::{ChannelError, EngineError, ParamValue, WantId, WantSpec};

use crate::channel::{ChannelFabric, ChannelReceiver, ChannelSenderHandle};
use crate::owner::{AddChildrenSink, OwnerCoordinator};
use crate::want::Want;

/// Binds a progress cycle to the owner coordinator, so a target want's
/// type-specific logic can call `CreateChildren()`/block on `childrenDone`
/// without knowing the coordinator exists as anything but this handle
/// (spec.md §4.5 steps 1, 2, 5). Cheap to clone: an `Arc` and a channel
/// sender.
#[derive(Clone)]
pub struct OwnerHandle {
    coordinator: Arc<OwnerCoordinator>,
    children_sink: AddChildrenSink,
}

impl OwnerHandle {
    pub fn new(coordinator: Arc<OwnerCoordinator>, children_sink: AddChildrenSink) -> Self {
        Self {
            coordinator,
            children_sink,
        }
    }
}

/// What a `Progress()` call reports back to the executor (spec.md §4.4: "The
/// task repeats until `IsAchieved()` returns true, an explicit stop is
/// requested, or the want fails").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Keep calling `Progress()` on the next cycle.
    Continue,
    /// The want is done; the executor transitions it to `achieved`.
    Achieved,
    /// The want failed; the executor records `reason` and transitions it to
    /// `failed`.
    Failed,
}

/// Per-cycle context handed to `Progress()`. Holds the receivers this
/// want's executor task has claimed so far (persisted by the executor across
/// cycles, since a channel's receiving half may only be taken once) plus
/// read-only access to the current `paths.in`/`paths.out`/`spec.params`
/// snapshot taken at cycle start (spec.md §4.4 step 2).
pub struct ProgressContext<'a, P> {
    want: &'a Want,
    receivers: &'a mut HashMap<String, ChannelReceiver<P>>,
    senders: HashMap<WantId, std::sync::Arc<ChannelSenderHandle<P>>>,
    spec: WantSpec,
    owner: Option<OwnerHandle>,
}

impl<'a, P: Send + 'static> ProgressContext<'a, P> {
    pub fn new(want: &'a Want, fabric: &'a ChannelFabric<P>, receivers: &'a mut HashMap<String, ChannelReceiver<P>>) -> Self {
        let spec = want.spec();
        let mut senders = HashMap::new();
        for entry in want.paths_out().entries() {
            let sender = fabric.ensure(&want.id, &entry.peer_id, entry.source);
            senders.insert(entry.peer_id.clone(), sender);
        }
        for entry in want.paths_in().entries() {
            if !receivers.contains_key(&entry.channel_name) {
                if let Some(rx) = fabric.take_receiver(&entry.peer_id, &want.id, entry.source) {
                    receivers.insert(entry.channel_name.clone(), rx);
                }
            }
        }
        Self {
            want,
            receivers,
            senders,
            spec,
            owner: None,
        }
    }

    /// Attaches owner-coordinator access for this cycle (spec.md §4.5). Only
    /// the executor, which is responsible for constructing every cycle's
    /// context, calls this; target wants are otherwise indistinguishable from
    /// any other want.
    pub fn with_owner(mut self, owner: OwnerHandle) -> Self {
        self.owner = Some(owner);
        self
    }

    /// `paths.in` peer ids, in resolver order (spec.md §4.2 "Tie-breaks and
    /// ordering"): locals before globals, original selector order preserved.
    pub fn input_peers(&self) -> Vec<WantId> {
        self.want.paths_in().peer_ids().map(str::to_string).collect()
    }

    pub fn output_peers(&self) -> Vec<WantId> {
        self.want.paths_out().peer_ids().map(str::to_string).collect()
    }

    pub fn params(&self) -> &BTreeMap<String, ParamValue> {
        &self.spec.params
    }

    pub fn param(&self, key: &str) -> Option<&ParamValue> {
        self.spec.params.get(key)
    }

    /// Receives from the input channel connected to `peer_id`. Returns
    /// `None` on end-of-stream (spec.md §4.3).
    pub async fn recv(&mut self, peer_id: &str) -> Option<P> {
        let channel_name = self
            .want
            .paths_in()
            .entries()
            .iter()
            .find(|e| e.peer_id == peer_id)
            .map(|e| e.channel_name.clone())?;
        let rx = self.receivers.get_mut(&channel_name)?;
        rx.recv().await
    }

    /// Sends to the output channel connected to `peer_id`.
    pub async fn send(&self, peer_id: &str, item: P) -> Result<(), ChannelError> {
        match self.senders.get(peer_id) {
            Some(sender) => sender.send(item).await,
            None => Err(ChannelError::SendOnClosed {
                channel_name: format!("{}_to_{peer_id}", self.want.id),
                producer_id: self.want.id.clone(),
            }),
        }
    }

    pub fn store_state(&self, key: impl Into<String>, value: impl Into<ParamValue>) {
        self.want.store_state(key, value);
    }

    pub fn merge_state(&self, partial: BTreeMap<String, ParamValue>) {
        self.want.merge_state(partial);
    }

    pub fn get_state(&self, key: &str) -> Option<ParamValue> {
        self.want.get_state(key)
    }

    pub fn want_id(&self) -> &str {
        &self.want.id
    }

    /// `CreateChildren()` (spec.md §4.5 step 1): resolves `recipePath`
    /// through the owner coordinator, stamps each child with a controller
    /// owner reference, and hands them to the reconciler's add queue for
    /// asynchronous materialisation — never inline, so this want never holds
    /// a scheduler lock while children are added. Re-checks completion
    /// immediately afterward (step 3's race handling): a child may finish
    /// between creation and this want's next `wait_children_done` call.
    pub fn create_children(&self, recipe_path: &str, recipe_params: &BTreeMap<String, ParamValue>) -> Result<(), EngineError> {
        let owner = self
            .owner
            .as_ref()
            .expect("create_children called on a progress cycle with no owner coordinator bound");
        let pending = owner.coordinator.create_children(&self.want.id, recipe_path, recipe_params)?;
        for child in pending {
            let _ = owner.children_sink.send(child);
        }
        owner.coordinator.recheck(&self.want.id);
        Ok(())
    }

    /// Blocks until every child materialised by `create_children` has
    /// reported achieved, or one has failed (spec.md §4.5 step 5).
    pub async fn wait_children_done(&self) -> Result<(), (WantId, String)> {
        let owner = self
            .owner
            .as_ref()
            .expect("wait_children_done called on a progress cycle with no owner coordinator bound");
        owner.coordinator.wait_children_done(&self.want.id).await
    }
}
