//! Typed state-change event bus (spec.md §6 "Management API": "Subscribe to
//! a want's state-change stream"; §4.5: owner-completion events are routed
//! through "a typed event subscription").
//!
//! One [`SubscriptionBus`] instance is owned by the reconciler and passed by
//! reference to every component that emits or subscribes (spec.md §9:
//! "Restate as a per-engine `SubscriptionBus` instance... No process-wide
//! singletons"). Grounded on `kube_runtime::reflector::dispatcher`'s use of
//! `async-broadcast` for a broadcast channel that late subscribers can still
//! join without missing a backlog window.

use async_broadcast::{InactiveReceiver, Receiver, Sender};

use mywant_core::WantId;

/// Events visible to external subscribers and to the owner coordinator
/// (spec.md §6).
#[derive(Clone, Debug)]
pub enum WantEvent {
    Created { id: WantId },
    Deleted { id: WantId },
    StatusChanged { id: WantId, old: String, new: String },
    StateChanged { id: WantId, diff_keys: Vec<String> },
    Achieved { id: WantId },
    Failed { id: WantId, reason: String },
    /// Internal to the owner coordinator (spec.md §4.5 step 3): a child
    /// reported achieved (or failed, per §4.5 "Race handling" / §7
    /// OwnerCascadeError) and the event is addressed to its parent.
    OwnerCompletion {
        child_id: WantId,
        parent_id: WantId,
        failed: Option<String>,
    },
}

/// A per-engine broadcast bus. Cloning shares the same underlying channel.
#[derive(Clone)]
pub struct SubscriptionBus {
    tx: Sender<WantEvent>,
    _inactive_rx: std::sync::Arc<InactiveReceiver<WantEvent>>,
}

impl SubscriptionBus {
    pub fn new(capacity: usize) -> Self {
        let (mut tx, rx) = async_broadcast::broadcast(capacity.max(1));
        tx.set_await_active(false);
        tx.set_overflow(true);
        Self {
            tx,
            _inactive_rx: std::sync::Arc::new(rx.deactivate()),
        }
    }

    /// Emits an event to every current subscriber. Callbacks in this engine
    /// are invoked synchronously from the emitter's task (spec.md §5
    /// "Subscription bus... callbacks are invoked synchronously from the
    /// emitter (blocking mode) so owner completion is causally ordered with
    /// child achievement"), which `broadcast_direct` provides: it awaits
    /// until every receiver has room, rather than dropping the event.
    pub async fn emit(&self, event: WantEvent) {
        let _ = self.tx.broadcast_direct(event).await;
    }

    pub fn subscribe(&self) -> Receiver<WantEvent> {
        self.tx.new_receiver()
    }
}

impl Default for SubscriptionBus {
    fn default() -> Self {
        Self::new(256)
    }
}
