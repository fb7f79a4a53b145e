//! The reconciler: the single writer to the registry (spec.md §4.1, §9
//! "Serialises all mutating engine operations... the reconciler is the only
//! writer to the registry; readers take a read-snapshot").
//!
//! One task drains a channel of [`ReconcileOp`]s and the owner coordinator's
//! pending-children channel, applying each serially. After every mutating op
//! it re-runs the resolver and starts/stops executor tasks for newly
//! added/removed wants, mirroring `kube_runtime::Controller`'s "one
//! reconcile at a time per object, driven off a work queue" shape.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc as schedule_mpsc;
use futures::{pin_mut, StreamExt};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use mywant_core::{EngineError, HistorySource, ParamValue, WantId, WantMeta, WantSpec};

use crate::agent::AgentOrchestrator;
use crate::channel::ChannelFabric;
use crate::events::{SubscriptionBus, WantEvent};
use crate::executor::{self, ExecutorHandle};
use crate::factory::TypeRegistry;
use crate::metrics::Metrics;
use crate::owner::{OwnerCoordinator, PendingChild};
use crate::progress::OwnerHandle;
use crate::registry::{RegistryEntry, Store, Writer};
use crate::resolver::resolve_all;
use crate::scheduler::{self, ScheduleRequest};
use crate::want::Want;

/// Debounce window for label-churn-triggered re-resolves (SPEC_FULL.md §12
/// "Requeue / periodic re-reconciliation backoff"). `Add`/`Delete` re-resolve
/// synchronously regardless, since a newly (de)registered want's channels
/// must be wired before its executor task starts using them.
const LABEL_RERESOLVE_DEBOUNCE: Duration = Duration::from_millis(25);

type Reply = oneshot::Sender<Result<(), EngineError>>;

/// One serialised mutation (spec.md §4.1, §9). `AddChildren` is injected
/// internally from the owner coordinator's channel rather than submitted by
/// callers directly; everything else corresponds 1:1 to a management API
/// call (spec.md §6).
enum ReconcileOp {
    Add {
        meta: WantMeta,
        type_name: String,
        spec: WantSpec,
        reply: Reply,
    },
    Delete {
        id: WantId,
        reply: Reply,
    },
    Suspend {
        id: WantId,
        reply: Reply,
    },
    Resume {
        id: WantId,
        reply: Reply,
    },
    UpdateParams {
        id: WantId,
        key: String,
        value: ParamValue,
        reply: Reply,
    },
    UpdateLabels {
        id: WantId,
        labels: BTreeMap<String, String>,
        reply: Reply,
    },
    AddChildren(Vec<PendingChild>),
}

/// A cheap, cloneable submission handle for the management API (spec.md §6:
/// "Add / Delete / Suspend / Resume / Update(params|labels) on a want by
/// id"). `engine.rs` wraps this with the application-facing surface.
#[derive(Clone)]
pub struct ReconcilerHandle {
    ops: mpsc::UnboundedSender<ReconcileOp>,
}

impl ReconcilerHandle {
    async fn call(&self, build: impl FnOnce(Reply) -> ReconcileOp) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        let _ = self.ops.send(build(tx));
        rx.await.unwrap_or_else(|_| {
            Err(EngineError::Config(mywant_core::ConfigError {
                want_id: String::new(),
                reason: "reconciler task shut down before replying".to_string(),
            }))
        })
    }

    pub async fn add(&self, meta: WantMeta, type_name: impl Into<String>, spec: WantSpec) -> Result<(), EngineError> {
        let type_name = type_name.into();
        self.call(|reply| ReconcileOp::Add { meta, type_name, spec, reply }).await
    }

    pub async fn delete(&self, id: impl Into<String>) -> Result<(), EngineError> {
        let id = id.into();
        self.call(|reply| ReconcileOp::Delete { id, reply }).await
    }

    pub async fn suspend(&self, id: impl Into<String>) -> Result<(), EngineError> {
        let id = id.into();
        self.call(|reply| ReconcileOp::Suspend { id, reply }).await
    }

    pub async fn resume(&self, id: impl Into<String>) -> Result<(), EngineError> {
        let id = id.into();
        self.call(|reply| ReconcileOp::Resume { id, reply }).await
    }

    pub async fn update_params(&self, id: impl Into<String>, key: impl Into<String>, value: impl Into<ParamValue>) -> Result<(), EngineError> {
        let id = id.into();
        let key = key.into();
        let value = value.into();
        self.call(|reply| ReconcileOp::UpdateParams { id, key, value, reply }).await
    }

    pub async fn update_labels(&self, id: impl Into<String>, labels: BTreeMap<String, String>) -> Result<(), EngineError> {
        let id = id.into();
        self.call(|reply| ReconcileOp::UpdateLabels { id, labels, reply }).await
    }
}

/// Everything the reconciler's loop needs that doesn't change per-op.
pub struct Reconciler<P> {
    writer: Writer,
    fabric: Arc<ChannelFabric<P>>,
    type_registry: Arc<TypeRegistry<P>>,
    agents: Arc<AgentOrchestrator>,
    bus: SubscriptionBus,
    metrics: Arc<Metrics>,
    owner_coordinator: Arc<OwnerCoordinator>,
    /// Cloned into every target want's [`OwnerHandle`] so `CreateChildren()`
    /// always enqueues onto this reconciler's own `children_rx`, never a
    /// channel nobody is listening on.
    children_tx: mpsc::UnboundedSender<PendingChild>,
    runtime: Handle,
    executors: Mutex<HashMap<WantId, ExecutorHandle>>,
    /// Debounced label-churn re-resolve requests (SPEC_FULL.md §12); drained
    /// by `run`'s select loop, never polled directly from `apply`.
    label_reresolve_tx: schedule_mpsc::UnboundedSender<ScheduleRequest<()>>,
}

impl<P: Send + Sync + 'static> Reconciler<P> {
    /// Spawns the reconciler's own task and returns a [`ReconcilerHandle`]
    /// plus the read-only [`Store`] (spec.md §9: "readers take a
    /// read-snapshot"). If `snapshot` is given, it is re-ingested into the
    /// registry and every non-terminal want it restores has its executor
    /// started before scheduling begins (SPEC_FULL.md §12 "Cold-start
    /// snapshot re-ingestion").
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        fabric: Arc<ChannelFabric<P>>,
        type_registry: Arc<TypeRegistry<P>>,
        agents: Arc<AgentOrchestrator>,
        bus: SubscriptionBus,
        metrics: Arc<Metrics>,
        owner_coordinator: Arc<OwnerCoordinator>,
        runtime: Handle,
        snapshot: Option<crate::snapshot::EngineSnapshot>,
    ) -> Result<(ReconcilerHandle, Store), EngineError> {
        let writer = Writer::new();
        let has_snapshot = snapshot.is_some();
        if let Some(snapshot) = snapshot {
            crate::snapshot::import(&writer, snapshot)?;
        }
        let store = writer.as_reader();
        let (children_tx, children_rx) = mpsc::unbounded_channel();
        let (label_reresolve_tx, label_reresolve_rx) = schedule_mpsc::unbounded();
        let reconciler = Reconciler {
            writer,
            fabric,
            type_registry,
            agents,
            bus,
            metrics,
            owner_coordinator,
            children_tx,
            runtime: runtime.clone(),
            executors: Mutex::new(HashMap::new()),
            label_reresolve_tx,
        };
        if has_snapshot {
            reconciler.resume_from_snapshot();
        }
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let handle = ReconcilerHandle { ops: ops_tx };
        runtime.spawn(reconciler.run(ops_rx, children_rx, label_reresolve_rx));
        Ok((handle, store))
    }

    /// Re-runs the resolver and starts an executor for every restored,
    /// non-terminal want, mirroring `add_one`'s tail (minus `Writer::add`,
    /// already done by [`crate::snapshot::import`], and the `Created` event,
    /// since this is a resume, not a fresh registration).
    fn resume_from_snapshot(&self) {
        self.reresolve();
        for entry in self.writer.as_reader().snapshot() {
            if !entry.want.status().is_terminal() {
                self.spawn_executor_for(&entry);
            }
        }
    }

    /// Builds `entry`'s logic and starts its executor task. Skips (with a
    /// warning) rather than failing the whole cold start if no factory is
    /// registered for its type.
    fn spawn_executor_for(&self, entry: &RegistryEntry) {
        let meta = entry.meta.clone();
        let want = Arc::clone(&entry.want);
        let type_name = want.type_name.clone();
        let spec = want.spec();
        let logic = match self.type_registry.build(&type_name, &meta, &spec) {
            Ok(logic) => logic,
            Err(err) => {
                warn!(want = %meta.id, %err, "failed to resume restored want: no factory for its type");
                return;
            }
        };
        let logic = if let Some(owner_ref) = meta.controller_owner() {
            Arc::new(crate::owner::OwnerAwareShim::new(
                logic,
                Arc::clone(&self.owner_coordinator),
                owner_ref.id.clone(),
                meta.id.clone(),
            )) as Arc<dyn crate::factory::WantLogic<P>>
        } else {
            logic
        };

        let owner_handle = OwnerHandle::new(Arc::clone(&self.owner_coordinator), self.children_tx.clone());
        let parent = meta
            .controller_owner()
            .and_then(|o| self.writer.as_reader().get(&o.id))
            .map(|e| e.want);

        let handle = executor::spawn(
            Arc::clone(&want),
            Arc::clone(&self.fabric),
            logic,
            Arc::clone(&self.agents),
            self.bus.clone(),
            Arc::clone(&self.metrics),
            Some(owner_handle),
            parent,
            &self.runtime,
        );
        self.executors.lock().insert(meta.id, handle);
    }

    async fn run(
        mut self,
        mut ops_rx: mpsc::UnboundedReceiver<ReconcileOp>,
        mut children_rx: mpsc::UnboundedReceiver<PendingChild>,
        label_reresolve_rx: schedule_mpsc::UnboundedReceiver<ScheduleRequest<()>>,
    ) {
        let label_reresolve = scheduler::debounced_scheduler(label_reresolve_rx, LABEL_RERESOLVE_DEBOUNCE);
        pin_mut!(label_reresolve);
        loop {
            tokio::select! {
                op = ops_rx.recv() => {
                    let Some(op) = op else { break };
                    self.apply(op).await;
                }
                children = children_rx.recv() => {
                    let Some(child) = children else { continue };
                    let mut batch = vec![child];
                    // Drain whatever else is immediately ready, so a recipe
                    // materialising N children resolves once, not N times.
                    while let Ok(next) = children_rx.try_recv() {
                        batch.push(next);
                    }
                    self.apply(ReconcileOp::AddChildren(batch)).await;
                }
                _ = label_reresolve.next() => {
                    self.reresolve();
                }
            }
        }
    }

    #[instrument(skip(self, op))]
    async fn apply(&mut self, op: ReconcileOp) {
        match op {
            ReconcileOp::Add { meta, type_name, spec, reply } => {
                let result = self.add_one(meta, type_name, spec).await;
                let _ = reply.send(result);
            }
            ReconcileOp::Delete { id, reply } => {
                let result = self.delete_cascade(&id).await;
                let _ = reply.send(result);
            }
            ReconcileOp::Suspend { id, reply } => {
                let result = self.with_want(&id, |want| {
                    want.suspend();
                });
                let _ = reply.send(result);
            }
            ReconcileOp::Resume { id, reply } => {
                let result = self.with_want(&id, |want| {
                    want.resume();
                });
                let _ = reply.send(result);
            }
            ReconcileOp::UpdateParams { id, key, value, reply } => {
                let result = self.with_want(&id, |want| {
                    let mut spec = want.spec();
                    spec.params.insert(key.clone(), value.clone());
                    want.replace_spec(spec);
                    let mut delta = BTreeMap::new();
                    delta.insert(key, value);
                    if let Some(entry) = want.commit_agent_delta(delta, now_millis(), HistorySource::ParamChange) {
                        self.metrics.history_entry_recorded();
                        let _ = entry;
                    }
                });
                let _ = reply.send(result);
            }
            ReconcileOp::UpdateLabels { id, labels, reply } => {
                let result = match self.writer.update_labels(&id, labels) {
                    Ok(_changed_keys) => {
                        self.request_label_reresolve();
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            ReconcileOp::AddChildren(children) => {
                for child in children {
                    if let Err(err) = self.add_one(child.meta, child.type_name, child.spec).await {
                        warn!(%err, "failed to materialise owner-created child");
                    }
                }
            }
        }
    }

    fn with_want(&self, id: &str, f: impl FnOnce(&Want)) -> Result<(), EngineError> {
        let store = self.writer.as_reader();
        let entry = store.get(id).ok_or_else(|| EngineError::UnknownWant(id.to_string()))?;
        f(&entry.want);
        Ok(())
    }

    async fn add_one(&self, meta: WantMeta, type_name: String, spec: WantSpec) -> Result<(), EngineError> {
        let id = meta.id.clone();
        let logic = self.type_registry.build(&type_name, &meta, &spec)?;
        let want = Arc::new(Want::new(meta.clone(), spec, type_name));

        let logic = if let Some(owner_ref) = meta.controller_owner() {
            Arc::new(crate::owner::OwnerAwareShim::new(
                logic,
                Arc::clone(&self.owner_coordinator),
                owner_ref.id.clone(),
                id.clone(),
            )) as Arc<dyn crate::factory::WantLogic<P>>
        } else {
            logic
        };

        self.writer.add(meta.clone(), Arc::clone(&want))?;
        self.reresolve();
        self.bus.emit(WantEvent::Created { id: id.clone() }).await;

        let owner_handle = OwnerHandle::new(Arc::clone(&self.owner_coordinator), self.children_tx.clone());
        let parent = meta
            .controller_owner()
            .and_then(|o| self.writer.as_reader().get(&o.id))
            .map(|e| e.want);

        let handle = executor::spawn(
            Arc::clone(&want),
            Arc::clone(&self.fabric),
            logic,
            Arc::clone(&self.agents),
            self.bus.clone(),
            Arc::clone(&self.metrics),
            Some(owner_handle),
            parent,
            &self.runtime,
        );
        self.executors.lock().insert(id, handle);
        Ok(())
    }

    /// `Delete(id)` with cascade (spec.md §4.5, §8.7): every want transitively
    /// controlled by `id` (tracked by the owner coordinator as its child set)
    /// is deleted first, post-order, then `id` itself. Channels close as a
    /// side effect of the next resolver pass once each want is gone.
    async fn delete_cascade(&self, id: &str) -> Result<(), EngineError> {
        let children: Vec<WantId> = self.owner_coordinator.child_ids(&id.to_string()).into_iter().collect();
        for child in children {
            Box::pin(self.delete_cascade(&child)).await.ok();
        }

        let entry = self.writer.delete(id)?;
        if let Some(handle) = self.executors.lock().remove(id) {
            handle.request_stop(&entry.want);
        }
        self.reresolve();
        self.bus.emit(WantEvent::Deleted { id: id.to_string() }).await;
        info!(want = %id, "want deleted");
        Ok(())
    }

    fn reresolve(&self) {
        let store = self.writer.as_reader();
        resolve_all(&store, self.fabric.as_ref());
    }

    /// Schedules a debounced re-resolve (SPEC_FULL.md §12): repeated label
    /// updates arriving within [`LABEL_RERESOLVE_DEBOUNCE`] of each other
    /// collapse into the one re-resolve `run`'s select loop performs once
    /// the window elapses, rather than one per `UpdateLabels` call.
    fn request_label_reresolve(&self) {
        let _ = self.label_reresolve_tx.unbounded_send(ScheduleRequest {
            message: (),
            run_at: Instant::now(),
        });
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
