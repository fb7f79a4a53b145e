//! The application-facing engine handle (spec.md §6 "Management API").
//!
//! Wires together the registry, channel fabric, type registry, agent
//! orchestrator, owner coordinator and subscription bus behind the
//! reconciler (spec.md §9), and exposes exactly the operations spec.md §6
//! names: `Add` / `Delete` / `Suspend` / `Resume` / `Update(params|labels)`
//! on a want by id, plus `Get` / `List` / `Subscribe` for read access.
//! Mirrors `kube_runtime::Controller`'s role as the one object an embedding
//! application constructs and holds onto.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_broadcast::Receiver;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::warn;

use mywant_core::{
    AgentExecution, EngineError, HistoryEntry, OwnerReference, ParamValue, WantId, WantMeta, WantSpec, WantStatus,
};

use crate::agent::local::LocalActionRegistry;
use crate::agent::webhook::{self, WebhookCallback};
use crate::agent::{AgentOrchestrator, AgentRegistry};
use crate::channel::ChannelFabric;
use crate::events::{SubscriptionBus, WantEvent};
use crate::factory::TypeRegistry;
use crate::metrics::Metrics;
use crate::owner::{OwnerCoordinator, RecipeLoader};
use crate::reconciler::{Reconciler, ReconcilerHandle};
use crate::registry::Store;

/// Knobs with engine-wide defaults (spec.md leaves channel buffer size and
/// event-bus capacity unspecified; these are this engine's defaults, not
/// load-bearing invariants).
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub channel_capacity: usize,
    pub event_bus_capacity: usize,
    /// This engine's own `/agents/callback` base URL (e.g.
    /// `http://localhost:8080`), handed to Monitor agents dispatched over
    /// Webhook (spec.md §4.6). `None` disables Monitor-over-Webhook dispatch.
    pub webhook_callback_url: Option<String>,
    /// Bearer token `callback_router` requires on incoming callbacks; `None`
    /// or empty disables the check (spec.md §4.6 "development only").
    pub webhook_callback_auth_token: Option<String>,
    /// Buffer depth between `callback_router`'s handler and the task that
    /// applies accepted callbacks.
    pub webhook_callback_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            event_bus_capacity: 256,
            webhook_callback_url: None,
            webhook_callback_auth_token: None,
            webhook_callback_buffer: 256,
        }
    }
}

/// A read-only, application-facing projection of one want (spec.md §6
/// `Get(id)` / `List(selector)`). Flattens the registry's `RegistryEntry` and
/// the `Want` runtime object into one value so callers never need to touch
/// either directly.
#[derive(Clone, Debug)]
pub struct WantSnapshot {
    pub id: WantId,
    pub type_name: String,
    pub labels: BTreeMap<String, String>,
    pub owner_references: Vec<OwnerReference>,
    pub status: WantStatus,
    pub spec: WantSpec,
    pub state: BTreeMap<String, ParamValue>,
    pub error: Option<String>,
    pub history: Vec<HistoryEntry>,
    pub agent_executions: Vec<AgentExecution>,
    pub input_peers: Vec<WantId>,
    pub output_peers: Vec<WantId>,
}

impl WantSnapshot {
    fn from_entry(entry: crate::registry::RegistryEntry) -> Self {
        let want = entry.want;
        Self {
            id: entry.meta.id,
            type_name: want.type_name.clone(),
            labels: entry.meta.labels,
            owner_references: entry.meta.owner_references,
            status: want.status(),
            spec: want.spec(),
            state: want.state_snapshot(),
            error: want.error(),
            history: want.history_snapshot(),
            agent_executions: want.agent_executions_snapshot(),
            input_peers: want.paths_in().peer_ids().map(str::to_string).collect(),
            output_peers: want.paths_out().peer_ids().map(str::to_string).collect(),
        }
    }
}

/// Everything an embedding application registers before the engine starts
/// accepting wants: want-type factories, agent/capability declarations, and
/// the local-mode agent actions and recipe loader those agents/targets need
/// (spec.md §1: these are out of scope for this engine and supplied by the
/// embedder).
pub struct EngineBuilder<P> {
    type_registry: TypeRegistry<P>,
    agent_registry: AgentRegistry,
    local_actions: LocalActionRegistry,
    recipe_loader: Arc<dyn RecipeLoader>,
    config: EngineConfig,
    snapshot: Option<crate::snapshot::EngineSnapshot>,
}

impl<P> EngineBuilder<P> {
    pub fn new(recipe_loader: Arc<dyn RecipeLoader>) -> Self {
        Self {
            type_registry: TypeRegistry::new(),
            agent_registry: AgentRegistry::new(),
            local_actions: LocalActionRegistry::new(),
            recipe_loader,
            config: EngineConfig::default(),
            snapshot: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Seeds the registry from a prior [`Engine::export_snapshot`] before the
    /// reconciler starts scheduling (SPEC_FULL.md §12 "Cold-start snapshot
    /// re-ingestion"): every non-terminal restored want gets its cooperative
    /// task resumed as part of `build()`.
    pub fn with_snapshot(mut self, snapshot: crate::snapshot::EngineSnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn register_type(mut self, type_name: impl Into<String>, factory: crate::factory::WantLogicFactory<P>) -> Self {
        self.type_registry.register(type_name, factory);
        self
    }

    pub fn register_agent(mut self, agent: mywant_core::Agent) -> Self {
        self.agent_registry.register_agent(agent);
        self
    }

    pub fn register_capability(mut self, capability: mywant_core::Capability) -> Self {
        self.agent_registry.register_capability(capability);
        self
    }

    pub fn register_local_action(mut self, agent_name: impl Into<String>, action: Arc<dyn crate::agent::local::LocalAgentAction>) -> Self {
        self.local_actions.register(agent_name, action);
        self
    }
}

impl<P: Send + Sync + 'static> EngineBuilder<P> {
    /// Spawns the reconciler task and returns the engine handle (spec.md §9
    /// "single writer" — the `Writer` this creates never leaves the
    /// reconciler).
    pub fn build(self, runtime: Handle) -> Result<Engine<P>, EngineError> {
        let metrics = Arc::new(Metrics::new());
        let fabric = Arc::new(ChannelFabric::new(self.config.channel_capacity, Arc::clone(&metrics)));
        let bus = SubscriptionBus::new(self.config.event_bus_capacity);

        let mut orchestrator = AgentOrchestrator::new(self.agent_registry, self.local_actions, Arc::clone(&metrics));
        if let Some(base) = &self.config.webhook_callback_url {
            orchestrator = orchestrator.with_callback_url(format!("{}/agents/callback", base.trim_end_matches('/')));
        }
        let agents = Arc::new(orchestrator);
        let owner_coordinator = Arc::new(OwnerCoordinator::new(bus.clone(), self.recipe_loader));

        let (reconciler, store) = Reconciler::spawn(
            Arc::clone(&fabric),
            Arc::new(self.type_registry),
            Arc::clone(&agents),
            bus.clone(),
            Arc::clone(&metrics),
            owner_coordinator,
            runtime.clone(),
            self.snapshot,
        )?;

        let (callback_tx, callback_rx) = mpsc::channel(self.config.webhook_callback_buffer);
        spawn_callback_drain(Arc::clone(&agents), store.clone(), callback_rx, &runtime);

        Ok(Engine {
            reconciler,
            store,
            bus,
            metrics,
            fabric,
            callback_tx,
            callback_auth_token: self.config.webhook_callback_auth_token,
        })
    }
}

/// Drains accepted `/agents/callback` deliveries and applies them via
/// `apply_monitor_callback`, skipping unknown or terminal wants rather than
/// failing the whole task (spec.md §4.6 "Callback security": "applied only
/// if the want is still alive and not terminal").
fn spawn_callback_drain(agents: Arc<AgentOrchestrator>, store: Store, mut callbacks: mpsc::Receiver<WebhookCallback>, runtime: &Handle) {
    runtime.spawn(async move {
        while let Some(callback) = callbacks.recv().await {
            let Some(entry) = store.get(&callback.want_id) else {
                warn!(want = %callback.want_id, "monitor callback for unknown want, dropped");
                continue;
            };
            if entry.want.status().is_terminal() {
                warn!(want = %callback.want_id, "monitor callback for terminal want, dropped");
                continue;
            }
            agents.apply_monitor_callback(&entry.want, &callback.agent_name, callback.state_updates);
        }
    });
}

/// The engine handle an embedding application holds onto for the life of the
/// process (spec.md §6). Cheap to clone: every field is an `Arc`, a channel
/// sender, or a read-only registry view.
#[derive(Clone)]
pub struct Engine<P> {
    reconciler: ReconcilerHandle,
    store: Store,
    bus: SubscriptionBus,
    metrics: Arc<Metrics>,
    fabric: Arc<ChannelFabric<P>>,
    callback_tx: mpsc::Sender<WebhookCallback>,
    callback_auth_token: Option<String>,
}

impl<P: Send + Sync + 'static> Engine<P> {
    pub fn builder(recipe_loader: Arc<dyn RecipeLoader>) -> EngineBuilder<P> {
        EngineBuilder::new(recipe_loader)
    }

    /// `Add(want)` (spec.md §4.1, §6): registers the want and starts its
    /// cooperative task. Fails if `meta.id` is already registered, or if no
    /// factory is registered for `type_name`.
    pub async fn add(&self, meta: WantMeta, type_name: impl Into<String>, spec: WantSpec) -> Result<(), EngineError> {
        self.reconciler.add(meta, type_name, spec).await
    }

    /// `Delete(id)` (spec.md §4.1, §4.5, §8.7): cascades to every want this
    /// id transitively controls, post-order, before removing `id` itself.
    pub async fn delete(&self, id: impl Into<String>) -> Result<(), EngineError> {
        self.reconciler.delete(id).await
    }

    /// Explicit pause (spec.md §4.4): the current progress cycle, if any,
    /// finishes; the cooperative task then blocks until `resume`.
    pub async fn suspend(&self, id: impl Into<String>) -> Result<(), EngineError> {
        self.reconciler.suspend(id).await
    }

    pub async fn resume(&self, id: impl Into<String>) -> Result<(), EngineError> {
        self.reconciler.resume(id).await
    }

    /// `UpdateParams(id, key, value)` (spec.md §6): updates one `spec.params`
    /// entry and records a `param_change`-tagged history entry.
    pub async fn update_params(&self, id: impl Into<String>, key: impl Into<String>, value: impl Into<ParamValue>) -> Result<(), EngineError> {
        self.reconciler.update_params(id, key, value).await
    }

    /// `UpdateLabels(id, newLabels)` (spec.md §6): replaces the want's label
    /// set wholesale and re-runs the resolver so any selector depending on
    /// the changed keys is immediately re-evaluated.
    pub async fn update_labels(&self, id: impl Into<String>, labels: BTreeMap<String, String>) -> Result<(), EngineError> {
        self.reconciler.update_labels(id, labels).await
    }

    /// `Get(id)` (spec.md §6): a point-in-time, consistent read. `None` if
    /// unknown.
    pub fn get(&self, id: &str) -> Option<WantSnapshot> {
        self.store.get(id).map(WantSnapshot::from_entry)
    }

    /// `List(selector)` (spec.md §6): every registered want matching
    /// `selector`, in registry insertion order. Pass `Selector::select_all()`
    /// for every want.
    pub fn list(&self, selector: &mywant_core::Selector) -> Vec<WantSnapshot> {
        self.store
            .find_by_labels(selector)
            .into_iter()
            .filter_map(|id| self.store.get(&id))
            .map(WantSnapshot::from_entry)
            .collect()
    }

    /// Every registered want, in insertion order, with no label filtering.
    pub fn list_all(&self) -> Vec<WantSnapshot> {
        self.store.snapshot().into_iter().map(WantSnapshot::from_entry).collect()
    }

    /// `Subscribe()` (spec.md §6: "Subscribe to a want's state-change
    /// stream"): a fresh receiver sees only events emitted after this call,
    /// never a replayed backlog.
    pub fn subscribe(&self) -> Receiver<WantEvent> {
        self.bus.subscribe()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Exports every want currently registered (SPEC_FULL.md §12 "Cold-start
    /// snapshot re-ingestion").
    pub fn export_snapshot(&self) -> crate::snapshot::EngineSnapshot {
        crate::snapshot::export(&self.store)
    }

    /// The `/agents/callback` router (spec.md §6, §4.6): the embedding
    /// application mounts this into its own HTTP server so accepted
    /// Monitor-agent callbacks reach [`AgentOrchestrator::apply_monitor_callback`]
    /// through this engine's own dispatch task.
    pub fn callback_router(&self) -> axum::Router {
        webhook::callback_router(self.callback_auth_token.clone(), self.callback_tx.clone())
    }
}
