//! Owner coordinator and cascading completion (spec.md §4.5).
//!
//! A target (parent) want materialises a set of child wants from a recipe
//! and completes only once every child has completed. This module tracks
//! that bookkeeping and exposes the "owner-aware shim" (spec.md §9: "any
//! want whose metadata carries owner references is transparently wrapped by
//! an owner-aware shim that emits completion events; the decorator is
//! composed, not inherited") as a [`WantLogic`] wrapper rather than an
//! inheritance hierarchy.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{info, warn};

use mywant_core::{EngineError, ParamValue, WantId, WantMeta, WantSpec};

use crate::events::{SubscriptionBus, WantEvent};
use crate::factory::WantLogic;
use crate::progress::{ProgressContext, StepOutcome};

/// One child want specification produced by a recipe (spec.md §6 "Recipe
/// files... returns `[]WantSpec`").
#[derive(Clone, Debug)]
pub struct ChildWantSpec {
    pub id: WantId,
    pub type_name: String,
    pub labels: BTreeMap<String, String>,
    pub spec: WantSpec,
}

/// The engine treats recipes as opaque data (spec.md §6); this trait is the
/// pluggable boundary a loader (external, unspecified) implements.
pub trait RecipeLoader: Send + Sync {
    fn load(
        &self,
        recipe_path: &str,
        recipe_params: &BTreeMap<String, ParamValue>,
    ) -> Result<Vec<ChildWantSpec>, EngineError>;
}

/// An in-memory loader for tests: recipes are registered by path ahead of
/// time and returned verbatim, ignoring `recipe_params`.
#[derive(Default)]
pub struct StaticRecipeLoader {
    recipes: std::collections::HashMap<String, Vec<ChildWantSpec>>,
}

impl StaticRecipeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_recipe(mut self, path: impl Into<String>, children: Vec<ChildWantSpec>) -> Self {
        self.recipes.insert(path.into(), children);
        self
    }
}

impl RecipeLoader for StaticRecipeLoader {
    fn load(
        &self,
        recipe_path: &str,
        _recipe_params: &BTreeMap<String, ParamValue>,
    ) -> Result<Vec<ChildWantSpec>, EngineError> {
        self.recipes.get(recipe_path).cloned().ok_or_else(|| {
            EngineError::Config(mywant_core::ConfigError {
                want_id: String::new(),
                reason: format!("no recipe registered at path {recipe_path:?}"),
            })
        })
    }
}

/// A want to be materialised by the reconciler, stamped with a controller
/// owner reference back to the parent (spec.md §4.5 step 1).
pub struct PendingChild {
    pub meta: WantMeta,
    pub type_name: String,
    pub spec: WantSpec,
}

/// The reconciler's add-children inbox. The owner coordinator enqueues onto
/// this rather than adding inline, so a target want's progress cycle never
/// holds the scheduler lock while children are added (spec.md §4.5 step 1).
pub type AddChildrenSink = tokio::sync::mpsc::UnboundedSender<PendingChild>;

struct ParentState {
    full_children: HashSet<WantId>,
    completed: HashSet<WantId>,
    failed: Option<(WantId, String)>,
    done: Arc<Notify>,
}

/// Tracks, per target want, the child set it is waiting on (spec.md §4.5).
/// One instance is shared (via `Arc`) by the executor (to build owner-aware
/// shims) and by whichever component submits reconciler ops on the parent's
/// behalf.
pub struct OwnerCoordinator {
    bus: SubscriptionBus,
    recipe_loader: Arc<dyn RecipeLoader>,
    parents: Mutex<std::collections::HashMap<WantId, ParentState>>,
}

impl OwnerCoordinator {
    pub fn new(bus: SubscriptionBus, recipe_loader: Arc<dyn RecipeLoader>) -> Self {
        Self {
            bus,
            recipe_loader,
            parents: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// `CreateChildren()` (spec.md §4.5 step 1): resolves the recipe,
    /// stamps each child with a controller owner reference, and returns the
    /// pending wants for the reconciler to add asynchronously. Registers the
    /// full child set *before* returning, so a child that achieves before
    /// the caller enqueues it is still accounted for.
    pub fn create_children(
        &self,
        parent_id: &WantId,
        recipe_path: &str,
        recipe_params: &BTreeMap<String, ParamValue>,
    ) -> Result<Vec<PendingChild>, EngineError> {
        let children = self.recipe_loader.load(recipe_path, recipe_params)?;
        let child_ids: HashSet<WantId> = children.iter().map(|c| c.id.clone()).collect();

        self.parents.lock().insert(
            parent_id.clone(),
            ParentState {
                full_children: child_ids,
                completed: HashSet::new(),
                failed: None,
                done: Arc::new(Notify::new()),
            },
        );

        Ok(children
            .into_iter()
            .map(|c| {
                let mut meta = WantMeta::new(c.id).with_labels(c.labels);
                meta.set_owner_references(vec![mywant_core::OwnerReference::controller_of(
                    "Target",
                    parent_id.clone(),
                    parent_id.clone(),
                )])
                .expect("a freshly constructed child has no prior owner references");
                PendingChild {
                    meta,
                    type_name: c.type_name,
                    spec: c.spec,
                }
            })
            .collect())
    }

    /// The explicit re-check spec.md §4.5 "Race handling" requires after
    /// enqueueing children: idempotent, safe to call any number of times.
    pub fn recheck(&self, parent_id: &WantId) {
        self.maybe_complete(parent_id);
    }

    /// Called by the owner-aware shim when a child reports achieved.
    /// Updates `completedChildren`, and if it now equals the full child set,
    /// wakes whoever is waiting on the parent's `childrenDone` signal
    /// (idempotent: repeated signals are absorbed, spec.md §8.6).
    pub fn on_child_achieved(&self, parent_id: &WantId, child_id: &WantId) {
        {
            let mut parents = self.parents.lock();
            if let Some(state) = parents.get_mut(parent_id) {
                state.completed.insert(child_id.clone());
            } else {
                warn!(%parent_id, %child_id, "child achieved for unknown/untracked parent");
                return;
            }
        }
        self.maybe_complete(parent_id);
    }

    /// Called by the owner-aware shim when a child fails (spec.md §7
    /// OwnerCascadeError: "the owner receives the completion event with a
    /// failure marker and must decide... whether to fail or continue").
    pub fn on_child_failed(&self, parent_id: &WantId, child_id: &WantId, reason: &str) {
        let mut parents = self.parents.lock();
        if let Some(state) = parents.get_mut(parent_id) {
            state.failed = Some((child_id.clone(), reason.to_string()));
            state.done.notify_waiters();
        }
    }

    fn maybe_complete(&self, parent_id: &WantId) {
        let ready = {
            let parents = self.parents.lock();
            parents
                .get(parent_id)
                .map(|s| s.completed.is_superset(&s.full_children))
                .unwrap_or(false)
        };
        if ready {
            if let Some(state) = self.parents.lock().get(parent_id) {
                state.done.notify_waiters();
            }
        }
    }

    /// Blocks until `completedChildren == full child set` (or a child
    /// reported failure). Called from the target want's `Progress()`
    /// (spec.md §4.5 step 5: "The parent's `Progress()` blocks on
    /// `childrenDone`").
    pub async fn wait_children_done(&self, parent_id: &WantId) -> Result<(), (WantId, String)> {
        loop {
            let (notify, failed, ready) = {
                let parents = self.parents.lock();
                let Some(state) = parents.get(parent_id) else {
                    return Ok(());
                };
                (
                    state.done.clone(),
                    state.failed.clone(),
                    state.completed.is_superset(&state.full_children),
                )
            };
            if let Some(failure) = failed {
                return Err(failure);
            }
            if ready {
                return Ok(());
            }
            notify.notified().await;
        }
    }

    pub fn child_ids(&self, parent_id: &WantId) -> HashSet<WantId> {
        self.parents
            .lock()
            .get(parent_id)
            .map(|s| s.full_children.clone())
            .unwrap_or_default()
    }

    pub async fn emit_completion(&self, child_id: &WantId, parent_id: &WantId, failed: Option<String>) {
        self.bus
            .emit(WantEvent::OwnerCompletion {
                child_id: child_id.clone(),
                parent_id: parent_id.clone(),
                failed,
            })
            .await;
    }
}

/// Wraps a child want's logic so that achieving triggers owner-completion
/// handling, instead of the child's type needing to know about ownership at
/// all (spec.md §9's decorator contract).
pub struct OwnerAwareShim<P> {
    inner: Arc<dyn WantLogic<P>>,
    coordinator: Arc<OwnerCoordinator>,
    parent_id: WantId,
    child_id: WantId,
}

impl<P> OwnerAwareShim<P> {
    pub fn new(inner: Arc<dyn WantLogic<P>>, coordinator: Arc<OwnerCoordinator>, parent_id: WantId, child_id: WantId) -> Self {
        Self {
            inner,
            coordinator,
            parent_id,
            child_id,
        }
    }
}

#[async_trait]
impl<P: Send + Sync + 'static> WantLogic<P> for OwnerAwareShim<P> {
    async fn progress(&self, ctx: &mut ProgressContext<'_, P>) -> Result<StepOutcome, EngineError> {
        let outcome = self.inner.progress(ctx).await?;
        match outcome {
            StepOutcome::Achieved => {
                info!(child = %self.child_id, parent = %self.parent_id, "child achieved, notifying owner");
                self.coordinator.on_child_achieved(&self.parent_id, &self.child_id);
                self.coordinator.emit_completion(&self.child_id, &self.parent_id, None).await;
            }
            StepOutcome::Failed => {
                let reason = "child progress reported failure".to_string();
                self.coordinator.on_child_failed(&self.parent_id, &self.child_id, &reason);
                self.coordinator
                    .emit_completion(&self.child_id, &self.parent_id, Some(reason))
                    .await;
            }
            StepOutcome::Continue => {}
        }
        Ok(outcome)
    }
}
