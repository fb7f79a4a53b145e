//! Type registry mapping a want's `type` string to the factory that builds
//! its `Progress()` logic (spec.md §9 "Reflection-based factories in the
//! source... Replace with a type registry: map `typeName -> factory(metadata,
//! spec) -> Want-shaped object with a Progress() capability`").

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mywant_core::EngineError;

use crate::progress::{ProgressContext, StepOutcome};

/// The type-specific behavior of a want. Domain want implementations (flight,
/// hotel, queue, fibonacci, prime, travel-coordinator, ... — out of scope per
/// spec.md §1) implement this trait; the engine only needs the contract.
#[async_trait]
pub trait WantLogic<P>: Send + Sync {
    /// One `Progress()` step (spec.md §4.4 step 3). Called once per progress
    /// cycle, between `BeginProgressCycle` and `EndProgressCycle`.
    async fn progress(&self, ctx: &mut ProgressContext<'_, P>) -> Result<StepOutcome, EngineError>;
}

pub type WantLogicFactory<P> =
    Arc<dyn Fn(&mywant_core::WantMeta, &mywant_core::WantSpec) -> Result<Arc<dyn WantLogic<P>>, EngineError> + Send + Sync>;

/// `typeName -> factory`. Populated by the embedding application before any
/// want of that type is added (spec.md §6: the loader hands the engine
/// already-typed want specs; this engine only needs to resolve `type` to
/// logic).
pub struct TypeRegistry<P> {
    factories: HashMap<String, WantLogicFactory<P>>,
}

impl<P> TypeRegistry<P> {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, type_name: impl Into<String>, factory: WantLogicFactory<P>) {
        self.factories.insert(type_name.into(), factory);
    }

    pub fn build(
        &self,
        type_name: &str,
        meta: &mywant_core::WantMeta,
        spec: &mywant_core::WantSpec,
    ) -> Result<Arc<dyn WantLogic<P>>, EngineError> {
        let factory = self.factories.get(type_name).ok_or_else(|| {
            EngineError::Config(mywant_core::ConfigError {
                want_id: meta.id.clone(),
                reason: format!("no factory registered for want type {type_name:?}"),
            })
        })?;
        factory(meta, spec)
    }
}

impl<P> Default for TypeRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}
