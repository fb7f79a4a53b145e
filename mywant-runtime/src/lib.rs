//! Reconciling execution engine for MyWant (spec.md, SPEC_FULL.md).
//!
//! Layering mirrors `kube_runtime`: [`registry`] is the watch cache
//! (`reflector::store`), [`reconciler`] is the controller loop, [`executor`]
//! is the per-object reconcile task, and [`engine`] is the top-level handle
//! an embedding application constructs once and holds onto.

pub mod agent;
pub mod channel;
pub mod engine;
pub mod events;
mod executor;
pub mod factory;
pub mod metrics;
pub mod owner;
pub mod progress;
mod reconciler;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod snapshot;
mod util;
pub mod want;

pub use engine::{Engine, EngineBuilder, EngineConfig, WantSnapshot};
pub use events::WantEvent;
pub use owner::{ChildWantSpec, RecipeLoader, StaticRecipeLoader};
