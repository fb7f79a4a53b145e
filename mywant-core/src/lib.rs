//! Data model for the MyWant reconciling pipeline engine.
//!
//! This crate holds only plain types and client-less behavior: the want's
//! identity and metadata, label selectors, specs, the status state machine,
//! agent/capability descriptors, bounded state history, and the error kinds
//! the engine can raise. It has no async runtime dependency and performs no
//! I/O; `mywant-runtime` builds the reconciling engine on top of it.

pub mod agent;
pub mod document;
pub mod error;
pub mod history;
pub mod labels;
pub mod meta;
pub mod params;
pub mod path;
pub mod spec;
pub mod status;

pub use agent::{Agent, AgentExecution, AgentExecutionStatus, AgentKind, Capability, RetryPolicy, RuntimeMode};
pub use document::{RecipeDocument, WantDeclaration};
pub use error::{AgentError, ChannelError, ConfigError, EngineError, OwnerCascadeError, PanicError, ResolutionError};
pub use history::{HistoryEntry, HistorySource, StateHistory};
pub use labels::{Expression, Selector};
pub use meta::{OwnerReference, WantMeta};
pub use params::ParamValue;
pub use path::{PathEntry, PathSet, SourceTag};
pub use spec::WantSpec;
pub use status::WantStatus;

/// Stable identity of a want. Assigned at creation if the caller did not
/// supply one (spec.md §3, "Identity = a stable unique id").
pub type WantId = String;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
