//! Engine error kinds (spec.md §7 "Error Handling Design").
//!
//! Mirrors `kube_runtime::controller::Error` / `kube_runtime::finalizer::Error`'s
//! shape: a thiserror enum per concern, composed into one umbrella
//! `EngineError` for the reconciler's fallible operations.

use thiserror::Error;

use crate::WantId;

/// Malformed want/agent/capability input; raised at `Add` time. The
/// offending want is rejected; the engine continues (spec.md §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("config error for {want_id}: {reason}")]
pub struct ConfigError {
    pub want_id: WantId,
    pub reason: String,
}

/// Selector evaluation produced an inconsistent or illegal edge; the
/// affected want transitions to `failed` (spec.md §7, §4.2 "Failure
/// semantics").
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("resolution error for {want_id}: {reason}")]
pub struct ResolutionError {
    pub want_id: WantId,
    pub reason: String,
}

/// Send on a closed channel, or receive on a dropped channel (spec.md §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel {channel_name} closed while consumer {consumer_id} was receiving")]
    EndOfStream {
        channel_name: String,
        consumer_id: WantId,
    },
    #[error("send on closed channel {channel_name} from {producer_id}")]
    SendOnClosed {
        channel_name: String,
        producer_id: WantId,
    },
}

/// Distinguishes retryable transport failures from explicit agent failures
/// (spec.md §7 "AgentError").
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("transport error invoking agent {agent_name} for want {want_id}: {reason}")]
    Transport {
        want_id: WantId,
        agent_name: String,
        reason: String,
    },
    #[error("agent {agent_name} reported failure for want {want_id}: {reason}")]
    AgentReported {
        want_id: WantId,
        agent_name: String,
        reason: String,
    },
}

impl AgentError {
    /// Transport errors are retryable under the agent's policy;
    /// agent-reported errors are not (spec.md §7).
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::Transport { .. })
    }
}

/// A child failed while its owner was waiting; the owner must decide (per
/// recipe) whether to fail or continue (spec.md §7, §4.5).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("child {child_id} failed while owner {owner_id} was waiting: {reason}")]
pub struct OwnerCascadeError {
    pub owner_id: WantId,
    pub child_id: WantId,
    pub reason: String,
}

/// A panic inside `Progress()` or an agent action was caught; the want
/// transitions to `failed` with the stack recorded (spec.md §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("panic in want {want_id}: {message}")]
pub struct PanicError {
    pub want_id: WantId,
    pub message: String,
}

/// Umbrella error for the reconciler's fallible operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    OwnerCascade(#[from] OwnerCascadeError),
    #[error(transparent)]
    Panic(#[from] PanicError),
    #[error("unknown want id {0}")]
    UnknownWant(WantId),
    #[error("want {0} already exists")]
    DuplicateWant(WantId),
}
