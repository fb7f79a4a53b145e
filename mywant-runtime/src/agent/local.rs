//! Local execution mode (spec.md §4.6): "The agent's action is invoked
//! directly in-process with a context and the want handle; it uses
//! `StageStateChange`... and `CommitStateChanges` to commit."

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use mywant_core::{AgentError, ParamValue, WantId};

use crate::want::Want;

/// What a local agent action sees: read access to the want's committed
/// state, and a staging area for its own writes that only becomes visible
/// once `CommitStateChanges` runs (spec.md §4.6). This mirrors `MergeState`'s
/// pending-then-committed shape but scoped to a single agent invocation
/// rather than a progress cycle.
pub struct LocalAgentContext<'a> {
    want: &'a Want,
    staged: Mutex<BTreeMap<String, ParamValue>>,
}

impl<'a> LocalAgentContext<'a> {
    fn new(want: &'a Want) -> Self {
        Self {
            want,
            staged: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn want_id(&self) -> &str {
        &self.want.id
    }

    pub fn get_state(&self, key: &str) -> Option<ParamValue> {
        self.want.get_state(key)
    }

    /// `StageStateChange`: equivalent to `MergeState` for the duration of
    /// this call — visible to subsequent `stage_state_change`/`get_staged`
    /// calls within the same invocation, not yet on the want.
    pub fn stage_state_change(&self, key: impl Into<String>, value: impl Into<ParamValue>) {
        self.staged.lock().insert(key.into(), value.into());
    }

    fn commit(self) -> BTreeMap<String, ParamValue> {
        self.staged.into_inner()
    }
}

/// Domain-specific agent behavior for the local execution mode. Supplied by
/// the embedding application, analogous to [`crate::factory::WantLogic`]
/// (spec.md §1: individual agent actions are out of scope).
#[async_trait]
pub trait LocalAgentAction: Send + Sync {
    async fn run(&self, ctx: &LocalAgentContext<'_>) -> Result<(), AgentError>;
}

/// `typeName -> action` for agents registered in local mode, keyed by
/// [`mywant_core::Agent::name`].
#[derive(Default)]
pub struct LocalActionRegistry {
    actions: std::collections::HashMap<String, Arc<dyn LocalAgentAction>>,
}

impl LocalActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent_name: impl Into<String>, action: Arc<dyn LocalAgentAction>) {
        self.actions.insert(agent_name.into(), action);
    }

    pub fn get(&self, agent_name: &str) -> Option<Arc<dyn LocalAgentAction>> {
        self.actions.get(agent_name).cloned()
    }
}

/// Runs one local invocation: `CommitStateChanges` is just returning the
/// staged map, since the caller (the orchestrator) routes it through
/// `Want::merge_state`/`store_state` exactly like any other state delta
/// (spec.md §4.6: "merge their state deltas back into the want through the
/// same batching mechanism used by `Progress()`").
pub async fn invoke(action: &dyn LocalAgentAction, want: &Want) -> Result<BTreeMap<String, ParamValue>, AgentError> {
    let ctx = LocalAgentContext::new(want);
    action.run(&ctx).await?;
    Ok(ctx.commit())
}

pub fn unknown_agent_error(want_id: &WantId, agent_name: &str) -> AgentError {
    AgentError::Transport {
        want_id: want_id.clone(),
        agent_name: agent_name.to_string(),
        reason: "no local action registered for this agent".to_string(),
    }
}
