//! Agent, capability and agent-execution-history types (spec.md §3 "Agent",
//! "Capability", "AgentExecution record", §4.6).

use serde::{Deserialize, Serialize};

/// The four agent kinds and their scheduling contracts (spec.md §4.6 table).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Synchronous; blocks the progress cycle until completion.
    Do,
    /// Asynchronous; runs in its own task for the want's lifetime.
    Monitor,
    /// Persistent task with an explicit stop signal, registered at want init.
    Poll,
    /// Periodic ticker (default 2s); reads/writes its own state and the
    /// parent want's state; flushed synchronously before being stopped.
    Think,
}

/// How an agent's action is actually invoked (spec.md §4.6 "Execution
/// modes").
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RuntimeMode {
    /// Invoked directly in-process.
    Local,
    /// POSTed to an external HTTP service; bearer-token auth.
    Webhook { endpoint: String, auth_token: Option<String> },
    /// gRPC/JSON-RPC transport, semantically equivalent to Webhook.
    Rpc { endpoint: String, auth_token: Option<String> },
}

/// Retry/backoff policy for one agent (spec.md §4.6 "Retry and timeout
/// policy").
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval_millis: u64,
    pub multiplier: f64,
    pub max_interval_millis: u64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval_millis: 200,
            multiplier: 2.0,
            max_interval_millis: 10_000,
            jitter: true,
        }
    }
}

/// A named bundle of services an agent provides (spec.md §3 "Capability").
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Capability {
    pub name: String,
    pub gives: Vec<String>,
}

/// `{name, type, capabilities, runtime, priority}` (spec.md §3 "Agent").
/// Identity = `name`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Agent {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AgentKind,
    pub capabilities: Vec<String>,
    pub runtime: RuntimeMode,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Tick interval for Poll/Think agents; `None` uses the kind's default
    /// (30s for Poll/Monitor, 2s for Think — spec.md §9 Open Question,
    /// resolved in SPEC_FULL.md §13).
    #[serde(default)]
    pub interval_millis: Option<u64>,
}

impl Agent {
    pub fn default_interval_millis(kind: AgentKind) -> u64 {
        match kind {
            AgentKind::Think => 2_000,
            _ => 30_000,
        }
    }

    pub fn effective_interval_millis(&self) -> u64 {
        self.interval_millis
            .unwrap_or_else(|| Self::default_interval_millis(self.kind))
    }
}

/// Appended to a want's history whenever an agent starts/ends (spec.md §3
/// "AgentExecution record").
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct AgentExecution {
    /// Assigned by the owning want; stable across eviction so an in-flight
    /// execution can be found and closed out even if the log has rotated.
    pub id: u64,
    pub agent_name: String,
    pub mode: String,
    pub start_time_millis: u64,
    pub end_time_millis: Option<u64>,
    pub status: AgentExecutionStatus,
    pub activity: String,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentExecutionStatus {
    Running,
    Succeeded,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn think_agents_default_to_2s() {
        assert_eq!(Agent::default_interval_millis(AgentKind::Think), 2_000);
        assert_eq!(Agent::default_interval_millis(AgentKind::Poll), 30_000);
        assert_eq!(Agent::default_interval_millis(AgentKind::Monitor), 30_000);
    }
}
