//! Agent orchestrator (spec.md §4.6): capability-to-agent matching, the
//! three execution modes, and the background ticker tasks Poll/Think agents
//! run as.

pub mod local;
pub mod retry;
pub mod rpc;
pub mod webhook;

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::warn;

use mywant_core::{Agent, AgentError, AgentExecutionStatus, AgentKind, Capability, HistorySource, ParamValue, RuntimeMode};

use crate::metrics::Metrics;
use crate::util::{panic_message, CancelableJoinHandle};
use crate::want::Want;

use local::{LocalActionRegistry, LocalAgentAction};
use retry::RetryExecutor;
use webhook::{ExecuteRequest, MonitorRequest, WebhookTransport};

/// `{name, gives}` pairs plus the agents that declare them, in registration
/// order (spec.md §4.6 "Matching and priority": "Ties are broken by agent
/// priority (higher first), then registration order").
#[derive(Default)]
pub struct AgentRegistry {
    agents: Vec<Agent>,
    capabilities: Vec<Capability>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_agent(&mut self, agent: Agent) {
        self.agents.push(agent);
    }

    pub fn register_capability(&mut self, capability: Capability) {
        self.capabilities.push(capability);
    }

    /// Agents able to satisfy `requirement`, ordered by priority descending
    /// with registration order as the tiebreak (a stable sort over an
    /// already-registration-ordered vec achieves this directly).
    pub fn candidates_for(&self, requirement: &str) -> Vec<&Agent> {
        let granting: std::collections::HashSet<&str> = self
            .capabilities
            .iter()
            .filter(|c| c.gives.iter().any(|g| g == requirement))
            .map(|c| c.name.as_str())
            .collect();
        let mut matches: Vec<&Agent> = self
            .agents
            .iter()
            .filter(|a| a.capabilities.iter().any(|c| granting.contains(c.as_str())))
            .collect();
        matches.sort_by(|a, b| b.priority.cmp(&a.priority));
        matches
    }

    pub fn best_candidate(&self, requirement: &str, kind: AgentKind) -> Option<&Agent> {
        self.candidates_for(requirement).into_iter().find(|a| a.kind == kind)
    }
}

/// Everything the orchestrator needs to actually run an agent, supplied by
/// the embedding application (spec.md §1: individual agent actions are out
/// of scope; only the contract is specified).
pub struct AgentOrchestrator {
    registry: AgentRegistry,
    local_actions: LocalActionRegistry,
    webhook: WebhookTransport,
    metrics: Arc<Metrics>,
    /// This engine's own `/agents/callback` URL, handed to Monitor agents
    /// dispatched over Webhook so the external service knows where to POST
    /// deltas back (spec.md §4.6). `None` means Monitor-over-Webhook
    /// dispatch is refused rather than silently dropped.
    callback_url: Option<String>,
}

impl AgentOrchestrator {
    pub fn new(registry: AgentRegistry, local_actions: LocalActionRegistry, metrics: Arc<Metrics>) -> Self {
        Self {
            registry,
            local_actions,
            webhook: WebhookTransport::new(),
            metrics,
            callback_url: None,
        }
    }

    /// Sets the callback URL Monitor/Webhook dispatch advertises to the
    /// external agent service (spec.md §4.6).
    pub fn with_callback_url(mut self, callback_url: impl Into<String>) -> Self {
        self.callback_url = Some(callback_url.into());
        self
    }

    /// Exposed for the executor's want-init registration pass (spec.md
    /// §4.6: Poll/Think are "registered via `AddBackgroundAgent()` at want
    /// init", matched the same way Do/Monitor are at dispatch time).
    pub fn candidate(&self, requirement: &str, kind: AgentKind) -> Option<Agent> {
        self.registry.best_candidate(requirement, kind).cloned()
    }

    fn record_metric(&self, kind: AgentKind) {
        match kind {
            AgentKind::Do => self.metrics.agent_executions_do.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            AgentKind::Monitor => self
                .metrics
                .agent_executions_monitor
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            AgentKind::Poll => self.metrics.agent_executions_poll.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            AgentKind::Think => self.metrics.agent_executions_think.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        };
    }

    /// Invokes `agent` once, catching any panic raised inside the agent
    /// action or transport call and turning it into an `AgentReported` error
    /// instead of letting it unwind through the caller (spec.md §7: "any
    /// panic inside `Progress()` or an agent action is caught").
    async fn invoke_once(&self, agent: &Agent, want: &Want) -> Result<BTreeMap<String, ParamValue>, AgentError> {
        match AssertUnwindSafe(self.invoke_once_inner(agent, want)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(AgentError::AgentReported {
                want_id: want.id.clone(),
                agent_name: agent.name.clone(),
                reason: panic_message(payload),
            }),
        }
    }

    /// Monitor agents dispatched over Webhook use the GET-state -> POST
    /// `/agents/monitor/execute` -> async `/agents/callback` flow (spec.md
    /// §4.6) rather than the synchronous Do-style request; every other
    /// kind/transport combination is a single request/response round trip.
    async fn invoke_once_inner(&self, agent: &Agent, want: &Want) -> Result<BTreeMap<String, ParamValue>, AgentError> {
        match &agent.runtime {
            RuntimeMode::Local => {
                let action = self
                    .local_actions
                    .get(&agent.name)
                    .ok_or_else(|| local::unknown_agent_error(&want.id, &agent.name))?;
                local::invoke(action.as_ref(), want).await
            }
            RuntimeMode::Webhook { endpoint, auth_token } if agent.kind == AgentKind::Monitor => {
                let callback_url = self.callback_url.clone().ok_or_else(|| AgentError::AgentReported {
                    want_id: want.id.clone(),
                    agent_name: agent.name.clone(),
                    reason: "no webhook callback URL configured for monitor agents".to_string(),
                })?;
                let request = MonitorRequest {
                    want_id: want.id.clone(),
                    agent_name: agent.name.clone(),
                    want_state: want.state_snapshot(),
                    callback_url,
                };
                self.webhook.start_monitor(endpoint, auth_token, &request).await?;
                // Deltas arrive later via `/agents/callback`, applied through
                // `apply_monitor_callback`; this dispatch itself carries none.
                Ok(BTreeMap::new())
            }
            RuntimeMode::Webhook { endpoint, auth_token } => {
                let request = ExecuteRequest {
                    want_id: want.id.clone(),
                    agent_name: agent.name.clone(),
                    want_state: want.state_snapshot(),
                    callback_url: None,
                    timeout_ms: 30_000,
                };
                self.webhook
                    .execute_do(endpoint, auth_token, &request, Duration::from_millis(30_000))
                    .await
            }
            RuntimeMode::Rpc { endpoint, auth_token } => {
                let transport = rpc::RpcTransport::new(auth_token.clone());
                transport
                    .execute_do(endpoint, &want.id, &agent.name, &want.state_snapshot(), Duration::from_millis(30_000))
                    .await
            }
        }
    }

    /// One requirement's Do-agent dispatch, with retry under the agent's
    /// policy (spec.md §4.6: "Single batch applied before the cycle ends").
    /// Returns the merged deltas so the caller can fold them into the
    /// current progress cycle via `Want::merge_state`.
    pub async fn dispatch_do(&self, want: &Want, requirement: &str) -> Result<BTreeMap<String, ParamValue>, AgentError> {
        let Some(agent) = self.registry.best_candidate(requirement, AgentKind::Do).cloned() else {
            return Ok(BTreeMap::new());
        };
        self.record_metric(AgentKind::Do);
        let start = now_millis();
        let execution_id = want.agent_execution_start(&agent.name, mode_label(&agent.runtime), start, requirement);

        let executor = RetryExecutor::new(agent.retry.clone());
        let result = executor.run(|| self.invoke_once(&agent, want)).await;

        let end = now_millis();
        match &result {
            Ok(_) => want.agent_execution_end(execution_id, end, AgentExecutionStatus::Succeeded, None),
            Err(e) => want.agent_execution_end(execution_id, end, AgentExecutionStatus::Failed, Some(e.to_string())),
        }
        result
    }

    /// Runs every Do-required capability for this cycle and merges deltas
    /// via `MergeState`, matching `Progress()`'s own batching (spec.md
    /// §4.6). An `AgentReported` failure fails the want (spec.md §7); a
    /// `Transport` failure exhausting retries does too, since Do is
    /// synchronous and has no further recourse inside this cycle.
    pub async fn execute_do_agents(&self, want: &Want, requirements: &[String]) -> Result<(), AgentError> {
        for requirement in requirements {
            let deltas = self.dispatch_do(want, requirement).await?;
            if !deltas.is_empty() {
                want.merge_state(deltas);
            }
        }
        Ok(())
    }

    /// Monitor-mode dispatch (spec.md §4.6: "Asynchronous; runs in its own
    /// task... Writes via `MergeState` over the want's lifetime"). Spawns
    /// one task per requirement matched to a Monitor agent; the caller keeps
    /// the returned handles alive for the want's lifetime.
    pub fn spawn_monitor_agents(
        self: &Arc<Self>,
        want: Arc<Want>,
        requirements: &[String],
        runtime: &Handle,
    ) -> Vec<CancelableJoinHandle<()>> {
        let mut handles = Vec::new();
        for requirement in requirements {
            let Some(agent) = self.registry.best_candidate(requirement, AgentKind::Monitor).cloned() else {
                continue;
            };
            let orchestrator = Arc::clone(self);
            let want = Arc::clone(&want);
            handles.push(CancelableJoinHandle::spawn(
                async move {
                    let start = now_millis();
                    let id = want.agent_execution_start(&agent.name, mode_label(&agent.runtime), start, &agent.name);
                    match orchestrator.invoke_once(&agent, &want).await {
                        Ok(deltas) => {
                            want.commit_agent_delta(deltas, now_millis(), HistorySource::Agent(agent.name.clone()));
                            want.agent_execution_end(id, now_millis(), AgentExecutionStatus::Succeeded, None);
                        }
                        Err(err) => {
                            warn!(agent = %agent.name, want = %want.id, error = %err, "monitor agent failed");
                            want.agent_execution_end(id, now_millis(), AgentExecutionStatus::Failed, Some(err.to_string()));
                        }
                    }
                },
                runtime,
            ));
        }
        handles
    }

    /// Applies a Monitor-mode webhook callback's state deltas as their own
    /// history entry tagged `HistorySource::Agent(agent_name)` (spec.md §8.9
    /// "Agent state round-trip"). Callers are responsible for having already
    /// authenticated the callback and confirmed the want is alive and
    /// non-terminal (spec.md §4.6 "Callback security").
    pub fn apply_monitor_callback(&self, want: &Want, agent_name: &str, updates: BTreeMap<String, ParamValue>) {
        want.commit_agent_delta(updates, now_millis(), HistorySource::Agent(agent_name.to_string()));
    }
}

fn mode_label(runtime: &RuntimeMode) -> &'static str {
    match runtime {
        RuntimeMode::Local => "local",
        RuntimeMode::Webhook { .. } => "webhook",
        RuntimeMode::Rpc { .. } => "rpc",
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A running Poll/Think background agent (spec.md §4.6: "Registered via
/// `AddBackgroundAgent()` at want init... Persistent task with explicit stop
/// signal"). Dropping it cancels the task immediately, mid-tick included.
pub struct BackgroundAgentHandle {
    stop: Arc<Notify>,
    flush: Arc<Notify>,
    flushed: Arc<Notify>,
    _task: CancelableJoinHandle<()>,
}

impl BackgroundAgentHandle {
    /// Stops the agent at the next tick boundary without running one more.
    pub fn request_stop(&self) {
        self.stop.notify_one();
    }

    /// Think agents are flushed (run once more, synchronously awaited) before
    /// being stopped, so an in-flight delta is not lost (spec.md §4.6). The
    /// task itself signals `flushed` once its extra tick has committed, so
    /// this does not return until that commit has happened.
    pub async fn flush_then_stop(&self) {
        self.flush.notify_one();
        self.flushed.notified().await;
        self.stop.notify_one();
    }
}

impl AgentOrchestrator {
    /// Spawns a Poll agent: ticks at its configured interval, merging state
    /// until stopped. No parent access (that's Think-only).
    pub fn spawn_poll_agent(self: &Arc<Self>, want: Arc<Want>, agent: Agent, runtime: &Handle) -> BackgroundAgentHandle {
        let stop = Arc::new(Notify::new());
        let flush = Arc::new(Notify::new());
        let flushed = Arc::new(Notify::new());
        let orchestrator = Arc::clone(self);
        let stop_rx = Arc::clone(&stop);
        let flush_rx = Arc::clone(&flush);
        let flushed_tx = Arc::clone(&flushed);
        let interval_ms = agent.effective_interval_millis();
        let task = CancelableJoinHandle::spawn(
            async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            orchestrator.record_metric(AgentKind::Poll);
                            if let Ok(deltas) = orchestrator.invoke_once(&agent, &want).await {
                                want.commit_agent_delta(deltas, now_millis(), HistorySource::Agent(agent.name.clone()));
                            }
                        }
                        _ = flush_rx.notified() => {
                            if let Ok(deltas) = orchestrator.invoke_once(&agent, &want).await {
                                want.commit_agent_delta(deltas, now_millis(), HistorySource::Agent(agent.name.clone()));
                            }
                            flushed_tx.notify_one();
                            break;
                        }
                        _ = stop_rx.notified() => break,
                    }
                }
            },
            runtime,
        );
        BackgroundAgentHandle { stop, flush, flushed, _task: task }
    }

    /// Spawns a Think agent: periodic ticker (spec.md default 2s) with
    /// read/write access to both its own want's state and its parent's
    /// (spec.md §4.6 "`GetParentState`/`MergeParentState`").
    pub fn spawn_think_agent(
        self: &Arc<Self>,
        want: Arc<Want>,
        parent: Option<Arc<Want>>,
        agent: Agent,
        runtime: &Handle,
    ) -> BackgroundAgentHandle {
        let stop = Arc::new(Notify::new());
        let flush = Arc::new(Notify::new());
        let flushed = Arc::new(Notify::new());
        let orchestrator = Arc::clone(self);
        let stop_rx = Arc::clone(&stop);
        let flush_rx = Arc::clone(&flush);
        let flushed_tx = Arc::clone(&flushed);
        let interval_ms = agent.effective_interval_millis();
        let task = CancelableJoinHandle::spawn(
            async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                let tick = |orchestrator: Arc<AgentOrchestrator>, want: Arc<Want>, parent: Option<Arc<Want>>, agent: Agent| async move {
                    orchestrator.record_metric(AgentKind::Think);
                    if let Ok(deltas) = orchestrator.invoke_once(&agent, &want).await {
                        if let Some(parent) = &parent {
                            parent.commit_agent_delta(deltas.clone(), now_millis(), HistorySource::Agent(agent.name.clone()));
                        }
                        want.commit_agent_delta(deltas, now_millis(), HistorySource::Agent(agent.name));
                    }
                };
                loop {
                    tokio::select! {
                        _ = ticker.tick() => tick(Arc::clone(&orchestrator), Arc::clone(&want), parent.clone(), agent.clone()).await,
                        _ = flush_rx.notified() => {
                            tick(Arc::clone(&orchestrator), Arc::clone(&want), parent.clone(), agent.clone()).await;
                            flushed_tx.notify_one();
                            break;
                        }
                        _ = stop_rx.notified() => break,
                    }
                }
            },
            runtime,
        );
        BackgroundAgentHandle { stop, flush, flushed, _task: task }
    }
}
