//! Per-want cooperative execution task (spec.md §4.4).
//!
//! One lightweight task per scheduled want, repeating the progress cycle
//! (`BeginProgressCycle` → agent dispatch → `Progress()` → `EndProgressCycle`)
//! until the want is achieved, fails, or an explicit stop is requested.
//! Mirrors the shape of `kube_runtime::Controller`'s per-object reconcile
//! loop, but scheduling is per-want rather than per-event.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::runtime::Handle;
use tracing::{info, info_span, warn, Instrument};

use mywant_core::{AgentKind, EngineError, HistorySource, PanicError, WantStatus};

use crate::agent::{AgentOrchestrator, BackgroundAgentHandle};
use crate::channel::{ChannelFabric, ChannelReceiver};
use crate::events::{SubscriptionBus, WantEvent};
use crate::factory::WantLogic;
use crate::metrics::Metrics;
use crate::progress::{OwnerHandle, ProgressContext, StepOutcome};
use crate::util::{panic_message, CancelableJoinHandle};
use crate::want::Want;

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Kind-tagged so shutdown knows which background agents to flush (Think)
/// versus simply stop (Poll) (spec.md §4.6: "on achieve, each think agent is
/// flushed... before being stopped").
struct Background {
    kind: AgentKind,
    handle: BackgroundAgentHandle,
}

/// Registers, at want init, every Poll/Think agent matched against
/// `spec.requires` (spec.md §4.6: "Registered via `AddBackgroundAgent()` at
/// want init"). Do is dispatched per-cycle instead, from `run_one_cycle`.
fn spawn_background_agents(
    want: &Arc<Want>,
    agents: &Arc<AgentOrchestrator>,
    parent: Option<Arc<Want>>,
    runtime: &Handle,
) -> Vec<Background> {
    let spec = want.spec();
    let mut background = Vec::new();
    for requirement in &spec.requires {
        if let Some(agent) = agents.candidate(requirement, AgentKind::Poll) {
            let handle = agents.spawn_poll_agent(Arc::clone(want), agent, runtime);
            background.push(Background {
                kind: AgentKind::Poll,
                handle,
            });
        }
        if let Some(agent) = agents.candidate(requirement, AgentKind::Think) {
            let handle = agents.spawn_think_agent(Arc::clone(want), parent.clone(), agent, runtime);
            background.push(Background {
                kind: AgentKind::Think,
                handle,
            });
        }
    }
    background
}

/// Monitor agents are also registered at want init (spec.md §4.6: "runs in
/// its own task... writes via `MergeState` over the want's lifetime"), but
/// keep their own handle type (no flush/stop signal — Local mode dispatches
/// once, Webhook mode hands off to `start_monitor` and the later callback),
/// so they are tracked separately from Poll/Think.
fn spawn_monitor_agents(want: &Arc<Want>, agents: &Arc<AgentOrchestrator>, runtime: &Handle) -> Vec<CancelableJoinHandle<()>> {
    let spec = want.spec();
    agents.spawn_monitor_agents(Arc::clone(want), &spec.requires, runtime)
}

/// An achieved producer closes every outbound channel it still owns (spec.md
/// §3 "Channel... closed when either endpoint is removed or the producer
/// reports achieved"), so consumers downstream observe end-of-stream instead
/// of hanging on a `recv` that will never be answered.
fn close_outbound_channels<P: Send + 'static>(want: &Want, fabric: &ChannelFabric<P>) {
    for entry in want.paths_out().entries() {
        fabric.close(&want.id, &entry.peer_id, entry.source);
    }
}

/// Runs `fut` with a panic barrier around it (spec.md §7: "any panic inside
/// `Progress()` or an agent action is caught; the want → failed with the
/// stack recorded"). A caught panic is reported as `EngineError::Panic`
/// rather than unwinding into the executor task and taking the whole
/// cooperative loop down with it.
async fn catch_panic<F, T, E>(want_id: &str, fut: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, E>>,
    EngineError: From<E>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result.map_err(EngineError::from),
        Err(payload) => Err(EngineError::Panic(PanicError {
            want_id: want_id.to_string(),
            message: panic_message(payload),
        })),
    }
}

async fn shut_down_background(background: Vec<Background>, flush_think: bool) {
    for entry in background {
        if flush_think && entry.kind == AgentKind::Think {
            entry.handle.flush_then_stop().await;
        } else {
            entry.handle.request_stop();
        }
    }
}

/// One progress cycle's agent-dispatch-then-`Progress()` body (spec.md §4.4
/// step 3, §4.6 "Dispatch order"). Returns the step outcome or the first
/// error encountered; the caller is responsible for `EndProgressCycle` and
/// status bookkeeping around this call.
async fn run_one_cycle<P: Send + Sync + 'static>(
    want: &Arc<Want>,
    fabric: &ChannelFabric<P>,
    logic: &Arc<dyn WantLogic<P>>,
    agents: &Arc<AgentOrchestrator>,
    owner: Option<&OwnerHandle>,
    receivers: &mut HashMap<String, ChannelReceiver<P>>,
) -> Result<StepOutcome, EngineError> {
    let spec = want.spec();
    if !spec.requires.is_empty() {
        want.transition_status(WantStatus::PrepareAgent);
        want.transition_status(WantStatus::Executing);
        catch_panic(&want.id, agents.execute_do_agents(want, &spec.requires)).await?;
        want.transition_status(WantStatus::Reaching);
    }

    let mut ctx = ProgressContext::new(want, fabric, receivers);
    if let Some(owner) = owner {
        ctx = ctx.with_owner(owner.clone());
    }
    catch_panic(&want.id, logic.progress(&mut ctx)).await
}

/// The cooperative task body: repeats progress cycles until a terminal
/// outcome, honoring suspend/resume and stop requests between cycles
/// (spec.md §5 "Suspension points... between cycles").
async fn run<P: Send + Sync + 'static>(
    want: Arc<Want>,
    fabric: Arc<ChannelFabric<P>>,
    logic: Arc<dyn WantLogic<P>>,
    agents: Arc<AgentOrchestrator>,
    bus: SubscriptionBus,
    metrics: Arc<Metrics>,
    owner: Option<OwnerHandle>,
    background: Vec<Background>,
    _monitors: Vec<CancelableJoinHandle<()>>,
) {
    let mut receivers: HashMap<String, ChannelReceiver<P>> = HashMap::new();
    want.transition_status(WantStatus::Reaching);

    loop {
        while want.is_suspended() {
            tokio::select! {
                _ = want.wait_resume() => {}
                _ = want.wait_stop() => {}
            }
        }
        if want.stop_requested() || want.status().is_terminal() {
            break;
        }

        let cycle_id = want.begin_progress_cycle();
        let span = info_span!("progress_cycle", want_id = %want.id, want_type = %want.type_name, cycle_id);
        let outcome = run_one_cycle(&want, &fabric, &logic, &agents, owner.as_ref(), &mut receivers)
            .instrument(span)
            .await;

        match outcome {
            Ok(StepOutcome::Continue) => {
                if want.end_progress_cycle(cycle_id, now_millis(), HistorySource::Progress).is_some() {
                    bus.emit(WantEvent::StateChanged {
                        id: want.id.clone(),
                        diff_keys: Vec::new(),
                    })
                    .await;
                }
                metrics.progress_cycle_completed();
            }
            Ok(StepOutcome::Achieved) => {
                want.transition_status(WantStatus::Achieved);
                want.end_progress_cycle(cycle_id, now_millis(), HistorySource::Progress);
                metrics.progress_cycle_completed();
                info!(want = %want.id, "want achieved");
                close_outbound_channels(&want, &fabric);
                bus.emit(WantEvent::Achieved { id: want.id.clone() }).await;
                shut_down_background(background, true).await;
                return;
            }
            Ok(StepOutcome::Failed) => {
                want.end_progress_cycle(cycle_id, now_millis(), HistorySource::Progress);
                let reason = want
                    .get_state("error")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "want logic reported failure".to_string());
                want.fail(reason.clone());
                warn!(want = %want.id, %reason, "want failed");
                bus.emit(WantEvent::Failed {
                    id: want.id.clone(),
                    reason,
                })
                .await;
                shut_down_background(background, false).await;
                return;
            }
            Err(err) => {
                want.end_progress_cycle(cycle_id, now_millis(), HistorySource::Progress);
                let reason = err.to_string();
                want.fail(reason.clone());
                warn!(want = %want.id, error = %err, "progress cycle errored");
                bus.emit(WantEvent::Failed {
                    id: want.id.clone(),
                    reason,
                })
                .await;
                shut_down_background(background, false).await;
                return;
            }
        }
    }
    shut_down_background(background, false).await;
}

/// Owns the running task plus any Poll/Think background agents registered
/// for this want. Dropping it aborts everything immediately (the scheduler's
/// cascade-delete path, spec.md §4.5 "Cascade deletion").
pub struct ExecutorHandle {
    _task: CancelableJoinHandle<()>,
}

impl ExecutorHandle {
    /// Requests a clean stop: the current cycle finishes, then the loop
    /// exits and background agents are stopped (flushing Think agents only
    /// on the achieved path, per spec.md §4.6).
    pub fn request_stop(&self, want: &Want) {
        want.request_stop();
    }
}

/// Spawns the cooperative task for `want` (spec.md §4.4 "Run exactly one
/// cooperative task per scheduled want").
#[allow(clippy::too_many_arguments)]
pub fn spawn<P: Send + Sync + 'static>(
    want: Arc<Want>,
    fabric: Arc<ChannelFabric<P>>,
    logic: Arc<dyn WantLogic<P>>,
    agents: Arc<AgentOrchestrator>,
    bus: SubscriptionBus,
    metrics: Arc<Metrics>,
    owner: Option<OwnerHandle>,
    parent: Option<Arc<Want>>,
    runtime: &Handle,
) -> ExecutorHandle {
    let background = spawn_background_agents(&want, &agents, parent, runtime);
    let monitors = spawn_monitor_agents(&want, &agents, runtime);
    let task = CancelableJoinHandle::spawn(run(want, fabric, logic, agents, bus, metrics, owner, background, monitors), runtime);
    ExecutorHandle { _task: task }
}
