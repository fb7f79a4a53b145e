//! End-to-end seed scenarios driven through the public [`Engine`] handle
//! (spec.md §8): real `EngineBuilder`, real reconciler/resolver/executor,
//! fake want logics standing in for the domain wants the engine itself is
//! agnostic to. Mirrors how `kube_runtime::Controller` integration tests
//! drive a controller against a fake API server rather than mocking its
//! internals.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;

use mywant_core::{
    Agent, AgentKind, Capability, ConfigError, EngineError, ParamValue, RetryPolicy, RuntimeMode, Selector, WantMeta, WantSpec, WantStatus,
};
use mywant_runtime::agent::local::{LocalAgentAction, LocalAgentContext};
use mywant_runtime::factory::{WantLogic, WantLogicFactory};
use mywant_runtime::progress::{ProgressContext, StepOutcome};
use mywant_runtime::{ChildWantSpec, Engine, EngineBuilder, EngineConfig, StaticRecipeLoader, WantEvent};

async fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration, what: &str) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met in time: {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_status(engine: &Engine<i32>, id: &str, target: WantStatus) {
    wait_until(
        || engine.get(id).map(|s| s.status == target).unwrap_or(false),
        Duration::from_secs(5),
        &format!("{id} to reach {target:?}"),
    )
    .await;
}

/// Emits one item per cycle from a fixed list, gated by a shared counter so
/// tests can pace production (spec.md §8 S2: "after A has produced 1
/// message"). Idles (no send) while there are no output peers yet or the
/// gate hasn't been raised, rather than dropping the item.
struct SourceLogic {
    items: Vec<i32>,
    limit: Arc<AtomicUsize>,
}

impl SourceLogic {
    fn new(items: Vec<i32>) -> Self {
        Self {
            items,
            limit: Arc::new(AtomicUsize::new(usize::MAX)),
        }
    }

    fn gated(items: Vec<i32>, limit: Arc<AtomicUsize>) -> Self {
        Self { items, limit }
    }
}

#[async_trait]
impl WantLogic<i32> for SourceLogic {
    async fn progress(&self, ctx: &mut ProgressContext<'_, i32>) -> Result<StepOutcome, EngineError> {
        let sent = ctx.get_state("sent").and_then(|v| v.as_num()).unwrap_or(0.0) as usize;
        if sent >= self.items.len() {
            return Ok(StepOutcome::Achieved);
        }
        let peers = ctx.output_peers();
        let allowed = self.limit.load(Ordering::SeqCst);
        if peers.is_empty() || sent >= allowed {
            tokio::time::sleep(Duration::from_millis(2)).await;
            return Ok(StepOutcome::Continue);
        }
        let item = self.items[sent];
        for peer in &peers {
            ctx.send(peer, item).await?;
        }
        ctx.store_state("sent", (sent + 1) as f64);
        if sent + 1 >= self.items.len() {
            Ok(StepOutcome::Achieved)
        } else {
            Ok(StepOutcome::Continue)
        }
    }
}

/// Forwards whatever it receives from its one input peer to every output
/// peer, optionally also collecting it (a sink is just a relay with no
/// output peers and a collector). Achieves on end-of-stream.
///
/// A forwarding relay waits for at least one output peer before it starts
/// draining its input: otherwise an item received before a downstream
/// consumer is wired up would have nowhere to go and be dropped. A pure sink
/// has no such downstream, so it drains as soon as it has an input peer.
struct RelayLogic {
    collector: Option<Arc<StdMutex<Vec<i32>>>>,
    requires_output_peer: bool,
}

impl RelayLogic {
    fn forwarding() -> Self {
        Self {
            collector: None,
            requires_output_peer: true,
        }
    }

    fn collecting(collector: Arc<StdMutex<Vec<i32>>>) -> Self {
        Self {
            collector: Some(collector),
            requires_output_peer: false,
        }
    }
}

#[async_trait]
impl WantLogic<i32> for RelayLogic {
    async fn progress(&self, ctx: &mut ProgressContext<'_, i32>) -> Result<StepOutcome, EngineError> {
        let Some(peer) = ctx.input_peers().into_iter().next() else {
            tokio::time::sleep(Duration::from_millis(2)).await;
            return Ok(StepOutcome::Continue);
        };
        let out_peers = ctx.output_peers();
        if self.requires_output_peer && out_peers.is_empty() {
            tokio::time::sleep(Duration::from_millis(2)).await;
            return Ok(StepOutcome::Continue);
        }
        match ctx.recv(&peer).await {
            Some(item) => {
                if let Some(collector) = &self.collector {
                    collector.lock().unwrap().push(item);
                }
                for out in &out_peers {
                    ctx.send(out, item).await?;
                }
                Ok(StepOutcome::Continue)
            }
            None => Ok(StepOutcome::Achieved),
        }
    }
}

/// Achieves on its very first cycle (spec.md §8 S3: "`X` achieves immediately
/// on start").
struct ImmediateLogic;

#[async_trait]
impl WantLogic<i32> for ImmediateLogic {
    async fn progress(&self, ctx: &mut ProgressContext<'_, i32>) -> Result<StepOutcome, EngineError> {
        ctx.store_state("ran", true);
        Ok(StepOutcome::Achieved)
    }
}

/// A target want: materialises its recipe's children once, then blocks on
/// their completion (spec.md §4.5 steps 1, 5). The recipe path is read from
/// `spec.recipe_path` at factory-build time, so the same logic serves both a
/// top-level target and a nested one.
struct TargetLogic {
    recipe_path: String,
}

#[async_trait]
impl WantLogic<i32> for TargetLogic {
    async fn progress(&self, ctx: &mut ProgressContext<'_, i32>) -> Result<StepOutcome, EngineError> {
        if ctx.get_state("children_created").is_none() {
            ctx.create_children(&self.recipe_path, &BTreeMap::new())?;
            ctx.store_state("children_created", true);
        }
        match ctx.wait_children_done().await {
            Ok(()) => Ok(StepOutcome::Achieved),
            Err((child_id, reason)) => {
                ctx.store_state("error", format!("{child_id}: {reason}"));
                Ok(StepOutcome::Failed)
            }
        }
    }
}

fn target_factory() -> WantLogicFactory<i32> {
    Arc::new(|meta, spec| {
        let recipe_path = spec.recipe_path.clone().ok_or_else(|| {
            EngineError::Config(ConfigError {
                want_id: meta.id.clone(),
                reason: "target want requires spec.recipe_path".to_string(),
            })
        })?;
        Ok(Arc::new(TargetLogic { recipe_path }) as Arc<dyn WantLogic<i32>>)
    })
}

/// Sends a fixed item to a hardcoded peer id every cycle, regardless of
/// whether the resolver currently considers that peer connected (spec.md §8
/// S7: "any attempted send to a closed channel is reported as ChannelError to
/// its sender"). Never achieves on its own.
struct FeederLogic {
    peer: String,
}

#[async_trait]
impl WantLogic<i32> for FeederLogic {
    async fn progress(&self, ctx: &mut ProgressContext<'_, i32>) -> Result<StepOutcome, EngineError> {
        match ctx.send(&self.peer, 1).await {
            Ok(()) => ctx.store_state("last_result", "ok"),
            Err(err) => ctx.store_state("last_result", err.to_string()),
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(StepOutcome::Continue)
    }
}

/// Receives from its one input peer forever, never achieving on its own
/// (spec.md §8 S7: "`X` is mid-cycle" when its owner is deleted).
struct StallLogic;

#[async_trait]
impl WantLogic<i32> for StallLogic {
    async fn progress(&self, ctx: &mut ProgressContext<'_, i32>) -> Result<StepOutcome, EngineError> {
        let Some(peer) = ctx.input_peers().into_iter().next() else {
            tokio::time::sleep(Duration::from_millis(5)).await;
            return Ok(StepOutcome::Continue);
        };
        ctx.recv(&peer).await;
        Ok(StepOutcome::Continue)
    }
}

fn selector(key: &str, value: &str) -> Selector {
    Selector::from_iter(Some((key, value)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s1_linear_pipeline_delivers_messages_in_order() {
    let collected = Arc::new(StdMutex::new(Vec::new()));
    let engine: Engine<i32> = EngineBuilder::<i32>::new(Arc::new(StaticRecipeLoader::new()))
        .register_type("source", Arc::new(|_meta, _spec| Ok(Arc::new(SourceLogic::new(vec![1, 2, 3])) as Arc<dyn WantLogic<i32>>)))
        .register_type("relay", Arc::new(|_meta, _spec| Ok(Arc::new(RelayLogic::forwarding()) as Arc<dyn WantLogic<i32>>)))
        .register_type("sink", {
            let collected = Arc::clone(&collected);
            Arc::new(move |_meta, _spec| Ok(Arc::new(RelayLogic::collecting(Arc::clone(&collected))) as Arc<dyn WantLogic<i32>>))
        })
        .build(tokio::runtime::Handle::current())
        .unwrap();

    let mut a = WantMeta::new("a");
    a.labels.insert("role".to_string(), "src".to_string());
    engine.add(a, "source", WantSpec::default()).await.unwrap();

    let mut b = WantMeta::new("b");
    b.labels.insert("role".to_string(), "mid".to_string());
    let b_spec = WantSpec {
        using: vec![selector("role", "src")],
        ..Default::default()
    };
    engine.add(b, "relay", b_spec).await.unwrap();

    let c_spec = WantSpec {
        using: vec![selector("role", "mid")],
        ..Default::default()
    };
    engine.add(WantMeta::new("c"), "sink", c_spec).await.unwrap();

    wait_for_status(&engine, "a", WantStatus::Achieved).await;
    wait_for_status(&engine, "b", WantStatus::Achieved).await;
    wait_for_status(&engine, "c", WantStatus::Achieved).await;

    assert_eq!(*collected.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s2_fan_out_attaches_mid_stream() {
    let b_collected = Arc::new(StdMutex::new(Vec::new()));
    let b2_collected = Arc::new(StdMutex::new(Vec::new()));
    let limit = Arc::new(AtomicUsize::new(1));

    let engine: Engine<i32> = EngineBuilder::<i32>::new(Arc::new(StaticRecipeLoader::new()))
        .register_type("source", {
            let limit = Arc::clone(&limit);
            Arc::new(move |_meta, _spec| Ok(Arc::new(SourceLogic::gated(vec![1, 2, 3], Arc::clone(&limit))) as Arc<dyn WantLogic<i32>>))
        })
        .register_type("sink", {
            let b_collected = Arc::clone(&b_collected);
            Arc::new(move |_meta, _spec| Ok(Arc::new(RelayLogic::collecting(Arc::clone(&b_collected))) as Arc<dyn WantLogic<i32>>))
        })
        .register_type("sink2", {
            let b2_collected = Arc::clone(&b2_collected);
            Arc::new(move |_meta, _spec| Ok(Arc::new(RelayLogic::collecting(Arc::clone(&b2_collected))) as Arc<dyn WantLogic<i32>>))
        })
        .build(tokio::runtime::Handle::current())
        .unwrap();

    let mut a = WantMeta::new("a");
    a.labels.insert("role".to_string(), "src".to_string());
    engine.add(a, "source", WantSpec::default()).await.unwrap();

    let using_src = WantSpec {
        using: vec![selector("role", "src")],
        ..Default::default()
    };
    engine.add(WantMeta::new("b"), "sink", using_src.clone()).await.unwrap();

    wait_until(|| b_collected.lock().unwrap().len() >= 1, Duration::from_secs(5), "b to receive the first message").await;
    assert_eq!(*b_collected.lock().unwrap(), vec![1]);

    engine.add(WantMeta::new("b2"), "sink2", using_src).await.unwrap();
    limit.store(usize::MAX, Ordering::SeqCst);

    wait_for_status(&engine, "a", WantStatus::Achieved).await;
    wait_for_status(&engine, "b", WantStatus::Achieved).await;
    wait_for_status(&engine, "b2", WantStatus::Achieved).await;

    assert_eq!(*b_collected.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(*b2_collected.lock().unwrap(), vec![2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s3_owner_target_completes_when_child_achieves() {
    let recipes = StaticRecipeLoader::new().with_recipe(
        "s3-inner",
        vec![ChildWantSpec {
            id: "x".to_string(),
            type_name: "immediate".to_string(),
            labels: BTreeMap::new(),
            spec: WantSpec::default(),
        }],
    );

    let engine: Engine<i32> = EngineBuilder::<i32>::new(Arc::new(recipes))
        .register_type("target", target_factory())
        .register_type("immediate", Arc::new(|_meta, _spec| Ok(Arc::new(ImmediateLogic) as Arc<dyn WantLogic<i32>>)))
        .build(tokio::runtime::Handle::current())
        .unwrap();

    let mut events = engine.subscribe();
    let t_spec = WantSpec {
        recipe_path: Some("s3-inner".to_string()),
        ..Default::default()
    };
    engine.add(WantMeta::new("t"), "target", t_spec).await.unwrap();

    wait_for_status(&engine, "t", WantStatus::Achieved).await;
    wait_for_status(&engine, "x", WantStatus::Achieved).await;

    use futures::StreamExt;
    let mut saw_completion = false;
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(2), events.next()).await {
        if let WantEvent::OwnerCompletion { child_id, parent_id, failed } = event {
            assert_eq!(child_id, "x");
            assert_eq!(parent_id, "t");
            assert!(failed.is_none());
            saw_completion = true;
            break;
        }
    }
    assert!(saw_completion, "expected an OwnerCompletion event for x -> t");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s3_nested_owner_also_receives_completion_event() {
    let recipes = StaticRecipeLoader::new()
        .with_recipe(
            "s3-outer",
            vec![ChildWantSpec {
                id: "t".to_string(),
                type_name: "target".to_string(),
                labels: BTreeMap::new(),
                spec: WantSpec {
                    recipe_path: Some("s3-inner".to_string()),
                    ..Default::default()
                },
            }],
        )
        .with_recipe(
            "s3-inner",
            vec![ChildWantSpec {
                id: "x".to_string(),
                type_name: "immediate".to_string(),
                labels: BTreeMap::new(),
                spec: WantSpec::default(),
            }],
        );

    let engine: Engine<i32> = EngineBuilder::<i32>::new(Arc::new(recipes))
        .register_type("target", target_factory())
        .register_type("immediate", Arc::new(|_meta, _spec| Ok(Arc::new(ImmediateLogic) as Arc<dyn WantLogic<i32>>)))
        .build(tokio::runtime::Handle::current())
        .unwrap();

    let mut events = engine.subscribe();
    let u_spec = WantSpec {
        recipe_path: Some("s3-outer".to_string()),
        ..Default::default()
    };
    engine.add(WantMeta::new("u"), "target", u_spec).await.unwrap();

    wait_for_status(&engine, "u", WantStatus::Achieved).await;
    wait_for_status(&engine, "t", WantStatus::Achieved).await;
    wait_for_status(&engine, "x", WantStatus::Achieved).await;

    use futures::StreamExt;
    let mut saw_child_to_parent = false;
    let mut saw_parent_to_grandparent = false;
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(2), events.next()).await {
        if let WantEvent::OwnerCompletion { child_id, parent_id, .. } = event {
            if child_id == "x" && parent_id == "t" {
                saw_child_to_parent = true;
            }
            if child_id == "t" && parent_id == "u" {
                saw_parent_to_grandparent = true;
            }
        }
        if saw_child_to_parent && saw_parent_to_grandparent {
            break;
        }
    }
    assert!(saw_child_to_parent, "expected x -> t completion");
    assert!(saw_parent_to_grandparent, "expected t -> u completion");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s6_label_change_closes_the_channel_without_losing_in_flight_messages() {
    let collected = Arc::new(StdMutex::new(Vec::new()));
    let limit = Arc::new(AtomicUsize::new(2));

    let engine: Engine<i32> = EngineBuilder::<i32>::new(Arc::new(StaticRecipeLoader::new()))
        .register_type("source", {
            let limit = Arc::clone(&limit);
            Arc::new(move |_meta, _spec| Ok(Arc::new(SourceLogic::gated(vec![1, 2, 3, 4, 5], Arc::clone(&limit))) as Arc<dyn WantLogic<i32>>))
        })
        .register_type("sink", {
            let collected = Arc::clone(&collected);
            Arc::new(move |_meta, _spec| Ok(Arc::new(RelayLogic::collecting(Arc::clone(&collected))) as Arc<dyn WantLogic<i32>>))
        })
        .build(tokio::runtime::Handle::current())
        .unwrap();

    let mut a = WantMeta::new("a");
    a.labels.insert("role".to_string(), "src".to_string());
    engine.add(a, "source", WantSpec::default()).await.unwrap();

    let b_spec = WantSpec {
        using: vec![selector("role", "src")],
        ..Default::default()
    };
    engine.add(WantMeta::new("b"), "sink", b_spec).await.unwrap();

    wait_until(|| collected.lock().unwrap().len() >= 2, Duration::from_secs(5), "b to receive the first two messages").await;

    let mut relabeled = BTreeMap::new();
    relabeled.insert("role".to_string(), "src2".to_string());
    engine.update_labels("a", relabeled).await.unwrap();

    wait_for_status(&engine, "b", WantStatus::Achieved).await;
    let after_relabel = collected.lock().unwrap().clone();
    assert_eq!(after_relabel, vec![1, 2]);

    // Even though A is still willing to produce more, B has already achieved
    // and its channel is gone: nothing further can arrive.
    limit.store(usize::MAX, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*collected.lock().unwrap(), vec![1, 2]);
    assert_eq!(engine.get("b").unwrap().status, WantStatus::Achieved);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s7_cascade_delete_cancels_the_mid_cycle_child_and_closes_its_channels() {
    let recipes = StaticRecipeLoader::new().with_recipe(
        "s7-recipe",
        vec![ChildWantSpec {
            id: "x".to_string(),
            type_name: "stall".to_string(),
            labels: BTreeMap::new(),
            spec: WantSpec {
                using: vec![selector("role", "feeder")],
                ..Default::default()
            },
        }],
    );

    let engine: Engine<i32> = EngineBuilder::<i32>::new(Arc::new(recipes))
        .register_type("target", target_factory())
        .register_type("stall", Arc::new(|_meta, _spec| Ok(Arc::new(StallLogic) as Arc<dyn WantLogic<i32>>)))
        .register_type("feeder", Arc::new(|_meta, _spec| Ok(Arc::new(FeederLogic { peer: "x".to_string() }) as Arc<dyn WantLogic<i32>>)))
        .build(tokio::runtime::Handle::current())
        .unwrap();

    let mut y = WantMeta::new("y");
    y.labels.insert("role".to_string(), "feeder".to_string());
    engine.add(y, "feeder", WantSpec::default()).await.unwrap();

    let t_spec = WantSpec {
        recipe_path: Some("s7-recipe".to_string()),
        ..Default::default()
    };
    engine.add(WantMeta::new("t"), "target", t_spec).await.unwrap();

    wait_until(|| engine.get("x").is_some(), Duration::from_secs(5), "x to be materialised").await;
    wait_until(
        || engine.get("y").map(|s| s.state.get("last_result") == Some(&ParamValue::Str("ok".to_string()))).unwrap_or(false),
        Duration::from_secs(5),
        "y to have at least one successful send to x",
    )
    .await;

    engine.delete("t").await.unwrap();

    assert!(engine.get("t").is_none());
    assert!(engine.get("x").is_none(), "cascade delete should remove the child x along with its owner t");

    wait_until(
        || {
            engine
                .get("y")
                .map(|s| !matches!(s.state.get("last_result"), Some(ParamValue::Str(v)) if v == "ok"))
                .unwrap_or(false)
        },
        Duration::from_secs(5),
        "y's next send to the now-deleted x to surface a ChannelError",
    )
    .await;
}

/// Stages a fixed state delta for the Do agent to commit (spec.md §8 S4: "a
/// Do-mode agent runs synchronously before the progress cycle and its
/// result is visible to `Progress()` on the very same cycle").
struct BookingDoAction;

#[async_trait]
impl LocalAgentAction for BookingDoAction {
    async fn run(&self, ctx: &LocalAgentContext<'_>) -> Result<(), mywant_core::AgentError> {
        ctx.stage_state_change("confirmation_code", "ABC123");
        Ok(())
    }
}

/// Achieves as soon as the Do agent's delta has landed in its state.
struct BookingLogic;

#[async_trait]
impl WantLogic<i32> for BookingLogic {
    async fn progress(&self, ctx: &mut ProgressContext<'_, i32>) -> Result<StepOutcome, EngineError> {
        if ctx.get_state("confirmation_code").is_some() {
            Ok(StepOutcome::Achieved)
        } else {
            Ok(StepOutcome::Continue)
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s4_do_agent_runs_synchronously_before_the_progress_cycle() {
    let engine: Engine<i32> = EngineBuilder::<i32>::new(Arc::new(StaticRecipeLoader::new()))
        .register_type("booking", Arc::new(|_meta, _spec| Ok(Arc::new(BookingLogic) as Arc<dyn WantLogic<i32>>)))
        .register_capability(Capability {
            name: "booking_service".to_string(),
            gives: vec!["book_flight".to_string()],
        })
        .register_agent(Agent {
            name: "booking_agent".to_string(),
            kind: AgentKind::Do,
            capabilities: vec!["booking_service".to_string()],
            runtime: RuntimeMode::Local,
            priority: 0,
            retry: RetryPolicy::default(),
            interval_millis: None,
        })
        .register_local_action("booking_agent", Arc::new(BookingDoAction))
        .build(tokio::runtime::Handle::current())
        .unwrap();

    let spec = WantSpec {
        requires: vec!["book_flight".to_string()],
        ..Default::default()
    };
    engine.add(WantMeta::new("trip"), "booking", spec).await.unwrap();

    wait_for_status(&engine, "trip", WantStatus::Achieved).await;
    let snapshot = engine.get("trip").unwrap();
    assert_eq!(snapshot.state.get("confirmation_code"), Some(&ParamValue::Str("ABC123".to_string())));
    assert!(snapshot.agent_executions.iter().any(|e| e.agent_name == "booking_agent"));
}

/// Never achieves on its own; S5 only cares about the state delta a Monitor
/// callback deposits, never about reaching a terminal status.
struct WatchesLogic;

#[async_trait]
impl WantLogic<i32> for WatchesLogic {
    async fn progress(&self, _ctx: &mut ProgressContext<'_, i32>) -> Result<StepOutcome, EngineError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(StepOutcome::Continue)
    }
}

/// A fake external Monitor-agent service: accepts `/agents/monitor/execute`,
/// answers immediately, then posts one delta back to the want's own
/// `/agents/callback` endpoint a moment later, exactly as spec.md §4.6
/// describes ("Asynchronous... deltas arrive later via the callback").
async fn mock_monitor_service(request: axum::extract::Json<mywant_runtime::agent::webhook::MonitorRequest>) -> axum::http::StatusCode {
    let request = request.0;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let mut state_updates = BTreeMap::new();
        state_updates.insert("flight_status".to_string(), ParamValue::Str("delayed".to_string()));
        let callback = mywant_runtime::agent::webhook::WebhookCallback {
            want_id: request.want_id,
            agent_name: request.agent_name,
            status: "in_progress".to_string(),
            state_updates,
        };
        let _ = reqwest::Client::new().post(&request.callback_url).json(&callback).send().await;
    });
    axum::http::StatusCode::ACCEPTED
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s5_monitor_agent_delivers_its_delta_through_the_callback_router() {
    let monitor_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let monitor_addr = monitor_listener.local_addr().unwrap();
    let monitor_router = axum::Router::new().route("/agents/monitor/execute", axum::routing::post(mock_monitor_service));
    tokio::spawn(async move {
        axum::serve(monitor_listener, monitor_router).await.unwrap();
    });

    let callback_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let callback_addr = callback_listener.local_addr().unwrap();

    let engine: Engine<i32> = EngineBuilder::<i32>::new(Arc::new(StaticRecipeLoader::new()))
        .register_type("flight", Arc::new(|_meta, _spec| Ok(Arc::new(WatchesLogic) as Arc<dyn WantLogic<i32>>)))
        .register_capability(Capability {
            name: "flight_status_service".to_string(),
            gives: vec!["watch_flight".to_string()],
        })
        .register_agent(Agent {
            name: "flight_monitor".to_string(),
            kind: AgentKind::Monitor,
            capabilities: vec!["flight_status_service".to_string()],
            runtime: RuntimeMode::Webhook {
                endpoint: format!("http://{monitor_addr}"),
                auth_token: None,
            },
            priority: 0,
            retry: RetryPolicy::default(),
            interval_millis: None,
        })
        .with_config(EngineConfig {
            webhook_callback_url: Some(format!("http://{callback_addr}")),
            ..EngineConfig::default()
        })
        .build(tokio::runtime::Handle::current())
        .unwrap();

    let callback_router = engine.callback_router();
    tokio::spawn(async move {
        axum::serve(callback_listener, callback_router).await.unwrap();
    });

    let spec = WantSpec {
        requires: vec!["watch_flight".to_string()],
        ..Default::default()
    };
    engine.add(WantMeta::new("flight1"), "flight", spec).await.unwrap();

    wait_until(
        || engine.get("flight1").map(|s| s.state.get("flight_status").is_some()).unwrap_or(false),
        Duration::from_secs(5),
        "flight1 to receive the monitor agent's callback delta",
    )
    .await;

    let snapshot = engine.get("flight1").unwrap();
    assert_eq!(snapshot.state.get("flight_status"), Some(&ParamValue::Str("delayed".to_string())));
    assert!(snapshot
        .history
        .iter()
        .any(|h| matches!(&h.source, mywant_core::HistorySource::Agent(name) if name == "flight_monitor")));
}
