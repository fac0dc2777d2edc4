use async_trait::async_trait;
use brookcore::{
    BroadcastEventBus, Dependencies, FanInStrategy, FlowError, Inputs, Item, Items, Node,
    NodeContext, NodeError, NodeSpec, PortedItems, PortedNode, RetryPolicy, Value, Workflow,
    WorkflowError, PORT_MAIN,
};
use brookruntime::{
    CyclePolicy, ExecutorConfig, NodeRegistry, NodeRuntimeOptions, WorkflowExecutor,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

/// Marks every item with the id of the node that saw it.
struct Tag;

#[async_trait]
impl Node for Tag {
    fn node_type(&self) -> &str {
        "tag"
    }

    async fn process(&self, ctx: &NodeContext, input: Items) -> Result<Items, NodeError> {
        Ok(input
            .into_iter()
            .map(|mut item| {
                item.insert(format!("seen_{}", ctx.node.id), Value::Bool(true));
                item
            })
            .collect())
    }
}

/// Emits nothing.
struct Sink;

#[async_trait]
impl Node for Sink {
    fn node_type(&self) -> &str {
        "sink"
    }

    async fn process(&self, _ctx: &NodeContext, _input: Items) -> Result<Items, NodeError> {
        Ok(Vec::new())
    }
}

/// Fails the first `fail_times` calls across all instances sharing `calls`.
struct Flaky {
    calls: Arc<AtomicU32>,
    fail_times: u32,
}

#[async_trait]
impl Node for Flaky {
    fn node_type(&self) -> &str {
        "flaky"
    }

    async fn process(&self, _ctx: &NodeContext, input: Items) -> Result<Items, NodeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_times {
            return Err(NodeError::ExecutionFailed(format!("transient failure {}", call)));
        }
        Ok(input)
    }
}

/// Sleeps far longer than any test waits.
struct Stall;

#[async_trait]
impl Node for Stall {
    fn node_type(&self) -> &str {
        "stall"
    }

    async fn process(&self, _ctx: &NodeContext, input: Items) -> Result<Items, NodeError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(input)
    }
}

struct BrokenInit;

#[async_trait]
impl Node for BrokenInit {
    fn node_type(&self) -> &str {
        "broken_init"
    }

    async fn initialize(&mut self, _ctx: &NodeContext, _deps: &Dependencies) -> Result<(), NodeError> {
        Err(NodeError::InitializationFailed("no credentials".to_string()))
    }

    async fn process(&self, _ctx: &NodeContext, input: Items) -> Result<Items, NodeError> {
        Ok(input)
    }
}

/// Initialization that never finishes on its own.
struct SlowInit;

#[async_trait]
impl Node for SlowInit {
    fn node_type(&self) -> &str {
        "slow_init"
    }

    async fn initialize(&mut self, _ctx: &NodeContext, _deps: &Dependencies) -> Result<(), NodeError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }

    async fn process(&self, _ctx: &NodeContext, input: Items) -> Result<Items, NodeError> {
        Ok(input)
    }
}

/// Routes items to `even` or `odd` by their `n` field.
struct Parity;

#[async_trait]
impl Node for Parity {
    fn node_type(&self) -> &str {
        "parity"
    }

    fn ported(&self) -> Option<&dyn PortedNode> {
        Some(self)
    }
}

#[async_trait]
impl PortedNode for Parity {
    async fn process_ported(&self, _ctx: &NodeContext, input: Items) -> Result<PortedItems, NodeError> {
        let mut out = PortedItems::new();
        for item in input {
            let n = item.get("n").and_then(Value::as_u64).unwrap_or(0);
            let port = if n % 2 == 0 { "even" } else { "odd" };
            out.entry(port.to_string()).or_default().push(item);
        }
        Ok(out)
    }
}

/// Records the size of every chunk it processes.
struct ChunkRecorder {
    sizes: Arc<Mutex<Vec<usize>>>,
}

#[async_trait]
impl Node for ChunkRecorder {
    fn node_type(&self) -> &str {
        "recorder"
    }

    async fn process(&self, _ctx: &NodeContext, input: Items) -> Result<Items, NodeError> {
        self.sizes.lock().push(input.len());
        Ok(input)
    }
}

fn registry() -> Arc<NodeRegistry> {
    let registry = NodeRegistry::new();
    registry.register_fn("tag", || Box::new(Tag));
    registry.register_fn("sink", || Box::new(Sink));
    registry.register_fn("stall", || Box::new(Stall));
    registry.register_fn("broken_init", || Box::new(BrokenInit));
    registry.register_fn("slow_init", || Box::new(SlowInit));
    registry.register_fn("parity", || Box::new(Parity));
    Arc::new(registry)
}

fn executor(registry: Arc<NodeRegistry>) -> WorkflowExecutor {
    WorkflowExecutor::new(registry, Dependencies::default())
}

fn numbered(n: u64) -> Items {
    (0..n)
        .map(|i| Item::from([("n".to_string(), Value::from(i))]))
        .collect()
}

fn inputs(node: &str, items: Items) -> Inputs {
    HashMap::from([(node.to_string(), items)])
}

async fn run(executor: &WorkflowExecutor, workflow: Workflow, inputs: Inputs) -> Result<brookruntime::ExecutionResult, FlowError> {
    executor
        .run(&CancellationToken::new(), "exec-test", Arc::new(workflow), inputs)
        .await
}

#[tokio::test]
async fn test_tag_chain_end_to_end() {
    init_tracing();

    let mut wf = Workflow::new("chain", "tag chain");
    wf.add_node(NodeSpec::new("a", "tag"));
    wf.add_node(NodeSpec::new("b", "tag"));
    wf.add_node(NodeSpec::new("c", "tag"));
    wf.connect_main("a", "b");
    wf.connect_main("b", "c");

    let result = run(&executor(registry()), wf, inputs("a", numbered(2))).await.unwrap();

    assert_eq!(result.completed_nodes, 3);
    assert_eq!(result.total_nodes, 3);
    let last = &result.outputs["c"];
    assert_eq!(last.len(), 2);
    for item in last {
        for node in ["a", "b", "c"] {
            assert_eq!(item.get(&format!("seen_{}", node)), Some(&Value::Bool(true)));
        }
    }
}

#[tokio::test]
async fn test_every_scheduled_node_has_a_result() {
    let mut wf = Workflow::new("wf", "idle");
    wf.add_node(NodeSpec::new("source", "tag"));
    wf.add_node(NodeSpec::new("drain", "sink"));
    wf.add_node(NodeSpec::new("after", "tag"));
    wf.connect_main("source", "drain");
    wf.connect_main("drain", "after");

    let result = run(&executor(registry()), wf, Inputs::new()).await.unwrap();

    assert_eq!(result.outputs.len(), 3);
    assert!(result.outputs.values().all(Vec::is_empty));
    assert_eq!(result.total_items(), 0);
}

#[tokio::test]
async fn test_wait_all_without_inputs_fails() {
    let mut wf = Workflow::new("wf", "wait_all");
    wf.add_node(NodeSpec::new("a", "sink"));
    wf.add_node(NodeSpec::new("b", "tag").with_fan_in(FanInStrategy::WaitAll));
    wf.connect_main("a", "b");

    let err = run(&executor(registry()), wf, inputs("a", numbered(3))).await.unwrap_err();
    match err {
        FlowError::MissingInputs { node_id } => assert_eq!(node_id, "b"),
        other => panic!("expected MissingInputs, got {:?}", other),
    }
}

#[tokio::test]
async fn test_latest_fan_in_keeps_most_recent_delivery() {
    let mut wf = Workflow::new("wf", "latest");
    wf.add_node(NodeSpec::new("first", "tag"));
    wf.add_node(NodeSpec::new("second", "tag"));
    wf.add_node(NodeSpec::new("join", "tag").with_fan_in(FanInStrategy::Latest));
    wf.connect_main("first", "join");
    wf.connect_main("second", "join");

    let mut data = inputs("first", numbered(2));
    data.insert("second".to_string(), numbered(3));
    let result = run(&executor(registry()), wf, data).await.unwrap();

    let joined = &result.outputs["join"];
    assert_eq!(joined.len(), 3);
    assert!(joined.iter().all(|item| item.contains_key("seen_second")));
}

#[tokio::test]
async fn test_concat_fan_in_collects_every_delivery() {
    let mut wf = Workflow::new("wf", "concat");
    wf.add_node(NodeSpec::new("first", "tag"));
    wf.add_node(NodeSpec::new("second", "tag"));
    wf.add_node(NodeSpec::new("join", "tag"));
    wf.connect_main("first", "join");
    wf.connect_main("second", "join");

    let mut data = inputs("first", numbered(2));
    data.insert("second".to_string(), numbered(3));
    let result = run(&executor(registry()), wf, data).await.unwrap();

    assert_eq!(result.outputs["join"].len(), 5);
}

fn flaky_registry(fail_times: u32) -> (Arc<NodeRegistry>, Arc<AtomicU32>) {
    let registry = registry();
    let calls = Arc::new(AtomicU32::new(0));
    let shared = calls.clone();
    registry.register_fn("flaky", move || {
        Box::new(Flaky {
            calls: shared.clone(),
            fail_times,
        })
    });
    (registry, calls)
}

fn flaky_workflow(max_retries: u32) -> Workflow {
    let mut wf = Workflow::new("wf", "retry");
    wf.add_node(NodeSpec::new("flaky", "flaky").with_retry(
        RetryPolicy::new(max_retries).with_delays(Duration::from_millis(1), Duration::from_millis(5)),
    ));
    wf
}

#[tokio::test]
async fn test_retry_succeeds_when_budget_covers_failures() {
    let (registry, calls) = flaky_registry(2);

    let result = run(&executor(registry), flaky_workflow(2), inputs("flaky", numbered(1)))
        .await
        .unwrap();

    assert_eq!(result.outputs["flaky"].len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_exhausted_reports_attempts() {
    let (registry, calls) = flaky_registry(2);

    let err = run(&executor(registry), flaky_workflow(1), inputs("flaky", numbered(1)))
        .await
        .unwrap_err();

    match err {
        FlowError::ProcessingFailed { node_id, attempts, source } => {
            assert_eq!(node_id, "flaky");
            assert_eq!(attempts, 2);
            assert!(matches!(source, NodeError::ExecutionFailed(_)));
        }
        other => panic!("expected ProcessingFailed, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_engine_retry_override_beats_node_spec() {
    let (registry, _calls) = flaky_registry(1);
    let executor = executor(registry).with_node_options(
        "flaky",
        NodeRuntimeOptions {
            retry: Some(RetryPolicy::new(1).with_delays(Duration::from_millis(1), Duration::from_millis(1))),
            ..Default::default()
        },
    );

    let result = run(&executor, flaky_workflow(0), inputs("flaky", numbered(1))).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_unknown_node_type_is_a_workflow_error() {
    let mut wf = Workflow::new("wf", "unknown");
    wf.add_node(NodeSpec::new("x", "does.not.exist"));

    let err = run(&executor(registry()), wf, Inputs::new()).await.unwrap_err();
    assert!(matches!(
        err,
        FlowError::Workflow(WorkflowError::UnknownNodeType(ref t)) if t == "does.not.exist"
    ));
}

#[tokio::test]
async fn test_initialize_failure_aborts_run() {
    let mut wf = Workflow::new("wf", "init");
    wf.add_node(NodeSpec::new("bad", "broken_init"));
    wf.add_node(NodeSpec::new("after", "tag"));
    wf.connect_main("bad", "after");

    let err = run(&executor(registry()), wf, inputs("bad", numbered(1))).await.unwrap_err();
    assert!(matches!(err, FlowError::InitFailed { ref node_id, .. } if node_id == "bad"));
    assert_eq!(err.node_id(), Some("bad"));
}

#[tokio::test]
async fn test_node_timeout_is_deadline_exceeded() {
    let mut wf = Workflow::new("wf", "timeout");
    wf.add_node(NodeSpec::new("slow", "stall").with_timeout(Duration::from_millis(50)));

    let started = std::time::Instant::now();
    let err = run(&executor(registry()), wf, inputs("slow", numbered(1))).await.unwrap_err();

    assert!(matches!(
        err,
        FlowError::DeadlineExceeded { ref node_id, timeout_ms: 50 } if node_id == "slow"
    ));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_cancelling_the_run_stops_in_flight_nodes() {
    let mut wf = Workflow::new("wf", "cancel");
    wf.add_node(NodeSpec::new("slow", "stall"));
    wf.add_node(NodeSpec::new("after", "tag"));
    wf.connect_main("slow", "after");

    let executor = executor(registry());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = executor
        .run(&cancel, "exec-cancel", Arc::new(wf), inputs("slow", numbered(1)))
        .await
        .unwrap_err();

    assert!(matches!(err, FlowError::Cancelled { ref node_id } if node_id == "slow"));
    assert!(err.is_cancellation());
}

#[tokio::test]
async fn test_cancelling_the_run_interrupts_initialize() {
    let mut wf = Workflow::new("wf", "cancel init");
    wf.add_node(NodeSpec::new("setup", "slow_init"));

    let executor = executor(registry());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        executor.run(&cancel, "exec-cancel-init", Arc::new(wf), inputs("setup", numbered(1))),
    )
    .await
    .expect("run should return promptly after cancellation");

    let err = outcome.unwrap_err();
    assert!(matches!(err, FlowError::Cancelled { ref node_id } if node_id == "setup"));
}

#[tokio::test]
async fn test_node_timeout_covers_initialize() {
    let mut wf = Workflow::new("wf", "init timeout");
    wf.add_node(NodeSpec::new("setup", "slow_init").with_timeout(Duration::from_millis(50)));

    let started = std::time::Instant::now();
    let err = run(&executor(registry()), wf, inputs("setup", numbered(1))).await.unwrap_err();

    assert!(matches!(
        err,
        FlowError::DeadlineExceeded { ref node_id, timeout_ms: 50 } if node_id == "setup"
    ));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_ported_node_routes_by_port() {
    let mut wf = Workflow::new("wf", "parity");
    wf.add_node(NodeSpec::new("split", "parity"));
    wf.add_node(NodeSpec::new("evens", "tag"));
    wf.add_node(NodeSpec::new("odds", "tag"));
    wf.connect("split", "even", "evens", PORT_MAIN);
    wf.connect("split", "odd", "odds", PORT_MAIN);

    let result = run(&executor(registry()), wf, inputs("split", numbered(5))).await.unwrap();

    assert!(result.outputs["split"].is_empty(), "nothing was emitted on main");
    let evens: Vec<u64> = result.outputs["evens"]
        .iter()
        .filter_map(|item| item.get("n").and_then(Value::as_u64))
        .collect();
    assert_eq!(evens, vec![0, 2, 4]);
    assert_eq!(result.outputs["odds"].len(), 2);
}

#[tokio::test]
async fn test_workers_split_input_and_preserve_order() {
    let registry = registry();
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let shared = sizes.clone();
    registry.register_fn("recorder", move || Box::new(ChunkRecorder { sizes: shared.clone() }));

    let mut wf = Workflow::new("wf", "chunks");
    wf.add_node(NodeSpec::new("fanout", "recorder").with_concurrency(3));

    let result = run(&executor(registry), wf, inputs("fanout", numbered(10))).await.unwrap();

    let mut recorded = sizes.lock().clone();
    recorded.sort_unstable();
    assert_eq!(recorded, vec![2, 4, 4]);

    let order: Vec<u64> = result.outputs["fanout"]
        .iter()
        .filter_map(|item| item.get("n").and_then(Value::as_u64))
        .collect();
    assert_eq!(order, (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_cycle_is_rejected_by_default() {
    let mut wf = Workflow::new("wf", "cycle");
    wf.add_node(NodeSpec::new("start", "tag"));
    wf.add_node(NodeSpec::new("x", "tag"));
    wf.add_node(NodeSpec::new("y", "tag"));
    wf.connect_main("start", "x");
    wf.connect_main("x", "y");
    wf.connect_main("y", "x");

    let err = run(&executor(registry()), wf, inputs("start", numbered(1))).await.unwrap_err();
    match err {
        FlowError::Workflow(WorkflowError::CyclicDependency { unscheduled }) => {
            assert_eq!(unscheduled, vec!["x".to_string(), "y".to_string()]);
        }
        other => panic!("expected CyclicDependency, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cycle_can_run_scheduled_nodes_only() {
    let mut wf = Workflow::new("wf", "cycle");
    wf.add_node(NodeSpec::new("start", "tag"));
    wf.add_node(NodeSpec::new("x", "tag"));
    wf.connect_main("start", "x");
    wf.connect_main("x", "x");

    let executor = WorkflowExecutor::with_config(
        registry(),
        Dependencies::default(),
        ExecutorConfig {
            cycle_policy: CyclePolicy::RunScheduled,
            ..ExecutorConfig::default()
        },
    );
    let result = run(&executor, wf, inputs("start", numbered(1))).await.unwrap();

    assert_eq!(result.outputs.keys().collect::<Vec<_>>(), vec!["start"]);
    assert_eq!(result.unscheduled, vec!["x".to_string()]);
    assert_eq!(result.completed_nodes, 1);
    assert_eq!(result.total_nodes, 2);
}

#[tokio::test]
async fn test_events_follow_node_lifecycle() {
    let bus = Arc::new(BroadcastEventBus::new(64));
    let mut events = bus.subscribe();
    let executor = WorkflowExecutor::new(registry(), Dependencies::in_memory(bus.clone()));

    let mut wf = Workflow::new("wf", "events");
    wf.add_node(NodeSpec::new("a", "tag"));
    wf.add_node(NodeSpec::new("b", "broken_init"));
    wf.connect_main("a", "b");

    let _ = executor
        .run(&CancellationToken::new(), "exec-events", Arc::new(wf), inputs("a", numbered(2)))
        .await;

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.execution_id(), "exec-events");
        names.push(event.name());
    }
    assert_eq!(names, vec!["node_started", "node_completed", "node_failed"]);
}

#[tokio::test]
async fn test_successful_run_ends_with_execution_completed() {
    let bus = Arc::new(BroadcastEventBus::new(64));
    let mut events = bus.subscribe();
    let executor = WorkflowExecutor::new(registry(), Dependencies::in_memory(bus.clone()));

    let mut wf = Workflow::new("wf", "events");
    wf.add_node(NodeSpec::new("a", "tag"));

    executor
        .run(&CancellationToken::new(), "exec-ok", Arc::new(wf), inputs("a", numbered(4)))
        .await
        .unwrap();

    let mut last = None;
    while let Ok(event) = events.try_recv() {
        if let brookcore::ExecutionEvent::NodeCompleted { count, .. } = &event {
            assert_eq!(*count, 4);
        }
        last = Some(event.name());
    }
    assert_eq!(last, Some("execution_completed"));
}
