use crate::registry::NodeRegistry;
use crate::retry::retry_with_backoff;
use crate::scheduler;
use brookcore::{
    Dependencies, EventEmitter, ExecutionEvent, ExecutionId, FanInStrategy, FlowError, Inputs,
    Items, Node, NodeContext, NodeError, NodeId, NodeSpec, Port, PortedItems, RetryPolicy,
    Workflow, WorkflowError, PORT_MAIN,
};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// What to do when some nodes cannot be scheduled because of a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CyclePolicy {
    /// Fail the run before any node starts.
    #[default]
    Reject,
    /// Run the schedulable nodes and report the rest in
    /// [`ExecutionResult::unscheduled`].
    RunScheduled,
}

/// Engine-wide defaults.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub default_workers: usize,
    pub default_fan_in: FanInStrategy,
    pub default_retry: RetryPolicy,
    pub cycle_policy: CyclePolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_workers: 1,
            default_fan_in: FanInStrategy::Concat,
            default_retry: RetryPolicy::default(),
            cycle_policy: CyclePolicy::Reject,
        }
    }
}

/// Per-node runtime knobs set on the executor. They take precedence over the
/// values carried by the node spec.
#[derive(Debug, Clone, Default)]
pub struct NodeRuntimeOptions {
    /// Used when the node's own `concurrency` is 0.
    pub workers: usize,
    pub fan_in: Option<FanInStrategy>,
    pub retry: Option<RetryPolicy>,
}

struct ResolvedOptions {
    workers: usize,
    fan_in: FanInStrategy,
    retry: RetryPolicy,
}

/// Items pushed into one node port by a single predecessor (or the caller).
#[derive(Debug)]
struct Delivery {
    source: Option<NodeId>,
    items: Items,
}

/// Per-node, per-port accumulation of routed items.
#[derive(Debug, Default)]
struct InboundBuffer {
    ports: HashMap<Port, Vec<Delivery>>,
}

impl InboundBuffer {
    fn push(&mut self, port: &str, delivery: Delivery) {
        self.ports.entry(port.to_string()).or_default().push(delivery);
    }

    fn take(&mut self, port: &str) -> Vec<Delivery> {
        self.ports.remove(port).unwrap_or_default()
    }
}

/// Executes workflows node by node in topological order, fanning each node's
/// input out over a bounded set of chunk workers.
pub struct WorkflowExecutor {
    registry: Arc<NodeRegistry>,
    deps: Dependencies,
    config: ExecutorConfig,
    node_options: HashMap<NodeId, NodeRuntimeOptions>,
}

impl WorkflowExecutor {
    pub fn new(registry: Arc<NodeRegistry>, deps: Dependencies) -> Self {
        Self::with_config(registry, deps, ExecutorConfig::default())
    }

    pub fn with_config(registry: Arc<NodeRegistry>, deps: Dependencies, config: ExecutorConfig) -> Self {
        Self {
            registry,
            deps,
            config,
            node_options: HashMap::new(),
        }
    }

    /// Override runtime options for one node id.
    pub fn with_node_options(mut self, node_id: impl Into<NodeId>, options: NodeRuntimeOptions) -> Self {
        self.node_options.insert(node_id.into(), options);
        self
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Stores and event bus handed to every handler's `initialize`.
    pub fn deps(&self) -> &Dependencies {
        &self.deps
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute a workflow once and return every scheduled node's `main` output.
    ///
    /// Any node failure aborts the run; nothing after it starts and no partial
    /// results are returned.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        execution_id: impl Into<ExecutionId>,
        workflow: Arc<Workflow>,
        inputs: Inputs,
    ) -> Result<ExecutionResult, FlowError> {
        let execution_id = execution_id.into();
        let start_time = Instant::now();

        tracing::info!(
            execution_id = %execution_id,
            workflow_id = %workflow.id,
            nodes = workflow.nodes.len(),
            "Starting workflow execution"
        );

        let schedule = scheduler::schedule(&workflow)?;
        if !schedule.is_complete() {
            match self.config.cycle_policy {
                CyclePolicy::Reject => {
                    return Err(WorkflowError::CyclicDependency {
                        unscheduled: schedule.unscheduled,
                    }
                    .into());
                }
                CyclePolicy::RunScheduled => {
                    tracing::warn!(
                        execution_id = %execution_id,
                        unscheduled = ?schedule.unscheduled,
                        "Cycle detected, running schedulable nodes only"
                    );
                }
            }
        }

        let specs: HashMap<&str, &NodeSpec> =
            workflow.nodes.iter().map(|n| (n.id.as_str(), n)).collect();

        let mut inbound: HashMap<NodeId, InboundBuffer> = HashMap::new();
        for (node_id, items) in inputs {
            if !specs.contains_key(node_id.as_str()) {
                tracing::warn!(node_id = %node_id, "Ignoring input for unknown node");
                continue;
            }
            inbound.entry(node_id).or_default().push(
                PORT_MAIN,
                Delivery {
                    source: None,
                    items,
                },
            );
        }

        let mut results: HashMap<NodeId, Items> = HashMap::new();

        for node_id in &schedule.order {
            let spec = specs
                .get(node_id.as_str())
                .map(|spec| Arc::new((*spec).clone()))
                .ok_or_else(|| WorkflowError::NodeNotFound(node_id.clone()))?;
            let buffer = inbound.remove(node_id).unwrap_or_default();

            let mut outputs = match self
                .run_node(cancel, &execution_id, &workflow, spec.clone(), buffer)
                .await
            {
                Ok(outputs) => outputs,
                Err(e) => {
                    tracing::error!(
                        execution_id = %execution_id,
                        node_id = %node_id,
                        error = %e,
                        "Node failed, aborting execution"
                    );
                    self.deps.events.emit(ExecutionEvent::NodeFailed {
                        execution_id: execution_id.clone(),
                        node_id: node_id.clone(),
                        error: e.to_string(),
                        timestamp: Utc::now(),
                    });
                    return Err(e);
                }
            };

            for edge in workflow.successors(node_id) {
                let items = match outputs.get(&edge.from_port) {
                    Some(items) if !items.is_empty() => items.clone(),
                    _ => continue,
                };
                inbound.entry(edge.to_node.clone()).or_default().push(
                    &edge.to_port,
                    Delivery {
                        source: Some(node_id.clone()),
                        items,
                    },
                );
            }

            results
                .entry(node_id.clone())
                .or_default()
                .extend(outputs.remove(PORT_MAIN).unwrap_or_default());
        }

        self.deps.events.emit(ExecutionEvent::ExecutionCompleted {
            execution_id: execution_id.clone(),
            at: Utc::now(),
        });

        let duration_ms = start_time.elapsed().as_millis() as u64;
        tracing::info!(
            execution_id = %execution_id,
            completed = results.len(),
            duration_ms,
            "Workflow execution completed"
        );

        Ok(ExecutionResult {
            execution_id,
            completed_nodes: results.len(),
            total_nodes: workflow.nodes.len(),
            outputs: results,
            unscheduled: schedule.unscheduled,
            duration_ms,
        })
    }

    /// Run one node: resolve, initialize, assemble input, process chunks.
    async fn run_node(
        &self,
        cancel: &CancellationToken,
        execution_id: &ExecutionId,
        workflow: &Arc<Workflow>,
        spec: Arc<NodeSpec>,
        mut inbound: InboundBuffer,
    ) -> Result<PortedItems, FlowError> {
        if cancel.is_cancelled() {
            return Err(FlowError::Cancelled {
                node_id: spec.id.clone(),
            });
        }

        let mut handler = self.registry.create_node(&spec.node_type, &spec.config)?;

        // The node's deadline covers initialization as well as processing.
        let node_token = cancel.child_token();
        let ctx = NodeContext::new(
            execution_id.clone(),
            workflow.clone(),
            spec.clone(),
            node_token.clone(),
            EventEmitter::new(execution_id.clone(), spec.id.clone(), self.deps.events.clone()),
        );
        let initialized = tokio::select! {
            err = ctx.done() => Err(err),
            result = handler.initialize(&ctx, &self.deps) => result,
        };
        initialized.map_err(|source| init_error(&spec, source))?;

        let options = self.resolve_options(&spec);
        let has_predecessors = workflow.predecessors(&spec.id).next().is_some();
        let input = assemble_input(
            &spec.id,
            options.fan_in,
            has_predecessors,
            inbound.take(PORT_MAIN),
        )?;
        if !inbound.ports.is_empty() {
            tracing::debug!(
                node_id = %spec.id,
                ports = ?inbound.ports.keys().collect::<Vec<_>>(),
                "Items delivered to non-main ports are not passed to the handler"
            );
        }

        let input_len = input.len();
        let chunks = if input.is_empty() {
            vec![Items::new()]
        } else {
            chunk(input, options.workers)
        };

        self.deps.events.emit(ExecutionEvent::NodeStarted {
            execution_id: execution_id.clone(),
            node_id: spec.id.clone(),
            node_type: spec.node_type.clone(),
            timestamp: Utc::now(),
        });
        tracing::debug!(
            execution_id = %execution_id,
            node_id = %spec.id,
            node_type = %spec.node_type,
            items = input_len,
            chunks = chunks.len(),
            "Running node"
        );

        let started = Instant::now();
        let handler: Arc<dyn Node> = Arc::from(handler);
        let chunk_count = chunks.len();

        let mut running = FuturesUnordered::new();
        for (index, batch) in chunks.into_iter().enumerate() {
            let handler = handler.clone();
            let ctx = ctx.clone();
            let retry = options.retry.clone();
            running.push(tokio::spawn(async move {
                let outcome =
                    retry_with_backoff(&ctx, &retry, || process_chunk(handler.as_ref(), &ctx, batch.clone()))
                        .await;
                (index, outcome)
            }));
        }

        let mut per_chunk: Vec<Option<PortedItems>> = vec![None; chunk_count];
        while let Some(joined) = running.next().await {
            let (index, outcome) = match joined {
                Ok(done) => done,
                Err(join_err) => {
                    node_token.cancel();
                    return Err(FlowError::Execution(format!(
                        "chunk worker for node {} failed: {}",
                        spec.id, join_err
                    )));
                }
            };
            match outcome.result {
                Ok(out) => per_chunk[index] = Some(out),
                Err(source) => {
                    // Siblings observe the cancelled token and stop.
                    node_token.cancel();
                    return Err(chunk_error(&spec, outcome.attempts, source));
                }
            }
        }

        let mut merged: PortedItems = HashMap::new();
        for out in per_chunk.into_iter().flatten() {
            for (port, items) in out {
                merged.entry(port).or_default().extend(items);
            }
        }

        let count = merged.get(PORT_MAIN).map_or(0, Vec::len);
        let duration_ms = started.elapsed().as_millis() as u64;
        self.deps.events.emit(ExecutionEvent::NodeCompleted {
            execution_id: execution_id.clone(),
            node_id: spec.id.clone(),
            count,
            duration_ms,
            timestamp: Utc::now(),
        });
        tracing::info!(
            execution_id = %execution_id,
            node_id = %spec.id,
            count,
            duration_ms,
            "Node completed"
        );

        Ok(merged)
    }

    fn resolve_options(&self, spec: &NodeSpec) -> ResolvedOptions {
        let overrides = self.node_options.get(&spec.id);

        let workers = if spec.concurrency > 0 {
            spec.concurrency
        } else {
            overrides
                .map(|o| o.workers)
                .filter(|w| *w > 0)
                .unwrap_or(self.config.default_workers)
                .max(1)
        };
        let fan_in = overrides
            .and_then(|o| o.fan_in)
            .or(spec.fan_in)
            .unwrap_or(self.config.default_fan_in);
        let retry = overrides
            .and_then(|o| o.retry.clone())
            .or_else(|| spec.retry_policy.clone())
            .unwrap_or_else(|| self.config.default_retry.clone());

        ResolvedOptions {
            workers,
            fan_in,
            retry,
        }
    }
}

/// Run a handler against one chunk, preferring the multi-port contract.
async fn process_chunk(handler: &dyn Node, ctx: &NodeContext, batch: Items) -> Result<PortedItems, NodeError> {
    match handler.ported() {
        Some(ported) => ported.process_ported(ctx, batch).await,
        None => {
            let out = handler.process(ctx, batch).await?;
            Ok(HashMap::from([(PORT_MAIN.to_string(), out)]))
        }
    }
}

fn chunk_error(spec: &NodeSpec, attempts: u32, source: NodeError) -> FlowError {
    match source {
        NodeError::Cancelled => FlowError::Cancelled {
            node_id: spec.id.clone(),
        },
        NodeError::Timeout { .. } if spec.timeout_ms > 0 => FlowError::DeadlineExceeded {
            node_id: spec.id.clone(),
            timeout_ms: spec.timeout_ms,
        },
        source => FlowError::ProcessingFailed {
            node_id: spec.id.clone(),
            attempts,
            source,
        },
    }
}

fn init_error(spec: &NodeSpec, source: NodeError) -> FlowError {
    match source {
        NodeError::Cancelled | NodeError::Timeout { .. } => chunk_error(spec, 0, source),
        source => FlowError::InitFailed {
            node_id: spec.id.clone(),
            source,
        },
    }
}

/// Combine the deliveries on a node's `main` port according to its fan-in strategy.
fn assemble_input(
    node_id: &str,
    fan_in: FanInStrategy,
    has_predecessors: bool,
    mut deliveries: Vec<Delivery>,
) -> Result<Items, FlowError> {
    match fan_in {
        FanInStrategy::Latest => {
            if let Some(latest) = deliveries.last() {
                tracing::trace!(node_id, source = ?latest.source, "latest fan-in");
            }
            Ok(deliveries.pop().map(|d| d.items).unwrap_or_default())
        }
        FanInStrategy::WaitAll
            if has_predecessors && deliveries.iter().all(|d| d.items.is_empty()) =>
        {
            Err(FlowError::MissingInputs {
                node_id: node_id.to_string(),
            })
        }
        FanInStrategy::Concat | FanInStrategy::WaitAll => {
            Ok(deliveries.into_iter().flat_map(|d| d.items).collect())
        }
    }
}

/// Split `items` into at most `min(n, items.len())` contiguous chunks of
/// nearly equal size. The last chunk absorbs the remainder.
pub fn chunk(items: Items, n: usize) -> Vec<Items> {
    if items.is_empty() {
        return Vec::new();
    }
    let n = n.clamp(1, items.len());
    let size = items.len().div_ceil(n);

    let mut chunks = Vec::with_capacity(n);
    let mut rest = items;
    while rest.len() > size {
        let tail = rest.split_off(size);
        chunks.push(rest);
        rest = tail;
    }
    chunks.push(rest);
    chunks
}

/// Result of workflow execution
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    /// `main`-port output per scheduled node; present even when empty.
    pub outputs: HashMap<NodeId, Items>,
    pub completed_nodes: usize,
    pub total_nodes: usize,
    /// Nodes skipped because of a cycle (only with [`CyclePolicy::RunScheduled`]).
    pub unscheduled: Vec<NodeId>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn total_items(&self) -> usize {
        self.outputs.values().map(Vec::len).sum()
    }
}
