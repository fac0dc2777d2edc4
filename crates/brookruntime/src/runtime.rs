use crate::executor::{CyclePolicy, ExecutionResult, ExecutorConfig, WorkflowExecutor};
use crate::instance::{InstanceConfig, InstanceManager};
use crate::registry::NodeRegistry;
use brookcore::{
    BroadcastEventBus, Dependencies, ExecutionEvent, FlowError, Inputs, RetryPolicy, Workflow,
    WorkflowError, WorkflowId,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Main runtime for executing workflows
pub struct Runtime {
    executor: Arc<WorkflowExecutor>,
    event_bus: Arc<BroadcastEventBus>,
    instances: Arc<InstanceManager>,
    workflows: RwLock<HashMap<WorkflowId, Arc<Workflow>>>,
    config: RuntimeConfig,
}

impl Runtime {
    /// Create a new runtime with default settings
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_registry(Arc::new(NodeRegistry::new()), config)
    }

    /// Create a new runtime with a pre-populated registry
    pub fn with_registry(registry: Arc<NodeRegistry>, config: RuntimeConfig) -> Self {
        let event_bus = Arc::new(BroadcastEventBus::new(config.event_buffer_size));
        let deps = Dependencies::in_memory(event_bus.clone());
        let executor = Arc::new(WorkflowExecutor::with_config(
            registry,
            deps,
            config.executor_config(),
        ));
        let instances = Arc::new(InstanceManager::with_config(
            executor.clone(),
            config.instance_config(),
        ));

        Self {
            executor,
            event_bus,
            instances,
            workflows: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Node registry, for registering node types
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        self.executor.registry()
    }

    pub fn executor(&self) -> &Arc<WorkflowExecutor> {
        &self.executor
    }

    pub fn instances(&self) -> &Arc<InstanceManager> {
        &self.instances
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Register a workflow
    pub fn register_workflow(&self, workflow: Workflow) {
        tracing::debug!(workflow_id = %workflow.id, "Registering workflow");
        self.workflows
            .write()
            .insert(workflow.id.clone(), Arc::new(workflow));
    }

    /// Execute a workflow by ID
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        inputs: Inputs,
    ) -> Result<ExecutionResult, FlowError> {
        let workflow = self
            .workflows
            .read()
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;

        self.run(&CancellationToken::new(), workflow, inputs).await
    }

    /// Execute a workflow directly (without registration)
    pub async fn execute(&self, workflow: Workflow, inputs: Inputs) -> Result<ExecutionResult, FlowError> {
        self.run(&CancellationToken::new(), Arc::new(workflow), inputs)
            .await
    }

    /// Like [`Runtime::execute`], aborting when `cancel` fires.
    pub async fn execute_with_cancel(
        &self,
        cancel: &CancellationToken,
        workflow: Workflow,
        inputs: Inputs,
    ) -> Result<ExecutionResult, FlowError> {
        self.run(cancel, Arc::new(workflow), inputs).await
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        workflow: Arc<Workflow>,
        inputs: Inputs,
    ) -> Result<ExecutionResult, FlowError> {
        let execution_id = uuid::Uuid::new_v4().to_string();
        self.executor.run(cancel, execution_id, workflow, inputs).await
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<BroadcastEventBus> {
        &self.event_bus
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Chunk workers for nodes without their own concurrency.
    pub default_workers: usize,
    pub event_buffer_size: usize,
    pub queue_capacity: usize,
    pub max_log_lines: usize,
    pub default_retry: RetryPolicy,
    pub cycle_policy: CyclePolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_workers: 1,
            event_buffer_size: 1000,
            queue_capacity: 64,
            max_log_lines: 1000,
            default_retry: RetryPolicy::default(),
            cycle_policy: CyclePolicy::Reject,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `BROOK_*` environment variables.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        read_var(&lookup, "BROOK_DEFAULT_WORKERS", &mut config.default_workers);
        read_var(&lookup, "BROOK_EVENT_BUFFER", &mut config.event_buffer_size);
        read_var(&lookup, "BROOK_QUEUE_CAPACITY", &mut config.queue_capacity);
        read_var(&lookup, "BROOK_MAX_LOG_LINES", &mut config.max_log_lines);
        read_var(&lookup, "BROOK_MAX_RETRIES", &mut config.default_retry.max_retries);
        if let Some(raw) = lookup("BROOK_CYCLE_POLICY") {
            match raw.as_str() {
                "reject" => config.cycle_policy = CyclePolicy::Reject,
                "run_scheduled" => config.cycle_policy = CyclePolicy::RunScheduled,
                other => tracing::warn!(value = other, "Ignoring unknown BROOK_CYCLE_POLICY"),
            }
        }
        config
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            default_workers: self.default_workers.max(1),
            default_retry: self.default_retry.clone(),
            cycle_policy: self.cycle_policy,
            ..ExecutorConfig::default()
        }
    }

    pub fn instance_config(&self) -> InstanceConfig {
        InstanceConfig {
            queue_capacity: self.queue_capacity.max(1),
            max_log_lines: self.max_log_lines.max(1),
        }
    }
}

fn read_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(key, value = %raw, "Ignoring unparseable environment variable"),
    }
}
