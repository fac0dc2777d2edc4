//! Long-lived workflow instances fed from a bounded queue of input batches.

use crate::executor::WorkflowExecutor;
use crate::loader::WorkflowFile;
use brookcore::{FlowError, Inputs, Workflow};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

pub type InstanceId = String;

#[derive(Error, Debug)]
pub enum InstanceError {
    #[error("Instance not found: {0}")]
    NotFound(InstanceId),

    #[error("Queue for instance {0} is full")]
    QueueFull(InstanceId),

    #[error("Instance {0} is stopped")]
    Stopped(InstanceId),

    #[error("Instance {0} is still running")]
    StillRunning(InstanceId),

    #[error("Failed to load workflow: {0}")]
    Load(#[from] FlowError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub queue_capacity: usize,
    pub max_log_lines: usize,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            max_log_lines: 1000,
        }
    }
}

/// Fixed-size log; the oldest line goes first.
struct LogBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LogBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    fn len(&self) -> usize {
        self.lines.lock().len()
    }
}

/// A workflow bound to its own input queue and processing task.
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    pub source_path: Option<PathBuf>,
    pub workflow: Arc<Workflow>,
    pub created_at: DateTime<Utc>,
    seq: u64,
    accepted: AtomicU64,
    finished: AtomicU64,
    queue: mpsc::Sender<Inputs>,
    cancel: CancellationToken,
    state: watch::Receiver<InstanceState>,
    logs: LogBuffer,
}

/// Serializable point-in-time view of an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: InstanceId,
    pub name: String,
    pub workflow_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
    pub queued: usize,
    pub pending: u64,
    pub log_lines: usize,
}

impl Instance {
    pub fn state(&self) -> InstanceState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == InstanceState::Running
    }

    /// Resolves once the processing task has exited.
    pub async fn wait_stopped(&self) {
        let mut state = self.state.clone();
        // A dropped sender means the task is gone, which is stopped too.
        let _ = state.wait_for(|s| *s == InstanceState::Stopped).await;
    }

    pub fn logs(&self) -> Vec<String> {
        self.logs.snapshot()
    }

    /// Accepted batches whose run has not finished yet, queued or in flight.
    pub fn pending_batches(&self) -> u64 {
        let finished = self.finished.load(Ordering::Acquire);
        self.accepted.load(Ordering::Acquire).saturating_sub(finished)
    }

    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            workflow_id: self.workflow.id.clone(),
            source_path: self.source_path.clone(),
            state: self.state(),
            created_at: self.created_at,
            queued: self.queue.max_capacity() - self.queue.capacity(),
            pending: self.pending_batches(),
            log_lines: self.logs.len(),
        }
    }

    fn try_accept(&self, batch: Inputs) -> Result<(), mpsc::error::TrySendError<Inputs>> {
        // Counted before the send: `finished` must never overtake `accepted`.
        self.accepted.fetch_add(1, Ordering::AcqRel);
        let sent = self.queue.try_send(batch);
        if sent.is_err() {
            self.accepted.fetch_sub(1, Ordering::AcqRel);
        }
        sent
    }

    fn log(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::info!(instance_id = %self.id, "{}", message);
        self.logs.push(format!(
            "{} {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            message
        ));
    }
}

/// Owns every instance and the executor they share.
pub struct InstanceManager {
    executor: Arc<WorkflowExecutor>,
    config: InstanceConfig,
    instances: RwLock<HashMap<InstanceId, Arc<Instance>>>,
    next_seq: AtomicU64,
}

impl InstanceManager {
    pub fn new(executor: Arc<WorkflowExecutor>) -> Self {
        Self::with_config(executor, InstanceConfig::default())
    }

    pub fn with_config(executor: Arc<WorkflowExecutor>, config: InstanceConfig) -> Self {
        Self {
            executor,
            config,
            instances: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Load a workflow file and start an instance for it. The file's `data`
    /// section becomes the first batch.
    pub async fn create_from_workflow_path(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<Arc<Instance>, InstanceError> {
        let path = path.as_ref();
        let file = WorkflowFile::load(path).await?;
        let name = if file.workflow.name.is_empty() {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.workflow.id.clone())
        } else {
            file.workflow.name.clone()
        };
        Ok(self.create(name, Some(path.to_path_buf()), file.workflow, file.data))
    }

    /// Start an instance. Must be called from within a tokio runtime.
    pub fn create(
        &self,
        name: impl Into<String>,
        source_path: Option<PathBuf>,
        workflow: Workflow,
        initial_inputs: Inputs,
    ) -> Arc<Instance> {
        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(InstanceState::Running);

        let instance = Arc::new(Instance {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            source_path,
            workflow: Arc::new(workflow),
            created_at: Utc::now(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            accepted: AtomicU64::new(0),
            finished: AtomicU64::new(0),
            queue: queue_tx,
            cancel: CancellationToken::new(),
            state: state_rx,
            logs: LogBuffer::new(self.config.max_log_lines),
        });

        instance.log("instance started");
        if !initial_inputs.is_empty() && instance.try_accept(initial_inputs).is_err() {
            instance.log("initial batch dropped: queue full");
        }

        self.instances
            .write()
            .insert(instance.id.clone(), instance.clone());

        tokio::spawn(process_queue(
            instance.clone(),
            self.executor.clone(),
            queue_rx,
            state_tx,
        ));

        instance
    }

    /// Queue a batch without waiting.
    pub fn enqueue(&self, id: &str, batch: Inputs) -> Result<(), InstanceError> {
        let instance = self.get(id)?;
        if instance.cancel.is_cancelled() {
            return Err(InstanceError::Stopped(instance.id.clone()));
        }
        instance.try_accept(batch).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => InstanceError::QueueFull(instance.id.clone()),
            mpsc::error::TrySendError::Closed(_) => InstanceError::Stopped(instance.id.clone()),
        })
    }

    /// Request a stop. Any in-flight run is cancelled; the instance turns
    /// `stopped` once its task exits.
    pub fn stop(&self, id: &str) -> Result<(), InstanceError> {
        let instance = self.get(id)?;
        instance.cancel.cancel();
        Ok(())
    }

    pub fn stop_all(&self) -> usize {
        let instances = self.instances.read();
        for instance in instances.values() {
            instance.cancel.cancel();
        }
        instances.len()
    }

    pub fn logs(&self, id: &str) -> Result<Vec<String>, InstanceError> {
        Ok(self.get(id)?.logs())
    }

    /// All instances, oldest first.
    pub fn list(&self) -> Vec<Arc<Instance>> {
        let mut instances: Vec<_> = self.instances.read().values().cloned().collect();
        instances.sort_by_key(|i| i.seq);
        instances
    }

    pub fn get(&self, id: &str) -> Result<Arc<Instance>, InstanceError> {
        self.instances
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| InstanceError::NotFound(id.to_string()))
    }

    /// Forget a stopped instance.
    pub fn remove(&self, id: &str) -> Result<Arc<Instance>, InstanceError> {
        let mut instances = self.instances.write();
        let running = match instances.get(id) {
            Some(instance) => instance.is_running(),
            None => return Err(InstanceError::NotFound(id.to_string())),
        };
        if running {
            return Err(InstanceError::StillRunning(id.to_string()));
        }
        instances
            .remove(id)
            .ok_or_else(|| InstanceError::NotFound(id.to_string()))
    }
}

/// One instance's processing loop; batches run one at a time.
async fn process_queue(
    instance: Arc<Instance>,
    executor: Arc<WorkflowExecutor>,
    mut queue: mpsc::Receiver<Inputs>,
    state: watch::Sender<InstanceState>,
) {
    loop {
        let batch = tokio::select! {
            biased;
            _ = instance.cancel.cancelled() => break,
            batch = queue.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };

        let execution_id = uuid::Uuid::new_v4().to_string();
        instance.log(format!("execution started: {}", execution_id));

        match executor
            .run(&instance.cancel, execution_id.clone(), instance.workflow.clone(), batch)
            .await
        {
            Ok(result) => instance.log(format!(
                "execution {} completed, total items: {}",
                execution_id,
                result.total_items()
            )),
            Err(e) => instance.log(format!("execution {} error: {}", execution_id, e)),
        }
        instance.finished.fetch_add(1, Ordering::AcqRel);
    }

    queue.close();
    let mut dropped = 0u64;
    while queue.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        instance.finished.fetch_add(dropped, Ordering::AcqRel);
        instance.log(format!("dropped {} queued batch(es)", dropped));
    }
    instance.log("instance stopped");
    state.send_replace(InstanceState::Stopped);
}
