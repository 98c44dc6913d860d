//! Engine assembly and public API
//!
//! The [`Engine`] owns the registry, the storage handle, the dispatcher and
//! the daily scheduler. Callers create workflows, query status and deliver
//! external events through it:
//!
//! ```text
//! create ──▶ storage (insert Queued) ──▶ dispatcher (poll due)
//!                                            │
//!                                            ▼
//!                                 scheduler (per-id serialization)
//!                                            │
//!                                            ▼
//!                         workflow runtime (replay + durable primitives)
//! ```

mod executor;
mod registry;

pub use registry::{AnyWorkflow, RegisteredWorkflow, WorkflowFactory, WorkflowRegistry};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::codec::{self, CodecError};
use crate::storage::{
    ExecutionState, SaveSet, StoreError, WorkflowEntity, WorkflowStore,
};
use crate::worker::{daily, dispatcher, WorkflowScheduler};
use crate::workflow::{EventOutcome, Workflow};

/// Engine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Sleep between dispatcher polls when no trigger fires
    pub poll_interval: Duration,

    /// Maximum entities claimed per poll
    pub poll_batch: usize,

    /// Maximum workflows driven concurrently in this process
    pub max_parallel_workflows: usize,

    /// Waits longer than this suspend the workflow instead of sleeping
    /// in-process
    pub suspend_threshold: Duration,

    /// Bounded retries for optimistic-concurrency conflicts
    pub contention_retries: u32,

    /// Tick interval of the daily scheduler
    pub daily_interval: Duration,

    /// How long `shutdown` waits for in-flight workflows
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            poll_batch: 32,
            max_parallel_workflows: 100,
            suspend_threshold: Duration::from_secs(15),
            contention_retries: 5,
            daily_interval: Duration::from_secs(60 * 60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Create a configuration with the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the dispatcher poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the poll batch size
    pub fn with_poll_batch(mut self, batch: usize) -> Self {
        self.poll_batch = batch.max(1);
        self
    }

    /// Set the in-process parallelism bound
    pub fn with_max_parallel_workflows(mut self, max: usize) -> Self {
        self.max_parallel_workflows = max.max(1);
        self
    }

    /// Set the in-process wait threshold
    pub fn with_suspend_threshold(mut self, threshold: Duration) -> Self {
        self.suspend_threshold = threshold;
        self
    }

    /// Set the contention retry bound
    pub fn with_contention_retries(mut self, retries: u32) -> Self {
        self.contention_retries = retries.max(1);
        self
    }

    /// Set the daily scheduler tick interval
    pub fn with_daily_interval(mut self, interval: Duration) -> Self {
        self.daily_interval = interval;
        self
    }

    /// Set the graceful shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Create with an id that is already taken
    #[error("workflow already exists: {0}")]
    AlreadyExists(String),

    /// Unknown workflow id
    #[error("workflow not found: {0}")]
    NotFound(String),

    /// Event delivery to a workflow that is not waiting
    #[error("workflow {0} is not waiting for events")]
    NotWaiting(String),

    /// Create for a type the registry does not know
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Payload encode/decode error
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Graceful shutdown did not drain in time
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Point-in-time view of a workflow returned by [`Engine::get_status`]
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowStatus {
    /// Current execution state
    pub state: ExecutionState,

    /// When the workflow was created
    pub utc_created: DateTime<Utc>,

    /// Last persisted change
    pub utc_updated: DateTime<Utc>,

    /// Decoded result when Completed
    pub result: Option<Value>,

    /// Error string when Failed
    pub error: Option<String>,
}

/// Shared state behind the engine, its loops and its workflow contexts
pub(crate) struct EngineCore {
    pub(crate) store: Arc<dyn WorkflowStore>,
    pub(crate) registry: WorkflowRegistry,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: EngineConfig,
    pub(crate) trigger: Notify,
    pub(crate) scheduler: WorkflowScheduler,
}

impl EngineCore {
    pub(crate) fn new(
        store: Arc<dyn WorkflowStore>,
        registry: WorkflowRegistry,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let scheduler = WorkflowScheduler::new(config.max_parallel_workflows);
        Self {
            store,
            registry,
            clock,
            config,
            trigger: Notify::new(),
            scheduler,
        }
    }

    /// Insert a queued workflow entity and wake the dispatcher
    pub(crate) async fn create_registered(
        &self,
        type_name: &str,
        input: String,
        id: Option<String>,
        eta: Option<DateTime<Utc>>,
    ) -> Result<String, EngineError> {
        if !self.registry.contains(type_name) {
            return Err(EngineError::UnknownWorkflowType(type_name.to_string()));
        }

        let id = id.unwrap_or_else(|| Uuid::now_v7().to_string());
        let now = self.clock.utc_now();
        let mut entity = WorkflowEntity::new(&id, type_name, input, now);
        if let Some(eta) = eta {
            entity = entity.with_eta(eta);
        }

        match self.store.insert_workflow(&entity).await {
            Ok(()) => {
                info!(workflow_id = %id, workflow_type = %type_name, "created workflow");
                self.trigger.notify_one();
                Ok(id)
            }
            Err(StoreError::AlreadyExists(id)) => Err(EngineError::AlreadyExists(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Deliver an external event to a waiting workflow
    ///
    /// The first delivery completes the waiting activity; later deliveries
    /// (and deliveries racing the timeout) find it terminal and do nothing.
    pub(crate) async fn raise_event(
        &self,
        workflow_id: &str,
        name: &str,
        value: Value,
        throw_if_not_found: bool,
    ) -> Result<(), EngineError> {
        fn miss(throw: bool, err: EngineError) -> Result<(), EngineError> {
            if throw {
                Err(err)
            } else {
                Ok(())
            }
        }

        let Some(workflow) = self.store.get_workflow(workflow_id).await? else {
            return miss(
                throw_if_not_found,
                EngineError::NotFound(workflow_id.to_string()),
            );
        };
        let Some(waiting_id) = workflow.current_waiting_id.clone() else {
            return miss(
                throw_if_not_found,
                EngineError::NotWaiting(workflow_id.to_string()),
            );
        };
        let Some(route) = self.store.get_event_route(workflow_id, name).await? else {
            return miss(
                throw_if_not_found,
                EngineError::NotWaiting(workflow_id.to_string()),
            );
        };
        if route.activity_id != waiting_id {
            // Stale route from an earlier wait at a different call site.
            return miss(
                throw_if_not_found,
                EngineError::NotWaiting(workflow_id.to_string()),
            );
        }

        let outcome = codec::encode(&EventOutcome::delivered(name, value))?;
        let attempts = self.config.contention_retries.max(1);
        for attempt in 0..attempts {
            let Some(mut activity) = self
                .store
                .get_activity(workflow_id, &route.activity_id)
                .await?
            else {
                return miss(
                    throw_if_not_found,
                    EngineError::NotWaiting(workflow_id.to_string()),
                );
            };
            if activity.is_terminal() {
                debug!(%workflow_id, event = %name, "wait already resolved, delivery ignored");
                return Ok(());
            }
            let Some(mut workflow) = self.store.get_workflow(workflow_id).await? else {
                return miss(
                    throw_if_not_found,
                    EngineError::NotFound(workflow_id.to_string()),
                );
            };

            let now = self.clock.utc_now();
            activity.state = ExecutionState::Completed;
            activity.response = Some(outcome.clone());
            activity.utc_updated = now;
            workflow.current_waiting_id = None;
            workflow.utc_eta = now;
            workflow.utc_updated = now;

            let mut set = SaveSet::new().workflow(workflow).activity(activity);
            match self.store.save(&mut set).await {
                Ok(()) => {
                    info!(%workflow_id, event = %name, "event delivered");
                    self.trigger.notify_one();
                    return Ok(());
                }
                Err(StoreError::Conflict { .. }) if attempt + 1 < attempts => continue,
                Err(e) => return Err(e.into()),
            }
        }
        unreachable!("delivery loop returns on success or error")
    }
}

/// The durable workflow engine
///
/// # Example
///
/// ```ignore
/// let mut registry = WorkflowRegistry::new();
/// registry.register::<OrderWorkflow>();
/// registry.register_activity("charge_card", charge_card);
///
/// let store = Arc::new(InMemoryWorkflowStore::new());
/// let engine = Engine::new(store, registry);
/// engine.start();
///
/// let id = engine.create::<OrderWorkflow>(&input).await?;
/// let status = engine.get_status(&id).await?;
/// ```
pub struct Engine {
    core: Arc<EngineCore>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Engine {
    /// Create an engine with the default configuration and system clock
    pub fn new(store: Arc<dyn WorkflowStore>, registry: WorkflowRegistry) -> Self {
        Self::with_config(store, registry, EngineConfig::default())
    }

    /// Create an engine with a custom configuration
    pub fn with_config(
        store: Arc<dyn WorkflowStore>,
        registry: WorkflowRegistry,
        config: EngineConfig,
    ) -> Self {
        Self::with_options(store, registry, config, Arc::new(SystemClock))
    }

    /// Create an engine with a custom configuration and injected clock
    pub fn with_options(
        store: Arc<dyn WorkflowStore>,
        registry: WorkflowRegistry,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            core: Arc::new(EngineCore::new(store, registry, config, clock)),
            shutdown_tx,
            shutdown_rx,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Access the underlying store
    pub fn store(&self) -> Arc<dyn WorkflowStore> {
        Arc::clone(&self.core.store)
    }

    /// Start the dispatcher and the daily scheduler
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("engine already started");
            return;
        }

        info!(
            poll_interval_ms = self.core.config.poll_interval.as_millis() as u64,
            max_parallel = self.core.config.max_parallel_workflows,
            "starting engine"
        );

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(dispatcher::run(
            Arc::clone(&self.core),
            self.shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(daily::run(
            Arc::clone(&self.core),
            self.shutdown_rx.clone(),
        )));
    }

    /// Stop claiming work and wait for in-flight workflows to drain
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            let _ = handle.await;
        }

        let deadline = tokio::time::Instant::now() + self.core.config.shutdown_timeout;
        loop {
            if self.core.scheduler.active() == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    in_flight = self.core.scheduler.active(),
                    "shutdown timeout reached"
                );
                return Err(EngineError::ShutdownTimeout);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        info!("engine stopped");
        Ok(())
    }

    /// Create a workflow with a generated id
    #[instrument(skip(self, input), fields(workflow_type = W::TYPE))]
    pub async fn create<W: Workflow>(&self, input: &W::Input) -> Result<String, EngineError> {
        self.core
            .create_registered(W::TYPE, codec::encode(input)?, None, None)
            .await
    }

    /// Create a workflow with a caller-supplied id
    ///
    /// Fails with [`EngineError::AlreadyExists`] when the id is taken.
    pub async fn create_with_id<W: Workflow>(
        &self,
        id: impl Into<String>,
        input: &W::Input,
    ) -> Result<String, EngineError> {
        self.core
            .create_registered(W::TYPE, codec::encode(input)?, Some(id.into()), None)
            .await
    }

    /// Create a workflow that first runs at the given time
    pub async fn create_at<W: Workflow>(
        &self,
        at: DateTime<Utc>,
        input: &W::Input,
    ) -> Result<String, EngineError> {
        self.core
            .create_registered(W::TYPE, codec::encode(input)?, None, Some(at))
            .await
    }

    /// Create a workflow with a caller-supplied id and first-run time
    pub async fn create_at_with_id<W: Workflow>(
        &self,
        id: impl Into<String>,
        at: DateTime<Utc>,
        input: &W::Input,
    ) -> Result<String, EngineError> {
        self.core
            .create_registered(W::TYPE, codec::encode(input)?, Some(id.into()), Some(at))
            .await
    }

    /// Get the current status of a workflow
    pub async fn get_status(&self, id: &str) -> Result<WorkflowStatus, EngineError> {
        let Some(entity) = self.core.store.get_workflow(id).await? else {
            return Err(EngineError::NotFound(id.to_string()));
        };

        let (result, error) = match entity.state {
            ExecutionState::Completed => {
                let decoded = entity
                    .response
                    .as_deref()
                    .map(codec::decode::<Value>)
                    .transpose()?;
                (decoded, None)
            }
            ExecutionState::Failed => (None, entity.response.clone()),
            _ => (None, None),
        };

        Ok(WorkflowStatus {
            state: entity.state,
            utc_created: entity.utc_created,
            utc_updated: entity.utc_updated,
            result,
            error,
        })
    }

    /// Deliver an external event to a waiting workflow
    ///
    /// Silent when the workflow is unknown or not waiting, unless
    /// `throw_if_not_found` is set.
    #[instrument(skip(self, value))]
    pub async fn raise_event(
        &self,
        workflow_id: &str,
        name: &str,
        value: Value,
        throw_if_not_found: bool,
    ) -> Result<(), EngineError> {
        self.core
            .raise_event(workflow_id, name, value, throw_if_not_found)
            .await
    }
}
