//! Workflow and activity registry
//!
//! The registry maps workflow type names to factories that create
//! type-erased instances for replay, carries the per-type retention
//! metadata, and holds the activity handler table consulted by the durable
//! primitives.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::activity::{ActivityHandler, ActivityInvocation, ActivityResult, DependencyScope, ScopeFactory};
use crate::codec;
use crate::workflow::{Workflow, WorkflowContext, WorkflowError};

/// Type-erased workflow interface
///
/// Lets the executor drive workflows without knowing their concrete types;
/// inputs and outputs cross this boundary in their opaque encoded form.
pub trait AnyWorkflow: Send + Sync {
    /// The registered type identifier
    fn type_name(&self) -> &'static str;

    /// Decode the input, run the orchestration body, encode the output
    fn run<'a>(
        &'a self,
        ctx: &'a WorkflowContext,
        input: &'a str,
    ) -> BoxFuture<'a, Result<String, WorkflowError>>;
}

/// Wrapper implementing [`AnyWorkflow`] for any [`Workflow`]
struct WorkflowWrapper<W: Workflow> {
    inner: W,
}

impl<W: Workflow> AnyWorkflow for WorkflowWrapper<W> {
    fn type_name(&self) -> &'static str {
        W::TYPE
    }

    fn run<'a>(
        &'a self,
        ctx: &'a WorkflowContext,
        input: &'a str,
    ) -> BoxFuture<'a, Result<String, WorkflowError>> {
        Box::pin(async move {
            let input: W::Input = codec::decode(input)?;
            let output = self.inner.run(ctx, input).await?;
            Ok(codec::encode(&output)?)
        })
    }
}

/// Factory function creating fresh workflow instances for replay
pub type WorkflowFactory = Box<dyn Fn() -> Box<dyn AnyWorkflow> + Send + Sync>;

/// A registered workflow type with its retention metadata
pub struct RegisteredWorkflow {
    factory: WorkflowFactory,

    /// Retention after successful completion
    pub preserve_time: Duration,

    /// Retention after failure
    pub failure_preserve_time: Duration,

    /// Whether activity history is dropped at collection time
    pub delete_history: bool,
}

impl RegisteredWorkflow {
    /// Create a fresh instance for one replay
    pub fn instantiate(&self) -> Box<dyn AnyWorkflow> {
        (self.factory)()
    }
}

/// Registry of workflow types and activity handlers
///
/// Built up front, before the engine starts; the engine owns it read-only
/// afterwards.
///
/// # Example
///
/// ```ignore
/// let mut registry = WorkflowRegistry::new();
/// registry.register::<OrderWorkflow>();
/// registry.register_daily::<NightlyReport>();
/// registry.register_activity("charge_card", |inv| async move {
///     let args: ChargeArgs = inv.args()?;
///     Ok(json!({ "receipt": charge(&args).await? }))
/// });
/// ```
pub struct WorkflowRegistry {
    workflows: HashMap<String, RegisteredWorkflow>,
    activities: HashMap<String, ActivityHandler>,
    daily: Vec<String>,
    scope_factory: ScopeFactory,
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            workflows: HashMap::new(),
            activities: HashMap::new(),
            daily: Vec::new(),
            scope_factory: Arc::new(DependencyScope::new),
        }
    }

    /// Register a workflow type
    pub fn register<W: Workflow>(&mut self) {
        let factory: WorkflowFactory =
            Box::new(|| Box::new(WorkflowWrapper { inner: W::new() }) as Box<dyn AnyWorkflow>);

        self.workflows.insert(
            W::TYPE.to_string(),
            RegisteredWorkflow {
                factory,
                preserve_time: W::preserve_time(),
                failure_preserve_time: W::failure_preserve_time(),
                delete_history: W::delete_history(),
            },
        );
    }

    /// Register a workflow type that runs once per UTC day
    ///
    /// Daily instances are created with the encoded null input, so
    /// `W::Input` must deserialize from `null` (use `()` or an `Option`).
    pub fn register_daily<W: Workflow>(&mut self) {
        self.register::<W>();
        self.daily.push(W::TYPE.to_string());
    }

    /// Register an activity handler by method name
    pub fn register_activity<F, Fut>(&mut self, method: &str, handler: F)
    where
        F: Fn(ActivityInvocation) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ActivityResult> + Send + 'static,
    {
        let handler: ActivityHandler = Arc::new(move |inv| Box::pin(handler(inv)));
        self.activities.insert(method.to_string(), handler);
    }

    /// Install the factory building each invocation's dependency scope
    pub fn set_scope_factory<F>(&mut self, factory: F)
    where
        F: Fn() -> DependencyScope + Send + Sync + 'static,
    {
        self.scope_factory = Arc::new(factory);
    }

    /// Look up a workflow type
    pub fn workflow(&self, type_name: &str) -> Option<&RegisteredWorkflow> {
        self.workflows.get(type_name)
    }

    /// Look up an activity handler
    pub fn activity(&self, method: &str) -> Option<ActivityHandler> {
        self.activities.get(method).cloned()
    }

    /// Build a fresh dependency scope for one invocation
    pub fn build_scope(&self) -> DependencyScope {
        (self.scope_factory)()
    }

    /// Type names registered as daily
    pub fn daily_types(&self) -> &[String] {
        &self.daily
    }

    /// Check if a workflow type is registered
    pub fn contains(&self, type_name: &str) -> bool {
        self.workflows.contains_key(type_name)
    }

    /// All registered workflow type names
    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &self.workflows.keys().collect::<Vec<_>>())
            .field("activities", &self.activities.keys().collect::<Vec<_>>())
            .field("daily", &self.daily)
            .finish()
    }
}
