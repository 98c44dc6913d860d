//! Workflow execution context: the replay engine
//!
//! Every durable primitive is a commit point. The context consults storage
//! first and only does real work when no record exists for the
//! deterministic key, so a re-driven workflow replays to the point where
//! new work is required. Long waits unwind the stack with the internal
//! suspension signal; the dispatcher re-drives the workflow when its ETA
//! is due.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::activity::ActivityInvocation;
use crate::codec;
use crate::engine::EngineCore;
use crate::storage::{
    activity_key, ActivityEntity, EventRoute, ExecutionState, SaveSet, StoreError, WorkflowEntity,
};

use super::definition::{Workflow, WorkflowError};

/// Upper bound on encoded activity parameters
const MAX_PARAMETER_BYTES: usize = 64 * 1024;

/// Method name recorded for timer call sites
pub(crate) const DELAY_METHOD: &str = "delay";

/// Method name recorded for event-wait call sites
pub(crate) const EVENT_WAIT_METHOD: &str = "wait_for_events";

/// Outcome of an external event wait
///
/// `name == None` is the timeout outcome: the deadline passed without a
/// delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventOutcome {
    /// Name of the delivered event, if any
    pub name: Option<String>,

    /// Payload supplied with the delivery
    pub value: Option<Value>,
}

impl EventOutcome {
    /// The timeout outcome
    pub(crate) fn timeout() -> Self {
        Self {
            name: None,
            value: None,
        }
    }

    /// A delivered event
    pub(crate) fn delivered(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: Some(name.into()),
            value: Some(value),
        }
    }

    /// Whether the wait timed out without a delivery
    pub fn is_timeout(&self) -> bool {
        self.name.is_none()
    }
}

/// Mutable per-run state behind the context
struct ContextState {
    entity: WorkflowEntity,
    virtual_now: DateTime<Utc>,
    call_counters: HashMap<String, u32>,
    primitive_active: bool,
}

/// Clears the primitive-in-flight flag on every exit path
struct PrimitiveGuard<'a> {
    ctx: &'a WorkflowContext,
}

impl Drop for PrimitiveGuard<'_> {
    fn drop(&mut self) {
        self.ctx.state.lock().primitive_active = false;
    }
}

/// Handle given to workflow code for issuing durable primitives
///
/// One context exists per drive of a workflow; within it execution is
/// strictly sequential. The virtual clock ([`current_utc`]) starts at the
/// workflow's creation time and advances only when a durable primitive
/// consumes a stored outcome, which keeps "now" deterministic across
/// replays.
///
/// [`current_utc`]: WorkflowContext::current_utc
pub struct WorkflowContext {
    core: Arc<EngineCore>,
    id: String,
    state: Mutex<ContextState>,
}

impl WorkflowContext {
    pub(crate) fn new(core: Arc<EngineCore>, entity: WorkflowEntity) -> Self {
        let id = entity.id.clone();
        let virtual_now = entity.utc_created;
        Self {
            core,
            id,
            state: Mutex::new(ContextState {
                entity,
                virtual_now,
                call_counters: HashMap::new(),
                primitive_active: false,
            }),
        }
    }

    /// Take the final entity snapshot back after the run
    pub(crate) fn into_entity(self) -> WorkflowEntity {
        self.state.into_inner().entity
    }

    /// Identifier of the workflow being driven
    pub fn workflow_id(&self) -> &str {
        &self.id
    }

    /// Deterministic "now" for workflow code
    pub fn current_utc(&self) -> DateTime<Utc> {
        self.state.lock().virtual_now
    }

    // =========================================================================
    // Durable primitives
    // =========================================================================

    /// Run a registered activity, deduplicated by method name and arguments
    ///
    /// Returns the stored result on replay without re-invoking the handler;
    /// a stored failure is re-raised as [`WorkflowError::ActivityFailed`].
    pub async fn schedule<T, A>(&self, method: &str, args: &A) -> Result<T, WorkflowError>
    where
        T: DeserializeOwned,
        A: Serialize + ?Sized,
    {
        let eta = self.core.clock.utc_now();
        self.schedule_at(method, eta, args).await
    }

    /// Run a registered activity no earlier than `eta`
    ///
    /// A far-future `eta` suspends the workflow until it is due.
    pub async fn schedule_at<T, A>(
        &self,
        method: &str,
        eta: DateTime<Utc>,
        args: &A,
    ) -> Result<T, WorkflowError>
    where
        T: DeserializeOwned,
        A: Serialize + ?Sized,
    {
        let params = codec::encode(args)?;
        let raw = self
            .schedule_result(method, params, eta, true, false)
            .await?;
        Ok(codec::decode(&raw)?)
    }

    /// Run a registered activity keyed by call order instead of arguments
    ///
    /// Use this when the same method is called repeatedly with identical
    /// arguments and each call must execute.
    pub async fn schedule_seq<T, A>(&self, method: &str, args: &A) -> Result<T, WorkflowError>
    where
        T: DeserializeOwned,
        A: Serialize + ?Sized,
    {
        let params = codec::encode(args)?;
        let eta = self.core.clock.utc_now();
        let raw = self
            .schedule_result(method, params, eta, false, false)
            .await?;
        Ok(codec::decode(&raw)?)
    }

    /// Durable pause measured from the virtual clock
    pub async fn delay(&self, duration: Duration) -> Result<(), WorkflowError> {
        let until = self.current_utc()
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        self.delay_until(until).await
    }

    /// Durable pause until an absolute instant
    pub async fn delay_until(&self, until: DateTime<Utc>) -> Result<(), WorkflowError> {
        let params = codec::encode(&until)?;
        let raw = self
            .schedule_result(DELAY_METHOD, params, until, true, true)
            .await?;
        codec::decode::<()>(&raw)?;
        Ok(())
    }

    /// Wait for one of the named external events, up to `max_wait`
    ///
    /// The deadline is measured from the virtual clock. Returns the
    /// delivered `{name, value}` pair, or the timeout outcome when the
    /// deadline passes first.
    pub async fn wait_for_events(
        &self,
        names: &[&str],
        max_wait: Duration,
    ) -> Result<EventOutcome, WorkflowError> {
        let until = self.current_utc()
            + chrono::Duration::from_std(max_wait).unwrap_or_else(|_| chrono::Duration::zero());
        self.wait_for_events_until(names, until).await
    }

    /// Wait for one of the named external events until an absolute deadline
    pub async fn wait_for_events_until(
        &self,
        names: &[&str],
        until: DateTime<Utc>,
    ) -> Result<EventOutcome, WorkflowError> {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        self.event_wait(names, until).await
    }

    /// Run another workflow as a child and await its result
    ///
    /// The child id is deterministic (`"{parent}-{type}"`), so replays
    /// re-attach to the same child. The parent suspends while the child
    /// runs and is woken when it terminates; a failed child surfaces as
    /// [`WorkflowError::ActivityFailed`].
    pub async fn child_workflow<W: Workflow>(
        &self,
        input: &W::Input,
    ) -> Result<W::Output, WorkflowError> {
        let _guard = self.enter_primitive()?;

        if !self.core.registry.contains(W::TYPE) {
            return Err(WorkflowError::fatal(format!(
                "unknown workflow type: {}",
                W::TYPE
            )));
        }

        let child_id = format!("{}-{}", self.id, W::TYPE);
        loop {
            match self.core.store.get_workflow(&child_id).await? {
                Some(child) if child.state == ExecutionState::Completed => {
                    self.advance_virtual_clock(child.utc_updated);
                    let raw = child.response.unwrap_or_else(|| codec::NULL.to_string());
                    return Ok(codec::decode(&raw)?);
                }
                Some(child) if child.state == ExecutionState::Failed => {
                    return Err(WorkflowError::ActivityFailed(
                        child.response.unwrap_or_default(),
                    ));
                }
                Some(_) => {
                    // Child still in flight. Park; its termination bumps our ETA.
                    let eta = self.core.clock.utc_now()
                        + chrono::Duration::from_std(self.core.config.poll_interval)
                            .unwrap_or_else(|_| chrono::Duration::seconds(15));
                    self.save_workflow(&|wf| wf.utc_eta = eta).await?;
                    return Err(WorkflowError::Suspended);
                }
                None => {
                    let now = self.core.clock.utc_now();
                    let child = WorkflowEntity::new(&child_id, W::TYPE, codec::encode(input)?, now)
                        .with_parent(&self.id);
                    match self.core.store.insert_workflow(&child).await {
                        Ok(()) => {
                            debug!(parent = %self.id, child = %child_id, "spawned child workflow");
                            self.core.trigger.notify_one();
                        }
                        // Another replay of this parent raced the insert.
                        Err(StoreError::AlreadyExists(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    // =========================================================================
    // Replay core
    // =========================================================================

    /// The commit-point loop shared by activities and timers
    async fn schedule_result(
        &self,
        method: &str,
        params: String,
        eta: DateTime<Utc>,
        unique_by_args: bool,
        timer: bool,
    ) -> Result<String, WorkflowError> {
        let _guard = self.enter_primitive()?;
        if params.len() > MAX_PARAMETER_BYTES {
            return Err(WorkflowError::fatal(format!(
                "parameters for {method} exceed {MAX_PARAMETER_BYTES} bytes"
            )));
        }
        let key = self.call_key(method, &params, unique_by_args);

        loop {
            let existing = self.core.store.get_activity(&self.id, &key).await?;
            if let Some(act) = &existing {
                match act.state {
                    ExecutionState::Completed => {
                        self.advance_virtual_clock(act.utc_updated);
                        return Ok(act
                            .response
                            .clone()
                            .unwrap_or_else(|| codec::NULL.to_string()));
                    }
                    ExecutionState::Failed => {
                        return Err(WorkflowError::ActivityFailed(
                            act.response.clone().unwrap_or_default(),
                        ));
                    }
                    _ => {}
                }
            }

            // The stored entity carries the authoritative ETA once it exists.
            let due_at = existing.as_ref().map(|a| a.utc_eta).unwrap_or(eta);
            let now = self.core.clock.utc_now();
            let diff = due_at - now;
            let threshold = chrono::Duration::from_std(self.core.config.suspend_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(15));

            if diff > threshold {
                debug!(workflow_id = %self.id, %method, eta = %due_at, "suspending until due");
                self.save_workflow(&|wf| wf.utc_eta = due_at).await?;
                return Err(WorkflowError::Suspended);
            }
            if diff > chrono::Duration::zero() {
                tokio::time::sleep(diff.to_std().unwrap_or_default()).await;
            }

            let entity = match existing {
                Some(entity) => entity,
                None => {
                    let now = self.core.clock.utc_now();
                    let fresh =
                        ActivityEntity::new(&key, &self.id, method, &params, due_at, now);
                    self.core.store.insert_activity(fresh, &[]).await?
                }
            };

            let lock = self
                .core
                .store
                .acquire_lock(&self.id, entity.sequence_id)
                .await?;
            let outcome = self.execute_call(method, &params, &entity, timer).await;
            if let Err(err) = self.core.store.release_lock(lock).await {
                warn!(workflow_id = %self.id, "failed to release execution lease: {err}");
            }
            outcome?;
            // Loop back and consume the now-terminal entity.
        }
    }

    /// Execute the activity body (or fire the timer) under the held lease
    async fn execute_call(
        &self,
        method: &str,
        params: &str,
        entity: &ActivityEntity,
        timer: bool,
    ) -> Result<(), WorkflowError> {
        // Re-read under the lease: another holder may have finished it.
        let Some(fresh) = self.core.store.get_activity(&self.id, &entity.id).await? else {
            return Err(WorkflowError::fatal(format!(
                "activity {} vanished mid-run",
                entity.id
            )));
        };
        if fresh.is_terminal() {
            return Ok(());
        }

        let (state, response) = if timer {
            (ExecutionState::Completed, codec::NULL.to_string())
        } else {
            let Some(handler) = self.core.registry.activity(method) else {
                return Err(WorkflowError::fatal(format!(
                    "no activity registered as {method}"
                )));
            };
            let args: Value = codec::decode(params)?;
            let invocation = ActivityInvocation {
                workflow_id: self.id.clone(),
                method: method.to_string(),
                args,
                scope: self.core.registry.build_scope(),
            };

            debug!(workflow_id = %self.id, %method, "running activity");
            match handler(invocation).await {
                Ok(value) => (ExecutionState::Completed, value.to_string()),
                Err(err) => {
                    warn!(workflow_id = %self.id, %method, "activity failed: {}", err.message);
                    (ExecutionState::Failed, err.message)
                }
            }
        };

        self.persist_outcome(&entity.id, &|act| {
            act.state = state;
            act.response = Some(response.clone());
        })
        .await
    }

    /// The event-wait commit point
    async fn event_wait(
        &self,
        names: Vec<String>,
        until: DateTime<Utc>,
    ) -> Result<EventOutcome, WorkflowError> {
        let _guard = self.enter_primitive()?;
        let params = codec::encode(&names)?;
        let key = self.call_key(EVENT_WAIT_METHOD, &params, false);

        loop {
            let existing = self.core.store.get_activity(&self.id, &key).await?;
            if let Some(act) = &existing {
                match act.state {
                    ExecutionState::Completed => {
                        self.advance_virtual_clock(act.utc_updated);
                        let raw = act.response.clone().unwrap_or_else(|| codec::NULL.to_string());
                        return Ok(codec::decode(&raw)?);
                    }
                    ExecutionState::Failed => {
                        return Err(WorkflowError::ActivityFailed(
                            act.response.clone().unwrap_or_default(),
                        ));
                    }
                    _ => {}
                }
            }

            let entity = match existing {
                Some(entity) => entity,
                None => {
                    let now = self.core.clock.utc_now();
                    let fresh = ActivityEntity::new(
                        &key,
                        &self.id,
                        EVENT_WAIT_METHOD,
                        &params,
                        until,
                        now,
                    );
                    let routes: Vec<EventRoute> = names
                        .iter()
                        .map(|name| EventRoute {
                            workflow_id: self.id.clone(),
                            name: name.clone(),
                            activity_id: key.clone(),
                        })
                        .collect();
                    let inserted = self.core.store.insert_activity(fresh, &routes).await?;
                    if inserted.is_terminal() {
                        continue;
                    }
                    inserted
                }
            };

            let now = self.core.clock.utc_now();
            if now < entity.utc_eta {
                // Still in the window: park on the wait. The ETA doubles as
                // the timeout revival, and the waiting id lets event
                // delivery find us without scanning.
                let wait_key = key.clone();
                let deadline = entity.utc_eta;
                debug!(workflow_id = %self.id, ?names, until = %deadline, "waiting for events");
                self.save_workflow(&move |wf| {
                    wf.current_waiting_id = Some(wait_key.clone());
                    wf.utc_eta = deadline;
                })
                .await?;
                return Err(WorkflowError::Suspended);
            }

            // Deadline passed with no delivery: record the timeout outcome.
            self.complete_event_timeout(&entity).await?;
        }
    }

    /// Write the timeout completion under the lease; delivery wins races
    async fn complete_event_timeout(&self, entity: &ActivityEntity) -> Result<(), WorkflowError> {
        let lock = self
            .core
            .store
            .acquire_lock(&self.id, entity.sequence_id)
            .await?;
        let timeout = codec::encode(&EventOutcome::timeout())?;
        let result = self
            .persist_outcome_with(&entity.id, &|act| {
                act.state = ExecutionState::Completed;
                act.response = Some(timeout.clone());
            }, &|wf| {
                wf.current_waiting_id = None;
            })
            .await;
        if let Err(err) = self.core.store.release_lock(lock).await {
            warn!(workflow_id = %self.id, "failed to release execution lease: {err}");
        }
        result
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn enter_primitive(&self) -> Result<PrimitiveGuard<'_>, WorkflowError> {
        let mut state = self.state.lock();
        if state.primitive_active {
            return Err(WorkflowError::fatal(
                "durable primitives must be awaited one at a time",
            ));
        }
        state.primitive_active = true;
        Ok(PrimitiveGuard { ctx: self })
    }

    fn call_key(&self, method: &str, params: &str, unique_by_args: bool) -> String {
        let mut state = self.state.lock();
        let index = if unique_by_args {
            0
        } else {
            let counter = state.call_counters.entry(method.to_string()).or_insert(0);
            let index = *counter;
            *counter += 1;
            index
        };
        activity_key(method, params, unique_by_args, index)
    }

    fn advance_virtual_clock(&self, to: DateTime<Utc>) {
        let mut state = self.state.lock();
        if to > state.virtual_now {
            state.virtual_now = to;
        }
    }

    fn snapshot(&self) -> WorkflowEntity {
        self.state.lock().entity.clone()
    }

    fn adopt(&self, entity: WorkflowEntity) {
        self.state.lock().entity = entity;
    }

    /// Persist a workflow mutation with bounded contention retry
    async fn save_workflow(
        &self,
        mutate: &(dyn Fn(&mut WorkflowEntity) + Sync),
    ) -> Result<(), WorkflowError> {
        let attempts = self.core.config.contention_retries.max(1);
        for attempt in 0..attempts {
            let mut entity = self.snapshot();
            mutate(&mut entity);
            entity.utc_updated = self.core.clock.utc_now();

            let mut set = SaveSet::new().workflow(entity);
            match self.core.store.save(&mut set).await {
                Ok(()) => {
                    self.adopt(set.workflows.pop().expect("workflow in set"));
                    return Ok(());
                }
                Err(StoreError::Conflict { .. }) if attempt + 1 < attempts => {
                    if let Some(fresh) = self.core.store.get_workflow(&self.id).await? {
                        self.adopt(fresh);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        unreachable!("save loop returns on success or error")
    }

    /// Persist an activity outcome along with the workflow touch
    async fn persist_outcome(
        &self,
        activity_id: &str,
        apply: &(dyn Fn(&mut ActivityEntity) + Sync),
    ) -> Result<(), WorkflowError> {
        self.persist_outcome_with(activity_id, apply, &|_| {}).await
    }

    /// Persist an activity outcome and a workflow mutation atomically
    ///
    /// The first terminal write wins: if the activity is already terminal
    /// when (re)read, nothing is written.
    async fn persist_outcome_with(
        &self,
        activity_id: &str,
        apply: &(dyn Fn(&mut ActivityEntity) + Sync),
        mutate_wf: &(dyn Fn(&mut WorkflowEntity) + Sync),
    ) -> Result<(), WorkflowError> {
        let attempts = self.core.config.contention_retries.max(1);
        for attempt in 0..attempts {
            let Some(mut act) = self.core.store.get_activity(&self.id, activity_id).await? else {
                return Err(WorkflowError::fatal(format!(
                    "activity {activity_id} vanished mid-run"
                )));
            };
            if act.is_terminal() {
                return Ok(());
            }

            let now = self.core.clock.utc_now();
            apply(&mut act);
            act.utc_updated = now;

            let mut wf = self.snapshot();
            mutate_wf(&mut wf);
            wf.utc_updated = now;

            let mut set = SaveSet::new().workflow(wf).activity(act);
            match self.core.store.save(&mut set).await {
                Ok(()) => {
                    self.adopt(set.workflows.pop().expect("workflow in set"));
                    return Ok(());
                }
                Err(StoreError::Conflict { .. }) if attempt + 1 < attempts => {
                    if let Some(fresh) = self.core.store.get_workflow(&self.id).await? {
                        self.adopt(fresh);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        unreachable!("save loop returns on success or error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::engine::{EngineConfig, WorkflowRegistry};
    use crate::storage::{InMemoryWorkflowStore, MemoryStoreConfig, WorkflowStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_store() -> Arc<InMemoryWorkflowStore> {
        Arc::new(InMemoryWorkflowStore::with_config(
            MemoryStoreConfig::default()
                .with_lock_retry_delay(Duration::from_millis(5))
                .with_lock_max_attempts(3),
        ))
    }

    async fn context_for(
        registry: WorkflowRegistry,
        store: Arc<InMemoryWorkflowStore>,
    ) -> WorkflowContext {
        let core = Arc::new(EngineCore::new(
            store.clone(),
            registry,
            EngineConfig::default().with_suspend_threshold(Duration::from_millis(50)),
            Arc::new(SystemClock),
        ));

        let entity = WorkflowEntity::new("wf-ctx", "test", codec::NULL, core.clock.utc_now());
        store.insert_workflow(&entity).await.unwrap();
        WorkflowContext::new(core, entity)
    }

    #[tokio::test]
    async fn test_schedule_runs_once_and_replays() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();

        let mut registry = WorkflowRegistry::new();
        registry.register_activity("double", move |inv| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                let n: i64 = inv.args()?;
                Ok(json!(n * 2))
            }
        });

        let store = fast_store();
        let ctx = context_for(registry, store.clone()).await;

        let first: i64 = ctx.schedule("double", &21).await.unwrap();
        let second: i64 = ctx.schedule("double", &21).await.unwrap();

        assert_eq!(first, 42);
        assert_eq!(second, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let act = store
            .get_activity("wf-ctx", &activity_key("double", "21", true, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(act.state, ExecutionState::Completed);
    }

    #[tokio::test]
    async fn test_schedule_seq_distinguishes_calls() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();

        let mut registry = WorkflowRegistry::new();
        registry.register_activity("tick", move |_inv| {
            let seen = seen.clone();
            async move { Ok(json!(seen.fetch_add(1, Ordering::SeqCst))) }
        });

        let ctx = context_for(registry, fast_store()).await;

        let a: usize = ctx.schedule_seq("tick", &()).await.unwrap();
        let b: usize = ctx.schedule_seq("tick", &()).await.unwrap();

        assert_eq!((a, b), (0, 1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stored_failure_replays_without_rerun() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();

        let mut registry = WorkflowRegistry::new();
        registry.register_activity("explode", move |_inv| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(crate::activity::ActivityError::msg("boom"))
            }
        });

        let ctx = context_for(registry, fast_store()).await;

        let first = ctx.schedule::<Value, _>("explode", &()).await;
        let second = ctx.schedule::<Value, _>("explode", &()).await;

        assert!(matches!(first, Err(WorkflowError::ActivityFailed(m)) if m == "boom"));
        assert!(matches!(second, Err(WorkflowError::ActivityFailed(m)) if m == "boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_long_delay_suspends_with_eta() {
        let store = fast_store();
        let ctx = context_for(WorkflowRegistry::new(), store.clone()).await;

        let result = ctx.delay(Duration::from_secs(3600)).await;
        assert!(matches!(result, Err(WorkflowError::Suspended)));

        let entity = store.get_workflow("wf-ctx").await.unwrap().unwrap();
        assert!(entity.utc_eta > Utc::now() + chrono::Duration::minutes(50));
    }

    #[tokio::test]
    async fn test_short_delay_completes_in_process() {
        let ctx = context_for(WorkflowRegistry::new(), fast_store()).await;

        let before = ctx.current_utc();
        ctx.delay(Duration::from_millis(20)).await.unwrap();

        // Consuming the timer advanced the virtual clock.
        assert!(ctx.current_utc() > before);
    }

    #[tokio::test]
    async fn test_event_wait_suspends_and_routes() {
        let store = fast_store();
        let ctx = context_for(WorkflowRegistry::new(), store.clone()).await;

        let result = ctx
            .wait_for_events(&["approve"], Duration::from_secs(3600))
            .await;
        assert!(matches!(result, Err(WorkflowError::Suspended)));

        let entity = store.get_workflow("wf-ctx").await.unwrap().unwrap();
        let waiting = entity.current_waiting_id.unwrap();
        let route = store
            .get_event_route("wf-ctx", "approve")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(route.activity_id, waiting);
    }

    #[tokio::test]
    async fn test_event_wait_past_deadline_times_out() {
        let store = fast_store();
        let ctx = context_for(WorkflowRegistry::new(), store.clone()).await;

        let outcome = ctx
            .wait_for_events(&["approve"], Duration::ZERO)
            .await
            .unwrap();

        assert!(outcome.is_timeout());
        let entity = store.get_workflow("wf-ctx").await.unwrap().unwrap();
        assert!(entity.current_waiting_id.is_none());
    }

    #[tokio::test]
    async fn test_oversized_parameters_are_fatal() {
        let ctx = context_for(WorkflowRegistry::new(), fast_store()).await;

        let huge = "x".repeat(MAX_PARAMETER_BYTES + 1);
        let result = ctx.schedule::<Value, _>("ingest", &huge).await;

        assert!(matches!(result, Err(WorkflowError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_concurrent_primitives_rejected() {
        let ctx = context_for(WorkflowRegistry::new(), fast_store()).await;

        let (a, b) = futures::join!(
            ctx.delay(Duration::from_millis(10)),
            ctx.delay(Duration::from_millis(10)),
        );

        let fatal = |r: &Result<(), WorkflowError>| matches!(r, Err(WorkflowError::Fatal(_)));
        assert!(fatal(&a) || fatal(&b));
    }
}
