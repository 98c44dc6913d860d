//! Driving one due workflow entity
//!
//! The dispatcher hands claimed entities here. A drive reloads the entity
//! (its state may have advanced since the poll), garbage-collects terminal
//! entities whose retention passed, rehydrates the workflow through the
//! registry, runs the orchestration body, and maps the outcome to a state
//! save. Storage errors abandon the cycle: the poll lease expires and
//! another worker retakes the entity.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::storage::{ExecutionState, SaveSet, StoreError, WorkflowEntity};
use crate::workflow::{WorkflowContext, WorkflowError};

use super::EngineCore;

impl EngineCore {
    /// Drive one claimed entity; never propagates
    #[instrument(skip(self, polled), fields(workflow_id = %polled.id))]
    pub(crate) async fn run_workflow(self: Arc<Self>, polled: WorkflowEntity) {
        if let Err(err) = Self::drive(&self, polled).await {
            match err {
                WorkflowError::Store(e) => {
                    warn!("cycle abandoned on store error: {e}");
                }
                other => {
                    error!("workflow drive failed: {other}");
                }
            }
        }
    }

    async fn drive(core: &Arc<Self>, polled: WorkflowEntity) -> Result<(), WorkflowError> {
        let Some(entity) = core.store.get_workflow(&polled.id).await? else {
            return Ok(());
        };
        let now = core.clock.utc_now();

        if entity.is_terminal() {
            if entity.utc_eta <= now {
                core.collect(entity).await?;
            }
            return Ok(());
        }
        if entity.utc_eta > now {
            // Advanced by a concurrent save since the poll.
            return Ok(());
        }

        let Some(registered) = core.registry.workflow(&entity.type_name) else {
            warn!(workflow_type = %entity.type_name, "unknown workflow type");
            let message = format!("unknown workflow type: {}", entity.type_name);
            let retention = Duration::from_secs(24 * 60 * 60);
            return core
                .finish(entity, ExecutionState::Failed, message, retention)
                .await;
        };
        let preserve_time = registered.preserve_time;
        let failure_preserve_time = registered.failure_preserve_time;
        let instance = registered.instantiate();

        // Claim the entity; losing the etag race means another worker has it.
        let mut running = entity.clone();
        running.state = ExecutionState::Running;
        running.utc_updated = now;
        let mut set = SaveSet::new().workflow(running);
        match core.store.save(&mut set).await {
            Ok(()) => {}
            Err(StoreError::Conflict { .. }) => {
                debug!("lost the claim race");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        let entity = set.workflows.pop().expect("workflow in set");

        let input = entity.input.clone();
        let ctx = WorkflowContext::new(Arc::clone(core), entity);
        let outcome = instance.run(&ctx, &input).await;
        let entity = ctx.into_entity();

        match outcome {
            Ok(encoded) => {
                info!("workflow completed");
                core.finish(entity, ExecutionState::Completed, encoded, preserve_time)
                    .await
            }
            Err(WorkflowError::Suspended) => {
                debug!("workflow suspended");
                core.persist_suspension(entity).await
            }
            Err(WorkflowError::Store(e)) => Err(WorkflowError::Store(e)),
            Err(err) => {
                warn!("workflow failed: {err}");
                core.finish(
                    entity,
                    ExecutionState::Failed,
                    err.to_string(),
                    failure_preserve_time,
                )
                .await
            }
        }
    }

    /// Persist the suspended state; the ETA was placed by the primitive
    async fn persist_suspension(&self, entity: WorkflowEntity) -> Result<(), WorkflowError> {
        let attempts = self.config.contention_retries.max(1);
        let mut current = entity;
        for attempt in 0..attempts {
            current.state = ExecutionState::Suspended;
            current.utc_updated = self.clock.utc_now();

            let mut set = SaveSet::new().workflow(current.clone());
            match self.store.save(&mut set).await {
                Ok(()) => return Ok(()),
                Err(StoreError::Conflict { .. }) if attempt + 1 < attempts => {
                    // An event delivery may have landed mid-suspension; keep
                    // its ETA so the revival is not delayed.
                    match self.store.get_workflow(&current.id).await? {
                        Some(fresh) => current = fresh,
                        None => return Ok(()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        unreachable!("save loop returns on success or error")
    }

    /// Persist a terminal outcome and notify the parent, if any
    async fn finish(
        &self,
        entity: WorkflowEntity,
        state: ExecutionState,
        response: String,
        retention: Duration,
    ) -> Result<(), WorkflowError> {
        let parent_id = entity.parent_id.clone();
        let child_id = entity.id.clone();
        let retention = chrono::Duration::from_std(retention)
            .unwrap_or_else(|_| chrono::Duration::seconds(3600));

        let attempts = self.config.contention_retries.max(1);
        let mut current = entity;
        for attempt in 0..attempts {
            let now = self.clock.utc_now();
            current.state = state;
            current.response = Some(response.clone());
            current.utc_eta = now + retention;
            current.utc_updated = now;
            current.current_waiting_id = None;

            let mut set = SaveSet::new();
            if let Some(parent_id) = &parent_id {
                if let Some(mut parent) = self.store.get_workflow(parent_id).await? {
                    if !parent.is_terminal() {
                        // Wake the parent in the same save.
                        parent.utc_eta = now;
                        parent.utc_updated = now;
                        set.workflows.push(parent);
                    }
                }
            }
            set.workflows.push(current.clone());

            match self.store.save(&mut set).await {
                Ok(()) => break,
                Err(StoreError::Conflict { .. }) if attempt + 1 < attempts => {
                    match self.store.get_workflow(&child_id).await? {
                        Some(fresh) if fresh.is_terminal() => return Ok(()),
                        Some(fresh) => current = fresh,
                        None => return Ok(()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(parent_id) = parent_id {
            // A parent waiting by event on the child id unblocks too.
            let value = if state == ExecutionState::Completed {
                json!("Success")
            } else {
                json!("Failed")
            };
            if let Err(err) = self.raise_event(&parent_id, &child_id, value, false).await {
                warn!(parent = %parent_id, "parent notification failed: {err}");
            }
            self.trigger.notify_one();
        }

        Ok(())
    }

    /// Garbage-collect a terminal entity whose retention window passed
    async fn collect(&self, entity: WorkflowEntity) -> Result<(), WorkflowError> {
        let delete_history = self
            .registry
            .workflow(&entity.type_name)
            .map(|r| r.delete_history)
            .unwrap_or(true);

        if delete_history {
            self.store.delete_history(&entity.id).await?;
        }

        match self.store.delete_workflow(&entity).await {
            Ok(()) => {
                info!(state = %entity.state, "collected terminal workflow");
                Ok(())
            }
            Err(StoreError::Conflict { .. }) => {
                debug!("entity changed since poll, skipping collection");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::codec;
    use crate::engine::{EngineConfig, WorkflowRegistry};
    use crate::storage::{InMemoryWorkflowStore, WorkflowStore};
    use crate::workflow::Workflow;
    use async_trait::async_trait;
    use chrono::Utc;

    struct UpperWorkflow;

    #[async_trait]
    impl Workflow for UpperWorkflow {
        const TYPE: &'static str = "upper";
        type Input = String;
        type Output = String;

        fn new() -> Self {
            Self
        }

        fn preserve_time() -> Duration {
            Duration::from_millis(50)
        }

        async fn run(
            &self,
            _ctx: &WorkflowContext,
            input: Self::Input,
        ) -> Result<Self::Output, WorkflowError> {
            Ok(input.to_uppercase())
        }
    }

    struct FailingWorkflow;

    #[async_trait]
    impl Workflow for FailingWorkflow {
        const TYPE: &'static str = "failing";
        type Input = ();
        type Output = ();

        fn new() -> Self {
            Self
        }

        async fn run(
            &self,
            _ctx: &WorkflowContext,
            _input: Self::Input,
        ) -> Result<Self::Output, WorkflowError> {
            Err(WorkflowError::fatal("bad configuration"))
        }
    }

    async fn core_with(registry: WorkflowRegistry) -> (Arc<EngineCore>, Arc<InMemoryWorkflowStore>) {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let core = Arc::new(EngineCore::new(
            store.clone(),
            registry,
            EngineConfig::default(),
            Arc::new(SystemClock),
        ));
        (core, store)
    }

    #[tokio::test]
    async fn test_drive_to_completion() {
        let mut registry = WorkflowRegistry::new();
        registry.register::<UpperWorkflow>();
        let (core, store) = core_with(registry).await;

        let entity = WorkflowEntity::new("wf-1", "upper", codec::encode(&"hi").unwrap(), Utc::now());
        store.insert_workflow(&entity).await.unwrap();

        core.clone().run_workflow(entity).await;

        let loaded = store.get_workflow("wf-1").await.unwrap().unwrap();
        assert_eq!(loaded.state, ExecutionState::Completed);
        assert_eq!(loaded.response.as_deref(), Some("\"HI\""));
        assert!(loaded.utc_eta > loaded.utc_created);
    }

    #[tokio::test]
    async fn test_drive_failure() {
        let mut registry = WorkflowRegistry::new();
        registry.register::<FailingWorkflow>();
        let (core, store) = core_with(registry).await;

        let entity = WorkflowEntity::new("wf-1", "failing", codec::NULL, Utc::now());
        store.insert_workflow(&entity).await.unwrap();

        core.clone().run_workflow(entity).await;

        let loaded = store.get_workflow("wf-1").await.unwrap().unwrap();
        assert_eq!(loaded.state, ExecutionState::Failed);
        assert!(loaded.response.as_deref().unwrap().contains("bad configuration"));
    }

    #[tokio::test]
    async fn test_unknown_type_fails_workflow() {
        let (core, store) = core_with(WorkflowRegistry::new()).await;

        let entity = WorkflowEntity::new("wf-1", "ghost", codec::NULL, Utc::now());
        store.insert_workflow(&entity).await.unwrap();

        core.clone().run_workflow(entity).await;

        let loaded = store.get_workflow("wf-1").await.unwrap().unwrap();
        assert_eq!(loaded.state, ExecutionState::Failed);
        assert!(loaded
            .response
            .as_deref()
            .unwrap()
            .contains("unknown workflow type"));
    }

    #[tokio::test]
    async fn test_terminal_entity_collected_after_retention() {
        let mut registry = WorkflowRegistry::new();
        registry.register::<UpperWorkflow>();
        let (core, store) = core_with(registry).await;

        let entity = WorkflowEntity::new("wf-1", "upper", codec::encode(&"hi").unwrap(), Utc::now());
        store.insert_workflow(&entity).await.unwrap();
        core.clone().run_workflow(entity).await;

        // Within the retention window nothing is deleted.
        let loaded = store.get_workflow("wf-1").await.unwrap().unwrap();
        core.clone().run_workflow(loaded.clone()).await;
        assert!(store.get_workflow("wf-1").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let loaded = store.get_workflow("wf-1").await.unwrap().unwrap();
        core.clone().run_workflow(loaded).await;
        assert!(store.get_workflow("wf-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_future_eta_is_skipped() {
        let mut registry = WorkflowRegistry::new();
        registry.register::<UpperWorkflow>();
        let (core, store) = core_with(registry).await;

        let entity = WorkflowEntity::new("wf-1", "upper", codec::encode(&"hi").unwrap(), Utc::now())
            .with_eta(Utc::now() + chrono::Duration::hours(1));
        store.insert_workflow(&entity).await.unwrap();

        core.clone().run_workflow(entity).await;

        let loaded = store.get_workflow("wf-1").await.unwrap().unwrap();
        assert_eq!(loaded.state, ExecutionState::Queued);
    }
}
