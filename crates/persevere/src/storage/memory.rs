//! In-memory implementation of WorkflowStore

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};

use super::entity::{ActivityEntity, EventRoute, WorkflowEntity};
use super::store::{LockHandle, SaveSet, StoreError, WorkflowStore};

/// Tuning knobs for the in-memory store
///
/// Tests shrink the durations to the millisecond scale.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryStoreConfig {
    /// How long a polled entity stays invisible to other pollers
    pub poll_lease: Duration,

    /// TTL of the per-workflow execution lease
    pub lock_ttl: Duration,

    /// Delay between lease acquisition attempts
    pub lock_retry_delay: Duration,

    /// Maximum lease acquisition attempts before surfacing a timeout
    pub lock_max_attempts: u32,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            poll_lease: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(59),
            lock_retry_delay: Duration::from_secs(20),
            lock_max_attempts: 30,
        }
    }
}

impl MemoryStoreConfig {
    /// Create a config with the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the poll lease duration
    pub fn with_poll_lease(mut self, lease: Duration) -> Self {
        self.poll_lease = lease;
        self
    }

    /// Set the execution lease TTL
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Set the lease retry delay
    pub fn with_lock_retry_delay(mut self, delay: Duration) -> Self {
        self.lock_retry_delay = delay;
        self
    }

    /// Set the lease retry bound
    pub fn with_lock_max_attempts(mut self, attempts: u32) -> Self {
        self.lock_max_attempts = attempts.max(1);
        self
    }
}

/// Workflow entity plus its poll-lock mark
struct StoredWorkflow {
    entity: WorkflowEntity,
    poll_locked_until: Option<DateTime<Utc>>,
}

/// A held execution lease
struct ActiveLock {
    token: Uuid,
    expires: DateTime<Utc>,
}

/// In-memory implementation of [`WorkflowStore`]
///
/// The reference implementation: it provides the full contract semantics
/// (etag conflicts, poll locks, bounded lease acquisition, per-workflow
/// sequence assignment) so the engine can be exercised without a backing
/// service.
///
/// # Example
///
/// ```
/// use persevere::storage::InMemoryWorkflowStore;
///
/// let store = InMemoryWorkflowStore::new();
/// assert_eq!(store.workflow_count(), 0);
/// ```
pub struct InMemoryWorkflowStore {
    config: MemoryStoreConfig,
    clock: Arc<dyn Clock>,
    workflows: RwLock<HashMap<String, StoredWorkflow>>,
    activities: RwLock<HashMap<(String, String), ActivityEntity>>,
    routes: RwLock<HashMap<(String, String), EventRoute>>,
    locks: Mutex<HashMap<String, ActiveLock>>,
    sequences: Mutex<HashMap<String, i64>>,
}

impl InMemoryWorkflowStore {
    /// Create a store with default tuning and the system clock
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    /// Create a store with custom tuning
    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self::with_options(config, Arc::new(SystemClock))
    }

    /// Create a store with custom tuning and an injected clock
    pub fn with_options(config: MemoryStoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            workflows: RwLock::new(HashMap::new()),
            activities: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            sequences: Mutex::new(HashMap::new()),
        }
    }

    /// Number of workflow entities
    pub fn workflow_count(&self) -> usize {
        self.workflows.read().len()
    }

    /// Number of activity entities
    pub fn activity_count(&self) -> usize {
        self.activities.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.workflows.write().clear();
        self.activities.write().clear();
        self.routes.write().clear();
        self.locks.lock().clear();
        self.sequences.lock().clear();
    }

    fn try_acquire(&self, workflow_id: &str, now: DateTime<Utc>) -> Option<LockHandle> {
        let mut locks = self.locks.lock();
        match locks.get(workflow_id) {
            Some(held) if held.expires > now => None,
            _ => {
                let token = Uuid::now_v7();
                let ttl = chrono::Duration::from_std(self.config.lock_ttl)
                    .unwrap_or_else(|_| chrono::Duration::seconds(59));
                locks.insert(
                    workflow_id.to_string(),
                    ActiveLock {
                        token,
                        expires: now + ttl,
                    },
                );
                Some(LockHandle {
                    workflow_id: workflow_id.to_string(),
                    token,
                })
            }
        }
    }
}

impl Default for InMemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn insert_workflow(&self, entity: &WorkflowEntity) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        if workflows.contains_key(&entity.id) {
            return Err(StoreError::AlreadyExists(entity.id.clone()));
        }

        workflows.insert(
            entity.id.clone(),
            StoredWorkflow {
                entity: entity.clone(),
                poll_locked_until: None,
            },
        );
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowEntity>, StoreError> {
        Ok(self.workflows.read().get(id).map(|s| s.entity.clone()))
    }

    async fn save(&self, set: &mut SaveSet) -> Result<(), StoreError> {
        let now = self.clock.utc_now();
        let mut workflows = self.workflows.write();
        let mut activities = self.activities.write();

        // Validate every etag before applying anything.
        for wf in &set.workflows {
            let stored = workflows
                .get(&wf.id)
                .ok_or_else(|| StoreError::Backend(format!("unknown workflow: {}", wf.id)))?;
            if stored.entity.etag != wf.etag {
                return Err(StoreError::Conflict {
                    id: wf.id.clone(),
                    expected: wf.etag,
                    actual: stored.entity.etag,
                });
            }
        }
        for act in &set.activities {
            let key = (act.workflow_id.clone(), act.id.clone());
            let stored = activities
                .get(&key)
                .ok_or_else(|| StoreError::Backend(format!("unknown activity: {}", act.id)))?;
            if stored.etag != act.etag {
                return Err(StoreError::Conflict {
                    id: act.id.clone(),
                    expected: act.etag,
                    actual: stored.etag,
                });
            }
        }

        for wf in &mut set.workflows {
            wf.etag += 1;
            let stored = workflows.get_mut(&wf.id).expect("validated above");
            stored.entity = wf.clone();
            if wf.utc_eta > now {
                stored.poll_locked_until = None;
            }
        }
        for act in &mut set.activities {
            act.etag += 1;
            let key = (act.workflow_id.clone(), act.id.clone());
            activities.insert(key, act.clone());
        }

        Ok(())
    }

    async fn delete_workflow(&self, entity: &WorkflowEntity) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        match workflows.get(&entity.id) {
            None => Ok(()),
            Some(stored) if stored.entity.etag != entity.etag => Err(StoreError::Conflict {
                id: entity.id.clone(),
                expected: entity.etag,
                actual: stored.entity.etag,
            }),
            Some(_) => {
                workflows.remove(&entity.id);
                Ok(())
            }
        }
    }

    async fn poll_due(
        &self,
        max: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkflowEntity>, StoreError> {
        let mut workflows = self.workflows.write();

        let mut due: Vec<&mut StoredWorkflow> = workflows
            .values_mut()
            .filter(|s| {
                s.entity.utc_eta <= now && s.poll_locked_until.map_or(true, |until| until <= now)
            })
            .collect();
        due.sort_by_key(|s| s.entity.utc_eta);

        let lease = chrono::Duration::from_std(self.config.poll_lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let mut claimed = Vec::new();
        for stored in due.into_iter().take(max) {
            stored.poll_locked_until = Some(now + lease);
            claimed.push(stored.entity.clone());
        }

        Ok(claimed)
    }

    async fn acquire_lock(
        &self,
        workflow_id: &str,
        _sequence_id: i64,
    ) -> Result<LockHandle, StoreError> {
        for attempt in 0..self.config.lock_max_attempts {
            if let Some(handle) = self.try_acquire(workflow_id, self.clock.utc_now()) {
                return Ok(handle);
            }

            if attempt + 1 < self.config.lock_max_attempts {
                let base = self.config.lock_retry_delay.as_secs_f64();
                let jittered = base * rand::thread_rng().gen_range(0.9..1.1);
                tokio::time::sleep(Duration::from_secs_f64(jittered)).await;
            }
        }

        Err(StoreError::LockTimeout(workflow_id.to_string()))
    }

    async fn release_lock(&self, handle: LockHandle) -> Result<(), StoreError> {
        let mut locks = self.locks.lock();
        if let Some(held) = locks.get(&handle.workflow_id) {
            if held.token == handle.token {
                locks.remove(&handle.workflow_id);
            }
        }
        Ok(())
    }

    async fn insert_activity(
        &self,
        mut entity: ActivityEntity,
        routes: &[EventRoute],
    ) -> Result<ActivityEntity, StoreError> {
        let mut activities = self.activities.write();
        let key = (entity.workflow_id.clone(), entity.id.clone());

        if let Some(existing) = activities.get(&key) {
            return Ok(existing.clone());
        }

        let mut sequences = self.sequences.lock();
        let seq = sequences.entry(entity.workflow_id.clone()).or_insert(0);
        *seq += 1;
        entity.sequence_id = *seq;
        drop(sequences);

        activities.insert(key, entity.clone());

        let mut route_map = self.routes.write();
        for route in routes {
            route_map.insert(
                (route.workflow_id.clone(), route.name.clone()),
                route.clone(),
            );
        }

        Ok(entity)
    }

    async fn get_activity(
        &self,
        workflow_id: &str,
        activity_id: &str,
    ) -> Result<Option<ActivityEntity>, StoreError> {
        let key = (workflow_id.to_string(), activity_id.to_string());
        Ok(self.activities.read().get(&key).cloned())
    }

    async fn get_event_route(
        &self,
        workflow_id: &str,
        name: &str,
    ) -> Result<Option<EventRoute>, StoreError> {
        let key = (workflow_id.to_string(), name.to_string());
        Ok(self.routes.read().get(&key).cloned())
    }

    async fn delete_history(&self, workflow_id: &str) -> Result<(), StoreError> {
        self.activities
            .write()
            .retain(|(wf, _), _| wf != workflow_id);
        self.routes.write().retain(|(wf, _), _| wf != workflow_id);
        self.sequences.lock().remove(workflow_id);
        Ok(())
    }
}
