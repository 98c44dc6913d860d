//! WorkflowStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::entity::{ActivityEntity, EventRoute, WorkflowEntity};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Insert with a duplicate workflow id
    #[error("workflow already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency failed for one entity in a save set
    #[error("concurrency conflict on {id}: expected etag {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    /// The execution lease could not be acquired within the bounded window
    #[error("lock on workflow {0} not acquired within the retry bound")]
    LockTimeout(String),

    /// Backend error
    #[error("backend error: {0}")]
    Backend(String),
}

/// Opaque handle to a held execution lease
///
/// Returned by [`WorkflowStore::acquire_lock`] and passed back to
/// [`WorkflowStore::release_lock`]. Dropping the handle without releasing
/// leaves the lease to expire on its TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    /// Workflow the lease covers
    pub workflow_id: String,

    /// Token distinguishing this holder from a later one
    pub token: Uuid,
}

/// Set of entities to persist atomically
///
/// `save` checks every entity's etag against the stored value and applies
/// all writes or none.
#[derive(Debug, Default)]
pub struct SaveSet {
    /// Workflow entities to write
    pub workflows: Vec<WorkflowEntity>,

    /// Activity entities to write
    pub activities: Vec<ActivityEntity>,
}

impl SaveSet {
    /// Create an empty save set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a workflow entity
    pub fn workflow(mut self, entity: WorkflowEntity) -> Self {
        self.workflows.push(entity);
        self
    }

    /// Add an activity entity
    pub fn activity(mut self, entity: ActivityEntity) -> Self {
        self.activities.push(entity);
        self
    }

    /// Whether the set contains nothing to write
    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty() && self.activities.is_empty()
    }
}

/// Store for workflow and activity entities
///
/// This trait is the engine's only storage dependency. Implementations must
/// be thread-safe and provide the transactional guarantees documented per
/// method; any key-value or row store that can satisfy them suffices.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    // =========================================================================
    // Workflow Entities
    // =========================================================================

    /// Insert a new workflow entity
    ///
    /// Fails with [`StoreError::AlreadyExists`] when the id is taken.
    async fn insert_workflow(&self, entity: &WorkflowEntity) -> Result<(), StoreError>;

    /// Get a workflow entity by id
    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowEntity>, StoreError>;

    /// Persist a set of entities atomically
    ///
    /// Every entity's `etag` must match the stored value; on success all
    /// etags in the set are bumped in place. Any mismatch fails the whole
    /// set with [`StoreError::Conflict`] and writes nothing.
    ///
    /// Saving a workflow whose new ETA lies in the future (a suspension, a
    /// terminal retention mark) releases its poll lock, so the entity is
    /// pollable the moment it is due again. A save that leaves the entity
    /// due keeps the claim: the worker is still mid-drive.
    async fn save(&self, set: &mut SaveSet) -> Result<(), StoreError>;

    /// Delete a workflow entity by id and etag
    async fn delete_workflow(&self, entity: &WorkflowEntity) -> Result<(), StoreError>;

    /// Claim due workflow entities
    ///
    /// Returns up to `max` entities with `utc_eta <= now` that are not
    /// currently poll-locked, ordered by `utc_eta` ascending, and atomically
    /// poll-locks each returned entity for the configured poll lease so
    /// concurrent pollers skip them. Due terminal entities are included so
    /// the dispatcher can garbage-collect them.
    async fn poll_due(
        &self,
        max: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkflowEntity>, StoreError>;

    // =========================================================================
    // Execution Leases
    // =========================================================================

    /// Acquire the per-workflow execution lease
    ///
    /// Blocks with bounded retry while another holder is active; surfaces
    /// [`StoreError::LockTimeout`] when the bound is exhausted. The lease
    /// expires on its TTL if never released.
    async fn acquire_lock(
        &self,
        workflow_id: &str,
        sequence_id: i64,
    ) -> Result<LockHandle, StoreError>;

    /// Release a held lease; idempotent
    async fn release_lock(&self, handle: LockHandle) -> Result<(), StoreError>;

    // =========================================================================
    // Activity Entities
    // =========================================================================

    /// Insert an activity entity, assigning its per-workflow sequence id
    ///
    /// Writes the event routing records in the same transaction. Inserting
    /// an existing key returns the stored entity unchanged: this is the
    /// replay dedup point.
    async fn insert_activity(
        &self,
        entity: ActivityEntity,
        routes: &[EventRoute],
    ) -> Result<ActivityEntity, StoreError>;

    /// Get an activity entity by its deterministic key
    async fn get_activity(
        &self,
        workflow_id: &str,
        activity_id: &str,
    ) -> Result<Option<ActivityEntity>, StoreError>;

    /// Resolve an event name to the waiting activity's key
    async fn get_event_route(
        &self,
        workflow_id: &str,
        name: &str,
    ) -> Result<Option<EventRoute>, StoreError>;

    /// Remove all activity entities and routes for a workflow
    async fn delete_history(&self, workflow_id: &str) -> Result<(), StoreError>;
}
