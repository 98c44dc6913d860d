//! Durable entity model
//!
//! Two principal entity kinds: one [`WorkflowEntity`] per workflow
//! instance, one [`ActivityEntity`] per durable call site evaluated so far
//! by its workflow. Activity ids are deterministic relative to their
//! workflow, which makes the replay shortcut a single point lookup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Execution state shared by workflows and activities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Created but not yet picked up
    Queued,

    /// Currently being driven by a worker
    Running,

    /// Unwound; will be re-driven when its ETA is due
    Suspended,

    /// Finished successfully (terminal)
    Completed,

    /// Finished with an error (terminal)
    Failed,
}

impl ExecutionState {
    /// Terminal states are sticky: only garbage collection removes the entity
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Suspended => write!(f, "suspended"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One workflow instance
///
/// `utc_eta` is the only scheduling input the dispatcher inspects: a
/// suspended workflow is revived when `utc_eta <= now`, and a terminal
/// workflow is collected when its retention ETA passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEntity {
    /// Globally unique identifier, caller-supplied or generated
    pub id: String,

    /// Registered workflow type name, used to rehydrate
    pub type_name: String,

    /// Opaque encoded input
    pub input: String,

    /// Current execution state
    pub state: ExecutionState,

    /// Opaque encoded result when Completed, error string when Failed
    pub response: Option<String>,

    /// Creation timestamp; also the start of the workflow's virtual clock
    pub utc_created: DateTime<Utc>,

    /// Last persisted change
    pub utc_updated: DateTime<Utc>,

    /// Earliest time the dispatcher should re-examine this entity
    pub utc_eta: DateTime<Utc>,

    /// Set when spawned as a child workflow
    pub parent_id: Option<String>,

    /// While set, the workflow is blocked on that activity entity
    pub current_waiting_id: Option<String>,

    /// Optimistic-concurrency token, bumped by every save
    pub etag: u64,
}

impl WorkflowEntity {
    /// Create a fresh queued workflow due immediately
    pub fn new(
        id: impl Into<String>,
        type_name: impl Into<String>,
        input: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            input: input.into(),
            state: ExecutionState::Queued,
            response: None,
            utc_created: now,
            utc_updated: now,
            utc_eta: now,
            parent_id: None,
            current_waiting_id: None,
            etag: 0,
        }
    }

    /// Set the parent workflow id
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Override the initial ETA (deferred start)
    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.utc_eta = eta;
        self
    }

    /// Whether the workflow reached a terminal state
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// One durable call site evaluated by a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntity {
    /// Deterministic key relative to the workflow; the replay key
    pub id: String,

    /// Owning workflow
    pub workflow_id: String,

    /// Name the call site was registered under
    pub method: String,

    /// Opaque encoded argument tuple
    pub parameters: String,

    /// Current execution state
    pub state: ExecutionState,

    /// Opaque encoded result when Completed, error string when Failed
    pub response: Option<String>,

    /// Creation timestamp
    pub utc_created: DateTime<Utc>,

    /// Last persisted change; consuming replays advance the workflow's
    /// virtual clock to this instant
    pub utc_updated: DateTime<Utc>,

    /// When the call site's work becomes due (timers, event deadlines)
    pub utc_eta: DateTime<Utc>,

    /// Storage-assigned, strictly increasing per workflow; the lease key
    pub sequence_id: i64,

    /// Optimistic-concurrency token
    pub etag: u64,
}

impl ActivityEntity {
    /// Create a fresh queued activity; `sequence_id` is assigned on insert
    pub fn new(
        id: impl Into<String>,
        workflow_id: impl Into<String>,
        method: impl Into<String>,
        parameters: impl Into<String>,
        eta: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            workflow_id: workflow_id.into(),
            method: method.into(),
            parameters: parameters.into(),
            state: ExecutionState::Queued,
            response: None,
            utc_created: now,
            utc_updated: now,
            utc_eta: eta,
            sequence_id: 0,
            etag: 0,
        }
    }

    /// Whether the activity reached a terminal state
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Routing record for an event wait
///
/// Lets event delivery find the waiting activity with a point lookup
/// instead of scanning the workflow's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRoute {
    /// Workflow waiting for the event
    pub workflow_id: String,

    /// Event name
    pub name: String,

    /// Key of the waiting activity entity
    pub activity_id: String,
}

/// Deterministic activity key
///
/// With `unique_by_args` the key hashes the method name and encoded
/// arguments, so the same call with the same arguments resolves to the same
/// entity on every replay. Without it, the per-run call-site counter
/// (`call_index`) distinguishes repeated calls to the same method.
pub fn activity_key(method: &str, params: &str, unique_by_args: bool, call_index: u32) -> String {
    if unique_by_args {
        let mut hasher = Sha256::new();
        hasher.update(method.as_bytes());
        hasher.update(b"|");
        hasher.update(params.as_bytes());
        let digest = hasher.finalize();
        format!("{method}-{}", hex::encode(&digest[..8]))
    } else {
        format!("{method}-{call_index}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(ExecutionState::Completed.is_terminal());
        assert!(ExecutionState::Failed.is_terminal());
        assert!(!ExecutionState::Queued.is_terminal());
        assert!(!ExecutionState::Running.is_terminal());
        assert!(!ExecutionState::Suspended.is_terminal());
    }

    #[test]
    fn test_activity_key_stable_across_calls() {
        let a = activity_key("charge_card", "{\"cents\":500}", true, 0);
        let b = activity_key("charge_card", "{\"cents\":500}", true, 7);

        // The call index is ignored when hashing by arguments.
        assert_eq!(a, b);
    }

    #[test]
    fn test_activity_key_varies_with_args() {
        let a = activity_key("charge_card", "{\"cents\":500}", true, 0);
        let b = activity_key("charge_card", "{\"cents\":501}", true, 0);

        assert_ne!(a, b);
        assert!(a.starts_with("charge_card-"));
    }

    #[test]
    fn test_activity_key_counter_form() {
        let a = activity_key("poll_status", "{}", false, 0);
        let b = activity_key("poll_status", "{}", false, 1);

        assert_eq!(a, "poll_status-0");
        assert_eq!(b, "poll_status-1");
    }

    #[test]
    fn test_new_workflow_is_due_immediately() {
        let now = Utc::now();
        let wf = WorkflowEntity::new("wf-1", "echo", "\"hi\"", now);

        assert_eq!(wf.state, ExecutionState::Queued);
        assert_eq!(wf.utc_eta, now);
        assert_eq!(wf.etag, 0);
        assert!(wf.parent_id.is_none());
    }

    #[test]
    fn test_workflow_builders() {
        let now = Utc::now();
        let eta = now + chrono::Duration::hours(2);
        let wf = WorkflowEntity::new("wf-2", "report", "null", now)
            .with_parent("wf-1")
            .with_eta(eta);

        assert_eq!(wf.parent_id.as_deref(), Some("wf-1"));
        assert_eq!(wf.utc_eta, eta);
    }

    #[test]
    fn test_entity_serialization() {
        let now = Utc::now();
        let act = ActivityEntity::new("charge-abc", "wf-1", "charge", "{}", now, now);

        let raw = serde_json::to_string(&act).unwrap();
        let back: ActivityEntity = serde_json::from_str(&raw).unwrap();

        assert_eq!(back, act);
    }
}
