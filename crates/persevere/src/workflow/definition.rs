//! Workflow trait definition

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::codec::CodecError;
use crate::storage::StoreError;

use super::context::WorkflowContext;

/// Error type flowing out of workflow orchestration code
///
/// Only [`WorkflowError::ActivityFailed`] is meant to be caught by workflow
/// code; everything else should be propagated with `?`. `Suspended` is the
/// engine's own unwind signal: it is raised by the durable primitives,
/// recognized by the executor, and never surfaces to callers.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Internal signal: unwind now, re-drive when the ETA is due
    #[error("workflow suspended")]
    Suspended,

    /// A durable, terminal failure of a single activity
    #[error("activity failed: {0}")]
    ActivityFailed(String),

    /// Unrecoverable defect (unknown type, misuse of the primitives)
    #[error("{0}")]
    Fatal(String),

    /// Storage failure; the current cycle is abandoned and retried later
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Payload type mismatch; fatal for the workflow
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl WorkflowError {
    /// Create a fatal error from a message
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Whether this is the suspension signal
    pub fn is_suspension(&self) -> bool {
        matches!(self, Self::Suspended)
    }
}

/// A durable, replayable orchestration procedure
///
/// The body of [`run`](Workflow::run) must be deterministic: given the same
/// set of stored activity outcomes, two replays must issue the same sequence
/// of durable primitive calls. All non-determinism (I/O, randomness, real
/// time) belongs in activities, timers, and the context's virtual clock.
///
/// # Example
///
/// ```ignore
/// struct OrderWorkflow;
///
/// #[async_trait]
/// impl Workflow for OrderWorkflow {
///     const TYPE: &'static str = "order_workflow";
///     type Input = OrderInput;
///     type Output = OrderResult;
///
///     fn new() -> Self {
///         Self
///     }
///
///     async fn run(
///         &self,
///         ctx: &WorkflowContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, WorkflowError> {
///         let charged: Receipt = ctx.schedule("charge_card", &input.payment).await?;
///         ctx.delay(Duration::from_secs(3600)).await?;
///         let shipped: Shipment = ctx.schedule("ship_order", &input.order_id).await?;
///         Ok(OrderResult { charged, shipped })
///     }
/// }
/// ```
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    /// Unique type identifier, used to rehydrate instances from storage
    const TYPE: &'static str;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type when the workflow completes successfully
    type Output: Serialize + DeserializeOwned + Send;

    /// Create an instance; called on every replay before `run`
    fn new() -> Self;

    /// How long a completed workflow is retained before collection
    fn preserve_time() -> Duration {
        Duration::from_secs(60 * 60)
    }

    /// How long a failed workflow is retained before collection
    fn failure_preserve_time() -> Duration {
        Duration::from_secs(30 * 24 * 60 * 60)
    }

    /// Whether activity history is dropped when the workflow is collected
    fn delete_history() -> bool {
        true
    }

    /// The orchestration body
    ///
    /// Re-executed on every replay; durable primitives on `ctx` short-circuit
    /// against stored outcomes.
    async fn run(
        &self,
        ctx: &WorkflowContext,
        input: Self::Input,
    ) -> Result<Self::Output, WorkflowError>;
}
