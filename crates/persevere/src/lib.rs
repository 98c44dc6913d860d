//! # Persevere
//!
//! A durable workflow engine: long-running, user-defined procedures whose
//! progress survives process restarts and crashes.
//!
//! ## How it works
//!
//! A workflow interleaves deterministic orchestration code with persisted
//! side effects called *activities*. Every durable primitive is a commit
//! point: its outcome is stored under a deterministic key before the
//! workflow observes it. When a workflow is re-driven (after a crash, or
//! after suspending for a timer or an external event), each primitive
//! short-circuits against the stored outcome, so the orchestration code
//! replays to the point where new work is required.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                               │
//! │  (create / status / events, dispatcher + daily scheduler)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    WorkflowContext                           │
//! │  (replay: schedule / delay / wait_for_events / children)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     WorkflowStore                            │
//! │  (entities, leases, optimistic concurrency; pluggable)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use persevere::prelude::*;
//!
//! struct OrderWorkflow;
//!
//! #[async_trait]
//! impl Workflow for OrderWorkflow {
//!     const TYPE: &'static str = "order_workflow";
//!     type Input = Order;
//!     type Output = Receipt;
//!
//!     fn new() -> Self {
//!         Self
//!     }
//!
//!     async fn run(&self, ctx: &WorkflowContext, order: Order)
//!         -> Result<Receipt, WorkflowError>
//!     {
//!         let receipt: Receipt = ctx.schedule("charge_card", &order).await?;
//!         ctx.delay(Duration::from_secs(24 * 3600)).await?;
//!         let _: () = ctx.schedule("send_survey", &order.customer).await?;
//!         Ok(receipt)
//!     }
//! }
//!
//! let mut registry = WorkflowRegistry::new();
//! registry.register::<OrderWorkflow>();
//! registry.register_activity("charge_card", charge_card);
//! registry.register_activity("send_survey", send_survey);
//!
//! let engine = Engine::new(Arc::new(InMemoryWorkflowStore::new()), registry);
//! engine.start();
//! let id = engine.create::<OrderWorkflow>(&order).await?;
//! ```

pub mod activity;
pub mod clock;
pub mod codec;
pub mod engine;
pub mod storage;
pub mod workflow;

pub(crate) mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{ActivityError, ActivityInvocation, DependencyScope};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::engine::{
        Engine, EngineConfig, EngineError, WorkflowRegistry, WorkflowStatus,
    };
    pub use crate::storage::{
        ExecutionState, InMemoryWorkflowStore, MemoryStoreConfig, StoreError, WorkflowStore,
    };
    pub use crate::workflow::{EventOutcome, Workflow, WorkflowContext, WorkflowError};
}

// Re-export key types at crate root
pub use activity::{ActivityError, ActivityInvocation, DependencyScope};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Engine, EngineConfig, EngineError, WorkflowRegistry, WorkflowStatus};
pub use storage::{
    ExecutionState, InMemoryWorkflowStore, MemoryStoreConfig, StoreError, WorkflowStore,
};
pub use workflow::{EventOutcome, Workflow, WorkflowContext, WorkflowError};
