//! Per-workflow scheduling
//!
//! Serializes work by workflow id within one process and bounds total
//! parallelism with a semaphore. A submission for an id that is already
//! running replaces the queued payload (coalescing): re-driving a workflow
//! twice is redundant, only the latest claim matters.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Semaphore};
use tracing::debug;

/// A unit of work bound to a workflow id
pub(crate) type Job = BoxFuture<'static, ()>;

struct QueuedJob {
    job: Job,
    done: oneshot::Sender<()>,
}

struct Slot {
    queued: Option<QueuedJob>,
}

struct SchedulerInner {
    slots: Mutex<HashMap<String, Slot>>,
    permits: Arc<Semaphore>,
}

/// Per-id serializing scheduler with bounded parallelism
pub(crate) struct WorkflowScheduler {
    inner: Arc<SchedulerInner>,
}

impl WorkflowScheduler {
    /// Create a scheduler allowing up to `max_parallel` concurrent jobs
    pub(crate) fn new(max_parallel: usize) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                slots: Mutex::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(max_parallel.max(1))),
            }),
        }
    }

    /// Submit work for a workflow id
    ///
    /// The returned receiver completes when the job has run, or immediately
    /// when a later submission for the same id displaces it.
    pub(crate) fn submit(&self, id: String, job: Job) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let queued = QueuedJob {
            job,
            done: done_tx,
        };

        let mut slots = self.inner.slots.lock();
        if let Some(slot) = slots.get_mut(&id) {
            // Coalesce: the id is already being driven; only the latest
            // pending payload matters.
            if let Some(displaced) = slot.queued.replace(queued) {
                debug!(workflow_id = %id, "coalesced queued submission");
                let _ = displaced.done.send(());
            }
            return done_rx;
        }

        slots.insert(id.clone(), Slot { queued: None });
        drop(slots);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.drive(id, queued).await;
        });

        done_rx
    }

    /// Number of workflow ids currently running or queued
    pub(crate) fn active(&self) -> usize {
        self.inner.slots.lock().len()
    }
}

impl SchedulerInner {
    /// Run jobs for one id until its slot drains
    async fn drive(self: Arc<Self>, id: String, first: QueuedJob) {
        let mut current = first;
        loop {
            let permit = match Arc::clone(&self.permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            current.job.await;
            drop(permit);
            let _ = current.done.send(());

            let next = {
                let mut slots = self.slots.lock();
                let slot = slots.get_mut(&id).expect("slot exists while driving");
                match slot.queued.take() {
                    Some(queued) => Some(queued),
                    None => {
                        slots.remove(&id);
                        None
                    }
                }
            };

            match next {
                Some(queued) => current = queued,
                None => break,
            }
        }
    }
}
