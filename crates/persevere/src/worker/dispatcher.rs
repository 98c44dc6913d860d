//! Dispatcher loop
//!
//! Claims due workflow entities, hands them to the scheduler, waits for the
//! batch, then sleeps until the next poll interval or an external trigger
//! (workflow creation, event delivery) wakes it early.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::engine::EngineCore;

pub(crate) async fn run(core: Arc<EngineCore>, mut shutdown_rx: watch::Receiver<bool>) {
    info!("dispatcher started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let now = core.clock.utc_now();
        match core.store.poll_due(core.config.poll_batch, now).await {
            Ok(batch) => {
                if !batch.is_empty() {
                    debug!(count = batch.len(), "claimed due workflows");
                }

                let mut waits = Vec::with_capacity(batch.len());
                for entity in batch {
                    let id = entity.id.clone();
                    let runner = Arc::clone(&core);
                    let job = Box::pin(async move {
                        runner.run_workflow(entity).await;
                    });
                    waits.push(core.scheduler.submit(id, job));
                }
                for done in waits {
                    let _ = done.await;
                }
            }
            Err(e) => {
                error!("poll failed: {e}");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(core.config.poll_interval) => {}
            _ = core.trigger.notified() => {
                debug!("woken by trigger");
            }
            _ = shutdown_rx.changed() => {
                debug!("shutdown signal received");
            }
        }
    }

    info!("dispatcher stopped");
}
