//! Daily scheduler
//!
//! Periodically creates one instance of every registered daily workflow
//! type, keyed by type name and UTC date. Colliding ids are ignored, which
//! yields at most one instance per type per UTC day across any number of
//! engine replicas.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::codec;
use crate::engine::{EngineCore, EngineError};

pub(crate) async fn run(core: Arc<EngineCore>, mut shutdown_rx: watch::Receiver<bool>) {
    if core.registry.daily_types().is_empty() {
        return;
    }

    info!(
        types = core.registry.daily_types().len(),
        "daily scheduler started"
    );

    let mut ticker = tokio::time::interval(core.config.daily_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                enqueue_daily(&core).await;
            }
            _ = shutdown_rx.changed() => {
                debug!("daily scheduler stopping");
                break;
            }
        }
    }
}

async fn enqueue_daily(core: &Arc<EngineCore>) {
    let day = core.clock.utc_now().format("%Y%m%d").to_string();

    for type_name in core.registry.daily_types() {
        let id = format!("{type_name}-{day}");
        match core
            .create_registered(type_name, codec::NULL.to_string(), Some(id.clone()), None)
            .await
        {
            Ok(_) => {
                info!(workflow_id = %id, "created daily workflow");
            }
            Err(EngineError::AlreadyExists(_)) => {
                debug!(workflow_id = %id, "daily instance already exists");
            }
            Err(e) => {
                error!(workflow_type = %type_name, "daily creation failed: {e}");
            }
        }
    }
}
