use std::sync::Arc;

use anyhow::Context;
use harvest_core::connector::DocumentSink;
use harvest_core::{
    ConnectorInstantiator, ConnectorStore, CoordinatorContext, InMemoryStore, JsonFileStore,
    TraversalScheduler, WorkerPool,
};
use tracing::info;

use crate::models::settings::HarvestSettings;

/// Validates `settings`, installs process defaults, and wires a scheduler
/// around `sink`. Register connector types on
/// [`TraversalScheduler::instantiator`] before starting it.
pub async fn build_scheduler(
    settings: &HarvestSettings,
    sink: Arc<dyn DocumentSink>,
) -> anyhow::Result<TraversalScheduler> {
    settings.validate()?;
    settings.apply_process_defaults();

    let store: Arc<dyn ConnectorStore> = match &settings.state_path {
        Some(path) => {
            let store = JsonFileStore::open(path.clone())
                .await
                .with_context(|| format!("failed to open connector state {}", path.display()))?;
            info!(path = %path.display(), "connector state loaded from file");
            Arc::new(store)
        }
        None => {
            info!("connector state kept in memory");
            Arc::new(InMemoryStore::new())
        }
    };

    let traversal = settings.traversal.clone();
    let context = CoordinatorContext {
        sink,
        store,
        pool: WorkerPool::new(traversal.worker_pool_size),
        config: traversal.clone(),
    };
    Ok(TraversalScheduler::new(
        Arc::new(ConnectorInstantiator::new(context)),
        traversal,
    ))
}
