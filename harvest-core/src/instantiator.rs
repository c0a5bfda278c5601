//! Registry of connector types and live connector coordinators.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

use crate::connector::{Configuration, ConnectorType};
use crate::coordinator::{ConnectorCoordinator, CoordinatorContext};
use crate::error::{HarvestError, Result};
use crate::schedule::{DEFAULT_LOAD, Schedule};
use crate::store::Slot;

/// Creates, looks up, and tears down connectors by name.
///
/// Every mutation signals [`ConnectorInstantiator::changes`] so a waiting
/// scheduler re-examines connectors without waiting for its next tick.
pub struct ConnectorInstantiator {
    types: DashMap<String, Arc<dyn ConnectorType>>,
    connectors: RwLock<BTreeMap<String, ConnectorCoordinator>>,
    context: CoordinatorContext,
    changes: Arc<Notify>,
}

impl fmt::Debug for ConnectorInstantiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types: Vec<String> = self.types.iter().map(|entry| entry.key().clone()).collect();
        let mut debug = f.debug_struct("ConnectorInstantiator");
        debug.field("types", &types);
        match self.connectors.try_read() {
            Ok(connectors) => {
                debug.field("connectors", &connectors.keys().collect::<Vec<_>>());
            }
            Err(_) => {
                debug.field("connectors", &"<locked>");
            }
        }
        debug.field("context", &self.context).finish()
    }
}

impl ConnectorInstantiator {
    pub fn new(context: CoordinatorContext) -> Self {
        Self {
            types: DashMap::new(),
            connectors: RwLock::new(BTreeMap::new()),
            context,
            changes: Arc::new(Notify::new()),
        }
    }

    pub fn context(&self) -> &CoordinatorContext {
        &self.context
    }

    /// Signalled whenever the connector set or a schedule changes.
    pub fn changes(&self) -> Arc<Notify> {
        Arc::clone(&self.changes)
    }

    fn notify_changed(&self) {
        self.changes.notify_one();
    }

    /// Registers a connector type, replacing any type with the same name.
    pub fn register_type(&self, connector_type: Arc<dyn ConnectorType>) {
        let type_name = connector_type.type_name().to_string();
        if self.types.insert(type_name.clone(), connector_type).is_some() {
            warn!(
                target: "harvest::coordinator",
                connector_type = %type_name,
                "replaced registered connector type"
            );
        }
    }

    pub fn connector_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    fn connector_type(&self, type_name: &str) -> Result<Arc<dyn ConnectorType>> {
        self.types
            .get(type_name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| HarvestError::UnknownConnectorType(type_name.to_string()))
    }

    /// Sorted snapshot of live connector names.
    pub async fn connector_names(&self) -> Vec<String> {
        self.connectors.read().await.keys().cloned().collect()
    }

    pub async fn coordinator(&self, name: &str) -> Result<ConnectorCoordinator> {
        self.connectors
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| HarvestError::ConnectorNotFound(name.to_string()))
    }

    /// Instantiates a connector of `type_name`.
    ///
    /// Without an explicit schedule the one persisted for `name` is reused,
    /// falling back to an always-on schedule at [`DEFAULT_LOAD`].
    pub async fn add_connector(
        &self,
        name: &str,
        type_name: &str,
        configuration: Configuration,
        schedule: Option<Schedule>,
    ) -> Result<ConnectorCoordinator> {
        if name.trim().is_empty() {
            return Err(HarvestError::InvalidArgument(
                "connector name must not be empty".into(),
            ));
        }
        let mut connectors = self.connectors.write().await;
        if connectors.contains_key(name) {
            return Err(HarvestError::ConnectorExists(name.to_string()));
        }

        let connector_type = self.connector_type(type_name)?;
        let schedule = match schedule {
            Some(schedule) if schedule.connector_name() == name => schedule,
            Some(schedule) => schedule.renamed(name),
            None => self.initial_schedule(name).await?,
        };
        let coordinator = self
            .instantiate(name, connector_type.as_ref(), schedule, configuration)
            .await?;
        connectors.insert(name.to_string(), coordinator.clone());
        drop(connectors);

        info!(
            target: "harvest::coordinator",
            connector = %name,
            connector_type = %type_name,
            "connector added"
        );
        self.notify_changed();
        Ok(coordinator)
    }

    async fn initial_schedule(&self, name: &str) -> Result<Schedule> {
        if let Some(text) = self.context.store.get(name, Slot::Schedule).await? {
            match Schedule::parse(&text) {
                Ok(schedule) => return Ok(schedule.renamed(name)),
                Err(err) => warn!(
                    target: "harvest::coordinator",
                    connector = %name,
                    error = %err,
                    "ignoring unreadable persisted schedule"
                ),
            }
        }
        Ok(Schedule::always(name, DEFAULT_LOAD)?)
    }

    async fn instantiate(
        &self,
        name: &str,
        connector_type: &dyn ConnectorType,
        schedule: Schedule,
        configuration: Configuration,
    ) -> Result<ConnectorCoordinator> {
        let repository = connector_type.instantiate(name, &configuration).await?;
        ConnectorCoordinator::create(
            name,
            connector_type.type_name(),
            repository,
            schedule,
            configuration,
            &self.context,
        )
        .await
    }

    pub async fn get_connector_schedule(&self, name: &str) -> Result<Schedule> {
        self.coordinator(name).await?.schedule()
    }

    pub async fn set_connector_schedule(&self, name: &str, schedule: Schedule) -> Result<()> {
        let schedule = if schedule.connector_name() == name {
            schedule
        } else {
            schedule.renamed(name)
        };
        self.coordinator(name)
            .await?
            .set_connector_schedule(schedule)
            .await?;
        self.notify_changed();
        Ok(())
    }

    pub async fn get_connector_configuration(&self, name: &str) -> Result<Configuration> {
        self.coordinator(name).await?.configuration()
    }

    /// Updates a connector's configuration. Changing its type removes the
    /// old connector (advancing its generation) and builds a new one that
    /// keeps the schedule but starts traversal from scratch.
    pub async fn set_connector_configuration(
        &self,
        name: &str,
        type_name: &str,
        configuration: Configuration,
    ) -> Result<()> {
        let mut connectors = self.connectors.write().await;
        let existing = connectors
            .get(name)
            .cloned()
            .ok_or_else(|| HarvestError::ConnectorNotFound(name.to_string()))?;

        if existing.type_name() == type_name {
            drop(connectors);
            return existing.set_connector_configuration(configuration).await;
        }

        let connector_type = self.connector_type(type_name)?;
        let schedule = existing.schedule()?;
        let previous_type = existing.type_name().to_string();
        // A configuration the new type rejects leaves the old connector alone.
        let repository = connector_type.instantiate(name, &configuration).await?;

        connectors.remove(name);
        if let Err(err) = existing.remove_connector().await {
            repository.shutdown().await;
            return Err(err);
        }
        let replacement = match ConnectorCoordinator::create(
            name,
            connector_type.type_name(),
            Arc::clone(&repository),
            schedule,
            configuration,
            &self.context,
        )
        .await
        {
            Ok(replacement) => replacement,
            Err(err) => {
                repository.shutdown().await;
                return Err(err);
            }
        };
        connectors.insert(name.to_string(), replacement);
        drop(connectors);

        info!(
            target: "harvest::coordinator",
            connector = %name,
            from = %previous_type,
            to = %type_name,
            "connector type changed; recreated connector"
        );
        self.notify_changed();
        Ok(())
    }

    pub async fn restart_connector_traversal(&self, name: &str) -> Result<()> {
        self.coordinator(name)
            .await?
            .restart_connector_traversal()
            .await?;
        self.notify_changed();
        Ok(())
    }

    pub async fn remove_connector(&self, name: &str) -> Result<()> {
        let coordinator = self
            .connectors
            .write()
            .await
            .remove(name)
            .ok_or_else(|| HarvestError::ConnectorNotFound(name.to_string()))?;
        self.notify_changed();
        coordinator.remove_connector().await
    }

    /// Shuts down every live coordinator. Connectors stay registered.
    pub async fn shutdown(&self) {
        let coordinators: Vec<ConnectorCoordinator> =
            self.connectors.read().await.values().cloned().collect();
        let results = future::join_all(
            coordinators
                .iter()
                .map(|coordinator| coordinator.shutdown()),
        )
        .await;
        for (coordinator, result) in coordinators.iter().zip(results) {
            if let Err(err) = result {
                debug!(
                    target: "harvest::coordinator",
                    connector = %coordinator.name(),
                    error = %err,
                    "coordinator shutdown skipped"
                );
            }
        }
    }
}
