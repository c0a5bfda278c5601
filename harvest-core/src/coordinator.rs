//! Per-connector coordination: at most one batch in flight, schedule and
//! configuration ownership, and the cancel/restart/remove lifecycle.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TraversalConfig;
use crate::connector::{Configuration, DocumentSink, Repository};
use crate::error::{HarvestError, Result};
use crate::load::{BatchSize, HostLoadManager};
use crate::pool::WorkerPool;
use crate::schedule::Schedule;
use crate::store::{ConnectorStore, GenerationalStateStore, Slot};
use crate::traversal::{BatchOutcome, DelayPolicy, QueryTraverser};

/// Collaborators shared by every coordinator in a process.
#[derive(Clone)]
pub struct CoordinatorContext {
    pub sink: Arc<dyn DocumentSink>,
    pub store: Arc<dyn ConnectorStore>,
    pub pool: WorkerPool,
    pub config: TraversalConfig,
}

impl fmt::Debug for CoordinatorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorContext")
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Observable lifecycle state of a coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorPhase {
    Idle,
    BatchRunning,
    Removed,
}

/// Running totals for one connector.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraversalStatus {
    pub batches_run: u64,
    pub documents_processed: u64,
    pub last_batch_end: Option<DateTime<Utc>>,
    pub last_outcome: Option<BatchOutcome>,
    /// No batch starts before this instant.
    pub retry_after: Option<DateTime<Utc>>,
}

/// Handle to the one outstanding batch of a connector.
#[derive(Debug)]
pub struct BatchTask {
    id: Uuid,
    size: BatchSize,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    handle: JoinHandle<Option<()>>,
}

impl BatchTask {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn size(&self) -> BatchSize {
        self.size
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

struct CoordinatorState {
    schedule: Schedule,
    configuration: Configuration,
    batch: Option<BatchTask>,
    removed: bool,
    shut_down: bool,
    status: TraversalStatus,
}

struct CoordinatorInner {
    name: String,
    type_name: String,
    repository: Arc<dyn Repository>,
    store: Arc<GenerationalStateStore>,
    traverser: QueryTraverser,
    load: HostLoadManager,
    pool: WorkerPool,
    cancel_grace: Duration,
    // Serializes start/restart/remove/shutdown. Never taken by batch tasks.
    ops: tokio::sync::Mutex<()>,
    state: Mutex<CoordinatorState>,
}

impl CoordinatorInner {
    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_state(&self) -> Result<MutexGuard<'_, CoordinatorState>> {
        let state = self.state();
        if state.removed {
            return Err(HarvestError::ConnectorNotFound(self.name.clone()));
        }
        Ok(state)
    }

    fn finish_batch(&self, id: Uuid, outcome: BatchOutcome, cancelled: bool) {
        let now = Utc::now();
        let mut state = self.state();
        if state.removed {
            return;
        }

        self.load.record_batch_end(now);
        let retry_delay = state.schedule.retry_delay();
        let status = &mut state.status;
        status.batches_run += 1;
        status.documents_processed += outcome.documents() as u64;
        status.last_batch_end = Some(now);
        status.last_outcome = Some(outcome);
        status.retry_after = match outcome.delay_policy() {
            _ if cancelled => None,
            DelayPolicy::Immediate => None,
            DelayPolicy::Poll | DelayPolicy::Error => chrono::Duration::from_std(retry_delay)
                .ok()
                .map(|delay| now + delay),
        };

        debug!(
            target: "harvest::coordinator",
            connector = %self.name,
            batch = %id,
            outcome = %outcome,
            cancelled,
            retry_after = ?status.retry_after,
            "batch finished"
        );
    }
}

async fn run_batch(
    inner: Arc<CoordinatorInner>,
    id: Uuid,
    batch_hint: usize,
    cancel: CancellationToken,
) {
    let outcome = match inner.traverser.run_batch(batch_hint, &cancel).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(
                target: "harvest::coordinator",
                connector = %inner.name,
                batch = %id,
                error = %err,
                "batch failed"
            );
            BatchOutcome::ForceWait
        }
    };
    inner.finish_batch(id, outcome, cancel.is_cancelled());
}

/// Owns one connector's traversal. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectorCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl fmt::Debug for ConnectorCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorCoordinator")
            .field("name", &self.inner.name)
            .field("type_name", &self.inner.type_name)
            .field("phase", &self.phase())
            .finish()
    }
}

impl ConnectorCoordinator {
    /// Creates a coordinator and persists its schedule and configuration
    /// under the connector's current generation.
    pub async fn create(
        name: impl Into<String>,
        type_name: impl Into<String>,
        repository: Arc<dyn Repository>,
        schedule: Schedule,
        configuration: Configuration,
        context: &CoordinatorContext,
    ) -> Result<Self> {
        let name = name.into();
        if schedule.connector_name() != name {
            return Err(HarvestError::InvalidArgument(format!(
                "schedule for {} given to connector {}",
                schedule.connector_name(),
                name
            )));
        }

        let store = Arc::new(GenerationalStateStore::new(Arc::clone(&context.store)));
        store
            .put(&name, Slot::Schedule, schedule.to_string())
            .await?;
        store
            .put(&name, Slot::Configuration, serde_json::to_string(&configuration)?)
            .await?;

        let traverser = QueryTraverser::new(
            name.clone(),
            Arc::clone(&repository),
            Arc::clone(&context.sink),
            Arc::clone(&store),
        );
        let load = HostLoadManager::new(schedule.load(), context.config.max_batch_size);

        info!(
            target: "harvest::coordinator",
            connector = %name,
            schedule = %schedule,
            "connector coordinator created"
        );

        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                type_name: type_name.into(),
                repository,
                store,
                traverser,
                load,
                pool: context.pool.clone(),
                cancel_grace: context.config.cancel_grace(),
                ops: tokio::sync::Mutex::new(()),
                state: Mutex::new(CoordinatorState {
                    schedule,
                    configuration,
                    batch: None,
                    removed: false,
                    shut_down: false,
                    status: TraversalStatus::default(),
                }),
                name,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn type_name(&self) -> &str {
        &self.inner.type_name
    }

    pub fn phase(&self) -> CoordinatorPhase {
        let state = self.inner.state();
        if state.removed {
            CoordinatorPhase::Removed
        } else if state.batch.as_ref().is_some_and(BatchTask::is_running) {
            CoordinatorPhase::BatchRunning
        } else {
            CoordinatorPhase::Idle
        }
    }

    pub fn is_batch_running(&self) -> bool {
        self.phase() == CoordinatorPhase::BatchRunning
    }

    pub fn schedule(&self) -> Result<Schedule> {
        Ok(self.inner.live_state()?.schedule.clone())
    }

    pub fn configuration(&self) -> Result<Configuration> {
        Ok(self.inner.live_state()?.configuration.clone())
    }

    pub fn status(&self) -> Result<TraversalStatus> {
        Ok(self.inner.live_state()?.status.clone())
    }

    /// Current checkpoint as seen through this coordinator's store.
    pub async fn checkpoint(&self) -> Result<Option<String>> {
        self.inner.live_state()?;
        self.inner.store.get_checkpoint(&self.inner.name).await
    }

    pub fn start_batch(&self) -> Result<bool> {
        self.start_batch_at(Utc::now())
    }

    /// Admits and submits one batch if none is running, the retry delay has
    /// passed, and the load manager allows at least one document at `now`.
    /// Never waits for the batch itself.
    pub fn start_batch_at(&self, now: DateTime<Utc>) -> Result<bool> {
        let inner = &self.inner;
        let Ok(_ops) = inner.ops.try_lock() else {
            inner.live_state()?;
            return Ok(false);
        };
        let mut state = inner.live_state()?;
        if state.shut_down {
            return Ok(false);
        }
        if state.batch.as_ref().is_some_and(BatchTask::is_running) {
            return Ok(false);
        }
        if state.status.retry_after.is_some_and(|after| now < after) {
            return Ok(false);
        }

        let size = inner.load.determine_batch_size(now);
        if size.is_zero() {
            return Ok(false);
        }

        let id = Uuid::now_v7();
        let cancel = inner.pool.child_token();
        let task = run_batch(Arc::clone(inner), id, size.maximum, cancel.clone());
        let handle = match inner.pool.submit(cancel.clone(), task) {
            Ok(handle) => handle,
            Err(err) => {
                debug!(
                    target: "harvest::coordinator",
                    connector = %inner.name,
                    error = %err,
                    "batch not submitted"
                );
                return Ok(false);
            }
        };

        debug!(
            target: "harvest::coordinator",
            connector = %inner.name,
            batch = %id,
            batch_hint = size.maximum,
            "batch submitted"
        );
        state.batch = Some(BatchTask {
            id,
            size,
            started_at: now,
            cancel,
            handle,
        });
        Ok(true)
    }

    /// Cancels the running batch, if any. Its partial progress is still
    /// checkpointed. Returns whether a batch was running.
    pub fn cancel_batch(&self) -> Result<bool> {
        let state = self.inner.live_state()?;
        match state.batch.as_ref() {
            Some(batch) if batch.is_running() => {
                batch.cancel();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Cancels any running batch and forgets the checkpoint so the next batch
    /// starts from scratch. The generation is left unchanged.
    pub async fn restart_connector_traversal(&self) -> Result<()> {
        let _ops = self.inner.ops.lock().await;
        let batch = {
            let mut state = self.inner.live_state()?;
            state.status.retry_after = None;
            state.batch.take()
        };
        if let Some(batch) = batch {
            self.wait_for_cancelled(batch).await;
        }

        self.inner
            .store
            .clear(&self.inner.name, Slot::Checkpoint)
            .await?;
        info!(
            target: "harvest::coordinator",
            connector = %self.inner.name,
            "traversal restarted from the beginning"
        );
        Ok(())
    }

    async fn wait_for_cancelled(&self, batch: BatchTask) {
        batch.cancel();
        let id = batch.id;
        match tokio::time::timeout(self.inner.cancel_grace, batch.handle).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(
                target: "harvest::coordinator",
                connector = %self.inner.name,
                batch = %id,
                error = %err,
                "cancelled batch panicked"
            ),
            Err(_) => warn!(
                target: "harvest::coordinator",
                connector = %self.inner.name,
                batch = %id,
                "batch ignored cancellation; abandoning it"
            ),
        }
    }

    /// Cancels any running batch, deletes the connector's stored state, and
    /// advances its generation. Every later call fails with
    /// [`HarvestError::ConnectorNotFound`].
    pub async fn remove_connector(&self) -> Result<()> {
        let _ops = self.inner.ops.lock().await;
        let batch = {
            let mut state = self.inner.live_state()?;
            state.removed = true;
            state.batch.take()
        };
        if let Some(batch) = &batch {
            batch.cancel();
        }

        let generation = self.inner.store.remove(&self.inner.name).await?;
        self.inner.repository.shutdown().await;
        info!(
            target: "harvest::coordinator",
            connector = %self.inner.name,
            generation,
            "connector removed"
        );
        Ok(())
    }

    /// Replaces the schedule. A running batch keeps going; the load manager
    /// picks up the new load without resetting its timing.
    pub async fn set_connector_schedule(&self, schedule: Schedule) -> Result<()> {
        let _ops = self.inner.ops.lock().await;
        self.inner.live_state()?;
        if schedule.connector_name() != self.inner.name {
            return Err(HarvestError::InvalidArgument(format!(
                "schedule for {} given to connector {}",
                schedule.connector_name(),
                self.inner.name
            )));
        }

        self.inner
            .store
            .put(&self.inner.name, Slot::Schedule, schedule.to_string())
            .await?;
        self.inner.load.set_load(schedule.load());
        let mut state = self.inner.live_state()?;
        debug!(
            target: "harvest::coordinator",
            connector = %self.inner.name,
            schedule = %schedule,
            "schedule replaced"
        );
        state.schedule = schedule;
        Ok(())
    }

    /// Replaces the configuration in place without interrupting a batch.
    pub async fn set_connector_configuration(
        &self,
        configuration: Configuration,
    ) -> Result<()> {
        let _ops = self.inner.ops.lock().await;
        self.inner.live_state()?;
        self.inner
            .store
            .put(
                &self.inner.name,
                Slot::Configuration,
                serde_json::to_string(&configuration)?,
            )
            .await?;
        self.inner.live_state()?.configuration = configuration;
        Ok(())
    }

    /// Cancels any running batch and releases repository sessions. Safe to
    /// call more than once.
    pub async fn shutdown(&self) -> Result<()> {
        let _ops = self.inner.ops.lock().await;
        let batch = {
            let mut state = self.inner.live_state()?;
            if state.shut_down {
                return Ok(());
            }
            state.shut_down = true;
            state.batch.take()
        };
        if let Some(batch) = &batch {
            batch.cancel();
        }
        self.inner.repository.shutdown().await;
        debug!(
            target: "harvest::coordinator",
            connector = %self.inner.name,
            "coordinator shut down"
        );
        Ok(())
    }
}
