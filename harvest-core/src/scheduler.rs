//! The traversal control loop.
//!
//! One task wakes every tick (or when the connector set changes), walks the
//! registered connectors, and asks each eligible coordinator to start a
//! batch. Batches run on the shared [`WorkerPool`](crate::pool::WorkerPool),
//! so the loop itself never blocks on traversal work.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local, Timelike, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TraversalConfig;
use crate::instantiator::ConnectorInstantiator;

/// What one pass over the connectors did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub examined: usize,
    pub started: Vec<String>,
    pub disabled: usize,
    pub outside_window: usize,
    pub running: usize,
    pub not_admitted: usize,
    pub failed: usize,
}

#[derive(Debug)]
struct LogWindow {
    opened: Instant,
    ticks: u64,
    started: u64,
}

struct SchedulerInner {
    instantiator: Arc<ConnectorInstantiator>,
    config: TraversalConfig,
    shutdown: CancellationToken,
    log_window: Mutex<LogWindow>,
}

impl SchedulerInner {
    async fn tick_at(&self, now: DateTime<Utc>, hour: u32) -> TickSummary {
        let mut summary = TickSummary::default();

        for name in self.instantiator.connector_names().await {
            if self.shutdown.is_cancelled() {
                break;
            }
            // Removed between the snapshot and now.
            let Ok(coordinator) = self.instantiator.coordinator(&name).await else {
                continue;
            };
            let Ok(schedule) = coordinator.schedule() else {
                continue;
            };
            summary.examined += 1;

            if schedule.is_disabled() {
                summary.disabled += 1;
                continue;
            }
            if !schedule.in_window(hour) {
                summary.outside_window += 1;
                continue;
            }
            if coordinator.is_batch_running() {
                summary.running += 1;
                continue;
            }

            match coordinator.start_batch_at(now) {
                Ok(true) => summary.started.push(name),
                Ok(false) => summary.not_admitted += 1,
                Err(err) => {
                    summary.failed += 1;
                    debug!(
                        target: "harvest::scheduler",
                        connector = %name,
                        error = %err,
                        "could not start batch"
                    );
                }
            }
        }

        summary
    }

    fn record(&self, summary: &TickSummary) {
        let mut window = self
            .log_window
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        window.ticks += 1;
        window.started += summary.started.len() as u64;

        if !summary.started.is_empty() {
            debug!(
                target: "harvest::scheduler",
                started = ?summary.started,
                examined = summary.examined,
                "started batches"
            );
        }

        if window.opened.elapsed() >= self.config.log_interval() {
            info!(
                target: "harvest::scheduler",
                ticks = window.ticks,
                batches_started = window.started,
                busy_workers = self.instantiator.context().pool.busy(),
                pending_tasks = self.instantiator.context().pool.pending(),
                "scheduler progress"
            );
            *window = LogWindow {
                opened: Instant::now(),
                ticks: 0,
                started: 0,
            };
        }
    }

    async fn run(self: Arc<Self>) {
        let changes = self.instantiator.changes();
        let tick_interval = self.config.tick_interval();
        info!(
            target: "harvest::scheduler",
            tick_ms = tick_interval.as_millis() as u64,
            workers = self.instantiator.context().pool.size(),
            "traversal scheduler started"
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let summary = self.tick_at(Utc::now(), Local::now().hour()).await;
            self.record(&summary);

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(tick_interval) => {}
                _ = changes.notified() => {
                    debug!(target: "harvest::scheduler", "woken by connector change");
                }
            }
        }

        info!(target: "harvest::scheduler", "traversal scheduler stopped");
    }
}

/// Drives batch admission for every connector of one
/// [`ConnectorInstantiator`].
pub struct TraversalScheduler {
    inner: Arc<SchedulerInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for TraversalScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let running = match self.handle.try_lock() {
            Ok(handle) => format!("{}", handle.as_ref().is_some_and(|h| !h.is_finished())),
            Err(_) => "<locked>".to_string(),
        };
        f.debug_struct("TraversalScheduler")
            .field("config", &self.inner.config)
            .field("running", &running)
            .field("shutdown", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

impl TraversalScheduler {
    pub fn new(instantiator: Arc<ConnectorInstantiator>, config: TraversalConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                instantiator,
                config,
                shutdown: CancellationToken::new(),
                log_window: Mutex::new(LogWindow {
                    opened: Instant::now(),
                    ticks: 0,
                    started: 0,
                }),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn instantiator(&self) -> &Arc<ConnectorInstantiator> {
        &self.inner.instantiator
    }

    /// Spawns the control loop. Returns `false` if it is already running or
    /// the scheduler has been shut down.
    pub fn start(&self) -> bool {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.inner.shutdown.is_cancelled() || handle.as_ref().is_some_and(|h| !h.is_finished())
        {
            return false;
        }
        *handle = Some(tokio::spawn(Arc::clone(&self.inner).run()));
        true
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Makes the loop re-examine connectors now instead of at the next tick.
    pub fn wake(&self) {
        self.inner.instantiator.changes().notify_one();
    }

    /// One pass over the connectors using the current time.
    pub async fn tick(&self) -> TickSummary {
        self.tick_at(Utc::now(), Local::now().hour()).await
    }

    /// One pass over the connectors as if it were `now`, with `hour` the
    /// local hour used for time-window checks.
    pub async fn tick_at(&self, now: DateTime<Utc>, hour: u32) -> TickSummary {
        let summary = self.inner.tick_at(now, hour).await;
        self.inner.record(&summary);
        summary
    }

    /// Stops the loop and the worker pool.
    ///
    /// With `interrupt_running_batches` every in-flight batch is cancelled;
    /// otherwise batches are allowed to finish. Waits up to `timeout` for the
    /// pool to drain and returns whether it did. Coordinators are shut down
    /// either way.
    pub async fn shutdown(&self, interrupt_running_batches: bool, timeout: Duration) -> bool {
        self.inner.shutdown.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(
                    target: "harvest::scheduler",
                    error = %err,
                    "scheduler loop ended abnormally"
                );
            }
        }

        let pool = &self.inner.instantiator.context().pool;
        pool.close(interrupt_running_batches);
        let drained = pool.drain(timeout).await;
        if !drained {
            warn!(
                target: "harvest::scheduler",
                pending = pool.pending(),
                timeout_ms = timeout.as_millis() as u64,
                "worker pool did not drain before timeout"
            );
        }

        self.inner.instantiator.shutdown().await;
        info!(
            target: "harvest::scheduler",
            interrupted = interrupt_running_batches,
            drained,
            "traversal scheduler shut down"
        );
        drained
    }
}
