#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use harvest_core::connector::{
    Configuration, ConnectorType, Document, DocumentList, DocumentSink, PushError, PushStatus,
    Repository, RepositoryError,
};
use harvest_core::store::{ConnectorStore, InMemoryStore, Slot};
use harvest_core::{
    ConnectorCoordinator, CoordinatorContext, HarvestError, Schedule, TraversalConfig, WorkerPool,
};
use tokio::sync::Notify;

pub const WAIT: Duration = Duration::from_secs(5);

/// One position in a scripted repository.
#[derive(Clone, Debug)]
pub enum Entry {
    Doc(String),
    /// Unreadable document; consumed and reported as a document error.
    Bad(String),
    /// Resource exhaustion; not consumed.
    Exhausted,
    /// Repository failure; not consumed.
    Fail,
}

pub fn docs(ids: &[&str]) -> Vec<Entry> {
    ids.iter().map(|id| Entry::Doc(id.to_string())).collect()
}

pub fn numbered(count: usize) -> Vec<Entry> {
    (0..count).map(|i| Entry::Doc(format!("doc-{i}"))).collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Start,
    Resume(String),
}

/// Holds a traversal just before it reads the entry at `pause_at`.
#[derive(Debug)]
pub struct Gate {
    pause_at: usize,
    passed: AtomicBool,
    reached: Notify,
    release: Notify,
}

impl Gate {
    pub fn new(pause_at: usize) -> Arc<Self> {
        Arc::new(Self {
            pause_at,
            passed: AtomicBool::new(false),
            reached: Notify::new(),
            release: Notify::new(),
        })
    }

    pub async fn wait_reached(&self) {
        tokio::time::timeout(WAIT, self.reached.notified())
            .await
            .expect("traversal should reach the gate");
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    async fn pass(&self, position: usize) {
        if position == self.pause_at && !self.passed.swap(true, Ordering::SeqCst) {
            self.reached.notify_one();
            self.release.notified().await;
        }
    }
}

/// Repository serving a fixed list of entries. Checkpoints are the index of
/// the next unread entry.
#[derive(Debug)]
pub struct ScriptedRepository {
    entries: Arc<Vec<Entry>>,
    gate: Option<Arc<Gate>>,
    fail_checkpoint: bool,
    calls: Mutex<Vec<Call>>,
    batch_hints: Mutex<Vec<usize>>,
    shutdowns: AtomicUsize,
}

impl ScriptedRepository {
    pub fn new(entries: Vec<Entry>) -> Self {
        Self {
            entries: Arc::new(entries),
            gate: None,
            fail_checkpoint: false,
            calls: Mutex::new(Vec::new()),
            batch_hints: Mutex::new(Vec::new()),
            shutdowns: AtomicUsize::new(0),
        }
    }

    pub fn with_gate(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn failing_checkpoint(mut self) -> Self {
        self.fail_checkpoint = true;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn batch_hints(&self) -> Vec<usize> {
        self.batch_hints.lock().expect("hints lock").clone()
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    fn list_from(&self, position: usize) -> Option<Box<dyn DocumentList>> {
        if position >= self.entries.len() {
            return None;
        }
        Some(Box::new(ScriptedList {
            entries: Arc::clone(&self.entries),
            position,
            gate: self.gate.clone(),
            fail_checkpoint: self.fail_checkpoint,
        }))
    }
}

#[async_trait]
impl Repository for ScriptedRepository {
    async fn start_traversal(&self) -> Result<Option<Box<dyn DocumentList>>, RepositoryError> {
        self.calls.lock().expect("calls lock").push(Call::Start);
        Ok(self.list_from(0))
    }

    async fn resume_traversal(
        &self,
        checkpoint: &str,
    ) -> Result<Option<Box<dyn DocumentList>>, RepositoryError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(Call::Resume(checkpoint.to_string()));
        let position = checkpoint
            .parse::<usize>()
            .map_err(|_| RepositoryError::repository(format!("bad checkpoint {checkpoint}")))?;
        Ok(self.list_from(position))
    }

    fn set_batch_hint(&self, batch_hint: usize) {
        self.batch_hints
            .lock()
            .expect("hints lock")
            .push(batch_hint);
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

struct ScriptedList {
    entries: Arc<Vec<Entry>>,
    position: usize,
    gate: Option<Arc<Gate>>,
    fail_checkpoint: bool,
}

#[async_trait]
impl DocumentList for ScriptedList {
    async fn next_document(&mut self) -> Result<Option<Document>, RepositoryError> {
        if let Some(gate) = &self.gate {
            gate.pass(self.position).await;
        }
        let Some(entry) = self.entries.get(self.position) else {
            return Ok(None);
        };
        match entry {
            Entry::Doc(id) => {
                self.position += 1;
                Ok(Some(Document::new(id.clone())))
            }
            Entry::Bad(id) => {
                self.position += 1;
                Err(RepositoryError::document(id.clone(), "malformed"))
            }
            Entry::Exhausted => Err(RepositoryError::ResourceExhausted("out of memory".into())),
            Entry::Fail => Err(RepositoryError::repository("session expired")),
        }
    }

    async fn checkpoint(&mut self) -> Result<Option<String>, RepositoryError> {
        if self.fail_checkpoint {
            return Err(RepositoryError::repository("checkpoint unavailable"));
        }
        Ok(Some(self.position.to_string()))
    }
}

/// Sink that records accepted documents and can be told to misbehave.
#[derive(Debug, Default)]
pub struct RecordingSink {
    taken: Mutex<Vec<(String, String)>>,
    rejects: HashSet<String>,
    statuses: HashMap<String, PushStatus>,
    transport_fail_after: Option<usize>,
    fail_flush: bool,
    flushes: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(mut self, id: &str) -> Self {
        self.rejects.insert(id.to_string());
        self
    }

    pub fn with_status(mut self, id: &str, status: PushStatus) -> Self {
        self.statuses.insert(id.to_string(), status);
        self
    }

    /// Accept `accepted` documents, then fail every push with a transport
    /// error.
    pub fn failing_transport_after(mut self, accepted: usize) -> Self {
        self.transport_fail_after = Some(accepted);
        self
    }

    pub fn failing_flush(mut self) -> Self {
        self.fail_flush = true;
        self
    }

    pub fn taken_ids(&self) -> Vec<String> {
        self.taken
            .lock()
            .expect("sink lock")
            .iter()
            .map(|(_, id)| id.clone())
            .collect()
    }

    pub fn taken_for(&self, connector: &str) -> usize {
        self.taken
            .lock()
            .expect("sink lock")
            .iter()
            .filter(|(name, _)| name == connector)
            .count()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentSink for RecordingSink {
    async fn take(&self, document: Document, connector_name: &str) -> Result<PushStatus, PushError> {
        let id = document.id().to_string();
        if self.rejects.contains(&id) {
            return Err(PushError::Document {
                id,
                message: "too large".into(),
            });
        }
        let mut taken = self.taken.lock().expect("sink lock");
        if self
            .transport_fail_after
            .is_some_and(|limit| taken.len() >= limit)
        {
            return Err(PushError::transport("feed connection reset"));
        }
        taken.push((connector_name.to_string(), id.clone()));
        Ok(self.statuses.get(&id).copied().unwrap_or(PushStatus::Ok))
    }

    async fn flush(&self, _connector_name: &str) -> Result<(), PushError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        if self.fail_flush {
            Err(PushError::transport("flush rejected"))
        } else {
            Ok(())
        }
    }
}

/// Connector type that hands out scripted repositories.
#[derive(Debug)]
pub struct ScriptedType {
    name: String,
    entries: Vec<Entry>,
    instances: Mutex<Vec<Arc<ScriptedRepository>>>,
}

impl ScriptedType {
    pub fn new(name: &str, entries: Vec<Entry>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            entries,
            instances: Mutex::new(Vec::new()),
        })
    }

    pub fn instances(&self) -> Vec<Arc<ScriptedRepository>> {
        self.instances.lock().expect("instances lock").clone()
    }

    pub fn last_instance(&self) -> Arc<ScriptedRepository> {
        self.instances()
            .last()
            .cloned()
            .expect("type should have been instantiated")
    }
}

#[async_trait]
impl ConnectorType for ScriptedType {
    fn type_name(&self) -> &str {
        &self.name
    }

    async fn instantiate(
        &self,
        _connector_name: &str,
        configuration: &Configuration,
    ) -> Result<Arc<dyn Repository>, RepositoryError> {
        if configuration.contains_key("invalid") {
            return Err(RepositoryError::Configuration("invalid key present".into()));
        }
        let repository = Arc::new(ScriptedRepository::new(self.entries.clone()));
        self.instances
            .lock()
            .expect("instances lock")
            .push(Arc::clone(&repository));
        Ok(repository)
    }
}

/// In-memory store whose writes can be made to fail.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    fail_puts: AtomicBool,
}

impl FlakyStore {
    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectorStore for FlakyStore {
    async fn get(&self, connector: &str, slot: Slot) -> harvest_core::Result<Option<String>> {
        self.inner.get(connector, slot).await
    }

    async fn put(&self, connector: &str, slot: Slot, value: String) -> harvest_core::Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(HarvestError::Store("disk full".into()));
        }
        self.inner.put(connector, slot, value).await
    }

    async fn remove(&self, connector: &str, slot: Slot) -> harvest_core::Result<()> {
        self.inner.remove(connector, slot).await
    }

    async fn generation(&self, connector: &str) -> harvest_core::Result<Option<u64>> {
        self.inner.generation(connector).await
    }

    async fn increment_generation(&self, connector: &str) -> harvest_core::Result<u64> {
        self.inner.increment_generation(connector).await
    }
}

/// In-memory store that parks the first removal of `pause_on` until
/// [`PausingStore::resume`] is called.
#[derive(Debug)]
pub struct PausingStore {
    inner: InMemoryStore,
    pause_on: Slot,
    armed: AtomicBool,
    paused: Notify,
    resume: Notify,
}

impl PausingStore {
    pub fn new(pause_on: Slot) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryStore::new(),
            pause_on,
            armed: AtomicBool::new(true),
            paused: Notify::new(),
            resume: Notify::new(),
        })
    }

    pub async fn wait_paused(&self) {
        tokio::time::timeout(WAIT, self.paused.notified())
            .await
            .expect("removal should reach the pause");
    }

    pub fn resume(&self) {
        self.resume.notify_one();
    }
}

#[async_trait]
impl ConnectorStore for PausingStore {
    async fn get(&self, connector: &str, slot: Slot) -> harvest_core::Result<Option<String>> {
        self.inner.get(connector, slot).await
    }

    async fn put(&self, connector: &str, slot: Slot, value: String) -> harvest_core::Result<()> {
        self.inner.put(connector, slot, value).await
    }

    async fn remove(&self, connector: &str, slot: Slot) -> harvest_core::Result<()> {
        if slot == self.pause_on && self.armed.swap(false, Ordering::SeqCst) {
            self.paused.notify_one();
            self.resume.notified().await;
        }
        self.inner.remove(connector, slot).await
    }

    async fn generation(&self, connector: &str) -> harvest_core::Result<Option<u64>> {
        self.inner.generation(connector).await
    }

    async fn increment_generation(&self, connector: &str) -> harvest_core::Result<u64> {
        self.inner.increment_generation(connector).await
    }
}

pub fn test_config() -> TraversalConfig {
    TraversalConfig {
        worker_pool_size: 2,
        tick_interval_ms: 20,
        max_batch_size: 100,
        cancel_grace_ms: 500,
        shutdown_timeout_ms: 1_000,
        log_interval_ms: 1_000,
        ..TraversalConfig::default()
    }
}

pub fn context(
    sink: Arc<RecordingSink>,
    store: Arc<dyn ConnectorStore>,
    config: TraversalConfig,
) -> CoordinatorContext {
    CoordinatorContext {
        sink,
        store,
        pool: WorkerPool::new(config.worker_pool_size),
        config,
    }
}

pub fn unthrottled(name: &str) -> Schedule {
    Schedule::always(name, 0).expect("schedule")
}

pub async fn coordinator(
    name: &str,
    repository: Arc<ScriptedRepository>,
    context: &CoordinatorContext,
) -> ConnectorCoordinator {
    ConnectorCoordinator::create(
        name,
        "scripted",
        repository,
        unthrottled(name),
        Configuration::new(),
        context,
    )
    .await
    .expect("create coordinator")
}

/// Polls `condition` until it holds or [`WAIT`] elapses.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition should hold in time");
}

pub async fn wait_idle(coordinator: &ConnectorCoordinator) {
    wait_until(|| !coordinator.is_batch_running()).await;
}
