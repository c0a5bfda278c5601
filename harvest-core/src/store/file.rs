use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{ConnectorStore, Slot};
use crate::error::{HarvestError, Result};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ConnectorRecord {
    #[serde(default)]
    generation: u64,
    #[serde(default)]
    slots: BTreeMap<Slot, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    connectors: BTreeMap<String, ConnectorRecord>,
}

/// Keeps every connector's state in one JSON document on disk.
///
/// Each mutation rewrites the document through a temporary file in the same
/// directory followed by a rename, so readers never observe a torn file.
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<StoreDocument>,
}

impl fmt::Debug for JsonFileStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("JsonFileStore");
        debug.field("path", &self.path);
        match self.state.try_lock() {
            Ok(state) => {
                debug.field("connector_count", &state.connectors.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl JsonFileStore {
    /// Opens the store at `path`, starting empty when the file is missing.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let document = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => StoreDocument::default(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                StoreDocument::default()
            }
            Err(err) => return Err(err.into()),
        };
        tracing::debug!(
            target: "harvest::store",
            path = %path.display(),
            connectors = document.connectors.len(),
            "opened connector state file"
        );
        Ok(Self {
            path,
            state: Mutex::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, document: &StoreDocument) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(document)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes))
            .await
            .map_err(|err| {
                HarvestError::Store(format!("state file writer panicked: {err}"))
            })?
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;
    let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| HarvestError::Io(err.error))?;
    Ok(())
}

#[async_trait]
impl ConnectorStore for JsonFileStore {
    async fn get(&self, connector: &str, slot: Slot) -> Result<Option<String>> {
        let state = self.state.lock().await;
        Ok(state
            .connectors
            .get(connector)
            .and_then(|record| record.slots.get(&slot).cloned()))
    }

    async fn put(&self, connector: &str, slot: Slot, value: String) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .connectors
            .entry(connector.to_string())
            .or_default()
            .slots
            .insert(slot, value);
        self.persist(&state).await
    }

    async fn remove(&self, connector: &str, slot: Slot) -> Result<()> {
        let mut state = self.state.lock().await;
        let removed = state
            .connectors
            .get_mut(connector)
            .and_then(|record| record.slots.remove(&slot))
            .is_some();
        if !removed {
            return Ok(());
        }
        self.persist(&state).await
    }

    async fn generation(&self, connector: &str) -> Result<Option<u64>> {
        let state = self.state.lock().await;
        Ok(state
            .connectors
            .get(connector)
            .map(|record| record.generation)
            .filter(|generation| *generation > 0))
    }

    async fn increment_generation(&self, connector: &str) -> Result<u64> {
        let mut state = self.state.lock().await;
        let record = state.connectors.entry(connector.to_string()).or_default();
        record.generation += 1;
        let generation = record.generation;
        self.persist(&state).await?;
        Ok(generation)
    }
}
