use async_trait::async_trait;
use dashmap::DashMap;

use super::{ConnectorStore, Slot};
use crate::error::Result;

/// Process-local store. State is lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    slots: DashMap<(String, Slot), String>,
    generations: DashMap<String, u64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector names with at least one stored slot.
    pub fn connector_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.slots.iter().map(|entry| entry.key().0.clone()).collect();
        names.sort();
        names.dedup();
        names
    }
}

#[async_trait]
impl ConnectorStore for InMemoryStore {
    async fn get(&self, connector: &str, slot: Slot) -> Result<Option<String>> {
        Ok(self
            .slots
            .get(&(connector.to_string(), slot))
            .map(|value| value.clone()))
    }

    async fn put(&self, connector: &str, slot: Slot, value: String) -> Result<()> {
        self.slots.insert((connector.to_string(), slot), value);
        Ok(())
    }

    async fn remove(&self, connector: &str, slot: Slot) -> Result<()> {
        self.slots.remove(&(connector.to_string(), slot));
        Ok(())
    }

    async fn generation(&self, connector: &str) -> Result<Option<u64>> {
        Ok(self.generations.get(connector).map(|value| *value))
    }

    async fn increment_generation(&self, connector: &str) -> Result<u64> {
        let mut entry = self.generations.entry(connector.to_string()).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }
}
