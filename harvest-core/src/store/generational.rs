use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use super::{ConnectorStore, Slot};
use crate::error::{HarvestError, Result};

/// Generation-guarded view over a [`ConnectorStore`].
///
/// The first access for a connector stamps this instance with the stored
/// generation. Reads and writes compare that stamp with the stored
/// generation on every call and fail with
/// [`HarvestError::StoreDisabled`] once the connector has been removed or
/// reset. The lockout is permanent for this instance; a new instance picks up
/// the current generation and regains access.
pub struct GenerationalStateStore {
    backing: Arc<dyn ConnectorStore>,
    stamps: Mutex<HashMap<String, u64>>,
}

impl fmt::Debug for GenerationalStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stamps = self
            .stamps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        f.debug_struct("GenerationalStateStore")
            .field("stamps", &stamps)
            .finish()
    }
}

impl GenerationalStateStore {
    pub fn new(backing: Arc<dyn ConnectorStore>) -> Self {
        Self {
            backing,
            stamps: Mutex::new(HashMap::new()),
        }
    }

    pub fn backing(&self) -> Arc<dyn ConnectorStore> {
        Arc::clone(&self.backing)
    }

    /// Generation currently persisted for `connector`, 0 when absent.
    pub async fn current_generation(&self, connector: &str) -> Result<u64> {
        Ok(self.backing.generation(connector).await?.unwrap_or(0))
    }

    /// Advances the persisted generation, disabling every instance stamped
    /// with an older one.
    pub async fn new_generation(&self, connector: &str) -> Result<u64> {
        let generation = self.backing.increment_generation(connector).await?;
        tracing::debug!(
            target: "harvest::store",
            connector = %connector,
            generation,
            "advanced connector generation"
        );
        Ok(generation)
    }

    /// Generation this instance is bound to, captured on first use.
    pub async fn my_generation(&self, connector: &str) -> Result<u64> {
        if let Some(stamp) = self.stamp(connector) {
            return Ok(stamp);
        }
        let current = self.current_generation(connector).await?;
        let mut stamps = self.stamps.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(*stamps.entry(connector.to_string()).or_insert(current))
    }

    fn stamp(&self, connector: &str) -> Option<u64> {
        self.stamps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(connector)
            .copied()
    }

    pub async fn is_enabled(&self, connector: &str) -> Result<bool> {
        let mine = self.my_generation(connector).await?;
        Ok(mine == self.current_generation(connector).await?)
    }

    async fn check_access(&self, connector: &str) -> Result<()> {
        if self.is_enabled(connector).await? {
            Ok(())
        } else {
            tracing::debug!(
                target: "harvest::store",
                connector = %connector,
                "rejected access from a stale state store"
            );
            Err(HarvestError::store_disabled(connector))
        }
    }

    pub async fn get(&self, connector: &str, slot: Slot) -> Result<Option<String>> {
        self.check_access(connector).await?;
        self.backing.get(connector, slot).await
    }

    pub async fn put(&self, connector: &str, slot: Slot, value: String) -> Result<()> {
        self.check_access(connector).await?;
        self.backing.put(connector, slot, value).await
    }

    /// Clears one slot without touching the generation.
    pub async fn clear(&self, connector: &str, slot: Slot) -> Result<()> {
        self.check_access(connector).await?;
        self.backing.remove(connector, slot).await
    }

    /// Advances the generation of `connector`, then removes every slot.
    /// The bump comes first so no holder of the old generation can write
    /// while the slots are being deleted. Permitted even for stale instances
    /// so removed connectors can always be torn down.
    pub async fn remove(&self, connector: &str) -> Result<u64> {
        let generation = self.new_generation(connector).await?;
        for slot in Slot::ALL {
            self.backing.remove(connector, slot).await?;
        }
        Ok(generation)
    }

    pub async fn get_checkpoint(&self, connector: &str) -> Result<Option<String>> {
        self.get(connector, Slot::Checkpoint).await
    }

    pub async fn put_checkpoint(&self, connector: &str, checkpoint: String) -> Result<()> {
        self.put(connector, Slot::Checkpoint, checkpoint).await
    }
}
