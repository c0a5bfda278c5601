//! Persistent per-connector state.
//!
//! Backing stores keep a handful of string slots per connector name plus a
//! generation counter. [`GenerationalStateStore`] layers the generation
//! access check on top so that batches started for a removed connector can
//! no longer touch the state of its successor.

pub mod file;
pub mod generational;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use file::JsonFileStore;
pub use generational::GenerationalStateStore;
pub use memory::InMemoryStore;

/// Named value kept per connector.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Checkpoint,
    Schedule,
    Configuration,
}

impl Slot {
    pub const ALL: [Slot; 3] = [Slot::Checkpoint, Slot::Schedule, Slot::Configuration];
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Slot::Checkpoint => "checkpoint",
            Slot::Schedule => "schedule",
            Slot::Configuration => "configuration",
        };
        f.write_str(name)
    }
}

/// Storage contract for connector state. Every call is atomic on its own;
/// distinct connector names must not contend.
#[async_trait]
pub trait ConnectorStore: Send + Sync {
    async fn get(&self, connector: &str, slot: Slot) -> Result<Option<String>>;

    async fn put(&self, connector: &str, slot: Slot, value: String) -> Result<()>;

    async fn remove(&self, connector: &str, slot: Slot) -> Result<()>;

    /// Stored generation, `None` when the connector has never been bumped.
    async fn generation(&self, connector: &str) -> Result<Option<u64>>;

    /// Atomically increments and persists the generation, returning the new
    /// value.
    async fn increment_generation(&self, connector: &str) -> Result<u64>;
}
