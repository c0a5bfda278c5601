//! # Harvest Core
//!
//! Scheduling and traversal engine for repository connectors. Each
//! connector walks an external repository in bounded batches, pushes the
//! documents it finds to a sink, and checkpoints its progress so the next
//! batch resumes where the last one stopped.
//!
//! ## Architecture
//!
//! - [`schedule`]: per-connector schedule and its persisted text form
//! - [`load`]: admission control that turns a documents-per-minute load
//!   into a batch size
//! - [`store`]: checkpoint/schedule/configuration persistence with a
//!   generation guard against stale writers
//! - [`connector`]: traits implemented by repository adapters and sinks
//! - [`traversal`]: runs a single batch
//! - [`coordinator`]: owns one connector and its at-most-one running batch
//! - [`instantiator`]: registry of connector types and live connectors
//! - [`scheduler`]: the control loop that starts batches on a bounded
//!   [`pool`]
//!
//! ## Example
//!
//! ```
//! use harvest_core::schedule::Schedule;
//!
//! let schedule = Schedule::parse("conn1:60:300000:0-0").unwrap();
//! assert_eq!(schedule.load(), 60);
//! assert!(schedule.in_window(13));
//! assert_eq!(schedule.to_string(), "conn1:60:300000:0-0");
//! ```

pub mod config;
pub mod connector;
pub mod coordinator;
pub mod error;
pub mod instantiator;
pub mod load;
pub mod pool;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod traversal;

pub use config::TraversalConfig;
pub use coordinator::{
    ConnectorCoordinator, CoordinatorContext, CoordinatorPhase, TraversalStatus,
};
pub use error::{HarvestError, Result};
pub use instantiator::ConnectorInstantiator;
pub use load::{BatchSize, HostLoadManager};
pub use pool::WorkerPool;
pub use schedule::{Schedule, TimeInterval};
pub use scheduler::{TickSummary, TraversalScheduler};
pub use store::{ConnectorStore, GenerationalStateStore, InMemoryStore, JsonFileStore, Slot};
pub use traversal::{BatchOutcome, DelayPolicy, QueryTraverser};
