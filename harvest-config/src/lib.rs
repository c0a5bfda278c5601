//! Configuration and process setup for Harvest.
//!
//! Loads [`HarvestSettings`] from the environment or a settings file,
//! installs the tracing subscriber, and assembles a ready-to-start
//! [`TraversalScheduler`](harvest_core::TraversalScheduler) from them.

pub mod models;
pub mod runtime;
pub mod telemetry;

pub use models::settings::{HarvestSettings, HarvestSettingsSource};
pub use runtime::build_scheduler;
pub use telemetry::init_tracing;
