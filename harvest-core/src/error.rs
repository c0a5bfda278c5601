use thiserror::Error;

use crate::connector::{PushError, RepositoryError};
use crate::schedule::ScheduleParseError;

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(#[from] ScheduleParseError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Connector not found: {0}")]
    ConnectorNotFound(String),

    #[error("Connector already exists: {0}")]
    ConnectorExists(String),

    #[error("Connector type not registered: {0}")]
    UnknownConnectorType(String),

    #[error("State store disabled for connector {connector}")]
    StoreDisabled { connector: String },

    #[error("State store error: {0}")]
    Store(String),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Push error: {0}")]
    Push(#[from] PushError),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HarvestError {
    pub fn store_disabled(connector: impl Into<String>) -> Self {
        Self::StoreDisabled {
            connector: connector.into(),
        }
    }

    pub fn is_store_disabled(&self) -> bool {
        matches!(self, Self::StoreDisabled { .. })
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;
