use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::document::Document;

/// Feed condition reported after a document is accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushStatus {
    Ok,
    /// The sink is short on memory; stop after this document.
    LowMemory,
    /// The downstream feed is backlogged; stop after this document.
    FeedBacklog,
    /// Feeding is turned off; stop after this document.
    Disabled,
}

impl PushStatus {
    pub fn should_continue(&self) -> bool {
        matches!(self, PushStatus::Ok)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    /// The document is malformed or too large; it is skipped.
    #[error("document {id} rejected: {message}")]
    Document { id: String, message: String },

    /// The sink ran out of memory while processing the document.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Documents could not be delivered downstream.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl PushError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}

/// Downstream consumer of traversed documents (the "pusher").
#[async_trait]
pub trait DocumentSink: Send + Sync {
    async fn take(
        &self,
        document: Document,
        connector_name: &str,
    ) -> Result<PushStatus, PushError>;

    /// Deliver anything buffered for `connector_name`. Called before a batch
    /// commits its checkpoint.
    async fn flush(&self, _connector_name: &str) -> Result<(), PushError> {
        Ok(())
    }
}
