use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::document::Document;

/// Opaque connector configuration as entered by an administrator.
pub type Configuration = BTreeMap<String, String>;

/// Failures reported by a repository adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// One document could not be read. The batch skips it and continues.
    #[error("document {id} could not be read: {message}")]
    Document { id: String, message: String },

    /// The adapter ran out of memory or another local resource.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The repository itself failed; retried after the retry delay.
    #[error("repository failure: {0}")]
    Repository(String),

    /// The adapter could not be created from its configuration.
    #[error("invalid connector configuration: {0}")]
    Configuration(String),
}

impl RepositoryError {
    pub fn repository(message: impl Into<String>) -> Self {
        Self::Repository(message.into())
    }

    pub fn document(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Document {
            id: id.into(),
            message: message.into(),
        }
    }
}

/// Lazily produced documents from one traversal call plus the checkpoint
/// that resumes after the last document handed out.
#[async_trait]
pub trait DocumentList: Send {
    /// Next document, or `None` once the list is exhausted.
    async fn next_document(
        &mut self,
    ) -> Result<Option<Document>, RepositoryError>;

    /// Checkpoint covering every document returned so far, if any.
    async fn checkpoint(&mut self) -> Result<Option<String>, RepositoryError>;
}

/// Repository-side half of a connector.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Begin a traversal from scratch. `None` means nothing to traverse.
    async fn start_traversal(
        &self,
    ) -> Result<Option<Box<dyn DocumentList>>, RepositoryError>;

    /// Continue a traversal after `checkpoint`. `None` means nothing new.
    async fn resume_traversal(
        &self,
        checkpoint: &str,
    ) -> Result<Option<Box<dyn DocumentList>>, RepositoryError>;

    /// Suggested number of documents for the next traversal call.
    fn set_batch_hint(&self, batch_hint: usize);

    /// Release sessions and other repository-side resources.
    async fn shutdown(&self) {}
}

/// Factory for one kind of connector (one repository product).
#[async_trait]
pub trait ConnectorType: Send + Sync {
    fn type_name(&self) -> &str;

    async fn instantiate(
        &self,
        connector_name: &str,
        configuration: &Configuration,
    ) -> Result<Arc<dyn Repository>, RepositoryError>;
}
