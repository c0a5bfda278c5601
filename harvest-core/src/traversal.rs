//! Single-batch traversal: resume from the stored checkpoint, push documents
//! downstream, and commit the new checkpoint.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connector::{
    DocumentList, DocumentSink, PushError, Repository, RepositoryError,
};
use crate::error::{HarvestError, Result};
use crate::store::GenerationalStateStore;

/// How long a connector should rest after a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DelayPolicy {
    /// Progress was made; the next batch may run as soon as load allows.
    Immediate,
    /// The repository had nothing new; poll again after the retry delay.
    Poll,
    /// The batch failed; retry after the retry delay.
    Error,
}

/// Result of one batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOutcome {
    /// Number of documents accepted by the sink.
    Processed(usize),
    /// The repository failed after this many documents were accepted. No
    /// checkpoint was written.
    Interrupted(usize),
    /// Do not schedule this connector again before its retry delay elapses.
    ForceWait,
}

impl BatchOutcome {
    pub fn documents(&self) -> usize {
        match self {
            BatchOutcome::Processed(count) | BatchOutcome::Interrupted(count) => *count,
            BatchOutcome::ForceWait => 0,
        }
    }

    pub fn delay_policy(&self) -> DelayPolicy {
        match self {
            BatchOutcome::Processed(0) => DelayPolicy::Poll,
            BatchOutcome::Processed(_) => DelayPolicy::Immediate,
            BatchOutcome::Interrupted(_) | BatchOutcome::ForceWait => DelayPolicy::Error,
        }
    }
}

impl fmt::Display for BatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchOutcome::Processed(count) => write!(f, "processed {count}"),
            BatchOutcome::Interrupted(count) => write!(f, "interrupted after {count}"),
            BatchOutcome::ForceWait => f.write_str("force-wait"),
        }
    }
}

/// Why the document loop stopped.
enum LoopExit {
    /// Exhausted, batch hint reached, cancelled, or asked to stop; the
    /// checkpoint is committed.
    Commit,
    /// Stop without committing and report this outcome.
    Abort(BatchOutcome),
}

/// Runs traversal batches for one connector.
pub struct QueryTraverser {
    connector_name: String,
    repository: Arc<dyn Repository>,
    sink: Arc<dyn DocumentSink>,
    store: Arc<GenerationalStateStore>,
}

impl fmt::Debug for QueryTraverser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryTraverser")
            .field("connector_name", &self.connector_name)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl QueryTraverser {
    pub fn new(
        connector_name: impl Into<String>,
        repository: Arc<dyn Repository>,
        sink: Arc<dyn DocumentSink>,
        store: Arc<GenerationalStateStore>,
    ) -> Self {
        Self {
            connector_name: connector_name.into(),
            repository,
            sink,
            store,
        }
    }

    pub fn connector_name(&self) -> &str {
        &self.connector_name
    }

    /// Runs one batch of at most `batch_hint` documents.
    ///
    /// Only an invalid `batch_hint` is reported as an error; every traversal
    /// failure is folded into the returned [`BatchOutcome`].
    pub async fn run_batch(
        &self,
        batch_hint: usize,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome> {
        if batch_hint == 0 {
            return Err(HarvestError::InvalidArgument(
                "batch hint must be a positive integer".into(),
            ));
        }
        let name = self.connector_name.as_str();

        let checkpoint = match self.store.get_checkpoint(name).await {
            Ok(checkpoint) => checkpoint,
            Err(err) if err.is_store_disabled() => {
                debug!(
                    target: "harvest::traversal",
                    connector = %name,
                    "state store disabled; connector is being removed"
                );
                return Ok(BatchOutcome::ForceWait);
            }
            Err(err) => {
                warn!(
                    target: "harvest::traversal",
                    connector = %name,
                    error = %err,
                    "failed to read checkpoint"
                );
                return Ok(BatchOutcome::ForceWait);
            }
        };

        if cancel.is_cancelled() {
            debug!(
                target: "harvest::traversal",
                connector = %name,
                "batch cancelled before traversal started"
            );
            return Ok(BatchOutcome::Processed(0));
        }

        self.repository.set_batch_hint(batch_hint);
        let listing = match checkpoint.as_deref() {
            None => self.repository.start_traversal().await,
            Some(checkpoint) => self.repository.resume_traversal(checkpoint).await,
        };
        let mut documents = match listing {
            Ok(Some(documents)) => documents,
            Ok(None) => {
                debug!(
                    target: "harvest::traversal",
                    connector = %name,
                    "repository returned no documents"
                );
                return Ok(BatchOutcome::ForceWait);
            }
            Err(err) => {
                warn!(
                    target: "harvest::traversal",
                    connector = %name,
                    resumed = checkpoint.is_some(),
                    error = %err,
                    "traversal call failed"
                );
                return Ok(BatchOutcome::ForceWait);
            }
        };

        let mut processed = 0usize;
        match self
            .push_documents(documents.as_mut(), batch_hint, cancel, &mut processed)
            .await
        {
            LoopExit::Commit => {}
            LoopExit::Abort(outcome) => return Ok(outcome),
        }

        if let Err(err) = self.sink.flush(name).await {
            warn!(
                target: "harvest::traversal",
                connector = %name,
                error = %err,
                "flush failed; discarding batch progress"
            );
            return Ok(BatchOutcome::ForceWait);
        }

        Ok(self.commit_checkpoint(documents.as_mut(), processed).await)
    }

    async fn push_documents(
        &self,
        documents: &mut dyn DocumentList,
        batch_hint: usize,
        cancel: &CancellationToken,
        processed: &mut usize,
    ) -> LoopExit {
        let name = self.connector_name.as_str();
        let mut seen = 0usize;

        while seen < batch_hint {
            if cancel.is_cancelled() {
                info!(
                    target: "harvest::traversal",
                    connector = %name,
                    processed = *processed,
                    "batch cancelled; keeping partial progress"
                );
                break;
            }

            let document = match documents.next_document().await {
                Ok(Some(document)) => document,
                Ok(None) => break,
                Err(RepositoryError::Document { id, message }) => {
                    seen += 1;
                    warn!(
                        target: "harvest::traversal",
                        connector = %name,
                        document = %id,
                        error = %message,
                        "skipping unreadable document"
                    );
                    continue;
                }
                Err(RepositoryError::ResourceExhausted(message)) => {
                    warn!(
                        target: "harvest::traversal",
                        connector = %name,
                        error = %message,
                        "resources exhausted; ending batch early"
                    );
                    break;
                }
                Err(err) => {
                    warn!(
                        target: "harvest::traversal",
                        connector = %name,
                        processed = *processed,
                        error = %err,
                        "repository failed during traversal"
                    );
                    let outcome = if *processed == 0 {
                        BatchOutcome::ForceWait
                    } else {
                        BatchOutcome::Interrupted(*processed)
                    };
                    return LoopExit::Abort(outcome);
                }
            };
            seen += 1;

            let document_id = document.id().to_string();
            match self.sink.take(document, name).await {
                Ok(status) => {
                    *processed += 1;
                    if !status.should_continue() {
                        info!(
                            target: "harvest::traversal",
                            connector = %name,
                            status = ?status,
                            "sink asked to pause; ending batch early"
                        );
                        break;
                    }
                }
                Err(PushError::Document { id, message }) => {
                    warn!(
                        target: "harvest::traversal",
                        connector = %name,
                        document = %id,
                        error = %message,
                        "skipping rejected document"
                    );
                }
                Err(PushError::ResourceExhausted(message)) => {
                    warn!(
                        target: "harvest::traversal",
                        connector = %name,
                        document = %document_id,
                        error = %message,
                        "sink out of resources; ending batch early"
                    );
                    break;
                }
                Err(PushError::Transport(message)) => {
                    warn!(
                        target: "harvest::traversal",
                        connector = %name,
                        document = %document_id,
                        processed = *processed,
                        error = %message,
                        "push failed; discarding batch without checkpoint"
                    );
                    return LoopExit::Abort(BatchOutcome::ForceWait);
                }
            }
        }

        LoopExit::Commit
    }

    async fn commit_checkpoint(
        &self,
        documents: &mut dyn DocumentList,
        processed: usize,
    ) -> BatchOutcome {
        let name = self.connector_name.as_str();
        let checkpoint = match documents.checkpoint().await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => return BatchOutcome::Processed(processed),
            Err(err) => {
                warn!(
                    target: "harvest::traversal",
                    connector = %name,
                    error = %err,
                    "repository could not produce a checkpoint"
                );
                return BatchOutcome::ForceWait;
            }
        };

        match self.store.put_checkpoint(name, checkpoint).await {
            Ok(()) => BatchOutcome::Processed(processed),
            Err(err) if err.is_store_disabled() => {
                debug!(
                    target: "harvest::traversal",
                    connector = %name,
                    "connector removed mid-batch; checkpoint discarded"
                );
                BatchOutcome::Processed(processed)
            }
            Err(err) => {
                warn!(
                    target: "harvest::traversal",
                    connector = %name,
                    error = %err,
                    "failed to persist checkpoint"
                );
                BatchOutcome::ForceWait
            }
        }
    }
}
