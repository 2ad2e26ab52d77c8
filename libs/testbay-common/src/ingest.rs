// Result ingestion: pull worker result notifications and finish runs

use crate::keys;
use crate::queue::{MessageBroker, QueueError, QueueSpec};
use crate::storage::{ObjectStore, StorageError};
use crate::store::{StoreError, TestRunStore};
use crate::types::{
    ResultMessage, TestStatus, ARTIFACT_DUMP, ARTIFACT_STUDENTS, ARTIFACT_TEACHERS,
    MESSAGE_FAILED, MESSAGE_FINISHED,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("undecodable result message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to update run {job_id}: {source}")]
    Store {
        job_id: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Finished { job_id: String },
    Failed { job_id: String },
    /// The message named a run that does not exist; it was dropped
    UnknownRun { job_id: String },
    /// Redelivery of a result that was already applied; acked without changes
    Duplicate { job_id: String },
}

/// Consumes one result message per call.
///
/// Result bodies are copied from the references in the message into the
/// object store under the artifact key scheme. The run is then marked
/// `Finished`, or `Failed` if any copy failed, and the message is acked
/// either way. If the status update itself fails the message is requeued.
/// A result for a run that is already `Finished` or `Failed` is a
/// redelivery and is acked without touching the run or its artifacts.
#[derive(Clone)]
pub struct ResultIngester {
    broker: Arc<dyn MessageBroker>,
    runs: Arc<dyn TestRunStore>,
    objects: Arc<dyn ObjectStore>,
    queue: QueueSpec,
}

impl ResultIngester {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        runs: Arc<dyn TestRunStore>,
        objects: Arc<dyn ObjectStore>,
        queue: QueueSpec,
    ) -> Self {
        Self {
            broker,
            runs,
            objects,
            queue,
        }
    }

    #[instrument(skip(self), fields(queue = %self.queue.name))]
    pub async fn ingest_one(&self) -> Result<Option<IngestOutcome>, IngestError> {
        self.broker.ensure_connected().await?;
        self.broker.declare_queue(&self.queue).await?;

        let Some(delivery) = self.broker.get(&self.queue.name).await? else {
            return Ok(None);
        };

        let message: ResultMessage = match serde_json::from_slice(&delivery.data) {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, "Undecodable result message, rejecting without requeue");
                self.broker.reject(&delivery, false).await?;
                return Err(IngestError::Decode(e));
            }
        };
        let job_id = message.meta_data.clone();

        let run = match self.runs.get_run(&job_id).await {
            Ok(run) => run,
            Err(e) if e.is_not_found() => {
                warn!(job_id = %job_id, "Result for unknown run, dropping");
                self.broker.reject(&delivery, false).await?;
                return Ok(Some(IngestOutcome::UnknownRun { job_id }));
            }
            Err(source) => {
                self.broker.reject(&delivery, true).await?;
                return Err(IngestError::Store { job_id, source });
            }
        };

        if run.status.is_terminal() {
            info!(job_id = %job_id, status = %run.status, "Run already completed, acking duplicate result");
            self.broker.ack(&delivery).await?;
            return Ok(Some(IngestOutcome::Duplicate { job_id }));
        }

        let (status, text, outcome) = match self.copy_artifacts(&run.created_by, &message).await {
            Ok(()) => (
                TestStatus::Finished,
                MESSAGE_FINISHED,
                IngestOutcome::Finished {
                    job_id: job_id.clone(),
                },
            ),
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to store run results");
                (
                    TestStatus::Failed,
                    MESSAGE_FAILED,
                    IngestOutcome::Failed {
                        job_id: job_id.clone(),
                    },
                )
            }
        };

        if let Err(source) = self
            .runs
            .update_status(&job_id, status.clone(), text, Some(Utc::now()))
            .await
        {
            self.broker.reject(&delivery, true).await?;
            return Err(IngestError::Store { job_id, source });
        }

        self.broker.ack(&delivery).await?;
        info!(job_id = %job_id, status = %status, "Run results ingested");
        Ok(Some(outcome))
    }

    async fn copy_artifacts(&self, user: &str, message: &ResultMessage) -> Result<(), StorageError> {
        let mut artifacts = vec![
            (ARTIFACT_STUDENTS, message.students.as_str()),
            (ARTIFACT_TEACHERS, message.teachers.as_str()),
        ];
        if let Some(data) = message.data.as_deref().filter(|d| !d.trim().is_empty()) {
            artifacts.push((ARTIFACT_DUMP, data));
        }

        for (name, reference) in artifacts {
            let body = self.objects.resolve(reference).await?;
            let key = keys::artifact_key(user, &message.meta_data, name);
            self.objects.upload(&key, &body).await?;
        }
        Ok(())
    }
}
