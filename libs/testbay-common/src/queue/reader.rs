use super::{MessageBroker, QueueError, QueueSpec};
use crate::storage::{ObjectStore, StorageError};
use crate::types::{WorkMessage, WorkOrder, SUBMISSION_FILE};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("undecodable message on {queue}: {source}")]
    Decode {
        queue: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to fetch submission for job {job_id}: {source}")]
    Content {
        job_id: String,
        #[source]
        source: StorageError,
    },
}

/// Single-message consumer that turns work messages into work orders.
///
/// Each [`QueueReader::try_receive_one`] performs one `get` and returns
/// promptly. The delivery is acknowledged only after the submission has been
/// fetched from the object store; if that fetch fails the message is requeued
/// for the next call.
#[derive(Clone)]
pub struct QueueReader {
    broker: Arc<dyn MessageBroker>,
    objects: Arc<dyn ObjectStore>,
    return_url: Option<String>,
    dead_letter_exchange: Option<String>,
}

impl QueueReader {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        objects: Arc<dyn ObjectStore>,
        return_url: Option<String>,
        dead_letter_exchange: Option<String>,
    ) -> Self {
        Self {
            broker,
            objects,
            return_url,
            dead_letter_exchange,
        }
    }

    pub fn broker(&self) -> &Arc<dyn MessageBroker> {
        &self.broker
    }

    #[instrument(skip(self))]
    pub async fn try_receive_one(&self, queue_name: &str) -> Result<Option<WorkOrder>, ReaderError> {
        self.broker.ensure_connected().await?;
        let spec = QueueSpec::quorum(queue_name)
            .with_dead_letter_exchange(self.dead_letter_exchange.clone());
        self.broker.declare_queue(&spec).await?;

        let Some(delivery) = self.broker.get(queue_name).await? else {
            return Ok(None);
        };

        let message = match WorkMessage::from_json_bytes(&delivery.data) {
            Ok(message) => message,
            Err(source) => {
                error!(
                    delivery_tag = delivery.delivery_tag,
                    error = %source,
                    "Undecodable work message, rejecting without requeue"
                );
                self.broker.reject(&delivery, false).await?;
                return Err(ReaderError::Decode {
                    queue: queue_name.to_string(),
                    source,
                });
            }
        };

        let source = match self.objects.resolve(&message.content_url).await {
            Ok(bytes) => bytes,
            Err(source) => {
                warn!(
                    job_id = %message.metadata,
                    error = %source,
                    "Submission fetch failed, leaving message for redelivery"
                );
                self.broker.reject(&delivery, true).await?;
                return Err(ReaderError::Content {
                    job_id: message.metadata,
                    source,
                });
            }
        };

        let mut files = BTreeMap::new();
        files.insert(
            SUBMISSION_FILE.to_string(),
            String::from_utf8_lossy(&source).into_owned(),
        );
        let order = WorkOrder {
            return_url: self.return_url.clone(),
            metadata: message.metadata,
            docker_image: message.docker_image,
            files,
        };

        self.broker.ack(&delivery).await?;
        info!(job_id = %order.metadata, redelivered = delivery.redelivered, "Work order issued");
        Ok(Some(order))
    }
}
