use super::{MessageBroker, QueueError, QueueSpec};
use crate::types::WorkMessage;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Publishes work messages to the request queue.
///
/// The session is validated before each publish. A publish that fails because
/// the session died is retried once on a fresh session; any further failure
/// is returned to the caller.
#[derive(Clone)]
pub struct WorkPublisher {
    broker: Arc<dyn MessageBroker>,
    queue: QueueSpec,
}

impl WorkPublisher {
    pub fn new(broker: Arc<dyn MessageBroker>, queue: QueueSpec) -> Self {
        Self { broker, queue }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue.name
    }

    pub fn broker(&self) -> &Arc<dyn MessageBroker> {
        &self.broker
    }

    #[instrument(skip(self, message), fields(queue = %self.queue.name, job_id = %message.metadata))]
    pub async fn publish(&self, message: &WorkMessage) -> Result<(), QueueError> {
        let payload = message.to_json_bytes()?;

        match self.try_publish(&payload).await {
            Err(e) if e.is_connection_lost() => {
                warn!(error = %e, "Publish failed on a dead session, reconnecting and retrying once");
                self.broker.reconnect().await?;
                self.try_publish(&payload).await
            }
            other => other,
        }?;

        debug!("Work message published");
        Ok(())
    }

    async fn try_publish(&self, payload: &[u8]) -> Result<(), QueueError> {
        self.broker.ensure_connected().await?;
        self.broker.declare_queue(&self.queue).await?;
        self.broker.publish(&self.queue.name, payload).await
    }
}
