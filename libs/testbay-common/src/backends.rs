// Wiring of stores, object store and broker shared by all binaries

use crate::config::Config;
use crate::ingest::ResultIngester;
use crate::jobs::JobService;
use crate::queue::{
    MemoryBroker, MessageBroker, QueueError, QueueReader, QueueSpec, RabbitBroker, WorkPublisher,
};
use crate::storage::{MemoryObjectStore, ObjectStore, RedisObjectStore, StorageError};
use crate::store::{MemoryDocumentStore, RedisDocumentStore, TestCaseStore, TestRunStore};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("failed to connect to Redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Clone)]
pub struct Backends {
    pub config: Config,
    pub runs: Arc<dyn TestRunStore>,
    pub cases: Arc<dyn TestCaseStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub broker: Arc<dyn MessageBroker>,
    pub jobs: JobService,
}

impl Backends {
    /// Connect to Redis and RabbitMQ and make sure the blob container exists
    pub async fn connect(config: &Config) -> Result<Self, BackendError> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let conn = client.get_connection_manager().await?;
        info!(url = %config.redis_url, "Connected to Redis");

        let documents = Arc::new(RedisDocumentStore::new(conn.clone()));
        let objects = Arc::new(RedisObjectStore::new(conn, config.blob_container.as_str())?);
        objects.ensure_container().await?;

        let broker = Arc::new(RabbitBroker::connect(&config.mq_uri).await?);

        Ok(Self::assemble(config, documents.clone(), documents, objects, broker))
    }

    /// Everything in process; nothing survives a restart
    pub fn in_memory(config: &Config) -> Self {
        let documents = Arc::new(MemoryDocumentStore::new());
        Self::assemble(
            config,
            documents.clone(),
            documents,
            Arc::new(MemoryObjectStore::new()),
            Arc::new(MemoryBroker::new()),
        )
    }

    pub fn assemble(
        config: &Config,
        runs: Arc<dyn TestRunStore>,
        cases: Arc<dyn TestCaseStore>,
        objects: Arc<dyn ObjectStore>,
        broker: Arc<dyn MessageBroker>,
    ) -> Self {
        let publisher = WorkPublisher::new(broker.clone(), request_queue_spec(config));
        let jobs = JobService::new(runs.clone(), cases.clone(), objects.clone(), publisher);
        Self {
            config: config.clone(),
            runs,
            cases,
            objects,
            broker,
            jobs,
        }
    }

    pub fn reader(&self) -> QueueReader {
        QueueReader::new(
            self.broker.clone(),
            self.objects.clone(),
            self.config.return_url.clone(),
            self.config.dead_letter_exchange.clone(),
        )
    }

    pub fn ingester(&self) -> ResultIngester {
        ResultIngester::new(
            self.broker.clone(),
            self.runs.clone(),
            self.objects.clone(),
            QueueSpec::quorum(&self.config.result_queue)
                .with_dead_letter_exchange(self.config.dead_letter_exchange.clone()),
        )
    }
}

/// Publisher and reader must declare the request queue identically
pub fn request_queue_spec(config: &Config) -> QueueSpec {
    QueueSpec::quorum(&config.request_queue)
        .with_dead_letter_exchange(config.dead_letter_exchange.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobRequest, NewTestCase};

    #[tokio::test]
    async fn test_in_memory_publisher_and_reader_share_queue() {
        let config = Config {
            dead_letter_exchange: Some("dlx".to_string()),
            ..Config::default()
        };
        let backends = Backends::in_memory(&config);

        let case = backends
            .jobs
            .create_case(NewTestCase {
                name: "Basic".to_string(),
                task_id: "task-1".to_string(),
                docker_image: "img:1".to_string(),
                max_runs: 3,
                claim_name: "group".to_string(),
                claim_value: "a".to_string(),
                created_by: "admin@example.com".to_string(),
            })
            .await
            .unwrap();

        let key = crate::keys::submission_key("u1", "sub-1", crate::types::SUBMISSION_FILE);
        backends.objects.upload(&key, b"int main() {}").await.unwrap();
        backends
            .jobs
            .create_job(JobRequest {
                task_id: "task-1".to_string(),
                submission_id: "sub-1".to_string(),
                test_case_id: case.id,
                created_by: "u1".to_string(),
                task_name: "Task".to_string(),
                test_case_name: "Basic".to_string(),
                content_url: key,
                counted: true,
            })
            .await
            .unwrap();

        let order = backends
            .reader()
            .try_receive_one(&config.request_queue)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.docker_image, "img:1");
    }
}
