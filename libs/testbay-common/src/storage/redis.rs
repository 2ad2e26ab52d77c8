use super::{ContentRef, ObjectStore, StorageError};
use crate::keys;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, info};

/// Blob container on Redis; capability URLs are fetched over HTTP
#[derive(Clone)]
pub struct RedisObjectStore {
    conn: ConnectionManager,
    container: String,
    http: reqwest::Client,
}

impl RedisObjectStore {
    pub fn new(conn: ConnectionManager, container: impl Into<String>) -> Result<Self, StorageError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|source| StorageError::Http {
                url: String::new(),
                source,
            })?;
        Ok(Self {
            conn,
            container: container.into(),
            http,
        })
    }

    async fn fetch_url(&self, url: url::Url) -> Result<Vec<u8>, StorageError> {
        let display = url.to_string();
        let to_http_error = |source| StorageError::Http {
            url: display.clone(),
            source,
        };
        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(to_http_error)?;
        let body = response.bytes().await.map_err(to_http_error)?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl ObjectStore for RedisObjectStore {
    async fn ensure_container(&self) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let added: u32 = conn.sadd(keys::CONTAINERS_KEY, &self.container).await?;
        if added > 0 {
            info!(container = %self.container, "Created object store container");
        } else {
            debug!(container = %self.container, "Object store container already exists");
        }
        Ok(())
    }

    async fn upload(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(keys::blob_key(&self.container, key), data).await?;
        debug!(key = %key, bytes = data.len(), "Uploaded object");
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let mut conn = self.conn.clone();
        let data: Option<Vec<u8>> = conn.get(keys::blob_key(&self.container, key)).await?;
        data.ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn resolve(&self, reference: &str) -> Result<Vec<u8>, StorageError> {
        match ContentRef::parse(reference)? {
            ContentRef::Url(url) => self.fetch_url(url).await,
            ContentRef::Key(key) => self.download(&key).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// These tests require a running Redis instance
    async fn create_store() -> RedisObjectStore {
        let client = redis::Client::open("redis://127.0.0.1:6379")
            .expect("Failed to create Redis client");
        let conn = client
            .get_connection_manager()
            .await
            .expect("Failed to connect to Redis");
        RedisObjectStore::new(conn, "testbay-tests").expect("Failed to build store")
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_artifact_roundtrip_by_derived_key() {
        let store = create_store().await;
        store.ensure_container().await.unwrap();
        store.ensure_container().await.unwrap();

        let job = uuid::Uuid::new_v4().to_string();
        let payload = b"{\"passed\": 3}".to_vec();
        store
            .upload(&keys::artifact_key("u1@example.com", &job, "students.json"), &payload)
            .await
            .unwrap();

        let fetched = store
            .download(&keys::artifact_key("u1@example.com", &job, "students.json"))
            .await
            .unwrap();
        assert_eq!(fetched, payload);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_missing_object() {
        let store = create_store().await;
        let err = store.download("does/not/exist").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }
}
