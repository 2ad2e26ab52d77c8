use super::{ContentRef, ObjectStore, StorageError};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-process object store. URL references are served from a table filled
/// with [`MemoryObjectStore::register_reference`].
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    references: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `url` resolvable to `data`, standing in for an external capability URL
    pub async fn register_reference(&self, url: &str, data: impl Into<Vec<u8>>) {
        self.references
            .write()
            .await
            .insert(url.to_string(), data.into());
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.blobs.read().await.contains_key(key)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn ensure_container(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn upload(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        self.blobs
            .write()
            .await
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.blobs
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn resolve(&self, reference: &str) -> Result<Vec<u8>, StorageError> {
        match ContentRef::parse(reference)? {
            ContentRef::Url(_) => self
                .references
                .read()
                .await
                .get(reference.trim())
                .cloned()
                .ok_or_else(|| StorageError::NotFound(reference.to_string())),
            ContentRef::Key(key) => self.download(&key).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;

    #[tokio::test]
    async fn test_upload_then_download_by_derived_key() {
        let store = MemoryObjectStore::new();
        let payload = br#"{"tests":[{"name":"t1","passed":true}]}"#;
        store
            .upload(&keys::artifact_key("u1@example.com", "job-1", "students.json"), payload)
            .await
            .unwrap();

        let fetched = store
            .download(&keys::artifact_key("u1@example.com", "job-1", "students.json"))
            .await
            .unwrap();
        assert_eq!(fetched, payload.to_vec());
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let store = MemoryObjectStore::new();
        let err = store.download("u1/job/teachers.json").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_resolve_url_and_key() {
        let store = MemoryObjectStore::new();
        store
            .register_reference("https://blobs.example.net/s/main.cpp?sig=1", "int main() {}")
            .await;
        store.upload("submissions/u1/s1/main.cpp", b"// key").await.unwrap();

        let by_url = store
            .resolve("https://blobs.example.net/s/main.cpp?sig=1")
            .await
            .unwrap();
        assert_eq!(by_url, b"int main() {}".to_vec());

        let by_key = store.resolve("submissions/u1/s1/main.cpp").await.unwrap();
        assert_eq!(by_key, b"// key".to_vec());

        assert!(store.resolve("https://blobs.example.net/other").await.is_err());
    }
}
