//! Object store client.
//!
//! Payloads are addressed by deterministic keys (see [`crate::keys`]). A content
//! reference handed around in messages is either an `http(s)` capability URL or
//! a plain store key; [`ObjectStore::resolve`] accepts both.

mod memory;
mod redis;

pub use self::memory::MemoryObjectStore;
pub use self::redis::RedisObjectStore;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object {0} not found")]
    NotFound(String),

    #[error("object store error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("failed to download {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid content reference {0:?}")]
    InvalidReference(String),
}

/// How a content reference is to be fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentRef {
    Url(url::Url),
    Key(String),
}

impl ContentRef {
    pub fn parse(reference: &str) -> Result<Self, StorageError> {
        let trimmed = reference.trim();
        if trimmed.is_empty() {
            return Err(StorageError::InvalidReference(reference.to_string()));
        }
        match url::Url::parse(trimmed) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(ContentRef::Url(url)),
            Ok(url) if !url.cannot_be_a_base() => {
                Err(StorageError::InvalidReference(reference.to_string()))
            }
            _ => Ok(ContentRef::Key(trimmed.to_string())),
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create the backing container if it does not exist yet
    async fn ensure_container(&self) -> Result<(), StorageError>;

    async fn upload(&self, key: &str, data: &[u8]) -> Result<(), StorageError>;

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Fetch the payload behind a content reference
    async fn resolve(&self, reference: &str) -> Result<Vec<u8>, StorageError>;
}
