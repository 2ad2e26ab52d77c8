//! Job record store and test case store.
//!
//! Both are document collections with point lookups and most-recent-first
//! listings. Every listing is bounded by a caller-supplied limit and sorted by
//! `createdAt` descending.

mod memory;
mod redis;

pub use self::memory::MemoryDocumentStore;
pub use self::redis::RedisDocumentStore;

use crate::types::{RunFilter, TestCase, TestCaseUpdate, TestRun, TestStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("record store error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("stored document {key} is corrupt: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{key} kept changing underneath the update, gave up after {attempts} attempts")]
    Contended { key: String, attempts: u32 },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub(crate) fn run_not_found(id: &str) -> Self {
        StoreError::NotFound {
            kind: "test run",
            id: id.to_string(),
        }
    }

    pub(crate) fn case_not_found(id: &str) -> Self {
        StoreError::NotFound {
            kind: "test case",
            id: id.to_string(),
        }
    }
}

#[async_trait]
pub trait TestRunStore: Send + Sync {
    async fn insert_run(&self, run: &TestRun) -> Result<(), StoreError>;

    async fn get_run(&self, id: &str) -> Result<TestRun, StoreError>;

    async fn list_runs(&self, filter: &RunFilter, limit: usize) -> Result<Vec<TestRun>, StoreError>;

    /// Number of runs with `counted = true` for the pair
    async fn count_counted(&self, user: &str, test_case_id: &str) -> Result<u64, StoreError>;

    async fn update_status(
        &self,
        id: &str,
        status: TestStatus,
        message: &str,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    async fn set_counted(&self, id: &str, counted: bool) -> Result<TestRun, StoreError>;
}

#[async_trait]
pub trait TestCaseStore: Send + Sync {
    async fn insert_case(&self, case: &TestCase) -> Result<(), StoreError>;

    async fn get_case(&self, id: &str) -> Result<TestCase, StoreError>;

    async fn list_cases(&self, task_id: Option<&str>, limit: usize) -> Result<Vec<TestCase>, StoreError>;

    async fn replace_case(&self, id: &str, update: TestCaseUpdate) -> Result<TestCase, StoreError>;
}
