use super::{StoreError, TestCaseStore, TestRunStore};
use crate::types::{RunFilter, TestCase, TestCaseUpdate, TestRun, TestStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-process document store for local runs and tests
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    runs: RwLock<HashMap<String, TestRun>>,
    cases: RwLock<HashMap<String, TestCase>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Newest first, then by id so equal timestamps list deterministically
fn newest_first<T>(items: &mut [T], created_at: impl Fn(&T) -> DateTime<Utc>, id: impl Fn(&T) -> &str) {
    items.sort_by(|a, b| {
        created_at(b)
            .cmp(&created_at(a))
            .then_with(|| id(b).cmp(id(a)))
    });
}

#[async_trait]
impl TestRunStore for MemoryDocumentStore {
    async fn insert_run(&self, run: &TestRun) -> Result<(), StoreError> {
        self.runs
            .write()
            .await
            .insert(run.id.clone(), run.for_storage());
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<TestRun, StoreError> {
        self.runs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::run_not_found(id))
    }

    async fn list_runs(&self, filter: &RunFilter, limit: usize) -> Result<Vec<TestRun>, StoreError> {
        let runs = self.runs.read().await;
        let mut matching: Vec<TestRun> = runs.values().filter(|r| filter.matches(r)).cloned().collect();
        newest_first(&mut matching, |r| r.created_at, |r| r.id.as_str());
        matching.truncate(limit);
        Ok(matching)
    }

    async fn count_counted(&self, user: &str, test_case_id: &str) -> Result<u64, StoreError> {
        let runs = self.runs.read().await;
        let count = runs
            .values()
            .filter(|r| r.counted && r.created_by == user && r.test_case_id == test_case_id)
            .count();
        Ok(count as u64)
    }

    async fn update_status(
        &self,
        id: &str,
        status: TestStatus,
        message: &str,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(id).ok_or_else(|| StoreError::run_not_found(id))?;
        run.status = status;
        run.message = message.to_string();
        run.finished_at = finished_at;
        Ok(())
    }

    async fn set_counted(&self, id: &str, counted: bool) -> Result<TestRun, StoreError> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(id).ok_or_else(|| StoreError::run_not_found(id))?;
        run.counted = counted;
        Ok(run.clone())
    }
}

#[async_trait]
impl TestCaseStore for MemoryDocumentStore {
    async fn insert_case(&self, case: &TestCase) -> Result<(), StoreError> {
        self.cases.write().await.insert(case.id.clone(), case.clone());
        Ok(())
    }

    async fn get_case(&self, id: &str) -> Result<TestCase, StoreError> {
        self.cases
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::case_not_found(id))
    }

    async fn list_cases(&self, task_id: Option<&str>, limit: usize) -> Result<Vec<TestCase>, StoreError> {
        let cases = self.cases.read().await;
        let mut matching: Vec<TestCase> = cases
            .values()
            .filter(|c| task_id.map_or(true, |t| c.task_id == t))
            .cloned()
            .collect();
        newest_first(&mut matching, |c| c.created_at, |c| c.id.as_str());
        matching.truncate(limit);
        Ok(matching)
    }

    async fn replace_case(&self, id: &str, update: TestCaseUpdate) -> Result<TestCase, StoreError> {
        let mut cases = self.cases.write().await;
        let existing = cases.get(id).ok_or_else(|| StoreError::case_not_found(id))?;
        let replaced = update.apply(existing);
        cases.insert(id.to_string(), replaced.clone());
        Ok(replaced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobRequest;
    use chrono::Duration;

    fn make_run(user: &str, submission: &str, case: &str, counted: bool, age_secs: i64) -> TestRun {
        let mut run = TestRun::requested(JobRequest {
            task_id: "task-1".to_string(),
            submission_id: submission.to_string(),
            test_case_id: case.to_string(),
            created_by: user.to_string(),
            task_name: "Task".to_string(),
            test_case_name: "Case".to_string(),
            content_url: "https://x/blob".to_string(),
            counted,
        });
        run.created_at = Utc::now() - Duration::seconds(age_secs);
        run
    }

    #[tokio::test]
    async fn test_get_missing_run_is_not_found() {
        let store = MemoryDocumentStore::new();
        let err = store.get_run("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_runs_newest_first_and_limited() {
        let store = MemoryDocumentStore::new();
        for age in [30, 10, 20, 40] {
            store
                .insert_run(&make_run("u1", "s1", "tc1", false, age))
                .await
                .unwrap();
        }

        let listed = store.list_runs(&RunFilter::default(), 3).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }

    #[tokio::test]
    async fn test_list_runs_applies_filters() {
        let store = MemoryDocumentStore::new();
        store.insert_run(&make_run("u1", "s1", "tc1", false, 1)).await.unwrap();
        store.insert_run(&make_run("u2", "s1", "tc1", false, 2)).await.unwrap();
        store.insert_run(&make_run("u1", "s2", "tc1", false, 3)).await.unwrap();

        let filter = RunFilter {
            user: Some("u1".to_string()),
            submission_id: Some("s1".to_string()),
            task_id: None,
        };
        let listed = store.list_runs(&filter, 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].created_by, "u1");
        assert_eq!(listed[0].submission_id, "s1");
    }

    #[tokio::test]
    async fn test_count_counted_only_matching_pair() {
        let store = MemoryDocumentStore::new();
        store.insert_run(&make_run("u1", "s1", "tc1", true, 1)).await.unwrap();
        store.insert_run(&make_run("u1", "s1", "tc1", false, 2)).await.unwrap();
        store.insert_run(&make_run("u1", "s1", "tc2", true, 3)).await.unwrap();
        store.insert_run(&make_run("u2", "s1", "tc1", true, 4)).await.unwrap();

        assert_eq!(store.count_counted("u1", "tc1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_set_counted_changes_count() {
        let store = MemoryDocumentStore::new();
        let run = make_run("u1", "s1", "tc1", true, 1);
        store.insert_run(&run).await.unwrap();

        let updated = store.set_counted(&run.id, false).await.unwrap();
        assert!(!updated.counted);
        assert_eq!(store.count_counted("u1", "tc1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_status() {
        let store = MemoryDocumentStore::new();
        let run = make_run("u1", "s1", "tc1", false, 1);
        store.insert_run(&run).await.unwrap();

        let now = Utc::now();
        store
            .update_status(&run.id, TestStatus::Finished, "done", Some(now))
            .await
            .unwrap();
        let stored = store.get_run(&run.id).await.unwrap();
        assert_eq!(stored.status, TestStatus::Finished);
        assert_eq!(stored.message, "done");
        assert_eq!(stored.finished_at, Some(now));
    }

    #[tokio::test]
    async fn test_replace_missing_case_is_not_found() {
        let store = MemoryDocumentStore::new();
        let update = TestCaseUpdate {
            name: "n".to_string(),
            task_id: "t".to_string(),
            docker_image: "i".to_string(),
            max_runs: 1,
            claim_name: "c".to_string(),
            claim_value: "v".to_string(),
        };
        assert!(store.replace_case("missing", update).await.unwrap_err().is_not_found());
    }
}
