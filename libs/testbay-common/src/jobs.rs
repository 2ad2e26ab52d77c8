//! Job orchestration: admission, publication and result re-hydration.
//!
//! Admission is not atomic. The quota read, the record insert and the publish
//! are separate steps, so concurrent counted requests for one (user, test
//! case) pair can overshoot `maxRuns`, and a publish failure after the insert
//! leaves a `Requested` run with no queued work. Both are accepted limitations.

use crate::keys;
use crate::queue::{QueueError, WorkPublisher};
use crate::quota::{Admission, QuotaEnforcer, QuotaError};
use crate::storage::{ObjectStore, StorageError};
use crate::store::{StoreError, TestCaseStore, TestRunStore};
use crate::types::{
    JobRequest, NewTestCase, RunFilter, TestCase, TestCaseUpdate, TestRun, TestRunCount,
    WorkMessage, ARTIFACT_STUDENTS, ARTIFACT_TEACHERS,
};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("test case {0} does not exist")]
    UnknownTestCase(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Store(StoreError),

    #[error("job {job_id} was recorded but could not be queued: {source}")]
    Publish {
        job_id: String,
        #[source]
        source: QueueError,
    },

    #[error("failed to load results of job {job_id}: {source}")]
    Artifact {
        job_id: String,
        #[source]
        source: StorageError,
    },
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => JobError::NotFound(format!("{kind} {id}")),
            other => JobError::Store(other),
        }
    }
}

impl From<QuotaError> for JobError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::UnknownTestCase(id) => JobError::UnknownTestCase(id),
            QuotaError::Store(e) => e.into(),
        }
    }
}

/// Result of an admission request
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Accepted(TestRun),
    LimitReached { used: u64, max: u32 },
}

#[derive(Clone)]
pub struct JobService {
    runs: Arc<dyn TestRunStore>,
    cases: Arc<dyn TestCaseStore>,
    objects: Arc<dyn ObjectStore>,
    publisher: WorkPublisher,
    quota: QuotaEnforcer,
}

impl JobService {
    pub fn new(
        runs: Arc<dyn TestRunStore>,
        cases: Arc<dyn TestCaseStore>,
        objects: Arc<dyn ObjectStore>,
        publisher: WorkPublisher,
    ) -> Self {
        let quota = QuotaEnforcer::new(runs.clone(), cases.clone());
        Self {
            runs,
            cases,
            objects,
            publisher,
            quota,
        }
    }

    pub fn publisher(&self) -> &WorkPublisher {
        &self.publisher
    }

    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    /// Admit a run: resolve the test case, check quota, record, then publish
    #[instrument(skip(self, request), fields(user = %request.created_by, test_case_id = %request.test_case_id))]
    pub async fn create_job(&self, request: JobRequest) -> Result<CreateOutcome, JobError> {
        request.validate().map_err(JobError::Validation)?;

        let case = match self.cases.get_case(&request.test_case_id).await {
            Ok(case) => case,
            Err(e) if e.is_not_found() => {
                return Err(JobError::UnknownTestCase(request.test_case_id))
            }
            Err(e) => return Err(JobError::Store(e)),
        };

        if let Admission::LimitReached { used, max } = self
            .quota
            .admit_case(&request.created_by, &case, request.counted)
            .await?
        {
            info!(used, max, "Run rejected, quota exhausted");
            return Ok(CreateOutcome::LimitReached { used, max });
        }

        let run = TestRun::requested(request);
        self.runs.insert_run(&run).await.map_err(JobError::Store)?;

        let message = WorkMessage {
            content_url: run.content_url.clone(),
            docker_image: case.docker_image.clone(),
            metadata: run.id.clone(),
        };
        if let Err(source) = self.publisher.publish(&message).await {
            // Known gap: the run stays Requested with nothing queued for it
            error!(
                job_id = %run.id,
                queue = %self.publisher.queue_name(),
                error = %source,
                "Run recorded but publish failed; job is orphaned"
            );
            return Err(JobError::Publish {
                job_id: run.id,
                source,
            });
        }

        info!(job_id = %run.id, counted = run.counted, "Run admitted and queued");
        Ok(CreateOutcome::Accepted(run))
    }

    /// Fetch a run owned by `user`, with result bodies once it has finished.
    /// A run owned by someone else is reported as not found.
    #[instrument(skip(self))]
    pub async fn get_job(&self, user: &str, job_id: &str) -> Result<TestRun, JobError> {
        let mut run = self.runs.get_run(job_id).await?;
        if run.created_by != user {
            warn!(owner = %run.created_by, "Run requested by a different user");
            return Err(JobError::NotFound(format!("test run {job_id}")));
        }

        if run.status.has_artifacts() {
            let students_key = keys::artifact_key(user, job_id, ARTIFACT_STUDENTS);
            let teachers_key = keys::artifact_key(user, job_id, ARTIFACT_TEACHERS);
            let (students, teachers) = tokio::try_join!(
                self.objects.download(&students_key),
                self.objects.download(&teachers_key),
            )
            .map_err(|source| {
                error!(job_id = %job_id, error = %source, "Finished run is missing results");
                JobError::Artifact {
                    job_id: job_id.to_string(),
                    source,
                }
            })?;

            run.students = Some(String::from_utf8_lossy(&students).into_owned());
            run.teachers = Some(String::from_utf8_lossy(&teachers).into_owned());
        }

        Ok(run)
    }

    pub async fn list_jobs(&self, filter: &RunFilter, limit: usize) -> Result<Vec<TestRun>, JobError> {
        Ok(self.runs.list_runs(filter, limit).await?)
    }

    /// Include or exclude a run from quota accounting. Other runs are not re-checked.
    #[instrument(skip(self))]
    pub async fn set_counted(&self, job_id: &str, counted: bool) -> Result<TestRun, JobError> {
        let run = self.runs.set_counted(job_id, counted).await?;
        info!(job_id = %job_id, counted, "Run quota flag changed");
        Ok(run)
    }

    pub async fn count_counted(&self, user: &str, test_case_id: &str) -> Result<TestRunCount, JobError> {
        let count = self.runs.count_counted(user, test_case_id).await?;
        Ok(TestRunCount {
            test_case_id: test_case_id.to_string(),
            user_email: user.to_string(),
            count,
        })
    }

    pub async fn create_case(&self, new_case: NewTestCase) -> Result<TestCase, JobError> {
        new_case.validate().map_err(JobError::Validation)?;
        let case = new_case.into_test_case();
        self.cases.insert_case(&case).await?;
        info!(test_case_id = %case.id, max_runs = case.max_runs, "Test case created");
        Ok(case)
    }

    pub async fn get_case(&self, id: &str) -> Result<TestCase, JobError> {
        Ok(self.cases.get_case(id).await?)
    }

    pub async fn list_cases(&self, task_id: Option<&str>, limit: usize) -> Result<Vec<TestCase>, JobError> {
        Ok(self.cases.list_cases(task_id, limit).await?)
    }

    pub async fn update_case(&self, id: &str, update: TestCaseUpdate) -> Result<TestCase, JobError> {
        update.validate().map_err(JobError::Validation)?;
        let case = self.cases.replace_case(id, update).await?;
        info!(test_case_id = %id, "Test case replaced");
        Ok(case)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemoryBroker, MessageBroker, QueueSpec};
    use crate::storage::MemoryObjectStore;
    use crate::store::MemoryDocumentStore;
    use crate::types::{TestStatus, MESSAGE_FINISHED, MESSAGE_REQUESTED};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use tokio::sync::Barrier;

    const QUEUE: &str = "requests";

    struct Harness {
        store: Arc<MemoryDocumentStore>,
        objects: Arc<MemoryObjectStore>,
        broker: Arc<MemoryBroker>,
        service: JobService,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryDocumentStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let publisher = WorkPublisher::new(broker.clone(), QueueSpec::quorum(QUEUE));
        let service = JobService::new(store.clone(), store.clone(), objects.clone(), publisher);
        Harness {
            store,
            objects,
            broker,
            service,
        }
    }

    fn new_case(max_runs: u32) -> NewTestCase {
        NewTestCase {
            name: "Basic".to_string(),
            task_id: "task-1".to_string(),
            docker_image: "img:1".to_string(),
            max_runs,
            claim_name: "group".to_string(),
            claim_value: "a".to_string(),
            created_by: "admin@example.com".to_string(),
        }
    }

    fn request(user: &str, case_id: &str, counted: bool) -> JobRequest {
        JobRequest {
            task_id: "task-1".to_string(),
            submission_id: "sub-1".to_string(),
            test_case_id: case_id.to_string(),
            created_by: user.to_string(),
            task_name: "Linked lists".to_string(),
            test_case_name: "Basic".to_string(),
            content_url: "https://x/blob1".to_string(),
            counted,
        }
    }

    fn accepted(outcome: CreateOutcome) -> TestRun {
        match outcome {
            CreateOutcome::Accepted(run) => run,
            other => panic!("expected acceptance, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_third_counted_run_hits_limit() {
        let h = harness();
        let case = h.service.create_case(new_case(2)).await.unwrap();

        accepted(h.service.create_job(request("u1", &case.id, true)).await.unwrap());
        accepted(h.service.create_job(request("u1", &case.id, true)).await.unwrap());
        let third = h.service.create_job(request("u1", &case.id, true)).await.unwrap();
        assert_eq!(third, CreateOutcome::LimitReached { used: 2, max: 2 });

        let count = h.service.count_counted("u1", &case.id).await.unwrap();
        assert_eq!(count.count, 2);
        assert_eq!(h.broker.ready_count(QUEUE).await, 2);
    }

    #[tokio::test]
    async fn test_uncounted_runs_never_hit_limit() {
        let h = harness();
        let case = h.service.create_case(new_case(0)).await.unwrap();

        for _ in 0..3 {
            accepted(h.service.create_job(request("u1", &case.id, false)).await.unwrap());
        }
        assert_eq!(
            h.service.create_job(request("u1", &case.id, true)).await.unwrap(),
            CreateOutcome::LimitReached { used: 0, max: 0 }
        );
    }

    #[tokio::test]
    async fn test_admitted_run_is_published() {
        let h = harness();
        let case = h.service.create_case(new_case(5)).await.unwrap();

        let run = accepted(h.service.create_job(request("u1", &case.id, true)).await.unwrap());
        assert_eq!(run.status, TestStatus::Requested);
        assert_eq!(run.message, MESSAGE_REQUESTED);

        let delivery = h.broker.get(QUEUE).await.unwrap().unwrap();
        let message = WorkMessage::from_json_bytes(&delivery.data).unwrap();
        assert_eq!(
            message,
            WorkMessage {
                content_url: "https://x/blob1".to_string(),
                docker_image: "img:1".to_string(),
                metadata: run.id.clone(),
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_test_case_is_bad_request() {
        let h = harness();
        let err = h.service.create_job(request("u1", "missing", true)).await.unwrap_err();
        assert!(matches!(err, JobError::UnknownTestCase(_)));
    }

    #[tokio::test]
    async fn test_invalid_request_rejected_before_lookup() {
        let h = harness();
        let mut bad = request("u1", "tc1", true);
        bad.created_by = String::new();
        assert!(matches!(
            h.service.create_job(bad).await,
            Err(JobError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_failure_leaves_orphaned_requested_run() {
        let h = harness();
        let case = h.service.create_case(new_case(5)).await.unwrap();
        h.broker.close().await;
        h.broker.set_reachable(false).await;

        let err = h
            .service
            .create_job(request("u1", &case.id, true))
            .await
            .unwrap_err();
        let JobError::Publish { job_id, source } = err else {
            panic!("expected publish error");
        };
        assert!(source.is_connection_lost());

        // The record exists and still consumes quota even though nothing was queued
        let orphan = h.store.get_run(&job_id).await.unwrap();
        assert_eq!(orphan.status, TestStatus::Requested);
        assert_eq!(h.service.count_counted("u1", &case.id).await.unwrap().count, 1);
        assert_eq!(h.broker.ready_count(QUEUE).await, 0);
    }

    #[tokio::test]
    async fn test_publish_recovers_from_dropped_connection() {
        let h = harness();
        let case = h.service.create_case(new_case(5)).await.unwrap();
        h.broker.drop_connection_on_next_publish().await;

        accepted(h.service.create_job(request("u1", &case.id, true)).await.unwrap());
        assert_eq!(h.broker.reconnects().await, 1);
        assert_eq!(h.broker.ready_count(QUEUE).await, 1);
    }

    /// Holds every quota read until two of them are in flight
    struct LockstepRuns {
        inner: Arc<MemoryDocumentStore>,
        barrier: Barrier,
    }

    #[async_trait]
    impl TestRunStore for LockstepRuns {
        async fn insert_run(&self, run: &TestRun) -> Result<(), StoreError> {
            self.inner.insert_run(run).await
        }

        async fn get_run(&self, id: &str) -> Result<TestRun, StoreError> {
            self.inner.get_run(id).await
        }

        async fn list_runs(&self, filter: &RunFilter, limit: usize) -> Result<Vec<TestRun>, StoreError> {
            self.inner.list_runs(filter, limit).await
        }

        async fn count_counted(&self, user: &str, test_case_id: &str) -> Result<u64, StoreError> {
            let count = self.inner.count_counted(user, test_case_id).await?;
            self.barrier.wait().await;
            Ok(count)
        }

        async fn update_status(
            &self,
            id: &str,
            status: TestStatus,
            message: &str,
            finished_at: Option<DateTime<Utc>>,
        ) -> Result<(), StoreError> {
            self.inner.update_status(id, status, message, finished_at).await
        }

        async fn set_counted(&self, id: &str, counted: bool) -> Result<TestRun, StoreError> {
            self.inner.set_counted(id, counted).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_admissions_can_overshoot_max_runs() {
        let store = Arc::new(MemoryDocumentStore::new());
        let runs = Arc::new(LockstepRuns {
            inner: store.clone(),
            barrier: Barrier::new(2),
        });
        let broker = Arc::new(MemoryBroker::new());
        let service = JobService::new(
            runs,
            store.clone(),
            Arc::new(MemoryObjectStore::new()),
            WorkPublisher::new(broker.clone(), QueueSpec::quorum(QUEUE)),
        );
        let case = service.create_case(new_case(1)).await.unwrap();

        let (a, b) = tokio::join!(
            service.create_job(request("u1", &case.id, true)),
            service.create_job(request("u1", &case.id, true)),
        );

        // Both read a count of zero before either inserted
        accepted(a.unwrap());
        accepted(b.unwrap());
        assert_eq!(store.count_counted("u1", &case.id).await.unwrap(), 2);
        assert_eq!(broker.ready_count(QUEUE).await, 2);
    }

    #[tokio::test]
    async fn test_get_job_is_owner_scoped() {
        let h = harness();
        let case = h.service.create_case(new_case(5)).await.unwrap();
        let run = accepted(h.service.create_job(request("userB", &case.id, true)).await.unwrap());

        let err = h.service.get_job("userA", &run.id).await.unwrap_err();
        assert!(matches!(err, JobError::NotFound(_)));

        let missing = h.service.get_job("userA", "no-such-job").await.unwrap_err();
        assert_eq!(err.to_string(), missing.to_string().replace("no-such-job", &run.id));
    }

    #[tokio::test]
    async fn test_requested_job_has_no_results() {
        let h = harness();
        let case = h.service.create_case(new_case(5)).await.unwrap();
        let run = accepted(h.service.create_job(request("u1", &case.id, false)).await.unwrap());

        let fetched = h.service.get_job("u1", &run.id).await.unwrap();
        assert!(fetched.students.is_none());
        assert!(fetched.teachers.is_none());
    }

    #[tokio::test]
    async fn test_finished_job_loads_both_artifacts() {
        let h = harness();
        let case = h.service.create_case(new_case(5)).await.unwrap();
        let run = accepted(h.service.create_job(request("u1@example.com", &case.id, false)).await.unwrap());

        h.objects
            .upload(&keys::artifact_key("u1@example.com", &run.id, ARTIFACT_STUDENTS), b"{\"s\":1}")
            .await
            .unwrap();
        h.objects
            .upload(&keys::artifact_key("u1@example.com", &run.id, ARTIFACT_TEACHERS), b"{\"t\":1}")
            .await
            .unwrap();
        h.store
            .update_status(&run.id, TestStatus::Finished, MESSAGE_FINISHED, Some(Utc::now()))
            .await
            .unwrap();

        let fetched = h.service.get_job("u1@example.com", &run.id).await.unwrap();
        assert_eq!(fetched.students.as_deref(), Some("{\"s\":1}"));
        assert_eq!(fetched.teachers.as_deref(), Some("{\"t\":1}"));
    }

    #[tokio::test]
    async fn test_finished_job_without_artifacts_is_server_error() {
        let h = harness();
        let case = h.service.create_case(new_case(5)).await.unwrap();
        let run = accepted(h.service.create_job(request("u1", &case.id, false)).await.unwrap());
        h.objects
            .upload(&keys::artifact_key("u1", &run.id, ARTIFACT_STUDENTS), b"{}")
            .await
            .unwrap();
        h.store
            .update_status(&run.id, TestStatus::Finished, MESSAGE_FINISHED, Some(Utc::now()))
            .await
            .unwrap();

        let err = h.service.get_job("u1", &run.id).await.unwrap_err();
        assert!(matches!(err, JobError::Artifact { .. }));
    }

    #[tokio::test]
    async fn test_set_counted_frees_quota() {
        let h = harness();
        let case = h.service.create_case(new_case(1)).await.unwrap();
        let run = accepted(h.service.create_job(request("u1", &case.id, true)).await.unwrap());
        assert!(matches!(
            h.service.create_job(request("u1", &case.id, true)).await.unwrap(),
            CreateOutcome::LimitReached { .. }
        ));

        let updated = h.service.set_counted(&run.id, false).await.unwrap();
        assert!(!updated.counted);
        accepted(h.service.create_job(request("u1", &case.id, true)).await.unwrap());
    }

    #[tokio::test]
    async fn test_set_counted_unknown_run() {
        let h = harness();
        assert!(matches!(
            h.service.set_counted("missing", true).await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_jobs_most_recent_first() {
        let h = harness();
        let case = h.service.create_case(new_case(10)).await.unwrap();
        for _ in 0..4 {
            accepted(h.service.create_job(request("u1", &case.id, false)).await.unwrap());
        }

        let filter = RunFilter {
            user: Some("u1".to_string()),
            ..Default::default()
        };
        let listed = h.service.list_jobs(&filter, 3).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }

    #[tokio::test]
    async fn test_update_case_validates_and_replaces() {
        let h = harness();
        let case = h.service.create_case(new_case(1)).await.unwrap();

        let mut update = TestCaseUpdate {
            name: "Renamed".to_string(),
            task_id: "task-1".to_string(),
            docker_image: "img:2".to_string(),
            max_runs: 101,
            claim_name: "group".to_string(),
            claim_value: "a".to_string(),
        };
        assert!(matches!(
            h.service.update_case(&case.id, update.clone()).await,
            Err(JobError::Validation(_))
        ));

        update.max_runs = 3;
        let replaced = h.service.update_case(&case.id, update).await.unwrap();
        assert_eq!(replaced.id, case.id);
        assert_eq!(h.service.get_case(&case.id).await.unwrap().docker_image, "img:2");
    }
}
