use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const MESSAGE_REQUESTED: &str =
    "Test will start shortly. If you don't see results in few hours, please contact your teacher";
pub const MESSAGE_FINISHED: &str = "All tests finished successfully";
pub const MESSAGE_FAILED: &str = "Something went wrong. Please contact your teacher.";

/// Artifact names written by the worker side for every finished run
pub const ARTIFACT_STUDENTS: &str = "students.json";
pub const ARTIFACT_TEACHERS: &str = "teachers.json";
pub const ARTIFACT_DUMP: &str = "dump.zip";

/// File name the submission source is delivered under in a work order
pub const SUBMISSION_FILE: &str = "main.cpp";

/// Upper bound accepted for `TestCase::max_runs`
pub const MAX_RUNS_LIMIT: u32 = 100;

/// Test case definition. Immutable after creation except for a full-field replace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub id: String,
    pub name: String,
    pub task_id: String,
    pub docker_image: String,
    pub max_runs: u32,
    pub claim_name: String,
    pub claim_value: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Admin request for a new test case. `id` and `createdAt` are assigned on insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTestCase {
    pub name: String,
    pub task_id: String,
    pub docker_image: String,
    pub max_runs: u32,
    pub claim_name: String,
    pub claim_value: String,
    pub created_by: String,
}

/// Full-field replacement of a test case
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseUpdate {
    pub name: String,
    pub task_id: String,
    pub docker_image: String,
    pub max_runs: u32,
    pub claim_name: String,
    pub claim_value: String,
}

impl NewTestCase {
    pub fn validate(&self) -> Result<(), String> {
        require("name", &self.name)?;
        require("taskId", &self.task_id)?;
        require("dockerImage", &self.docker_image)?;
        require("claimName", &self.claim_name)?;
        require("claimValue", &self.claim_value)?;
        require("createdBy", &self.created_by)?;
        check_max_runs(self.max_runs)
    }

    pub fn into_test_case(self) -> TestCase {
        TestCase {
            id: uuid::Uuid::new_v4().to_string(),
            name: self.name,
            task_id: self.task_id,
            docker_image: self.docker_image,
            max_runs: self.max_runs,
            claim_name: self.claim_name,
            claim_value: self.claim_value,
            created_by: self.created_by,
            created_at: Utc::now(),
        }
    }
}

impl TestCaseUpdate {
    pub fn validate(&self) -> Result<(), String> {
        require("name", &self.name)?;
        require("taskId", &self.task_id)?;
        require("dockerImage", &self.docker_image)?;
        require("claimName", &self.claim_name)?;
        require("claimValue", &self.claim_value)?;
        check_max_runs(self.max_runs)
    }

    /// Apply to an existing case, keeping its identity and provenance
    pub fn apply(self, existing: &TestCase) -> TestCase {
        TestCase {
            id: existing.id.clone(),
            name: self.name,
            task_id: self.task_id,
            docker_image: self.docker_image,
            max_runs: self.max_runs,
            claim_name: self.claim_name,
            claim_value: self.claim_value,
            created_by: existing.created_by.clone(),
            created_at: existing.created_at,
        }
    }
}

fn check_max_runs(max_runs: u32) -> Result<(), String> {
    if max_runs > MAX_RUNS_LIMIT {
        return Err(format!("maxRuns must be between 0 and {}", MAX_RUNS_LIMIT));
    }
    Ok(())
}

fn require(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{} is required", field));
    }
    Ok(())
}

/// Lifecycle state of a test run.
///
/// Only `Requested` and `Finished` drive behavior here. Values written by other
/// parties that we do not recognise are kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TestStatus {
    Requested,
    Finished,
    Failed,
    Other(String),
}

impl TestStatus {
    /// Result artifacts exist only once the run is finished
    pub fn has_artifacts(&self) -> bool {
        matches!(self, TestStatus::Finished)
    }

    /// No further result can change the run
    pub fn is_terminal(&self) -> bool {
        matches!(self, TestStatus::Finished | TestStatus::Failed)
    }

    pub fn as_str(&self) -> &str {
        match self {
            TestStatus::Requested => "Requested",
            TestStatus::Finished => "Finished",
            TestStatus::Failed => "Failed",
            TestStatus::Other(s) => s,
        }
    }
}

impl From<String> for TestStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Requested" => TestStatus::Requested,
            "Finished" => TestStatus::Finished,
            "Failed" => TestStatus::Failed,
            _ => TestStatus::Other(value),
        }
    }
}

impl From<TestStatus> for String {
    fn from(status: TestStatus) -> Self {
        match status {
            TestStatus::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job record: one requested execution of a test case against a submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRun {
    pub id: String,
    pub task_id: String,
    pub submission_id: String,
    pub test_case_id: String,
    pub created_by: String,
    pub task_name: String,
    pub test_case_name: String,
    pub content_url: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: TestStatus,
    pub message: String,
    pub counted: bool,
    /// Populated from the object store on read, never persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub students: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teachers: Option<String>,
}

impl TestRun {
    /// Build a freshly admitted run from a request
    pub fn requested(request: JobRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: request.task_id,
            submission_id: request.submission_id,
            test_case_id: request.test_case_id,
            created_by: request.created_by,
            task_name: request.task_name,
            test_case_name: request.test_case_name,
            content_url: request.content_url,
            created_at: Utc::now(),
            finished_at: None,
            status: TestStatus::Requested,
            message: MESSAGE_REQUESTED.to_string(),
            counted: request.counted,
            students: None,
            teachers: None,
        }
    }

    /// Copy without the transient result bodies, as written to the record store
    pub fn for_storage(&self) -> Self {
        Self {
            students: None,
            teachers: None,
            ..self.clone()
        }
    }
}

/// Admission request sent by the presentation layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub task_id: String,
    pub submission_id: String,
    pub test_case_id: String,
    pub created_by: String,
    pub task_name: String,
    pub test_case_name: String,
    pub content_url: String,
    pub counted: bool,
}

impl JobRequest {
    pub fn validate(&self) -> Result<(), String> {
        require("taskId", &self.task_id)?;
        require("submissionId", &self.submission_id)?;
        require("testCaseId", &self.test_case_id)?;
        require("createdBy", &self.created_by)?;
        require("taskName", &self.task_name)?;
        require("testCaseName", &self.test_case_name)?;
        require("contentUrl", &self.content_url)
    }
}

/// Optional filters for listing runs; all set filters must match
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFilter {
    pub user: Option<String>,
    pub submission_id: Option<String>,
    pub task_id: Option<String>,
}

impl RunFilter {
    pub fn matches(&self, run: &TestRun) -> bool {
        self.user.as_deref().map_or(true, |u| run.created_by == u)
            && self
                .submission_id
                .as_deref()
                .map_or(true, |s| run.submission_id == s)
            && self.task_id.as_deref().map_or(true, |t| run.task_id == t)
    }
}

/// Count of quota-consuming runs for one user and test case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunCount {
    pub test_case_id: String,
    pub user_email: String,
    pub count: u64,
}

/// Queue payload handed to the execution worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkMessage {
    pub content_url: String,
    pub docker_image: String,
    /// Run id, echoed back by the worker to correlate results
    #[serde(alias = "metaData", alias = "MetaData")]
    pub metadata: String,
}

impl WorkMessage {
    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json_bytes(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

/// Worker-ready order produced by the queue reader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkOrder {
    pub return_url: Option<String>,
    #[serde(rename = "metaData")]
    pub metadata: String,
    pub docker_image: String,
    pub files: BTreeMap<String, String>,
}

/// Result notification published by the worker side once a run completes.
/// Each body field is a reference (URL or store key) to the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    #[serde(alias = "metadata", alias = "MetaData")]
    pub meta_data: String,
    #[serde(alias = "Students")]
    pub students: String,
    #[serde(alias = "Teachers")]
    pub teachers: String,
    #[serde(default, alias = "Data")]
    pub data: Option<String>,
}
