// CLI commands for managing testbay
use anyhow::{bail, Context, Result};
use testbay_common::backends::Backends;
use testbay_common::jobs::CreateOutcome;
use testbay_common::keys;
use testbay_common::types::{
    JobRequest, NewTestCase, RunFilter, TestCase, TestCaseUpdate, TestRun, SUBMISSION_FILE,
};

/// Editable fields of a test case as given on the command line
pub struct CaseFields {
    pub name: String,
    pub task_id: String,
    pub docker_image: String,
    pub max_runs: u32,
    pub claim_name: String,
    pub claim_value: String,
}

pub struct Submission {
    pub user: String,
    pub test_case_id: String,
    pub task_id: String,
    pub submission_id: String,
    pub task_name: String,
    pub test_case_name: String,
    pub counted: bool,
}

fn print_case(case: &TestCase) {
    println!(
        "  {}  {}  task={}  image={}  maxRuns={}",
        case.id, case.name, case.task_id, case.docker_image, case.max_runs
    );
}

fn print_run(run: &TestRun) {
    let counted = if run.counted { "counted" } else { "free" };
    println!(
        "  {}  {}  {}  {}  {}  {}",
        run.created_at.format("%Y-%m-%d %H:%M:%S"),
        run.id,
        run.created_by,
        run.test_case_name,
        run.status,
        counted
    );
}

pub async fn create_case(backends: &Backends, fields: CaseFields, created_by: &str) -> Result<TestCase> {
    println!("🧪 Creating test case: {}", fields.name);

    let case = backends
        .jobs
        .create_case(NewTestCase {
            name: fields.name,
            task_id: fields.task_id,
            docker_image: fields.docker_image,
            max_runs: fields.max_runs,
            claim_name: fields.claim_name,
            claim_value: fields.claim_value,
            created_by: created_by.to_string(),
        })
        .await?;

    println!("✅ Test case created: {}", case.id);
    Ok(case)
}

pub async fn update_case(backends: &Backends, id: &str, fields: CaseFields) -> Result<TestCase> {
    println!("📝 Replacing test case: {}", id);

    let case = backends
        .jobs
        .update_case(
            id,
            TestCaseUpdate {
                name: fields.name,
                task_id: fields.task_id,
                docker_image: fields.docker_image,
                max_runs: fields.max_runs,
                claim_name: fields.claim_name,
                claim_value: fields.claim_value,
            },
        )
        .await?;

    println!("✅ Test case updated");
    print_case(&case);
    Ok(case)
}

pub async fn list_cases(backends: &Backends, task_id: Option<&str>, limit: Option<usize>) -> Result<()> {
    let limit = limit.unwrap_or(backends.config.case_list_limit);
    let cases = backends.jobs.list_cases(task_id, limit).await?;

    if cases.is_empty() {
        println!("No test cases found");
        return Ok(());
    }
    println!("📋 Test cases ({}):", cases.len());
    for case in &cases {
        print_case(case);
    }
    Ok(())
}

/// Upload the source under its submission key, then request a run pointing at it
pub async fn submit(backends: &Backends, submission: Submission, source: &[u8]) -> Result<TestRun> {
    if source.is_empty() {
        bail!("Source file is empty");
    }

    let key = keys::submission_key(&submission.user, &submission.submission_id, SUBMISSION_FILE);
    println!("📤 Uploading submission to {}...", key);
    backends
        .objects
        .upload(&key, source)
        .await
        .context("Failed to upload submission")?;

    let request = JobRequest {
        task_id: submission.task_id,
        submission_id: submission.submission_id,
        test_case_id: submission.test_case_id,
        created_by: submission.user,
        task_name: submission.task_name,
        test_case_name: submission.test_case_name,
        content_url: key,
        counted: submission.counted,
    };

    match backends.jobs.create_job(request).await? {
        CreateOutcome::Accepted(run) => {
            println!("✅ Test run queued: {}", run.id);
            println!("\n📋 Check progress with: testbay-cli status --user {} --id {}", run.created_by, run.id);
            Ok(run)
        }
        CreateOutcome::LimitReached { used, max } => {
            bail!("Run limit reached for this test case ({} of {} used)", used, max)
        }
    }
}

pub async fn status(backends: &Backends, user: &str, id: &str) -> Result<TestRun> {
    let run = backends.jobs.get_job(user, id).await?;

    println!("🔎 Test run {}", run.id);
    println!("  Status:    {}", run.status);
    println!("  Message:   {}", run.message);
    println!("  Test case: {} ({})", run.test_case_name, run.test_case_id);
    println!("  Counted:   {}", run.counted);
    if let Some(finished) = run.finished_at {
        println!("  Finished:  {}", finished.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(students) = &run.students {
        println!("\n📄 Students:\n{}", students);
    }
    if let Some(teachers) = &run.teachers {
        println!("\n📄 Teachers:\n{}", teachers);
    }
    Ok(run)
}

pub async fn list_runs(
    backends: &Backends,
    user: Option<String>,
    submission_id: Option<String>,
    task_id: Option<String>,
    limit: Option<usize>,
) -> Result<Vec<TestRun>> {
    let filter = RunFilter {
        user,
        submission_id,
        task_id,
    };
    let limit = limit.unwrap_or(backends.config.list_limit);
    let runs = backends.jobs.list_jobs(&filter, limit).await?;

    if runs.is_empty() {
        println!("No test runs found");
    } else {
        println!("📋 Test runs ({}):", runs.len());
        for run in &runs {
            print_run(run);
        }
    }
    Ok(runs)
}

pub async fn count(backends: &Backends, user: &str, test_case_id: &str) -> Result<u64> {
    let count = backends.jobs.count_counted(user, test_case_id).await?;
    println!(
        "📊 {} has {} counted run(s) for test case {}",
        count.user_email, count.count, count.test_case_id
    );
    Ok(count.count)
}

pub async fn set_counted(backends: &Backends, id: &str, counted: bool) -> Result<()> {
    let run = backends.jobs.set_counted(id, counted).await?;
    if run.counted {
        println!("✅ Run {} now counts toward the quota", run.id);
    } else {
        println!("✅ Run {} no longer counts toward the quota", run.id);
    }
    Ok(())
}

pub async fn receive(backends: &Backends, queue: Option<&str>) -> Result<()> {
    let queue = queue.unwrap_or(backends.config.request_queue.as_str());

    match backends.reader().try_receive_one(queue).await? {
        Some(order) => {
            println!("📥 Work order for job {}:", order.metadata);
            println!("{}", serde_json::to_string_pretty(&order)?);
        }
        None => println!("📭 Queue {} is empty", queue),
    }
    Ok(())
}

pub async fn depth(backends: &Backends, queue: Option<&str>) -> Result<u32> {
    let queue = queue.unwrap_or(backends.config.request_queue.as_str());

    backends.broker.ensure_connected().await?;
    let count = backends
        .broker
        .message_count(queue)
        .await
        .with_context(|| format!("Failed to read depth of {}", queue))?;

    println!("📊 {} message(s) ready in {}", count, queue);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use testbay_common::config::Config;
    use testbay_common::queue::QueueSpec;

    fn fields(max_runs: u32) -> CaseFields {
        CaseFields {
            name: "Basic".to_string(),
            task_id: "task-1".to_string(),
            docker_image: "img:1".to_string(),
            max_runs,
            claim_name: "group".to_string(),
            claim_value: "a".to_string(),
        }
    }

    fn submission(case_id: &str) -> Submission {
        Submission {
            user: "u1@example.com".to_string(),
            test_case_id: case_id.to_string(),
            task_id: "task-1".to_string(),
            submission_id: "sub-1".to_string(),
            task_name: "Linked lists".to_string(),
            test_case_name: "Basic".to_string(),
            counted: true,
        }
    }

    #[tokio::test]
    async fn test_submit_then_receive_work_order() {
        let backends = Backends::in_memory(&Config::default());
        let case = create_case(&backends, fields(2), "admin@example.com").await.unwrap();

        let run = submit(&backends, submission(&case.id), b"int main() {}").await.unwrap();
        assert_eq!(
            run.content_url,
            keys::submission_key("u1@example.com", "sub-1", SUBMISSION_FILE)
        );
        assert_eq!(count(&backends, "u1@example.com", &case.id).await.unwrap(), 1);

        let order = backends
            .reader()
            .try_receive_one(&backends.config.request_queue)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.metadata, run.id);
        assert_eq!(order.files[SUBMISSION_FILE], "int main() {}");
    }

    #[tokio::test]
    async fn test_submit_over_limit_fails() {
        let backends = Backends::in_memory(&Config::default());
        let case = create_case(&backends, fields(1), "admin@example.com").await.unwrap();

        submit(&backends, submission(&case.id), b"v1").await.unwrap();
        let err = submit(&backends, submission(&case.id), b"v2").await.unwrap_err();
        assert!(err.to_string().contains("limit reached"));
    }

    #[tokio::test]
    async fn test_empty_source_rejected() {
        let backends = Backends::in_memory(&Config::default());
        assert!(submit(&backends, submission("tc1"), b"").await.is_err());
    }

    #[tokio::test]
    async fn test_depth_counts_ready_messages() {
        let config = Config::default();
        let backends = Backends::in_memory(&config);
        backends
            .broker
            .declare_queue(&QueueSpec::quorum(&config.request_queue))
            .await
            .unwrap();
        backends.broker.publish(&config.request_queue, b"{}").await.unwrap();

        assert_eq!(depth(&backends, None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_set_counted_and_list() {
        let backends = Backends::in_memory(&Config::default());
        let case = create_case(&backends, fields(3), "admin@example.com").await.unwrap();
        let run = submit(&backends, submission(&case.id), b"src").await.unwrap();

        set_counted(&backends, &run.id, false).await.unwrap();
        assert_eq!(count(&backends, "u1@example.com", &case.id).await.unwrap(), 0);

        let runs = list_runs(&backends, Some("u1@example.com".to_string()), None, None, None)
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert!(!runs[0].counted);
    }
}
