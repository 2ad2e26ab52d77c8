//! Deterministic key naming shared by the API, the reader and the CLI.
//! Every component derives keys from here so writers and readers never drift.

pub const KEY_PREFIX: &str = "testbay";
pub const CONTAINERS_KEY: &str = "testbay:containers";

/// URL-encode one key segment (form encoding, spaces become `+`)
pub fn encode_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}

/// Object store key for a run artifact: `<user>/<job>/<artifact>`, each segment encoded
pub fn artifact_key(user_email: &str, job_id: &str, artifact: &str) -> String {
    format!(
        "{}/{}/{}",
        encode_segment(user_email),
        encode_segment(job_id),
        encode_segment(artifact)
    )
}

/// Object store key for uploaded submission sources
pub fn submission_key(user_email: &str, submission_id: &str, file_name: &str) -> String {
    format!(
        "submissions/{}",
        artifact_key(user_email, submission_id, file_name)
    )
}

/// Redis key holding a blob of the given container
pub fn blob_key(container: &str, key: &str) -> String {
    format!("{}:blob:{}:{}", KEY_PREFIX, container, key)
}

pub fn run_key(id: &str) -> String {
    format!("{}:run:{}", KEY_PREFIX, encode_segment(id))
}

pub fn case_key(id: &str) -> String {
    format!("{}:case:{}", KEY_PREFIX, encode_segment(id))
}

/// Sorted set of all runs, scored by creation time
pub fn runs_index() -> String {
    format!("{}:runs", KEY_PREFIX)
}

pub fn runs_by_user_index(user: &str) -> String {
    format!("{}:runs:user:{}", KEY_PREFIX, encode_segment(user))
}

pub fn runs_by_submission_index(submission_id: &str) -> String {
    format!("{}:runs:submission:{}", KEY_PREFIX, encode_segment(submission_id))
}

pub fn runs_by_task_index(task_id: &str) -> String {
    format!("{}:runs:task:{}", KEY_PREFIX, encode_segment(task_id))
}

/// Set of run ids that consume quota for a (user, test case) pair
pub fn counted_runs_key(user: &str, test_case_id: &str) -> String {
    format!(
        "{}:counted:{}:{}",
        KEY_PREFIX,
        encode_segment(user),
        encode_segment(test_case_id)
    )
}

pub fn cases_index() -> String {
    format!("{}:cases", KEY_PREFIX)
}

pub fn cases_by_task_index(task_id: &str) -> String {
    format!("{}:cases:task:{}", KEY_PREFIX, encode_segment(task_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_key_format() {
        assert_eq!(
            artifact_key("u1@example.com", "job-42", "students.json"),
            "u1%40example.com/job-42/students.json"
        );
    }

    #[test]
    fn test_artifact_key_deterministic() {
        let key1 = artifact_key("a b@x.org", "id/1", "teachers.json");
        let key2 = artifact_key("a b@x.org", "id/1", "teachers.json");
        assert_eq!(key1, key2);
    }

    #[test]
    fn test_segments_cannot_inject_separators() {
        let key = artifact_key("evil/user", "job", "file");
        assert_eq!(key, "evil%2Fuser/job/file");
        assert_eq!(key.matches('/').count(), 2);
    }

    #[test]
    fn test_space_is_form_encoded() {
        assert_eq!(encode_segment("a b"), "a+b");
    }

    #[test]
    fn test_counted_key_separates_user_and_case() {
        assert_ne!(counted_runs_key("a:b", "c"), counted_runs_key("a", "b:c"));
    }

    #[test]
    fn test_submission_key_prefix() {
        let key = submission_key("u1@example.com", "sub-1", "main.cpp");
        assert_eq!(key, "submissions/u1%40example.com/sub-1/main.cpp");
    }

    #[test]
    fn test_blob_key_scoped_by_container() {
        assert_eq!(blob_key("testresults", "a/b"), "testbay:blob:testresults:a/b");
    }
}
