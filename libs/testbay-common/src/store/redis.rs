use super::{StoreError, TestCaseStore, TestRunStore};
use crate::keys;
use crate::types::{RunFilter, TestCase, TestCaseUpdate, TestRun, TestStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

/// Ids fetched from an index per round trip while filtering a listing
const SCAN_BATCH: isize = 64;

/// Compare-and-set attempts before a point update on a run gives up
const UPDATE_ATTEMPTS: u32 = 16;

/// Replace a run document only if it still holds the bytes the caller read,
/// adjusting the counted set in the same step.
///
/// KEYS: document, counted set. ARGV: expected, replacement, `add`/`rem`/`keep`, run id.
const RUN_CAS_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[2])
if ARGV[3] == 'add' then
    redis.call('SADD', KEYS[2], ARGV[4])
elseif ARGV[3] == 'rem' then
    redis.call('SREM', KEYS[2], ARGV[4])
end
return 1
"#;

/// Document store on Redis.
///
/// Documents are JSON strings under `testbay:run:<id>` / `testbay:case:<id>`.
/// Listings walk sorted-set indexes scored by creation time in milliseconds,
/// so most-recent-first is a reverse range. Counted runs are tracked as a set
/// per (user, test case) which makes the quota count a single `SCARD`.
#[derive(Clone)]
pub struct RedisDocumentStore {
    conn: ConnectionManager,
}

impl RedisDocumentStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(key).await?;
        payload.map(|data| decode(key, &data)).transpose()
    }

    /// Read, modify and conditionally write back one run.
    ///
    /// Concurrent point updates (ingestion finishing a run while an admin
    /// flips `counted`) each re-read and retry instead of overwriting the
    /// other's fields. `counted` selects the set membership change, if any.
    async fn update_run<F>(&self, id: &str, counted: Option<bool>, apply: F) -> Result<TestRun, StoreError>
    where
        F: Fn(&mut TestRun) + Send + Sync,
    {
        let key = keys::run_key(id);
        let script = redis::Script::new(RUN_CAS_SCRIPT);
        let op = match counted {
            Some(true) => "add",
            Some(false) => "rem",
            None => "keep",
        };
        let mut conn = self.conn.clone();

        for attempt in 1..=UPDATE_ATTEMPTS {
            let current: Option<String> = conn.get(&key).await?;
            let current = current.ok_or_else(|| StoreError::run_not_found(id))?;
            let mut run: TestRun = decode(&key, &current)?;
            apply(&mut run);

            let swapped: i32 = script
                .key(&key)
                .key(keys::counted_runs_key(&run.created_by, &run.test_case_id))
                .arg(&current)
                .arg(encode(&key, &run)?)
                .arg(op)
                .arg(id)
                .invoke_async(&mut conn)
                .await?;
            if swapped == 1 {
                return Ok(run);
            }
            debug!(run_id = %id, attempt, "Run changed during update, retrying");
        }

        Err(StoreError::Contended {
            key,
            attempts: UPDATE_ATTEMPTS,
        })
    }

    /// Page through an index newest-first, keeping documents that pass `keep`,
    /// until `limit` documents are collected or the index is exhausted.
    async fn scan_index<T, F>(
        &self,
        index: &str,
        doc_key: fn(&str) -> String,
        keep: F,
        limit: usize,
    ) -> Result<Vec<T>, StoreError>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> bool,
    {
        let mut conn = self.conn.clone();
        let mut found = Vec::new();
        let mut start: isize = 0;

        while found.len() < limit {
            let ids: Vec<String> = conn.zrevrange(index, start, start + SCAN_BATCH - 1).await?;
            if ids.is_empty() {
                break;
            }

            let mut pipe = redis::pipe();
            for id in &ids {
                pipe.get(doc_key(id));
            }
            let docs: Vec<Option<String>> = pipe.query_async(&mut conn).await?;

            for (id, doc) in ids.iter().zip(docs) {
                // Index entries can briefly outlive their document
                let Some(data) = doc else { continue };
                let item: T = decode(&doc_key(id), &data)?;
                if keep(&item) {
                    found.push(item);
                    if found.len() == limit {
                        break;
                    }
                }
            }
            start += SCAN_BATCH;
        }

        Ok(found)
    }
}

fn score(at: &DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn encode<T: serde::Serialize>(key: &str, doc: &T) -> Result<String, StoreError> {
    serde_json::to_string(doc).map_err(|source| StoreError::Corrupt {
        key: key.to_string(),
        source,
    })
}

fn decode<T: DeserializeOwned>(key: &str, data: &str) -> Result<T, StoreError> {
    serde_json::from_str(data).map_err(|source| StoreError::Corrupt {
        key: key.to_string(),
        source,
    })
}

/// Narrowest index covering the filter; remaining predicates are checked per document
fn run_index_for(filter: &RunFilter) -> String {
    if let Some(submission) = &filter.submission_id {
        keys::runs_by_submission_index(submission)
    } else if let Some(user) = &filter.user {
        keys::runs_by_user_index(user)
    } else if let Some(task) = &filter.task_id {
        keys::runs_by_task_index(task)
    } else {
        keys::runs_index()
    }
}

#[async_trait]
impl TestRunStore for RedisDocumentStore {
    #[instrument(skip(self, run), fields(run_id = %run.id, user = %run.created_by))]
    async fn insert_run(&self, run: &TestRun) -> Result<(), StoreError> {
        let key = keys::run_key(&run.id);
        let payload = encode(&key, &run.for_storage())?;
        let at = score(&run.created_at);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(&key, payload)
            .ignore()
            .zadd(keys::runs_index(), &run.id, at)
            .ignore()
            .zadd(keys::runs_by_user_index(&run.created_by), &run.id, at)
            .ignore()
            .zadd(keys::runs_by_submission_index(&run.submission_id), &run.id, at)
            .ignore()
            .zadd(keys::runs_by_task_index(&run.task_id), &run.id, at)
            .ignore();
        if run.counted {
            pipe.sadd(keys::counted_runs_key(&run.created_by, &run.test_case_id), &run.id)
                .ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        debug!("Test run stored");
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<TestRun, StoreError> {
        self.load(&keys::run_key(id))
            .await?
            .ok_or_else(|| StoreError::run_not_found(id))
    }

    async fn list_runs(&self, filter: &RunFilter, limit: usize) -> Result<Vec<TestRun>, StoreError> {
        let index = run_index_for(filter);
        self.scan_index(&index, keys::run_key, |run: &TestRun| filter.matches(run), limit)
            .await
    }

    async fn count_counted(&self, user: &str, test_case_id: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.scard(keys::counted_runs_key(user, test_case_id)).await?;
        Ok(count)
    }

    async fn update_status(
        &self,
        id: &str,
        status: TestStatus,
        message: &str,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.update_run(id, None, |run| {
            run.status = status.clone();
            run.message = message.to_string();
            run.finished_at = finished_at;
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_counted(&self, id: &str, counted: bool) -> Result<TestRun, StoreError> {
        self.update_run(id, Some(counted), |run| run.counted = counted).await
    }
}

#[async_trait]
impl TestCaseStore for RedisDocumentStore {
    async fn insert_case(&self, case: &TestCase) -> Result<(), StoreError> {
        let key = keys::case_key(&case.id);
        let at = score(&case.created_at);

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .set(&key, encode(&key, case)?)
            .ignore()
            .zadd(keys::cases_index(), &case.id, at)
            .ignore()
            .zadd(keys::cases_by_task_index(&case.task_id), &case.id, at)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_case(&self, id: &str) -> Result<TestCase, StoreError> {
        self.load(&keys::case_key(id))
            .await?
            .ok_or_else(|| StoreError::case_not_found(id))
    }

    async fn list_cases(&self, task_id: Option<&str>, limit: usize) -> Result<Vec<TestCase>, StoreError> {
        let index = match task_id {
            Some(task) => keys::cases_by_task_index(task),
            None => keys::cases_index(),
        };
        self.scan_index(
            &index,
            keys::case_key,
            |case: &TestCase| task_id.map_or(true, |t| case.task_id == t),
            limit,
        )
        .await
    }

    async fn replace_case(&self, id: &str, update: TestCaseUpdate) -> Result<TestCase, StoreError> {
        let existing = self.get_case(id).await?;
        let replaced = update.apply(&existing);
        let key = keys::case_key(id);
        let at = score(&replaced.created_at);

        let mut pipe = redis::pipe();
        pipe.atomic().set(&key, encode(&key, &replaced)?).ignore();
        if existing.task_id != replaced.task_id {
            pipe.zrem(keys::cases_by_task_index(&existing.task_id), id)
                .ignore()
                .zadd(keys::cases_by_task_index(&replaced.task_id), id, at)
                .ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(replaced)
    }
}
