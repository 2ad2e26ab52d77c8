// Per-user run quota, checked at admission time

use crate::store::{StoreError, TestCaseStore, TestRunStore};
use crate::types::TestCase;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("test case {0} does not exist")]
    UnknownTestCase(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of a quota check. Hitting the limit is a result, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    LimitReached { used: u64, max: u32 },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// Compares prior counted runs of a (user, test case) pair against `maxRuns`.
///
/// The check is a plain read: the new run only counts once it is inserted, so
/// concurrent admissions for the same pair can all pass.
#[derive(Clone)]
pub struct QuotaEnforcer {
    runs: Arc<dyn TestRunStore>,
    cases: Arc<dyn TestCaseStore>,
}

impl QuotaEnforcer {
    pub fn new(runs: Arc<dyn TestRunStore>, cases: Arc<dyn TestCaseStore>) -> Self {
        Self { runs, cases }
    }

    pub async fn admit(
        &self,
        user: &str,
        test_case_id: &str,
        counted: bool,
    ) -> Result<Admission, QuotaError> {
        let case = match self.cases.get_case(test_case_id).await {
            Ok(case) => case,
            Err(e) if e.is_not_found() => {
                return Err(QuotaError::UnknownTestCase(test_case_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        self.admit_case(user, &case, counted).await
    }

    /// Quota check against an already resolved test case
    pub async fn admit_case(
        &self,
        user: &str,
        case: &TestCase,
        counted: bool,
    ) -> Result<Admission, QuotaError> {
        if !counted {
            return Ok(Admission::Allowed);
        }

        let used = self.runs.count_counted(user, &case.id).await?;
        debug!(user = %user, test_case_id = %case.id, used, max = case.max_runs, "Quota check");

        if used < u64::from(case.max_runs) {
            Ok(Admission::Allowed)
        } else {
            Ok(Admission::LimitReached {
                used,
                max: case.max_runs,
            })
        }
    }
}
