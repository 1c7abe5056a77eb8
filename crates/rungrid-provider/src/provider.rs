//! The CI provider interface consumed by the control loops.

use async_trait::async_trait;
use rungrid_state::RunnerScope;

use crate::error::ProviderResult;
use crate::types::{RegistrationToken, RunStatus, RunnerGroup, RunnerInfo, WorkflowJob, WorkflowRun};

/// Operations rungrid needs from a CI provider.
///
/// Repository arguments are `owner/repo`. Listing calls return every page.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn list_workflow_runs(&self, repo: &str, status: RunStatus)
    -> ProviderResult<Vec<WorkflowRun>>;

    async fn list_workflow_jobs(&self, repo: &str, run_id: i64) -> ProviderResult<Vec<WorkflowJob>>;

    /// Runners registered at the given scope.
    async fn list_runners(&self, scope: &RunnerScope) -> ProviderResult<Vec<RunnerInfo>>;

    /// Unregister a runner. Busy runners fail with a 409/422-class error.
    async fn remove_runner(&self, scope: &RunnerScope, runner_id: i64) -> ProviderResult<()>;

    /// Plain-text log of one job.
    async fn job_logs(&self, repo: &str, job_id: i64) -> ProviderResult<String>;

    async fn create_registration_token(&self, scope: &RunnerScope) -> ProviderResult<RegistrationToken>;

    /// Custom (non-default) runner groups of `org` that `repo` may use.
    async fn runner_groups_for_repository(
        &self,
        org: &str,
        repo: &str,
    ) -> ProviderResult<Vec<RunnerGroup>>;
}
