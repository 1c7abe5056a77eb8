//! In-memory [`Provider`] for tests.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::{Mutex, MutexGuard};
use rungrid_state::RunnerScope;

use crate::error::{ProviderError, ProviderResult};
use crate::provider::Provider;
use crate::types::*;

/// Scripted provider state. Tests reach in through [`FakeProvider::state`].
#[derive(Default)]
pub struct FakeState {
    /// `(repo, run)` pairs.
    pub runs: Vec<(String, WorkflowRun)>,
    pub jobs: HashMap<i64, Vec<WorkflowJob>>,
    pub runners: Vec<RunnerInfo>,
    /// Errors returned by successive `remove_runner` calls.
    pub remove_errors: VecDeque<ProviderError>,
    pub removed: Vec<i64>,
    pub logs: HashMap<i64, String>,
    pub groups: Vec<RunnerGroup>,
    pub token_requests: usize,
    pub list_runs_calls: usize,
}

#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<FakeState>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock()
    }

    pub fn with_run(self, repo: &str, id: i64, status: RunStatus) -> Self {
        self.state.lock().runs.push((
            repo.to_string(),
            WorkflowRun {
                id,
                status,
                name: None,
            },
        ));
        self
    }

    pub fn with_job(self, run_id: i64, id: i64, status: RunStatus, labels: &[&str]) -> Self {
        self.state
            .lock()
            .jobs
            .entry(run_id)
            .or_default()
            .push(WorkflowJob {
                id,
                run_id,
                status,
                conclusion: None,
                labels: labels.iter().map(|l| l.to_string()).collect(),
                runner_id: None,
                runner_name: None,
                started_at: None,
                completed_at: None,
            });
        self
    }

    pub fn with_runner(self, id: i64, name: &str, busy: bool) -> Self {
        self.state.lock().runners.push(RunnerInfo {
            id,
            name: name.to_string(),
            status: "online".to_string(),
            busy,
            labels: Vec::new(),
        });
        self
    }

    /// Make the next `remove_runner` call fail with the given status.
    pub fn fail_next_remove(&self, status: u16, message: &str) {
        self.state.lock().remove_errors.push_back(ProviderError::Api {
            status,
            message: message.to_string(),
        });
    }

    pub fn removed(&self) -> Vec<i64> {
        self.state.lock().removed.clone()
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn list_workflow_runs(
        &self,
        repo: &str,
        status: RunStatus,
    ) -> ProviderResult<Vec<WorkflowRun>> {
        let mut state = self.state.lock();
        state.list_runs_calls += 1;
        Ok(state
            .runs
            .iter()
            .filter(|(r, run)| r == repo && run.status == status)
            .map(|(_, run)| run.clone())
            .collect())
    }

    async fn list_workflow_jobs(&self, _repo: &str, run_id: i64) -> ProviderResult<Vec<WorkflowJob>> {
        Ok(self.state.lock().jobs.get(&run_id).cloned().unwrap_or_default())
    }

    async fn list_runners(&self, _scope: &RunnerScope) -> ProviderResult<Vec<RunnerInfo>> {
        Ok(self.state.lock().runners.clone())
    }

    async fn remove_runner(&self, _scope: &RunnerScope, runner_id: i64) -> ProviderResult<()> {
        let mut state = self.state.lock();
        if let Some(err) = state.remove_errors.pop_front() {
            return Err(err);
        }
        state.removed.push(runner_id);
        state.runners.retain(|r| r.id != runner_id);
        Ok(())
    }

    async fn job_logs(&self, _repo: &str, job_id: i64) -> ProviderResult<String> {
        self.state
            .lock()
            .logs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| ProviderError::Api {
                status: 404,
                message: "Not Found".to_string(),
            })
    }

    async fn create_registration_token(
        &self,
        _scope: &RunnerScope,
    ) -> ProviderResult<RegistrationToken> {
        let mut state = self.state.lock();
        state.token_requests += 1;
        Ok(RegistrationToken {
            token: format!("reg-{}", state.token_requests),
            expires_at: Utc::now() + Duration::hours(1),
        })
    }

    async fn runner_groups_for_repository(
        &self,
        _org: &str,
        _repo: &str,
    ) -> ProviderResult<Vec<RunnerGroup>> {
        Ok(self.state.lock().groups.clone())
    }
}
