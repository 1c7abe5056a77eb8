//! GitHub REST implementation of [`Provider`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, Method, RequestBuilder, Response};
use rungrid_state::RunnerScope;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::{ProviderError, ProviderResult};
use crate::provider::Provider;
use crate::types::*;

pub const DEFAULT_API_URL: &str = "https://api.github.com";

const RUNS_PER_PAGE: usize = 100;
const JOBS_PER_PAGE: usize = 50;
const RUNNERS_PER_PAGE: usize = 100;
/// Upper bound on pages fetched by one listing call.
const MAX_PAGES: usize = 100;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Token-authenticated GitHub API client.
#[derive(Clone)]
pub struct GithubClient {
    http: Client,
    base_url: String,
}

impl GithubClient {
    pub fn new(api_url: &str, token: &str) -> ProviderResult<Self> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| ProviderError::Credential(e.to_string()))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("rungrid"));

        let http = Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, format!("{}{}", self.base_url, path))
    }

    async fn send(&self, req: RequestBuilder) -> ProviderResult<Response> {
        let resp = req
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        check_status(resp).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> ProviderResult<T> {
        let resp = self.send(self.request(Method::GET, path).query(query)).await?;
        resp.json::<T>()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }

    /// Fetch pages until one comes back short.
    async fn paged<P, T, F>(
        &self,
        path: &str,
        query: &[(&str, String)],
        per_page: usize,
        items: F,
    ) -> ProviderResult<Vec<T>>
    where
        P: DeserializeOwned,
        F: Fn(P) -> Vec<T>,
    {
        let mut out = Vec::new();
        for page in 1..=MAX_PAGES {
            let mut q = query.to_vec();
            q.push(("per_page", per_page.to_string()));
            q.push(("page", page.to_string()));
            let batch = items(self.get_json::<P>(path, &q).await?);
            let n = batch.len();
            out.extend(batch);
            if n < per_page {
                break;
            }
        }
        debug!(%path, count = out.len(), "listed");
        Ok(out)
    }
}

/// Turn a non-2xx response into `ProviderError::Api`, preferring the
/// `message` field of a JSON error body.
async fn check_status(resp: Response) -> ProviderResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(body);
    Err(ProviderError::Api {
        status: status.as_u16(),
        message,
    })
}

/// API path prefix that owns runners for a scope.
fn scope_path(scope: &RunnerScope) -> ProviderResult<String> {
    if !scope.is_valid() {
        return Err(ProviderError::InvalidScope(format!("{scope:?}")));
    }
    if let Some(repo) = &scope.repository {
        Ok(format!("/repos/{repo}"))
    } else if let Some(org) = &scope.organization {
        Ok(format!("/orgs/{org}"))
    } else if let Some(ent) = &scope.enterprise {
        Ok(format!("/enterprises/{ent}"))
    } else {
        Err(ProviderError::InvalidScope(format!("{scope:?}")))
    }
}

#[async_trait]
impl Provider for GithubClient {
    async fn list_workflow_runs(
        &self,
        repo: &str,
        status: RunStatus,
    ) -> ProviderResult<Vec<WorkflowRun>> {
        let path = format!("/repos/{repo}/actions/runs");
        let query = [("status", status.as_str().to_string())];
        self.paged(&path, &query, RUNS_PER_PAGE, |p: RunsPage| p.workflow_runs)
            .await
    }

    async fn list_workflow_jobs(&self, repo: &str, run_id: i64) -> ProviderResult<Vec<WorkflowJob>> {
        let path = format!("/repos/{repo}/actions/runs/{run_id}/jobs");
        self.paged(&path, &[], JOBS_PER_PAGE, |p: JobsPage| p.jobs).await
    }

    async fn list_runners(&self, scope: &RunnerScope) -> ProviderResult<Vec<RunnerInfo>> {
        let path = format!("{}/actions/runners", scope_path(scope)?);
        self.paged(&path, &[], RUNNERS_PER_PAGE, |p: RunnersPage| p.runners)
            .await
    }

    async fn remove_runner(&self, scope: &RunnerScope, runner_id: i64) -> ProviderResult<()> {
        let path = format!("{}/actions/runners/{runner_id}", scope_path(scope)?);
        self.send(self.request(Method::DELETE, &path)).await?;
        debug!(%scope, runner_id, "runner removed");
        Ok(())
    }

    async fn job_logs(&self, repo: &str, job_id: i64) -> ProviderResult<String> {
        let path = format!("/repos/{repo}/actions/jobs/{job_id}/logs");
        // The API answers with a redirect to the log blob; reqwest follows it.
        let resp = self.send(self.request(Method::GET, &path)).await?;
        resp.text()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }

    async fn create_registration_token(
        &self,
        scope: &RunnerScope,
    ) -> ProviderResult<RegistrationToken> {
        let path = format!("{}/actions/runners/registration-token", scope_path(scope)?);
        let resp = self.send(self.request(Method::POST, &path)).await?;
        resp.json::<RegistrationToken>()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }

    async fn runner_groups_for_repository(
        &self,
        org: &str,
        repo: &str,
    ) -> ProviderResult<Vec<RunnerGroup>> {
        let path = format!("/orgs/{org}/actions/runner-groups");
        let repo_name = repo.rsplit('/').next().unwrap_or(repo);
        let query = [("visible_to_repository", repo_name.to_string())];
        let groups = self
            .paged(&path, &query, RUNNERS_PER_PAGE, |p: RunnerGroupsPage| {
                p.runner_groups
            })
            .await?;
        Ok(groups
            .into_iter()
            .filter(|g| !g.default)
            .map(|g| RunnerGroup {
                name: g.name,
                level: if g.inherited {
                    GroupLevel::Enterprise
                } else {
                    GroupLevel::Organization
                },
            })
            .collect())
    }
}
