//! GitHub webhook ingestion.
//!
//! `workflow_job` deliveries become capacity reservation events: a queued
//! job adds one unit, a completed self-hosted job removes one. The event is
//! queued on the batching scaler and the handler returns without waiting
//! for the write.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use hmac::{Hmac, Mac};
use rungrid_autoscale::ScaleEvent;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, error, info, warn};

use crate::ApiState;
use crate::joblogs::report_job_duration;
use crate::resolve::{JobOrigin, autoscaler_for, resolve_target};

type HmacSha256 = Hmac<Sha256>;

pub const EVENT_HEADER: &str = "x-github-event";
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Reservation lifetime when the trigger does not set one.
const DEFAULT_RESERVATION_TTL: Duration = Duration::from_secs(10 * 60);

/// Check a `sha256=<hex>` signature over `body`.
pub fn verify_signature(body: &[u8], signature: Option<&str>, secret: &str) -> bool {
    let Some(hex_sig) = signature.and_then(|s| s.strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

// ── Payload ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowJobEvent {
    /// `queued`, `in_progress`, `completed` or `waiting`.
    pub action: String,
    pub workflow_job: JobPayload,
    pub repository: RepositoryPayload,
    #[serde(default)]
    pub enterprise: Option<EnterprisePayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobPayload {
    pub id: i64,
    pub run_id: i64,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub runner_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryPayload {
    pub full_name: String,
    pub owner: AccountPayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountPayload {
    pub login: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnterprisePayload {
    pub slug: String,
}

impl WorkflowJobEvent {
    /// Reservation units this event stands for, if any.
    ///
    /// Completed jobs count only when they were not skipped and look like
    /// they ran on a self-hosted runner: GitHub reports labels or a runner
    /// ID for those.
    pub fn amount(&self) -> Option<i32> {
        let job = &self.workflow_job;
        match self.action.as_str() {
            "queued" => Some(1),
            "completed" => {
                let skipped = job.conclusion.as_deref() == Some("skipped");
                let self_hosted = !job.labels.is_empty() || job.runner_id.is_some_and(|id| id > 0);
                (!skipped && self_hosted).then_some(-1)
            }
            _ => None,
        }
    }

    fn origin(&self) -> JobOrigin<'_> {
        JobOrigin {
            repository: &self.repository.full_name,
            owner: &self.repository.owner.login,
            owner_is_user: self.repository.owner.kind == "User",
            enterprise: self.enterprise.as_ref().map(|e| e.slug.as_str()),
            labels: &self.workflow_job.labels,
        }
    }
}

// ── Handler ───────────────────────────────────────────────────────

/// POST /webhooks/github
pub async fn github_webhook(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(secret) = &state.webhook_secret {
        let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
        if !verify_signature(&body, signature, secret) {
            warn!("webhook signature verification failed");
            return (StatusCode::UNAUTHORIZED, "invalid signature").into_response();
        }
    }

    let event = headers
        .get(EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    match event {
        "ping" => (StatusCode::OK, "pong").into_response(),
        "workflow_job" => {
            let payload: WorkflowJobEvent = match serde_json::from_slice(&body) {
                Ok(p) => p,
                Err(e) => {
                    debug!(error = %e, "malformed workflow_job payload");
                    return (StatusCode::BAD_REQUEST, format!("malformed payload: {e}"))
                        .into_response();
                }
            };
            match handle_workflow_job(&state, &payload).await {
                Ok(msg) => (StatusCode::OK, msg).into_response(),
                Err(e) => {
                    error!(
                        repository = %payload.repository.full_name,
                        job_id = payload.workflow_job.id,
                        error = %e,
                        "webhook handling failed"
                    );
                    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
                }
            }
        }
        other => {
            debug!(event = other, "webhook event ignored");
            (StatusCode::OK, "ignored").into_response()
        }
    }
}

async fn handle_workflow_job(state: &ApiState, event: &WorkflowJobEvent) -> anyhow::Result<String> {
    let job = &event.workflow_job;
    let Some(sign) = event.amount() else {
        return Ok(format!("no scaling for action {}", event.action));
    };

    let default_client = state.clients.default_client();
    if event.action == "completed"
        && let Some(provider) = default_client.clone()
    {
        tokio::spawn(report_job_duration(
            provider,
            event.repository.full_name.clone(),
            job.id,
        ));
    }

    let origin = event.origin();
    let Some(target) = resolve_target(&state.store, default_client.as_deref(), &origin).await? else {
        debug!(
            repository = origin.repository,
            labels = ?origin.labels,
            "no scale target for job"
        );
        return Ok("no matching scale target".to_string());
    };
    let Some(hra) = autoscaler_for(&state.store, &target)? else {
        return Ok(format!("scale target {} has no autoscaler", target.meta.key()));
    };
    let [trigger] = hra.spec.scale_up_triggers.as_slice() else {
        warn!(
            autoscaler = %hra.meta.key(),
            triggers = hra.spec.scale_up_triggers.len(),
            "autoscaler needs exactly one scale-up trigger"
        );
        return Ok(format!(
            "autoscaler {} needs exactly one scale-up trigger",
            hra.meta.key()
        ));
    };

    let duration = match trigger.duration_secs {
        0 => DEFAULT_RESERVATION_TTL,
        secs => Duration::from_secs(secs),
    };
    let amount = sign * trigger.amount.abs();
    state.batch.enqueue(ScaleEvent {
        namespace: hra.meta.namespace.clone(),
        autoscaler: hra.meta.name.clone(),
        amount,
        duration,
    });
    info!(
        autoscaler = %hra.meta.key(),
        repository = origin.repository,
        job_id = job.id,
        run_id = job.run_id,
        amount,
        "scale event dispatched"
    );
    Ok(format!("scaled {} by {amount}", hra.meta.key()))
}
