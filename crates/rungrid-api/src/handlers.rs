//! REST API handlers.
//!
//! Each handler reads/writes via `StateStore` and returns JSON responses.

use std::fmt::Write as _;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use rungrid_state::{
    Agent, AgentPhase, ContainerState, HorizontalAutoscaler, LabelSelector, Object, ScaleTarget,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn list_all<T: Object>(state: &ApiState) -> axum::response::Response {
    match state.store.list::<T>(None, &LabelSelector::everything()) {
        Ok(items) => ApiResponse::ok(items).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

fn get_one<T: Object>(state: &ApiState, ns: &str, name: &str, what: &str) -> axum::response::Response {
    match state.store.get::<T>(ns, name) {
        Ok(Some(obj)) => ApiResponse::ok(obj).into_response(),
        Ok(None) => error_response(&format!("{what} not found"), StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Targets and autoscalers ────────────────────────────────────

/// GET /api/v1/targets
pub async fn list_targets(State(state): State<ApiState>) -> impl IntoResponse {
    list_all::<ScaleTarget>(&state)
}

/// GET /api/v1/autoscalers
pub async fn list_autoscalers(State(state): State<ApiState>) -> impl IntoResponse {
    list_all::<HorizontalAutoscaler>(&state)
}

/// GET /api/v1/autoscalers/{ns}/{name}
pub async fn get_autoscaler(
    State(state): State<ApiState>,
    Path((ns, name)): Path<(String, String)>,
) -> impl IntoResponse {
    get_one::<HorizontalAutoscaler>(&state, &ns, &name, "autoscaler")
}

// ── Agents ─────────────────────────────────────────────────────

/// GET /api/v1/agents
pub async fn list_agents(State(state): State<ApiState>) -> impl IntoResponse {
    list_all::<Agent>(&state)
}

/// GET /api/v1/agents/{ns}/{name}
pub async fn get_agent(
    State(state): State<ApiState>,
    Path((ns, name)): Path<(String, String)>,
) -> impl IntoResponse {
    get_one::<Agent>(&state, &ns, &name, "agent")
}

/// Runtime state reported by the process hosting a runner.
#[derive(Debug, Deserialize)]
pub struct AgentStatusReport {
    pub phase: AgentPhase,
    #[serde(default)]
    pub container: ContainerState,
    #[serde(default)]
    pub ready_since: Option<DateTime<Utc>>,
}

/// PUT /api/v1/agents/{ns}/{name}/status
pub async fn put_agent_status(
    State(state): State<ApiState>,
    Path((ns, name)): Path<(String, String)>,
    Json(report): Json<AgentStatusReport>,
) -> impl IntoResponse {
    let result = state.store.modify::<Agent, _>(&ns, &name, |a| {
        a.status.phase = report.phase;
        a.status.container = report.container;
        if report.ready_since.is_some() {
            a.status.ready_since = report.ready_since;
        }
    });
    match result {
        Ok(Some(agent)) => {
            info!(agent = %agent.meta.key(), phase = ?agent.status.phase, "agent status reported");
            ApiResponse::ok(agent).into_response()
        }
        Ok(None) => error_response("agent not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Health ─────────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let autoscalers: Vec<HorizontalAutoscaler> = state
        .store
        .list(None, &LabelSelector::everything())
        .unwrap_or_default();
    let body = render_prometheus(&autoscalers, &state);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

fn render_prometheus(autoscalers: &[HorizontalAutoscaler], state: &ApiState) -> String {
    let mut out = String::new();

    let gauges: [(&str, &str, fn(&HorizontalAutoscaler) -> Option<i64>); 5] = [
        ("rungrid_autoscaler_desired_replicas", "Replica count last decided for the target.", |h| {
            h.status.last_decision.as_ref().map(|d| i64::from(d.desired))
        }),
        ("rungrid_autoscaler_suggested_replicas", "Replica count suggested by the metric.", |h| {
            h.status.last_decision.as_ref().map(|d| d.suggested)
        }),
        ("rungrid_autoscaler_reserved_replicas", "Replicas held by active capacity reservations.", |h| {
            h.status.last_decision.as_ref().map(|d| i64::from(d.reserved))
        }),
        ("rungrid_autoscaler_min_replicas", "Effective lower bound of the last decision.", |h| {
            h.status.last_decision.as_ref().map(|d| i64::from(d.min_replicas))
        }),
        ("rungrid_autoscaler_max_replicas", "Upper bound of the last decision.", |h| {
            h.status.last_decision.as_ref().map(|d| i64::from(d.max_replicas))
        }),
    ];

    for (name, help, value) in gauges {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} gauge");
        for h in autoscalers {
            if let Some(v) = value(h) {
                let _ = writeln!(
                    out,
                    "{name}{{namespace=\"{}\",autoscaler=\"{}\",target=\"{}\"}} {v}",
                    h.meta.namespace, h.meta.name, h.spec.target
                );
            }
        }
    }

    let counters = [
        ("rungrid_decisions_total", "Autoscaling decisions computed.", state.counters.decisions()),
        ("rungrid_scale_outs_total", "Decisions that raised the replica count.", state.counters.scale_outs()),
        (
            "rungrid_held_scale_downs_total",
            "Decisions whose scale-down was held by the delay window.",
            state.counters.held_scale_downs(),
        ),
    ];
    for (name, help, value) in counters {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} counter");
        let _ = writeln!(out, "{name} {value}");
    }
    out
}
