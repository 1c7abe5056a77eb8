//! rungrid-api: HTTP surface for rungrid.
//!
//! Ingests GitHub `workflow_job` webhooks into capacity reservations and
//! exposes read-mostly REST views of the declarative state.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/webhooks/github` | Webhook ingestion |
//! | GET | `/api/v1/targets` | List scale targets |
//! | GET | `/api/v1/autoscalers` | List autoscalers |
//! | GET | `/api/v1/autoscalers/{ns}/{name}` | Autoscaler with its last decision |
//! | GET | `/api/v1/agents` | List agents |
//! | GET | `/api/v1/agents/{ns}/{name}` | One agent, including its registration token |
//! | PUT | `/api/v1/agents/{ns}/{name}/status` | Runner process reports its state |
//! | GET | `/metrics` | Prometheus exposition |
//! | GET | `/healthz` | Liveness |

pub mod handlers;
pub mod joblogs;
pub mod resolve;
pub mod webhook;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use rungrid_autoscale::{BatchScaler, DecisionCounters};
use rungrid_provider::ClientCache;
use rungrid_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub clients: Arc<ClientCache>,
    pub batch: Arc<BatchScaler>,
    pub counters: Arc<DecisionCounters>,
    /// HMAC secret webhooks must be signed with. `None` accepts unsigned
    /// deliveries.
    pub webhook_secret: Option<Arc<str>>,
}

/// Build the complete router (webhook + REST + metrics).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/targets", get(handlers::list_targets))
        .route("/autoscalers", get(handlers::list_autoscalers))
        .route("/autoscalers/{ns}/{name}", get(handlers::get_autoscaler))
        .route("/agents", get(handlers::list_agents))
        .route("/agents/{ns}/{name}", get(handlers::get_agent))
        .route("/agents/{ns}/{name}/status", put(handlers::put_agent_status));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/webhooks/github", post(webhook::github_webhook))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
}
