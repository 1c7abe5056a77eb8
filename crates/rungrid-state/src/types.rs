//! Domain types for the rungrid state store.
//!
//! Scale targets and autoscalers are declared by operators; owners and
//! agents are created by the control loops. All types serialize to JSON for
//! storage in redb tables.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::meta::{ObjectKind, ObjectMeta, impl_object};

// ── Scale target ───────────────────────────────────────────────────

/// How a scale target materializes its runners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    /// Each owner manages one runner, created on demand.
    #[default]
    Deployment,
    /// Each owner manages an ordinal set of runners.
    StatefulSet,
}

/// Where runners register: exactly one of enterprise, organization or
/// repository (`owner/repo`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunnerScope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enterprise: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
}

impl RunnerScope {
    pub fn repository(repo: &str) -> Self {
        Self {
            repository: Some(repo.to_string()),
            ..Default::default()
        }
    }

    pub fn organization(org: &str) -> Self {
        Self {
            organization: Some(org.to_string()),
            ..Default::default()
        }
    }

    pub fn enterprise(enterprise: &str) -> Self {
        Self {
            enterprise: Some(enterprise.to_string()),
            ..Default::default()
        }
    }

    /// True when exactly one scope field is set.
    pub fn is_valid(&self) -> bool {
        [
            self.enterprise.is_some(),
            self.organization.is_some(),
            self.repository.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
            == 1
    }

    /// Routing key used by webhook target resolution.
    ///
    /// `owner/repo` for repositories, `org` or `org/group/<g>` for
    /// organizations, `enterprises/<e>` or `enterprises/<e>/group/<g>` for
    /// enterprises.
    pub fn routing_key(&self, group: Option<&str>) -> String {
        if let Some(repo) = &self.repository {
            return repo.clone();
        }
        let base = match (&self.organization, &self.enterprise) {
            (Some(org), _) => org.clone(),
            (None, Some(ent)) => format!("enterprises/{ent}"),
            (None, None) => String::new(),
        };
        match group {
            Some(g) if !g.is_empty() => format!("{base}/group/{g}"),
            _ => base,
        }
    }
}

impl std::fmt::Display for RunnerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.routing_key(None))
    }
}

/// Content of the runner workload; its hash drives rolling replacement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerTemplate {
    pub image: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
}

impl RunnerTemplate {
    pub fn hash(&self) -> anyhow::Result<String> {
        rungrid_core::content_hash(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScaleTargetSpec {
    #[serde(default)]
    pub kind: OwnerKind,
    pub scope: RunnerScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    #[serde(default)]
    pub ephemeral: bool,
    /// Effective time of the newest capacity reservation that drove
    /// `replicas`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_time: Option<DateTime<Utc>>,
    pub template: RunnerTemplate,
    /// Name of a `Credential` in the same namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScaleTargetStatus {
    #[serde(default)]
    pub desired_replicas: u32,
    #[serde(default)]
    pub current_replicas: u32,
    #[serde(default)]
    pub ready_replicas: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
}

/// A fleet of runners sharing scope, labels and template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleTarget {
    pub meta: ObjectMeta,
    pub spec: ScaleTargetSpec,
    #[serde(default)]
    pub status: ScaleTargetStatus,
}

impl_object!(ScaleTarget, ObjectKind::ScaleTarget);

// ── Horizontal autoscaler ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Sum of queued and in-progress jobs that the fleet can pick up.
    QueuedAndInProgressJobs,
    /// Fraction of runners busy with a job.
    RunnersBusy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    pub kind: MetricKind,
    #[serde(default)]
    pub repository_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up_threshold: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_threshold: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up_adjustment: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_adjustment: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up_factor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_factor: Option<String>,
}

impl MetricSpec {
    pub fn new(kind: MetricKind) -> Self {
        Self {
            kind,
            repository_names: Vec::new(),
            scale_up_threshold: None,
            scale_down_threshold: None,
            scale_up_adjustment: None,
            scale_down_adjustment: None,
            scale_up_factor: None,
            scale_down_factor: None,
        }
    }
}

/// Provider event a trigger reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    #[default]
    WorkflowJob,
}

/// Webhook-driven scaling rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleUpTrigger {
    #[serde(default)]
    pub event: TriggerEvent,
    /// Reservation units per matching event. A queued job adds this many
    /// and a completed job removes as many; the sign written here is ignored.
    #[serde(default = "default_trigger_amount")]
    pub amount: i32,
    /// Lifetime of each reservation in seconds; 0 means the default.
    #[serde(default)]
    pub duration_secs: u64,
}

fn default_trigger_amount() -> i32 {
    1
}

/// One unit of externally-signalled demand with a time-to-live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityReservation {
    pub effective_time: DateTime<Utc>,
    pub expiration_time: DateTime<Utc>,
    /// Always 1.
    pub replicas: u32,
}

impl CapacityReservation {
    pub fn unit(effective_time: DateTime<Utc>, expiration_time: DateTime<Utc>) -> Self {
        Self {
            effective_time,
            expiration_time,
            replicas: 1,
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time > now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until_time: Option<DateTime<Utc>>,
}

/// Time window during which `min_replicas` replaces the autoscaler minimum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledOverride {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub min_replicas: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<RecurrenceRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoscalerSpec {
    /// Name of the scale target in the same namespace.
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_delay_secs: Option<u64>,
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
    #[serde(default)]
    pub scale_up_triggers: Vec<ScaleUpTrigger>,
    #[serde(default)]
    pub capacity_reservations: Vec<CapacityReservation>,
    #[serde(default)]
    pub scheduled_overrides: Vec<ScheduledOverride>,
}

/// One concrete occurrence of a scheduled override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverridePeriod {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub min_replicas: u32,
}

/// Inputs and outputs of the last replica computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionSummary {
    pub suggested: i64,
    pub reserved: u32,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub desired: u32,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoscalerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scale_out_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_override: Option<OverridePeriod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upcoming_override: Option<OverridePeriod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_decision: Option<DecisionSummary>,
    /// Input error from the last computation, cleared on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizontalAutoscaler {
    pub meta: ObjectMeta,
    pub spec: AutoscalerSpec,
    #[serde(default)]
    pub status: AutoscalerStatus,
}

impl_object!(HorizontalAutoscaler, ObjectKind::HorizontalAutoscaler);

// ── Owner ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OwnerSpec {
    pub kind: OwnerKind,
    /// Name of the scale target in the same namespace.
    pub target: String,
    pub replicas: u32,
    pub template: RunnerTemplate,
    pub template_hash: String,
    #[serde(default)]
    pub ephemeral: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OwnerStatus {
    /// Generation the materializer last acted on.
    #[serde(default)]
    pub observed_generation: u64,
    /// Number of agents the owner currently manages.
    #[serde(default)]
    pub replicas: u32,
}

/// Replica-owning resource: a batch of agents sharing one template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Owner {
    pub meta: ObjectMeta,
    pub spec: OwnerSpec,
    #[serde(default)]
    pub status: OwnerStatus,
}

impl_object!(Owner, ObjectKind::Owner);

// ── Agent ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    /// Not yet scheduled or still starting.
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Observed state of the runner process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ContainerState {
    #[default]
    Waiting,
    Running,
    Terminated { exit_code: i32 },
}

/// Registration credential handed to the runner process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub owner: String,
    pub target: String,
    pub scope: RunnerScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    #[serde(default)]
    pub phase: AgentPhase,
    #[serde(default)]
    pub container: ContainerState,
    /// When the runner process became ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration: Option<Registration>,
}

/// One runner process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub meta: ObjectMeta,
    pub spec: AgentSpec,
    #[serde(default)]
    pub status: AgentStatus,
}

impl_object!(Agent, ObjectKind::Agent);

impl Agent {
    /// Provider-assigned runner ID, once known.
    pub fn runner_id(&self) -> Option<i64> {
        self.meta
            .annotation(crate::meta::ANNOTATION_RUNNER_ID)
            .and_then(|v| v.parse().ok())
    }

    /// The runner process has exited, or the agent reached a terminal phase.
    pub fn is_stopped(&self) -> bool {
        matches!(self.status.container, ContainerState::Terminated { .. })
            || matches!(self.status.phase, AgentPhase::Succeeded | AgentPhase::Failed)
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.status.container {
            ContainerState::Terminated { exit_code } => Some(exit_code),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status.phase == AgentPhase::Pending
    }
}

// ── Credential ────────────────────────────────────────────────────

/// Provider credential content (`token`, optional `api_url`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl_object!(Credential, ObjectKind::Credential);
