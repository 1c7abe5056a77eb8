//! Owner kinds and agent classification.
//!
//! Owners come in two kinds with the same capabilities: enumerate their
//! agents, report their template hash, take annotations and tell whether
//! the materializer has caught up with their spec. A new kind is a new
//! variant here.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rungrid_state::{
    ANNOTATION_UNREGISTRATION_COMPLETE, ANNOTATION_UNREGISTRATION_REQUEST, Agent, AgentPhase,
    LABEL_OWNER, LABEL_TEMPLATE_HASH, LabelSelector, Owner, OwnerKind,
};

/// An owner viewed through its kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaOwner {
    /// Agents are created once per spec generation and never replaced.
    Deployment(Owner),
    /// Agents are kept at ordinal names `{owner}-{i}`; a lost ordinal is
    /// recreated.
    StatefulSet(Owner),
}

impl From<Owner> for ReplicaOwner {
    fn from(owner: Owner) -> Self {
        match owner.spec.kind {
            OwnerKind::Deployment => ReplicaOwner::Deployment(owner),
            OwnerKind::StatefulSet => ReplicaOwner::StatefulSet(owner),
        }
    }
}

impl ReplicaOwner {
    pub fn owner(&self) -> &Owner {
        match self {
            ReplicaOwner::Deployment(o) | ReplicaOwner::StatefulSet(o) => o,
        }
    }

    pub fn name(&self) -> &str {
        &self.owner().meta.name
    }

    /// Selector matching this owner's agents.
    pub fn agent_selector(&self) -> LabelSelector {
        LabelSelector::everything().with(LABEL_OWNER, self.name())
    }

    pub fn template_hash(&self) -> &str {
        match self {
            ReplicaOwner::Deployment(o) => &o.spec.template_hash,
            ReplicaOwner::StatefulSet(o) => o
                .meta
                .label(LABEL_TEMPLATE_HASH)
                .unwrap_or(o.spec.template_hash.as_str()),
        }
    }

    /// The materializer has acted on the latest spec.
    pub fn is_synced(&self) -> bool {
        match self {
            ReplicaOwner::Deployment(o) => o.status.observed_generation == o.meta.generation,
            ReplicaOwner::StatefulSet(o) => {
                o.status.observed_generation == o.meta.generation
                    && o.status.replicas == o.spec.replicas
            }
        }
    }

    /// Whether agents that disappear are created again.
    pub fn replaces_lost_agents(&self) -> bool {
        matches!(self, ReplicaOwner::StatefulSet(_))
    }

    pub fn agent_name(&self, ordinal: u32) -> String {
        format!("{}-{ordinal}", self.name())
    }

    pub fn drain_requested(&self) -> bool {
        self.owner()
            .meta
            .annotation(ANNOTATION_UNREGISTRATION_REQUEST)
            .is_some()
    }

    pub fn drain_complete(&self) -> bool {
        self.owner()
            .meta
            .annotation(ANNOTATION_UNREGISTRATION_COMPLETE)
            .is_some()
    }
}

// ── Classification ────────────────────────────────────────────────

/// An owner together with its agents, counted by state.
#[derive(Debug, Clone)]
pub struct OwnerAgents {
    pub owner: ReplicaOwner,
    pub agents: Vec<Agent>,
    pub total: u32,
    pub completed: u32,
    pub running: u32,
    pub pending: u32,
    pub terminating: u32,
    /// Running agents still without a provider ID past the registration
    /// timeout.
    pub registration_timed_out: u32,
}

impl OwnerAgents {
    /// Every agent has stopped. Owners that never got an agent after being
    /// materialized also count, unless they replace lost agents.
    pub fn is_finished(&self) -> bool {
        if self.total == 0 {
            return !self.owner.replaces_lost_agents() && self.owner.is_synced();
        }
        self.total == self.completed
    }
}

/// Count `agents` of `owner` by state.
pub fn classify(
    owner: ReplicaOwner,
    agents: Vec<Agent>,
    registration_timeout: Duration,
    now: DateTime<Utc>,
) -> OwnerAgents {
    let mut counts = OwnerAgents {
        owner,
        agents: Vec::new(),
        total: 0,
        completed: 0,
        running: 0,
        pending: 0,
        terminating: 0,
        registration_timed_out: 0,
    };
    let timeout = chrono::Duration::from_std(registration_timeout).ok();

    for agent in &agents {
        counts.total += 1;
        if agent.is_stopped() {
            counts.completed += 1;
        } else if agent.meta.is_deleting() {
            counts.terminating += 1;
        } else if agent.status.phase == AgentPhase::Running {
            counts.running += 1;
            let since = agent.status.ready_since.unwrap_or(agent.meta.created_at());
            if agent.runner_id().is_none()
                && timeout
                    .and_then(|t| since.checked_add_signed(t))
                    .is_some_and(|t| t < now)
            {
                counts.registration_timed_out += 1;
            }
        } else {
            counts.pending += 1;
        }
    }
    counts.agents = agents;
    counts
}
