//! Lifecycle states of one agent.
//!
//! ```text
//! Created → Registering → InService → UnregistrationStarted → Unregistered → deleted
//!               │
//!               └→ StoppedWithoutId   (process exited before registering)
//! ```
//!
//! The state is derived from the agent record on every reconcile; nothing
//! stores it.

use rungrid_state::{
    ANNOTATION_UNREGISTRATION_COMPLETE, ANNOTATION_UNREGISTRATION_REQUEST, Agent, AgentPhase,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Created,
    /// Waiting for the runner process to show up at the provider.
    Registering,
    InService,
    UnregistrationStarted,
    Unregistered,
    StoppedWithoutId,
}

impl RunnerState {
    pub fn of(agent: &Agent) -> Self {
        let meta = &agent.meta;
        if meta.annotation(ANNOTATION_UNREGISTRATION_COMPLETE).is_some() {
            RunnerState::Unregistered
        } else if meta.annotation(ANNOTATION_UNREGISTRATION_REQUEST).is_some() || meta.is_deleting()
        {
            RunnerState::UnregistrationStarted
        } else if agent.runner_id().is_some() {
            RunnerState::InService
        } else if agent.is_stopped() {
            RunnerState::StoppedWithoutId
        } else if agent.status.registration.is_some() || agent.status.phase == AgentPhase::Running
        {
            RunnerState::Registering
        } else {
            RunnerState::Created
        }
    }
}
