//! Safe-to-delete evaluation.
//!
//! Rules are checked in order; the first match decides:
//!
//! | # | condition                                                  | verdict            |
//! |---|------------------------------------------------------------|--------------------|
//! | 1 | unregistration already complete                            | safe               |
//! | 2 | no ID, running, within registration timeout, not stuck     | wait (retry)       |
//! | 3 | no ID, pending and marked for deletion                     | safe               |
//! | 4 | no ID, process stopped                                     | safe               |
//! | 5 | no ID, registration timeout elapsed                        | safe               |
//! | 6 | process stopped                                            | safe               |
//! | 7 | revoke succeeds (or the runner is already gone)            | safe               |
//! | 8 | revoke fails busy                                          | wait; ephemeral agents wait for job completion |
//! | 9 | revoke fails with a permission error                       | safe, logged loudly |
//! |10 | revoke rate limited                                        | wait (long)        |
//! |11 | revoke fails transiently                                   | wait (retry)       |
//!
//! Any other provider error is returned to the caller.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rungrid_core::config::LifecycleConfig;
use rungrid_provider::Provider;
use rungrid_state::{ANNOTATION_UNREGISTRATION_COMPLETE, ANNOTATION_WAIT_FOR_COMPLETION, Agent};
use tracing::{debug, error, info, warn};

use crate::error::{LifecycleError, LifecycleResult};

/// Delays and bounds of the lifecycle machine.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleTimings {
    pub registration_timeout: Duration,
    pub retry_delay: Duration,
    pub rate_limit_delay: Duration,
    /// How long a busy ephemeral agent is left to finish its job before
    /// revoke is tried again.
    pub busy_wait_timeout: Duration,
    pub busy_wait_interval: Duration,
}

impl Default for LifecycleTimings {
    fn default() -> Self {
        Self::from_config(&LifecycleConfig::default())
    }
}

impl LifecycleTimings {
    pub fn from_config(config: &LifecycleConfig) -> Self {
        Self {
            registration_timeout: config.registration_timeout(),
            retry_delay: config.retry_delay(),
            rate_limit_delay: config.rate_limit_delay(),
            busy_wait_timeout: config.busy_wait_timeout(),
            busy_wait_interval: config.busy_wait_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeReason {
    AlreadyUnregistered,
    StuckPending,
    StoppedBeforeRegistration,
    RegistrationTimedOut,
    Stopped,
    Revoked,
    AlreadyAbsent,
    PermissionDenied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    NotRegistered,
    /// Revoke was refused because the runner is running a job.
    Busy,
    /// A busy ephemeral runner is being left to finish its job.
    AwaitingCompletion,
    RateLimited,
    Transient,
}

impl fmt::Display for WaitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WaitReason::NotRegistered => "runner has not registered yet",
            WaitReason::Busy => "runner is busy running a job",
            WaitReason::AwaitingCompletion => "waiting for the runner to complete its job",
            WaitReason::RateLimited => "provider rate limit hit while unregistering",
            WaitReason::Transient => "provider unavailable while unregistering",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Safe(SafeReason),
    Wait {
        reason: WaitReason,
        retry_after: Duration,
    },
}

impl Verdict {
    fn wait(reason: WaitReason, retry_after: Duration) -> Self {
        Verdict::Wait {
            reason,
            retry_after,
        }
    }

    pub fn is_safe(&self) -> bool {
        matches!(self, Verdict::Safe(_))
    }
}

pub struct Unregistrar {
    timings: LifecycleTimings,
}

impl Unregistrar {
    pub fn new(timings: LifecycleTimings) -> Self {
        Self { timings }
    }

    /// Decide whether `agent` can be deleted, revoking its registration
    /// when that is what it takes.
    pub async fn safe_to_delete(
        &self,
        agent: &Agent,
        provider: Option<&dyn Provider>,
        now: DateTime<Utc>,
    ) -> LifecycleResult<Verdict> {
        let key = agent.meta.key();
        let t = &self.timings;

        if agent
            .meta
            .annotation(ANNOTATION_UNREGISTRATION_COMPLETE)
            .is_some()
        {
            return Ok(Verdict::Safe(SafeReason::AlreadyUnregistered));
        }

        let stopped = agent.is_stopped();
        let Some(runner_id) = agent.runner_id() else {
            let stuck_pending = agent.is_pending() && agent.meta.is_deleting();
            let timed_out = elapsed(agent.meta.created_at(), t.registration_timeout, now);

            if !stopped && !timed_out && !stuck_pending {
                debug!(agent = %key, "runner not registered yet, waiting");
                return Ok(Verdict::wait(WaitReason::NotRegistered, t.retry_delay));
            }
            if stuck_pending {
                info!(agent = %key, "pending agent marked for deletion never registered");
                return Ok(Verdict::Safe(SafeReason::StuckPending));
            }
            if stopped {
                info!(agent = %key, exit_code = ?agent.exit_code(), "runner stopped before registering");
                return Ok(Verdict::Safe(SafeReason::StoppedBeforeRegistration));
            }
            warn!(
                agent = %key,
                timeout_secs = t.registration_timeout.as_secs(),
                "runner never registered, likely a connectivity problem"
            );
            return Ok(Verdict::Safe(SafeReason::RegistrationTimedOut));
        };

        if stopped {
            debug!(agent = %key, runner_id, exit_code = ?agent.exit_code(), "runner process stopped");
            return Ok(Verdict::Safe(SafeReason::Stopped));
        }

        if let Some(since) = agent.meta.annotation_time(ANNOTATION_WAIT_FOR_COMPLETION)
            && !elapsed(since, t.busy_wait_timeout, now)
        {
            debug!(agent = %key, runner_id, %since, "waiting for busy runner to complete its job");
            return Ok(Verdict::wait(WaitReason::AwaitingCompletion, t.busy_wait_interval));
        }

        let provider = provider.ok_or_else(|| LifecycleError::NoClient(key.clone()))?;
        match provider.remove_runner(&agent.spec.scope, runner_id).await {
            Ok(()) => {
                info!(agent = %key, runner_id, "runner unregistered");
                Ok(Verdict::Safe(SafeReason::Revoked))
            }
            Err(e) if e.is_not_found() => {
                info!(agent = %key, runner_id, "runner already unregistered");
                Ok(Verdict::Safe(SafeReason::AlreadyAbsent))
            }
            Err(e) if e.is_busy() => {
                if agent.spec.ephemeral {
                    info!(agent = %key, runner_id, "ephemeral runner busy, waiting for its job to complete");
                    Ok(Verdict::wait(WaitReason::Busy, t.busy_wait_interval))
                } else {
                    debug!(agent = %key, runner_id, "runner busy, retrying later");
                    Ok(Verdict::wait(WaitReason::Busy, t.retry_delay))
                }
            }
            Err(e) if e.is_forbidden() => {
                error!(
                    agent = %key,
                    runner_id,
                    error = %e,
                    "not permitted to unregister runner, deleting the agent anyway"
                );
                Ok(Verdict::Safe(SafeReason::PermissionDenied))
            }
            Err(e) if e.is_rate_limited() => {
                warn!(agent = %key, runner_id, error = %e, "rate limited while unregistering runner");
                Ok(Verdict::wait(WaitReason::RateLimited, t.rate_limit_delay))
            }
            Err(e) if e.is_transient() => {
                warn!(agent = %key, runner_id, error = %e, "unregistering runner failed, retrying");
                Ok(Verdict::wait(WaitReason::Transient, t.retry_delay))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// `since + bound` lies in the past.
fn elapsed(since: DateTime<Utc>, bound: Duration, now: DateTime<Utc>) -> bool {
    chrono::Duration::from_std(bound)
        .ok()
        .and_then(|b| since.checked_add_signed(b))
        .is_some_and(|deadline| deadline < now)
}

#[cfg(test)]
mod tests {
    use rungrid_provider::fake::FakeProvider;
    use rungrid_state::{ANNOTATION_RUNNER_ID, AgentPhase, ContainerState, ObjectMeta, RunnerScope};

    use super::*;

    fn agent(phase: AgentPhase, runner_id: Option<i64>) -> Agent {
        let mut a = Agent {
            meta: ObjectMeta::new("ci", "fleet-x-0"),
            spec: rungrid_state::AgentSpec {
                scope: RunnerScope::repository("acme/api"),
                ..Default::default()
            },
            status: Default::default(),
        };
        a.meta.creation_timestamp = Some(Utc::now());
        a.status.phase = phase;
        if let Some(id) = runner_id {
            a.meta.annotations.insert(ANNOTATION_RUNNER_ID.into(), id.to_string());
        }
        a
    }

    fn unregistrar() -> Unregistrar {
        Unregistrar::new(LifecycleTimings::default())
    }

    async fn verdict(a: &Agent, p: &FakeProvider) -> Verdict {
        unregistrar()
            .safe_to_delete(a, Some(p), Utc::now())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn completed_unregistration_is_safe() {
        let mut a = agent(AgentPhase::Running, Some(5));
        a.meta
            .annotations
            .insert(ANNOTATION_UNREGISTRATION_COMPLETE.into(), Utc::now().to_rfc3339());
        let p = FakeProvider::new();
        assert_eq!(verdict(&a, &p).await, Verdict::Safe(SafeReason::AlreadyUnregistered));
        assert!(p.removed().is_empty());
    }

    #[tokio::test]
    async fn unregistered_runner_waits_within_timeout() {
        let a = agent(AgentPhase::Running, None);
        let v = verdict(&a, &FakeProvider::new()).await;
        assert_eq!(
            v,
            Verdict::Wait {
                reason: WaitReason::NotRegistered,
                retry_after: Duration::from_secs(30)
            }
        );
    }

    #[tokio::test]
    async fn pending_agent_marked_for_deletion_is_safe_at_once() {
        let mut a = agent(AgentPhase::Pending, None);
        a.meta.deletion_timestamp = Some(Utc::now());
        let v = verdict(&a, &FakeProvider::new()).await;
        assert_eq!(v, Verdict::Safe(SafeReason::StuckPending));
    }

    #[tokio::test]
    async fn stopped_or_timed_out_without_id_is_safe() {
        let mut a = agent(AgentPhase::Running, None);
        a.status.container = ContainerState::Terminated { exit_code: 1 };
        let p = FakeProvider::new();
        assert_eq!(verdict(&a, &p).await, Verdict::Safe(SafeReason::StoppedBeforeRegistration));

        let mut a = agent(AgentPhase::Running, None);
        a.meta.creation_timestamp = Some(Utc::now() - chrono::Duration::minutes(11));
        assert_eq!(verdict(&a, &p).await, Verdict::Safe(SafeReason::RegistrationTimedOut));
    }

    #[tokio::test]
    async fn stopped_runner_needs_no_revoke() {
        let mut a = agent(AgentPhase::Failed, Some(5));
        a.status.container = ContainerState::Terminated { exit_code: 137 };
        let p = FakeProvider::new();
        assert_eq!(verdict(&a, &p).await, Verdict::Safe(SafeReason::Stopped));
        assert!(p.removed().is_empty());
    }

    #[tokio::test]
    async fn revoke_outcomes() {
        let a = agent(AgentPhase::Running, Some(5));
        let p = FakeProvider::new();
        assert_eq!(verdict(&a, &p).await, Verdict::Safe(SafeReason::Revoked));
        assert_eq!(p.removed(), vec![5]);

        p.fail_next_remove(404, "Not Found");
        assert_eq!(verdict(&a, &p).await, Verdict::Safe(SafeReason::AlreadyAbsent));

        p.fail_next_remove(403, "Resource not accessible by integration");
        assert_eq!(verdict(&a, &p).await, Verdict::Safe(SafeReason::PermissionDenied));

        p.fail_next_remove(422, "Bad request - Runner \"x\" is still running a job");
        assert_eq!(
            verdict(&a, &p).await,
            Verdict::Wait {
                reason: WaitReason::Busy,
                retry_after: Duration::from_secs(30)
            }
        );

        p.fail_next_remove(403, "API rate limit exceeded");
        assert_eq!(
            verdict(&a, &p).await,
            Verdict::Wait {
                reason: WaitReason::RateLimited,
                retry_after: Duration::from_secs(600)
            }
        );

        p.fail_next_remove(502, "Bad Gateway");
        assert_eq!(
            verdict(&a, &p).await,
            Verdict::Wait {
                reason: WaitReason::Transient,
                retry_after: Duration::from_secs(30)
            }
        );

        p.fail_next_remove(400, "Bad Request");
        let err = unregistrar()
            .safe_to_delete(&a, Some(&p), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Provider(_)));
    }

    #[tokio::test]
    async fn busy_ephemeral_runner_waits_for_completion() {
        let mut a = agent(AgentPhase::Running, Some(5));
        a.spec.ephemeral = true;
        let p = FakeProvider::new();
        p.fail_next_remove(422, "still running a job");
        assert_eq!(
            verdict(&a, &p).await,
            Verdict::Wait {
                reason: WaitReason::Busy,
                retry_after: Duration::from_secs(60)
            }
        );

        // Inside the wait window revoke is not attempted.
        a.meta.annotations.insert(
            ANNOTATION_WAIT_FOR_COMPLETION.into(),
            Utc::now().to_rfc3339(),
        );
        let v = verdict(&a, &p).await;
        assert_eq!(
            v,
            Verdict::Wait {
                reason: WaitReason::AwaitingCompletion,
                retry_after: Duration::from_secs(60)
            }
        );
        assert!(p.removed().is_empty());

        // Past the bound revoke is tried again.
        a.meta.annotations.insert(
            ANNOTATION_WAIT_FOR_COMPLETION.into(),
            (Utc::now() - chrono::Duration::minutes(61)).to_rfc3339(),
        );
        assert_eq!(verdict(&a, &p).await, Verdict::Safe(SafeReason::Revoked));
    }

    #[tokio::test]
    async fn known_id_without_client_is_an_error() {
        let a = agent(AgentPhase::Running, Some(5));
        let err = unregistrar()
            .safe_to_delete(&a, None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::NoClient(_)));
    }
}
