//! Agent lifecycle loop.
//!
//! Walks every agent once per tick: keeps the runner guard in place, hands
//! out registration tokens, discovers the provider ID, and runs graceful
//! unregistration for agents being drained or deleted. Agents that asked
//! to be retried later are skipped until their time comes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rungrid_provider::{ClientCache, Provider};
use rungrid_state::{
    ANNOTATION_RUNNER_ID, ANNOTATION_UNREGISTRATION_COMPLETE, ANNOTATION_UNREGISTRATION_FAILURE,
    ANNOTATION_UNREGISTRATION_REQUEST, ANNOTATION_WAIT_FOR_COMPLETION, Agent, AgentPhase,
    LabelSelector, RUNNER_GUARD, Registration, StateStore,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{LifecycleError, LifecycleResult};
use crate::state::RunnerState;
use crate::unregister::{LifecycleTimings, Unregistrar, Verdict, WaitReason};

/// Registration tokens this close to expiry are replaced.
const TOKEN_REFRESH_MARGIN_MINUTES: i64 = 3;

/// Per-agent bookkeeping between passes.
struct Tracked {
    namespace: String,
    credential: Option<String>,
    next_attempt: Option<DateTime<Utc>>,
}

pub struct AgentLifecycle {
    store: StateStore,
    clients: Arc<ClientCache>,
    unregistrar: Unregistrar,
    timings: LifecycleTimings,
    tracked: Mutex<HashMap<String, Tracked>>,
}

impl AgentLifecycle {
    pub fn new(store: StateStore, clients: Arc<ClientCache>, timings: LifecycleTimings) -> Self {
        Self {
            store,
            clients,
            unregistrar: Unregistrar::new(timings),
            timings,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    /// Reconcile every agent that is due. Returns how many were visited.
    pub async fn reconcile_all(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let agents: Vec<Agent> = self.store.list(None, &LabelSelector::everything())?;
        self.release_vanished(&agents);

        let mut visited = 0;
        for agent in &agents {
            let key = agent.meta.key();
            {
                let mut tracked = self.tracked.lock();
                let entry = tracked.entry(key.clone()).or_insert_with(|| Tracked {
                    namespace: agent.meta.namespace.clone(),
                    credential: agent.spec.credential.clone(),
                    next_attempt: None,
                });
                if entry.next_attempt.is_some_and(|t| t > now) {
                    continue;
                }
            }

            visited += 1;
            let next = match self.reconcile(agent, now).await {
                Ok(Some(delay)) => chrono::Duration::from_std(delay).ok().map(|d| now + d),
                Ok(None) => None,
                Err(e) => {
                    warn!(agent = %key, error = %e, "agent reconcile failed");
                    chrono::Duration::from_std(self.timings.retry_delay)
                        .ok()
                        .map(|d| now + d)
                }
            };
            if let Some(entry) = self.tracked.lock().get_mut(&key) {
                entry.next_attempt = next;
            }
        }
        Ok(visited)
    }

    /// Drop bookkeeping for agents that left the store and give back
    /// their client references.
    fn release_vanished(&self, agents: &[Agent]) {
        let live_keys: HashSet<String> = agents.iter().map(|a| a.meta.key()).collect();
        let mut tracked = self.tracked.lock();
        tracked.retain(|key, t| {
            let live = live_keys.contains(key);
            if !live {
                self.clients
                    .release(&t.namespace, t.credential.as_deref(), &dependent(key));
            }
            live
        });
    }

    /// One lifecycle step for `agent`. `Some(delay)` asks to be visited
    /// again no sooner than `delay` from now.
    pub async fn reconcile(
        &self,
        agent: &Agent,
        now: DateTime<Utc>,
    ) -> LifecycleResult<Option<Duration>> {
        let key = agent.meta.key();
        let client = self.client_for(agent);
        let state = RunnerState::of(agent);
        debug!(agent = %key, ?state, "reconciling agent");

        if agent.meta.is_deleting() {
            if !agent.meta.has_finalizer(RUNNER_GUARD) {
                return Ok(None);
            }
            return match self.unregister(agent, client.as_deref(), now).await? {
                Verdict::Safe(reason) => {
                    self.store.modify::<Agent, _>(
                        &agent.meta.namespace,
                        &agent.meta.name,
                        |a| a.meta.finalizers.retain(|f| f != RUNNER_GUARD),
                    )?;
                    info!(agent = %key, ?reason, "runner guard removed, agent released");
                    Ok(None)
                }
                Verdict::Wait { retry_after, .. } => Ok(Some(retry_after)),
            };
        }

        if !agent.meta.has_finalizer(RUNNER_GUARD) {
            self.store
                .modify::<Agent, _>(&agent.meta.namespace, &agent.meta.name, |a| {
                    if !a.meta.has_finalizer(RUNNER_GUARD) {
                        a.meta.finalizers.push(RUNNER_GUARD.to_string());
                    }
                })?;
            debug!(agent = %key, "runner guard added");
        }

        match state {
            RunnerState::UnregistrationStarted => {
                return match self.unregister(agent, client.as_deref(), now).await? {
                    Verdict::Safe(_) => Ok(None),
                    Verdict::Wait { retry_after, .. } => Ok(Some(retry_after)),
                };
            }
            RunnerState::Unregistered => return Ok(None),
            _ => {}
        }

        // An ephemeral runner that exited has done its one job.
        if agent.spec.ephemeral && agent.is_stopped() {
            self.annotate(agent, ANNOTATION_UNREGISTRATION_REQUEST, &now.to_rfc3339())?;
            self.store
                .delete::<Agent>(&agent.meta.namespace, &agent.meta.name)?;
            info!(agent = %key, exit_code = ?agent.exit_code(), "ephemeral runner stopped, deletion requested");
            return Ok(None);
        }

        if agent.runner_id().is_none() && !agent.is_stopped() {
            let provider = client
                .as_deref()
                .ok_or_else(|| LifecycleError::NoClient(key.clone()))?;
            self.ensure_registration(agent, provider, now).await?;
            if agent.status.phase == AgentPhase::Running {
                self.discover_runner_id(agent, provider).await?;
            }
        }
        Ok(None)
    }

    fn client_for(&self, agent: &Agent) -> Option<Arc<dyn Provider>> {
        let key = agent.meta.key();
        match self.clients.resolve(
            &agent.meta.namespace,
            agent.spec.credential.as_deref(),
            &dependent(&key),
        ) {
            Ok(client) => Some(client),
            Err(e) => {
                debug!(agent = %key, error = %e, "no provider client");
                None
            }
        }
    }

    async fn ensure_registration(
        &self,
        agent: &Agent,
        provider: &dyn Provider,
        now: DateTime<Utc>,
    ) -> LifecycleResult<()> {
        if agent
            .status
            .registration
            .as_ref()
            .is_some_and(|r| r.expires_at - chrono::Duration::minutes(TOKEN_REFRESH_MARGIN_MINUTES) > now)
        {
            return Ok(());
        }
        let token = provider.create_registration_token(&agent.spec.scope).await?;
        let expires_at = token.expires_at;
        self.store
            .modify::<Agent, _>(&agent.meta.namespace, &agent.meta.name, |a| {
                a.status.registration = Some(Registration {
                    token: token.token.clone(),
                    expires_at,
                });
            })?;
        info!(agent = %agent.meta.key(), %expires_at, "registration token issued");
        Ok(())
    }

    async fn discover_runner_id(&self, agent: &Agent, provider: &dyn Provider) -> LifecycleResult<()> {
        let runners = provider.list_runners(&agent.spec.scope).await?;
        let Some(runner) = runners.iter().find(|r| r.name == agent.meta.name) else {
            debug!(agent = %agent.meta.key(), "runner not listed by the provider yet");
            return Ok(());
        };
        self.annotate(agent, ANNOTATION_RUNNER_ID, &runner.id.to_string())?;
        info!(agent = %agent.meta.key(), runner_id = runner.id, "runner registered");
        Ok(())
    }

    /// Mark unregistration as started, evaluate it, and record the outcome
    /// on the agent.
    async fn unregister(
        &self,
        agent: &Agent,
        provider: Option<&dyn Provider>,
        now: DateTime<Utc>,
    ) -> LifecycleResult<Verdict> {
        let key = agent.meta.key();
        self.annotate(agent, ANNOTATION_UNREGISTRATION_REQUEST, &now.to_rfc3339())?;

        let verdict = match self.unregistrar.safe_to_delete(agent, provider, now).await {
            Ok(v) => v,
            Err(e) => {
                error!(agent = %key, error = %e, "unregistration failed");
                self.store
                    .modify::<Agent, _>(&agent.meta.namespace, &agent.meta.name, |a| {
                        a.meta
                            .annotations
                            .insert(ANNOTATION_UNREGISTRATION_FAILURE.to_string(), e.to_string());
                    })?;
                return Err(e);
            }
        };

        let ephemeral = agent.spec.ephemeral;
        self.store
            .modify::<Agent, _>(&agent.meta.namespace, &agent.meta.name, |a| {
                let annotations = &mut a.meta.annotations;
                match verdict {
                    Verdict::Safe(_) => {
                        annotations
                            .entry(ANNOTATION_UNREGISTRATION_COMPLETE.to_string())
                            .or_insert_with(|| now.to_rfc3339());
                        annotations.remove(ANNOTATION_UNREGISTRATION_FAILURE);
                    }
                    Verdict::Wait { reason, .. } => {
                        if reason == WaitReason::Busy && ephemeral {
                            annotations.insert(
                                ANNOTATION_WAIT_FOR_COMPLETION.to_string(),
                                now.to_rfc3339(),
                            );
                        }
                        if matches!(
                            reason,
                            WaitReason::Busy | WaitReason::RateLimited | WaitReason::Transient
                        ) {
                            annotations.insert(
                                ANNOTATION_UNREGISTRATION_FAILURE.to_string(),
                                reason.to_string(),
                            );
                        }
                    }
                }
            })?;
        Ok(verdict)
    }

    /// Set an annotation unless already present.
    fn annotate(&self, agent: &Agent, key: &str, value: &str) -> LifecycleResult<()> {
        if agent.meta.annotation(key).is_some() {
            return Ok(());
        }
        self.store
            .modify::<Agent, _>(&agent.meta.namespace, &agent.meta.name, |a| {
                a.meta
                    .annotations
                    .entry(key.to_string())
                    .or_insert_with(|| value.to_string());
            })?;
        Ok(())
    }

    /// Run the lifecycle loop until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "agent lifecycle controller started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.reconcile_all(Utc::now()).await {
                        error!(error = %e, "lifecycle pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("agent lifecycle controller shutting down");
                    break;
                }
            }
        }
    }
}

fn dependent(agent_key: &str) -> String {
    format!("agent/{agent_key}")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rungrid_provider::fake::FakeProvider;
    use rungrid_provider::{ProviderError, ProviderFactory, ProviderResult};
    use rungrid_state::{AgentSpec, ContainerState, Credential, ObjectMeta, RunnerScope};

    use super::*;

    struct NoFactory;

    impl ProviderFactory for NoFactory {
        fn build(&self, _data: &BTreeMap<String, String>) -> ProviderResult<Arc<dyn Provider>> {
            Err(ProviderError::Credential("not used".into()))
        }
    }

    fn setup(fake: FakeProvider) -> (StateStore, AgentLifecycle, Arc<FakeProvider>) {
        let store = StateStore::open_in_memory().unwrap();
        let fake = Arc::new(fake);
        let clients = Arc::new(ClientCache::new(
            store.clone(),
            Arc::new(NoFactory),
            Some(fake.clone() as Arc<dyn Provider>),
        ));
        let lifecycle = AgentLifecycle::new(store.clone(), clients, LifecycleTimings::default());
        (store, lifecycle, fake)
    }

    fn seed(store: &StateStore, edit: impl FnOnce(&mut Agent)) {
        let mut agent = Agent {
            meta: ObjectMeta::new("ci", "fleet-x-0"),
            spec: AgentSpec {
                owner: "fleet-x".into(),
                target: "fleet".into(),
                scope: RunnerScope::repository("acme/api"),
                ..Default::default()
            },
            status: Default::default(),
        };
        agent.meta.finalizers.push(RUNNER_GUARD.to_string());
        edit(&mut agent);
        store.create(agent).unwrap();
    }

    fn get(store: &StateStore) -> Option<Agent> {
        store.get("ci", "fleet-x-0").unwrap()
    }

    fn registered(a: &mut Agent) {
        a.status.phase = AgentPhase::Running;
        a.status.container = ContainerState::Running;
        a.meta
            .annotations
            .insert(ANNOTATION_RUNNER_ID.into(), "42".into());
    }

    #[tokio::test]
    async fn guard_and_registration_token() {
        let (store, lc, fake) = setup(FakeProvider::new());
        seed(&store, |a| a.meta.finalizers.clear());

        lc.reconcile_all(Utc::now()).await.unwrap();
        let a = get(&store).unwrap();
        assert!(a.meta.has_finalizer(RUNNER_GUARD));
        assert_eq!(a.status.registration.unwrap().token, "reg-1");

        lc.reconcile_all(Utc::now()).await.unwrap();
        assert_eq!(fake.state().token_requests, 1, "valid token is reused");
    }

    #[tokio::test]
    async fn expiring_token_is_refreshed() {
        let (store, lc, fake) = setup(FakeProvider::new());
        seed(&store, |a| {
            a.status.registration = Some(Registration {
                token: "old".into(),
                expires_at: Utc::now() + chrono::Duration::minutes(1),
            });
        });

        lc.reconcile_all(Utc::now()).await.unwrap();
        let reg = get(&store).unwrap().status.registration.unwrap();
        assert_eq!(reg.token, "reg-1");
        assert_eq!(fake.state().token_requests, 1);
    }

    #[tokio::test]
    async fn runner_id_is_discovered_by_name() {
        let (store, lc, _) = setup(FakeProvider::new().with_runner(42, "fleet-x-0", false));
        seed(&store, |a| a.status.phase = AgentPhase::Running);

        lc.reconcile_all(Utc::now()).await.unwrap();
        let a = get(&store).unwrap();
        assert_eq!(a.runner_id(), Some(42));
        assert_eq!(RunnerState::of(&a), RunnerState::InService);
    }

    #[tokio::test]
    async fn deleted_agent_is_revoked_then_released() {
        let (store, lc, fake) = setup(FakeProvider::new().with_runner(42, "fleet-x-0", false));
        seed(&store, registered);
        store.delete::<Agent>("ci", "fleet-x-0").unwrap();
        assert!(get(&store).is_some(), "guard holds the agent");

        lc.reconcile_all(Utc::now()).await.unwrap();
        assert_eq!(fake.removed(), vec![42]);
        assert!(get(&store).is_none());
    }

    #[tokio::test]
    async fn busy_ephemeral_runner_is_left_to_finish() {
        let (store, lc, fake) = setup(FakeProvider::new());
        seed(&store, |a| {
            registered(a);
            a.spec.ephemeral = true;
        });
        store.delete::<Agent>("ci", "fleet-x-0").unwrap();
        fake.fail_next_remove(422, "Runner is still running a job");

        let now = Utc::now();
        assert_eq!(lc.reconcile_all(now).await.unwrap(), 1);
        let a = get(&store).unwrap();
        assert!(a.meta.annotation(ANNOTATION_WAIT_FOR_COMPLETION).is_some());
        assert!(a.meta.annotation(ANNOTATION_UNREGISTRATION_FAILURE).is_some());
        assert!(a.meta.annotation(ANNOTATION_UNREGISTRATION_COMPLETE).is_none());

        // Not due yet.
        assert_eq!(lc.reconcile_all(now + chrono::Duration::seconds(10)).await.unwrap(), 0);

        // The job finishes and the process exits.
        store
            .modify::<Agent, _>("ci", "fleet-x-0", |a| {
                a.status.container = ContainerState::Terminated { exit_code: 0 };
            })
            .unwrap();
        assert_eq!(lc.reconcile_all(now + chrono::Duration::seconds(61)).await.unwrap(), 1);
        assert!(get(&store).is_none());
        assert!(fake.removed().is_empty(), "stopped runner needs no revoke");
    }

    #[tokio::test]
    async fn pending_agent_marked_for_deletion_goes_at_once() {
        let (store, lc, fake) = setup(FakeProvider::new());
        seed(&store, |_| {});
        store.delete::<Agent>("ci", "fleet-x-0").unwrap();

        lc.reconcile_all(Utc::now()).await.unwrap();
        assert!(get(&store).is_none());
        assert_eq!(fake.state().token_requests, 0);
    }

    #[tokio::test]
    async fn stopped_ephemeral_runner_requests_its_deletion() {
        let (store, lc, fake) = setup(FakeProvider::new());
        seed(&store, |a| {
            registered(a);
            a.spec.ephemeral = true;
            a.status.container = ContainerState::Terminated { exit_code: 0 };
        });

        lc.reconcile_all(Utc::now()).await.unwrap();
        let a = get(&store).unwrap();
        assert!(a.meta.is_deleting());
        assert!(a.meta.annotation(ANNOTATION_UNREGISTRATION_REQUEST).is_some());

        lc.reconcile_all(Utc::now()).await.unwrap();
        assert!(get(&store).is_none());
        assert!(fake.removed().is_empty());
    }

    #[tokio::test]
    async fn drain_request_unregisters_but_keeps_guard() {
        let (store, lc, fake) = setup(FakeProvider::new());
        seed(&store, |a| {
            registered(a);
            a.meta.annotations.insert(
                ANNOTATION_UNREGISTRATION_REQUEST.into(),
                Utc::now().to_rfc3339(),
            );
        });

        lc.reconcile_all(Utc::now()).await.unwrap();
        let a = get(&store).unwrap();
        assert!(a.meta.annotation(ANNOTATION_UNREGISTRATION_COMPLETE).is_some());
        assert!(a.meta.has_finalizer(RUNNER_GUARD));
        assert_eq!(fake.removed(), vec![42]);
        assert_eq!(RunnerState::of(&a), RunnerState::Unregistered);
    }

    struct CredentialFactory(Arc<FakeProvider>);

    impl ProviderFactory for CredentialFactory {
        fn build(&self, _data: &BTreeMap<String, String>) -> ProviderResult<Arc<dyn Provider>> {
            Ok(self.0.clone() as Arc<dyn Provider>)
        }
    }

    #[tokio::test]
    async fn credential_client_released_after_agent_is_gone() {
        let store = StateStore::open_in_memory().unwrap();
        let fake = Arc::new(FakeProvider::new());
        let clients = Arc::new(ClientCache::new(
            store.clone(),
            Arc::new(CredentialFactory(fake.clone())),
            None,
        ));
        let lc = AgentLifecycle::new(store.clone(), clients.clone(), LifecycleTimings::default());
        store
            .create(Credential {
                meta: ObjectMeta::new("ci", "gh"),
                data: BTreeMap::from([("token".to_string(), "t".to_string())]),
            })
            .unwrap();
        seed(&store, |a| a.spec.credential = Some("gh".into()));

        lc.reconcile_all(Utc::now()).await.unwrap();
        assert_eq!(fake.state().token_requests, 1);
        assert_eq!(clients.len(), 1);

        // Pending and marked for deletion: released without waiting.
        store.delete::<Agent>("ci", "fleet-x-0").unwrap();
        lc.reconcile_all(Utc::now()).await.unwrap();
        assert!(get(&store).is_none());
        assert_eq!(clients.len(), 1);

        lc.reconcile_all(Utc::now()).await.unwrap();
        assert!(clients.is_empty());
    }
}
