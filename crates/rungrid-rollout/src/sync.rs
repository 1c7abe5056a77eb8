//! Owner synchronization.
//!
//! One sync pass brings the owners of a scale target to the desired replica
//! count:
//!
//! ```text
//! owners fully completed / drained        → delete
//! owner mid-drain                         → mark drained once every agent
//!                                           is unregistered, skip counting
//! any owner not caught up with its spec   → skip this pass
//!
//! desired > pending + running (current hash)  → create one-replica owners
//! desired <= running                          → walk newest → oldest keeping
//!                                               owners until `desired` running
//!                                               are retained, drain the rest
//! owners at a stale template hash             → delete, one at a time
//! ```
//!
//! Agent deletion is never done here directly: deleting an owner only
//! requests deletion of its agents, and their guard holds them until the
//! lifecycle machine has unregistered them.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rungrid_core::content_hash;
use rungrid_state::{
    ANNOTATION_UNREGISTRATION_COMPLETE, ANNOTATION_UNREGISTRATION_REQUEST, Agent, LABEL_OWNER,
    LABEL_TARGET, LABEL_TEMPLATE_HASH, LabelSelector, ObjectMeta, Owner, OwnerSpec, ScaleTarget,
    StateError, StateStore,
};
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};
use crate::owner::{OwnerAgents, ReplicaOwner, classify};

/// Attempts at picking an unused owner name.
const NAME_ATTEMPTS: usize = 3;

/// Persistence operations owner sync needs.
pub trait OwnerStore: Send + Sync {
    /// Live owners of `target`, oldest first.
    fn owners(&self, target: &ScaleTarget) -> SyncResult<Vec<Owner>>;
    fn agents(&self, owner: &ReplicaOwner) -> SyncResult<Vec<Agent>>;
    fn create_owner(&self, owner: Owner) -> SyncResult<Owner>;
    /// Set an annotation on the owner unless already present.
    fn annotate_owner(&self, owner: &Owner, key: &str, value: &str) -> SyncResult<()>;
    /// Set an annotation on the agent unless already present.
    fn annotate_agent(&self, agent: &Agent, key: &str, value: &str) -> SyncResult<()>;
    /// Delete the owner and request deletion of every agent it owns.
    fn delete_owner(&self, owner: &Owner) -> SyncResult<()>;
}

impl OwnerStore for StateStore {
    fn owners(&self, target: &ScaleTarget) -> SyncResult<Vec<Owner>> {
        let selector = LabelSelector::everything().with(LABEL_TARGET, &target.meta.name);
        let owners: Vec<Owner> = self.list(Some(&target.meta.namespace), &selector)?;
        Ok(owners.into_iter().filter(|o| !o.meta.is_deleting()).collect())
    }

    fn agents(&self, owner: &ReplicaOwner) -> SyncResult<Vec<Agent>> {
        Ok(self.list(Some(&owner.owner().meta.namespace), &owner.agent_selector())?)
    }

    fn create_owner(&self, owner: Owner) -> SyncResult<Owner> {
        Ok(self.create(owner)?)
    }

    fn annotate_owner(&self, owner: &Owner, key: &str, value: &str) -> SyncResult<()> {
        self.modify::<Owner, _>(&owner.meta.namespace, &owner.meta.name, |o| {
            o.meta
                .annotations
                .entry(key.to_string())
                .or_insert_with(|| value.to_string());
        })?;
        Ok(())
    }

    fn annotate_agent(&self, agent: &Agent, key: &str, value: &str) -> SyncResult<()> {
        if agent.meta.annotation(key).is_some() {
            return Ok(());
        }
        self.modify::<Agent, _>(&agent.meta.namespace, &agent.meta.name, |a| {
            a.meta
                .annotations
                .entry(key.to_string())
                .or_insert_with(|| value.to_string());
        })?;
        Ok(())
    }

    fn delete_owner(&self, owner: &Owner) -> SyncResult<()> {
        let ns = owner.meta.namespace.as_str();
        self.delete::<Owner>(ns, &owner.meta.name)?;
        let selector = LabelSelector::everything().with(LABEL_OWNER, &owner.meta.name);
        let agents: Vec<Agent> = self.list(Some(ns), &selector)?;
        for agent in agents {
            self.delete::<Agent>(ns, &agent.meta.name)?;
        }
        Ok(())
    }
}

/// Inputs of one sync pass.
#[derive(Debug, Clone)]
pub struct SyncRequest<'a> {
    pub target: &'a ScaleTarget,
    pub desired: u32,
    /// Effective time of the demand behind `desired`.
    pub effective_time: Option<DateTime<Utc>>,
    pub ephemeral: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

/// Outcome of a sync pass that ran to completion.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Owners at the current template hash, oldest first.
    pub current: Vec<OwnerAgents>,
    pub created: u32,
    pub drained: u32,
    pub deleted: u32,
}

impl SyncReport {
    pub fn running(&self) -> u32 {
        self.current.iter().map(|o| o.running).sum()
    }

    pub fn pending(&self) -> u32 {
        self.current.iter().map(|o| o.pending).sum()
    }
}

struct Collected {
    by_hash: BTreeMap<String, Vec<OwnerAgents>>,
    deleted: u32,
}

pub struct OwnerSync {
    registration_timeout: Duration,
    recreation_delay: Duration,
    seq: AtomicU64,
}

impl OwnerSync {
    pub fn new(registration_timeout: Duration, recreation_delay: Duration) -> Self {
        Self {
            registration_timeout,
            recreation_delay,
            seq: AtomicU64::new(0),
        }
    }

    /// Run one sync pass. `Ok(None)` means the pass stopped early and the
    /// caller should try again next tick.
    pub fn sync(
        &self,
        store: &dyn OwnerStore,
        req: &SyncRequest<'_>,
    ) -> SyncResult<Option<SyncReport>> {
        let target_key = req.target.meta.key();
        let desired_hash = req
            .target
            .spec
            .template
            .hash()
            .map_err(|e| SyncError::Template(e.to_string()))?;

        let Some(mut state) = self.collect(store, req)? else {
            return Ok(None);
        };
        let mut report = SyncReport {
            deleted: state.deleted,
            ..Default::default()
        };
        let current = state.by_hash.remove(&desired_hash).unwrap_or_default();

        let pending: u32 = current.iter().map(|o| o.pending).sum();
        let running: u32 = current.iter().map(|o| o.running).sum();
        let timed_out: u32 = current.iter().map(|o| o.registration_timed_out).sum();
        debug!(
            target = %target_key,
            desired = req.desired,
            pending,
            running,
            registration_timed_out = timed_out,
            owners = current.len(),
            "agents across current owners"
        );

        let maybe_running = pending + running;
        let want_more = req.desired > maybe_running;

        if want_more && self.suppress_recreation(req) {
            info!(
                target = %target_key,
                desired = req.desired,
                maybe_running,
                "ephemeral agents went away since the last sync, waiting for new demand"
            );
            return Ok(None);
        }

        if want_more {
            let shortfall = req.desired - maybe_running;
            for _ in 0..shortfall {
                self.create_owner(store, req, &desired_hash)?;
            }
            info!(target = %target_key, created = shortfall, desired = req.desired, "owners created");
            report.created = shortfall;
        } else if req.desired <= running {
            let mut retained = 0;
            let mut drain = Vec::new();
            for oa in current.iter().rev() {
                if oa.running == 0 || retained >= req.desired {
                    drain.push(oa);
                } else {
                    retained += oa.running;
                }
            }

            match retained.cmp(&req.desired) {
                Ordering::Equal => {
                    let stamp = req.now.to_rfc3339();
                    for oa in drain {
                        if oa.owner.drain_requested() {
                            continue;
                        }
                        for agent in &oa.agents {
                            store.annotate_agent(agent, ANNOTATION_UNREGISTRATION_REQUEST, &stamp)?;
                        }
                        store.annotate_owner(oa.owner.owner(), ANNOTATION_UNREGISTRATION_REQUEST, &stamp)?;
                        info!(
                            target = %target_key,
                            owner = oa.owner.name(),
                            agents = oa.agents.len(),
                            "owner drain started"
                        );
                        report.drained += 1;
                    }
                }
                Ordering::Greater => {
                    debug!(
                        target = %target_key,
                        retained,
                        desired = req.desired,
                        "waiting for owner replicas to settle"
                    );
                    return Ok(None);
                }
                Ordering::Less => {
                    panic!(
                        "owner sync for {target_key} retained {retained} running agents, fewer than desired {}",
                        req.desired
                    );
                }
            }
        }

        // Stale owners go one at a time; the owner list is re-read after
        // each deletion.
        let mut budget: usize = state.by_hash.values().map(Vec::len).sum();
        while budget > 0 {
            budget -= 1;
            let next = store
                .owners(req.target)?
                .into_iter()
                .map(ReplicaOwner::from)
                .find(|o| o.template_hash() != desired_hash && !o.drain_requested());
            let Some(stale) = next else {
                break;
            };
            store.delete_owner(stale.owner())?;
            info!(
                target = %target_key,
                owner = stale.name(),
                template_hash = stale.template_hash(),
                "stale owner deleted"
            );
            report.deleted += 1;
        }

        report.current = current;
        Ok(Some(report))
    }

    /// Classify every owner of the target, deleting finished ones and
    /// advancing drains. `None` when some owner has not caught up with its
    /// spec yet.
    fn collect(
        &self,
        store: &dyn OwnerStore,
        req: &SyncRequest<'_>,
    ) -> SyncResult<Option<Collected>> {
        let stamp = req.now.to_rfc3339();
        let mut by_hash: BTreeMap<String, Vec<OwnerAgents>> = BTreeMap::new();
        let mut deleted = 0;

        for owner in store.owners(req.target)? {
            let ro = ReplicaOwner::from(owner);
            let agents = store.agents(&ro)?;
            let oa = classify(ro, agents, self.registration_timeout, req.now);
            let owner = oa.owner.owner();

            if oa.owner.drain_complete() {
                store.delete_owner(owner)?;
                info!(owner = %owner.meta.key(), "drained owner deleted");
                deleted += 1;
                continue;
            }
            if oa.is_finished() {
                store.delete_owner(owner)?;
                info!(owner = %owner.meta.key(), agents = oa.total, "completed owner deleted");
                deleted += 1;
                continue;
            }
            if oa.owner.drain_requested() {
                let unregistered = oa
                    .agents
                    .iter()
                    .filter(|a| {
                        a.meta.annotation(ANNOTATION_UNREGISTRATION_COMPLETE).is_some()
                            || a.meta.is_deleting()
                    })
                    .count();
                if unregistered == oa.agents.len() {
                    store.annotate_owner(owner, ANNOTATION_UNREGISTRATION_COMPLETE, &stamp)?;
                    info!(owner = %owner.meta.key(), "owner drain complete");
                } else {
                    debug!(
                        owner = %owner.meta.key(),
                        unregistered,
                        total = oa.agents.len(),
                        "waiting for agents to unregister"
                    );
                }
                continue;
            }
            if !oa.owner.is_synced() {
                debug!(owner = %owner.meta.key(), "owner not caught up with its spec, skipping sync");
                return Ok(None);
            }
            by_hash
                .entry(oa.owner.template_hash().to_string())
                .or_default()
                .push(oa);
        }
        Ok(Some(Collected { by_hash, deleted }))
    }

    /// Ephemeral agents that finished their job disappear before the
    /// autoscaler sees the lower demand. They are not replaced while the
    /// last sync is newer than the demand and still within the cooldown.
    fn suppress_recreation(&self, req: &SyncRequest<'_>) -> bool {
        let Some(last) = req.last_sync_time else {
            return false;
        };
        let synced_after_demand = req.ephemeral && req.effective_time.is_some_and(|t| t < last);
        let cooling_down = chrono::Duration::from_std(self.recreation_delay)
            .ok()
            .and_then(|d| last.checked_add_signed(d))
            .is_some_and(|until| req.now < until);
        synced_after_demand && cooling_down
    }

    fn create_owner(
        &self,
        store: &dyn OwnerStore,
        req: &SyncRequest<'_>,
        template_hash: &str,
    ) -> SyncResult<Owner> {
        let target = req.target;
        let mut last_err = None;
        for _ in 0..NAME_ATTEMPTS {
            let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
            let suffix = content_hash(&(target.meta.key(), req.now, seq))
                .map_err(|e| SyncError::Template(e.to_string()))?;
            let name = format!("{}-{}", target.meta.name, &suffix[..6]);
            let owner = Owner {
                meta: ObjectMeta::new(&target.meta.namespace, &name)
                    .with_label(LABEL_TARGET, &target.meta.name)
                    .with_label(LABEL_TEMPLATE_HASH, template_hash),
                spec: OwnerSpec {
                    kind: target.spec.kind,
                    target: target.meta.name.clone(),
                    replicas: 1,
                    template: target.spec.template.clone(),
                    template_hash: template_hash.to_string(),
                    ephemeral: req.ephemeral,
                },
                status: Default::default(),
            };
            match store.create_owner(owner) {
                Ok(created) => {
                    debug!(owner = %created.meta.key(), "owner created");
                    return Ok(created);
                }
                Err(SyncError::State(e @ StateError::AlreadyExists(_))) => {
                    last_err = Some(SyncError::State(e));
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| SyncError::Template("no owner name available".into())))
    }
}

#[cfg(test)]
mod tests {
    use rungrid_state::{
        AgentPhase, AgentSpec, ContainerState, OwnerKind, RUNNER_GUARD, RunnerScope,
        RunnerTemplate, ScaleTargetSpec,
    };

    use super::*;

    fn target(ephemeral: bool) -> ScaleTarget {
        ScaleTarget {
            meta: ObjectMeta::new("ci", "fleet"),
            spec: ScaleTargetSpec {
                scope: RunnerScope::repository("acme/api"),
                ephemeral,
                template: RunnerTemplate {
                    image: "runner:2".into(),
                    ..Default::default()
                },
                ..Default::default()
            },
            status: Default::default(),
        }
    }

    fn hash_of(t: &ScaleTarget) -> String {
        t.spec.template.hash().unwrap()
    }

    fn engine() -> OwnerSync {
        OwnerSync::new(Duration::from_secs(600), Duration::from_secs(600))
    }

    fn request(t: &ScaleTarget, desired: u32) -> SyncRequest<'_> {
        SyncRequest {
            target: t,
            desired,
            effective_time: None,
            ephemeral: t.spec.ephemeral,
            last_sync_time: None,
            now: Utc::now(),
        }
    }

    /// A materialized owner with one agent per phase in `agents`. `age`
    /// orders owners: larger is older.
    fn seed_owner(store: &StateStore, name: &str, hash: &str, age: i64, agents: &[AgentPhase]) {
        let mut meta = ObjectMeta::new("ci", name)
            .with_label(LABEL_TARGET, "fleet")
            .with_label(LABEL_TEMPLATE_HASH, hash);
        meta.creation_timestamp = Some(Utc::now() - chrono::Duration::minutes(age));
        store
            .create(Owner {
                meta,
                spec: OwnerSpec {
                    kind: OwnerKind::Deployment,
                    target: "fleet".into(),
                    replicas: agents.len() as u32,
                    template_hash: hash.into(),
                    ..Default::default()
                },
                status: rungrid_state::OwnerStatus {
                    observed_generation: 1,
                    replicas: agents.len() as u32,
                },
            })
            .unwrap();
        for (i, phase) in agents.iter().enumerate() {
            let mut meta = ObjectMeta::new("ci", &format!("{name}-{i}"))
                .with_label(LABEL_TARGET, "fleet")
                .with_label(LABEL_OWNER, name);
            meta.finalizers.push(RUNNER_GUARD.into());
            let mut agent = Agent {
                meta,
                spec: AgentSpec {
                    owner: name.into(),
                    target: "fleet".into(),
                    ..Default::default()
                },
                status: Default::default(),
            };
            agent.status.phase = *phase;
            if *phase == AgentPhase::Succeeded {
                agent.status.container = ContainerState::Terminated { exit_code: 0 };
            }
            store.create(agent).unwrap();
        }
    }

    fn owners(store: &StateStore) -> Vec<Owner> {
        store
            .list(Some("ci"), &LabelSelector::everything().with(LABEL_TARGET, "fleet"))
            .unwrap()
    }

    #[test]
    fn scale_up_from_nothing_creates_one_replica_owners() {
        let store = StateStore::open_in_memory().unwrap();
        let t = target(false);
        let report = engine().sync(&store, &request(&t, 3)).unwrap().unwrap();
        assert_eq!(report.created, 3);

        let created = owners(&store);
        assert_eq!(created.len(), 3);
        for o in &created {
            assert_eq!(o.spec.replicas, 1);
            assert_eq!(o.spec.template_hash, hash_of(&t));
            assert_eq!(o.meta.label(LABEL_TEMPLATE_HASH), Some(hash_of(&t).as_str()));
        }
    }

    #[test]
    fn unsynced_owner_skips_the_pass() {
        let store = StateStore::open_in_memory().unwrap();
        let t = target(false);
        engine().sync(&store, &request(&t, 1)).unwrap().unwrap();
        // The new owner has not been materialized yet.
        assert!(engine().sync(&store, &request(&t, 4)).unwrap().is_none());
        assert_eq!(owners(&store).len(), 1);
    }

    #[test]
    fn pending_agents_count_toward_desired() {
        let store = StateStore::open_in_memory().unwrap();
        let t = target(false);
        let h = hash_of(&t);
        seed_owner(&store, "a", &h, 3, &[AgentPhase::Pending]);
        seed_owner(&store, "b", &h, 2, &[AgentPhase::Running]);
        let report = engine().sync(&store, &request(&t, 2)).unwrap().unwrap();
        assert_eq!(report.created, 0);
        assert_eq!(report.drained, 0);
        assert_eq!(report.pending(), 1);
        assert_eq!(report.running(), 1);
    }

    #[test]
    fn scale_down_keeps_newest_owners() {
        let store = StateStore::open_in_memory().unwrap();
        let t = target(false);
        let h = hash_of(&t);
        seed_owner(&store, "oldest", &h, 30, &[AgentPhase::Running]);
        seed_owner(&store, "middle", &h, 20, &[AgentPhase::Running]);
        seed_owner(&store, "newest", &h, 10, &[AgentPhase::Running]);

        let report = engine().sync(&store, &request(&t, 1)).unwrap().unwrap();
        assert_eq!(report.drained, 2);

        let by_name = |n: &str| store.get::<Owner>("ci", n).unwrap().unwrap();
        assert!(by_name("oldest").meta.annotation(ANNOTATION_UNREGISTRATION_REQUEST).is_some());
        assert!(by_name("middle").meta.annotation(ANNOTATION_UNREGISTRATION_REQUEST).is_some());
        assert!(by_name("newest").meta.annotation(ANNOTATION_UNREGISTRATION_REQUEST).is_none());
        let agent: Agent = store.get("ci", "oldest-0").unwrap().unwrap();
        assert!(agent.meta.annotation(ANNOTATION_UNREGISTRATION_REQUEST).is_some());
        assert!(!agent.meta.is_deleting(), "deletion waits for unregistration");

        // Draining owners are not drained twice.
        let report = engine().sync(&store, &request(&t, 1)).unwrap().unwrap();
        assert_eq!(report.drained, 0);
    }

    #[test]
    fn owner_with_only_pending_agents_is_drained_first() {
        let store = StateStore::open_in_memory().unwrap();
        let t = target(false);
        let h = hash_of(&t);
        seed_owner(&store, "runs", &h, 30, &[AgentPhase::Running]);
        seed_owner(&store, "waits", &h, 5, &[AgentPhase::Pending]);
        let report = engine().sync(&store, &request(&t, 1)).unwrap().unwrap();
        assert_eq!(report.drained, 1);
        let waits: Owner = store.get("ci", "waits").unwrap().unwrap();
        assert!(waits.meta.annotation(ANNOTATION_UNREGISTRATION_REQUEST).is_some());
    }

    #[test]
    fn drain_progresses_to_deletion() {
        let store = StateStore::open_in_memory().unwrap();
        let t = target(false);
        let h = hash_of(&t);
        seed_owner(&store, "gone", &h, 30, &[AgentPhase::Running]);
        seed_owner(&store, "keep", &h, 10, &[AgentPhase::Running]);
        engine().sync(&store, &request(&t, 1)).unwrap().unwrap();

        // Not yet unregistered: the owner stays mid-drain.
        engine().sync(&store, &request(&t, 1)).unwrap().unwrap();
        let gone: Owner = store.get("ci", "gone").unwrap().unwrap();
        assert!(gone.meta.annotation(ANNOTATION_UNREGISTRATION_COMPLETE).is_none());

        store
            .modify::<Agent, _>("ci", "gone-0", |a| {
                a.meta
                    .annotations
                    .insert(ANNOTATION_UNREGISTRATION_COMPLETE.into(), Utc::now().to_rfc3339());
            })
            .unwrap();
        engine().sync(&store, &request(&t, 1)).unwrap().unwrap();
        let gone: Owner = store.get("ci", "gone").unwrap().unwrap();
        assert!(gone.meta.annotation(ANNOTATION_UNREGISTRATION_COMPLETE).is_some());

        let report = engine().sync(&store, &request(&t, 1)).unwrap().unwrap();
        assert_eq!(report.deleted, 1);
        assert!(store.get::<Owner>("ci", "gone").unwrap().is_none());
        let agent: Agent = store.get("ci", "gone-0").unwrap().unwrap();
        assert!(agent.meta.is_deleting(), "guard keeps the agent until released");
    }

    #[test]
    fn completed_owner_is_deleted_and_replaced() {
        let store = StateStore::open_in_memory().unwrap();
        let t = target(false);
        let h = hash_of(&t);
        seed_owner(&store, "done", &h, 10, &[AgentPhase::Succeeded]);
        let report = engine().sync(&store, &request(&t, 1)).unwrap().unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.created, 1);
        assert!(store.get::<Owner>("ci", "done").unwrap().is_none());
    }

    #[test]
    fn stale_hash_owners_are_replaced() {
        let store = StateStore::open_in_memory().unwrap();
        let t = target(false);
        seed_owner(&store, "old-a", "stale", 30, &[AgentPhase::Running]);
        seed_owner(&store, "old-b", "stale", 20, &[AgentPhase::Running]);

        let report = engine().sync(&store, &request(&t, 2)).unwrap().unwrap();
        assert_eq!(report.created, 2);
        assert_eq!(report.deleted, 2);
        let remaining = owners(&store);
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|o| o.spec.template_hash == hash_of(&t)));
        let agent: Agent = store.get("ci", "old-a-0").unwrap().unwrap();
        assert!(agent.meta.is_deleting());
    }

    #[test]
    fn ephemeral_recreation_waits_for_new_demand() {
        let store = StateStore::open_in_memory().unwrap();
        let t = target(true);
        let now = Utc::now();
        let mut req = request(&t, 2);
        req.effective_time = Some(now - chrono::Duration::minutes(5));
        req.last_sync_time = Some(now - chrono::Duration::minutes(1));
        req.now = now;
        assert!(engine().sync(&store, &req).unwrap().is_none());
        assert!(owners(&store).is_empty());

        // New demand after the last sync lifts the suppression.
        req.effective_time = Some(now);
        let report = engine().sync(&store, &req).unwrap().unwrap();
        assert_eq!(report.created, 2);
    }

    #[test]
    fn ephemeral_recreation_resumes_after_cooldown() {
        let store = StateStore::open_in_memory().unwrap();
        let t = target(true);
        let now = Utc::now();
        let mut req = request(&t, 1);
        req.effective_time = Some(now - chrono::Duration::minutes(30));
        req.last_sync_time = Some(now - chrono::Duration::minutes(11));
        req.now = now;
        let report = engine().sync(&store, &req).unwrap().unwrap();
        assert_eq!(report.created, 1);
    }
}
