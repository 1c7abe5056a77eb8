//! Owner materializer.
//!
//! Creates the agents an owner declares and reports what it observed back
//! on the owner status. Agents whose owner is gone get their deletion
//! requested.

use std::collections::HashSet;
use std::time::Duration;

use rungrid_state::{
    Agent, AgentSpec, LABEL_OWNER, LABEL_TARGET, LABEL_TEMPLATE_HASH, LabelSelector, ObjectMeta,
    Owner, RUNNER_GUARD, ScaleTarget, StateStore,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::owner::ReplicaOwner;
use crate::sync::OwnerStore;

pub struct OwnerMaterializer {
    store: StateStore,
}

impl OwnerMaterializer {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn reconcile_all(&self) -> anyhow::Result<()> {
        let owners: Vec<Owner> = self.store.list(None, &LabelSelector::everything())?;
        let known: HashSet<String> = owners.iter().map(|o| o.meta.key()).collect();

        for owner in owners {
            let key = owner.meta.key();
            if let Err(e) = self.materialize(owner) {
                warn!(owner = %key, error = %e, "owner materialization failed");
            }
        }

        let agents: Vec<Agent> = self.store.list(None, &LabelSelector::everything())?;
        for agent in agents {
            if agent.meta.is_deleting() {
                continue;
            }
            let owner_key = format!("{}/{}", agent.meta.namespace, agent.spec.owner);
            if !known.contains(&owner_key) {
                self.store
                    .delete::<Agent>(&agent.meta.namespace, &agent.meta.name)?;
                info!(agent = %agent.meta.key(), owner = %owner_key, "orphaned agent deletion requested");
            }
        }
        Ok(())
    }

    /// Bring one owner's agents in line with its spec.
    pub fn materialize(&self, owner: Owner) -> anyhow::Result<()> {
        let ns = owner.meta.namespace.clone();
        let Some(target) = self.store.get::<ScaleTarget>(&ns, &owner.spec.target)? else {
            warn!(owner = %owner.meta.key(), target = %owner.spec.target, "scale target gone, deleting owner");
            self.store.delete_owner(&owner)?;
            return Ok(());
        };

        let ro = ReplicaOwner::from(owner);
        let agents: Vec<Agent> = self.store.list(Some(&ns), &ro.agent_selector())?;
        let mut live: Vec<&Agent> = agents.iter().filter(|a| !a.meta.is_deleting()).collect();
        let mut live_count = live.len() as u32;
        let want = ro.owner().spec.replicas;
        let caught_up = ro.owner().status.observed_generation == ro.owner().meta.generation;

        if !ro.drain_requested() && (ro.replaces_lost_agents() || !caught_up) {
            let existing: HashSet<&str> = agents.iter().map(|a| a.meta.name.as_str()).collect();
            let missing: Vec<String> = match &ro {
                ReplicaOwner::StatefulSet(_) => (0..want)
                    .map(|i| ro.agent_name(i))
                    .filter(|n| !existing.contains(n.as_str()))
                    .collect(),
                ReplicaOwner::Deployment(_) => (0u32..)
                    .map(|i| ro.agent_name(i))
                    .filter(|n| !existing.contains(n.as_str()))
                    .take(want.saturating_sub(live_count) as usize)
                    .collect(),
            };
            for name in missing {
                self.store.create(new_agent(&ro, &target, &name))?;
                debug!(owner = %ro.owner().meta.key(), agent = %name, "agent created");
                live_count += 1;
            }
        }

        if live_count > want {
            live.sort_by(|a, b| b.meta.name.cmp(&a.meta.name));
            let excess = (live_count - want) as usize;
            for agent in live.iter().take(excess) {
                self.store.delete::<Agent>(&ns, &agent.meta.name)?;
                info!(agent = %agent.meta.key(), "excess agent deletion requested");
            }
            live_count = want;
        }

        let owner = ro.owner();
        if owner.status.observed_generation != owner.meta.generation
            || owner.status.replicas != live_count
        {
            let generation = owner.meta.generation;
            self.store.modify::<Owner, _>(&ns, &owner.meta.name, |o| {
                o.status.observed_generation = generation;
                o.status.replicas = live_count;
            })?;
        }
        Ok(())
    }

    /// Run the materializer until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "owner materializer started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.reconcile_all() {
                        error!(error = %e, "materializer pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("owner materializer shutting down");
                    break;
                }
            }
        }
    }
}

fn new_agent(owner: &ReplicaOwner, target: &ScaleTarget, name: &str) -> Agent {
    let o = owner.owner();
    let mut meta = ObjectMeta::new(&o.meta.namespace, name)
        .with_label(LABEL_TARGET, &o.spec.target)
        .with_label(LABEL_OWNER, &o.meta.name)
        .with_label(LABEL_TEMPLATE_HASH, owner.template_hash());
    meta.finalizers.push(RUNNER_GUARD.to_string());
    Agent {
        meta,
        spec: AgentSpec {
            owner: o.meta.name.clone(),
            target: o.spec.target.clone(),
            scope: target.spec.scope.clone(),
            group: target.spec.group.clone(),
            labels: target.spec.labels.clone(),
            ephemeral: o.spec.ephemeral,
            credential: target.spec.credential.clone(),
        },
        status: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use rungrid_state::{OwnerKind, OwnerSpec, RunnerScope, ScaleTargetSpec};

    use super::*;

    fn seed(store: &StateStore, kind: OwnerKind, replicas: u32) {
        store
            .create(ScaleTarget {
                meta: ObjectMeta::new("ci", "fleet"),
                spec: ScaleTargetSpec {
                    scope: RunnerScope::organization("acme"),
                    labels: vec!["gpu".into()],
                    ephemeral: true,
                    ..Default::default()
                },
                status: Default::default(),
            })
            .unwrap();
        store
            .create(Owner {
                meta: ObjectMeta::new("ci", "fleet-x").with_label(LABEL_TARGET, "fleet"),
                spec: OwnerSpec {
                    kind,
                    target: "fleet".into(),
                    replicas,
                    template_hash: "h".into(),
                    ephemeral: true,
                    ..Default::default()
                },
                status: Default::default(),
            })
            .unwrap();
    }

    fn owner(store: &StateStore) -> Owner {
        store.get("ci", "fleet-x").unwrap().unwrap()
    }

    fn agents(store: &StateStore) -> Vec<Agent> {
        store
            .list(Some("ci"), &LabelSelector::everything().with(LABEL_OWNER, "fleet-x"))
            .unwrap()
    }

    #[test]
    fn creates_guarded_agents_and_reports_status() {
        let store = StateStore::open_in_memory().unwrap();
        seed(&store, OwnerKind::Deployment, 2);
        let m = OwnerMaterializer::new(store.clone());
        m.reconcile_all().unwrap();

        let created = agents(&store);
        assert_eq!(created.len(), 2);
        let a = &created[0];
        assert!(a.meta.has_finalizer(RUNNER_GUARD));
        assert_eq!(a.meta.label(LABEL_TARGET), Some("fleet"));
        assert_eq!(a.spec.labels, vec!["gpu".to_string()]);
        assert!(a.spec.ephemeral);
        assert_eq!(a.spec.scope, RunnerScope::organization("acme"));

        let o = owner(&store);
        assert_eq!(o.status.observed_generation, o.meta.generation);
        assert_eq!(o.status.replicas, 2);
    }

    #[test]
    fn deployment_does_not_replace_lost_agents() {
        let store = StateStore::open_in_memory().unwrap();
        seed(&store, OwnerKind::Deployment, 1);
        let m = OwnerMaterializer::new(store.clone());
        m.reconcile_all().unwrap();
        let name = agents(&store)[0].meta.name.clone();

        // Guard removed and deleted: the agent is gone for good.
        let mut a: Agent = store.get("ci", &name).unwrap().unwrap();
        a.meta.finalizers.clear();
        store.update(a).unwrap();
        store.delete::<Agent>("ci", &name).unwrap();

        m.reconcile_all().unwrap();
        assert!(agents(&store).is_empty());
        assert_eq!(owner(&store).status.replicas, 0);
    }

    #[test]
    fn statefulset_recreates_missing_ordinals() {
        let store = StateStore::open_in_memory().unwrap();
        seed(&store, OwnerKind::StatefulSet, 2);
        let m = OwnerMaterializer::new(store.clone());
        m.reconcile_all().unwrap();

        let mut a: Agent = store.get("ci", "fleet-x-1").unwrap().unwrap();
        a.meta.finalizers.clear();
        store.update(a).unwrap();
        store.delete::<Agent>("ci", "fleet-x-1").unwrap();

        m.reconcile_all().unwrap();
        assert!(store.get::<Agent>("ci", "fleet-x-1").unwrap().is_some());
        assert_eq!(owner(&store).status.replicas, 2);
    }

    #[test]
    fn orphaned_agents_are_deleted() {
        let store = StateStore::open_in_memory().unwrap();
        seed(&store, OwnerKind::Deployment, 1);
        let m = OwnerMaterializer::new(store.clone());
        m.reconcile_all().unwrap();
        store.delete::<Owner>("ci", "fleet-x").unwrap();

        m.reconcile_all().unwrap();
        let orphan = &agents(&store)[0];
        assert!(orphan.meta.is_deleting());
    }

    #[test]
    fn owner_of_vanished_target_is_deleted() {
        let store = StateStore::open_in_memory().unwrap();
        seed(&store, OwnerKind::Deployment, 1);
        store.delete::<ScaleTarget>("ci", "fleet").unwrap();
        OwnerMaterializer::new(store.clone()).reconcile_all().unwrap();
        assert!(store.get::<Owner>("ci", "fleet-x").unwrap().is_none());
    }
}
