//! Target sync loop.
//!
//! Runs one owner sync pass per scale target per tick and writes the
//! aggregate counts back to the target status. Store changes to targets,
//! owners and agents trigger a pass without waiting for the tick.

use std::time::Duration;

use chrono::Utc;
use rungrid_state::{LabelSelector, ObjectKind, ScaleTarget, StateStore};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::SyncError;
use crate::sync::{OwnerSync, SyncReport, SyncRequest};

/// Replica count used when a target declares none.
const DEFAULT_REPLICAS: u32 = 1;

pub struct TargetSyncController {
    store: StateStore,
    sync: OwnerSync,
}

impl TargetSyncController {
    pub fn new(store: StateStore, sync: OwnerSync) -> Self {
        Self { store, sync }
    }

    /// Sync every target once. Returns how many passes ran to completion.
    pub fn reconcile_all(&self) -> anyhow::Result<usize> {
        let targets: Vec<ScaleTarget> = self.store.list(None, &LabelSelector::everything())?;
        let mut completed = 0;
        for target in &targets {
            if target.meta.is_deleting() {
                continue;
            }
            match self.reconcile(target) {
                Ok(Some(_)) => completed += 1,
                Ok(None) => {}
                Err(e) => warn!(target = %target.meta.key(), error = %e, "target sync failed"),
            }
        }
        Ok(completed)
    }

    pub fn reconcile(&self, target: &ScaleTarget) -> anyhow::Result<Option<SyncReport>> {
        if !target.spec.scope.is_valid() {
            return Err(SyncError::InvalidTarget {
                target: target.meta.key(),
                reason: "exactly one of enterprise, organization or repository must be set".into(),
            }
            .into());
        }

        let desired = target.spec.replicas.unwrap_or(DEFAULT_REPLICAS);
        let now = Utc::now();
        let req = SyncRequest {
            target,
            desired,
            effective_time: target.spec.effective_time,
            ephemeral: target.spec.ephemeral,
            last_sync_time: target.status.last_sync_time,
            now,
        };
        let Some(report) = self.sync.sync(&self.store, &req)? else {
            return Ok(None);
        };

        let running = report.running();
        let current = running + report.pending();
        // The sync time moves when this pass acted on demand, or when newer
        // demand arrived since the last stamp.
        let newer_demand = target
            .spec
            .effective_time
            .is_some_and(|et| target.status.last_sync_time.is_none_or(|ls| ls < et));
        let stamp = report.created > 0 || newer_demand;

        let status = &target.status;
        if status.desired_replicas != desired
            || status.current_replicas != current
            || status.ready_replicas != running
            || stamp
        {
            self.store
                .modify::<ScaleTarget, _>(&target.meta.namespace, &target.meta.name, |t| {
                    t.status.desired_replicas = desired;
                    t.status.current_replicas = current;
                    t.status.ready_replicas = running;
                    if stamp {
                        t.status.last_sync_time = Some(now);
                    }
                })?;
        }
        Ok(Some(report))
    }

    /// Run the target sync loop until shutdown. Besides the periodic tick,
    /// a pass runs as soon as a target, owner or agent changes.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "target sync controller started");
        let mut events = self.store.subscribe();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                event = events.recv() => match event {
                    Ok(e) if !wakes_sync(e.kind) => continue,
                    Ok(e) => debug!(kind = e.kind.as_str(), key = %e.key, "state changed, syncing"),
                    // The store owns the sender, so only lag is possible here.
                    Err(e) => debug!(error = %e, "watch stream interrupted, syncing"),
                },
                _ = shutdown.changed() => {
                    info!("target sync controller shutting down");
                    break;
                }
            }

            // Changes queued while waiting are covered by this pass.
            loop {
                match events.try_recv() {
                    Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                    Err(_) => break,
                }
            }
            if let Err(e) = self.reconcile_all() {
                error!(error = %e, "target sync pass failed");
            }
        }
    }
}

fn wakes_sync(kind: ObjectKind) -> bool {
    matches!(kind, ObjectKind::ScaleTarget | ObjectKind::Owner | ObjectKind::Agent)
}

#[cfg(test)]
mod tests {
    use rungrid_state::{
        Agent, AgentPhase, LABEL_TARGET, ObjectMeta, Owner, RunnerScope, ScaleTargetSpec,
    };

    use super::*;
    use crate::materializer::OwnerMaterializer;

    fn controller(store: &StateStore) -> TargetSyncController {
        TargetSyncController::new(
            store.clone(),
            OwnerSync::new(Duration::from_secs(600), Duration::from_secs(600)),
        )
    }

    fn seed_target(store: &StateStore, replicas: u32, scope: RunnerScope) {
        store
            .create(ScaleTarget {
                meta: ObjectMeta::new("ci", "fleet"),
                spec: ScaleTargetSpec {
                    scope,
                    replicas: Some(replicas),
                    ..Default::default()
                },
                status: Default::default(),
            })
            .unwrap();
    }

    fn target(store: &StateStore) -> ScaleTarget {
        store.get("ci", "fleet").unwrap().unwrap()
    }

    #[test]
    fn sync_and_materialize_converge() {
        let store = StateStore::open_in_memory().unwrap();
        seed_target(&store, 2, RunnerScope::repository("acme/api"));
        let sync = controller(&store);
        let materializer = OwnerMaterializer::new(store.clone());

        assert_eq!(sync.reconcile_all().unwrap(), 1);
        let t = target(&store);
        assert_eq!(t.status.desired_replicas, 2);
        assert!(t.status.last_sync_time.is_some());

        materializer.reconcile_all().unwrap();
        let agents: Vec<Agent> = store
            .list(Some("ci"), &LabelSelector::everything().with(LABEL_TARGET, "fleet"))
            .unwrap();
        assert_eq!(agents.len(), 2);
        for a in &agents {
            store
                .modify::<Agent, _>("ci", &a.meta.name, |a| a.status.phase = AgentPhase::Running)
                .unwrap();
        }

        let report = sync.reconcile(&target(&store)).unwrap().unwrap();
        assert_eq!(report.created, 0);
        let t = target(&store);
        assert_eq!(t.status.current_replicas, 2);
        assert_eq!(t.status.ready_replicas, 2);

        let owners: Vec<Owner> = store.list(Some("ci"), &LabelSelector::everything()).unwrap();
        assert_eq!(owners.len(), 2);
    }

    #[test]
    fn invalid_scope_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        seed_target(&store, 1, RunnerScope::default());
        let err = controller(&store).reconcile(&target(&store)).unwrap_err();
        assert!(err.to_string().contains("exactly one"));
        assert_eq!(controller(&store).reconcile_all().unwrap(), 0);
    }

    #[tokio::test]
    async fn loop_wakes_on_target_change() {
        let store = StateStore::open_in_memory().unwrap();
        let sync = controller(&store);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            sync.run(Duration::from_secs(3600), rx).await;
        });
        // Let the loop subscribe before the first write.
        tokio::time::sleep(Duration::from_millis(50)).await;

        seed_target(&store, 1, RunnerScope::repository("acme/api"));
        let mut owners: Vec<Owner> = Vec::new();
        for _ in 0..40 {
            owners = store.list(Some("ci"), &LabelSelector::everything()).unwrap();
            if !owners.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(owners.len(), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn only_replica_objects_wake_sync() {
        assert!(wakes_sync(ObjectKind::Agent));
        assert!(wakes_sync(ObjectKind::ScaleTarget));
        assert!(!wakes_sync(ObjectKind::HorizontalAutoscaler));
        assert!(!wakes_sync(ObjectKind::Credential));
    }
}
