//! Autoscale control loop.
//!
//! Every tick, each horizontal autoscaler is evaluated against its scale
//! target. The decision is written back to the autoscaler status and the
//! target's replica count, each with conflict retry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rungrid_provider::ClientCache;
use rungrid_state::{
    Agent, HorizontalAutoscaler, LABEL_TARGET, LabelSelector, ScaleTarget, StateStore,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::engine::{Decision, DecisionEngine, DecisionInput, DecisionSink};

pub struct AutoscaleController {
    store: StateStore,
    clients: Arc<ClientCache>,
    engine: DecisionEngine,
    sink: Arc<dyn DecisionSink>,
    /// Autoscalers seen last tick, with the credential their client came from.
    known: HashMap<String, (String, Option<String>)>,
}

impl AutoscaleController {
    pub fn new(
        store: StateStore,
        clients: Arc<ClientCache>,
        engine: DecisionEngine,
        sink: Arc<dyn DecisionSink>,
    ) -> Self {
        Self {
            store,
            clients,
            engine,
            sink,
            known: HashMap::new(),
        }
    }

    fn dependent(hra: &HorizontalAutoscaler) -> String {
        format!("autoscaler/{}", hra.meta.key())
    }

    /// Evaluate every autoscaler once. Returns how many produced a decision.
    pub async fn reconcile_all(&mut self) -> anyhow::Result<usize> {
        let autoscalers: Vec<HorizontalAutoscaler> =
            self.store.list(None, &LabelSelector::everything())?;
        let mut seen = HashMap::new();
        let mut decided = 0;

        for hra in &autoscalers {
            if hra.meta.is_deleting() {
                continue;
            }
            match self.reconcile(hra, &mut seen).await {
                Ok(Some(_)) => decided += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(autoscaler = %hra.meta.key(), error = %e, "autoscaler evaluation failed");
                }
            }
        }

        // Drop client references held for autoscalers that vanished or
        // moved to another credential.
        for (key, held) in &self.known {
            if seen.get(key) != Some(held) {
                let (namespace, credential) = held;
                self.clients
                    .release(namespace, credential.as_deref(), &format!("autoscaler/{key}"));
            }
        }
        self.known = seen;
        Ok(decided)
    }

    /// Evaluate one autoscaler and persist the outcome. Returns `None` when
    /// the autoscaler could not be evaluated as declared; the reason is
    /// written to its status.
    async fn reconcile(
        &self,
        hra: &HorizontalAutoscaler,
        seen: &mut HashMap<String, (String, Option<String>)>,
    ) -> anyhow::Result<Option<Decision>> {
        let ns = hra.meta.namespace.as_str();
        let Some(target) = self.store.get::<ScaleTarget>(ns, &hra.spec.target)? else {
            self.record_error(hra, format!("scale target {} not found", hra.spec.target))?;
            return Ok(None);
        };

        let selector = LabelSelector::everything().with(LABEL_TARGET, &target.meta.name);
        let agents: Vec<Agent> = self.store.list(Some(ns), &selector)?;

        let credential = target.spec.credential.clone();
        let provider = match self
            .clients
            .resolve(ns, credential.as_deref(), &Self::dependent(hra))
        {
            Ok(p) => Some(p),
            Err(e) => {
                debug!(autoscaler = %hra.meta.key(), error = %e, "no provider client");
                None
            }
        };
        seen.insert(hra.meta.key(), (ns.to_string(), credential));

        let input = DecisionInput {
            target: &target,
            autoscaler: hra,
            agents: &agents,
            now: Utc::now(),
        };
        let decision = match self.engine.compute(&input, provider.as_deref()).await {
            Ok(d) => d,
            Err(e) if e.is_input_error() => {
                warn!(autoscaler = %hra.meta.key(), error = %e, "autoscaler declaration rejected");
                self.record_error(hra, e.to_string())?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = self.sink.record(hra, &decision) {
            warn!(autoscaler = %hra.meta.key(), error = %e, "decision sink failed");
        }

        self.persist(hra, &target, &decision)?;
        Ok(Some(decision))
    }

    fn persist(
        &self,
        hra: &HorizontalAutoscaler,
        target: &ScaleTarget,
        decision: &Decision,
    ) -> anyhow::Result<()> {
        let ns = hra.meta.namespace.as_str();
        let previous = hra.status.desired_replicas;
        let now = decision.computed_at;

        self.store
            .modify::<HorizontalAutoscaler, _>(ns, &hra.meta.name, |h| {
                h.status.desired_replicas = Some(decision.desired);
                if decision.scaled_out {
                    h.status.last_scale_out_time = Some(now);
                }
                h.status.active_override = decision.active_override.clone();
                h.status.upcoming_override = decision.upcoming_override.clone();
                h.status.last_decision = Some(decision.summary());
                h.status.last_error = None;
            })?;

        if previous != Some(decision.desired) {
            info!(
                autoscaler = %hra.meta.key(),
                previous = ?previous,
                desired = decision.desired,
                suggested = ?decision.suggested,
                reserved = decision.reserved,
                min = decision.min,
                max = decision.max,
                "desired replicas changed"
            );
        }

        let effective_time = hra
            .spec
            .capacity_reservations
            .iter()
            .map(|r| r.effective_time)
            .max();
        if target.spec.replicas != Some(decision.desired)
            || target.spec.effective_time != effective_time
        {
            self.store
                .modify::<ScaleTarget, _>(ns, &target.meta.name, |t| {
                    t.spec.replicas = Some(decision.desired);
                    t.spec.effective_time = effective_time;
                })?;
            debug!(target = %target.meta.key(), replicas = decision.desired, "scale target updated");
        }
        Ok(())
    }

    fn record_error(&self, hra: &HorizontalAutoscaler, message: String) -> anyhow::Result<()> {
        if hra.status.last_error.as_deref() == Some(message.as_str()) {
            return Ok(());
        }
        self.store
            .modify::<HorizontalAutoscaler, _>(&hra.meta.namespace, &hra.meta.name, |h| {
                h.status.last_error = Some(message.clone());
            })?;
        Ok(())
    }

    /// Run the autoscale loop until shutdown.
    pub async fn run(&mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "autoscale controller started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.reconcile_all().await {
                        error!(error = %e, "autoscale pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscale controller shutting down");
                    break;
                }
            }
        }
    }
}
