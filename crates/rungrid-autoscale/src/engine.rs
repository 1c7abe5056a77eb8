//! Desired-replica computation.
//!
//! ```text
//! min        = active scheduled override, else spec min (default 1)
//! suggested  = metric suggestion (queue depth, utilization fallback), else min
//! reserved   = Σ replicas of unexpired capacity reservations
//! desired    = clamp(suggested + reserved, min, max)
//!
//! if desired < previous and now < last_scale_out + scale_down_delay:
//!     desired = previous
//! ```
//!
//! Scale-out applies immediately and refreshes `last_scale_out`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rungrid_provider::Provider;
use rungrid_state::{
    Agent, DecisionSummary, HorizontalAutoscaler, MetricKind, MetricSpec, OverridePeriod,
    ScaleTarget,
};
use tracing::debug;

use crate::error::{AutoscaleError, AutoscaleResult};
use crate::metrics::{UtilizationRule, busy_runners, queue_depth};
use crate::schedule::match_overrides;

const DEFAULT_MIN_REPLICAS: u32 = 1;

/// Outcome of one computation for one autoscaler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub desired: u32,
    /// Metric suggestion; `None` when no metric applied.
    pub suggested: Option<i64>,
    pub reserved: u32,
    pub min: u32,
    pub max: u32,
    /// Set while a lower desired count is being held back.
    pub scale_down_delay_until: Option<DateTime<Utc>>,
    pub active_override: Option<OverridePeriod>,
    pub upcoming_override: Option<OverridePeriod>,
    /// Desired grew; `last_scale_out_time` should move to now.
    pub scaled_out: bool,
    pub computed_at: DateTime<Utc>,
}

impl Decision {
    pub fn summary(&self) -> DecisionSummary {
        DecisionSummary {
            suggested: self.suggested.unwrap_or(i64::from(self.min)),
            reserved: self.reserved,
            min_replicas: self.min,
            max_replicas: self.max,
            desired: self.desired,
            computed_at: self.computed_at,
        }
    }
}

/// Receives every decision for observability. Errors are logged by the
/// caller and never abort a computation.
pub trait DecisionSink: Send + Sync {
    fn record(&self, autoscaler: &HorizontalAutoscaler, decision: &Decision) -> anyhow::Result<()>;
}

/// Process-wide decision counters rendered on `/metrics`.
#[derive(Debug, Default)]
pub struct DecisionCounters {
    decisions: AtomicU64,
    scale_outs: AtomicU64,
    held_scale_downs: AtomicU64,
}

impl DecisionCounters {
    pub fn decisions(&self) -> u64 {
        self.decisions.load(Ordering::Relaxed)
    }

    pub fn scale_outs(&self) -> u64 {
        self.scale_outs.load(Ordering::Relaxed)
    }

    pub fn held_scale_downs(&self) -> u64 {
        self.held_scale_downs.load(Ordering::Relaxed)
    }
}

impl DecisionSink for DecisionCounters {
    fn record(&self, _autoscaler: &HorizontalAutoscaler, decision: &Decision) -> anyhow::Result<()> {
        self.decisions.fetch_add(1, Ordering::Relaxed);
        if decision.scaled_out {
            self.scale_outs.fetch_add(1, Ordering::Relaxed);
        }
        if decision.scale_down_delay_until.is_some() {
            self.held_scale_downs.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// Everything one computation reads.
pub struct DecisionInput<'a> {
    pub target: &'a ScaleTarget,
    pub autoscaler: &'a HorizontalAutoscaler,
    /// Agents of the target, for the utilization metric.
    pub agents: &'a [Agent],
    pub now: DateTime<Utc>,
}

pub struct DecisionEngine {
    default_scale_down_delay: Duration,
}

impl DecisionEngine {
    pub fn new(default_scale_down_delay: Duration) -> Self {
        Self {
            default_scale_down_delay,
        }
    }

    /// Compute the desired replica count. `provider` is only consulted when
    /// a metric needs it.
    pub async fn compute(
        &self,
        input: &DecisionInput<'_>,
        provider: Option<&dyn Provider>,
    ) -> AutoscaleResult<Decision> {
        let hra = input.autoscaler;
        let spec = &hra.spec;
        let now = input.now;

        let max = spec
            .max_replicas
            .ok_or_else(|| AutoscaleError::input("max_replicas is required"))?;
        let spec_min = spec.min_replicas.unwrap_or(DEFAULT_MIN_REPLICAS);
        if spec_min > max {
            return Err(AutoscaleError::input(format!(
                "min_replicas {spec_min} is greater than max_replicas {max}"
            )));
        }

        let overrides = match_overrides(&spec.scheduled_overrides, now);
        // An override never lifts the floor above the ceiling.
        let min = overrides.min_replicas.unwrap_or(spec_min).min(max);

        let suggested = self.suggest(input, provider).await?;
        let reserved: u32 = spec
            .capacity_reservations
            .iter()
            .filter(|r| r.is_active(now))
            .map(|r| r.replicas)
            .sum();

        let raw = suggested.unwrap_or(i64::from(min)) + i64::from(reserved);
        let mut desired = clamp(raw, min, max);

        let previous = hra.status.desired_replicas;
        let delay = spec
            .scale_down_delay_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_scale_down_delay);
        let mut scale_down_delay_until = None;
        if let (Some(prev), Some(last_out)) = (previous, hra.status.last_scale_out_time)
            && desired < prev
        {
            let until = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| last_out.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            if until > now {
                // The held count still honors bounds lowered since the scale-out.
                let held = prev.clamp(min, max);
                debug!(
                    autoscaler = %hra.meta.key(),
                    computed = desired,
                    held,
                    %until,
                    "scale-down delayed"
                );
                scale_down_delay_until = Some(until);
                desired = held;
            }
        }

        let scaled_out = match previous {
            Some(prev) => desired > prev,
            None => desired > 1,
        };

        Ok(Decision {
            desired,
            suggested,
            reserved,
            min,
            max,
            scale_down_delay_until,
            active_override: overrides.active,
            upcoming_override: overrides.upcoming,
            scaled_out,
            computed_at: now,
        })
    }

    /// Metric suggestion, or `None` when the autoscaler is driven by
    /// reservations alone.
    async fn suggest(
        &self,
        input: &DecisionInput<'_>,
        provider: Option<&dyn Provider>,
    ) -> AutoscaleResult<Option<i64>> {
        let spec = &input.autoscaler.spec;
        let default_metric;
        let metrics: &[MetricSpec] = match spec.metrics.len() {
            0 if spec.scale_up_triggers.is_empty() => {
                default_metric = [MetricSpec::new(MetricKind::QueuedAndInProgressJobs)];
                &default_metric
            }
            0 => return Ok(None),
            1 | 2 => &spec.metrics,
            n => {
                return Err(AutoscaleError::input(format!(
                    "at most 2 metrics are supported, got {n}"
                )));
            }
        };

        if let [primary, fallback] = metrics
            && (primary.kind != MetricKind::QueuedAndInProgressJobs
                || fallback.kind != MetricKind::RunnersBusy)
        {
            return Err(AutoscaleError::input(format!(
                "metric {:?} cannot be combined with fallback {:?}; the only supported pair is queued-and-in-progress-jobs then runners-busy",
                primary.kind, fallback.kind
            )));
        }
        // Validate the fallback up front so a bad declaration is reported
        // even while the primary suggestion is positive.
        if let Some(fallback) = metrics.get(1) {
            UtilizationRule::from_metric(fallback)?;
        }

        let provider = provider.ok_or(AutoscaleError::NoProvider)?;
        let primary = self.evaluate(&metrics[0], input, provider).await?;
        if primary > 0 {
            return Ok(Some(primary));
        }
        match metrics.get(1) {
            Some(fallback) => Ok(Some(self.evaluate(fallback, input, provider).await?)),
            None => Ok(Some(primary)),
        }
    }

    async fn evaluate(
        &self,
        metric: &MetricSpec,
        input: &DecisionInput<'_>,
        provider: &dyn Provider,
    ) -> AutoscaleResult<i64> {
        match metric.kind {
            MetricKind::QueuedAndInProgressJobs => {
                let counts = queue_depth(provider, input.target, metric).await?;
                Ok(counts.necessary_replicas())
            }
            MetricKind::RunnersBusy => {
                let rule = UtilizationRule::from_metric(metric)?;
                let counts = busy_runners(provider, input.target, input.agents).await?;
                let previous = input
                    .autoscaler
                    .status
                    .desired_replicas
                    .or(input.target.spec.replicas)
                    .unwrap_or(1);
                let suggested = rule.suggest(counts.busy + counts.terminating_busy, previous);
                debug!(
                    target = %input.target.meta.key(),
                    registered = counts.registered,
                    busy = counts.busy,
                    terminating_busy = counts.terminating_busy,
                    previous,
                    suggested,
                    "utilization evaluated"
                );
                Ok(suggested)
            }
        }
    }
}

fn clamp(value: i64, min: u32, max: u32) -> u32 {
    let clamped = value.clamp(i64::from(min), i64::from(max));
    u32::try_from(clamped).unwrap_or(max)
}
