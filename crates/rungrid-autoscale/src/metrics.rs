//! Replica suggestions from provider signals.
//!
//! Two metrics are supported: the number of queued and in-progress jobs the
//! fleet could pick up, and the fraction of the fleet's runners that are
//! busy.

use std::collections::HashSet;

use rungrid_core::labels_match;
use rungrid_provider::{Provider, RunStatus};
use rungrid_state::{Agent, ANNOTATION_UNREGISTRATION_REQUEST, MetricSpec, ScaleTarget};
use tracing::{debug, warn};

use crate::error::{AutoscaleError, AutoscaleResult};

pub const DEFAULT_SCALE_UP_THRESHOLD: f64 = 0.8;
pub const DEFAULT_SCALE_DOWN_THRESHOLD: f64 = 0.3;
pub const DEFAULT_SCALE_UP_FACTOR: f64 = 1.3;
pub const DEFAULT_SCALE_DOWN_FACTOR: f64 = 0.7;

/// Job counts observed while evaluating the queue-depth metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub queued: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub unknown: i64,
}

impl QueueCounts {
    fn count(&mut self, status: RunStatus) {
        match status {
            RunStatus::Queued => self.queued += 1,
            RunStatus::InProgress => self.in_progress += 1,
            RunStatus::Completed => self.completed += 1,
            _ => self.unknown += 1,
        }
    }

    pub fn necessary_replicas(&self) -> i64 {
        self.queued + self.in_progress
    }
}

/// Repositories polled for the queue-depth metric.
pub fn queue_repositories(target: &ScaleTarget, metric: &MetricSpec) -> AutoscaleResult<Vec<String>> {
    let scope = &target.spec.scope;
    if let Some(repo) = &scope.repository {
        return Ok(vec![repo.clone()]);
    }
    let Some(owner) = scope.organization.as_ref().or(scope.enterprise.as_ref()) else {
        return Err(AutoscaleError::input("scale target has no runner scope"));
    };
    if metric.repository_names.is_empty() {
        return Err(AutoscaleError::input(
            "repository_names is required for the queue-depth metric of an organization or enterprise runner fleet",
        ));
    }
    Ok(metric
        .repository_names
        .iter()
        .map(|name| {
            if name.contains('/') {
                name.clone()
            } else {
                format!("{owner}/{name}")
            }
        })
        .collect())
}

/// Sum of queued and in-progress jobs the target's runners could take.
///
/// With target labels, each run is expanded to its jobs and only jobs whose
/// labels match the target count; a run with no listed jobs counts as one.
/// Without target labels every run counts once.
pub async fn queue_depth(
    provider: &dyn Provider,
    target: &ScaleTarget,
    metric: &MetricSpec,
) -> AutoscaleResult<QueueCounts> {
    let repos = queue_repositories(target, metric)?;
    let expand_jobs = !target.spec.labels.is_empty();
    let mut counts = QueueCounts::default();

    for repo in &repos {
        for status in [RunStatus::Queued, RunStatus::InProgress] {
            let runs = provider.list_workflow_runs(repo, status).await?;
            for run in runs {
                if !expand_jobs || run.id == 0 {
                    counts.count(run.status);
                    continue;
                }
                let jobs = match provider.list_workflow_jobs(repo, run.id).await {
                    Ok(jobs) => jobs,
                    Err(e) => {
                        warn!(%repo, run_id = run.id, error = %e, "failed to list workflow jobs");
                        continue;
                    }
                };
                if jobs.is_empty() {
                    counts.count(run.status);
                    continue;
                }
                for job in jobs {
                    if job.labels.is_empty() {
                        debug!(%repo, job_id = job.id, "skipping job without labels");
                        continue;
                    }
                    if labels_match(&job.labels, &target.spec.labels) {
                        counts.count(job.status);
                    }
                }
            }
        }
    }

    debug!(
        target = %target.meta.key(),
        queued = counts.queued,
        in_progress = counts.in_progress,
        completed = counts.completed,
        unknown = counts.unknown,
        "queue depth evaluated"
    );
    Ok(counts)
}

/// Parsed thresholds and step rules of a utilization metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UtilizationRule {
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub scale_up: Step,
    pub scale_down: Step,
}

/// How far one scaling step moves the replica count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    Adjustment(u32),
    Factor(f64),
}

fn parse_ratio(value: Option<&str>, field: &str, default: f64) -> AutoscaleResult<f64> {
    match value {
        None | Some("") => Ok(default),
        Some(v) => v
            .trim()
            .parse::<f64>()
            .map_err(|_| AutoscaleError::input(format!("{field} {v:?} cannot be parsed as a number"))),
    }
}

fn parse_step(
    adjustment: Option<u32>,
    factor: Option<&str>,
    direction: &str,
    default_factor: f64,
) -> AutoscaleResult<Step> {
    let factor = factor.filter(|f| !f.is_empty());
    match (adjustment.filter(|a| *a > 0), factor) {
        (Some(_), Some(_)) => Err(AutoscaleError::input(format!(
            "scale_{direction}_adjustment and scale_{direction}_factor cannot be specified together"
        ))),
        (Some(a), None) => Ok(Step::Adjustment(a)),
        (None, f) => Ok(Step::Factor(parse_ratio(
            f,
            &format!("scale_{direction}_factor"),
            default_factor,
        )?)),
    }
}

impl UtilizationRule {
    pub fn from_metric(metric: &MetricSpec) -> AutoscaleResult<Self> {
        Ok(Self {
            scale_up_threshold: parse_ratio(
                metric.scale_up_threshold.as_deref(),
                "scale_up_threshold",
                DEFAULT_SCALE_UP_THRESHOLD,
            )?,
            scale_down_threshold: parse_ratio(
                metric.scale_down_threshold.as_deref(),
                "scale_down_threshold",
                DEFAULT_SCALE_DOWN_THRESHOLD,
            )?,
            scale_up: parse_step(
                metric.scale_up_adjustment,
                metric.scale_up_factor.as_deref(),
                "up",
                DEFAULT_SCALE_UP_FACTOR,
            )?,
            scale_down: parse_step(
                metric.scale_down_adjustment,
                metric.scale_down_factor.as_deref(),
                "down",
                DEFAULT_SCALE_DOWN_FACTOR,
            )?,
        })
    }

    /// Next replica count given the busy runner count and the previous
    /// desired count.
    pub fn suggest(&self, busy: u32, previous: u32) -> i64 {
        let prev = i64::from(previous);
        if previous == 0 {
            return prev;
        }
        let fraction = f64::from(busy) / f64::from(previous);
        if fraction >= self.scale_up_threshold {
            match self.scale_up {
                Step::Adjustment(a) => prev + i64::from(a),
                Step::Factor(f) => (f64::from(previous) * f).ceil() as i64,
            }
        } else if fraction < self.scale_down_threshold {
            match self.scale_down {
                Step::Adjustment(a) => prev - i64::from(a),
                Step::Factor(f) => (f64::from(previous) * f).floor() as i64,
            }
        } else {
            prev
        }
    }
}

/// Busy runner counts for the target's agents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusyCounts {
    pub registered: u32,
    pub busy: u32,
    /// Agents already asked to unregister whose runner is still busy.
    pub terminating_busy: u32,
}

/// Count busy runners among the target's agents by matching provider
/// runner names to agent names.
pub async fn busy_runners(
    provider: &dyn Provider,
    target: &ScaleTarget,
    agents: &[Agent],
) -> AutoscaleResult<BusyCounts> {
    let runners = provider.list_runners(&target.spec.scope).await?;
    let terminating: HashSet<&str> = agents
        .iter()
        .filter(|a| {
            a.meta.is_deleting() || a.meta.annotation(ANNOTATION_UNREGISTRATION_REQUEST).is_some()
        })
        .map(|a| a.meta.name.as_str())
        .collect();
    let names: HashSet<&str> = agents.iter().map(|a| a.meta.name.as_str()).collect();

    let mut counts = BusyCounts::default();
    for runner in runners.iter().filter(|r| names.contains(r.name.as_str())) {
        counts.registered += 1;
        if !runner.busy {
            continue;
        }
        if terminating.contains(runner.name.as_str()) {
            counts.terminating_busy += 1;
        } else {
            counts.busy += 1;
        }
    }
    Ok(counts)
}
