//! Webhook target resolution.
//!
//! Maps a job to the scale target that would run it. Targets are looked up
//! by routing key, most specific first: the repository, then (for
//! organization-owned repositories) the organization and enterprise
//! default groups, then custom runner groups the repository may use. At
//! every step the target's labels must match the job's.

use rungrid_core::labels_match;
use rungrid_provider::{GroupLevel, Provider};
use rungrid_state::{HorizontalAutoscaler, LabelSelector, ScaleTarget, StateStore};
use tracing::debug;

/// Where a job came from and what it asked for.
#[derive(Debug, Clone)]
pub struct JobOrigin<'a> {
    /// `owner/repo`.
    pub repository: &'a str,
    /// Owner login; the organization for organization-owned repositories.
    pub owner: &'a str,
    /// Personal account repositories can only use repository runners.
    pub owner_is_user: bool,
    pub enterprise: Option<&'a str>,
    pub labels: &'a [String],
}

/// Find the scale target serving `job`. Custom groups are queried from
/// `provider` when one is configured; without it every custom group of the
/// organization or enterprise is assumed visible.
pub async fn resolve_target(
    store: &StateStore,
    provider: Option<&dyn Provider>,
    job: &JobOrigin<'_>,
) -> anyhow::Result<Option<ScaleTarget>> {
    let targets: Vec<ScaleTarget> = store
        .list::<ScaleTarget>(None, &LabelSelector::everything())?
        .into_iter()
        .filter(|t| !t.meta.is_deleting() && t.spec.scope.is_valid())
        .collect();

    if let Some(t) = find_by_key(&targets, job.repository, job.labels) {
        return Ok(Some(t.clone()));
    }
    if job.owner_is_user {
        debug!(repository = job.repository, "user-owned repository has no repository target");
        return Ok(None);
    }

    if let Some(t) = find_by_key(&targets, job.owner, job.labels) {
        return Ok(Some(t.clone()));
    }
    if let Some(ent) = job.enterprise
        && let Some(t) = find_by_key(&targets, &format!("enterprises/{ent}"), job.labels)
    {
        return Ok(Some(t.clone()));
    }

    let Some(provider) = provider else {
        let found = targets.iter().find(|t| {
            let scope = &t.spec.scope;
            let in_scope = scope.organization.as_deref() == Some(job.owner)
                || (job.enterprise.is_some() && scope.enterprise.as_deref() == job.enterprise);
            t.spec.group.is_some() && in_scope && labels_match(job.labels, &t.spec.labels)
        });
        return Ok(found.cloned());
    };

    let groups = provider
        .runner_groups_for_repository(job.owner, job.repository)
        .await?;
    for group in groups {
        let key = match (group.level, job.enterprise) {
            (GroupLevel::Organization, _) => format!("{}/group/{}", job.owner, group.name),
            (GroupLevel::Enterprise, Some(ent)) => format!("enterprises/{ent}/group/{}", group.name),
            (GroupLevel::Enterprise, None) => continue,
        };
        if let Some(t) = find_by_key(&targets, &key, job.labels) {
            return Ok(Some(t.clone()));
        }
    }
    Ok(None)
}

fn find_by_key<'t>(
    targets: &'t [ScaleTarget],
    key: &str,
    labels: &[String],
) -> Option<&'t ScaleTarget> {
    targets.iter().find(|t| {
        t.spec.scope.routing_key(t.spec.group.as_deref()) == key
            && labels_match(labels, &t.spec.labels)
    })
}

/// The autoscaler driving `target`, if any.
pub fn autoscaler_for(
    store: &StateStore,
    target: &ScaleTarget,
) -> anyhow::Result<Option<HorizontalAutoscaler>> {
    let autoscalers: Vec<HorizontalAutoscaler> =
        store.list(Some(&target.meta.namespace), &LabelSelector::everything())?;
    Ok(autoscalers
        .into_iter()
        .find(|h| h.spec.target == target.meta.name && !h.meta.is_deleting()))
}
