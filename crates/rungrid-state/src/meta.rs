//! Object metadata shared by every persisted record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// ── Well-known keys ───────────────────────────────────────────────

/// Label linking owners and agents to their scale target.
pub const LABEL_TARGET: &str = "rungrid.io/target";
/// Label linking agents to their owner.
pub const LABEL_OWNER: &str = "rungrid.io/owner";
/// Label carrying the runner template hash.
pub const LABEL_TEMPLATE_HASH: &str = "rungrid.io/template-hash";

pub const ANNOTATION_RUNNER_ID: &str = "rungrid.io/runner-id";
pub const ANNOTATION_UNREGISTRATION_REQUEST: &str = "rungrid.io/unregistration-request-timestamp";
pub const ANNOTATION_UNREGISTRATION_COMPLETE: &str = "rungrid.io/unregistration-complete-timestamp";
pub const ANNOTATION_UNREGISTRATION_FAILURE: &str = "rungrid.io/unregistration-failure-message";
pub const ANNOTATION_WAIT_FOR_COMPLETION: &str = "rungrid.io/wait-for-completion-since";

/// Finalizer that keeps an agent alive until it is unregistered.
pub const RUNNER_GUARD: &str = "rungrid.io/runner-guard";

/// Kinds of object held in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    ScaleTarget,
    HorizontalAutoscaler,
    Owner,
    Agent,
    Credential,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::ScaleTarget => "scale_target",
            ObjectKind::HorizontalAutoscaler => "horizontal_autoscaler",
            ObjectKind::Owner => "owner",
            ObjectKind::Agent => "agent",
            ObjectKind::Credential => "credential",
        }
    }
}

/// Metadata common to all objects.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    /// Bumped on every write; updates must present the version they read.
    #[serde(default)]
    pub resource_version: u64,
    /// Bumped when `spec` changes.
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Composite `{namespace}/{name}` key.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Parse an RFC 3339 timestamp annotation.
    pub fn annotation_time(&self, key: &str) -> Option<DateTime<Utc>> {
        self.annotation(key)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.creation_timestamp.unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// A persisted object.
pub trait Object: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: ObjectKind;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

/// Implements [`Object`] for a struct with a `meta: ObjectMeta` field.
macro_rules! impl_object {
    ($ty:ty, $kind:expr) => {
        impl $crate::meta::Object for $ty {
            const KIND: $crate::meta::ObjectKind = $kind;

            fn meta(&self) -> &$crate::meta::ObjectMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut $crate::meta::ObjectMeta {
                &mut self.meta
            }
        }
    };
}
pub(crate) use impl_object;

/// Equality-based label selector. An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.match_labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

/// What happened to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchAction {
    Added,
    Modified,
    Deleted,
}

/// Change notification published by the store after each commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: ObjectKind,
    pub key: String,
    pub action: WatchAction,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_matches_subset() {
        let meta = ObjectMeta::new("ci", "a")
            .with_label(LABEL_TARGET, "fleet")
            .with_label(LABEL_OWNER, "fleet-1");

        assert!(LabelSelector::everything().matches(&meta.labels));
        assert!(LabelSelector::everything().with(LABEL_TARGET, "fleet").matches(&meta.labels));
        assert!(!LabelSelector::everything().with(LABEL_TARGET, "other").matches(&meta.labels));
        assert!(
            !LabelSelector::everything()
                .with(LABEL_TEMPLATE_HASH, "x")
                .matches(&meta.labels)
        );
    }

    #[test]
    fn annotation_time_parses_rfc3339() {
        let mut meta = ObjectMeta::new("ci", "a");
        meta.annotations.insert(
            ANNOTATION_UNREGISTRATION_REQUEST.to_string(),
            "2024-05-01T10:00:00Z".to_string(),
        );
        let t = meta.annotation_time(ANNOTATION_UNREGISTRATION_REQUEST).unwrap();
        assert_eq!(t.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert!(meta.annotation_time(ANNOTATION_RUNNER_ID).is_none());
    }

    #[test]
    fn key_is_namespace_slash_name() {
        assert_eq!(ObjectMeta::new("ci", "fleet").key(), "ci/fleet");
    }
}
