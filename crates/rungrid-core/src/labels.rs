//! Runner label matching.
//!
//! One matcher is shared by webhook target resolution and the queue-depth
//! metric so both agree on which jobs a runner fleet can pick up.

use std::collections::BTreeSet;

/// Label every self-hosted runner implicitly carries.
pub const SELF_HOSTED: &str = "self-hosted";

/// Returns true when a job requesting `requested` labels is served by a
/// fleet declaring `provided` labels.
///
/// Comparison is case-insensitive and exact over the label sets, except
/// that `self-hosted` is ignored on both sides: it is always satisfied.
pub fn labels_match<R, P>(requested: &[R], provided: &[P]) -> bool
where
    R: AsRef<str>,
    P: AsRef<str>,
{
    normalize(requested) == normalize(provided)
}

fn normalize<S: AsRef<str>>(labels: &[S]) -> BTreeSet<String> {
    labels
        .iter()
        .map(|l| l.as_ref().trim().to_ascii_lowercase())
        .filter(|l| !l.is_empty() && l != SELF_HOSTED)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_hosted_is_implicit() {
        assert!(labels_match(&["self-hosted", "custom"], &["custom"]));
        assert!(labels_match(&["custom"], &["self-hosted", "custom"]));
    }

    #[test]
    fn bare_self_hosted_does_not_match_custom_fleet() {
        assert!(!labels_match(&["self-hosted"], &["custom"]));
    }

    #[test]
    fn bare_self_hosted_matches_unlabelled_fleet() {
        let none: [&str; 0] = [];
        assert!(labels_match(&["self-hosted"], &none));
    }

    #[test]
    fn case_insensitive() {
        assert!(labels_match(&["Self-Hosted", "GPU"], &["gpu"]));
    }

    #[test]
    fn missing_label_fails() {
        assert!(!labels_match(&["self-hosted", "linux", "gpu"], &["linux"]));
        assert!(!labels_match(&["linux"], &["linux", "gpu"]));
    }
}
