//! Job duration from provider logs.
//!
//! Completed jobs get their log fetched in the background; the span between
//! the first and last timestamped lines is emitted as a structured event.
//! Nothing here affects the webhook response.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rungrid_provider::Provider;
use tracing::{debug, info};

fn line_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let token = line.split_whitespace().next()?;
    // Logs may start with a byte order mark.
    let token = token.trim_start_matches('\u{feff}');
    DateTime::parse_from_rfc3339(token)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Time between the first and last timestamped lines of `log`.
pub fn job_duration(log: &str) -> Option<Duration> {
    let mut stamps = log.lines().filter_map(line_timestamp);
    let first = stamps.next()?;
    let last = stamps.last().unwrap_or(first);
    Some(last - first)
}

/// Fetch the job's log and report its duration.
pub async fn report_job_duration(provider: Arc<dyn Provider>, repository: String, job_id: i64) {
    let log = match provider.job_logs(&repository, job_id).await {
        Ok(log) => log,
        Err(e) => {
            debug!(repository, job_id, error = %e, "job log unavailable");
            return;
        }
    };
    match job_duration(&log) {
        Some(d) => info!(
            repository,
            job_id,
            job_duration_secs = d.num_seconds(),
            "job completed"
        ),
        None => debug!(repository, job_id, "job log has no timestamps"),
    }
}

#[cfg(test)]
mod tests {
    use rungrid_provider::fake::FakeProvider;

    use super::*;

    const LOG: &str = "\u{feff}2024-05-01T12:00:00.1234567Z Requested labels: self-hosted\n\
        2024-05-01T12:00:03.0000000Z Job defined at: acme/api/.github/workflows/ci.yml\n\
        continuation without a timestamp\n\
        2024-05-01T12:02:30.5000000Z Cleaning up orphan processes\n";

    #[test]
    fn duration_spans_first_to_last_stamp() {
        let d = job_duration(LOG).unwrap();
        assert_eq!(d.num_seconds(), 150);
    }

    #[test]
    fn log_without_stamps_has_no_duration() {
        assert!(job_duration("no timestamps here\n").is_none());
        assert_eq!(
            job_duration("2024-05-01T12:00:00Z only line").unwrap(),
            Duration::zero()
        );
    }

    #[tokio::test]
    async fn missing_log_is_tolerated() {
        let provider: Arc<dyn Provider> = Arc::new(FakeProvider::new());
        report_job_duration(provider, "acme/api".into(), 9).await;
    }
}
