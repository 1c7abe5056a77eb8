//! Capacity reservation batching.
//!
//! Webhook handlers enqueue [`ScaleEvent`]s without blocking. One worker per
//! process, started on the first enqueue, groups events by autoscaler over a
//! fixed window and commits a single conditional update per autoscaler.
//! Conflicting writes are retried with capped exponential backoff; each
//! autoscaler's batch retries on its own schedule.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rungrid_state::{CapacityReservation, HorizontalAutoscaler, StateError, StateResult, StateStore};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Longest wait between retries of a conflicting batch.
const MAX_BACKOFF: Duration = Duration::from_secs(16);

/// One webhook-derived scaling request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleEvent {
    pub namespace: String,
    /// Name of the horizontal autoscaler.
    pub autoscaler: String,
    /// +n adds n unit reservations, -n removes the n oldest.
    pub amount: i32,
    /// Lifetime of reservations added by this event.
    pub duration: Duration,
}

impl ScaleEvent {
    fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.autoscaler)
    }
}

/// Result of planning one batch against the current reservations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    pub reservations: Vec<CapacityReservation>,
    /// Reservations beyond `max_replicas` whose window was moved to now.
    pub shifted: usize,
    pub expired: usize,
    pub added: usize,
    pub removed: usize,
}

fn add_duration(t: DateTime<Utc>, d: chrono::Duration) -> DateTime<Utc> {
    t.checked_add_signed(d).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Apply a batch of events to a reservation list.
///
/// 1. Reservations at positions `>= max_replicas` are waiting for capacity;
///    their window is restarted at `now`, keeping each one's own length.
/// 2. Expired reservations are dropped.
/// 3. Positive amounts append unit reservations expiring after the event's
///    duration.
/// 4. Negative amounts remove reservations from the front, never below
///    zero.
///
/// Events apply in arrival order, so mixed up and down events within one
/// window are order dependent.
pub fn plan_batch(
    current: &[CapacityReservation],
    events: &[ScaleEvent],
    max_replicas: Option<u32>,
    now: DateTime<Utc>,
) -> BatchPlan {
    let mut reservations = current.to_vec();

    let mut shifted = 0;
    if let Some(max) = max_replicas.and_then(|m| usize::try_from(m).ok())
        && reservations.len() > max
    {
        for r in &mut reservations[max..] {
            let length = r.expiration_time - r.effective_time;
            r.effective_time = now;
            r.expiration_time = add_duration(now, length);
            shifted += 1;
        }
    }

    let before = reservations.len();
    reservations.retain(|r| r.is_active(now));
    let expired = before - reservations.len();

    let mut added = 0;
    let mut removed = 0;
    for event in events {
        let amount = usize::try_from(event.amount.unsigned_abs()).unwrap_or(usize::MAX);
        if event.amount > 0 {
            let length = chrono::Duration::from_std(event.duration).unwrap_or(chrono::Duration::MAX);
            let expiration = add_duration(now, length);
            reservations.extend(std::iter::repeat_n(
                CapacityReservation::unit(now, expiration),
                amount,
            ));
            added += amount;
        } else if event.amount < 0 {
            let k = amount.min(reservations.len());
            reservations.drain(..k);
            removed += k;
        }
    }

    BatchPlan {
        reservations,
        shifted,
        expired,
        added,
        removed,
    }
}

/// Delay before retry number `attempt` (1-based): 1, 2, 4, 8, 16, 16, ... s.
pub fn backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(4);
    Duration::from_secs(1 << exp).min(MAX_BACKOFF)
}

struct PendingBatch {
    namespace: String,
    autoscaler: String,
    events: Vec<ScaleEvent>,
    attempts: u32,
    ready_at: Instant,
}

/// Front door of the batching pipeline.
pub struct BatchScaler {
    store: StateStore,
    interval: Duration,
    tx: mpsc::UnboundedSender<ScaleEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ScaleEvent>>>,
    worker: OnceLock<JoinHandle<()>>,
    shutdown: watch::Receiver<bool>,
}

impl BatchScaler {
    pub fn new(store: StateStore, interval: Duration, shutdown: watch::Receiver<bool>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            store,
            interval,
            tx,
            rx: Mutex::new(Some(rx)),
            worker: OnceLock::new(),
            shutdown,
        }
    }

    /// Queue an event. Never blocks; the worker starts on first use and
    /// must be called from within a Tokio runtime.
    pub fn enqueue(&self, event: ScaleEvent) {
        self.worker.get_or_init(|| self.spawn_worker());
        debug!(key = %event.key(), amount = event.amount, "scale event queued");
        if self.tx.send(event).is_err() {
            warn!("capacity batch worker has stopped; scale event dropped");
        }
    }

    pub fn is_started(&self) -> bool {
        self.worker.get().is_some()
    }

    fn spawn_worker(&self) -> JoinHandle<()> {
        let rx = self.rx.lock().take();
        let worker = Worker {
            store: self.store.clone(),
            interval: self.interval,
        };
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if let Some(rx) = rx {
                worker.run(rx, shutdown).await;
            }
        })
    }
}

struct Worker {
    store: StateStore,
    interval: Duration,
}

impl Worker {
    async fn run(
        &self,
        mut rx: mpsc::UnboundedReceiver<ScaleEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "capacity batch worker started"
        );
        let mut pending: HashMap<String, PendingBatch> = HashMap::new();

        loop {
            let deadline = pending.values().map(|b| b.ready_at).min();
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.add(&mut pending, event),
                    None => break,
                },
                _ = sleep_until(deadline) => self.flush_due(&mut pending),
                _ = shutdown.changed() => {
                    info!(pending = pending.len(), "capacity batch worker shutting down");
                    break;
                }
            }
        }
    }

    fn add(&self, pending: &mut HashMap<String, PendingBatch>, event: ScaleEvent) {
        let interval = self.interval;
        pending
            .entry(event.key())
            .or_insert_with(|| PendingBatch {
                namespace: event.namespace.clone(),
                autoscaler: event.autoscaler.clone(),
                events: Vec::new(),
                attempts: 0,
                ready_at: Instant::now() + interval,
            })
            .events
            .push(event);
    }

    fn flush_due(&self, pending: &mut HashMap<String, PendingBatch>) {
        let now = Instant::now();
        let due: Vec<String> = pending
            .iter()
            .filter(|(_, b)| b.ready_at <= now)
            .map(|(k, _)| k.clone())
            .collect();

        for key in due {
            let Some(mut batch) = pending.remove(&key) else {
                continue;
            };
            match self.commit(&batch) {
                Ok(()) => {}
                Err(StateError::NotFound(_)) => {
                    warn!(%key, events = batch.events.len(), "autoscaler gone, dropping scale events");
                }
                Err(e) => {
                    batch.attempts += 1;
                    let delay = backoff(batch.attempts);
                    warn!(
                        %key,
                        attempt = batch.attempts,
                        retry_in_secs = delay.as_secs(),
                        error = %e,
                        "capacity batch not committed, will retry"
                    );
                    batch.ready_at = now + delay;
                    pending.insert(key, batch);
                }
            }
        }
    }

    /// One read-modify-write of the autoscaler's reservations.
    fn commit(&self, batch: &PendingBatch) -> StateResult<()> {
        let key = format!("{}/{}", batch.namespace, batch.autoscaler);
        let mut hra: HorizontalAutoscaler = self
            .store
            .get(&batch.namespace, &batch.autoscaler)?
            .ok_or_else(|| StateError::NotFound(key.clone()))?;

        let plan = plan_batch(
            &hra.spec.capacity_reservations,
            &batch.events,
            hra.spec.max_replicas,
            Utc::now(),
        );
        let total = plan.reservations.len();
        hra.spec.capacity_reservations = plan.reservations;
        self.store.update(hra)?;

        info!(
            autoscaler = %key,
            events = batch.events.len(),
            added = plan.added,
            removed = plan.removed,
            expired = plan.expired,
            shifted = plan.shifted,
            reservations = total,
            "capacity reservations updated"
        );
        Ok(())
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rungrid_state::{AutoscalerSpec, ObjectMeta};

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn mins(m: i64) -> chrono::Duration {
        chrono::Duration::minutes(m)
    }

    fn event(amount: i32) -> ScaleEvent {
        ScaleEvent {
            namespace: "ci".into(),
            autoscaler: "fleet-hra".into(),
            amount,
            duration: Duration::from_secs(600),
        }
    }

    /// Reservations created `age` minutes apart, each lasting 30 minutes.
    fn reservations(n: usize) -> Vec<CapacityReservation> {
        (0..n)
            .map(|i| {
                let start = t0() - mins(10) + mins(i as i64);
                CapacityReservation::unit(start, start + mins(30))
            })
            .collect()
    }

    #[test]
    fn appends_unit_reservations() {
        let plan = plan_batch(&[], &[event(1), event(2)], Some(10), t0());
        assert_eq!(plan.added, 3);
        assert_eq!(plan.reservations.len(), 3);
        for r in &plan.reservations {
            assert_eq!(r.replicas, 1);
            assert_eq!(r.effective_time, t0());
            assert_eq!(r.expiration_time, t0() + mins(10));
        }
    }

    #[test]
    fn removes_from_front() {
        let current = reservations(5);
        let plan = plan_batch(&current, &[event(-2)], None, t0());
        assert_eq!(plan.removed, 2);
        assert_eq!(plan.reservations, current[2..].to_vec());
    }

    #[test]
    fn removal_never_goes_below_zero() {
        let current = reservations(2);
        let plan = plan_batch(&current, &[event(-5)], None, t0());
        assert!(plan.reservations.is_empty());
        assert_eq!(plan.removed, 2);
    }

    #[test]
    fn drops_expired() {
        let mut current = reservations(2);
        current.push(CapacityReservation::unit(t0() - mins(60), t0() - mins(1)));
        let plan = plan_batch(&current, &[], None, t0());
        assert_eq!(plan.expired, 1);
        assert_eq!(plan.reservations.len(), 2);
    }

    #[test]
    fn overflow_shift_keeps_each_window_length() {
        let mut current = reservations(2);
        // Waiting behind max_replicas = 2 with distinct lengths.
        current.push(CapacityReservation::unit(t0() - mins(50), t0() - mins(5)));
        current.push(CapacityReservation::unit(t0() - mins(3), t0() + mins(17)));

        let plan = plan_batch(&current, &[], Some(2), t0());
        assert_eq!(plan.shifted, 2);
        assert_eq!(plan.expired, 0);
        assert_eq!(plan.reservations.len(), 4);
        assert_eq!(plan.reservations[..2], current[..2]);

        let third = plan.reservations[2];
        assert_eq!(third.effective_time, t0());
        assert_eq!(third.expiration_time - third.effective_time, mins(45));
        let fourth = plan.reservations[3];
        assert_eq!(fourth.expiration_time - fourth.effective_time, mins(20));
    }

    #[test]
    fn zero_amount_changes_nothing_but_overflow_times() {
        let current = reservations(3);
        let plan = plan_batch(&current, &[event(0)], Some(5), t0());
        assert_eq!(plan.reservations, current);

        let plan = plan_batch(&current, &[event(0)], Some(1), t0());
        assert_eq!(plan.reservations.len(), 3);
        assert_eq!(plan.reservations[0], current[0]);
        assert_eq!(plan.reservations[1].effective_time, t0());
        assert!(plan.reservations.iter().all(|r| r.replicas == 1));
    }

    #[test]
    fn order_of_mixed_events_matters() {
        // Removing first finds nothing to remove, so the addition survives.
        let down_then_up = plan_batch(&[], &[event(-1), event(1)], None, t0());
        assert_eq!(down_then_up.reservations.len(), 1);
        assert_eq!(down_then_up.removed, 0);

        // Adding first gives the removal something to take.
        let up_then_down = plan_batch(&[], &[event(1), event(-1)], None, t0());
        assert!(up_then_down.reservations.is_empty());
        assert_eq!(up_then_down.removed, 1);
    }

    #[test]
    fn backoff_is_capped() {
        let delays: Vec<u64> = (1..=7).map(|a| backoff(a).as_secs()).collect();
        assert_eq!(delays, [1, 2, 4, 8, 16, 16, 16]);
    }

    #[tokio::test]
    async fn burst_commits_once() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .create(HorizontalAutoscaler {
                meta: ObjectMeta::new("ci", "fleet-hra"),
                spec: AutoscalerSpec {
                    target: "fleet".into(),
                    max_replicas: Some(10),
                    ..Default::default()
                },
                status: Default::default(),
            })
            .unwrap();

        let (_tx, shutdown) = watch::channel(false);
        let scaler = BatchScaler::new(store.clone(), Duration::from_millis(50), shutdown);
        assert!(!scaler.is_started());
        for _ in 0..3 {
            scaler.enqueue(event(1));
        }
        assert!(scaler.is_started());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let hra: HorizontalAutoscaler = store.get("ci", "fleet-hra").unwrap().unwrap();
        assert_eq!(hra.spec.capacity_reservations.len(), 3);
        // Created at version 1, one patch.
        assert_eq!(hra.meta.resource_version, 2);
    }

    #[tokio::test]
    async fn missing_autoscaler_is_dropped() {
        let store = StateStore::open_in_memory().unwrap();
        let (_tx, shutdown) = watch::channel(false);
        let scaler = BatchScaler::new(store.clone(), Duration::from_millis(20), shutdown);
        scaler.enqueue(event(1));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.get::<HorizontalAutoscaler>("ci", "fleet-hra").unwrap().is_none());
    }
}
