//! rungrid-autoscale: desired-replica decisions for scale targets.
//!
//! Each horizontal autoscaler is evaluated on a fixed interval. Metrics
//! come from the CI provider; capacity reservations come from webhook
//! events batched through [`BatchScaler`].
//!
//! # Decision Algorithm
//!
//! ```text
//! min       = active scheduled override min (capped at max), else spec min
//! suggested = queue depth (queued + in_progress runs or matching jobs)
//!             falling back to busy-runner utilization when queue <= 0
//! reserved  = Σ replicas of capacity reservations not yet expired
//! desired   = clamp(suggested + reserved, min, max)
//!
//! if desired < previous and now < last_scale_out + scale_down_delay:
//!     desired = previous          // hold scale-down
//! ```
//!
//! Webhook scale events for one autoscaler are coalesced over a short
//! batch window and committed in a single status update.

pub mod batch;
pub mod controller;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod schedule;

pub use batch::{BatchScaler, ScaleEvent};
pub use controller::AutoscaleController;
pub use engine::{Decision, DecisionCounters, DecisionEngine, DecisionInput, DecisionSink};
pub use error::{AutoscaleError, AutoscaleResult};
pub use schedule::{OverrideMatch, match_overrides};
