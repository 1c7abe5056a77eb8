//! rungrid-lifecycle: runner registration and graceful unregistration.
//!
//! Every agent carries the runner guard finalizer from creation on, so a
//! deletion request only stamps a deletion time. The lifecycle controller
//! then decides whether the runner can go:
//!
//! ```text
//! deletion requested / drain requested
//!        │
//!        ▼
//!  safe_to_delete ──wait──▶ retry after the verdict's delay
//!        │
//!       safe
//!        ▼
//!  unregistration complete ──(deleting)──▶ guard removed, agent gone
//! ```
//!
//! Registration runs the other way: the controller hands out a
//! registration token, then looks the runner up by name at the provider
//! and records its ID.

pub mod controller;
pub mod error;
pub mod state;
pub mod unregister;

pub use controller::AgentLifecycle;
pub use error::{LifecycleError, LifecycleResult};
pub use state::RunnerState;
pub use unregister::{LifecycleTimings, SafeReason, Unregistrar, Verdict, WaitReason};
