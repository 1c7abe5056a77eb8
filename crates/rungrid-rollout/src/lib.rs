//! rungrid-rollout: owner synchronization and rolling replacement.
//!
//! Keeps each scale target's owners at the desired replica count. Owners
//! are created one replica at a time, drained oldest-first on scale-down and
//! replaced when the runner template hash changes.
//!
//! # Components
//!
//! - **`owner`**: owner kinds (deployment-like, statefulset-like) and
//!   agent classification
//! - **`sync`**: the sync pass and the `OwnerStore` seam it writes through
//! - **`controller`**: per-target sync loop, aggregate status
//! - **`materializer`**: creates the agents each owner declares

pub mod controller;
pub mod error;
pub mod materializer;
pub mod owner;
pub mod sync;

pub use controller::TargetSyncController;
pub use error::{SyncError, SyncResult};
pub use materializer::OwnerMaterializer;
pub use owner::{OwnerAgents, ReplicaOwner, classify};
pub use sync::{OwnerStore, OwnerSync, SyncReport, SyncRequest};
