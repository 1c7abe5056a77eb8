//! Error types for owner synchronization.

use rungrid_state::StateError;
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("template hash: {0}")]
    Template(String),

    #[error("invalid scale target {target}: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error(transparent)]
    State(#[from] StateError),
}
