//! Error types for replica computation.

use rungrid_provider::ProviderError;
use rungrid_state::StateError;
use thiserror::Error;

pub type AutoscaleResult<T> = Result<T, AutoscaleError>;

#[derive(Debug, Error)]
pub enum AutoscaleError {
    /// The autoscaler declaration cannot be evaluated as written. Not
    /// retried; surfaced on the autoscaler status.
    #[error("invalid autoscaler: {0}")]
    Input(String),

    /// A metric needs provider access but no client is available.
    #[error("no provider client available for metric evaluation")]
    NoProvider,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl AutoscaleError {
    pub fn input(msg: impl Into<String>) -> Self {
        AutoscaleError::Input(msg.into())
    }

    pub fn is_input_error(&self) -> bool {
        matches!(self, AutoscaleError::Input(_))
    }
}
