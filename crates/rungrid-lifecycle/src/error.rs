//! Error types for the runner lifecycle.

use rungrid_provider::ProviderError;
use rungrid_state::StateError;
use thiserror::Error;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The agent has a provider ID but no client can reach the provider.
    #[error("no provider client for agent {0}")]
    NoClient(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    State(#[from] StateError),
}
