//! rungrid-provider: CI provider access.
//!
//! Defines the [`Provider`] interface the control loops consume, its GitHub
//! REST implementation, and the [`ClientCache`] that hands out one client
//! per credential.

pub mod cache;
pub mod error;
pub mod github;
pub mod provider;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod fake;

pub use cache::{ClientCache, GithubFactory, ProviderFactory};
pub use error::{ProviderError, ProviderResult};
pub use github::{DEFAULT_API_URL, GithubClient};
pub use provider::Provider;
pub use types::*;
