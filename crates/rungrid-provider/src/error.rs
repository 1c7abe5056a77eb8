//! Error types for provider calls.

use rungrid_state::StateError;
use thiserror::Error;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Non-2xx response from the provider API.
    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to decode provider response: {0}")]
    Decode(String),

    /// Missing or unusable credential content.
    #[error("credential error: {0}")]
    Credential(String),

    #[error("invalid runner scope: {0}")]
    InvalidScope(String),

    #[error(transparent)]
    State(#[from] StateError),
}

impl ProviderError {
    fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The runner is still executing a job and cannot be removed.
    pub fn is_busy(&self) -> bool {
        matches!(self.status(), Some(409 | 422))
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    pub fn is_rate_limited(&self) -> bool {
        match self {
            ProviderError::Api { status: 429, .. } => true,
            ProviderError::Api {
                status: 403,
                message,
            } => message.to_ascii_lowercase().contains("rate limit"),
            _ => false,
        }
    }

    /// Authentication or permission failure that retrying will not fix.
    pub fn is_forbidden(&self) -> bool {
        match self.status() {
            Some(401) => true,
            Some(403) => !self.is_rate_limited(),
            _ => false,
        }
    }

    /// Worth retrying later: network trouble, rate limits and 5xx.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transport(_))
            || self.is_rate_limited()
            || self.status().is_some_and(|s| s >= 500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16, message: &str) -> ProviderError {
        ProviderError::Api {
            status,
            message: message.to_string(),
        }
    }

    #[test]
    fn classifies_busy_runner() {
        assert!(api(422, "Runner is still running a job").is_busy());
        assert!(api(409, "conflict").is_busy());
        assert!(!api(404, "Not Found").is_busy());
    }

    #[test]
    fn rate_limit_is_not_forbidden() {
        let err = api(403, "API rate limit exceeded for installation");
        assert!(err.is_rate_limited());
        assert!(!err.is_forbidden());
        assert!(err.is_transient());

        let err = api(403, "Resource not accessible by integration");
        assert!(!err.is_rate_limited());
        assert!(err.is_forbidden());
        assert!(!err.is_transient());
    }

    #[test]
    fn server_errors_are_transient() {
        assert!(api(502, "bad gateway").is_transient());
        assert!(ProviderError::Transport("reset".into()).is_transient());
        assert!(!ProviderError::Decode("eof".into()).is_transient());
    }
}
