use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, InstanceError>;

/// Errors raised while resolving a tenant-scoped instance.
///
/// `Clone` so a single failed construction can be handed to every caller
/// that was waiting on it.
#[derive(Debug, Clone, Error)]
pub enum InstanceError {
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl InstanceError {
    pub fn rejected(target: &str, status: u16) -> Self {
        Self::UpstreamUnavailable(format!("{} rejected the credentials (status {})", target, status))
    }

    pub fn is_invalid_credential(&self) -> bool {
        matches!(self, Self::InvalidCredential(_))
    }

    pub fn is_upstream_unavailable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable(_))
    }
}

impl From<validator::ValidationErrors> for InstanceError {
    fn from(e: validator::ValidationErrors) -> Self {
        Self::InvalidCredential(e.to_string())
    }
}

impl From<sqlx::Error> for InstanceError {
    fn from(e: sqlx::Error) -> Self {
        Self::UpstreamUnavailable(e.to_string())
    }
}

impl From<reqwest::Error> for InstanceError {
    fn from(e: reqwest::Error) -> Self {
        Self::UpstreamUnavailable(e.to_string())
    }
}

impl From<Arc<InstanceError>> for InstanceError {
    fn from(e: Arc<InstanceError>) -> Self {
        Arc::unwrap_or_clone(e)
    }
}
