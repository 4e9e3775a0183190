use std::time::Duration;
use thiserror::Error;

/// Failure of an external provider call (translation, analysis, routing).
///
/// Rate limits are terminal: retrying against a throttled provider only
/// worsens the condition, so the retry layer must break out immediately.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider rate limited")]
    RateLimited,

    #[error("provider request timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider call failed: {0}")]
    Other(String),
}

impl ProviderError {
    /// Terminal errors must never be retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProviderError::RateLimited)
    }
}

/// Failure of the translation flow, split by origin so the caller can
/// react differently: provider failures become user-facing notices,
/// datastore failures propagate (the caller fails open).
#[derive(Debug, Error)]
pub enum FlowError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("datastore unavailable: {0}")]
    Storage(#[from] anyhow::Error),
}

impl FlowError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FlowError::Provider(ProviderError::RateLimited))
    }
}
