//! Consumed external collaborators, expressed as traits.
//!
//! The orchestration core never talks to a provider or billing API
//! directly; the embedding service wires concrete adapters in. Tests use
//! in-process fakes.

use crate::error::ProviderError;
use crate::models::{
    CommandDecision, LanguagePreference, SubscriptionStatus, TranslationRequest, TranslationResult,
};
use anyhow::Result;
use async_trait::async_trait;

/// Translation provider. Implementations return results filtered to the
/// requested candidate languages only.
#[async_trait]
pub trait TranslationPort: Send + Sync {
    async fn translate(
        &self,
        request: &TranslationRequest,
    ) -> Result<Vec<TranslationResult>, ProviderError>;
}

/// Free-text language-preference analyzer used during enrollment.
/// Returns `None` when the text carried no usable language statement.
#[async_trait]
pub trait LanguagePreferenceAnalyzer: Send + Sync {
    async fn analyze(&self, text: &str) -> Result<Option<LanguagePreference>, ProviderError>;
}

/// Black-box intent classifier for mention commands.
#[async_trait]
pub trait CommandRouter: Send + Sync {
    async fn decide(&self, text: &str) -> Result<CommandDecision, ProviderError>;
}

/// Billing provider surface: paid state plus a checkout URL for upgrades.
pub trait SubscriptionPort: Send + Sync {
    fn subscription(&self, tenant_id: &str) -> Result<SubscriptionStatus>;

    /// URL an unpaid tenant can follow to purchase. `None` when checkout
    /// is not configured.
    fn checkout_url(&self, tenant_id: &str) -> Option<String>;
}

/// Source-language detection used by the gateway to exclude the detected
/// language from translation targets. `None` means "unknown" and disables
/// filtering for that message.
pub trait LanguageDetector: Send + Sync {
    fn detect(&self, text: &str) -> Option<String>;
}
