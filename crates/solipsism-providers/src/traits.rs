//! LLM provider traits — what a context needs from a model backend.

use std::sync::Arc;

use async_trait::async_trait;
use solipsism_core::types::Message;

use crate::error::ProviderError;

/// Per-context model selection. Unset fields fall back to the configured
/// agent defaults.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelSettings {
    pub model: Option<String>,
    pub temperature: Option<f64>,
}

/// Trait that all LLM providers must implement.
///
/// The main implementation is `HttpProvider`, which handles any
/// OpenAI-compatible API.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate the next assistant message for `history`.
    ///
    /// Never fails: transport and API errors are retried where sensible and
    /// otherwise returned as an assistant message whose text is an
    /// `<error>…</error>` element. A message with no text part means the
    /// model returned nothing usable.
    async fn generate(&self, history: &[Message]) -> Message;

    /// Model identifier as configured.
    fn model(&self) -> &str;

    /// Display name for logging.
    fn display_name(&self) -> &str;
}

/// Builds a fresh provider for a newly created context.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, settings: &ModelSettings) -> Result<Arc<dyn LlmProvider>, ProviderError>;
}
