//! Builds providers from the loaded configuration.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use solipsism_core::config::Config;

use crate::error::ProviderError;
use crate::http_provider::{HttpProvider, RetryPolicy};
use crate::registry::{fill_keys_from_env, match_provider, ProviderConfig};
use crate::traits::{LlmProvider, ModelSettings, ProviderFactory};

/// [`ProviderFactory`] backed by the provider section of [`Config`].
///
/// Each call builds a fresh [`HttpProvider`], so contexts never share
/// per-model settings.
#[derive(Clone, Debug)]
pub struct ConfiguredProviderFactory {
    providers: HashMap<String, ProviderConfig>,
    default_model: String,
    default_temperature: f64,
    max_tokens: u32,
    retry: RetryPolicy,
}

impl ConfiguredProviderFactory {
    /// Providers from `config`, with missing API keys taken from the
    /// providers' usual environment variables.
    pub fn from_config(config: &Config) -> Self {
        let mut factory = Self::from_config_only(config);
        fill_keys_from_env(&mut factory.providers);
        factory
    }

    /// Providers exactly as `config` lists them.
    pub fn from_config_only(config: &Config) -> Self {
        let defaults = &config.agents.defaults;
        Self {
            providers: config.providers.to_map(),
            default_model: defaults.model.clone(),
            default_temperature: defaults.temperature,
            max_tokens: defaults.max_tokens,
            retry: RetryPolicy::from(&config.llm),
        }
    }

    /// Build an [`HttpProvider`] for `settings`, resolving defaults.
    pub fn create(&self, settings: &ModelSettings) -> Result<HttpProvider, ProviderError> {
        let model = settings.model.as_deref().unwrap_or(&self.default_model);
        let (config, spec) = match_provider(model, &self.providers)
            .ok_or_else(|| ProviderError::NotConfigured(model.to_string()))?;

        debug!(
            provider = spec.display_name,
            model = model,
            api_base = config.api_base.as_deref().unwrap_or(spec.default_api_base),
            "Creating LLM provider"
        );

        Ok(HttpProvider::new(config, spec, model)
            .with_temperature(settings.temperature.unwrap_or(self.default_temperature))
            .with_max_tokens(self.max_tokens)
            .with_retry(self.retry.clone()))
    }
}

impl ProviderFactory for ConfiguredProviderFactory {
    fn build(&self, settings: &ModelSettings) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        Ok(Arc::new(self.create(settings)?))
    }
}
