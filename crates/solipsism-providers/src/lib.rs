//! LLM provider layer for Solipsism.
//!
//! # Architecture
//!
//! - [`traits::LlmProvider`] — trait that all providers implement
//! - [`traits::ProviderFactory`] — builds a provider per context
//! - [`registry`] — static specs for the supported providers + matching logic
//! - [`http_provider::HttpProvider`] — generic OpenAI-compatible HTTP client with retries
//! - [`factory::ConfiguredProviderFactory`] — factory driven by the loaded config

pub mod error;
pub mod factory;
pub mod http_provider;
pub mod registry;
pub mod traits;

pub use error::ProviderError;
pub use factory::ConfiguredProviderFactory;
pub use http_provider::{HttpProvider, RetryPolicy};
pub use registry::{ProviderConfig, ProviderSpec, PROVIDERS};
pub use traits::{LlmProvider, ModelSettings, ProviderFactory};
