//! Configuration schema.
//!
//! Hierarchy: `Config` → `AgentsConfig`, `ProvidersConfig`, `LlmConfig`,
//! `ToolsConfig`.
//!
//! JSON on disk uses **camelCase** keys; Rust uses snake_case.
//! We use `#[serde(rename_all = "camelCase")]` to handle the conversion.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ─────────────────────────────────────────────
// Root Config
// ─────────────────────────────────────────────

/// Root configuration, loaded from `~/.solipsism/config.json` + env vars.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub agents: AgentsConfig,
    pub providers: ProvidersConfig,
    pub llm: LlmConfig,
    pub tools: ToolsConfig,
}

// ─────────────────────────────────────────────
// Agents
// ─────────────────────────────────────────────

/// Agent configuration container.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsConfig {
    pub defaults: AgentDefaults,
}

/// Settings applied to every context unless the creating context overrides
/// them.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentDefaults {
    /// Directory that file and shell tools operate in.
    pub workspace: String,
    /// Default LLM model identifier.
    pub model: String,
    /// Maximum tokens to generate per response.
    pub max_tokens: u32,
    /// Sampling temperature (0.0 – 2.0).
    pub temperature: f64,
    /// Turn budget for contexts created by other contexts.
    pub max_turns: u32,
    /// Pause between turns, in seconds.
    pub turn_sleep: f64,
    /// How long a turn waits for the first tool result, in seconds.
    pub result_timeout_secs: u64,
    /// Base prompt used when a new context doesn't name one.
    /// Empty means `<data dir>/prompts/root_prompt.lpml`.
    pub prompt_path: String,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            workspace: "~/.solipsism/workspace".to_string(),
            model: "gemini/gemini-2.5-flash".to_string(),
            max_tokens: 8192,
            temperature: 0.7,
            max_turns: 100,
            turn_sleep: 5.0,
            result_timeout_secs: 30,
            prompt_path: String::new(),
        }
    }
}

// ─────────────────────────────────────────────
// Providers
// ─────────────────────────────────────────────

/// Configuration for a single LLM provider (API key, base URL, headers).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    /// API key for authentication.
    #[serde(default)]
    pub api_key: String,
    /// Custom API base URL (overrides provider default).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    /// Extra HTTP headers to send with each request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_headers: Option<HashMap<String, String>>,
}

impl ProviderConfig {
    /// Whether this provider has a configured API key.
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }
}

/// All provider configurations.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub anthropic: ProviderConfig,
    #[serde(default)]
    pub openai: ProviderConfig,
    #[serde(default)]
    pub openrouter: ProviderConfig,
    #[serde(default)]
    pub deepseek: ProviderConfig,
    #[serde(default)]
    pub groq: ProviderConfig,
    #[serde(default)]
    pub gemini: ProviderConfig,
    #[serde(default)]
    pub vllm: ProviderConfig,
}

impl ProvidersConfig {
    /// Get a provider config by name (e.g. `"gemini"`).
    pub fn get_by_name(&self, name: &str) -> Option<&ProviderConfig> {
        match name {
            "anthropic" => Some(&self.anthropic),
            "openai" => Some(&self.openai),
            "openrouter" => Some(&self.openrouter),
            "deepseek" => Some(&self.deepseek),
            "groq" => Some(&self.groq),
            "gemini" => Some(&self.gemini),
            "vllm" => Some(&self.vllm),
            _ => None,
        }
    }

    /// Mutable access by name, used by env overrides.
    pub fn get_by_name_mut(&mut self, name: &str) -> Option<&mut ProviderConfig> {
        match name {
            "anthropic" => Some(&mut self.anthropic),
            "openai" => Some(&mut self.openai),
            "openrouter" => Some(&mut self.openrouter),
            "deepseek" => Some(&mut self.deepseek),
            "groq" => Some(&mut self.groq),
            "gemini" => Some(&mut self.gemini),
            "vllm" => Some(&mut self.vllm),
            _ => None,
        }
    }

    /// Convert to a map for use with the provider registry.
    pub fn to_map(&self) -> HashMap<String, ProviderConfig> {
        PROVIDER_NAMES
            .iter()
            .filter_map(|name| {
                self.get_by_name(name)
                    .map(|cfg| (name.to_string(), cfg.clone()))
            })
            .collect()
    }
}

/// Names accepted by [`ProvidersConfig::get_by_name`].
pub const PROVIDER_NAMES: &[&str] = &[
    "anthropic",
    "openai",
    "openrouter",
    "deepseek",
    "groq",
    "gemini",
    "vllm",
];

// ─────────────────────────────────────────────
// LLM transport
// ─────────────────────────────────────────────

/// Retry and timeout policy for model calls.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LlmConfig {
    /// Attempts before giving up on transient errors.
    pub max_retries: u32,
    /// Per-attempt request timeout, in seconds.
    pub timeout_secs: u64,
    /// Backoff multiplier: attempt `n` sleeps `factor * 2^n` seconds plus jitter.
    pub backoff_factor: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout_secs: 180,
            backoff_factor: 2.0,
        }
    }
}

// ─────────────────────────────────────────────
// Tools
// ─────────────────────────────────────────────

/// Tool configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolsConfig {
    /// Confine file and shell tools to the workspace directory.
    pub restrict_to_workspace: bool,
    pub shell: ShellToolConfig,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            restrict_to_workspace: true,
            shell: ShellToolConfig::default(),
        }
    }
}

/// Persistent shell tool settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShellToolConfig {
    /// Per-command timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for ShellToolConfig {
    fn default() -> Self {
        Self { timeout_secs: 60 }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
