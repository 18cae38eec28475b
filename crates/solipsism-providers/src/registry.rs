//! Provider registry — static specs for the supported LLM backends.
//!
//! Each `ProviderSpec` describes how to reach one OpenAI-compatible
//! endpoint: keywords for model matching, the conventional env var for its
//! key, and its default API base.

use std::collections::HashMap;

use tracing::debug;

// ─────────────────────────────────────────────
// ProviderSpec — static metadata for one provider
// ─────────────────────────────────────────────

/// Static specification describing one LLM provider.
#[derive(Clone, Debug)]
pub struct ProviderSpec {
    /// Internal name (e.g. `"openrouter"`), also the config key.
    pub name: &'static str,
    /// Keywords to match in model names (lowercase). E.g. `&["claude", "anthropic"]`.
    pub keywords: &'static [&'static str],
    /// Environment variable for the API key. E.g. `"GEMINI_API_KEY"`.
    pub env_key: &'static str,
    /// Human-readable name for logs.
    pub display_name: &'static str,
    /// Whether this is a gateway/aggregator (OpenRouter).
    /// Gateways are used as fallback when no direct match is found, and
    /// receive model names untouched.
    pub is_gateway: bool,
    /// Whether this is a local/self-hosted provider (vLLM).
    pub is_local: bool,
    /// If the API key starts with this prefix, auto-detect this provider.
    pub detect_by_key_prefix: Option<&'static str>,
    /// Default API base URL.
    pub default_api_base: &'static str,
}

// ─────────────────────────────────────────────
// Supported providers (in matching priority order)
// ─────────────────────────────────────────────

/// Supported provider specifications, in matching priority order.
pub static PROVIDERS: &[ProviderSpec] = &[
    ProviderSpec {
        name: "openrouter",
        keywords: &["openrouter"],
        env_key: "OPENROUTER_API_KEY",
        display_name: "OpenRouter",
        is_gateway: true,
        is_local: false,
        detect_by_key_prefix: Some("sk-or-"),
        default_api_base: "https://openrouter.ai/api/v1",
    },
    ProviderSpec {
        name: "anthropic",
        keywords: &["anthropic", "claude"],
        env_key: "ANTHROPIC_API_KEY",
        display_name: "Anthropic",
        is_gateway: false,
        is_local: false,
        detect_by_key_prefix: None,
        default_api_base: "https://api.anthropic.com/v1",
    },
    ProviderSpec {
        name: "openai",
        keywords: &["openai", "gpt"],
        env_key: "OPENAI_API_KEY",
        display_name: "OpenAI",
        is_gateway: false,
        is_local: false,
        detect_by_key_prefix: None,
        default_api_base: "https://api.openai.com/v1",
    },
    ProviderSpec {
        name: "deepseek",
        keywords: &["deepseek"],
        env_key: "DEEPSEEK_API_KEY",
        display_name: "DeepSeek",
        is_gateway: false,
        is_local: false,
        detect_by_key_prefix: None,
        default_api_base: "https://api.deepseek.com/v1",
    },
    ProviderSpec {
        name: "gemini",
        keywords: &["gemini"],
        env_key: "GEMINI_API_KEY",
        display_name: "Gemini",
        is_gateway: false,
        is_local: false,
        detect_by_key_prefix: None,
        default_api_base: "https://generativelanguage.googleapis.com/v1beta/openai",
    },
    ProviderSpec {
        name: "groq",
        keywords: &["groq"],
        env_key: "GROQ_API_KEY",
        display_name: "Groq",
        is_gateway: false,
        is_local: false,
        detect_by_key_prefix: None,
        default_api_base: "https://api.groq.com/openai/v1",
    },
    ProviderSpec {
        name: "vllm",
        keywords: &["vllm"],
        env_key: "HOSTED_VLLM_API_KEY",
        display_name: "vLLM",
        is_gateway: false,
        is_local: true,
        detect_by_key_prefix: None,
        default_api_base: "http://localhost:8000/v1",
    },
];

// ─────────────────────────────────────────────
// Matching functions
// ─────────────────────────────────────────────

/// Find a provider spec by matching keywords against a model name.
///
/// Skips gateways and local providers — those are fallback only.
pub fn find_by_model(model: &str) -> Option<&'static ProviderSpec> {
    let model_lower = model.to_lowercase();
    PROVIDERS.iter().find(|spec| {
        !spec.is_gateway
            && !spec.is_local
            && spec.keywords.iter().any(|kw| model_lower.contains(kw))
    })
}

/// Find a provider spec by exact name.
pub fn find_by_name(name: &str) -> Option<&'static ProviderSpec> {
    PROVIDERS.iter().find(|spec| spec.name == name)
}

/// Detect a gateway from its key prefix (e.g. `sk-or-` → OpenRouter).
pub fn find_gateway_by_key(api_key: &str) -> Option<&'static ProviderSpec> {
    PROVIDERS.iter().find(|s| {
        s.detect_by_key_prefix
            .is_some_and(|pfx| api_key.starts_with(pfx))
    })
}

/// Resolve the model name sent on the wire.
///
/// Direct providers get a leading `"<name>/"` routing prefix stripped
/// (`gemini/gemini-2.5-flash` → `gemini-2.5-flash`); gateways route on the
/// full name, so it is passed through.
pub fn resolve_model_name(model: &str, spec: &ProviderSpec) -> String {
    if spec.is_gateway {
        return model.to_string();
    }
    model
        .strip_prefix(spec.name)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(model)
        .to_string()
}

/// Re-export the provider config from core — single source of truth.
pub use solipsism_core::config::schema::ProviderConfig;

/// Fill empty API keys from each provider's conventional env var
/// (e.g. `GEMINI_API_KEY`). Keys set in config win.
pub fn fill_keys_from_env(providers: &mut HashMap<String, ProviderConfig>) {
    for spec in PROVIDERS {
        let Ok(key) = std::env::var(spec.env_key) else {
            continue;
        };
        if key.is_empty() {
            continue;
        }
        let entry = providers.entry(spec.name.to_string()).or_default();
        if !entry.is_configured() {
            debug!(provider = spec.name, env = spec.env_key, "Using API key from environment");
            entry.api_key = key;
        }
    }
}

/// Match a model name to a configured provider.
///
/// 1. Find by keyword match, only if that provider has an API key.
/// 2. A configured local provider (vLLM) whose name prefixes the model.
/// 3. Fallback to the first configured gateway, or any provider whose key
///    looks like a gateway key.
pub fn match_provider<'a>(
    model: &str,
    providers: &'a HashMap<String, ProviderConfig>,
) -> Option<(&'a ProviderConfig, &'static ProviderSpec)> {
    if let Some(spec) = find_by_model(model) {
        if let Some(config) = providers.get(spec.name).filter(|c| c.is_configured()) {
            return Some((config, spec));
        }
    }

    if let Some(spec) = PROVIDERS
        .iter()
        .find(|s| s.is_local && model.starts_with(&format!("{}/", s.name)))
    {
        if let Some(config) = providers.get(spec.name) {
            return Some((config, spec));
        }
    }

    PROVIDERS
        .iter()
        .filter(|s| s.is_gateway)
        .find_map(|spec| {
            providers
                .get(spec.name)
                .filter(|c| c.is_configured())
                .map(|c| (c, spec))
        })
        .or_else(|| {
            providers.values().find_map(|c| {
                find_gateway_by_key(&c.api_key).map(|spec| (c, spec))
            })
        })
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn configured(key: &str) -> ProviderConfig {
        ProviderConfig {
            api_key: key.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_find_by_model_claude() {
        assert_eq!(find_by_model("claude-sonnet-4-20250514").unwrap().name, "anthropic");
    }

    #[test]
    fn test_find_by_model_gemini_with_prefix() {
        assert_eq!(find_by_model("gemini/gemini-2.5-flash").unwrap().name, "gemini");
    }

    #[test]
    fn test_find_by_model_skips_gateway() {
        let spec = find_by_model("openrouter/anthropic/claude-3");
        assert_eq!(spec.unwrap().name, "anthropic");
    }

    #[test]
    fn test_find_by_model_unknown() {
        assert!(find_by_model("some-random-model-xyz").is_none());
    }

    #[test]
    fn test_find_by_name() {
        let spec = find_by_name("deepseek").unwrap();
        assert_eq!(spec.display_name, "DeepSeek");
        assert_eq!(spec.env_key, "DEEPSEEK_API_KEY");
    }

    #[test]
    fn test_find_gateway_by_key_prefix() {
        assert_eq!(find_gateway_by_key("sk-or-abc123").unwrap().name, "openrouter");
        assert!(find_gateway_by_key("sk-regular-key").is_none());
    }

    #[test]
    fn test_resolve_model_strips_own_prefix() {
        let spec = find_by_name("gemini").unwrap();
        assert_eq!(resolve_model_name("gemini/gemini-2.5-flash", spec), "gemini-2.5-flash");
        assert_eq!(resolve_model_name("gemini-2.5-flash", spec), "gemini-2.5-flash");
    }

    #[test]
    fn test_resolve_model_keeps_foreign_prefix() {
        let spec = find_by_name("deepseek").unwrap();
        assert_eq!(resolve_model_name("other/deepseek-chat", spec), "other/deepseek-chat");
    }

    #[test]
    fn test_resolve_model_gateway_passthrough() {
        let spec = find_by_name("openrouter").unwrap();
        assert_eq!(
            resolve_model_name("anthropic/claude-3.5-sonnet", spec),
            "anthropic/claude-3.5-sonnet"
        );
    }

    #[test]
    fn test_match_provider_direct() {
        let mut providers = HashMap::new();
        providers.insert("anthropic".to_string(), configured("sk-ant-123"));

        let (config, spec) = match_provider("claude-sonnet-4-20250514", &providers).unwrap();
        assert_eq!(spec.name, "anthropic");
        assert_eq!(config.api_key, "sk-ant-123");
    }

    #[test]
    fn test_match_provider_gateway_fallback() {
        let mut providers = HashMap::new();
        providers.insert("openrouter".to_string(), configured("sk-or-fallback"));

        let (config, spec) = match_provider("some-unknown-model", &providers).unwrap();
        assert_eq!(spec.name, "openrouter");
        assert_eq!(config.api_key, "sk-or-fallback");
    }

    #[test]
    fn test_match_provider_local_without_key() {
        let mut providers = HashMap::new();
        providers.insert(
            "vllm".to_string(),
            ProviderConfig {
                api_base: Some("http://gpu-box:8000/v1".into()),
                ..Default::default()
            },
        );
        let (_, spec) = match_provider("vllm/qwen2.5-coder", &providers).unwrap();
        assert_eq!(spec.name, "vllm");
    }

    #[test]
    fn test_match_provider_no_key() {
        let mut providers = HashMap::new();
        providers.insert("anthropic".to_string(), configured(""));
        assert!(match_provider("claude-3", &providers).is_none());
    }

    #[test]
    fn test_fill_keys_from_env_respects_config() {
        std::env::set_var("GROQ_API_KEY", "gsk-env");
        let mut providers = HashMap::new();
        providers.insert("groq".to_string(), configured("gsk-config"));
        fill_keys_from_env(&mut providers);
        assert_eq!(providers["groq"].api_key, "gsk-config");

        providers.insert("groq".to_string(), configured(""));
        fill_keys_from_env(&mut providers);
        assert_eq!(providers["groq"].api_key, "gsk-env");
        std::env::remove_var("GROQ_API_KEY");
    }

    #[test]
    fn test_all_providers_have_unique_names() {
        let names: Vec<&str> = PROVIDERS.iter().map(|s| s.name).collect();
        let mut unique = names.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(names.len(), unique.len(), "Duplicate provider names found");
    }

    #[test]
    fn test_every_provider_has_config_slot() {
        use solipsism_core::config::schema::PROVIDER_NAMES;
        for spec in PROVIDERS {
            assert!(PROVIDER_NAMES.contains(&spec.name), "{} has no config slot", spec.name);
        }
    }
}
