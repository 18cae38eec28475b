//! Config loader — reads `~/.solipsism/config.json` and merges env vars.
//!
//! # Loading precedence
//! 1. Defaults (from `Config::default()`)
//! 2. JSON file at `~/.solipsism/config.json`
//! 3. Environment variables `SOLIPSISM_<SECTION>__<FIELD>` (override JSON)

use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

use super::schema::{Config, PROVIDER_NAMES};

/// Default config file path.
pub fn get_config_path() -> PathBuf {
    crate::utils::get_data_path().join("config.json")
}

/// Load configuration from `path` (or the default path) + env vars.
///
/// Falls back to `Config::default()` if the file doesn't exist or can't be parsed.
pub fn load_config(path: Option<&Path>) -> Config {
    let config_path = path.map(PathBuf::from).unwrap_or_else(get_config_path);

    load_config_from_path(&config_path)
}

fn load_config_from_path(path: &Path) -> Config {
    if !path.exists() {
        info!("No config file found at {}, using defaults", path.display());
        return apply_env_overrides(Config::default());
    }

    debug!("Loading config from {}", path.display());

    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to read config file {}: {}", path.display(), e);
            return apply_env_overrides(Config::default());
        }
    };

    let config: Config = match serde_json::from_str(&content) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to parse config JSON: {}", e);
            return apply_env_overrides(Config::default());
        }
    };

    apply_env_overrides(config)
}

/// Save configuration to disk (pretty-printed JSON with camelCase keys).
pub fn save_config(config: &Config, path: Option<&Path>) -> std::io::Result<()> {
    let config_path = path.map(PathBuf::from).unwrap_or_else(get_config_path);

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config).map_err(std::io::Error::other)?;

    std::fs::write(&config_path, json)?;
    debug!("Config saved to {}", config_path.display());
    Ok(())
}

/// Apply environment variable overrides on top of a loaded config.
///
/// Env var format: `SOLIPSISM_<SECTION>__<FIELD>` (double underscore as delimiter).
///
/// Supported overrides:
/// - `SOLIPSISM_AGENTS__DEFAULTS__MODEL` → `agents.defaults.model`
/// - `SOLIPSISM_AGENTS__DEFAULTS__MAX_TOKENS` → `agents.defaults.max_tokens`
/// - `SOLIPSISM_AGENTS__DEFAULTS__TEMPERATURE` → `agents.defaults.temperature`
/// - `SOLIPSISM_AGENTS__DEFAULTS__MAX_TURNS` → `agents.defaults.max_turns`
/// - `SOLIPSISM_AGENTS__DEFAULTS__TURN_SLEEP` → `agents.defaults.turn_sleep`
/// - `SOLIPSISM_AGENTS__DEFAULTS__WORKSPACE` → `agents.defaults.workspace`
/// - `SOLIPSISM_AGENTS__DEFAULTS__PROMPT_PATH` → `agents.defaults.prompt_path`
/// - `SOLIPSISM_PROVIDERS__<NAME>__API_KEY` → `providers.<name>.api_key`
/// - `SOLIPSISM_PROVIDERS__<NAME>__API_BASE` → `providers.<name>.api_base`
/// - `SOLIPSISM_LLM__MAX_RETRIES` → `llm.max_retries`
/// - `SOLIPSISM_LLM__TIMEOUT_SECS` → `llm.timeout_secs`
/// - `SOLIPSISM_TOOLS__RESTRICT_TO_WORKSPACE` → `tools.restrict_to_workspace`
fn apply_env_overrides(mut config: Config) -> Config {
    let defaults = &mut config.agents.defaults;
    if let Ok(val) = std::env::var("SOLIPSISM_AGENTS__DEFAULTS__MODEL") {
        defaults.model = val;
    }
    parse_env("SOLIPSISM_AGENTS__DEFAULTS__MAX_TOKENS", &mut defaults.max_tokens);
    parse_env("SOLIPSISM_AGENTS__DEFAULTS__TEMPERATURE", &mut defaults.temperature);
    parse_env("SOLIPSISM_AGENTS__DEFAULTS__MAX_TURNS", &mut defaults.max_turns);
    parse_env("SOLIPSISM_AGENTS__DEFAULTS__TURN_SLEEP", &mut defaults.turn_sleep);
    if let Ok(val) = std::env::var("SOLIPSISM_AGENTS__DEFAULTS__WORKSPACE") {
        defaults.workspace = val;
    }
    if let Ok(val) = std::env::var("SOLIPSISM_AGENTS__DEFAULTS__PROMPT_PATH") {
        defaults.prompt_path = val;
    }

    for name in PROVIDER_NAMES {
        let upper = name.to_uppercase();
        let Some(provider) = config.providers.get_by_name_mut(name) else {
            continue;
        };
        if let Ok(val) = std::env::var(format!("SOLIPSISM_PROVIDERS__{upper}__API_KEY")) {
            provider.api_key = val;
        }
        if let Ok(val) = std::env::var(format!("SOLIPSISM_PROVIDERS__{upper}__API_BASE")) {
            provider.api_base = Some(val);
        }
    }

    parse_env("SOLIPSISM_LLM__MAX_RETRIES", &mut config.llm.max_retries);
    parse_env("SOLIPSISM_LLM__TIMEOUT_SECS", &mut config.llm.timeout_secs);

    if let Ok(val) = std::env::var("SOLIPSISM_TOOLS__RESTRICT_TO_WORKSPACE") {
        config.tools.restrict_to_workspace = val == "true" || val == "1";
    }

    config
}

/// Overwrite `slot` when `key` is set and parses; ignore it otherwise.
fn parse_env<T: FromStr>(key: &str, slot: &mut T) {
    if let Ok(val) = std::env::var(key) {
        match val.parse::<T>() {
            Ok(parsed) => *slot = parsed,
            Err(_) => warn!("Ignoring unparsable value for {}: {:?}", key, val),
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
