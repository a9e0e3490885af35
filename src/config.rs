//! Run configuration for sift-fanout
//!
//! Read from a TOML file (`--config`, `./sift-fanout.toml`, or
//! `~/.config/sift-fanout/config.toml`), falling back to built-in defaults.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const LOCAL_CONFIG_FILE: &str = "sift-fanout.toml";
const KEYRING_SERVICE: &str = "sift-fanout";
const KEYRING_USERNAME: &str = "openrouter_api_key";
pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

/// Context window assumed for models missing from `context_limits`.
pub const DEFAULT_CONTEXT_LIMIT: u64 = 100_000;

const DEFAULT_MODELS: [&str; 4] = [
    "nvidia/nemotron-3-nano-30b-a3b",
    "allenai/olmo-3.1-32b-instruct",
    "deepseek/deepseek-v3.2",
    "anthropic/claude-4.5-haiku-20251001",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model backends evaluated for every edit, in scheduling order
    pub models: Vec<String>,
    /// Known context window per model id (tokens)
    pub context_limits: BTreeMap<String, u64>,
    /// Investigation turn budget
    pub max_turns: usize,
    /// Wall-clock bound for one work item
    pub item_timeout_secs: u64,
    /// Methodology prompt sent as the system message
    pub prompt_path: PathBuf,
    /// YAML list of domains that must never be fetched
    pub blocked_domains_path: PathBuf,
    pub verdict_dir: PathBuf,
    pub state_path: PathBuf,
    pub search_url: String,
    pub api_base_url: String,
    pub search_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Minimum spacing between any two search/fetch calls
    pub tool_min_interval_ms: u64,
    pub fetch_max_chars: usize,
    pub search_max_results: usize,
    /// Delay before each cost lookup so upstream accounting can settle
    pub cost_settle_delay_ms: u64,
    pub cost_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let context_limits = [
            ("nvidia/nemotron-3-nano-30b-a3b", 262_000),
            ("allenai/olmo-3.1-32b-instruct", 65_000),
            ("deepseek/deepseek-v3.2", 164_000),
            ("anthropic/claude-4.5-haiku-20251001", 200_000),
        ]
        .into_iter()
        .map(|(model, limit)| (model.to_string(), limit))
        .collect();

        Self {
            models: DEFAULT_MODELS.iter().map(|m| m.to_string()).collect(),
            context_limits,
            max_turns: 15,
            item_timeout_secs: 180,
            prompt_path: PathBuf::from("config/sift_prompt_openrouter.md"),
            blocked_domains_path: PathBuf::from("config/blocked_domains.yaml"),
            verdict_dir: PathBuf::from("logs/verdicts-fanout"),
            state_path: PathBuf::from("logs/fanout-state.json"),
            search_url: "http://localhost:8080/search".to_string(),
            api_base_url: "https://openrouter.ai/api/v1".to_string(),
            search_timeout_secs: 10,
            fetch_timeout_secs: 15,
            request_timeout_secs: 120,
            tool_min_interval_ms: 500,
            fetch_max_chars: 15_000,
            search_max_results: 10,
            cost_settle_delay_ms: 500,
            cost_timeout_secs: 10,
        }
    }
}

impl Config {
    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("sift-fanout").join("config.toml"))
    }

    /// Load from an explicit path, or the first config file found, or defaults.
    ///
    /// A file that exists but does not parse is an error.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            return Self::from_file(&local);
        }
        if let Some(user) = Self::user_config_path() {
            if user.exists() {
                return Self::from_file(&user);
            }
        }
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn context_limit(&self, model: &str) -> u64 {
        self.context_limits
            .get(model)
            .copied()
            .unwrap_or(DEFAULT_CONTEXT_LIMIT)
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_secs)
    }

    pub fn tool_min_interval(&self) -> Duration {
        Duration::from_millis(self.tool_min_interval_ms)
    }

    pub fn load_prompt(&self) -> anyhow::Result<String> {
        fs::read_to_string(&self.prompt_path).with_context(|| {
            format!(
                "Failed to read methodology prompt {}",
                self.prompt_path.display()
            )
        })
    }

    /// Get the OpenRouter API key (environment first, then system keychain)
    pub fn api_key() -> Option<String> {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                return Some(key.trim().to_string());
            }
        }

        match read_keyring_key() {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to read API key from system keychain");
                None
            }
        }
    }
}

fn read_keyring_key() -> Result<Option<String>, keyring::Error> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, KEYRING_USERNAME)?;
    match entry.get_password() {
        Ok(key) => Ok(Some(key)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.models.len(), 4);
        assert_eq!(config.max_turns, 15);
        assert_eq!(config.item_timeout(), Duration::from_secs(180));
        assert_eq!(config.fetch_max_chars, 15_000);
    }

    #[test]
    fn test_context_limit_falls_back_for_unknown_model() {
        let config = Config::default();
        assert_eq!(config.context_limit("deepseek/deepseek-v3.2"), 164_000);
        assert_eq!(config.context_limit("vendor/unknown"), DEFAULT_CONTEXT_LIMIT);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "models = [\"a/one\"]\nitem_timeout_secs = 30\n\n[context_limits]\n\"a/one\" = 8000\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.models, vec!["a/one".to_string()]);
        assert_eq!(config.item_timeout_secs, 30);
        assert_eq!(config.context_limit("a/one"), 8000);
        assert_eq!(config.max_turns, 15);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "max_turns = \"many\"").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }
}
