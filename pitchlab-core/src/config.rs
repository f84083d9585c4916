//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/pitchlab/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/pitchlab/` (~/.config/pitchlab/)
//! - Data: `$XDG_DATA_HOME/pitchlab/` (~/.local/share/pitchlab/)
//! - State/Logs: `$XDG_STATE_HOME/pitchlab/` (~/.local/state/pitchlab/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// LLM configuration (optional; grading and line rating refuse to run
    /// without it, import/correlate/cache commands never need it)
    #[serde(default)]
    pub llm: Option<LlmConfig>,

    /// Grading pipeline configuration
    #[serde(default)]
    pub grading: GradingConfig,

    /// Webhook ingress configuration
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// LLM provider configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// Provider type
    pub provider: LlmProvider,
    /// Model to use
    pub model: String,
    /// API endpoint (optional, uses default for provider)
    pub endpoint: Option<String>,
    /// API key (can also use env var)
    pub api_key: Option<String>,
    /// Per-call HTTP timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    /// Sampling temperature; kept low for scoring consistency
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

/// Supported LLM providers
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Ollama,
    Claude,
    OpenAI,
}

impl LlmProvider {
    /// Returns the default endpoint for this provider
    pub fn default_endpoint(&self) -> &'static str {
        match self {
            LlmProvider::Ollama => "http://localhost:11434",
            LlmProvider::Claude => "https://api.anthropic.com",
            LlmProvider::OpenAI => "https://api.openai.com",
        }
    }
}

fn default_llm_timeout() -> u64 {
    30
}

fn default_temperature() -> f32 {
    0.2
}

/// Grading pipeline configuration
#[derive(Debug, Deserialize, Clone)]
pub struct GradingConfig {
    /// Overall budget for one grading request in seconds
    #[serde(default = "default_grading_budget")]
    pub budget_secs: u64,

    /// Max transport retry attempts for transient LLM failures
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Initial backoff delay in milliseconds
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            budget_secs: default_grading_budget(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

fn default_grading_budget() -> u64 {
    60
}

fn default_max_retries() -> usize {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

/// Webhook ingress configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct WebhookConfig {
    /// Shared secret for HMAC signature verification. When absent, payloads
    /// are accepted but logged as degraded-trust.
    pub secret: Option<String>,
}

/// Cache configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Capacity of the bounded attempt-context cache
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
        }
    }
}

fn default_history_capacity() -> usize {
    256
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/pitchlab/config.toml` (~/.config/pitchlab/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("pitchlab").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/pitchlab/` (~/.local/share/pitchlab/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("pitchlab")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/pitchlab/` (~/.local/state/pitchlab/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("pitchlab")
    }

    /// Returns the database file path
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("data.db")
    }

    /// Returns the log file path
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("pitchlab.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path
    /// behavior before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.llm.is_none());
        assert_eq!(config.grading.budget_secs, 60);
        assert_eq!(config.grading.max_retries, 3);
        assert!(config.webhook.secret.is_none());
        assert_eq!(config.cache.history_capacity, 256);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[llm]
provider = "ollama"
model = "llama3.2"
temperature = 0.1

[grading]
budget_secs = 45

[webhook]
secret = "whsec_test"

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        let llm = config.llm.unwrap();
        assert_eq!(llm.provider, LlmProvider::Ollama);
        assert_eq!(llm.model, "llama3.2");
        assert_eq!(llm.timeout_secs, 30);
        assert_eq!(config.grading.budget_secs, 45);
        assert_eq!(config.webhook.secret.as_deref(), Some("whsec_test"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_llm_provider_endpoints() {
        assert_eq!(
            LlmProvider::Ollama.default_endpoint(),
            "http://localhost:11434"
        );
        assert_eq!(
            LlmProvider::Claude.default_endpoint(),
            "https://api.anthropic.com"
        );
        assert_eq!(
            LlmProvider::OpenAI.default_endpoint(),
            "https://api.openai.com"
        );
    }
}
