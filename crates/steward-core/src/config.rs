//! Steward configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, StewardError};

/// Path sentinel that keeps the whole database in memory.
pub const IN_MEMORY: &str = ":memory:";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StewardConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl StewardConfig {
    /// Load config from the default path (~/.steward/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StewardError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| StewardError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to a specific path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| StewardError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Steward home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".steward")
    }
}

/// Storage engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file, or ":memory:".
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.steward/steward.db".into() }

impl StorageConfig {
    /// Database path with `~` expanded. The in-memory sentinel is returned as-is.
    pub fn resolved_path(&self) -> PathBuf {
        if self.path == IN_MEMORY {
            return PathBuf::from(IN_MEMORY);
        }
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Run tasks whose next fire passed while the process was down.
    #[serde(default)]
    pub catch_up_missed: bool,
    /// Responses longer than this are truncated before they are stored.
    #[serde(default = "default_max_result_chars")]
    pub max_result_chars: usize,
    /// Runs kept per task; older ones are pruned after each execution. 0 keeps everything.
    #[serde(default = "default_run_history_limit")]
    pub run_history_limit: usize,
    /// How often `serve` re-reads storage to pick up edits made by other processes.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
}

fn bool_true() -> bool { true }
fn default_max_result_chars() -> usize { 10_000 }
fn default_run_history_limit() -> usize { 100 }
fn default_reconcile_interval_secs() -> u64 { 30 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            catch_up_missed: false,
            max_result_chars: default_max_result_chars(),
            run_history_limit: default_run_history_limit(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
        }
    }
}

/// Prompt executor (agent endpoint) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// OpenAI-compatible base URL.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_endpoint() -> String { "http://localhost:11434/v1".into() }
fn default_model() -> String { "llama3.2".into() }
fn default_system_prompt() -> String {
    "You are a personal assistant running a scheduled task. Answer concisely.".into()
}
fn default_timeout_secs() -> u64 { 120 }

impl ExecutorConfig {
    /// API key from config, falling back to `STEWARD_API_KEY`.
    pub fn resolved_api_key(&self) -> String {
        if !self.api_key.is_empty() {
            return self.api_key.clone();
        }
        std::env::var("STEWARD_API_KEY").unwrap_or_default()
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            api_key: String::new(),
            system_prompt: default_system_prompt(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StewardConfig::default();
        assert_eq!(config.storage.path, "~/.steward/steward.db");
        assert!(config.scheduler.enabled);
        assert!(!config.scheduler.catch_up_missed);
        assert_eq!(config.scheduler.max_result_chars, 10_000);
        assert_eq!(config.scheduler.reconcile_interval_secs, 30);
        assert_eq!(config.executor.timeout_secs, 120);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [storage]
            path = ":memory:"

            [scheduler]
            catch_up_missed = true
            max_result_chars = 500
            reconcile_interval_secs = 5

            [executor]
            endpoint = "https://api.example.com/v1"
            model = "gpt-4o-mini"
        "#;

        let config: StewardConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.storage.resolved_path(), PathBuf::from(IN_MEMORY));
        assert!(config.scheduler.catch_up_missed);
        assert_eq!(config.scheduler.max_result_chars, 500);
        assert_eq!(config.scheduler.run_history_limit, 100);
        assert_eq!(config.scheduler.reconcile_interval_secs, 5);
        assert_eq!(config.executor.model, "gpt-4o-mini");
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: StewardConfig = toml::from_str("").unwrap();
        assert_eq!(config.executor.endpoint, "http://localhost:11434/v1");
        assert_eq!(config.scheduler.run_history_limit, 100);
    }

    #[test]
    fn test_tilde_expanded() {
        let storage = StorageConfig::default();
        assert!(!storage.resolved_path().to_string_lossy().starts_with('~'));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = StewardConfig::default();
        config.scheduler.run_history_limit = 7;
        config.save_to(&path).unwrap();

        let loaded = StewardConfig::load_from(&path).unwrap();
        assert_eq!(loaded.scheduler.run_history_limit, 7);
    }

    #[test]
    fn test_load_invalid_toml_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[scheduler\nenabled = ").unwrap();
        let err = StewardConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, StewardError::Config(_)));
    }
}
