use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::settings::{FileSettingsStore, MemorySettingsStore, SettingsStore};

/// Upper bound on rounds when the caller does not choose one.
pub const DEFAULT_MAX_ITERATIONS: usize = 25;

/// Runtime configuration, usually loaded from a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    #[serde(default)]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Report unparseable tool calls as `error` messages instead of
    /// dropping them silently.
    #[serde(default)]
    pub surface_malformed_tool_calls: bool,

    /// JSON file for persisted tool permissions. In-memory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings_path: Option<PathBuf>,

    /// Working directory handed to tools. Process cwd when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
}

fn default_max_iterations() -> usize {
    DEFAULT_MAX_ITERATIONS
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            temperature: 0.0,
            max_tokens: default_max_tokens(),
            surface_malformed_tool_calls: false,
            settings_path: None,
            working_directory: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_opt(key).and_then(|v| v.parse().ok())
}

impl RuntimeConfig {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(?path, "Config file not found, using defaults");
            return Ok(Self::default());
        }
        debug!(?path, "Loading config");
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `AGENT_MAX_ITERATIONS`, `AGENT_TEMPERATURE`, `AGENT_MAX_TOKENS`
    /// and `AGENT_SETTINGS_PATH` on top of the loaded values. Unparseable
    /// values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse("AGENT_MAX_ITERATIONS") {
            self.max_iterations = v;
        }
        if let Some(v) = env_parse("AGENT_TEMPERATURE") {
            self.temperature = v;
        }
        if let Some(v) = env_parse("AGENT_MAX_TOKENS") {
            self.max_tokens = v;
        }
        if let Some(v) = env_opt("AGENT_SETTINGS_PATH") {
            self.settings_path = Some(PathBuf::from(v));
        }
        self
    }

    /// Build the settings store this config points at.
    pub fn settings_store(&self) -> Arc<dyn SettingsStore> {
        match &self.settings_path {
            Some(path) => Arc::new(FileSettingsStore::new(path)),
            None => Arc::new(MemorySettingsStore::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_iterations, 25);
        assert_eq!(config.max_tokens, 4096);
        assert!(!config.surface_malformed_tool_calls);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = RuntimeConfig::from_toml("max_iterations = 3\n").unwrap();
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.max_tokens, 4096);
        assert!(config.settings_path.is_none());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.toml");
        std::fs::write(&path, "max_iterations = \"many\"").unwrap();
        assert!(matches!(
            RuntimeConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    // The only test that touches AGENT_* variables, so no other test races it.
    #[test]
    fn test_env_overrides() {
        env::set_var("AGENT_MAX_ITERATIONS", "7");
        env::set_var("AGENT_MAX_TOKENS", "lots");
        env::set_var("AGENT_SETTINGS_PATH", "/var/lib/agent/permissions.json");
        env::remove_var("AGENT_TEMPERATURE");

        let config = RuntimeConfig::from_toml("max_tokens = 1024\ntemperature = 0.5\n")
            .unwrap()
            .with_env_overrides();

        env::remove_var("AGENT_MAX_ITERATIONS");
        env::remove_var("AGENT_MAX_TOKENS");
        env::remove_var("AGENT_SETTINGS_PATH");

        assert_eq!(config.max_iterations, 7);
        // Unparseable values leave the loaded value alone.
        assert_eq!(config.max_tokens, 1024);
        assert_eq!(config.temperature, 0.5);
        assert_eq!(
            config.settings_path,
            Some(PathBuf::from("/var/lib/agent/permissions.json"))
        );
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = RuntimeConfig {
            settings_path: Some(PathBuf::from("/var/lib/agent/settings.json")),
            ..RuntimeConfig::default()
        };
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed = RuntimeConfig::from_toml(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }
}
