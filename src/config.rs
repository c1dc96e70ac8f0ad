//! Configuration management: a TOML document overridden by environment
//! variables and `.env`, loaded once at startup and validated before any
//! subsystem uses it.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("failed to read config file: {0}")]
    Io(String),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub budgets: BudgetConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_seconds: u64,
    pub max_body_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout_seconds: 60,
            max_body_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub index_db_path: PathBuf,
    pub workspace_db_dir: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            index_db_path: PathBuf::from("data/index.db"),
            workspace_db_dir: PathBuf::from("data/workspaces"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub memory_budget_default: usize,
    pub max_refinements: u32,
    pub tool_budget_per_turn: u32,
    pub tool_budget_per_refinement: u32,
    pub approval_ttl_seconds: u64,
    pub step_ttl_days: u64,
    pub cp_artifact_ttl_days: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            memory_budget_default: 8,
            max_refinements: 2,
            tool_budget_per_turn: 4,
            tool_budget_per_refinement: 2,
            approval_ttl_seconds: 30 * 60,
            step_ttl_days: 60,
            cp_artifact_ttl_days: 90,
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then apply environment overrides.
    /// `.env` (via `dotenvy`) is loaded first so `env::var` sees its values.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|e| ConfigError::Io(e.to_string()))?;
                toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            None => Self::default(),
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(host) = env::var("VERITAS_API_HOST") {
            self.api.host = host;
        }
        if let Ok(port) = env::var("VERITAS_API_PORT") {
            self.api.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                key: "VERITAS_API_PORT".into(),
                reason: "not a valid port number".into(),
            })?;
        }
        if let Ok(path) = env::var("VERITAS_INDEX_DB_PATH") {
            self.database.index_db_path = PathBuf::from(path);
        }
        if let Ok(level) = env::var("VERITAS_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(n) = env::var("VERITAS_MAX_REFINEMENTS") {
            self.budgets.max_refinements = n.parse().map_err(|_| ConfigError::InvalidValue {
                key: "VERITAS_MAX_REFINEMENTS".into(),
                reason: "not a valid integer".into(),
            })?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.api.port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "api.port".into(),
                reason: "must be nonzero".into(),
            });
        }
        if self.budgets.memory_budget_default == 0 || self.budgets.memory_budget_default > 32 {
            return Err(ConfigError::InvalidValue {
                key: "budgets.memory_budget_default".into(),
                reason: "must be in [1,32]".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut config = Config::default();
        config.api.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_override_changes_host() {
        std::env::set_var("VERITAS_API_HOST", "0.0.0.0");
        let mut config = Config::default();
        config.apply_env_overrides().unwrap();
        assert_eq!(config.api.host, "0.0.0.0");
        std::env::remove_var("VERITAS_API_HOST");
    }

    #[test]
    fn parses_toml_document() {
        let raw = "[api]\nhost = \"127.0.0.1\"\nport = 9090\nrequest_timeout_seconds = 30\nmax_body_bytes = 2000\n";
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.api.port, 9090);
    }
}
