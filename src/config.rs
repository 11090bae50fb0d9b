use serde::Deserialize;
use std::path::PathBuf;

use crate::identity::ApiKeyEntry;
use crate::sync::SyncSettings;

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port to listen on
    pub port: u16,
    /// Path to the SQLite database
    pub database_path: PathBuf,
    /// API keys accepted by the server
    pub api_keys: Vec<ApiKeyEntry>,
    /// Sync endpoint tunables
    pub sync: SyncSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            database_path: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("fieldsync")
                .join("fieldsync.db"),
            api_keys: Vec::new(),
            sync: SyncSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            config = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;
        } else {
            tracing::warn!("Config file {} not found, using defaults", path.display());
        }

        if let Ok(port) = std::env::var("FIELDSYNC_PORT") {
            config.port = port
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("FIELDSYNC_PORT", port))?;
        }
        if let Ok(db_path) = std::env::var("FIELDSYNC_DATABASE_PATH") {
            config.database_path = PathBuf::from(db_path);
        }

        Ok(config)
    }

    /// Config file path: `FIELDSYNC_CONFIG`, else ~/.config/fieldsync/config.yaml
    pub fn default_config_path() -> PathBuf {
        std::env::var("FIELDSYNC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("fieldsync")
                    .join("config.yaml")
            })
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
    InvalidEnv(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(
                    f,
                    "Failed to parse config file '{}': {}",
                    path.display(),
                    e
                )
            }
            ConfigError::InvalidEnv(name, value) => {
                write!(f, "Invalid value for {}: '{}'", name, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
