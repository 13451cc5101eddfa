mod defaults;

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::PosError;
use crate::ledger::{validate_avatar_name, SnapshotPolicy};
use defaults::*;

/// Top-level POS configuration.
///
/// Built once at startup with [`load`], checked with [`Config::validate`],
/// then handed to the store, ledger registry and API server.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub pos: PosConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub avatars: AvatarConfig,
}

/// General service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PosConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Timezone assigned to new users that do not supply one.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for PosConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            timezone: default_timezone(),
        }
    }
}

/// SQLite store config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

/// HTTP API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Bearer token for API authentication. Empty = no auth (for local-only use).
    #[serde(default)]
    pub api_key: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_api_host(),
            port: default_api_port(),
            api_key: String::new(),
        }
    }
}

/// Avatar ledger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvatarConfig {
    /// Avatars every new ledger starts with.
    #[serde(default = "default_avatars")]
    pub defaults: Vec<String>,
    /// How to treat stored snapshots that break a ledger invariant.
    #[serde(default)]
    pub snapshot_policy: SnapshotPolicy,
    /// Most ledgers kept in memory. The least recently used one is dropped
    /// when a new one is loaded past this limit.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            defaults: default_avatars(),
            snapshot_policy: SnapshotPolicy::default(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl Config {
    /// Reject settings the rest of the service cannot run with.
    pub fn validate(&self) -> Result<(), PosError> {
        if self.memory.db_path.trim().is_empty() {
            return Err(PosError::Config("memory.db_path must not be empty".into()));
        }
        if self.memory.max_connections == 0 {
            return Err(PosError::Config(
                "memory.max_connections must be at least 1".into(),
            ));
        }
        if self.api.enabled && self.api.port == 0 {
            return Err(PosError::Config("api.port must not be 0".into()));
        }
        if self.avatars.cache_capacity == 0 {
            return Err(PosError::Config(
                "avatars.cache_capacity must be at least 1".into(),
            ));
        }

        let mut seen = HashSet::new();
        for name in &self.avatars.defaults {
            validate_avatar_name(name)
                .map_err(|e| PosError::Config(format!("avatars.defaults: {e}")))?;
            if !seen.insert(name.as_str()) {
                return Err(PosError::Config(format!(
                    "avatars.defaults: duplicate avatar {name:?}"
                )));
            }
        }
        Ok(())
    }
}

/// Expand `~` to home directory.
pub fn shellexpand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{rest}", home.to_string_lossy());
        }
    }
    path.to_string()
}

/// Load configuration from a TOML file.
///
/// Falls back to defaults if the file does not exist. The result is
/// validated before it is returned. Runs before logging is set up, so it
/// does not log; callers report the fallback themselves.
pub fn load(path: &str) -> Result<Config, PosError> {
    let path = Path::new(path);
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PosError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        toml::from_str::<Config>(&content)
            .map_err(|e| PosError::Config(format!("failed to parse config: {}", e)))?
    } else {
        Config::default()
    };

    config.validate()?;
    Ok(config)
}
