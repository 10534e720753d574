//! Herald configuration file handling
//!
//! Loads and manages the ~/.config/herald/config.yaml file.

use crate::credentials::{CredentialCacheConfig, Secret};
use crate::ids::TenantId;
use crate::notify::{DiscordConfig, DEFAULT_API_BASE};
use crate::store::StoreConfig;
use crate::sync::{EngineConfig, SchedulerConfig, DEFAULT_PAGE_SIZE};
use crate::{HeraldError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tenant store location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

fn default_database_path() -> PathBuf {
    StoreConfig::default().path
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Polling cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Seconds between timer-driven cycles
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Items fetched per cycle and back-filled when notifications are enabled
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Run a cycle right after startup
    #[serde(default = "default_true")]
    pub run_on_start: bool,
}

fn default_poll_interval_secs() -> u64 {
    300
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_true() -> bool {
    true
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            page_size: default_page_size(),
            run_on_start: true,
        }
    }
}

/// Deadlines for external calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_source_secs")]
    pub source_secs: u64,

    #[serde(default = "default_destination_secs")]
    pub destination_secs: u64,
}

fn default_source_secs() -> u64 {
    15
}

fn default_destination_secs() -> u64 {
    10
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            source_secs: default_source_secs(),
            destination_secs: default_destination_secs(),
        }
    }
}

/// Discord bot settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordSettings {
    /// Environment variable holding the bot token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Minimum spacing between sends to one channel, in milliseconds
    #[serde(default = "default_min_send_interval_ms")]
    pub min_send_interval_ms: u64,
}

fn default_token_env() -> String {
    "DISCORD_TOKEN".to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_min_send_interval_ms() -> u64 {
    1000
}

impl Default for DiscordSettings {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
            api_base: default_api_base(),
            min_send_interval_ms: default_min_send_interval_ms(),
        }
    }
}

/// Plaintext credential cache bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialCacheSettings {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// Entries older than this are dropped; unset keeps them until evicted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

fn default_cache_capacity() -> usize {
    256
}

impl Default for CredentialCacheSettings {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: None,
        }
    }
}

/// Seeds one tenant's credential from the environment at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBinding {
    pub tenant_id: String,
    pub env_var: String,
}

impl CredentialBinding {
    pub fn new(tenant_id: impl Into<String>, env_var: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            env_var: env_var.into(),
        }
    }

    pub fn tenant(&self) -> TenantId {
        TenantId::new(self.tenant_id.as_str())
    }

    /// Read the bound variable, if set and non-blank
    pub fn resolve(&self) -> Option<Secret> {
        std::env::var(&self.env_var)
            .ok()
            .map(Secret::new)
            .filter(|s| !s.is_blank())
    }
}

/// Health and metrics endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Address to bind, e.g. `127.0.0.1:9184`; unset disables the endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
}

/// Main Herald configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeraldConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub timeouts: TimeoutSettings,

    #[serde(default)]
    pub discord: DiscordSettings,

    #[serde(default)]
    pub credential_cache: CredentialCacheSettings,

    #[serde(default)]
    pub credentials: Vec<CredentialBinding>,

    #[serde(default)]
    pub server: ServerSettings,
}

impl HeraldConfig {
    /// Load configuration from the default path (~/.config/herald/config.yaml)
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path();
        Self::load(&path)
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(HeraldError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading Herald configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(
            poll_interval_secs = config.scheduler.poll_interval_secs,
            page_size = config.scheduler.page_size,
            credential_bindings = config.credentials.len(),
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Load from `path`, or the default path; a missing default file yields defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::load(&path)
                } else {
                    tracing::debug!(path = %path.display(), "No config file, using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving Herald configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Get the default config path (~/.config/herald/config.yaml)
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config");
        path.push("herald");
        path.push("config.yaml");
        path
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(self.database.path.clone())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            page_size: self.scheduler.page_size,
            source_timeout: Duration::from_secs(self.timeouts.source_secs),
            destination_timeout: Duration::from_secs(self.timeouts.destination_secs),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_poll_interval(Duration::from_secs(self.scheduler.poll_interval_secs))
            .with_run_on_start(self.scheduler.run_on_start)
    }

    pub fn credential_cache_config(&self) -> CredentialCacheConfig {
        CredentialCacheConfig {
            capacity: self.credential_cache.capacity,
            ttl: self.credential_cache.ttl_secs.map(Duration::from_secs),
        }
    }

    /// Build the Discord settings, reading the token from `discord.token_env`
    pub fn discord_config(&self) -> Result<DiscordConfig> {
        let token = std::env::var(&self.discord.token_env)
            .ok()
            .map(Secret::new)
            .filter(|s| !s.is_blank())
            .ok_or_else(|| {
                HeraldError::Config(format!(
                    "Discord token not set: export {}",
                    self.discord.token_env
                ))
            })?;

        let mut config = DiscordConfig::new(token);
        config.api_base = self.discord.api_base.trim_end_matches('/').to_string();
        config.min_send_interval = Duration::from_millis(self.discord.min_send_interval_ms);
        config.request_timeout = Duration::from_secs(self.timeouts.destination_secs);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = HeraldConfig::default();
        assert_eq!(config.scheduler.poll_interval_secs, 300);
        assert_eq!(config.scheduler.page_size, 25);
        assert!(config.scheduler.run_on_start);
        assert_eq!(config.timeouts.source_secs, 15);
        assert_eq!(config.timeouts.destination_secs, 10);
        assert_eq!(config.discord.token_env, "DISCORD_TOKEN");
        assert_eq!(config.credential_cache.capacity, 256);
        assert!(config.server.bind.is_none());
        assert!(config.database.path.ends_with("herald/herald.db"));
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
scheduler:
  poll_interval_secs: 60
credentials:
  - tenant_id: "123"
    env_var: GHOST_KEY_123
"#;
        let config: HeraldConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.scheduler.poll_interval_secs, 60);
        assert_eq!(config.scheduler.page_size, 25);
        assert_eq!(config.discord.min_send_interval_ms, 1000);
        assert_eq!(
            config.credentials,
            vec![CredentialBinding::new("123", "GHOST_KEY_123")]
        );
    }

    #[test]
    fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        let mut config = HeraldConfig::default();
        config.server.bind = Some("127.0.0.1:9184".to_string());
        config.credential_cache.ttl_secs = Some(3600);
        config.save(path).unwrap();

        let loaded = HeraldConfig::load(path).unwrap();
        assert_eq!(loaded.server.bind.as_deref(), Some("127.0.0.1:9184"));
        assert_eq!(
            loaded.credential_cache_config().ttl,
            Some(Duration::from_secs(3600))
        );
    }

    #[test]
    fn test_default_path() {
        let path = HeraldConfig::default_path();
        assert!(path.ends_with("herald/config.yaml"));
    }

    #[test]
    fn test_load_missing_file() {
        let result = HeraldConfig::load("/nonexistent/config.yaml");
        assert!(matches!(result, Err(HeraldError::Config(_))));
    }

    #[test]
    fn test_conversions() {
        let mut config = HeraldConfig::default();
        config.scheduler.poll_interval_secs = 30;
        config.scheduler.run_on_start = false;
        config.timeouts.source_secs = 5;

        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.poll_interval, Duration::from_secs(30));
        assert!(!scheduler.run_on_start);

        let engine = config.engine_config();
        assert_eq!(engine.source_timeout, Duration::from_secs(5));
        assert_eq!(engine.page_size, 25);
    }

    #[test]
    fn test_discord_token_missing() {
        let mut config = HeraldConfig::default();
        config.discord.token_env = "HERALD_TEST_TOKEN_THAT_IS_NEVER_SET".to_string();
        assert!(matches!(
            config.discord_config(),
            Err(HeraldError::Config(_))
        ));
    }
}
