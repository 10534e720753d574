//! Configuration system
//!
//! Loads ~/.config/herald/config.yaml with support for:
//! - Tenant store location
//! - Poll interval, page size and external-call timeouts
//! - Discord bot settings and send spacing
//! - Credential cache bounds and startup credential bindings
//! - The optional health/metrics endpoint

mod herald_config;
pub mod validation;

pub use herald_config::{
    CredentialBinding, CredentialCacheSettings, DatabaseConfig, DiscordSettings, HeraldConfig,
    SchedulerSettings, ServerSettings, TimeoutSettings,
};
pub use validation::{validate_config, validate_config_result, ValidationError};
