//! Configuration validation
//!
//! Validates Herald configuration for correctness:
//! - Positive intervals, page sizes and timeouts
//! - A usable Discord API base URL and token variable name
//! - No duplicate or blank credential bindings
//! - A parseable server bind address

use super::herald_config::HeraldConfig;
use crate::HeraldError;
use std::collections::HashSet;
use std::net::SocketAddr;

/// Validation error details
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub context: Option<String>,
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            context: None,
            field: field.into(),
            message: message.into(),
        }
    }

    fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref ctx) = self.context {
            write!(f, "[{}] {}: {}", ctx, self.field, self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate a Herald configuration
pub fn validate_config(config: &HeraldConfig) -> ValidationResult {
    let mut errors = Vec::new();

    if config.scheduler.poll_interval_secs == 0 {
        errors.push(ValidationError::new(
            "scheduler.poll_interval_secs",
            "Poll interval must be at least one second",
        ));
    }

    if config.scheduler.page_size == 0 {
        errors.push(ValidationError::new(
            "scheduler.page_size",
            "Page size must be at least 1",
        ));
    }

    if config.timeouts.source_secs == 0 {
        errors.push(ValidationError::new(
            "timeouts.source_secs",
            "Source timeout must be at least one second",
        ));
    }

    if config.timeouts.destination_secs == 0 {
        errors.push(ValidationError::new(
            "timeouts.destination_secs",
            "Destination timeout must be at least one second",
        ));
    }

    let api_base = &config.discord.api_base;
    if !api_base.starts_with("http://") && !api_base.starts_with("https://") {
        errors.push(ValidationError::new(
            "discord.api_base",
            format!("Invalid Discord API URL: {}", api_base),
        ));
    }

    if config.discord.token_env.trim().is_empty() {
        errors.push(ValidationError::new(
            "discord.token_env",
            "Token environment variable name cannot be empty",
        ));
    }

    if config.credential_cache.capacity == 0 {
        errors.push(ValidationError::new(
            "credential_cache.capacity",
            "Cache capacity must be at least 1",
        ));
    }

    if config.credential_cache.ttl_secs == Some(0) {
        errors.push(ValidationError::new(
            "credential_cache.ttl_secs",
            "TTL of zero would expire every credential immediately",
        ));
    }

    let mut seen = HashSet::new();
    for binding in &config.credentials {
        if binding.tenant_id.trim().is_empty() {
            errors.push(ValidationError::new(
                "credentials.tenant_id",
                "Tenant id cannot be empty",
            ));
            continue;
        }

        if !seen.insert(binding.tenant_id.as_str()) {
            errors.push(
                ValidationError::new("credentials.tenant_id", "Duplicate credential binding")
                    .with_context(&binding.tenant_id),
            );
        }

        if binding.env_var.trim().is_empty() {
            errors.push(
                ValidationError::new(
                    "credentials.env_var",
                    "Environment variable name cannot be empty",
                )
                .with_context(&binding.tenant_id),
            );
        } else if std::env::var(&binding.env_var).is_err() {
            tracing::warn!(
                tenant_id = %binding.tenant_id,
                env_var = %binding.env_var,
                "Environment variable not set; tenant will be skipped until its credential is re-entered"
            );
        }
    }

    if let Some(ref bind) = config.server.bind {
        if bind.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new(
                "server.bind",
                format!("Invalid bind address: {}", bind),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate and convert to HeraldError if invalid
pub fn validate_config_result(config: &HeraldConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        HeraldError::Config(format!(
            "Configuration validation failed:\n  - {}",
            messages.join("\n  - ")
        ))
    })
}
