//! Tenant and watermark records

use crate::credentials::{CredentialHash, Secret};
use crate::ids::{ChannelId, ItemId, MentionId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which source changes a tenant wants announced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationMode {
    /// Only items never announced before
    NewOnly,
    /// New items, plus items whose source update time advanced
    #[default]
    NewAndUpdated,
}

impl NotificationMode {
    /// Stored/wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationMode::NewOnly => "new_only",
            NotificationMode::NewAndUpdated => "new_and_updated",
        }
    }

    /// Human-readable label for status output
    pub fn label(&self) -> &'static str {
        match self {
            NotificationMode::NewOnly => "New posts only",
            NotificationMode::NewAndUpdated => "New and updated posts",
        }
    }
}

impl fmt::Display for NotificationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationMode {
    type Err = crate::HeraldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new_only" | "new-only" => Ok(NotificationMode::NewOnly),
            // "default" is what the oldest deployments stored
            "new_and_updated" | "new-and-updated" | "default" => {
                Ok(NotificationMode::NewAndUpdated)
            }
            other => Err(crate::HeraldError::Validation(format!(
                "Unknown notification mode '{}'. Must be one of: new_only, new_and_updated",
                other
            ))),
        }
    }
}

/// A tenant's persisted configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantConfig {
    pub id: TenantId,

    /// Content source base URL
    pub source_endpoint: Option<String>,

    /// Hash of the content source credential, never the plaintext
    pub source_credential: Option<CredentialHash>,

    pub notifications_enabled: bool,

    /// Required when notifications are enabled
    pub destination_channel: Option<ChannelId>,

    pub mention_target: Option<MentionId>,

    pub mode: NotificationMode,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Whether the scheduler can work on a tenant, and why not
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Complete and enabled
    Ready,
    /// Notifications are switched off (discovery-only tenant)
    NotificationsDisabled,
    /// Source endpoint or credential missing
    Incomplete(String),
    /// Enabled but inconsistent (e.g. no destination)
    Misconfigured(String),
}

impl TenantConfig {
    /// Evaluate whether this tenant can be polled
    pub fn readiness(&self) -> Readiness {
        if !self.notifications_enabled {
            return Readiness::NotificationsDisabled;
        }
        if let Some(missing) = self.missing_source_field() {
            return Readiness::Incomplete(format!("{} is not set", missing));
        }
        if self.destination_channel.is_none() {
            return Readiness::Misconfigured(
                "notifications are enabled but no destination channel is set".to_string(),
            );
        }
        Readiness::Ready
    }

    /// Name of the first missing content source field, if any
    pub fn missing_source_field(&self) -> Option<&'static str> {
        match (&self.source_endpoint, &self.source_credential) {
            (None, _) => Some("source endpoint"),
            (Some(url), _) if url.trim().is_empty() => Some("source endpoint"),
            (_, None) => Some("source credential"),
            _ => None,
        }
    }
}

/// Fields supplied by an administrative setup
#[derive(Debug, Clone)]
pub struct TenantSetup {
    pub source_endpoint: String,
    pub credential: Secret,
    pub notifications_enabled: bool,
    pub destination_channel: Option<ChannelId>,
    pub mention_target: Option<MentionId>,
    pub mode: NotificationMode,
}

/// A single-field edit of a tenant's configuration
///
/// Each variant updates exactly one column plus `updated_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantEdit {
    SourceEndpoint(String),
    SourceCredential(Secret),
    Destination(ChannelId),
    Mention(Option<MentionId>),
    Mode(NotificationMode),
    NotificationsEnabled(bool),
}

impl TenantEdit {
    /// Field name for logs and messages
    pub fn field_name(&self) -> &'static str {
        match self {
            TenantEdit::SourceEndpoint(_) => "source endpoint",
            TenantEdit::SourceCredential(_) => "source credential",
            TenantEdit::Destination(_) => "destination channel",
            TenantEdit::Mention(_) => "mention target",
            TenantEdit::Mode(_) => "mode",
            TenantEdit::NotificationsEnabled(_) => "notifications",
        }
    }
}

/// Marker of the latest state of an item already announced to a tenant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    pub item_id: ItemId,
    pub tenant_id: TenantId,
    pub published_at: DateTime<Utc>,
    pub last_seen_updated_at: DateTime<Utc>,
}
