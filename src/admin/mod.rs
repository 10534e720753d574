//! Tenant administration
//!
//! The operations a chat command layer calls to set up, edit and inspect a
//! tenant. Each one validates its input, talks to the content source when a
//! change could break polling, and returns a plain summary the caller can
//! render. Nothing here ever returns a stored credential.
//!
//! Enabling notifications always back-fills watermarks *before* the flag is
//! flipped, so a concurrent cycle cannot announce the back catalog.

use crate::credentials::Secret;
use crate::ids::{ChannelId, MentionId, TenantId};
use crate::source::{normalize_endpoint, ContentItem, SourceStatus, Tag};
use crate::store::{NotificationMode, Readiness, TenantConfig, TenantEdit, TenantSetup};
use crate::sync::SyncEngine;
use crate::{HeraldError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of a setup or an enable
#[derive(Debug, Clone)]
pub struct SetupSummary {
    pub tenant: TenantConfig,
    pub site_title: Option<String>,
    /// Watermarks written by the back-fill, if notifications were enabled
    pub indexed: Option<usize>,
}

/// Requested state of the announcements toggle
#[derive(Debug, Clone, Default)]
pub struct NotificationSettings {
    pub enabled: bool,
    pub channel: Option<ChannelId>,
    pub mention: Option<MentionId>,
    pub mode: Option<NotificationMode>,
}

/// Outcome of a live connection check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionCheck {
    Connected {
        latency_ms: u64,
        site_title: Option<String>,
    },
    Failed {
        error: String,
    },
    /// Endpoint or credential not configured
    NotConfigured,
    /// Credential stored but its plaintext is not in this process
    CredentialNotLoaded,
}

/// Redacted view of a tenant
#[derive(Debug, Clone, Serialize)]
pub struct TenantStatus {
    pub tenant_id: TenantId,
    pub source_endpoint: Option<String>,
    pub credential_configured: bool,
    pub notifications_enabled: bool,
    pub destination_channel: Option<ChannelId>,
    pub mention_target: Option<MentionId>,
    pub mode: NotificationMode,
    /// Why the scheduler would skip this tenant, if it would
    pub skip_reason: Option<String>,
    pub watermarks: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub connection: ConnectionCheck,
}

/// Command-layer entry points over a shared [`SyncEngine`]
pub struct TenantAdmin {
    engine: Arc<SyncEngine>,
}

impl TenantAdmin {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Create or fully replace a tenant's configuration
    pub async fn setup(&self, tenant_id: &TenantId, setup: TenantSetup) -> Result<SetupSummary> {
        let endpoint = normalize_endpoint(&setup.source_endpoint)?;
        if setup.credential.is_blank() {
            return Err(HeraldError::Validation(
                "a source credential is required".to_string(),
            ));
        }
        if setup.notifications_enabled && setup.destination_channel.is_none() {
            return Err(HeraldError::Validation(
                "a destination channel is required when notifications are enabled".to_string(),
            ));
        }

        let status = self.check_connection(&endpoint, &setup.credential).await?;

        let enable = setup.notifications_enabled;
        // Same source, already announcing: existing watermarks stay authoritative
        let keep_watermarks = self
            .engine
            .store()
            .get_tenant(tenant_id)?
            .is_some_and(|t| {
                t.notifications_enabled && t.source_endpoint.as_deref() == Some(endpoint.as_str())
            });

        // Stored disabled first; enable() flips it after the back-fill
        let tenant = self.engine.store().put_tenant(
            tenant_id,
            &TenantSetup {
                source_endpoint: endpoint,
                notifications_enabled: false,
                ..setup.clone()
            },
        )?;
        if let Some(stored) = tenant.source_credential.as_ref() {
            self.engine
                .credentials()
                .admit(tenant_id, setup.credential, stored);
        }

        info!(tenant_id = %tenant_id, enable, "Tenant set up");

        if !enable {
            return Ok(SetupSummary {
                tenant,
                site_title: status.site_title,
                indexed: None,
            });
        }

        let (tenant, indexed) = self.enable(tenant_id, keep_watermarks).await?;
        Ok(SetupSummary {
            tenant,
            site_title: status.site_title,
            indexed: Some(indexed),
        })
    }

    /// Apply one typed edit
    pub async fn edit(&self, tenant_id: &TenantId, edit: TenantEdit) -> Result<TenantConfig> {
        let store = self.engine.store();
        let tenant = store.require_tenant(tenant_id)?;

        match edit {
            TenantEdit::SourceEndpoint(raw) => {
                let endpoint = normalize_endpoint(&raw)?;
                let credential = self.engine.credential_for(&tenant).ok_or_else(|| {
                    HeraldError::Validation(
                        "the source credential is not loaded; set the credential again before changing the endpoint"
                            .to_string(),
                    )
                })?;
                self.check_connection(&endpoint, &credential).await?;

                if tenant.notifications_enabled
                    && tenant.source_endpoint.as_deref() != Some(endpoint.as_str())
                {
                    // A different source has its own back catalog
                    store.apply_edit(tenant_id, &TenantEdit::NotificationsEnabled(false))?;
                    store.apply_edit(tenant_id, &TenantEdit::SourceEndpoint(endpoint))?;
                    let (tenant, _) = self.enable(tenant_id, false).await?;
                    return Ok(tenant);
                }
                store.apply_edit(tenant_id, &TenantEdit::SourceEndpoint(endpoint))
            }
            TenantEdit::SourceCredential(secret) => {
                if secret.is_blank() {
                    return Err(HeraldError::Validation(
                        "the source credential cannot be empty".to_string(),
                    ));
                }
                if let Some(endpoint) = tenant.source_endpoint.as_deref() {
                    self.check_connection(endpoint, &secret).await?;
                }
                let updated =
                    store.apply_edit(tenant_id, &TenantEdit::SourceCredential(secret.clone()))?;
                self.engine.credentials().rotate(tenant_id, secret);
                Ok(updated)
            }
            TenantEdit::NotificationsEnabled(true) => {
                if tenant.destination_channel.is_none() {
                    return Err(HeraldError::Validation(
                        "a destination channel is required to enable notifications".to_string(),
                    ));
                }
                let (tenant, _) = self.enable(tenant_id, tenant.notifications_enabled).await?;
                Ok(tenant)
            }
            other => store.apply_edit(tenant_id, &other),
        }
    }

    /// The announcements toggle
    ///
    /// Channel, mention and mode are stored first; enabling back-fills and
    /// then turns notifications on.
    pub async fn set_notifications(
        &self,
        tenant_id: &TenantId,
        settings: NotificationSettings,
    ) -> Result<SetupSummary> {
        let store = self.engine.store();
        let tenant = store.require_tenant(tenant_id)?;

        if settings.enabled
            && settings.channel.is_none()
            && tenant.destination_channel.is_none()
        {
            return Err(HeraldError::Validation(
                "a destination channel is required to enable notifications".to_string(),
            ));
        }

        if let Some(channel) = settings.channel {
            store.apply_edit(tenant_id, &TenantEdit::Destination(channel))?;
        }
        if let Some(mention) = settings.mention {
            store.apply_edit(tenant_id, &TenantEdit::Mention(Some(mention)))?;
        }
        if let Some(mode) = settings.mode {
            store.apply_edit(tenant_id, &TenantEdit::Mode(mode))?;
        }

        if !settings.enabled {
            let tenant = store.apply_edit(tenant_id, &TenantEdit::NotificationsEnabled(false))?;
            info!(tenant_id = %tenant_id, "Notifications disabled");
            return Ok(SetupSummary {
                tenant,
                site_title: None,
                indexed: None,
            });
        }

        let (tenant, indexed) = self.enable(tenant_id, tenant.notifications_enabled).await?;
        Ok(SetupSummary {
            tenant,
            site_title: None,
            indexed: Some(indexed),
        })
    }

    /// Remove a tenant, its watermarks and its cached credential
    pub fn remove(&self, tenant_id: &TenantId) -> Result<TenantConfig> {
        let removed = self
            .engine
            .store()
            .remove_tenant(tenant_id)?
            .ok_or_else(|| HeraldError::TenantNotFound(tenant_id.to_string()))?;
        self.engine.credentials().invalidate(tenant_id);
        self.engine.forget_tenant(tenant_id);
        Ok(removed)
    }

    /// Redacted configuration plus a live connection check
    pub async fn status(&self, tenant_id: &TenantId) -> Result<TenantStatus> {
        let store = self.engine.store();
        let tenant = store.require_tenant(tenant_id)?;
        let watermarks = store.watermark_count(tenant_id)?;

        let connection = match (tenant.source_endpoint.as_deref(), &tenant.source_credential) {
            (Some(endpoint), Some(_)) => match self.engine.credential_for(&tenant) {
                Some(credential) => match self.check_connection(endpoint, &credential).await {
                    Ok(status) => ConnectionCheck::Connected {
                        latency_ms: status.latency.as_millis() as u64,
                        site_title: status.site_title,
                    },
                    Err(e) => ConnectionCheck::Failed {
                        error: e.to_string(),
                    },
                },
                None => ConnectionCheck::CredentialNotLoaded,
            },
            _ => ConnectionCheck::NotConfigured,
        };

        let skip_reason = match tenant.readiness() {
            Readiness::Ready => None,
            Readiness::NotificationsDisabled => Some("notifications are disabled".to_string()),
            Readiness::Incomplete(reason) | Readiness::Misconfigured(reason) => Some(reason),
        };

        Ok(TenantStatus {
            tenant_id: tenant.id,
            source_endpoint: tenant.source_endpoint,
            credential_configured: tenant.source_credential.is_some(),
            notifications_enabled: tenant.notifications_enabled,
            destination_channel: tenant.destination_channel,
            mention_target: tenant.mention_target,
            mode: tenant.mode,
            skip_reason,
            watermarks,
            created_at: tenant.created_at,
            updated_at: tenant.updated_at,
            connection,
        })
    }

    /// Measure the source round trip for a tenant
    pub async fn ping(&self, tenant_id: &TenantId) -> Result<SourceStatus> {
        let (endpoint, credential) = self.live_source(tenant_id)?;
        self.check_connection(&endpoint, &credential).await
    }

    /// Items whose title matches `query`
    pub async fn search(&self, tenant_id: &TenantId, query: &str) -> Result<Vec<ContentItem>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(HeraldError::Validation("search query cannot be empty".to_string()));
        }
        let (endpoint, credential) = self.live_source(tenant_id)?;
        self.bounded(
            "search items",
            self.engine.source().search(&endpoint, &credential, query),
        )
        .await
    }

    /// Recent items carrying a tag
    pub async fn posts_by_tag(&self, tenant_id: &TenantId, slug: &str) -> Result<Vec<ContentItem>> {
        let slug = slug.trim();
        if slug.is_empty() {
            return Err(HeraldError::Validation("tag slug cannot be empty".to_string()));
        }
        let (endpoint, credential) = self.live_source(tenant_id)?;
        self.bounded(
            "fetch items by tag",
            self.engine.source().by_tag(&endpoint, &credential, slug),
        )
        .await
    }

    pub async fn tags(&self, tenant_id: &TenantId) -> Result<Vec<Tag>> {
        let (endpoint, credential) = self.live_source(tenant_id)?;
        self.bounded(
            "list tags",
            self.engine.source().list_tags(&endpoint, &credential),
        )
        .await
    }

    /// Back-fill, then turn notifications on
    ///
    /// A tenant that is already enabled keeps its watermarks; re-indexing
    /// would swallow pending updates.
    async fn enable(&self, tenant_id: &TenantId, already_enabled: bool) -> Result<(TenantConfig, usize)> {
        let store = self.engine.store();
        if already_enabled {
            let tenant = store.apply_edit(tenant_id, &TenantEdit::NotificationsEnabled(true))?;
            return Ok((tenant, 0));
        }

        let indexed = match self.engine.on_tenant_enabled(tenant_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(tenant_id = %tenant_id, error = %e, "Back-fill failed; notifications left disabled");
                return Err(e);
            }
        };
        let tenant = store.apply_edit(tenant_id, &TenantEdit::NotificationsEnabled(true))?;

        info!(tenant_id = %tenant_id, indexed, "Notifications enabled");
        Ok((tenant, indexed))
    }

    fn live_source(&self, tenant_id: &TenantId) -> Result<(String, Secret)> {
        let tenant = self.engine.store().require_tenant(tenant_id)?;
        if let Some(missing) = tenant.missing_source_field() {
            return Err(HeraldError::Validation(format!("{} is not set", missing)));
        }
        let endpoint = tenant.source_endpoint.clone().unwrap_or_default();
        let credential = self.engine.credential_for(&tenant).ok_or_else(|| {
            HeraldError::Validation(
                "the source credential is not loaded in this process; set it again".to_string(),
            )
        })?;
        Ok((endpoint, credential))
    }

    async fn check_connection(&self, endpoint: &str, credential: &Secret) -> Result<SourceStatus> {
        self.bounded(
            "connect to content source",
            self.engine.source().ping(endpoint, credential),
        )
        .await
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let after = self.engine.config().source_timeout;
        tokio::time::timeout(after, call)
            .await
            .unwrap_or_else(|_| Err(HeraldError::timeout(operation, after)))
    }
}
