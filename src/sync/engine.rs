//! One synchronization cycle
//!
//! [`SyncEngine::run_cycle`] walks the selected tenants sequentially. Each
//! tenant is fetched, reconciled and dispatched under its own lock; a failing
//! tenant is recorded and the walk moves on. Only a store failure stops the
//! rest of the cycle.

use super::dispatch::{DispatchOutcome, Dispatcher};
use super::locks::TenantLocks;
use super::metrics;
use super::reconcile::{reconcile, Classification, Reconciliation};
use crate::credentials::{CredentialCache, Secret};
use crate::error::ErrorKind;
use crate::ids::TenantId;
use crate::notify::Notifier;
use crate::source::{ContentItem, ContentSource};
use crate::store::{Readiness, TenantConfig, TenantStore, Watermark};
use crate::{HeraldError, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Default number of items fetched per tenant per cycle
pub const DEFAULT_PAGE_SIZE: usize = 25;

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Items fetched per cycle and back-filled on enable
    pub page_size: usize,

    /// Deadline for one content source fetch, retries included
    pub source_timeout: Duration,

    /// Deadline for one destination send, retries included
    pub destination_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            source_timeout: Duration::from_secs(15),
            destination_timeout: Duration::from_secs(10),
        }
    }
}

/// What started a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Timer,
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Timer => "timer",
            Trigger::Manual => "manual",
        }
    }
}

/// A tenant the cycle did not poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantSkip {
    pub tenant_id: TenantId,
    pub reason: String,
}

/// A tenant whose pass failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantFailure {
    pub tenant_id: TenantId,
    pub kind: ErrorKind,
    pub message: String,
}

/// Aggregate outcome of one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Tenants whose source was fetched (or attempted)
    pub tenants_checked: usize,
    pub new_items: usize,
    pub updated_items: usize,
    /// Notifications delivered and committed
    pub sent: usize,
    pub failed_sends: usize,
    pub skipped: Vec<TenantSkip>,
    pub failures: Vec<TenantFailure>,
    /// The store failed and the remaining tenants were not processed
    pub aborted: bool,
}

impl CycleReport {
    /// "ok", "partial" or "aborted"
    pub fn status(&self) -> &'static str {
        if self.aborted {
            "aborted"
        } else if !self.failures.is_empty() || self.failed_sends > 0 {
            "partial"
        } else {
            "ok"
        }
    }

    fn skip(&mut self, tenant_id: &TenantId, reason: impl Into<String>) {
        self.skipped.push(TenantSkip {
            tenant_id: tenant_id.clone(),
            reason: reason.into(),
        });
    }

    fn fail(&mut self, tenant_id: &TenantId, error: &HeraldError) {
        self.failures.push(TenantFailure {
            tenant_id: tenant_id.clone(),
            kind: error.kind(),
            message: error.to_string(),
        });
    }
}

/// Fetch, reconcile and dispatch for every tenant
pub struct SyncEngine {
    store: Arc<TenantStore>,
    source: Arc<dyn ContentSource>,
    notifier: Arc<dyn Notifier>,
    credentials: Arc<CredentialCache>,
    locks: TenantLocks,
    config: EngineConfig,
    /// Tenants already warned about; cleared once they are ready again
    reported: Mutex<HashSet<TenantId>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<TenantStore>,
        source: Arc<dyn ContentSource>,
        notifier: Arc<dyn Notifier>,
        credentials: Arc<CredentialCache>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            source,
            notifier,
            credentials,
            locks: TenantLocks::new(),
            config,
            reported: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &TenantStore {
        &self.store
    }

    pub fn source(&self) -> &dyn ContentSource {
        self.source.as_ref()
    }

    pub fn credentials(&self) -> &CredentialCache {
        &self.credentials
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Cached plaintext credential matching the tenant's stored hash
    pub fn credential_for(&self, tenant: &TenantConfig) -> Option<Secret> {
        let stored = tenant.source_credential.as_ref()?;
        self.credentials.get(&tenant.id, stored)
    }

    /// Run a cycle on demand, for one tenant or all of them
    pub async fn run_cycle(&self, only: Option<&TenantId>) -> CycleReport {
        self.cycle(Trigger::Manual, only).await
    }

    /// Run a cycle for every tenant on behalf of the timer
    pub async fn run_scheduled_cycle(&self) -> CycleReport {
        self.cycle(Trigger::Timer, None).await
    }

    async fn cycle(&self, trigger: Trigger, only: Option<&TenantId>) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::default();

        let tenant_ids: Vec<TenantId> = match only {
            Some(id) => vec![id.clone()],
            None => match self.store.list_tenants() {
                Ok(tenants) => tenants
                    .into_iter()
                    .filter(|t| t.notifications_enabled)
                    .map(|t| t.id)
                    .collect(),
                Err(e) => {
                    error!(error = %e, "Failed to load tenants; skipping cycle");
                    report.aborted = true;
                    self.finish(trigger, started, &report);
                    return report;
                }
            },
        };

        debug!(trigger = trigger.as_str(), tenants = tenant_ids.len(), "Cycle started");

        for tenant_id in &tenant_ids {
            match self.process_tenant(tenant_id, &mut report).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Persistence => {
                    error!(
                        tenant_id = %tenant_id,
                        error = %e,
                        "Store failure; aborting the rest of this cycle"
                    );
                    report.fail(tenant_id, &e);
                    report.aborted = true;
                    break;
                }
                Err(e) => {
                    warn!(tenant_id = %tenant_id, error = %e, "Tenant failed this cycle");
                    metrics::record_tenant_failure(e.kind().as_str());
                    report.fail(tenant_id, &e);
                }
            }
        }

        self.finish(trigger, started, &report);
        report
    }

    fn finish(&self, trigger: Trigger, started: Instant, report: &CycleReport) {
        metrics::record_cycle_duration(trigger.as_str(), started.elapsed().as_secs_f64());
        metrics::record_cycle(report.status());
        metrics::set_tenants_checked(report.tenants_checked);

        info!(
            trigger = trigger.as_str(),
            status = report.status(),
            tenants_checked = report.tenants_checked,
            new_items = report.new_items,
            updated_items = report.updated_items,
            sent = report.sent,
            failed_sends = report.failed_sends,
            failures = report.failures.len(),
            "Cycle completed"
        );
    }

    async fn process_tenant(&self, tenant_id: &TenantId, report: &mut CycleReport) -> Result<()> {
        let _guard = self.locks.acquire(tenant_id).await;

        // Re-read under the lock so edits made while waiting are honored
        let tenant = self.store.require_tenant(tenant_id)?;

        match tenant.readiness() {
            Readiness::Ready => {}
            Readiness::NotificationsDisabled => {
                report.skip(tenant_id, "notifications are disabled");
                return Ok(());
            }
            Readiness::Incomplete(reason) => {
                debug!(tenant_id = %tenant_id, reason = %reason, "Skipping incomplete tenant");
                report.skip(tenant_id, reason);
                return Ok(());
            }
            Readiness::Misconfigured(reason) => {
                self.report_once(tenant_id, &reason);
                report.skip(tenant_id, reason);
                return Ok(());
            }
        }

        let Some(credential) = self.credential_for(&tenant) else {
            let reason = "source credential is not loaded in this process; run setup again or bind it in the config file";
            self.report_once(tenant_id, reason);
            report.skip(tenant_id, reason);
            return Ok(());
        };
        self.clear_reported(tenant_id);

        report.tenants_checked += 1;
        let items = self.fetch(&tenant, &credential).await?;

        let classified = match reconcile(&tenant, items, |item_id| {
            self.store.get_watermark(item_id, tenant_id)
        })? {
            Reconciliation::Ready(classified) => classified,
            Reconciliation::Skipped(reason) => {
                report.skip(tenant_id, reason);
                return Ok(());
            }
        };

        let dispatcher = Dispatcher::new(
            &self.store,
            self.notifier.as_ref(),
            self.config.destination_timeout,
        );

        for entry in &classified {
            match entry.classification {
                Classification::New => report.new_items += 1,
                Classification::Updated => report.updated_items += 1,
                Classification::Unchanged => {}
            }

            let label = entry.classification.as_str();
            match dispatcher.dispatch(&tenant, entry).await? {
                DispatchOutcome::Sent => {
                    report.sent += 1;
                    metrics::record_notification(label, true);
                }
                DispatchOutcome::SendFailed(_) => {
                    report.failed_sends += 1;
                    metrics::record_notification(label, false);
                }
                DispatchOutcome::Skipped => {}
            }
        }

        Ok(())
    }

    async fn fetch(&self, tenant: &TenantConfig, credential: &Secret) -> Result<Vec<ContentItem>> {
        let endpoint = tenant.source_endpoint.as_deref().ok_or_else(|| {
            HeraldError::Validation("source endpoint is not set".to_string())
        })?;
        let timeout = self.config.source_timeout;

        tokio::time::timeout(
            timeout,
            self.source
                .fetch_recent(endpoint, credential, self.config.page_size),
        )
        .await
        .unwrap_or_else(|_| Err(HeraldError::timeout("fetch recent items", timeout)))
    }

    /// Record the source's current items as already announced
    ///
    /// Called when notifications become enabled so the existing back catalog
    /// is never announced. Sends nothing. Returns the number of watermarks
    /// written.
    pub async fn on_tenant_enabled(&self, tenant_id: &TenantId) -> Result<usize> {
        let _guard = self.locks.acquire(tenant_id).await;
        let tenant = self.store.require_tenant(tenant_id)?;

        let credential = self.credential_for(&tenant).ok_or_else(|| {
            HeraldError::Validation(
                "source credential is not loaded in this process; provide it again".to_string(),
            )
        })?;
        let items = self.fetch(&tenant, &credential).await?;

        let watermarks: Vec<Watermark> = items
            .iter()
            .map(|item| Watermark {
                item_id: item.id.clone(),
                tenant_id: tenant_id.clone(),
                published_at: item.published_at,
                last_seen_updated_at: item.source_updated_at,
            })
            .collect();
        let written = self.store.backfill_watermarks(tenant_id, &watermarks)?;

        info!(tenant_id = %tenant_id, items = written, "Back-filled watermarks");
        Ok(written)
    }

    /// Drop in-memory state for a removed tenant
    pub fn forget_tenant(&self, tenant_id: &TenantId) {
        self.locks.forget(tenant_id);
        self.clear_reported(tenant_id);
    }

    fn report_once(&self, tenant_id: &TenantId, reason: &str) {
        let first = self
            .reported
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tenant_id.clone());

        if first {
            warn!(tenant_id = %tenant_id, reason = %reason, "Skipping tenant until its configuration is fixed");
        } else {
            debug!(tenant_id = %tenant_id, reason = %reason, "Still skipping tenant");
        }
    }

    fn clear_reported(&self, tenant_id: &TenantId) {
        self.reported
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(tenant_id);
    }

    #[cfg(test)]
    fn is_reported(&self, tenant_id: &TenantId) -> bool {
        self.reported
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(tenant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ChannelId, ItemId};
    use crate::notify::Notification;
    use crate::source::{SourceStatus, Tag};
    use crate::store::{NotificationMode, StoreConfig, TenantEdit, TenantSetup};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex as StdMutex;

    struct FixedSource(Vec<ContentItem>);

    #[async_trait]
    impl ContentSource for FixedSource {
        async fn fetch_recent(&self, _: &str, _: &Secret, limit: usize) -> Result<Vec<ContentItem>> {
            Ok(self.0.iter().take(limit).cloned().collect())
        }
        async fn search(&self, _: &str, _: &Secret, _: &str) -> Result<Vec<ContentItem>> {
            Ok(vec![])
        }
        async fn by_tag(&self, _: &str, _: &Secret, _: &str) -> Result<Vec<ContentItem>> {
            Ok(vec![])
        }
        async fn list_tags(&self, _: &str, _: &Secret) -> Result<Vec<Tag>> {
            Ok(vec![])
        }
        async fn ping(&self, _: &str, _: &Secret) -> Result<SourceStatus> {
            Ok(SourceStatus {
                latency: Duration::ZERO,
                site_title: None,
            })
        }
    }

    #[derive(Default)]
    struct CountingNotifier(StdMutex<usize>);

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn send(&self, _: &ChannelId, _: &Notification) -> Result<()> {
            *self.0.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn item(id: &str, day: u32) -> ContentItem {
        let at = Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap();
        ContentItem {
            id: ItemId::new(id),
            title: id.to_string(),
            url: format!("https://demo.ghost.io/{}/", id),
            excerpt: None,
            feature_image: None,
            author: None,
            published_at: at,
            source_updated_at: at,
        }
    }

    fn engine(items: Vec<ContentItem>) -> (SyncEngine, Arc<CountingNotifier>) {
        let notifier = Arc::new(CountingNotifier::default());
        let engine = SyncEngine::new(
            Arc::new(TenantStore::open_in_memory().unwrap()),
            Arc::new(FixedSource(items)),
            notifier.clone(),
            Arc::new(CredentialCache::default()),
            EngineConfig::default(),
        );
        (engine, notifier)
    }

    fn setup(engine: &SyncEngine, id: &str, enabled: bool) -> TenantId {
        let tenant_id = TenantId::new(id);
        let secret = Secret::new("key");
        let tenant = engine
            .store()
            .put_tenant(
                &tenant_id,
                &TenantSetup {
                    source_endpoint: "https://demo.ghost.io".to_string(),
                    credential: secret.clone(),
                    notifications_enabled: enabled,
                    destination_channel: Some(ChannelId::new("chan")),
                    mention_target: None,
                    mode: NotificationMode::NewAndUpdated,
                },
            )
            .unwrap();
        assert!(engine.credentials().admit(
            &tenant_id,
            secret,
            tenant.source_credential.as_ref().unwrap()
        ));
        tenant_id
    }

    #[tokio::test]
    async fn test_cycle_sends_then_goes_quiet() {
        let (engine, notifier) = engine(vec![item("p2", 2), item("p1", 1)]);
        setup(&engine, "g", true);

        let first = engine.run_cycle(None).await;
        assert_eq!(first.tenants_checked, 1);
        assert_eq!(first.new_items, 2);
        assert_eq!(first.sent, 2);
        assert_eq!(first.status(), "ok");

        let second = engine.run_cycle(None).await;
        assert_eq!(second.sent, 0);
        assert_eq!(*notifier.0.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_disabled_tenants_not_polled() {
        let (engine, notifier) = engine(vec![item("p1", 1)]);
        setup(&engine, "g", false);

        let report = engine.run_cycle(None).await;
        assert_eq!(report.tenants_checked, 0);
        assert_eq!(*notifier.0.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_credential_warned_once() {
        let (engine, _) = engine(vec![item("p1", 1)]);
        let id = setup(&engine, "g", true);
        engine.credentials().invalidate(&id);

        let report = engine.run_cycle(None).await;
        assert_eq!(report.tenants_checked, 0);
        assert_eq!(report.skipped.len(), 1);
        assert!(engine.is_reported(&id));

        // Providing the credential again clears the report
        let tenant = engine
            .store()
            .apply_edit(&id, &TenantEdit::SourceCredential(Secret::new("key")))
            .unwrap();
        engine.credentials().admit(
            &id,
            Secret::new("key"),
            tenant.source_credential.as_ref().unwrap(),
        );
        let report = engine.run_cycle(None).await;
        assert_eq!(report.tenants_checked, 1);
        assert!(!engine.is_reported(&id));
    }

    #[tokio::test]
    async fn test_unknown_tenant_is_configuration_failure() {
        let (engine, _) = engine(vec![]);
        let report = engine.run_cycle(Some(&TenantId::new("nobody"))).await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, ErrorKind::Configuration);
        assert!(!report.aborted);
    }

    fn file_engine(dir: &tempfile::TempDir, items: Vec<ContentItem>) -> (SyncEngine, Arc<CountingNotifier>) {
        let notifier = Arc::new(CountingNotifier::default());
        let store = TenantStore::open(&StoreConfig::new(dir.path().join("herald.db"))).unwrap();
        let engine = SyncEngine::new(
            Arc::new(store),
            Arc::new(FixedSource(items)),
            notifier.clone(),
            Arc::new(CredentialCache::default()),
            EngineConfig::default(),
        );
        (engine, notifier)
    }

    fn raw_sql(dir: &tempfile::TempDir, sql: &str) {
        let conn = rusqlite::Connection::open(dir.path().join("herald.db")).unwrap();
        conn.execute_batch(sql).unwrap();
    }

    #[tokio::test]
    async fn test_store_failure_aborts_rest_of_cycle() {
        let dir = tempfile::TempDir::new().unwrap();
        let (engine, notifier) = file_engine(&dir, vec![item("p2", 2), item("p1", 1)]);
        let a = setup(&engine, "a", true);
        let b = setup(&engine, "b", true);

        raw_sql(
            &dir,
            "CREATE TRIGGER fail_commit BEFORE INSERT ON watermarks
             WHEN NEW.tenant_id = 'a'
             BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
        );

        let report = engine.run_cycle(None).await;
        assert!(report.aborted);
        assert_eq!(report.tenants_checked, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].tenant_id, a);
        assert_eq!(report.failures[0].kind, ErrorKind::Persistence);
        assert_eq!(*notifier.0.lock().unwrap(), 1);
        assert_eq!(engine.store().watermark_count(&b).unwrap(), 0);

        // The uncommitted send is repeated once the store recovers
        raw_sql(&dir, "DROP TRIGGER fail_commit;");
        let report = engine.run_cycle(None).await;
        assert!(!report.aborted);
        assert_eq!(report.tenants_checked, 2);
        assert_eq!(report.sent, 4);
        assert_eq!(engine.store().watermark_count(&a).unwrap(), 2);
        assert_eq!(engine.store().watermark_count(&b).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_enabled_without_channel_skipped_every_cycle() {
        let dir = tempfile::TempDir::new().unwrap();
        let (engine, notifier) = file_engine(&dir, vec![item("p1", 1)]);
        let id = setup(&engine, "g", true);
        raw_sql(&dir, "UPDATE tenants SET destination_channel = NULL WHERE id = 'g';");

        for _ in 0..2 {
            let report = engine.run_cycle(None).await;
            assert_eq!(report.tenants_checked, 0);
            assert!(report.failures.is_empty());
            assert_eq!(report.skipped.len(), 1);
            assert_eq!(report.skipped[0].tenant_id, id);
            assert!(report.skipped[0].reason.contains("no destination channel"));
            assert!(engine.is_reported(&id));
        }
        assert_eq!(*notifier.0.lock().unwrap(), 0);
        assert_eq!(engine.store().watermark_count(&id).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_backfill_sends_nothing() {
        let (engine, notifier) = engine(vec![item("p2", 2), item("p1", 1)]);
        let id = setup(&engine, "g", true);

        assert_eq!(engine.on_tenant_enabled(&id).await.unwrap(), 2);
        assert_eq!(engine.store().watermark_count(&id).unwrap(), 2);
        assert_eq!(*notifier.0.lock().unwrap(), 0);

        let report = engine.run_cycle(Some(&id)).await;
        assert_eq!(report.sent, 0);
    }
}
