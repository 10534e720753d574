//! Integration tests for Herald
//!
//! These tests drive full cycles through the public API with in-memory
//! stand-ins for Ghost and Discord.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use herald::admin::{NotificationSettings, TenantAdmin};
use herald::credentials::{CredentialCache, Secret};
use herald::ids::{ChannelId, ItemId, MentionId, TenantId};
use herald::notify::{Notification, Notifier, NEW_COLOR, UPDATED_COLOR};
use herald::source::{ContentItem, ContentSource, SourceStatus, Tag};
use herald::store::{NotificationMode, StoreConfig, TenantEdit, TenantSetup, TenantStore};
use herald::sync::{EngineConfig, SyncEngine};
use herald::{ErrorKind, HeraldError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const KEY: &str = "content-api-key";

/// Ghost stand-in: one mutable page per endpoint
#[derive(Default)]
struct FakeGhost {
    pages: Mutex<HashMap<String, Vec<ContentItem>>>,
    down: Mutex<HashSet<String>>,
}

impl FakeGhost {
    fn publish(&self, endpoint: &str, item: ContentItem) {
        let mut pages = self.pages.lock().unwrap();
        let page = pages.entry(endpoint.to_string()).or_default();
        page.retain(|i| i.id != item.id);
        page.push(item);
        page.sort_by(|a, b| b.published_at.cmp(&a.published_at));
    }

    fn take_down(&self, endpoint: &str) {
        self.down.lock().unwrap().insert(endpoint.to_string());
    }
}

#[async_trait]
impl ContentSource for FakeGhost {
    async fn fetch_recent(
        &self,
        endpoint: &str,
        credential: &Secret,
        limit: usize,
    ) -> Result<Vec<ContentItem>> {
        tokio::task::yield_now().await;
        if credential.expose() != KEY {
            return Err(HeraldError::InvalidCredential("401".into()));
        }
        if self.down.lock().unwrap().contains(endpoint) {
            return Err(HeraldError::Source("502 Bad Gateway".into()));
        }
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(endpoint)
            .map(|page| page.iter().take(limit).cloned().collect())
            .unwrap_or_default())
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

    async fn ping(&self, _: &str, credential: &Secret) -> Result<SourceStatus> {
        if credential.expose() != KEY {
            return Err(HeraldError::InvalidCredential("401".into()));
        }
        Ok(SourceStatus {
            latency: Duration::from_millis(5),
            site_title: None,
        })
    }
}

/// Discord stand-in: records every accepted message in order
#[derive(Default)]
struct FakeDiscord {
    sent: Mutex<Vec<(ChannelId, Notification)>>,
    forbidden: Mutex<HashSet<ChannelId>>,
}

impl FakeDiscord {
    fn titles(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, n)| n.embeds[0].title.clone())
            .collect()
    }

    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for FakeDiscord {
    async fn send(&self, channel: &ChannelId, notification: &Notification) -> Result<()> {
        if self.forbidden.lock().unwrap().contains(channel) {
            return Err(HeraldError::PermissionDenied("Missing Access".into()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((channel.clone(), notification.clone()));
        Ok(())
    }
}

struct Harness {
    ghost: Arc<FakeGhost>,
    discord: Arc<FakeDiscord>,
    engine: Arc<SyncEngine>,
    admin: TenantAdmin,
}

impl Harness {
    fn with_store(store: TenantStore) -> Self {
        let ghost = Arc::new(FakeGhost::default());
        let discord = Arc::new(FakeDiscord::default());
        let engine = Arc::new(SyncEngine::new(
            Arc::new(store),
            ghost.clone(),
            discord.clone(),
            Arc::new(CredentialCache::default()),
            EngineConfig::default(),
        ));
        let admin = TenantAdmin::new(engine.clone());
        Self {
            ghost,
            discord,
            engine,
            admin,
        }
    }

    fn new() -> Self {
        Self::with_store(TenantStore::open_in_memory().unwrap())
    }

    async fn onboard(&self, tenant: &str, endpoint: &str, mode: NotificationMode) -> TenantId {
        let tenant_id = TenantId::new(tenant);
        self.admin
            .setup(
                &tenant_id,
                TenantSetup {
                    source_endpoint: endpoint.to_string(),
                    credential: Secret::new(KEY),
                    notifications_enabled: true,
                    destination_channel: Some(ChannelId::new(format!("{}-news", tenant))),
                    mention_target: None,
                    mode,
                },
            )
            .await
            .unwrap();
        tenant_id
    }
}

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, d, 12, 0, 0).unwrap()
}

fn post(id: &str, published: u32, updated: u32) -> ContentItem {
    ContentItem {
        id: ItemId::new(id),
        title: format!("Post {}", id),
        url: format!("https://blog.example/{}/", id),
        excerpt: Some(format!("About {}", id)),
        feature_image: None,
        author: None,
        published_at: day(published),
        source_updated_at: day(updated),
    }
}

mod scheduler_properties {
    use super::*;

    const SITE: &str = "https://blog.example";

    #[tokio::test]
    async fn test_idempotent_dispatch() {
        let h = Harness::new();
        h.onboard("g", SITE, NotificationMode::NewAndUpdated).await;
        h.ghost.publish(SITE, post("a", 2, 2));

        let first = h.engine.run_cycle(None).await;
        assert_eq!(first.sent, 1);

        let second = h.engine.run_cycle(None).await;
        assert_eq!(second.tenants_checked, 1);
        assert_eq!(second.new_items, 0);
        assert_eq!(second.sent, 0);
        assert_eq!(h.discord.count(), 1);
    }

    #[tokio::test]
    async fn test_no_back_catalog_spam() {
        let h = Harness::new();
        for n in 1..=5 {
            h.ghost.publish(SITE, post(&format!("old{}", n), n, n));
        }

        let tenant_id = h.onboard("g", SITE, NotificationMode::NewAndUpdated).await;
        assert_eq!(h.engine.store().watermark_count(&tenant_id).unwrap(), 5);
        assert_eq!(h.discord.count(), 0);

        let report = h.engine.run_cycle(None).await;
        assert_eq!(report.sent, 0);

        h.ghost.publish(SITE, post("fresh", 10, 10));
        let report = h.engine.run_cycle(None).await;
        assert_eq!(report.sent, 1);
        assert_eq!(h.discord.titles(), vec!["Post fresh"]);
    }

    #[tokio::test]
    async fn test_mode_gating_new_only() {
        let h = Harness::new();
        let tenant_id = h.onboard("g", SITE, NotificationMode::NewOnly).await;
        h.ghost.publish(SITE, post("a", 2, 2));
        h.engine.run_cycle(None).await;

        h.ghost.publish(SITE, post("a", 2, 4));
        let report = h.engine.run_cycle(None).await;
        assert_eq!(report.updated_items, 0);
        assert_eq!(report.sent, 0);

        let mark = h
            .engine
            .store()
            .get_watermark(&ItemId::new("a"), &tenant_id)
            .unwrap()
            .unwrap();
        assert_eq!(mark.last_seen_updated_at, day(2));
    }

    #[tokio::test]
    async fn test_mode_gating_new_and_updated() {
        let h = Harness::new();
        let tenant_id = h.onboard("g", SITE, NotificationMode::NewAndUpdated).await;
        h.ghost.publish(SITE, post("a", 2, 2));
        h.engine.run_cycle(None).await;

        h.ghost.publish(SITE, post("a", 2, 4));
        let report = h.engine.run_cycle(None).await;
        assert_eq!(report.updated_items, 1);
        assert_eq!(report.sent, 1);

        let sent = h.discord.sent.lock().unwrap();
        let embed = &sent[1].1.embeds[0];
        assert_eq!(embed.title, "Post Updated: Post a");
        assert_eq!(embed.color, UPDATED_COLOR);
        assert_eq!(sent[0].1.embeds[0].color, NEW_COLOR);
        drop(sent);

        let mark = h
            .engine
            .store()
            .get_watermark(&ItemId::new("a"), &tenant_id)
            .unwrap()
            .unwrap();
        assert_eq!(mark.last_seen_updated_at, day(4));

        // Only one announcement per revision
        assert_eq!(h.engine.run_cycle(None).await.sent, 0);
    }

    #[tokio::test]
    async fn test_partial_failure_isolation() {
        let h = Harness::new();
        let down = "https://down.example";
        let a = h.onboard("a", down, NotificationMode::NewAndUpdated).await;
        let b = h.onboard("b", SITE, NotificationMode::NewAndUpdated).await;
        h.ghost.take_down(down);
        h.ghost.publish(SITE, post("x", 3, 3));

        let report = h.engine.run_cycle(None).await;
        assert_eq!(report.status(), "partial");
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].tenant_id, a);
        assert_eq!(report.failures[0].kind, ErrorKind::TransientSource);
        assert_eq!(report.sent, 1);
        assert!(h
            .engine
            .store()
            .get_watermark(&ItemId::new("x"), &b)
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_destination_failure_retried_next_cycle() {
        let h = Harness::new();
        let tenant_id = h.onboard("g", SITE, NotificationMode::NewAndUpdated).await;
        h.discord
            .forbidden
            .lock()
            .unwrap()
            .insert(ChannelId::new("g-news"));
        h.ghost.publish(SITE, post("a", 2, 2));

        let report = h.engine.run_cycle(None).await;
        assert_eq!(report.failed_sends, 1);
        assert!(h
            .engine
            .store()
            .get_watermark(&ItemId::new("a"), &tenant_id)
            .unwrap()
            .is_none());

        h.discord.forbidden.lock().unwrap().clear();
        let report = h.engine.run_cycle(None).await;
        assert_eq!(report.sent, 1);
    }

    #[tokio::test]
    async fn test_chronological_dispatch_order() {
        let h = Harness::new();
        h.onboard("g", SITE, NotificationMode::NewAndUpdated).await;
        h.ghost.publish(SITE, post("item3", 3, 3));
        h.ghost.publish(SITE, post("item1", 1, 1));
        h.ghost.publish(SITE, post("item2", 2, 2));

        h.engine.run_cycle(None).await;
        assert_eq!(
            h.discord.titles(),
            vec!["Post item1", "Post item2", "Post item3"]
        );
    }

    #[tokio::test]
    async fn test_concurrent_triggers_send_once() {
        let h = Harness::new();
        h.onboard("g", SITE, NotificationMode::NewAndUpdated).await;
        h.ghost.publish(SITE, post("a", 2, 2));
        h.ghost.publish(SITE, post("b", 3, 3));

        let tenant_id = TenantId::new("g");
        let (timer, manual) = tokio::join!(
            h.engine.run_scheduled_cycle(),
            h.engine.run_cycle(Some(&tenant_id))
        );

        assert_eq!(timer.sent + manual.sent, 2);
        assert_eq!(h.discord.count(), 2);
    }

    #[tokio::test]
    async fn test_mention_prefix() {
        let h = Harness::new();
        let tenant_id = h.onboard("g", SITE, NotificationMode::NewAndUpdated).await;
        h.admin
            .edit(&tenant_id, TenantEdit::Mention(Some(MentionId::new("42"))))
            .await
            .unwrap();
        h.ghost.publish(SITE, post("a", 2, 2));

        h.engine.run_cycle(None).await;
        let sent = h.discord.sent.lock().unwrap();
        assert_eq!(sent[0].1.content.as_deref(), Some("<@&42>"));
        assert_eq!(sent[0].1.allowed_mentions.roles, vec!["42".to_string()]);
    }

    #[tokio::test]
    async fn test_disable_then_reenable_does_not_replay() {
        let h = Harness::new();
        let tenant_id = h.onboard("g", SITE, NotificationMode::NewAndUpdated).await;

        h.admin
            .set_notifications(&tenant_id, NotificationSettings::default())
            .await
            .unwrap();
        h.ghost.publish(SITE, post("while-off", 5, 5));
        assert_eq!(h.engine.run_cycle(None).await.tenants_checked, 0);

        let summary = h
            .admin
            .set_notifications(
                &tenant_id,
                NotificationSettings {
                    enabled: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(summary.indexed, Some(1));
        assert_eq!(h.engine.run_cycle(None).await.sent, 0);
    }
}

mod persistence {
    use super::*;

    const SITE: &str = "https://blog.example";

    fn on_disk(dir: &TempDir) -> StoreConfig {
        StoreConfig::new(dir.path().join("herald.db"))
    }

    #[tokio::test]
    async fn test_crash_between_send_and_commit() {
        let dir = TempDir::new().unwrap();
        let h = Harness::with_store(TenantStore::open(&on_disk(&dir)).unwrap());
        let tenant_id = h.onboard("g", SITE, NotificationMode::NewAndUpdated).await;
        h.ghost.publish(SITE, post("a", 2, 2));
        h.ghost.publish(SITE, post("b", 3, 3));
        assert_eq!(h.engine.run_cycle(None).await.sent, 2);

        // The send for "b" happened but its commit never did
        let conn = rusqlite::Connection::open(dir.path().join("herald.db")).unwrap();
        conn.execute(
            "DELETE FROM watermarks WHERE item_id = 'b' AND tenant_id = 'g'",
            [],
        )
        .unwrap();
        drop(conn);

        let report = h.engine.run_cycle(None).await;
        assert_eq!(report.sent, 1);
        assert_eq!(
            h.discord.titles(),
            vec!["Post a", "Post b", "Post b"]
        );
        assert_eq!(h.engine.store().watermark_count(&tenant_id).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_restart_keeps_watermarks() {
        let dir = TempDir::new().unwrap();
        {
            let h = Harness::with_store(TenantStore::open(&on_disk(&dir)).unwrap());
            h.ghost.publish(SITE, post("p1", 1, 1));
            h.ghost.publish(SITE, post("p2", 2, 2));
            h.onboard("g", SITE, NotificationMode::NewAndUpdated).await;
        }

        let h = Harness::with_store(TenantStore::open(&on_disk(&dir)).unwrap());
        for n in 1..=3 {
            h.ghost.publish(SITE, post(&format!("p{}", n), n, n));
        }

        // A fresh process has no plaintext until it is provided again
        let report = h.engine.run_cycle(None).await;
        assert_eq!(report.tenants_checked, 0);
        assert_eq!(report.skipped.len(), 1);

        let tenant_id = TenantId::new("g");
        let tenant = h.engine.store().require_tenant(&tenant_id).unwrap();
        assert!(h.engine.credentials().admit(
            &tenant_id,
            Secret::new(KEY),
            tenant.source_credential.as_ref().unwrap()
        ));
        assert_eq!(h.engine.run_cycle(None).await.sent, 1);
        assert_eq!(h.discord.titles(), vec!["Post p3"]);
    }

    #[tokio::test]
    async fn test_removal_cascade_and_fresh_setup() {
        let h = Harness::new();
        for n in 1..=3 {
            h.ghost.publish(SITE, post(&format!("p{}", n), n, n));
        }
        let tenant_id = h.onboard("g", SITE, NotificationMode::NewAndUpdated).await;
        assert_eq!(h.engine.store().watermark_count(&tenant_id).unwrap(), 3);

        h.admin.remove(&tenant_id).unwrap();
        assert!(h.engine.store().get_tenant(&tenant_id).unwrap().is_none());
        assert_eq!(h.engine.store().watermark_count(&tenant_id).unwrap(), 0);

        // Re-setup without enabling starts from zero watermarks
        h.admin
            .setup(
                &tenant_id,
                TenantSetup {
                    source_endpoint: SITE.to_string(),
                    credential: Secret::new(KEY),
                    notifications_enabled: false,
                    destination_channel: None,
                    mention_target: None,
                    mode: NotificationMode::NewOnly,
                },
            )
            .await
            .unwrap();
        assert_eq!(h.engine.store().watermark_count(&tenant_id).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_legacy_database_keeps_announcement_history() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("herald.db");
        {
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.execute_batch(
                r#"
                CREATE TABLE guilds (id TEXT PRIMARY KEY, apiUrl TEXT, apiKey TEXT, channelId TEXT, pingRole TEXT, mode TEXT);
                CREATE TABLE published_posts (postId TEXT, guildId TEXT, publishedAt INTEGER, updatedAt INTEGER, PRIMARY KEY (postId, guildId));
                INSERT INTO guilds VALUES ('g', 'https://blog.example', 'content-api-key', 'g-news', NULL, 'default');
                "#,
            )
            .unwrap();
            let old = post("old", 1, 1);
            conn.execute(
                "INSERT INTO published_posts VALUES ('old', 'g', ?1, ?2)",
                rusqlite::params![
                    old.published_at.timestamp_millis(),
                    old.source_updated_at.timestamp_millis()
                ],
            )
            .unwrap();
        }

        let store = TenantStore::open(&StoreConfig::new(&path)).unwrap();
        assert_eq!(store.migration_report().credentials_upgraded, 1);
        let h = Harness::with_store(store);

        let tenant_id = TenantId::new("g");
        let tenant = h.engine.store().require_tenant(&tenant_id).unwrap();
        assert!(tenant.source_credential.as_ref().unwrap().is_current());
        assert!(h.engine.credentials().admit(
            &tenant_id,
            Secret::new(KEY),
            tenant.source_credential.as_ref().unwrap()
        ));

        h.ghost.publish(SITE, post("old", 1, 1));
        h.ghost.publish(SITE, post("new", 2, 2));
        let report = h.engine.run_cycle(None).await;
        assert_eq!(report.sent, 1);
        assert_eq!(h.discord.titles(), vec!["Post new"]);
    }
}
