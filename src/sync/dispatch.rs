//! Send one classified item, then commit its watermark
//!
//! The watermark is written only after the destination accepted the message.
//! A crash in between can cause one duplicate on the next cycle; the reverse
//! order could lose a notification silently.

use super::reconcile::Classified;
use crate::notify::{render, Notifier};
use crate::store::{TenantConfig, TenantStore, Watermark};
use crate::{HeraldError, Result};
use std::time::Duration;

/// What happened to one item
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Sent and watermark committed
    Sent,
    /// Destination failed; nothing committed
    SendFailed(HeraldError),
    /// Nothing to send (unchanged item or no destination)
    Skipped,
}

/// Renders, sends and commits for one tenant at a time
pub struct Dispatcher<'a> {
    store: &'a TenantStore,
    notifier: &'a dyn Notifier,
    send_timeout: Duration,
}

impl<'a> Dispatcher<'a> {
    pub fn new(store: &'a TenantStore, notifier: &'a dyn Notifier, send_timeout: Duration) -> Self {
        Self {
            store,
            notifier,
            send_timeout,
        }
    }

    /// Dispatch one item
    ///
    /// Destination errors come back as [`DispatchOutcome::SendFailed`]; only a
    /// failed watermark commit is returned as `Err`.
    pub async fn dispatch(
        &self,
        tenant: &TenantConfig,
        classified: &Classified,
    ) -> Result<DispatchOutcome> {
        let Some(channel) = tenant.destination_channel.as_ref() else {
            return Ok(DispatchOutcome::Skipped);
        };
        let item = &classified.item;
        let Some(notification) = render(
            item,
            classified.classification,
            tenant.mention_target.as_ref(),
        ) else {
            return Ok(DispatchOutcome::Skipped);
        };

        let sent = tokio::time::timeout(self.send_timeout, self.notifier.send(channel, &notification))
            .await
            .unwrap_or_else(|_| Err(HeraldError::timeout("send notification", self.send_timeout)));

        if let Err(e) = sent {
            tracing::warn!(
                tenant_id = %tenant.id,
                item_id = %item.id,
                channel = %channel,
                classification = %classified.classification,
                error = %e,
                "Failed to send notification; will retry next cycle"
            );
            return Ok(DispatchOutcome::SendFailed(e));
        }

        self.store.upsert_watermark(&Watermark {
            item_id: item.id.clone(),
            tenant_id: tenant.id.clone(),
            published_at: item.published_at,
            last_seen_updated_at: item.source_updated_at,
        })?;

        tracing::info!(
            tenant_id = %tenant.id,
            item_id = %item.id,
            classification = %classified.classification,
            title = %item.title,
            "Sent notification"
        );

        Ok(DispatchOutcome::Sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Secret;
    use crate::sync::Classification;
    use crate::ids::{ChannelId, ItemId, TenantId};
    use crate::notify::Notification;
    use crate::source::ContentItem;
    use crate::store::{NotificationMode, TenantSetup};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        fail: bool,
        sent: Mutex<Vec<(ChannelId, Notification)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, channel: &ChannelId, notification: &Notification) -> Result<()> {
            if self.fail {
                return Err(HeraldError::PermissionDenied("no access".into()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((channel.clone(), notification.clone()));
            Ok(())
        }
    }

    struct SlowNotifier;

    #[async_trait]
    impl Notifier for SlowNotifier {
        async fn send(&self, _: &ChannelId, _: &Notification) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn store_with_tenant() -> (TenantStore, TenantConfig) {
        let store = TenantStore::open_in_memory().unwrap();
        let tenant = store
            .put_tenant(
                &TenantId::new("g"),
                &TenantSetup {
                    source_endpoint: "https://demo.ghost.io".to_string(),
                    credential: Secret::new("k"),
                    notifications_enabled: true,
                    destination_channel: Some(ChannelId::new("c")),
                    mention_target: None,
                    mode: NotificationMode::NewAndUpdated,
                },
            )
            .unwrap();
        (store, tenant)
    }

    fn classified(classification: Classification) -> Classified {
        Classified {
            item: ContentItem {
                id: ItemId::new("p1"),
                title: "Hello".to_string(),
                url: "https://demo.ghost.io/hello/".to_string(),
                excerpt: None,
                feature_image: None,
                author: None,
                published_at: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
                source_updated_at: Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap(),
            },
            classification,
        }
    }

    #[tokio::test]
    async fn test_commit_after_send() {
        let (store, tenant) = store_with_tenant();
        let notifier = RecordingNotifier::default();
        let dispatcher = Dispatcher::new(&store, &notifier, Duration::from_secs(1));

        let outcome = dispatcher
            .dispatch(&tenant, &classified(Classification::New))
            .await
            .unwrap();

        assert!(matches!(outcome, DispatchOutcome::Sent));
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
        let mark = store
            .get_watermark(&ItemId::new("p1"), &tenant.id)
            .unwrap()
            .unwrap();
        assert_eq!(
            mark.last_seen_updated_at,
            Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_send_failure_commits_nothing() {
        let (store, tenant) = store_with_tenant();
        let notifier = RecordingNotifier {
            fail: true,
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(&store, &notifier, Duration::from_secs(1));

        let outcome = dispatcher
            .dispatch(&tenant, &classified(Classification::New))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            DispatchOutcome::SendFailed(HeraldError::PermissionDenied(_))
        ));
        assert!(store
            .get_watermark(&ItemId::new("p1"), &tenant.id)
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout_is_failure() {
        let (store, tenant) = store_with_tenant();
        let dispatcher = Dispatcher::new(&store, &SlowNotifier, Duration::from_secs(10));

        let outcome = dispatcher
            .dispatch(&tenant, &classified(Classification::Updated))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            DispatchOutcome::SendFailed(HeraldError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_unchanged_is_skipped() {
        let (store, tenant) = store_with_tenant();
        let notifier = RecordingNotifier::default();
        let dispatcher = Dispatcher::new(&store, &notifier, Duration::from_secs(1));

        let outcome = dispatcher
            .dispatch(&tenant, &classified(Classification::Unchanged))
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Skipped));
        assert!(notifier.sent.lock().unwrap().is_empty());
    }
}
