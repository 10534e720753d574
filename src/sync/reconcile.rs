//! Classify a fetched page against stored watermarks
//!
//! Pure: looks watermarks up through a caller-supplied function and never
//! writes.

use crate::ids::ItemId;
use crate::source::ContentItem;
use crate::store::{NotificationMode, TenantConfig, Watermark};
use crate::Result;
use serde::Serialize;
use std::fmt;

/// Verdict for one item relative to a tenant's watermark
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Never announced to this tenant
    New,
    /// Announced, and the source has modified it since
    Updated,
    Unchanged,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::New => "new",
            Classification::Updated => "updated",
            Classification::Unchanged => "unchanged",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An item that needs announcing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub item: ContentItem,
    pub classification: Classification,
}

/// Outcome of reconciling one tenant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// Tenant cannot be reconciled; carries the reason
    Skipped(String),
    /// Items to dispatch, oldest first; unchanged items are already dropped
    Ready(Vec<Classified>),
}

/// Classify a single item
pub fn classify(
    mode: NotificationMode,
    item: &ContentItem,
    watermark: Option<&Watermark>,
) -> Classification {
    match watermark {
        None => Classification::New,
        Some(mark)
            if mode == NotificationMode::NewAndUpdated
                && item.source_updated_at > mark.last_seen_updated_at =>
        {
            Classification::Updated
        }
        Some(_) => Classification::Unchanged,
    }
}

/// Reconcile a most-recent-first page for one tenant
///
/// `watermark_for` is only ever asked about items of `tenant`. Its errors
/// propagate; everything else is reported through the return value.
pub fn reconcile<F>(
    tenant: &TenantConfig,
    fetched: Vec<ContentItem>,
    mut watermark_for: F,
) -> Result<Reconciliation>
where
    F: FnMut(&ItemId) -> Result<Option<Watermark>>,
{
    if let Some(missing) = tenant.missing_source_field() {
        return Ok(Reconciliation::Skipped(format!("{} is not set", missing)));
    }

    let mut ready = Vec::new();
    for item in fetched.into_iter().rev() {
        let watermark = watermark_for(&item.id)?;
        let classification = classify(tenant.mode, &item, watermark.as_ref());

        tracing::trace!(
            tenant_id = %tenant.id,
            item_id = %item.id,
            classification = %classification,
            "Classified item"
        );

        if classification != Classification::Unchanged {
            ready.push(Classified {
                item,
                classification,
            });
        }
    }

    Ok(Reconciliation::Ready(ready))
}
