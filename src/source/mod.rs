//! Content source boundary
//!
//! The scheduler only sees the [`ContentSource`] trait: a bounded,
//! most-recent-first page of [`ContentItem`]s per tenant, plus the discovery
//! lookups the admin commands use. [`GhostClient`] is the production
//! implementation against the Ghost Content API.

mod ghost;
pub mod retry;

pub use ghost::GhostClient;
pub use retry::{with_retry, RetryConfig, RetryDecision, RetryableError};

use crate::credentials::Secret;
use crate::ids::ItemId;
use crate::{HeraldError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Attribution for a content item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub avatar_url: Option<String>,
    pub profile_url: Option<String>,
}

/// One published item from a content source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: ItemId,
    pub title: String,
    pub url: String,
    pub excerpt: Option<String>,
    pub feature_image: Option<String>,
    pub author: Option<Author>,
    pub published_at: DateTime<Utc>,
    /// Last modification time reported by the source
    pub source_updated_at: DateTime<Utc>,
}

/// A content tag, for discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub post_count: Option<u64>,
}

/// Result of a connection check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStatus {
    pub latency: Duration,
    pub site_title: Option<String>,
}

/// A content source the scheduler can poll
///
/// Implementations must keep "unreachable" (`Source`), "credential rejected"
/// (`InvalidCredential`) and "nothing published" (`Ok(vec![])`) apart.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Most recent items, newest first, at most `limit`
    async fn fetch_recent(
        &self,
        endpoint: &str,
        credential: &Secret,
        limit: usize,
    ) -> Result<Vec<ContentItem>>;

    /// Items whose title matches `query`
    async fn search(&self, endpoint: &str, credential: &Secret, query: &str)
        -> Result<Vec<ContentItem>>;

    /// Recent items carrying a tag
    async fn by_tag(
        &self,
        endpoint: &str,
        credential: &Secret,
        tag_slug: &str,
    ) -> Result<Vec<ContentItem>>;

    /// Every tag the source knows
    async fn list_tags(&self, endpoint: &str, credential: &Secret) -> Result<Vec<Tag>>;

    /// Lightweight authenticated round trip
    async fn ping(&self, endpoint: &str, credential: &Secret) -> Result<SourceStatus>;
}

/// Normalize a content source base URL
///
/// Accepts only absolute http(s) URLs with a host; strips trailing slashes.
pub fn normalize_endpoint(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed)
        .map_err(|e| HeraldError::Validation(format!("Invalid source URL '{}': {}", trimmed, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(HeraldError::Validation(format!(
            "Source URL must use http or https, got '{}'",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(HeraldError::Validation(format!(
            "Source URL '{}' has no host",
            trimmed
        )));
    }

    Ok(trimmed.trim_end_matches('/').to_string())
}
