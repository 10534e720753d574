//! Ghost Content API client
//!
//! Read-only client for the Ghost Content API (v5). Every call carries the
//! content key as the `key` query parameter; errors never echo the request URL
//! so the key stays out of logs.

use super::retry::{with_retry, RetryConfig};
use super::{normalize_endpoint, Author, ContentItem, ContentSource, SourceStatus, Tag};
use crate::credentials::Secret;
use crate::ids::ItemId;
use crate::{HeraldError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::debug;

/// Per-request timeout; the scheduler's own deadline wraps the retries
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const API_VERSION: &str = "v5.0";

/// Discovery lookups return at most this many posts
const DISCOVERY_LIMIT: usize = 10;

/// Ghost Content API client
#[derive(Clone)]
pub struct GhostClient {
    client: Client,
    retry: RetryConfig,
}

#[derive(Debug, Deserialize)]
struct PostsEnvelope {
    #[serde(default)]
    posts: Vec<GhostPost>,
}

#[derive(Debug, Deserialize)]
struct GhostPost {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    excerpt: Option<String>,
    #[serde(default)]
    custom_excerpt: Option<String>,
    #[serde(default)]
    feature_image: Option<String>,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    primary_author: Option<GhostAuthor>,
    #[serde(default)]
    authors: Vec<GhostAuthor>,
}

#[derive(Debug, Clone, Deserialize)]
struct GhostAuthor {
    name: String,
    #[serde(default)]
    profile_image: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsEnvelope {
    #[serde(default)]
    tags: Vec<GhostTag>,
}

#[derive(Debug, Deserialize)]
struct GhostTag {
    name: String,
    slug: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    count: Option<GhostTagCount>,
}

#[derive(Debug, Deserialize)]
struct GhostTagCount {
    #[serde(default)]
    posts: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SettingsEnvelope {
    settings: GhostSettings,
}

#[derive(Debug, Deserialize)]
struct GhostSettings {
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    errors: Vec<GhostErrorBody>,
}

#[derive(Debug, Deserialize)]
struct GhostErrorBody {
    message: String,
}

impl GhostPost {
    /// Posts without a publication date are not announceable
    fn into_item(self) -> Option<ContentItem> {
        let published_at = self.published_at?;
        let author = self
            .primary_author
            .or_else(|| self.authors.into_iter().next())
            .map(|a| Author {
                name: a.name,
                avatar_url: a.profile_image,
                profile_url: a.url,
            });
        let excerpt = self
            .custom_excerpt
            .filter(|e| !e.trim().is_empty())
            .or(self.excerpt.filter(|e| !e.trim().is_empty()));

        Some(ContentItem {
            id: ItemId::new(self.id),
            title: self.title.unwrap_or_else(|| "Untitled".to_string()),
            url: self.url.unwrap_or_default(),
            excerpt,
            feature_image: self.feature_image,
            author,
            published_at,
            source_updated_at: self.updated_at.unwrap_or(published_at),
        })
    }
}

impl GhostClient {
    /// Create a client with the default retry policy
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers({
                let mut headers = header::HeaderMap::new();
                headers.insert(
                    header::USER_AGENT,
                    header::HeaderValue::from_static(concat!("herald/", env!("CARGO_PKG_VERSION"))),
                );
                headers.insert(
                    "Accept-Version",
                    header::HeaderValue::from_static(API_VERSION),
                );
                headers
            })
            .build()?;

        Ok(Self {
            client,
            retry: RetryConfig::for_source(),
        })
    }

    /// Replace the retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn resource_url(endpoint: &str, resource: &str) -> Result<String> {
        let base = normalize_endpoint(endpoint)?;
        Ok(format!("{}/ghost/api/content/{}/", base, resource))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        credential: &Secret,
        resource: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let url = Self::resource_url(endpoint, resource)?;
        let url = url.as_str();

        with_retry(&self.retry, resource, move || {
            self.get_once(url, credential, params)
        })
        .await
    }

    async fn get_once<T: DeserializeOwned>(
        &self,
        url: &str,
        credential: &Secret,
        params: &[(&str, String)],
    ) -> Result<T> {
        let response = self
            .client
            .get(url)
            .query(&[("key", credential.expose())])
            .query(params)
            .send()
            .await
            .map_err(|e| HeraldError::Source(format!("request failed: {}", e.without_url())))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| HeraldError::Source(format!("reading response failed: {}", e.without_url())))?;

        match status {
            StatusCode::OK => serde_json::from_str(&body)
                .map_err(|e| HeraldError::Source(format!("malformed response: {}", e))),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(HeraldError::InvalidCredential(error_message(status, &body)))
            }
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                Err(HeraldError::Source(error_message(status, &body)))
            }
            _ => Err(HeraldError::Validation(format!(
                "content source rejected the request: {}",
                error_message(status, &body)
            ))),
        }
    }

    async fn browse_posts(
        &self,
        endpoint: &str,
        credential: &Secret,
        params: &[(&str, String)],
    ) -> Result<Vec<ContentItem>> {
        let envelope: PostsEnvelope = self.get(endpoint, credential, "posts", params).await?;
        let total = envelope.posts.len();
        let items: Vec<ContentItem> = envelope
            .posts
            .into_iter()
            .filter_map(GhostPost::into_item)
            .collect();

        if items.len() < total {
            debug!(
                dropped = total - items.len(),
                "Ignored posts without a publication date"
            );
        }
        Ok(items)
    }
}

fn error_message(status: StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|e| e.errors.into_iter().next())
        .map(|e| e.message);

    match detail {
        Some(message) => format!("HTTP {}: {}", status, message),
        None => format!("HTTP {}", status),
    }
}

/// Escape single quotes for an NQL string literal
fn escape_filter_value(value: &str) -> String {
    value.replace('\'', "\\'")
}

#[async_trait]
impl ContentSource for GhostClient {
    async fn fetch_recent(
        &self,
        endpoint: &str,
        credential: &Secret,
        limit: usize,
    ) -> Result<Vec<ContentItem>> {
        let params = [
            ("limit", limit.to_string()),
            ("order", "published_at desc".to_string()),
            ("include", "authors,tags".to_string()),
        ];
        self.browse_posts(endpoint, credential, &params).await
    }

    async fn search(
        &self,
        endpoint: &str,
        credential: &Secret,
        query: &str,
    ) -> Result<Vec<ContentItem>> {
        let params = [
            ("limit", DISCOVERY_LIMIT.to_string()),
            ("filter", format!("title:~'{}'", escape_filter_value(query))),
            ("include", "authors".to_string()),
        ];
        self.browse_posts(endpoint, credential, &params).await
    }

    async fn by_tag(
        &self,
        endpoint: &str,
        credential: &Secret,
        tag_slug: &str,
    ) -> Result<Vec<ContentItem>> {
        let params = [
            ("limit", DISCOVERY_LIMIT.to_string()),
            ("filter", format!("tag:{}", tag_slug.trim())),
            ("include", "authors,tags".to_string()),
        ];
        self.browse_posts(endpoint, credential, &params).await
    }

    async fn list_tags(&self, endpoint: &str, credential: &Secret) -> Result<Vec<Tag>> {
        let params = [
            ("limit", "all".to_string()),
            ("include", "count.posts".to_string()),
        ];
        let envelope: TagsEnvelope = self.get(endpoint, credential, "tags", &params).await?;

        Ok(envelope
            .tags
            .into_iter()
            .map(|t| Tag {
                name: t.name,
                slug: t.slug,
                description: t.description,
                post_count: t.count.and_then(|c| c.posts),
            })
            .collect())
    }

    async fn ping(&self, endpoint: &str, credential: &Secret) -> Result<SourceStatus> {
        let started = Instant::now();
        let envelope: SettingsEnvelope = self.get(endpoint, credential, "settings", &[]).await?;

        Ok(SourceStatus {
            latency: started.elapsed(),
            site_title: envelope.settings.title,
        })
    }
}
