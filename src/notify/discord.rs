//! Discord REST notifier
//!
//! Posts messages with `POST /channels/{channel}/messages` using a bot token.

use super::throttle::SendThrottle;
use super::{Notification, Notifier};
use crate::credentials::Secret;
use crate::ids::ChannelId;
use crate::source::retry::{with_retry, RetryConfig};
use crate::{HeraldError, Result};
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// Connection settings for the Discord API
#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub api_base: String,
    pub token: Secret,
    /// Minimum spacing between two sends to one channel
    pub min_send_interval: Duration,
    pub request_timeout: Duration,
}

impl DiscordConfig {
    pub fn new(token: Secret) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            token,
            min_send_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Discord channel notifier
pub struct DiscordNotifier {
    client: Client,
    api_base: String,
    token: Secret,
    throttle: SendThrottle,
    retry: RetryConfig,
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    #[serde(default)]
    retry_after: Option<f64>,
    #[serde(default)]
    global: bool,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: Option<String>,
}

impl DiscordNotifier {
    pub fn new(config: DiscordConfig) -> Result<Self> {
        if config.token.is_blank() {
            return Err(HeraldError::Config("Discord bot token is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(config.request_timeout)
            .default_headers({
                let mut headers = header::HeaderMap::new();
                headers.insert(
                    header::USER_AGENT,
                    header::HeaderValue::from_static(concat!(
                        "DiscordBot (https://github.com/herald-bot/herald, ",
                        env!("CARGO_PKG_VERSION"),
                        ")"
                    )),
                );
                headers
            })
            .build()?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: config.token,
            throttle: SendThrottle::new(config.min_send_interval),
            retry: RetryConfig::for_destination(),
        })
    }

    /// Replace the retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn post_once(&self, url: &str, channel: &ChannelId, notification: &Notification) -> Result<()> {
        let response = self
            .client
            .post(url)
            .header(header::AUTHORIZATION, format!("Bot {}", self.token.expose()))
            .json(notification)
            .send()
            .await
            .map_err(|e| HeraldError::Destination(format!("send to {} failed: {}", channel, e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let header_retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<f64>().ok());
        let body = response.text().await.unwrap_or_default();

        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                let parsed = serde_json::from_str::<RateLimitBody>(&body).ok();
                let secs = parsed
                    .as_ref()
                    .and_then(|b| b.retry_after)
                    .or(header_retry_after)
                    .unwrap_or(1.0);
                debug!(
                    channel = %channel,
                    retry_after_secs = secs,
                    global = parsed.map(|b| b.global).unwrap_or(false),
                    "Rate limited by destination"
                );
                Err(HeraldError::RateLimited {
                    retry_after: retry_after_duration(secs),
                })
            }
            StatusCode::UNAUTHORIZED => Err(HeraldError::PermissionDenied(
                "bot token was rejected".to_string(),
            )),
            StatusCode::FORBIDDEN => Err(HeraldError::PermissionDenied(format!(
                "cannot post in channel {}: {}",
                channel,
                api_message(&body)
            ))),
            StatusCode::NOT_FOUND => Err(HeraldError::Validation(format!(
                "destination channel {} does not exist",
                channel
            ))),
            s => Err(HeraldError::Destination(format!(
                "HTTP {} from channel {}: {}",
                s,
                channel,
                api_message(&body)
            ))),
        }
    }
}

/// Out-of-range or non-finite values saturate instead of panicking
fn retry_after_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

fn api_message(body: &str) -> String {
    serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or_else(|| "no details".to_string())
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn send(&self, channel: &ChannelId, notification: &Notification) -> Result<()> {
        let url = format!("{}/channels/{}/messages", self.api_base, channel);
        let url = url.as_str();

        with_retry(&self.retry, "send notification", move || async move {
            self.throttle.acquire(channel).await;
            self.post_once(url, channel, notification).await
        })
        .await
    }
}
