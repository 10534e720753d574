//! Destination boundary
//!
//! [`render`] turns a classified content item into a chat message with a
//! single rich embed; a [`Notifier`] delivers it to a channel.

mod discord;
mod throttle;

pub use discord::{DiscordConfig, DiscordNotifier, DEFAULT_API_BASE};
pub use throttle::SendThrottle;

use crate::ids::{ChannelId, MentionId};
use crate::source::ContentItem;
use crate::sync::Classification;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Embed color for newly published items
pub const NEW_COLOR: u32 = 0x00FF00;

/// Embed color for updated items
pub const UPDATED_COLOR: u32 = 0xFFFF00;

const MAX_TITLE_CHARS: usize = 256;
const MAX_DESCRIPTION_CHARS: usize = 4096;

/// A rendered chat message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    /// Mention prefix, if the tenant has a mention target
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub embeds: Vec<Embed>,
    pub allowed_mentions: AllowedMentions,
}

/// Restricts which mentions in `content` actually ping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AllowedMentions {
    pub parse: Vec<String>,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embed {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub color: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<EmbedImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<EmbedAuthor>,
    pub footer: EmbedFooter,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedImage {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedAuthor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

/// Delivers rendered notifications to a destination channel
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, channel: &ChannelId, notification: &Notification) -> Result<()>;
}

/// Render the message for one classified item
///
/// Returns `None` for [`Classification::Unchanged`].
pub fn render(
    item: &ContentItem,
    classification: Classification,
    mention: Option<&MentionId>,
) -> Option<Notification> {
    let (title, color, footer, timestamp) = match classification {
        Classification::New => (
            item.title.clone(),
            NEW_COLOR,
            format!("Published on {}", format_date(item.published_at)),
            item.published_at,
        ),
        Classification::Updated => (
            format!("Post Updated: {}", item.title),
            UPDATED_COLOR,
            format!("Updated on {}", format_date(item.source_updated_at)),
            item.source_updated_at,
        ),
        Classification::Unchanged => return None,
    };

    let embed = Embed {
        title: truncate(&title, MAX_TITLE_CHARS),
        url: Some(item.url.clone()).filter(|u| !u.is_empty()),
        description: item
            .excerpt
            .as_deref()
            .map(|e| truncate(e, MAX_DESCRIPTION_CHARS)),
        color,
        image: item
            .feature_image
            .clone()
            .map(|url| EmbedImage { url }),
        author: item.author.as_ref().map(|a| EmbedAuthor {
            name: a.name.clone(),
            icon_url: a.avatar_url.clone(),
            url: a.profile_url.clone(),
        }),
        footer: EmbedFooter { text: footer },
        timestamp,
    };

    let (content, allowed_mentions) = match mention {
        Some(role) => (
            Some(format!("<@&{}>", role)),
            AllowedMentions {
                parse: Vec::new(),
                roles: vec![role.to_string()],
            },
        ),
        None => (None, AllowedMentions::default()),
    };

    Some(Notification {
        content,
        embeds: vec![embed],
        allowed_mentions,
    })
}

/// `March 1, 2024`
fn format_date(at: DateTime<Utc>) -> String {
    at.format("%B %-d, %Y").to_string()
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars - 1).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ItemId;
    use crate::source::Author;
    use chrono::TimeZone;

    fn item() -> ContentItem {
        ContentItem {
            id: ItemId::new("p1"),
            title: "Hello World".to_string(),
            url: "https://demo.ghost.io/hello/".to_string(),
            excerpt: Some("An excerpt".to_string()),
            feature_image: Some("https://demo.ghost.io/img.png".to_string()),
            author: Some(Author {
                name: "Ada".to_string(),
                avatar_url: None,
                profile_url: Some("https://demo.ghost.io/author/ada/".to_string()),
            }),
            published_at: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
            source_updated_at: Utc.with_ymd_and_hms(2024, 3, 12, 9, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_render_new() {
        let n = render(&item(), Classification::New, None).unwrap();
        let embed = &n.embeds[0];

        assert_eq!(embed.title, "Hello World");
        assert_eq!(embed.color, NEW_COLOR);
        assert_eq!(embed.footer.text, "Published on March 1, 2024");
        assert_eq!(embed.author.as_ref().unwrap().name, "Ada");
        assert!(n.content.is_none());
        assert!(n.allowed_mentions.roles.is_empty());
    }

    #[test]
    fn test_render_updated_with_mention() {
        let role = MentionId::new("987");
        let n = render(&item(), Classification::Updated, Some(&role)).unwrap();
        let embed = &n.embeds[0];

        assert_eq!(embed.title, "Post Updated: Hello World");
        assert_eq!(embed.color, UPDATED_COLOR);
        assert_eq!(embed.footer.text, "Updated on March 12, 2024");
        assert_eq!(n.content.as_deref(), Some("<@&987>"));
        assert_eq!(n.allowed_mentions.roles, vec!["987".to_string()]);
        assert!(n.allowed_mentions.parse.is_empty());
    }

    #[test]
    fn test_render_unchanged_is_none() {
        assert!(render(&item(), Classification::Unchanged, None).is_none());
    }

    #[test]
    fn test_serialized_shape() {
        let mut it = item();
        it.feature_image = None;
        let n = render(&it, Classification::New, None).unwrap();
        let value = serde_json::to_value(&n).unwrap();

        assert!(value.get("content").is_none());
        assert!(value["embeds"][0].get("image").is_none());
        assert_eq!(value["embeds"][0]["color"], 0x00FF00);
        assert_eq!(value["allowed_mentions"]["parse"], serde_json::json!([]));
    }

    #[test]
    fn test_long_title_truncated() {
        let mut it = item();
        it.title = "x".repeat(400);
        let n = render(&it, Classification::New, None).unwrap();
        assert_eq!(n.embeds[0].title.chars().count(), MAX_TITLE_CHARS);
    }
}
