//! Type-safe ID wrappers for tenants, content items and destinations
//!
//! Every identifier that crosses a collaborator boundary is opaque to Herald;
//! the wrappers only prevent mixing a channel id up with a tenant id.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new id from a string
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the underlying string
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::new(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }
    };
}

opaque_id!(
    /// A tenant (one onboarded chat community, e.g. a Discord guild)
    TenantId
);

opaque_id!(
    /// A content item as identified by the content source (e.g. a Ghost post id)
    ItemId
);

opaque_id!(
    /// A destination channel inside the chat platform
    ChannelId
);

opaque_id!(
    /// A mention target (e.g. a Discord role) prefixed to notifications
    MentionId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display_and_conversion() {
        let tenant = TenantId::from("123456789");
        assert_eq!(tenant.as_str(), "123456789");
        assert_eq!(tenant.to_string(), "123456789");

        let item: ItemId = String::from("post-1").into();
        assert_eq!(item, ItemId::new("post-1"));
    }

    #[test]
    fn test_id_serializes_transparently() {
        let channel = ChannelId::new("42");
        assert_eq!(serde_json::to_string(&channel).unwrap(), "\"42\"");
    }
}
