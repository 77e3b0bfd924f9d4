use core::fmt::{self, Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A delivery medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Push,
    Sms,
    Webhook,
    InApp,
}

impl Channel {
    pub const ALL: [Self; 5] = [Self::Email, Self::Push, Self::Sms, Self::Webhook, Self::InApp];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Push => "push",
            Self::Sms => "sms",
            Self::Webhook => "webhook",
            Self::InApp => "in_app",
        }
    }

    /// Channels that can carry a digest.
    #[must_use]
    pub const fn supports_digest(self) -> bool {
        matches!(self, Self::Email | Self::InApp)
    }

    /// Channels that deliver to an external address, which must be verified
    /// before use. In-app delivery targets the account itself.
    #[must_use]
    pub const fn requires_verification(self) -> bool {
        !matches!(self, Self::InApp)
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-user configuration of a single channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub enabled: bool,
    /// Destination address (email address, phone number, device token...).
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub verified_at: Option<DateTime<Utc>>,
}

impl ChannelConfig {
    #[must_use]
    pub fn enabled(address: impl Into<String>) -> Self {
        Self {
            enabled: true,
            address: Some(address.into()),
            verified_at: Some(Utc::now()),
        }
    }

    #[must_use]
    pub const fn is_verified(&self) -> bool {
        self.verified_at.is_some()
    }

    /// Enabled, and verified where `channel` needs it.
    #[must_use]
    pub const fn is_usable(&self, channel: Channel) -> bool {
        self.enabled && (self.is_verified() || !channel.requires_verification())
    }
}
