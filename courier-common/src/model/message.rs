use core::fmt::{self, Display, Formatter};
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::{CallerIdentity, Channel, UserNotificationSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    SubscriptionUpdate,
    CommentNotification,
    KudosNotification,
    SystemAlert,
    PasswordReset,
    AccountSecurity,
    CollectionUpdate,
    SeriesUpdate,
    Invitation,
}

impl MessageType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SubscriptionUpdate => "subscription_update",
            Self::CommentNotification => "comment_notification",
            Self::KudosNotification => "kudos_notification",
            Self::SystemAlert => "system_alert",
            Self::PasswordReset => "password_reset",
            Self::AccountSecurity => "account_security",
            Self::CollectionUpdate => "collection_update",
            Self::SeriesUpdate => "series_update",
            Self::Invitation => "invitation",
        }
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Pending,
    Processing,
    Sent,
    PartiallyFailed,
    Failed,
}

impl MessageStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::PartiallyFailed | Self::Failed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    pub subject: String,
    pub plain_text: String,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub action_url: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
}

impl MessageContent {
    #[must_use]
    pub fn new(subject: impl Into<String>, plain_text: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            plain_text: plain_text.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    #[must_use]
    pub fn with_action_url(mut self, url: impl Into<String>) -> Self {
        self.action_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub user_id: String,
    /// Snapshot taken when the message was built.
    pub settings: UserNotificationSettings,
    /// Restricts delivery to these channels when set.
    #[serde(default)]
    pub channels: Option<Vec<Channel>>,
}

impl Recipient {
    #[must_use]
    pub fn new(settings: UserNotificationSettings) -> Self {
        Self {
            user_id: settings.user_id.clone(),
            settings,
            channels: None,
        }
    }

    #[must_use]
    pub fn with_channels(mut self, channels: Vec<Channel>) -> Self {
        self.channels = Some(channels);
        self
    }

    /// The channels a message of `kind` should be attempted on.
    ///
    /// An explicit override wins, then the per-type configuration, then every
    /// channel the user has configured. Duplicates are removed.
    #[must_use]
    pub fn candidate_channels(&self, kind: MessageType) -> Vec<Channel> {
        let mut channels = match (&self.channels, self.settings.message_types.get(&kind)) {
            (Some(channels), _) => channels.clone(),
            (None, Some(config)) if !config.channels.is_empty() => config.channels.clone(),
            _ => self.settings.channels.keys().copied().collect(),
        };

        let mut seen = Vec::with_capacity(channels.len());
        channels.retain(|channel| {
            if seen.contains(channel) {
                false
            } else {
                seen.push(*channel);
                true
            }
        });

        channels
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Ulid,
    pub kind: MessageType,
    pub content: MessageContent,
    pub recipients: Vec<Recipient>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub caller: CallerIdentity,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Message {
    #[must_use]
    pub fn new(kind: MessageType, content: MessageContent, recipients: Vec<Recipient>) -> Self {
        Self {
            id: Ulid::new(),
            kind,
            content,
            recipients,
            status: MessageStatus::Pending,
            caller: CallerIdentity::default(),
            created_at: Utc::now(),
            scheduled_at: None,
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_caller(mut self, caller: CallerIdentity) -> Self {
        self.caller = caller;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
